//! Wires a [`Job`] into the standalone engine.
//!
//! Planning resolves the two input specs, reads every partition's shape
//! from its name and derives the shape of the whole product from them.
//! Partitions that cannot take part are failed here, before any map runs.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use log::{debug, info, warn};

use super::engine::{perform_map, perform_reduce, GroupByKey, JobReport, SortShuffle};
use super::Job;
use crate::error::MatrixError;
use crate::utils::resolve_inputs;
use crate::workload;
use crate::workload::matrix_mult::{MatMulArgs, Mode, Shape};
use crate::workload::record::{parse_partition, OperandTag, PartitionMeta};

/// What the driver decided before running the job.
#[derive(Debug)]
pub struct JobPlan {
    pub shape: Shape,
    /// Partitions that will be mapped, sorted by path.
    pub partitions: Vec<PathBuf>,
    /// Partitions failed during planning.
    pub rejected: Vec<(PathBuf, MatrixError)>,
    /// Operands given to partitions by the spec they were listed under.
    pub assignments: Vec<(String, OperandTag)>,
}

#[derive(Default)]
struct Listing {
    left: bool,
    right: bool,
}

/// Picks the shape declared by the first of `metas` and fails every
/// partition that disagrees with it. Accepted partitions go to `accepted`.
fn settle_shape(
    what: &str,
    metas: &[(PathBuf, PartitionMeta)],
    accepted: &mut Vec<PathBuf>,
    rejected: &mut Vec<(PathBuf, MatrixError)>,
) -> Option<(usize, usize)> {
    let (_, first) = metas.first()?;
    let shape = (first.rows, first.cols);
    for (path, meta) in metas {
        if (meta.rows, meta.cols) == shape {
            accepted.push(path.clone());
        } else {
            rejected.push((
                path.clone(),
                MatrixError::dimension(
                    &meta.name,
                    format!(
                        "{what} declared {}x{} but {} declares {}x{}",
                        meta.rows, meta.cols, first.name, shape.0, shape.1
                    ),
                ),
            ));
        }
    }
    Some(shape)
}

/// Contraction dimension seen in tagged partitions: one past the largest
/// index a record joins on.
///
/// Only used when no single-operand partition declares it. Partitions that
/// cannot be read are left for the map phase to fail.
fn contraction_extent(tagged: &[(PathBuf, PartitionMeta)]) -> usize {
    let mut extent = 1;
    for (path, meta) in tagged {
        let Ok(content) = fs::read_to_string(path) else {
            continue;
        };
        let Ok(parsed) = parse_partition(meta, &content) else {
            continue;
        };
        for cell in parsed.cells {
            let index = match cell.tag {
                OperandTag::Left => cell.col,
                OperandTag::Right => cell.row,
            };
            extent = extent.max(index + 1);
        }
    }
    debug!("contraction dimension {extent} read from tagged partitions");
    extent
}

/// Resolves the inputs of `job` and derives the product shape.
///
/// A partition's operand comes from its name prefix, or from the input spec
/// it was listed under when the prefix is not a known one. A partition with
/// an unknown prefix listed under both specs holds tagged records of both
/// operands and declares the result's shape in its name. Errors returned
/// here fail the whole job: no usable partitions for one side, or operand
/// shapes that cannot be multiplied.
pub fn plan(job: &Job) -> Result<JobPlan> {
    let mut listed: BTreeMap<PathBuf, Listing> = BTreeMap::new();
    for path in resolve_inputs(&job.left)? {
        listed.entry(path).or_default().left = true;
    }
    for path in resolve_inputs(&job.right)? {
        listed.entry(path).or_default().right = true;
    }

    let mut rejected = Vec::new();
    let mut assignments = Vec::new();
    let mut lefts = Vec::new();
    let mut rights = Vec::new();
    let mut tagged = Vec::new();
    for (path, listing) in listed {
        let meta = match PartitionMeta::from_path(&path.to_string_lossy()) {
            Ok(meta) => meta,
            Err(err) => {
                rejected.push((path, err));
                continue;
            }
        };
        match (meta.role, listing.left, listing.right) {
            (Some(OperandTag::Left), _, _) => lefts.push((path, meta)),
            (Some(OperandTag::Right), _, _) => rights.push((path, meta)),
            (None, true, false) => {
                assignments.push((meta.name.clone(), OperandTag::Left));
                lefts.push((path, meta));
            }
            (None, false, true) => {
                assignments.push((meta.name.clone(), OperandTag::Right));
                rights.push((path, meta));
            }
            (None, _, _) => tagged.push((path, meta)),
        }
    }

    let mut partitions = Vec::new();
    let left = settle_shape("A operand", &lefts, &mut partitions, &mut rejected);
    let right = settle_shape("B operand", &rights, &mut partitions, &mut rejected);
    if let (Some((rows, inner)), Some((right_rows, cols))) = (left, right) {
        if inner != right_rows {
            bail!("cannot multiply {rows}x{inner} by {right_rows}x{cols}: inner dimensions differ");
        }
    }

    let declared = tagged.first().map(|(_, meta)| (meta.rows, meta.cols));
    let rows = left.or(declared).map(|(rows, _)| rows);
    let cols = right.map(|(_, cols)| cols).or(declared.map(|(_, cols)| cols));
    let (Some(rows), Some(cols)) = (rows, cols) else {
        let side = if rows.is_none() {
            OperandTag::Left
        } else {
            OperandTag::Right
        };
        bail!("no usable {side} operand partitions");
    };
    if job.mode == Mode::MatrixVector && cols != 1 {
        bail!("matrix-vector mode needs a single-column right operand, got {cols} columns");
    }

    let (tagged, mismatched): (Vec<_>, Vec<_>) = tagged
        .into_iter()
        .partition(|(_, meta)| (meta.rows, meta.cols) == (rows, cols));
    for (path, meta) in mismatched {
        let err = MatrixError::dimension(
            &meta.name,
            format!(
                "tagged partition declared {}x{} but the result is {rows}x{cols}",
                meta.rows, meta.cols
            ),
        );
        rejected.push((path, err));
    }
    let inner = match (left, right) {
        (Some((_, inner)), _) | (None, Some((inner, _))) => inner,
        (None, None) => contraction_extent(&tagged),
    };

    partitions.extend(tagged.into_iter().map(|(path, _)| path));
    partitions.sort();
    Ok(JobPlan {
        shape: Shape { rows, inner, cols },
        partitions,
        rejected,
        assignments,
    })
}

/// Removes `mr-out-*` files a previous run left in `dir`.
fn clear_previous_output(dir: &Path) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    for path in resolve_inputs(&format!("{}/mr-out-*", dir.display()))? {
        fs::remove_file(&path).with_context(|| format!("removing {}", path.display()))?;
    }
    Ok(())
}

/// Runs `job` with the given shuffle.
pub fn run_job_with(job: &Job, shuffle: &dyn GroupByKey) -> Result<JobReport> {
    let plan = plan(job)?;
    for (path, err) in &plan.rejected {
        warn!("partition {} failed: {err}", path.display());
    }
    info!(
        "{} product {} over {} partitions, {} reducers",
        job.mode.workload_name(),
        plan.shape,
        plan.partitions.len(),
        job.reducers
    );

    let engine = workload::named(job.mode.workload_name())?;
    let mut args = MatMulArgs::new(plan.shape, job.strict);
    for (name, side) in &plan.assignments {
        args.assign(name.as_str(), *side);
    }
    let serialized_args = args.to_aux()?;
    let output_dir = Path::new(&job.output);
    clear_previous_output(output_dir)?;

    /*  The map logic carries out mapping and also bucketing; the shuffle
     *  groups each bucket right before it is reduced.
     */
    let mapped = perform_map(&plan.partitions, &engine, &serialized_args, job.reducers);
    let reduced = perform_reduce(output_dir, &engine, &serialized_args, mapped.buckets, shuffle)?;

    let mut failed_partitions: Vec<String> = plan
        .rejected
        .iter()
        .map(|(path, _)| path.display().to_string())
        .chain(mapped.failed.into_iter().map(|(name, _)| name))
        .collect();
    failed_partitions.sort();

    let report = JobReport {
        partitions: plan.partitions.len() + plan.rejected.len(),
        failed_partitions,
        records_emitted: mapped.records_emitted,
        keys_reduced: reduced.keys_reduced,
        keys_skipped: reduced.keys_skipped,
        cells_written: reduced.cells_written,
    };
    info!(
        "job {}: {} cells written, {} of {} partitions failed, {} keys skipped",
        if report.succeeded() { "succeeded" } else { "failed" },
        report.cells_written,
        report.failed_partitions.len(),
        report.partitions,
        report.keys_skipped
    );
    Ok(report)
}

/// Runs `job` with the default sort-based shuffle.
pub fn run_job(job: &Job) -> Result<JobReport> {
    run_job_with(job, &SortShuffle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(dir: &Path, left: &str, right: &str, mode: Mode) -> Job {
        Job {
            left: format!("{}/{left}", dir.display()),
            right: format!("{}/{right}", dir.display()),
            output: format!("{}/out", dir.display()),
            mode,
            reducers: 2,
            strict: false,
        }
    }

    fn touch(dir: &Path, name: &str) {
        fs::write(dir.join(name), "").unwrap();
    }

    #[test]
    fn shape_comes_from_partition_names() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "A_2_3.txt");
        touch(dir.path(), "B_3_4.txt");
        let plan = plan(&job(dir.path(), "A_*", "B_*", Mode::MatrixMatrix)).unwrap();
        assert_eq!(
            plan.shape,
            Shape {
                rows: 2,
                inner: 3,
                cols: 4
            }
        );
        assert_eq!(plan.partitions.len(), 2);
        assert!(plan.rejected.is_empty());
    }

    #[test]
    fn same_spec_for_both_sides_uses_prefixes() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "A_2_2.txt");
        touch(dir.path(), "B_2_2.txt");
        // unknown prefix under both specs: a tagged partition, but its
        // declared result shape is wrong
        touch(dir.path(), "other_3_3.txt");
        let spec = dir.path().display().to_string();
        let j = Job {
            left: spec.clone(),
            right: spec,
            output: format!("{}/out", dir.path().display()),
            mode: Mode::MatrixMatrix,
            reducers: 1,
            strict: false,
        };
        let plan = plan(&j).unwrap();
        assert_eq!(plan.partitions.len(), 2);
        assert_eq!(plan.rejected.len(), 1);
        assert!(plan.rejected[0].0.ends_with("other_3_3.txt"));
    }

    #[test]
    fn tagged_partition_alone_declares_the_result() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("input_2_1.txt"),
            "A,0,0,1\nA,1,2,3\nB,0,0,4\nbad\n",
        )
        .unwrap();
        let plan = plan(&job(dir.path(), "input_*", "input_*", Mode::MatrixVector)).unwrap();
        assert_eq!(
            plan.shape,
            Shape {
                rows: 2,
                inner: 3,
                cols: 1
            }
        );
        assert_eq!(plan.partitions.len(), 1);
        assert!(plan.assignments.is_empty());
        assert!(plan.rejected.is_empty());
    }

    #[test]
    fn tagged_partition_takes_the_shape_of_the_operands() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "A_2_3.txt");
        touch(dir.path(), "B_3_4.txt");
        touch(dir.path(), "extra_2_4.txt");
        touch(dir.path(), "stale_2_2.txt");
        let spec = dir.path().display().to_string();
        let j = Job {
            left: spec.clone(),
            right: spec,
            output: format!("{}/out", dir.path().display()),
            mode: Mode::MatrixMatrix,
            reducers: 1,
            strict: false,
        };
        let plan = plan(&j).unwrap();
        assert_eq!(
            plan.shape,
            Shape {
                rows: 2,
                inner: 3,
                cols: 4
            }
        );
        assert_eq!(plan.partitions.len(), 3);
        assert_eq!(plan.rejected.len(), 1);
        assert!(plan.rejected[0].0.ends_with("stale_2_2.txt"));
    }

    #[test]
    fn unnamed_prefix_takes_the_side_it_was_listed_under() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "first_2_3.txt");
        touch(dir.path(), "second_3_1.txt");
        let plan = plan(&job(dir.path(), "first_*", "second_*", Mode::MatrixVector)).unwrap();
        assert_eq!(
            plan.shape,
            Shape {
                rows: 2,
                inner: 3,
                cols: 1
            }
        );
        assert_eq!(
            plan.assignments,
            vec![
                ("first_2_3.txt".to_string(), OperandTag::Left),
                ("second_3_1.txt".to_string(), OperandTag::Right),
            ]
        );
    }

    #[test]
    fn disagreeing_partition_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "A_2_2.txt");
        touch(dir.path(), "A_3_2.txt");
        touch(dir.path(), "B_2_2.txt");
        let plan = plan(&job(dir.path(), "A_*", "B_*", Mode::MatrixMatrix)).unwrap();
        assert_eq!(plan.partitions.len(), 2);
        assert_eq!(plan.rejected.len(), 1);
        assert!(plan.rejected[0].0.ends_with("A_3_2.txt"));
    }

    #[test]
    fn incompatible_operands_fail_planning() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "A_2_2.txt");
        touch(dir.path(), "B_3_2.txt");
        assert!(plan(&job(dir.path(), "A_*", "B_*", Mode::MatrixMatrix)).is_err());

        touch(dir.path(), "v_2_2.txt");
        assert!(plan(&job(dir.path(), "A_*", "v_*", Mode::MatrixVector)).is_err());
    }

    #[test]
    fn missing_side_fails_planning() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "A_2_2.txt");
        assert!(plan(&job(dir.path(), "A_*", "B_*", Mode::MatrixMatrix)).is_err());
    }
}
