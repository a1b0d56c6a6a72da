use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use bytes::Bytes;
use dashmap::DashMap;
use itertools::Itertools;
use log::{debug, info, warn};
use rayon::prelude::*;
use serde::Serialize;

use crate::error::MatrixError;
use crate::*;

// types related to this engine
pub type BucketIndex = u32;
pub type Buckets = DashMap<BucketIndex, Vec<KeyValue>>;

/// Keys of one bucket, each with all of its values.
pub type KeyGroups<'a> = Box<dyn Iterator<Item = (Bytes, Vec<Bytes>)> + 'a>;

/// Groups one bucket of intermediate records by key.
///
/// This is the shuffle seam of the engine. Implementations may hand the
/// values of a key to the reducer in any order.
pub trait GroupByKey: Sync {
    fn group(&self, records: Vec<KeyValue>) -> KeyGroups<'_>;
}

/// Sorts a bucket by key and groups adjacent equal keys.
#[derive(Debug, Default, Clone, Copy)]
pub struct SortShuffle;

impl GroupByKey for SortShuffle {
    fn group(&self, mut records: Vec<KeyValue>) -> KeyGroups<'_> {
        records.sort_unstable_by_key(KeyValue::key);
        let groups = records
            .into_iter()
            .chunk_by(KeyValue::key)
            .into_iter()
            .map(|(key, group)| (key, group.map(KeyValue::into_value).collect()))
            .collect::<Vec<(Bytes, Vec<Bytes>)>>();
        Box::new(groups.into_iter())
    }
}

/// Outcome of the map phase.
#[derive(Debug, Default)]
pub struct MapSummary {
    pub buckets: Buckets,
    pub partitions: usize,
    pub records_emitted: usize,
    /// Partitions whose map failed, with the reason.
    pub failed: Vec<(String, String)>,
}

/// Outcome of the reduce phase.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReduceSummary {
    pub keys_reduced: usize,
    pub keys_skipped: usize,
    pub cells_written: usize,
}

/// Final status of a job run.
#[derive(Debug, Default, Clone, Serialize)]
pub struct JobReport {
    pub partitions: usize,
    pub failed_partitions: Vec<String>,
    pub records_emitted: usize,
    pub keys_reduced: usize,
    pub keys_skipped: usize,
    pub cells_written: usize,
}

impl JobReport {
    /// A job fails when any of its partitions failed entirely; skipped
    /// records and keys do not fail it.
    pub fn succeeded(&self) -> bool {
        self.failed_partitions.is_empty()
    }
}

fn map_one(path: &Path, engine: &Workload, serialized_args: &Bytes) -> Result<Vec<KeyValue>> {
    let buf = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let filename = path.to_str().unwrap_or("unknown").to_string();
    // Stores the data read from each file as <Filename, All data in file>
    let input_kv = KeyValue {
        key: Bytes::from(filename),
        value: Bytes::from(buf),
    };
    // Emissions are held back until the partition has mapped cleanly, so a
    // failed partition contributes nothing.
    (engine.map_fn)(input_kv, serialized_args.clone())?.collect()
}

/// Maps every input partition in parallel and buckets the emitted records
/// by `ihash(key) % num_reduce_worker`.
pub fn perform_map(
    inputs: &[PathBuf],
    engine: &Workload,
    serialized_args: &Bytes,
    num_reduce_worker: u32,
) -> MapSummary {
    let buckets: Buckets = Buckets::new();
    let outcomes: Vec<(String, Result<usize>)> = inputs
        .par_iter()
        .map(|pathspec| {
            let name = pathspec.display().to_string();
            let emitted = map_one(pathspec, engine, serialized_args).map(|records| {
                let n = records.len();
                for KeyValue { key, value } in records {
                    let bucket_no = ihash(&key) % num_reduce_worker;
                    buckets
                        .entry(bucket_no)
                        .or_insert_with(Vec::new)
                        .push(KeyValue { key, value });
                }
                n
            });
            (name, emitted)
        })
        .collect();

    let mut summary = MapSummary {
        partitions: inputs.len(),
        ..Default::default()
    };
    for (name, outcome) in outcomes {
        match outcome {
            Ok(n) => {
                debug!("mapped {name}: {n} records");
                summary.records_emitted += n;
            }
            Err(err) => {
                warn!("partition {name} failed: {err:#}");
                summary.failed.push((name, format!("{err:#}")));
            }
        }
    }
    summary.buckets = buckets;
    info!(
        "map phase done: {} partitions, {} failed, {} records in {} buckets",
        summary.partitions,
        summary.failed.len(),
        summary.records_emitted,
        summary.buckets.len()
    );
    summary
}

fn reduce_bucket(
    reduce_id: BucketIndex,
    bkt: Vec<KeyValue>,
    engine: &Workload,
    serialized_args: &Bytes,
    output_dir: &Path,
    shuffle: &dyn GroupByKey,
) -> Result<ReduceSummary> {
    let out_pathspec = output_dir.join(format!("mr-out-{reduce_id}"));
    let mut out_file = File::create(&out_pathspec)
        .with_context(|| format!("creating {}", out_pathspec.display()))?;
    let mut summary = ReduceSummary::default();

    for (key, values) in shuffle.group(bkt) {
        match (engine.reduce_fn)(key, Box::new(values.into_iter()), serialized_args.clone()) {
            Ok(out) => {
                summary.keys_reduced += 1;
                if !out.is_empty() {
                    summary.cells_written += 1;
                    out_file.write_all(&out)?;
                }
            }
            Err(err) => match err.downcast_ref::<MatrixError>() {
                Some(cause) => {
                    warn!("skipping key: {cause}");
                    summary.keys_skipped += 1;
                }
                None => return Err(err),
            },
        }
    }
    Ok(summary)
}

/// Reduces every bucket in parallel, writing `<output>/mr-out-<bucket>`.
///
/// Keys whose reduction fails with a [`MatrixError`] are skipped; any
/// other error aborts the phase.
pub fn perform_reduce(
    output_dir: &Path,
    engine: &Workload,
    serialized_args: &Bytes,
    buckets: Buckets,
    shuffle: &dyn GroupByKey,
) -> Result<ReduceSummary> {
    fs::create_dir_all(output_dir)
        .with_context(|| format!("creating output directory {}", output_dir.display()))?;

    let per_bucket: Vec<ReduceSummary> = buckets
        .into_par_iter()
        .map(|(reduce_id, bkt)| {
            reduce_bucket(reduce_id, bkt, engine, serialized_args, output_dir, shuffle)
        })
        .collect::<Result<_>>()?;

    let summary = per_bucket.into_iter().fold(ReduceSummary::default(), |acc, s| ReduceSummary {
        keys_reduced: acc.keys_reduced + s.keys_reduced,
        keys_skipped: acc.keys_skipped + s.keys_skipped,
        cells_written: acc.cells_written + s.cells_written,
    });
    info!(
        "reduce phase done: {} keys, {} skipped, {} cells written",
        summary.keys_reduced, summary.keys_skipped, summary.cells_written
    );
    Ok(summary)
}
