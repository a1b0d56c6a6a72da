//! Utility functions that may be helpful for running
//! and testing MapReduce jobs.
//!

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use glob::glob;

use crate::workload::matrix_mult::OutputKey;

/// Read an entire [`Bytes`] slice into a [`String`].
///
/// Returns an error if the slice contains invalid UTF-8.
pub fn string_from_bytes(buf: Bytes) -> Result<String> {
    Ok(String::from_utf8(buf.as_ref().into())?)
}

/// Expands an input pattern into the files it names.
///
/// `spec` is a glob pattern; an existing directory stands for every
/// regular file directly inside it. Results are sorted.
pub fn resolve_inputs(spec: &str) -> Result<Vec<PathBuf>> {
    let pattern = if Path::new(spec).is_dir() {
        format!("{}/*", spec.trim_end_matches('/'))
    } else {
        spec.to_string()
    };
    let mut files = Vec::new();
    for entry in glob(&pattern).with_context(|| format!("bad input pattern `{spec}`"))? {
        let path = entry?;
        if path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Reads every `mr-out-*` file in `dir` back into a map of output cells.
pub fn read_output(dir: &Path) -> Result<BTreeMap<OutputKey, i64>> {
    let mut cells = BTreeMap::new();
    for path in resolve_inputs(&format!("{}/mr-out-*", dir.display()))? {
        let content = fs::read_to_string(&path)?;
        for line in content.lines().filter(|l| !l.is_empty()) {
            let Some((key, sum)) = line.split_once('\t') else {
                bail!("{}: no tab in output line `{line}`", path.display());
            };
            let Some(key) = OutputKey::parse(key) else {
                bail!("{}: bad output key `{key}`", path.display());
            };
            if cells.insert(key, sum.parse::<i64>()?).is_some() {
                bail!("{}: key {key:?} written twice", path.display());
            }
        }
    }
    Ok(cells)
}
