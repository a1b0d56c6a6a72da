//! Converts MapReduce application names to actual application code.
//!
//! # Example
//!
//! To get the matrix multiplication application:
//! ```
//! # use anyhow::Result;
//! use mrmatrix::workload;
//! # fn main() -> Result<()> {
//! let mm = workload::named("matmul")?;
//! # Ok(())
//! # }
//! ```

use crate::Workload;
use anyhow::{bail, Result};

pub mod join;
pub mod matrix_mult;
pub mod record;

/// Gets the [`Workload`] named `name`.
///
/// Returns [`None`] if no application with the given name was found.
pub fn try_named(name: &str) -> Option<Workload> {
    match name {
        "matmul" => Some(Workload {
            map_fn: matrix_mult::map,
            reduce_fn: join::reduce,
        }),
        "matvec" => Some(Workload {
            map_fn: matrix_mult::map_vector,
            reduce_fn: join::reduce,
        }),
        _ => None,
    }
}

/// Gets the [`Workload`] named `name`.
///
/// Returns an [`anyhow::Error`] if no application with the given name was found.
pub fn named(name: &str) -> Result<Workload> {
    match try_named(name) {
        Some(app) => Ok(app),
        None => bail!("No app named `{}` found.", name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use matrix_mult::Mode;

    #[test]
    fn every_mode_has_a_workload() {
        for mode in [Mode::MatrixMatrix, Mode::MatrixVector] {
            assert!(try_named(mode.workload_name()).is_some());
        }
        assert!(named("wc").is_err());
    }
}
