use clap::{Parser, Subcommand};

use crate::workload::matrix_mult::Mode;

pub mod driver;
pub mod engine;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Multiply two partitioned matrices on this machine
    Submit {
        /// Glob spec (or directory) for the left operand partitions
        #[arg(short, long)]
        left: String,

        /// Glob spec (or directory) for the right operand partitions
        #[arg(short, long)]
        right: String,

        /// Output directory
        #[arg(short, long)]
        output: String,

        /// Product to compute
        #[arg(short, long, value_enum, default_value_t = Mode::MatrixMatrix)]
        mode: Mode,

        /// Number of reduce buckets
        #[arg(
            short = 'n',
            long,
            default_value_t = 4,
            value_parser = clap::value_parser!(u32).range(1..)
        )]
        reducers: u32,

        /// Treat duplicate cells for the same operand and index as errors
        #[arg(long)]
        strict: bool,
    },
}

/// Everything a job run needs, passed explicitly to the driver.
#[derive(Debug, Clone)]
pub struct Job {
    pub left: String,
    pub right: String,
    pub output: String,
    pub mode: Mode,
    pub reducers: u32,
    pub strict: bool,
}

impl From<Commands> for Job {
    fn from(command: Commands) -> Self {
        match command {
            Commands::Submit {
                left,
                right,
                output,
                mode,
                reducers,
                strict,
            } => Job {
                left,
                right,
                output,
                mode,
                reducers,
                strict,
            },
        }
    }
}
