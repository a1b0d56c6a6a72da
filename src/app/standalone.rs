use anyhow::*;
use clap::Parser;
use log::info;
use mrmatrix::standalone::{driver::run_job, Args, Job};

fn parse_args() -> Job {
    let args = Args::parse();
    Job::from(args.command)
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let job = parse_args();
    let report = run_job(&job)?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !report.succeeded() {
        bail!(
            "{} partition(s) failed: {}",
            report.failed_partitions.len(),
            report.failed_partitions.join(", ")
        );
    }
    info!("output written to {}", job.output);
    Ok(())
}
