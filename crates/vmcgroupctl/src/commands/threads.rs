use std::fmt::Display;

use anyhow::{Context, Result};
use clap::Parser;
use libvmcgroups::common::CgroupManager;
use libvmcgroups::resolver::CgroupResolver;
use serde::Serialize;

use super::{load_manager, print_report, OutputFormat};

/// List the threads attached to a process's cgroup
#[derive(Parser, Debug)]
pub struct Threads {
    #[clap(long)]
    pub pid: i32,
    /// Only keep threads whose executable name contains this text
    #[clap(long)]
    pub filter: Option<String>,
}

#[derive(Serialize, Debug, PartialEq, Eq)]
pub struct ThreadsReport {
    pub threads: Vec<i32>,
}

impl Display for ThreadsReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let lines: Vec<String> = self.threads.iter().map(i32::to_string).collect();
        write!(f, "{}", lines.join("\n"))
    }
}

fn run(args: &Threads, resolver: &CgroupResolver) -> Result<ThreadsReport> {
    let manager = load_manager(resolver, args.pid)?;
    let threads = match args.filter.as_deref() {
        Some(needle) => {
            let filter = |executable: &str| executable.contains(needle);
            manager.get_cgroup_threads(Some(&filter))
        }
        None => manager.get_cgroup_threads(None),
    }
    .context("failed to list cgroup threads")?;

    Ok(ThreadsReport {
        threads: threads.into_iter().map(|tid| tid.as_raw()).collect(),
    })
}

pub fn threads(args: Threads, resolver: &CgroupResolver, format: OutputFormat) -> Result<()> {
    print_report(&run(&args, resolver)?, format)
}
