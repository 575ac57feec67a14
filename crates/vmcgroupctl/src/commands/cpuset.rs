use std::fmt::Display;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use libvmcgroups::common::CgroupManager;
use libvmcgroups::cpuset::{format_cpu_set, parse_cpu_set};
use libvmcgroups::resolver::CgroupResolver;
use serde::Serialize;

use super::{load_manager, print_report, OutputFormat};

/// Read or restrict the cpus a process's cgroup may run on
#[derive(Parser, Debug)]
pub struct Cpuset {
    #[clap(long)]
    pub pid: i32,

    #[clap(subcommand)]
    pub action: CpusetAction,
}

#[derive(Subcommand, Debug)]
pub enum CpusetAction {
    /// Print the effective cpus
    Get,
    /// Write a cpu list such as `0-3,8`
    Set { cpus: String },
}

#[derive(Serialize, Debug, PartialEq, Eq)]
pub struct CpusetReport {
    pub cpus: Vec<usize>,
}

impl Display for CpusetReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", format_cpu_set(&self.cpus))
    }
}

fn run(args: &Cpuset, resolver: &CgroupResolver) -> Result<CpusetReport> {
    let manager = load_manager(resolver, args.pid)?;
    let cpus = match &args.action {
        CpusetAction::Get => manager.get_cpu_set().context("failed to read cpuset")?,
        CpusetAction::Set { cpus } => {
            let cpus = parse_cpu_set(cpus).with_context(|| format!("invalid cpu list {cpus}"))?;
            manager
                .set_cpu_set(&cpus)
                .with_context(|| format!("failed to set cpuset of process {}", args.pid))?;
            cpus
        }
    };

    Ok(CpusetReport { cpus })
}

pub fn cpuset(args: Cpuset, resolver: &CgroupResolver, format: OutputFormat) -> Result<()> {
    print_report(&run(&args, resolver)?, format)
}
