use std::fmt::Display;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use libvmcgroups::common::CgroupManager;
use libvmcgroups::resolver::CgroupResolver;
use serde::Serialize;

use super::{load_manager, print_report, OutputFormat};

/// Read or change the cpu weight of a process's cgroup. On v1 hosts the
/// weight is converted to and from cpu shares.
#[derive(Parser, Debug)]
pub struct CpuWeight {
    #[clap(long)]
    pub pid: i32,

    #[clap(subcommand)]
    pub action: CpuWeightAction,
}

#[derive(Subcommand, Debug)]
pub enum CpuWeightAction {
    Get,
    /// Weight between 1 and 10000
    Set { weight: u64 },
}

#[derive(Serialize, Debug, PartialEq, Eq)]
pub struct CpuWeightReport {
    pub weight: u64,
}

impl Display for CpuWeightReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.weight)
    }
}

fn run(args: &CpuWeight, resolver: &CgroupResolver) -> Result<CpuWeightReport> {
    let manager = load_manager(resolver, args.pid)?;
    let weight = match args.action {
        CpuWeightAction::Get => manager.get_cpu_weight().context("failed to read cpu weight")?,
        CpuWeightAction::Set { weight } => {
            manager
                .set_cpu_weight(weight)
                .with_context(|| format!("failed to set cpu weight of process {}", args.pid))?;
            weight
        }
    };

    Ok(CpuWeightReport { weight })
}

pub fn cpu_weight(args: CpuWeight, resolver: &CgroupResolver, format: OutputFormat) -> Result<()> {
    print_report(&run(&args, resolver)?, format)
}
