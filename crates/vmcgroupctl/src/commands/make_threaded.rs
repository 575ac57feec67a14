use anyhow::{Context, Result};
use clap::Parser;
use libvmcgroups::common::CgroupManager;
use libvmcgroups::controller_type::ControllerType;
use libvmcgroups::resolver::CgroupResolver;

use super::load_manager;

/// Switch a process's cgroup, or a child of it, to threaded mode
#[derive(Parser, Debug)]
pub struct MakeThreaded {
    #[clap(long)]
    pub pid: i32,
    /// Child cgroup to create with the cpuset controller and make threaded
    #[clap(long)]
    pub child: Option<String>,
}

pub fn make_threaded(args: MakeThreaded, resolver: &CgroupResolver) -> Result<()> {
    let manager = load_manager(resolver, args.pid)?;
    let target = match &args.child {
        Some(name) => manager
            .create_child_cgroup(name, &[ControllerType::CpuSet])
            .with_context(|| format!("failed to create child cgroup {name}"))?,
        None => manager,
    };

    target
        .make_threaded()
        .context("failed to switch cgroup to threaded mode")
}
