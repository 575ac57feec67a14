use anyhow::{Context, Result};
use clap::Parser;
use libvmcgroups::common::{CgroupManager, TaskType};
use libvmcgroups::controller_type::ControllerType;
use libvmcgroups::resolver::CgroupResolver;
use nix::unistd::Pid;

use super::load_manager;

/// Move a thread or a process into the cgroup of another process
#[derive(Parser, Debug)]
pub struct Attach {
    /// Process owning the target cgroup
    #[clap(long)]
    pub pid: i32,
    /// Thread or process id to move
    pub id: i32,
    /// thread or process
    #[clap(long)]
    pub task_type: TaskType,
    /// Subsystem whose hierarchy receives the task, ignored on v2
    #[clap(long, default_value = "cpuset")]
    pub subsystem: ControllerType,
}

pub fn attach(args: Attach, resolver: &CgroupResolver) -> Result<()> {
    let manager = load_manager(resolver, args.pid)?;
    manager
        .attach_task(Pid::from_raw(args.id), args.subsystem, args.task_type)
        .with_context(|| format!("failed to attach {} to the cgroup of {}", args.id, args.pid))?;

    tracing::info!(id = args.id, pid = args.pid, task_type = ?args.task_type, "task attached");
    Ok(())
}
