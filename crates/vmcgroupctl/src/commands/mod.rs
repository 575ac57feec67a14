use std::fmt::Display;

use anyhow::{Context, Result};
use clap::ValueEnum;
use libvmcgroups::common::AnyCgroupManager;
use libvmcgroups::resolver::CgroupResolver;
use nix::unistd::Pid;
use serde::Serialize;

pub mod attach;
pub mod cpu_weight;
pub mod cpuset;
pub mod dedicated;
pub mod info;
pub mod make_threaded;
pub mod threads;

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Resolves the manager of the cgroups the process belongs to
fn load_manager(resolver: &CgroupResolver, pid: i32) -> Result<AnyCgroupManager> {
    resolver
        .manager_from_pid(Pid::from_raw(pid))
        .with_context(|| format!("failed to resolve the cgroup of process {pid}"))
}

fn print_report<T: Serialize + Display>(report: &T, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => println!("{report}"),
        OutputFormat::Json => println!(
            "{}",
            serde_json::to_string_pretty(report).context("failed to serialize output")?
        ),
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use anyhow::Result;
    use libvmcgroups::common::CgroupManager;
    use libvmcgroups::controller_type::ControllerType;

    use super::fixture::{Host, LAUNCHER_PID};
    use super::*;

    #[test]
    fn test_load_manager() -> Result<()> {
        let host = Host::new()?;
        let manager = load_manager(&host.resolver, LAUNCHER_PID)?;
        assert_eq!(
            manager.get_base_path_to_host_subsystem(ControllerType::Cpu)?,
            host.compute()
        );
        Ok(())
    }

    #[test]
    fn test_load_manager_unknown_process() -> Result<()> {
        let host = Host::new()?;
        let err = load_manager(&host.resolver, 4242).unwrap_err();
        assert!(err.to_string().contains("4242"));
        Ok(())
    }
}
