//! Prints the cgroup version of the host and where a process's cgroups live
use std::collections::BTreeMap;
use std::fmt::Display;
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use libvmcgroups::common::{CgroupManager, CgroupVersion};
use libvmcgroups::resolver::CgroupResolver;
use serde::Serialize;

use super::{load_manager, print_report, OutputFormat};

/// Show the cgroup version and the cgroup paths of a process
#[derive(Parser, Debug)]
pub struct Info {
    /// Process whose cgroups are shown
    #[clap(long)]
    pub pid: i32,
}

#[derive(Serialize, Debug, PartialEq, Eq)]
pub struct InfoReport {
    pub version: CgroupVersion,
    pub global_cpuset: PathBuf,
    /// Subsystem to directory, a single `unified` entry on v2
    pub paths: BTreeMap<String, PathBuf>,
}

impl Display for InfoReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{:<18}{}", "Version", self.version)?;
        write!(f, "{:<18}{}", "Global cpuset", self.global_cpuset.display())?;
        for (subsystem, path) in &self.paths {
            write!(f, "\n{:<18}{}", subsystem, path.display())?;
        }
        Ok(())
    }
}

fn report(args: &Info, resolver: &CgroupResolver) -> Result<InfoReport> {
    let manager = load_manager(resolver, args.pid)?;
    Ok(InfoReport {
        version: resolver.version(),
        global_cpuset: resolver.global_cpuset_path(),
        paths: manager.cgroup_paths(),
    })
}

pub fn info(args: Info, resolver: &CgroupResolver, format: OutputFormat) -> Result<()> {
    print_report(&report(&args, resolver)?, format)
}

#[cfg(test)]
mod tests {
    use super::super::fixture::{Host, LAUNCHER_PID};
    use super::*;

    #[test]
    fn test_info_report() -> Result<()> {
        let host = Host::new()?;
        let report = report(&Info { pid: LAUNCHER_PID }, &host.resolver)?;

        assert_eq!(report.version, CgroupVersion::V2);
        assert_eq!(
            report.global_cpuset,
            host.tmp.path().join("cgroup/cpuset.cpus.effective")
        );
        assert_eq!(
            report.paths,
            BTreeMap::from([("unified".to_owned(), host.compute())])
        );

        let text = report.to_string();
        assert!(text.starts_with("Version           v2"));
        assert!(text.contains("unified"));

        let json: serde_json::Value = serde_json::to_value(&report)?;
        assert_eq!(json["version"], "v2");
        Ok(())
    }
}
