use std::fmt::Display;

use anyhow::{Context, Result};
use clap::Parser;
use libvmcgroups::cpuset::format_cpu_set;
use libvmcgroups::dedicated::{setup_dedicated_cpus, DedicatedCpuLayout};
use libvmcgroups::isolation::{StaticPidDetector, VirtualMachine};
use libvmcgroups::resolver::CgroupResolver;
use nix::unistd::Pid;
use serde::Serialize;

use super::{print_report, OutputFormat};

/// Give the vCPU threads of a virtual machine with dedicated cpus a cpu of
/// their own
#[derive(Parser, Debug)]
pub struct DedicatedCpus {
    /// Pid of the virtual machine launcher
    #[clap(long)]
    pub pid: i32,
    /// Value carried by the command line of the process holding the dedicated cgroup
    #[clap(long)]
    pub fingerprint: u64,
    #[clap(long, default_value = "vm")]
    pub name: String,
    #[clap(long, default_value = "default")]
    pub namespace: String,
}

#[derive(Serialize, Debug, PartialEq, Eq)]
pub struct DedicatedCpusReport {
    pub hypervisor_pid: i32,
    pub vcpu_tids: Vec<i32>,
    pub dedicated_cpus: Vec<usize>,
    pub housekeeping_cpu: usize,
}

impl From<DedicatedCpuLayout> for DedicatedCpusReport {
    fn from(layout: DedicatedCpuLayout) -> Self {
        Self {
            hypervisor_pid: layout.hypervisor_pid.as_raw(),
            vcpu_tids: layout.vcpu_tids.iter().map(|tid| tid.as_raw()).collect(),
            dedicated_cpus: layout.dedicated_cpus,
            housekeeping_cpu: layout.housekeeping_cpu,
        }
    }
}

impl Display for DedicatedCpusReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tids: Vec<String> = self.vcpu_tids.iter().map(i32::to_string).collect();
        writeln!(f, "{:<18}{}", "Hypervisor", self.hypervisor_pid)?;
        writeln!(f, "{:<18}{}", "vCPU threads", tids.join(","))?;
        writeln!(f, "{:<18}{}", "Dedicated cpus", format_cpu_set(&self.dedicated_cpus))?;
        write!(f, "{:<18}{}", "Housekeeping cpu", self.housekeeping_cpu)
    }
}

impl DedicatedCpus {
    fn virtual_machine(&self) -> VirtualMachine {
        VirtualMachine {
            dedicated_cpu_placement: true,
            dedicated_cgroup_fingerprint: Some(self.fingerprint),
            ..VirtualMachine::new(self.name.as_str(), self.namespace.as_str())
        }
    }
}

fn run(args: &DedicatedCpus, resolver: &CgroupResolver) -> Result<DedicatedCpusReport> {
    let vm = args.virtual_machine();
    let detector = StaticPidDetector(Pid::from_raw(args.pid));
    let layout = setup_dedicated_cpus(resolver, &detector, &vm)
        .with_context(|| format!("failed to set up dedicated cpus of vm {}", vm.name))?;

    Ok(layout.into())
}

pub fn dedicated_cpus(
    args: DedicatedCpus,
    resolver: &CgroupResolver,
    format: OutputFormat,
) -> Result<()> {
    print_report(&run(&args, resolver)?, format)
}
