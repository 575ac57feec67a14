//! The virtual machine as seen by the cgroup layer, and the seam used to find
//! the process hosting it.
use nix::unistd::Pid;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VirtualMachine {
    pub name: String,
    pub namespace: String,
    /// Guest vCPUs are pinned to host cpus
    pub dedicated_cpu_placement: bool,
    /// Value passed to the placeholder process that holds the dedicated cpus
    /// cgroup. Unique per virtual machine.
    pub dedicated_cgroup_fingerprint: Option<u64>,
}

impl VirtualMachine {
    pub fn new<N: Into<String>, S: Into<String>>(name: N, namespace: S) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    pub fn is_cpu_dedicated(&self) -> bool {
        self.dedicated_cpu_placement
    }
}

#[derive(thiserror::Error, Debug)]
pub enum IsolationError {
    #[error("cannot detect vm {vm}: {reason}")]
    Detect { vm: String, reason: String },
}

/// Finds the host process of a virtual machine, usually the launcher inside
/// the compute container
pub trait IsolationDetector {
    fn detect(&self, vm: &VirtualMachine) -> Result<Pid, IsolationError>;
}

/// Detector for callers that already know the launcher pid
#[derive(Debug, Clone, Copy)]
pub struct StaticPidDetector(pub Pid);

impl IsolationDetector for StaticPidDetector {
    fn detect(&self, _vm: &VirtualMachine) -> Result<Pid, IsolationError> {
        Ok(self.0)
    }
}
