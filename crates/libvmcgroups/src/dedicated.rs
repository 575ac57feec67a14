//! Splits the cpus of a virtual machine with dedicated cpu placement so the
//! threads selected by the vCPU filter get a cpu of their own.
use nix::unistd::Pid;

use crate::{
    common::{CgroupManager, TaskType},
    controller_type::ControllerType,
    isolation::{IsolationDetector, VirtualMachine},
    resolver::{CgroupResolver, ResolveError},
};

/// Name of the threaded child created under the dedicated cgroup.
/// The vCPU threads are the ones moved into it.
pub const HOUSEKEEPING_CGROUP: &str = "housekeeping";
pub const HYPERVISOR_EXECUTABLE: &str = "qemu-kvm";
const VCPU_MARKER: &str = "CPU ";
const KVM_MARKER: &str = "KVM";

#[derive(thiserror::Error, Debug)]
pub enum DedicatedCpuError {
    #[error("vm {vm} is expected to be defined with dedicated cpus")]
    NotDedicated { vm: String },
    #[error("no qemu-kvm process found in the compute cgroup")]
    HypervisorNotFound,
    #[error("dedicated cgroup offers cpus {cpus:?}, at least 2 are required")]
    NotEnoughCpus { cpus: Vec<usize> },
    #[error("cgroup manager error: {0}")]
    Manager(Box<dyn std::error::Error + Send + Sync>),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
}

fn manager_error<E: std::error::Error + Send + Sync + 'static>(err: E) -> DedicatedCpuError {
    DedicatedCpuError::Manager(Box::new(err))
}

/// Outcome of a partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedicatedCpuLayout {
    pub hypervisor_pid: Pid,
    pub vcpu_tids: Vec<Pid>,
    /// Cpus of the dedicated cgroup before the partition
    pub dedicated_cpus: Vec<usize>,
    /// Cpu given exclusively to the housekeeping child
    pub housekeeping_cpu: usize,
}

pub fn is_hypervisor(executable: &str) -> bool {
    executable.contains(HYPERVISOR_EXECUTABLE)
}

/// vCPU threads are named like `CPU 0/KVM`
pub fn is_vcpu(executable: &str) -> bool {
    executable.contains(VCPU_MARKER) && executable.contains(KVM_MARKER)
}

/// Moves the hypervisor of the compute cgroup into the dedicated cgroup, then
/// moves its vCPU threads into a threaded housekeeping child pinned to the
/// highest dedicated cpu. Nothing is written unless the dedicated cgroup holds
/// at least two cpus and a hypervisor process is found.
pub fn partition_dedicated_cpus<M>(
    compute: &M,
    dedicated: &M,
) -> Result<DedicatedCpuLayout, DedicatedCpuError>
where
    M: CgroupManager,
    M::Error: std::error::Error + Send + Sync + 'static,
{
    let dedicated_cpus = dedicated.get_cpu_set().map_err(manager_error)?;
    let last = match dedicated_cpus.as_slice() {
        [_, .., last] => Some(*last),
        _ => None,
    };
    let Some(housekeeping_cpu) = last else {
        return Err(DedicatedCpuError::NotEnoughCpus {
            cpus: dedicated_cpus,
        });
    };

    let hypervisors = compute
        .get_cgroup_threads(Some(&is_hypervisor))
        .map_err(manager_error)?;
    let hypervisor_pid = *hypervisors
        .first()
        .ok_or(DedicatedCpuError::HypervisorNotFound)?;
    if hypervisors.len() > 1 {
        tracing::warn!(
            ?hypervisors,
            %hypervisor_pid,
            "several hypervisor processes, using the first"
        );
    }

    // listed before the move, the threads leave the compute cgroup with their process
    let vcpu_tids = compute
        .get_cgroup_threads(Some(&is_vcpu))
        .map_err(manager_error)?;
    tracing::debug!(
        %hypervisor_pid,
        ?vcpu_tids,
        ?dedicated_cpus,
        "partitioning dedicated cpus"
    );

    dedicated
        .attach_task(hypervisor_pid, ControllerType::CpuSet, TaskType::Process)
        .map_err(manager_error)?;

    let housekeeping = dedicated
        .create_child_cgroup(HOUSEKEEPING_CGROUP, &[ControllerType::CpuSet])
        .map_err(manager_error)?;
    housekeeping.make_threaded().map_err(manager_error)?;

    for tid in &vcpu_tids {
        housekeeping
            .attach_task(*tid, ControllerType::CpuSet, TaskType::Thread)
            .map_err(manager_error)?;
    }

    housekeeping
        .set_cpu_set(&[housekeeping_cpu])
        .map_err(manager_error)?;
    tracing::info!(%hypervisor_pid, housekeeping_cpu, "dedicated cpus partitioned");

    Ok(DedicatedCpuLayout {
        hypervisor_pid,
        vcpu_tids,
        dedicated_cpus,
        housekeeping_cpu,
    })
}

/// Resolves the compute and dedicated cgroups of the virtual machine and
/// partitions its dedicated cpus
pub fn setup_dedicated_cpus(
    resolver: &CgroupResolver,
    detector: &dyn IsolationDetector,
    vm: &VirtualMachine,
) -> Result<DedicatedCpuLayout, DedicatedCpuError> {
    if !vm.is_cpu_dedicated() {
        return Err(DedicatedCpuError::NotDedicated {
            vm: vm.name.clone(),
        });
    }

    let compute = resolver.manager_from_vm(vm, detector)?;
    let dedicated = resolver.dedicated_manager(vm)?;
    partition_dedicated_cpus(&compute, &dedicated)
}
