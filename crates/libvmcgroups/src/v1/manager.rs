use std::{
    collections::{BTreeMap, HashMap},
    fs,
    path::{Path, PathBuf},
    sync::PoisonError,
};

use nix::unistd::Pid;
use oci_spec::runtime::LinuxResources;

use crate::{
    common::{
        self, AnyCgroupManager, CgroupManager, CgroupVersion, ManagerContext, TaskType,
        ThreadFilter, WrapIoResult, WrappedIoError, CGROUP_PROCS,
    },
    controller_type::{ControllerType, CONTROLLERS},
    cpuset::{self, ParseCpuSetError},
    devices::{self, DeviceRulesError, MergeRulesError, DEVICES_LIST},
    process::{self, ProcessError},
    trampoline::{ApplyRequest, TrampolineError},
};

pub const CGROUP_TASKS: &str = "tasks";
pub const CPUSET_CPUS: &str = "cpuset.cpus";
pub const CPUSET_MEMS: &str = "cpuset.mems";
pub const CPU_SHARES: &str = "cpu.shares";

const CPU_WEIGHT_MAX: u64 = 10000;
const CPU_SHARES_MIN: u64 = 2;
const CPU_SHARES_MAX: u64 = 262144;

#[derive(thiserror::Error, Debug)]
pub enum V1ManagerError {
    #[error("io error: {0}")]
    WrappedIo(#[from] WrappedIoError),
    #[error("subsystem {0} is not known to this cgroup")]
    SubsystemNotFound(ControllerType),
    #[error("failed to parse cpu set from {path}: {err}")]
    ParseCpuSet {
        err: ParseCpuSetError,
        path: PathBuf,
    },
    #[error("unexpected cpu shares {value:?} in {path}")]
    ParseCpuWeight { path: PathBuf, value: String },
    #[error("invalid cpu weight {0}, expected a value between 1 and 10000")]
    InvalidCpuWeight(u64),
    #[error(transparent)]
    Merge(#[from] MergeRulesError),
    #[error(transparent)]
    Devices(#[from] DeviceRulesError),
    #[error("failed to build default device rules: {0}")]
    DefaultDevices(#[from] oci_spec::OciSpecError),
    #[error(transparent)]
    Trampoline(#[from] TrampolineError),
    #[error(transparent)]
    Process(#[from] ProcessError),
}

/// Converts a cgroup v2 weight into v1 cpu shares
pub fn weight_to_shares(weight: u64) -> u64 {
    let weight = weight.clamp(1, CPU_WEIGHT_MAX);
    CPU_SHARES_MIN + (weight - 1) * (CPU_SHARES_MAX - CPU_SHARES_MIN) / (CPU_WEIGHT_MAX - 1)
}

/// Converts v1 cpu shares into a cgroup v2 weight
pub fn shares_to_weight(shares: u64) -> u64 {
    let shares = shares.clamp(CPU_SHARES_MIN, CPU_SHARES_MAX);
    1 + (shares - CPU_SHARES_MIN) * (CPU_WEIGHT_MAX - 1) / (CPU_SHARES_MAX - CPU_SHARES_MIN)
}

/// Manager bound to one directory per mounted subsystem
#[derive(Debug, Clone)]
pub struct Manager {
    subsystems: HashMap<ControllerType, PathBuf>,
    context: ManagerContext,
}

impl Manager {
    pub fn new(subsystems: HashMap<ControllerType, PathBuf>, context: ManagerContext) -> Self {
        tracing::info!(?subsystems, "created cgroup v1 manager");
        Self {
            subsystems,
            context,
        }
    }

    pub fn subsystems(&self) -> &HashMap<ControllerType, PathBuf> {
        &self.subsystems
    }

    pub fn any(self) -> AnyCgroupManager {
        AnyCgroupManager::V1(self)
    }

    fn subsystem_path(&self, subsystem: ControllerType) -> Result<&Path, V1ManagerError> {
        self.subsystems
            .get(&subsystem)
            .map(PathBuf::as_path)
            .ok_or(V1ManagerError::SubsystemNotFound(subsystem))
    }

    /// Rules currently enforced by the devices subsystem. v1 exposes them, so
    /// nothing needs to be remembered between calls. Without a readable list the
    /// launcher defaults are assumed.
    fn current_device_rules(
        &self,
    ) -> Result<Vec<oci_spec::runtime::LinuxDeviceCgroup>, V1ManagerError> {
        let list = self
            .subsystems
            .get(&ControllerType::Devices)
            .map(|path| path.join(DEVICES_LIST))
            .filter(|list| list.exists());
        let Some(list) = list else {
            return Ok(devices::default_device_rules(CgroupVersion::V1)?);
        };

        Ok(devices::parse_devices_list(&common::read_cgroup_file(&list)?)?)
    }

    /// Copies the parent's cpuset into a fresh child, the kernel leaves it empty and
    /// refuses tasks until it is populated
    fn inherit_cpuset(parent: &Path, child: &Path) -> Result<(), V1ManagerError> {
        for file in [CPUSET_CPUS, CPUSET_MEMS] {
            let child_file = child.join(file);
            let parent_file = parent.join(file);
            if !child_file.exists() || !parent_file.exists() {
                continue;
            }

            if common::read_cgroup_file(&child_file)?.trim().is_empty() {
                let value = common::read_cgroup_file(&parent_file)?;
                common::write_cgroup_file_str(&child_file, value.trim())?;
            }
        }

        Ok(())
    }
}

impl CgroupManager for Manager {
    type Error = V1ManagerError;

    fn set(&self, resources: &LinuxResources) -> Result<(), Self::Error> {
        let lock_path = self
            .subsystems
            .get(&ControllerType::Devices)
            .or_else(|| self.subsystems.values().next())
            .cloned()
            .unwrap_or_default();
        // v1 lists its enforced rules in devices.list, the entry is only a lock
        let entry = self.context.rule_store.entry(&lock_path);
        let _guard = entry.lock().unwrap_or_else(PoisonError::into_inner);

        let current = self.current_device_rules()?;
        let merged = devices::merge_device_rules(&current, resources.devices().as_deref())?;
        tracing::debug!(rules = merged.len(), "merged device rules");

        let mut to_apply = resources.clone();
        to_apply.set_devices(Some(merged));

        let request = ApplyRequest {
            resources: to_apply,
            subsystem_paths: self
                .subsystems
                .iter()
                .map(|(subsystem, path)| (subsystem.to_string(), path.clone()))
                .collect(),
            rootless: self.context.rootless,
            version: CgroupVersion::V1,
        };
        self.context.applier.apply(&request)?;
        Ok(())
    }

    fn get_base_path_to_host_subsystem(
        &self,
        subsystem: ControllerType,
    ) -> Result<PathBuf, Self::Error> {
        Ok(self.subsystem_path(subsystem)?.to_path_buf())
    }

    fn cgroup_paths(&self) -> BTreeMap<String, PathBuf> {
        self.subsystems
            .iter()
            .map(|(subsystem, path)| (subsystem.to_string(), path.clone()))
            .collect()
    }

    fn version(&self) -> CgroupVersion {
        CgroupVersion::V1
    }

    fn get_cpu_set(&self) -> Result<Vec<usize>, Self::Error> {
        let path = self.subsystem_path(ControllerType::CpuSet)?.join(CPUSET_CPUS);
        let content = common::read_cgroup_file(&path)?;
        cpuset::parse_cpu_set(&content).map_err(|err| V1ManagerError::ParseCpuSet { err, path })
    }

    fn set_cpu_set(&self, cpus: &[usize]) -> Result<(), Self::Error> {
        let path = self.subsystem_path(ControllerType::CpuSet)?.join(CPUSET_CPUS);
        common::write_cgroup_file_str(path, &cpuset::format_cpu_set(cpus))?;
        Ok(())
    }

    fn get_cpu_weight(&self) -> Result<u64, Self::Error> {
        let path = self.subsystem_path(ControllerType::Cpu)?.join(CPU_SHARES);
        let content = common::read_cgroup_file(&path)?;
        let value = content.trim();
        let shares: u64 = value.parse().map_err(|_| V1ManagerError::ParseCpuWeight {
            path: path.clone(),
            value: value.to_owned(),
        })?;

        Ok(shares_to_weight(shares))
    }

    fn set_cpu_weight(&self, weight: u64) -> Result<(), Self::Error> {
        if weight == 0 || weight > CPU_WEIGHT_MAX {
            return Err(V1ManagerError::InvalidCpuWeight(weight));
        }

        let path = self.subsystem_path(ControllerType::Cpu)?.join(CPU_SHARES);
        common::write_cgroup_file(path, weight_to_shares(weight))?;
        Ok(())
    }

    fn create_child_cgroup(
        &self,
        name: &str,
        subsystems: &[ControllerType],
    ) -> Result<Self, Self::Error> {
        let requested: Vec<ControllerType> = if subsystems.is_empty() {
            CONTROLLERS
                .iter()
                .filter(|c| self.subsystems.contains_key(c))
                .copied()
                .collect()
        } else {
            subsystems.to_vec()
        };

        let mut children = HashMap::with_capacity(requested.len());
        for subsystem in requested {
            let parent = self.subsystem_path(subsystem)?;
            let child = parent.join(name);
            if !child.exists() {
                fs::create_dir_all(&child).wrap_create_dir(&child)?;
                if subsystem == ControllerType::CpuSet {
                    Self::inherit_cpuset(parent, &child)?;
                }
            }

            children.insert(subsystem, child);
        }

        Ok(Self::new(children, self.context.clone()))
    }

    fn attach_task(
        &self,
        id: Pid,
        subsystem: ControllerType,
        task_type: TaskType,
    ) -> Result<(), Self::Error> {
        let file = match task_type {
            TaskType::Thread => CGROUP_TASKS,
            TaskType::Process => CGROUP_PROCS,
        };

        common::write_cgroup_file(self.subsystem_path(subsystem)?.join(file), id)?;
        Ok(())
    }

    fn get_cgroup_threads(&self, filter: Option<ThreadFilter>) -> Result<Vec<Pid>, Self::Error> {
        let tasks = self.subsystem_path(ControllerType::CpuSet)?.join(CGROUP_TASKS);
        let ids = common::read_task_ids(tasks)?;
        Ok(process::filter_tasks(&self.context.proc_root, ids, filter)?)
    }

    fn make_threaded(&self) -> Result<(), Self::Error> {
        tracing::debug!("cgroup v1 has no threaded mode, nothing to do");
        Ok(())
    }
}
