use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use nix::unistd::Pid;
use procfs::{process::Process, ProcError};

use crate::{
    common::{
        self, AnyCgroupManager, CgroupVersion, GetCgroupSetupError, JoinSafelyError,
        ManagerContext, PathBufExt, DEFAULT_CGROUP_ROOT, DEFAULT_HOST_ROOT, DEFAULT_PROC_ROOT,
    },
    controller_type::ControllerType,
    devices::DeviceRuleStore,
    isolation::{IsolationDetector, IsolationError, VirtualMachine},
    process::{self, ProcessError},
    trampoline::{HelperTrampoline, ResourceApplier, DEFAULT_HELPER},
    v1, v2,
};

/// Where the agent finds the host's cgroup and proc filesystems, and how it
/// reaches the privileged helper
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgroupConfig {
    pub cgroup_root: PathBuf,
    pub proc_root: PathBuf,
    /// Prefix under which the host filesystem is visible, stripped from paths
    /// reported by the host
    pub host_root: PathBuf,
    pub rootless: bool,
    pub helper: PathBuf,
}

impl Default for CgroupConfig {
    fn default() -> Self {
        Self {
            cgroup_root: PathBuf::from(DEFAULT_CGROUP_ROOT),
            proc_root: PathBuf::from(DEFAULT_PROC_ROOT),
            host_root: PathBuf::from(DEFAULT_HOST_ROOT),
            rootless: false,
            helper: PathBuf::from(DEFAULT_HELPER),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ResolveError {
    #[error("failed to detect cgroup version: {0}")]
    Setup(#[from] GetCgroupSetupError),
    #[error("failed to read cgroups of process {pid}: {err}")]
    Proc { pid: Pid, err: ProcError },
    #[error("no unified cgroup path in {0:?}")]
    MissingUnifiedPath(HashMap<String, String>),
    #[error("no known subsystem in {0:?}")]
    NoSubsystems(HashMap<String, String>),
    #[error(transparent)]
    JoinSafely(#[from] JoinSafelyError),
    #[error(transparent)]
    Isolation(#[from] IsolationError),
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error("vm {vm} carries no dedicated cgroup fingerprint")]
    MissingFingerprint { vm: String },
    #[error("no process carries the dedicated cgroup fingerprint {0}")]
    FingerprintNotFound(u64),
}

/// Builds managers of the host's cgroup version. Every manager built by one
/// resolver shares its device rule store and its resource applier.
#[derive(Clone)]
pub struct CgroupResolver {
    config: CgroupConfig,
    version: CgroupVersion,
    rule_store: Arc<DeviceRuleStore>,
    applier: Arc<dyn ResourceApplier>,
}

impl std::fmt::Debug for CgroupResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CgroupResolver")
            .field("config", &self.config)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

impl CgroupResolver {
    /// Probes the cgroup mount and applies resources through the configured helper
    pub fn new(config: CgroupConfig) -> Result<Self, ResolveError> {
        let setup = common::get_cgroup_setup_with_root(&config.cgroup_root)?;
        tracing::info!(%setup, root = ?config.cgroup_root, "detected cgroup setup");

        let applier = Arc::new(HelperTrampoline::new(config.helper.clone()));
        Ok(Self::with_parts(config, setup.version(), applier))
    }

    pub fn with_parts(
        config: CgroupConfig,
        version: CgroupVersion,
        applier: Arc<dyn ResourceApplier>,
    ) -> Self {
        Self {
            config,
            version,
            rule_store: Arc::new(DeviceRuleStore::new()),
            applier,
        }
    }

    pub fn config(&self) -> &CgroupConfig {
        &self.config
    }

    pub fn version(&self) -> CgroupVersion {
        self.version
    }

    pub fn rule_store(&self) -> &Arc<DeviceRuleStore> {
        &self.rule_store
    }

    fn context(&self) -> ManagerContext {
        ManagerContext {
            proc_root: self.config.proc_root.clone(),
            rootless: self.config.rootless,
            rule_store: self.rule_store.clone(),
            applier: self.applier.clone(),
        }
    }

    /// cpuset file of the root cgroup, listing every cpu the host offers
    pub fn global_cpuset_path(&self) -> PathBuf {
        match self.version {
            CgroupVersion::V1 => self
                .config
                .cgroup_root
                .join(ControllerType::CpuSet.to_string())
                .join(v1::manager::CPUSET_CPUS),
            CgroupVersion::V2 => self
                .config
                .cgroup_root
                .join(v2::manager::CPUSET_CPUS_EFFECTIVE),
        }
    }

    /// Strips the mount prefixes a path may carry, leaving it relative to the
    /// cgroup root
    fn relativize(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        let prefixes = [
            self.config
                .host_root
                .join(DEFAULT_CGROUP_ROOT.trim_start_matches('/')),
            PathBuf::from(DEFAULT_CGROUP_ROOT),
            self.config.cgroup_root.clone(),
        ];

        let relative = prefixes
            .iter()
            .find_map(|prefix| path.strip_prefix(prefix).ok())
            .unwrap_or(path);
        relative
            .strip_prefix("/")
            .unwrap_or(relative)
            .to_path_buf()
    }

    /// Path of a v1 subsystem relative to the cgroup root. Paths listed in
    /// `/proc/<pid>/cgroup` are relative to the hierarchy and lack the mount
    /// directory of the subsystem.
    fn relativize_v1(&self, subsystem: ControllerType, path: &str) -> PathBuf {
        let relative = self.relativize(path);
        let mounted = relative
            .components()
            .next()
            .and_then(|c| c.as_os_str().to_str())
            .is_some_and(|first| first.split(',').any(|name| name == subsystem.as_ref()));

        if mounted {
            relative
        } else {
            Path::new(subsystem.as_ref()).join(relative)
        }
    }

    /// Builds a manager from a controller to path table as listed in
    /// `/proc/<pid>/cgroup`. The unified path is keyed by an empty string and
    /// v1 keys may name several comma separated controllers.
    pub fn manager_from_paths(
        &self,
        controller_paths: &HashMap<String, String>,
    ) -> Result<AnyCgroupManager, ResolveError> {
        match self.version {
            CgroupVersion::V2 => {
                let path = controller_paths
                    .get("")
                    .ok_or_else(|| ResolveError::MissingUnifiedPath(controller_paths.clone()))?;
                let full_path = self.config.cgroup_root.join_safely(self.relativize(path))?;
                Ok(v2::manager::Manager::new(full_path, self.context()).any())
            }
            CgroupVersion::V1 => {
                let mut subsystems = HashMap::new();
                for (controllers, path) in controller_paths {
                    for controller in controllers.split(',').filter(|c| !c.is_empty()) {
                        if controller.starts_with("name=") {
                            continue;
                        }

                        let subsystem: ControllerType = match controller.parse() {
                            Ok(subsystem) => subsystem,
                            Err(err) => {
                                tracing::warn!(%err, "skipping cgroup controller");
                                continue;
                            }
                        };
                        let full_path = self
                            .config
                            .cgroup_root
                            .join_safely(self.relativize_v1(subsystem, path))?;
                        subsystems.insert(subsystem, full_path);
                    }
                }

                if subsystems.is_empty() {
                    return Err(ResolveError::NoSubsystems(controller_paths.clone()));
                }

                Ok(v1::manager::Manager::new(subsystems, self.context()).any())
            }
        }
    }

    /// Builds a manager for the cgroups the process belongs to
    pub fn manager_from_pid(&self, pid: Pid) -> Result<AnyCgroupManager, ResolveError> {
        let cgroups = Process::new_with_root(self.config.proc_root.join(pid.to_string()))
            .and_then(|p| p.cgroups())
            .map_err(|err| ResolveError::Proc { pid, err })?;

        let controller_paths: HashMap<String, String> = cgroups
            .into_iter()
            .map(|cgroup| (cgroup.controllers.join(","), cgroup.pathname))
            .collect();
        tracing::debug!(%pid, ?controller_paths, "read process cgroups");

        self.manager_from_paths(&controller_paths)
    }

    /// Builds a manager for the compute container of the virtual machine
    pub fn manager_from_vm(
        &self,
        vm: &VirtualMachine,
        detector: &dyn IsolationDetector,
    ) -> Result<AnyCgroupManager, ResolveError> {
        let pid = detector.detect(vm)?;
        tracing::info!(vm = %vm.name, %pid, "resolving cgroup of vm launcher");
        self.manager_from_pid(pid)
    }

    /// Builds a manager for the cgroup holding the dedicated cpus of the virtual
    /// machine. The cgroup is found through a placeholder process whose command
    /// line carries the fingerprint of the virtual machine.
    pub fn dedicated_manager(&self, vm: &VirtualMachine) -> Result<AnyCgroupManager, ResolveError> {
        let fingerprint = vm
            .dedicated_cgroup_fingerprint
            .ok_or_else(|| ResolveError::MissingFingerprint {
                vm: vm.name.clone(),
            })?;

        let needle = fingerprint.to_string();
        let pid = process::find_process_by_cmdline(&self.config.proc_root, &needle)?
            .ok_or(ResolveError::FingerprintNotFound(fingerprint))?;
        tracing::info!(vm = %vm.name, %pid, fingerprint, "found dedicated cpus placeholder");

        self.manager_from_pid(pid)
    }
}
