use std::{
    collections::BTreeMap,
    fmt::Display,
    fs,
    io::Write,
    path::{Path, PathBuf, StripPrefixError},
    str::FromStr,
    sync::Arc,
};

use nix::{
    sys::statfs::{statfs, CGROUP2_SUPER_MAGIC, TMPFS_MAGIC},
    unistd::Pid,
};
use oci_spec::runtime::LinuxResources;
use serde::{Deserialize, Serialize};

use crate::controller_type::ControllerType;
use crate::devices::DeviceRuleStore;
use crate::trampoline::ResourceApplier;
use crate::v1;
use crate::v2;

pub const CGROUP_PROCS: &str = "cgroup.procs";
pub const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup";
pub const DEFAULT_PROC_ROOT: &str = "/proc";
pub const DEFAULT_HOST_ROOT: &str = "/proc/1/root";

/// Generation of the kernel cgroup interface. Fixed for the lifetime of a host boot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CgroupVersion {
    V1,
    V2,
}

impl Display for CgroupVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let print = match self {
            CgroupVersion::V1 => "v1",
            CgroupVersion::V2 => "v2",
        };

        write!(f, "{print}")
    }
}

/// Selects the membership file an id is written to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TaskType {
    Thread,
    Process,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("invalid task type {0}, expected thread or process")]
pub struct InvalidTaskTypeError(pub String);

impl TryFrom<i32> for TaskType {
    type Error = InvalidTaskTypeError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(TaskType::Thread),
            1 => Ok(TaskType::Process),
            other => Err(InvalidTaskTypeError(other.to_string())),
        }
    }
}

impl FromStr for TaskType {
    type Err = InvalidTaskTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "thread" => Ok(TaskType::Thread),
            "process" => Ok(TaskType::Process),
            other => Err(InvalidTaskTypeError(other.to_owned())),
        }
    }
}

/// Filter applied to the executable name owning each listed thread.
pub type ThreadFilter<'a> = &'a dyn Fn(&str) -> bool;

/// The capability set shared by both cgroup generations. Callers never branch on
/// the version; arguments that have no meaning for one generation are ignored by it.
pub trait CgroupManager {
    type Error;

    /// Applies resources through the privileged helper. Device rules are merged with
    /// the rules previously applied to this cgroup.
    fn set(&self, resources: &LinuxResources) -> Result<(), Self::Error>;

    /// Returns the directory backing the subsystem from the host's viewpoint.
    /// The subsystem is ignored on v2.
    fn get_base_path_to_host_subsystem(
        &self,
        subsystem: ControllerType,
    ) -> Result<PathBuf, Self::Error>;

    fn version(&self) -> CgroupVersion;

    /// Directories backing the cgroup keyed by subsystem name. v2 has a single
    /// `unified` entry.
    fn cgroup_paths(&self) -> BTreeMap<String, PathBuf>;

    /// Reads the cpus the cgroup may run on
    fn get_cpu_set(&self) -> Result<Vec<usize>, Self::Error>;

    fn set_cpu_set(&self, cpus: &[usize]) -> Result<(), Self::Error>;

    fn get_cpu_weight(&self) -> Result<u64, Self::Error>;

    fn set_cpu_weight(&self, weight: u64) -> Result<(), Self::Error>;

    /// Creates a child cgroup, or wraps it if it already exists
    fn create_child_cgroup(
        &self,
        name: &str,
        subsystems: &[ControllerType],
    ) -> Result<Self, Self::Error>
    where
        Self: Sized;

    /// Moves a thread or a process into the cgroup. The subsystem is ignored on v2.
    fn attach_task(
        &self,
        id: Pid,
        subsystem: ControllerType,
        task_type: TaskType,
    ) -> Result<(), Self::Error>;

    /// Lists attached thread ids whose owning executable name passes the filter
    fn get_cgroup_threads(&self, filter: Option<ThreadFilter>) -> Result<Vec<Pid>, Self::Error>;

    /// Switches the cgroup to threaded mode. A no-op on v1.
    fn make_threaded(&self) -> Result<(), Self::Error>;
}

/// Collaborators shared by every manager created by the same resolver.
#[derive(Clone)]
pub struct ManagerContext {
    pub proc_root: PathBuf,
    pub rootless: bool,
    pub rule_store: Arc<DeviceRuleStore>,
    pub applier: Arc<dyn ResourceApplier>,
}

impl std::fmt::Debug for ManagerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagerContext")
            .field("proc_root", &self.proc_root)
            .field("rootless", &self.rootless)
            .finish_non_exhaustive()
    }
}

#[derive(thiserror::Error, Debug)]
pub enum AnyManagerError {
    #[error(transparent)]
    V1(#[from] v1::manager::V1ManagerError),
    #[error(transparent)]
    V2(#[from] v2::manager::V2ManagerError),
}

#[derive(Debug)]
pub enum AnyCgroupManager {
    V1(v1::manager::Manager),
    V2(v2::manager::Manager),
}

impl CgroupManager for AnyCgroupManager {
    type Error = AnyManagerError;

    fn set(&self, resources: &LinuxResources) -> Result<(), Self::Error> {
        match self {
            AnyCgroupManager::V1(m) => Ok(m.set(resources)?),
            AnyCgroupManager::V2(m) => Ok(m.set(resources)?),
        }
    }

    fn get_base_path_to_host_subsystem(
        &self,
        subsystem: ControllerType,
    ) -> Result<PathBuf, Self::Error> {
        match self {
            AnyCgroupManager::V1(m) => Ok(m.get_base_path_to_host_subsystem(subsystem)?),
            AnyCgroupManager::V2(m) => Ok(m.get_base_path_to_host_subsystem(subsystem)?),
        }
    }

    fn version(&self) -> CgroupVersion {
        match self {
            AnyCgroupManager::V1(m) => m.version(),
            AnyCgroupManager::V2(m) => m.version(),
        }
    }

    fn cgroup_paths(&self) -> BTreeMap<String, PathBuf> {
        match self {
            AnyCgroupManager::V1(m) => m.cgroup_paths(),
            AnyCgroupManager::V2(m) => m.cgroup_paths(),
        }
    }

    fn get_cpu_set(&self) -> Result<Vec<usize>, Self::Error> {
        match self {
            AnyCgroupManager::V1(m) => Ok(m.get_cpu_set()?),
            AnyCgroupManager::V2(m) => Ok(m.get_cpu_set()?),
        }
    }

    fn set_cpu_set(&self, cpus: &[usize]) -> Result<(), Self::Error> {
        match self {
            AnyCgroupManager::V1(m) => Ok(m.set_cpu_set(cpus)?),
            AnyCgroupManager::V2(m) => Ok(m.set_cpu_set(cpus)?),
        }
    }

    fn get_cpu_weight(&self) -> Result<u64, Self::Error> {
        match self {
            AnyCgroupManager::V1(m) => Ok(m.get_cpu_weight()?),
            AnyCgroupManager::V2(m) => Ok(m.get_cpu_weight()?),
        }
    }

    fn set_cpu_weight(&self, weight: u64) -> Result<(), Self::Error> {
        match self {
            AnyCgroupManager::V1(m) => Ok(m.set_cpu_weight(weight)?),
            AnyCgroupManager::V2(m) => Ok(m.set_cpu_weight(weight)?),
        }
    }

    fn create_child_cgroup(
        &self,
        name: &str,
        subsystems: &[ControllerType],
    ) -> Result<Self, Self::Error> {
        match self {
            AnyCgroupManager::V1(m) => Ok(m.create_child_cgroup(name, subsystems)?.any()),
            AnyCgroupManager::V2(m) => Ok(m.create_child_cgroup(name, subsystems)?.any()),
        }
    }

    fn attach_task(
        &self,
        id: Pid,
        subsystem: ControllerType,
        task_type: TaskType,
    ) -> Result<(), Self::Error> {
        match self {
            AnyCgroupManager::V1(m) => Ok(m.attach_task(id, subsystem, task_type)?),
            AnyCgroupManager::V2(m) => Ok(m.attach_task(id, subsystem, task_type)?),
        }
    }

    fn get_cgroup_threads(&self, filter: Option<ThreadFilter>) -> Result<Vec<Pid>, Self::Error> {
        match self {
            AnyCgroupManager::V1(m) => Ok(m.get_cgroup_threads(filter)?),
            AnyCgroupManager::V2(m) => Ok(m.get_cgroup_threads(filter)?),
        }
    }

    fn make_threaded(&self) -> Result<(), Self::Error> {
        match self {
            AnyCgroupManager::V1(m) => Ok(m.make_threaded()?),
            AnyCgroupManager::V2(m) => Ok(m.make_threaded()?),
        }
    }
}

#[derive(Debug)]
pub enum CgroupSetup {
    Hybrid,
    Legacy,
    Unified,
}

impl CgroupSetup {
    /// Hybrid hosts carry an empty unified hierarchy, resources are only controlled through v1
    pub fn version(&self) -> CgroupVersion {
        match self {
            CgroupSetup::Hybrid | CgroupSetup::Legacy => CgroupVersion::V1,
            CgroupSetup::Unified => CgroupVersion::V2,
        }
    }
}

impl Display for CgroupSetup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let print = match self {
            CgroupSetup::Hybrid => "hybrid",
            CgroupSetup::Legacy => "legacy",
            CgroupSetup::Unified => "unified",
        };

        write!(f, "{print}")
    }
}

#[derive(thiserror::Error, Debug)]
pub enum WrappedIoError {
    #[error("failed to open {path}: {err}")]
    Open { err: std::io::Error, path: PathBuf },
    #[error("failed to write {data} to {path}: {err}")]
    Write {
        err: std::io::Error,
        path: PathBuf,
        data: String,
    },
    #[error("failed to read {path}: {err}")]
    Read { err: std::io::Error, path: PathBuf },
    #[error("failed to create dir {path}: {err}")]
    CreateDir { err: std::io::Error, path: PathBuf },
    #[error("at {path}: {err}")]
    Other { err: std::io::Error, path: PathBuf },
}

impl WrappedIoError {
    pub fn inner(&self) -> &std::io::Error {
        match self {
            WrappedIoError::Open { err, .. } => err,
            WrappedIoError::Write { err, .. } => err,
            WrappedIoError::Read { err, .. } => err,
            WrappedIoError::CreateDir { err, .. } => err,
            WrappedIoError::Other { err, .. } => err,
        }
    }
}

#[inline]
pub fn write_cgroup_file_str<P: AsRef<Path>>(path: P, data: &str) -> Result<(), WrappedIoError> {
    let path = path.as_ref();
    tracing::debug!(?path, data, "write cgroup file");

    fs::OpenOptions::new()
        .create(false)
        .write(true)
        .truncate(false)
        .open(path)
        .wrap_open(path)?
        .write_all(data.as_bytes())
        .wrap_write(path, data)?;

    Ok(())
}

#[inline]
pub fn write_cgroup_file<P: AsRef<Path>, T: ToString>(
    path: P,
    data: T,
) -> Result<(), WrappedIoError> {
    write_cgroup_file_str(path, &data.to_string())
}

#[inline]
pub fn read_cgroup_file<P: AsRef<Path>>(path: P) -> Result<String, WrappedIoError> {
    let path = path.as_ref();
    fs::read_to_string(path).wrap_read(path)
}

/// Reads a membership file such as `cgroup.threads` into a list of ids
pub fn read_task_ids<P: AsRef<Path>>(path: P) -> Result<Vec<Pid>, WrappedIoError> {
    let path = path.as_ref();
    read_cgroup_file(path)?
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            line.parse::<i32>()
                .map(Pid::from_raw)
                .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))
                .wrap_other(path)
        })
        .collect()
}

#[derive(thiserror::Error, Debug)]
pub enum GetCgroupSetupError {
    #[error("io error: {0}")]
    WrappedIo(#[from] WrappedIoError),
    #[error("cgroup root {0} does not exist")]
    NonDefault(PathBuf),
    #[error("failed to detect cgroup setup")]
    FailedToDetect,
}

/// Determines the cgroup setup of the system. Systems typically have one of
/// three setups:
/// - Unified: Pure cgroup v2 system.
/// - Legacy: Pure cgroup v1 system.
/// - Hybrid: Hybrid is basically a cgroup v1 system, except for
///   an additional unified hierarchy which doesn't have any
///   controllers attached. Resource control can purely be achieved
///   through the cgroup v1 hierarchy, not through the cgroup v2 hierarchy.
pub fn get_cgroup_setup_with_root(root_path: &Path) -> Result<CgroupSetup, GetCgroupSetupError> {
    if !root_path.exists() {
        return Err(GetCgroupSetupError::NonDefault(root_path.to_path_buf()));
    }

    // If the filesystem is of type cgroup2, the system is in unified mode.
    // If the filesystem is tmpfs instead the system is either in legacy or
    // hybrid mode. If a cgroup2 filesystem has been mounted under the "unified"
    // folder we are in hybrid mode, otherwise we are in legacy mode.
    let stat = statfs(root_path)
        .map_err(std::io::Error::from)
        .wrap_other(root_path)?;
    if stat.filesystem_type() == CGROUP2_SUPER_MAGIC {
        return Ok(CgroupSetup::Unified);
    }

    if stat.filesystem_type() == TMPFS_MAGIC {
        let unified = root_path.join("unified");
        if unified.exists() {
            let stat = statfs(&unified)
                .map_err(std::io::Error::from)
                .wrap_other(&unified)?;
            if stat.filesystem_type() == CGROUP2_SUPER_MAGIC {
                return Ok(CgroupSetup::Hybrid);
            }
        }

        return Ok(CgroupSetup::Legacy);
    }

    Err(GetCgroupSetupError::FailedToDetect)
}

pub fn get_cgroup_setup() -> Result<CgroupSetup, GetCgroupSetupError> {
    get_cgroup_setup_with_root(Path::new(DEFAULT_CGROUP_ROOT))
}

pub(crate) trait PathBufExt {
    fn join_safely<P: AsRef<Path>>(&self, path: P) -> Result<PathBuf, JoinSafelyError>;
}

#[derive(thiserror::Error, Debug)]
pub enum JoinSafelyError {
    #[error("failed to strip prefix from {path}: {err}")]
    StripPrefix {
        err: StripPrefixError,
        path: PathBuf,
    },
}

impl PathBufExt for PathBuf {
    fn join_safely<P: AsRef<Path>>(&self, path: P) -> Result<PathBuf, JoinSafelyError> {
        let path = path.as_ref();
        if path.is_relative() {
            return Ok(self.join(path));
        }

        let stripped = path
            .strip_prefix("/")
            .map_err(|err| JoinSafelyError::StripPrefix {
                err,
                path: path.to_path_buf(),
            })?;
        Ok(self.join(stripped))
    }
}

pub(crate) trait WrapIoResult {
    type Target;

    fn wrap_create_dir<P: Into<PathBuf>>(self, path: P) -> Result<Self::Target, WrappedIoError>;
    fn wrap_read<P: Into<PathBuf>>(self, path: P) -> Result<Self::Target, WrappedIoError>;
    fn wrap_open<P: Into<PathBuf>>(self, path: P) -> Result<Self::Target, WrappedIoError>;
    fn wrap_write<P: Into<PathBuf>, D: Into<String>>(
        self,
        path: P,
        data: D,
    ) -> Result<Self::Target, WrappedIoError>;
    fn wrap_other<P: Into<PathBuf>>(self, path: P) -> Result<Self::Target, WrappedIoError>;
}

impl<T> WrapIoResult for Result<T, std::io::Error> {
    type Target = T;

    fn wrap_create_dir<P: Into<PathBuf>>(self, path: P) -> Result<Self::Target, WrappedIoError> {
        self.map_err(|err| WrappedIoError::CreateDir {
            err,
            path: path.into(),
        })
    }

    fn wrap_read<P: Into<PathBuf>>(self, path: P) -> Result<Self::Target, WrappedIoError> {
        self.map_err(|err| WrappedIoError::Read {
            err,
            path: path.into(),
        })
    }

    fn wrap_open<P: Into<PathBuf>>(self, path: P) -> Result<Self::Target, WrappedIoError> {
        self.map_err(|err| WrappedIoError::Open {
            err,
            path: path.into(),
        })
    }

    fn wrap_write<P: Into<PathBuf>, D: Into<String>>(
        self,
        path: P,
        data: D,
    ) -> Result<Self::Target, WrappedIoError> {
        self.map_err(|err| WrappedIoError::Write {
            err,
            path: path.into(),
            data: data.into(),
        })
    }

    fn wrap_other<P: Into<PathBuf>>(self, path: P) -> Result<Self::Target, WrappedIoError> {
        self.map_err(|err| WrappedIoError::Other {
            err,
            path: path.into(),
        })
    }
}
