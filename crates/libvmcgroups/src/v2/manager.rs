use std::{
    collections::{BTreeMap, HashMap},
    fs,
    path::{Path, PathBuf},
    sync::PoisonError,
};

use nix::unistd::Pid;
use oci_spec::runtime::LinuxResources;

use super::util::{self, CgroupType, ParseCgroupTypeError, CGROUP_THREADS, CGROUP_TYPE};
use crate::{
    common::{
        self, AnyCgroupManager, CgroupManager, CgroupVersion, ManagerContext, TaskType,
        ThreadFilter, WrapIoResult, WrappedIoError, CGROUP_PROCS,
    },
    controller_type::ControllerType,
    cpuset::{self, ParseCpuSetError},
    devices::{self, DeviceRulesError, MergeRulesError},
    process::{self, ProcessError},
    trampoline::{ApplyRequest, TrampolineError},
};

pub const CPUSET_CPUS: &str = "cpuset.cpus";
pub const CPUSET_CPUS_EFFECTIVE: &str = "cpuset.cpus.effective";
pub const CPU_WEIGHT: &str = "cpu.weight";
pub const CPU_WEIGHT_MAX: u64 = 10000;
/// Key of the single entry in the paths of a v2 cgroup
pub const UNIFIED: &str = "unified";

/// Directory name crun uses for the inner cgroup of a container scope
const CRUN_INNER_CGROUP: &str = "container";

#[derive(thiserror::Error, Debug)]
pub enum V2ManagerError {
    #[error("io error: {0}")]
    WrappedIo(#[from] WrappedIoError),
    #[error("failed to parse cpu set from {path}: {err}")]
    ParseCpuSet {
        err: ParseCpuSetError,
        path: PathBuf,
    },
    #[error("unexpected cpu weight {value:?} in {path}")]
    ParseCpuWeight { path: PathBuf, value: String },
    #[error("invalid cpu weight {0}, expected a value between 1 and 10000")]
    InvalidCpuWeight(u64),
    #[error("failed to read cgroup type from {path}: {err}")]
    ParseCgroupType {
        err: ParseCgroupTypeError,
        path: PathBuf,
    },
    #[error("{path} is {observed} after switching it to {expected}")]
    StateMismatch {
        path: PathBuf,
        expected: String,
        observed: String,
    },
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

/// Manager bound to one directory of the unified hierarchy
#[derive(Debug, Clone)]
pub struct Manager {
    path: PathBuf,
    context: ManagerContext,
}

impl Manager {
    /// `path` is the cgroup directory as seen by this process, e.g.
    /// `/sys/fs/cgroup/kubepods.slice/.../container`
    pub fn new(path: PathBuf, context: ManagerContext) -> Self {
        tracing::info!(?path, "created cgroup v2 manager");
        Self { path, context }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn any(self) -> AnyCgroupManager {
        AnyCgroupManager::V2(self)
    }

    pub fn cgroup_type(&self) -> Result<CgroupType, V2ManagerError> {
        let path = self.path.join(CGROUP_TYPE);
        common::read_cgroup_file(&path)?
            .parse()
            .map_err(|err| V2ManagerError::ParseCgroupType { err, path })
    }

    fn subsystem_paths(&self) -> HashMap<String, PathBuf> {
        let mut paths = HashMap::from([("target".to_owned(), self.path.clone())]);

        // crun configures both the scope and the inner cgroup
        if let Some(parent) = self.path.parent() {
            let inner = self.path.file_name().is_some_and(|n| n == CRUN_INNER_CGROUP);
            let scope = parent
                .file_name()
                .is_some_and(|n| n.to_string_lossy().ends_with(".scope"));
            if inner && scope {
                paths.insert("parent".to_owned(), parent.to_path_buf());
            }
        }

        paths
    }
}

impl CgroupManager for Manager {
    type Error = V2ManagerError;

    fn set(&self, resources: &LinuxResources) -> Result<(), Self::Error> {
        let entry = self.context.rule_store.entry(&self.path);
        let mut tracked = entry.lock().unwrap_or_else(PoisonError::into_inner);

        let current = match tracked.as_ref() {
            Some(rules) => rules.clone(),
            None => devices::default_device_rules(CgroupVersion::V2)?,
        };
        let merged = devices::merge_device_rules(&current, resources.devices().as_deref())?;
        tracing::debug!(path = ?self.path, rules = merged.len(), "merged device rules");

        let mut to_apply = resources.clone();
        to_apply.set_devices(Some(merged.clone()));

        let request = ApplyRequest {
            resources: to_apply,
            subsystem_paths: self.subsystem_paths(),
            rootless: self.context.rootless,
            version: CgroupVersion::V2,
        };
        self.context.applier.apply(&request)?;

        *tracked = Some(merged);
        Ok(())
    }

    fn get_base_path_to_host_subsystem(
        &self,
        _subsystem: ControllerType,
    ) -> Result<PathBuf, Self::Error> {
        Ok(self.path.clone())
    }

    fn cgroup_paths(&self) -> BTreeMap<String, PathBuf> {
        BTreeMap::from([(UNIFIED.to_owned(), self.path.clone())])
    }

    fn version(&self) -> CgroupVersion {
        CgroupVersion::V2
    }

    fn get_cpu_set(&self) -> Result<Vec<usize>, Self::Error> {
        let path = self.path.join(CPUSET_CPUS_EFFECTIVE);
        let content = common::read_cgroup_file(&path)?;
        cpuset::parse_cpu_set(&content).map_err(|err| V2ManagerError::ParseCpuSet { err, path })
    }

    fn set_cpu_set(&self, cpus: &[usize]) -> Result<(), Self::Error> {
        common::write_cgroup_file_str(
            self.path.join(CPUSET_CPUS),
            &cpuset::format_cpu_set(cpus),
        )?;
        Ok(())
    }

    fn get_cpu_weight(&self) -> Result<u64, Self::Error> {
        let path = self.path.join(CPU_WEIGHT);
        let content = common::read_cgroup_file(&path)?;
        let value = content.trim();
        value
            .parse()
            .map_err(|_| V2ManagerError::ParseCpuWeight {
                path,
                value: value.to_owned(),
            })
    }

    fn set_cpu_weight(&self, weight: u64) -> Result<(), Self::Error> {
        if weight == 0 || weight > CPU_WEIGHT_MAX {
            return Err(V2ManagerError::InvalidCpuWeight(weight));
        }

        common::write_cgroup_file(self.path.join(CPU_WEIGHT), weight)?;
        Ok(())
    }

    fn create_child_cgroup(
        &self,
        name: &str,
        subsystems: &[ControllerType],
    ) -> Result<Self, Self::Error> {
        let child = self.path.join(name);
        if child.exists() {
            tracing::debug!(?child, "child cgroup already exists");
            return Ok(Self::new(child, self.context.clone()));
        }

        util::reconcile_subtree_control(&self.path, subsystems)?;
        fs::create_dir(&child).wrap_create_dir(&child)?;

        Ok(Self::new(child, self.context.clone()))
    }

    fn attach_task(
        &self,
        id: Pid,
        _subsystem: ControllerType,
        task_type: TaskType,
    ) -> Result<(), Self::Error> {
        let file = match task_type {
            TaskType::Thread => CGROUP_THREADS,
            TaskType::Process => CGROUP_PROCS,
        };

        common::write_cgroup_file(self.path.join(file), id)?;
        Ok(())
    }

    fn get_cgroup_threads(&self, filter: Option<ThreadFilter>) -> Result<Vec<Pid>, Self::Error> {
        let ids = common::read_task_ids(self.path.join(CGROUP_THREADS))?;
        Ok(process::filter_tasks(&self.context.proc_root, ids, filter)?)
    }

    fn make_threaded(&self) -> Result<(), Self::Error> {
        let current = self.cgroup_type()?;
        if current == CgroupType::Threaded {
            return Ok(());
        }

        tracing::debug!(path = ?self.path, %current, "switching cgroup to threaded");
        let path = self.path.join(CGROUP_TYPE);
        common::write_cgroup_file_str(&path, CgroupType::Threaded.as_ref())?;

        let observed = common::read_cgroup_file(&path)?;
        if observed.trim() != CgroupType::Threaded.as_ref() {
            return Err(V2ManagerError::StateMismatch {
                path,
                expected: CgroupType::Threaded.to_string(),
                observed: observed.trim().to_owned(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use anyhow::Result;
    use oci_spec::runtime::{
        LinuxDeviceCgroup, LinuxDeviceCgroupBuilder, LinuxDeviceType, LinuxResourcesBuilder,
    };

    use super::*;
    use crate::test::{context_with, mtime, set_fixture, set_old_mtime, set_proc_fixture};
    use crate::trampoline::MockResourceApplier;

    fn manager_at(path: &Path, proc_root: &Path) -> Manager {
        Manager::new(
            path.to_path_buf(),
            context_with(proc_root, MockResourceApplier::new()),
        )
    }

    fn kvm(allow: bool) -> LinuxDeviceCgroup {
        LinuxDeviceCgroupBuilder::default()
            .allow(allow)
            .typ(LinuxDeviceType::C)
            .major(10)
            .minor(232)
            .access("rwm")
            .build()
            .unwrap()
    }

    fn resources_with(devices: Vec<LinuxDeviceCgroup>) -> LinuxResources {
        LinuxResourcesBuilder::default()
            .devices(devices)
            .build()
            .unwrap()
    }

    #[test]
    fn test_set_merges_with_default_rules() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let captured = Arc::new(Mutex::new(None));
        let mut applier = MockResourceApplier::new();
        let sink = captured.clone();
        applier.expect_apply().times(1).returning(move |request| {
            *sink.lock().unwrap() = Some(request.clone());
            Ok(())
        });
        let manager = Manager::new(tmp.path().to_path_buf(), context_with(tmp.path(), applier));

        let resources = resources_with(vec![kvm(false)]);
        manager.set(&resources)?;

        let request = captured.lock().unwrap().take().expect("helper was called");
        let applied = request.resources.devices().clone().unwrap_or_default();
        let defaults = devices::default_device_rules(CgroupVersion::V2)?;
        assert_eq!(applied.len(), defaults.len());
        assert_eq!(applied[0], kvm(false));
        assert!(!applied[1..].contains(&kvm(true)));
        assert_eq!(request.version, CgroupVersion::V2);
        assert_eq!(request.subsystem_paths["target"], tmp.path());
        assert!(!request.subsystem_paths.contains_key("parent"));

        // the caller's copy is untouched
        assert_eq!(resources.devices().as_ref().map(Vec::len), Some(1));
        assert_eq!(manager.context.rule_store.rules(tmp.path()), Some(applied));
        Ok(())
    }

    #[test]
    fn test_set_keeps_previous_rules_after_helper_failure() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let mut applier = MockResourceApplier::new();
        let mut calls = 0;
        applier.expect_apply().times(2).returning(move |_| {
            calls += 1;
            if calls == 1 {
                Ok(())
            } else {
                Err(TrampolineError::Spawn {
                    helper: PathBuf::from("virt-chroot"),
                    err: std::io::Error::other("no such helper"),
                })
            }
        });
        let manager = Manager::new(tmp.path().to_path_buf(), context_with(tmp.path(), applier));

        manager.set(&resources_with(vec![kvm(true)]))?;
        let before = manager.context.rule_store.rules(tmp.path());

        let result = manager.set(&resources_with(vec![kvm(false)]));
        assert!(matches!(result, Err(V2ManagerError::Trampoline(_))));
        assert_eq!(manager.context.rule_store.rules(tmp.path()), before);
        Ok(())
    }

    #[test]
    fn test_concurrent_sets_on_one_cgroup_lose_no_rule() -> Result<()> {
        const SETS: i64 = 8;

        let tmp = tempfile::tempdir()?;
        let mut applier = MockResourceApplier::new();
        // widens the window between reading the tracked rules and committing them
        applier.expect_apply().times(SETS as usize).returning(|_| {
            std::thread::sleep(std::time::Duration::from_millis(5));
            Ok(())
        });
        let manager = Manager::new(tmp.path().to_path_buf(), context_with(tmp.path(), applier));

        let device = |major: i64| {
            LinuxDeviceCgroupBuilder::default()
                .allow(true)
                .typ(LinuxDeviceType::C)
                .major(major)
                .minor(0)
                .access("rwm")
                .build()
                .unwrap()
        };

        std::thread::scope(|s| {
            for i in 0..SETS {
                let manager = &manager;
                s.spawn(move || manager.set(&resources_with(vec![device(200 + i)])).unwrap());
            }
        });

        let tracked = manager
            .context
            .rule_store
            .rules(tmp.path())
            .expect("rules are tracked");
        let defaults = devices::default_device_rules(CgroupVersion::V2)?;
        assert_eq!(tracked.len(), defaults.len() + SETS as usize);
        for i in 0..SETS {
            assert!(tracked.contains(&device(200 + i)), "device {} was lost", 200 + i);
        }
        for rule in &defaults {
            assert!(tracked.contains(rule), "{rule:?} was lost");
        }
        Ok(())
    }

    #[test]
    fn test_set_without_devices_is_rejected() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let manager = manager_at(tmp.path(), tmp.path());

        let result = manager.set(&LinuxResources::default());
        assert!(matches!(
            result,
            Err(V2ManagerError::Merge(MergeRulesError::EmptyNewRules { .. }))
        ));
        Ok(())
    }

    #[test]
    fn test_subsystem_paths_for_crun_layout() {
        let manager = manager_at(
            Path::new("/sys/fs/cgroup/machine.slice/libpod-abc.scope/container"),
            Path::new("/proc"),
        );

        let paths = manager.subsystem_paths();
        assert_eq!(
            paths["parent"],
            PathBuf::from("/sys/fs/cgroup/machine.slice/libpod-abc.scope")
        );
    }

    #[test]
    fn test_cpu_set_round_trip() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let cpus = set_fixture(tmp.path(), CPUSET_CPUS, "")?;
        // the effective file mirrors what the kernel accepted
        std::os::unix::fs::symlink(&cpus, tmp.path().join(CPUSET_CPUS_EFFECTIVE))?;
        let manager = manager_at(tmp.path(), tmp.path());

        manager.set_cpu_set(&[2, 5, 7])?;
        assert_eq!(std::fs::read_to_string(&cpus)?, "2,5,7");
        assert_eq!(manager.get_cpu_set()?, vec![2, 5, 7]);
        Ok(())
    }

    #[test]
    fn test_get_cpu_set_malformed() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        set_fixture(tmp.path(), CPUSET_CPUS_EFFECTIVE, "0-a\n")?;
        let manager = manager_at(tmp.path(), tmp.path());

        assert!(matches!(
            manager.get_cpu_set(),
            Err(V2ManagerError::ParseCpuSet { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_cpu_weight() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        set_fixture(tmp.path(), CPU_WEIGHT, "100\n")?;
        let manager = manager_at(tmp.path(), tmp.path());

        assert_eq!(manager.get_cpu_weight()?, 100);
        set_fixture(tmp.path(), CPU_WEIGHT, "")?;
        manager.set_cpu_weight(250)?;
        assert_eq!(manager.get_cpu_weight()?, 250);

        assert!(matches!(
            manager.set_cpu_weight(0),
            Err(V2ManagerError::InvalidCpuWeight(0))
        ));
        assert!(manager.set_cpu_weight(CPU_WEIGHT_MAX + 1).is_err());
        Ok(())
    }

    #[test]
    fn test_cgroup_paths_is_the_unified_directory() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let manager = manager_at(tmp.path(), tmp.path());

        assert_eq!(
            manager.any().cgroup_paths(),
            BTreeMap::from([(UNIFIED.to_owned(), tmp.path().to_path_buf())])
        );
        Ok(())
    }

    #[test]
    fn test_create_child_cgroup() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let subtree = set_fixture(tmp.path(), util::CGROUP_SUBTREE_CONTROL, "")?;
        let manager = manager_at(tmp.path(), tmp.path());

        let child = manager.create_child_cgroup("housekeeping", &[ControllerType::CpuSet])?;
        assert_eq!(child.path(), tmp.path().join("housekeeping"));
        assert!(child.path().is_dir());
        assert_eq!(std::fs::read_to_string(subtree)?, "+cpuset");
        Ok(())
    }

    #[test]
    fn test_create_child_cgroup_drops_other_controllers() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let subtree = set_fixture(tmp.path(), util::CGROUP_SUBTREE_CONTROL, "misc\n")?;
        let manager = manager_at(tmp.path(), tmp.path());

        manager.create_child_cgroup("housekeeping", &[ControllerType::CpuSet])?;
        assert_eq!(std::fs::read_to_string(subtree)?, "-misc +cpuset");
        Ok(())
    }

    #[test]
    fn test_create_existing_child_cgroup_touches_nothing() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        std::fs::create_dir(tmp.path().join("housekeeping"))?;
        // without a subtree_control file any write or read would fail
        let manager = manager_at(tmp.path(), tmp.path());

        let first = manager.create_child_cgroup("housekeeping", &[ControllerType::CpuSet])?;
        let second = manager.create_child_cgroup("housekeeping", &[ControllerType::CpuSet])?;
        assert_eq!(first.path(), second.path());
        assert!(!tmp.path().join(util::CGROUP_SUBTREE_CONTROL).exists());
        Ok(())
    }

    #[test]
    fn test_attach_task() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let threads = set_fixture(tmp.path(), CGROUP_THREADS, "")?;
        let procs = set_fixture(tmp.path(), CGROUP_PROCS, "")?;
        let manager = manager_at(tmp.path(), tmp.path());

        manager.attach_task(Pid::from_raw(1234), ControllerType::CpuSet, TaskType::Thread)?;
        assert_eq!(std::fs::read_to_string(&threads)?, "1234");
        assert_eq!(std::fs::read_to_string(&procs)?, "");

        manager.attach_task(Pid::from_raw(42), ControllerType::Memory, TaskType::Process)?;
        assert_eq!(std::fs::read_to_string(&procs)?, "42");
        Ok(())
    }

    #[test]
    fn test_get_cgroup_threads() -> Result<()> {
        let cgroup = tempfile::tempdir()?;
        let proc_root = tempfile::tempdir()?;
        set_proc_fixture(proc_root.path(), 10, 1, "qemu-kvm", &[])?;
        set_proc_fixture(proc_root.path(), 11, 10, "CPU 0/KVM", &[])?;
        set_proc_fixture(proc_root.path(), 12, 10, "CPU 1/KVM", &[])?;
        // 13 exits before it is resolved
        set_fixture(cgroup.path(), CGROUP_THREADS, "10\n11\n12\n13\n")?;
        let manager = manager_at(cgroup.path(), proc_root.path());

        assert_eq!(manager.get_cgroup_threads(None)?.len(), 4);

        let vcpus = manager
            .get_cgroup_threads(Some(&|name: &str| name.contains("CPU ") && name.contains("KVM")))?;
        assert_eq!(vcpus, vec![Pid::from_raw(11), Pid::from_raw(12)]);

        let none = manager.get_cgroup_threads(Some(&|name: &str| name == "libvirtd"))?;
        assert!(none.is_empty());
        Ok(())
    }

    #[test]
    fn test_make_threaded() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let type_file = set_fixture(tmp.path(), CGROUP_TYPE, "domain\n")?;
        let manager = manager_at(tmp.path(), tmp.path());

        manager.make_threaded()?;
        assert_eq!(std::fs::read_to_string(type_file)?, "threaded");
        assert_eq!(manager.cgroup_type()?, CgroupType::Threaded);
        Ok(())
    }

    #[test]
    fn test_make_threaded_is_idempotent() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let type_file = set_fixture(tmp.path(), CGROUP_TYPE, "threaded\n")?;
        let old = set_old_mtime(&type_file)?;
        let manager = manager_at(tmp.path(), tmp.path());

        manager.make_threaded()?;
        assert_eq!(mtime(&type_file)?, old);
        Ok(())
    }

    #[test]
    fn test_make_threaded_not_honored() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        // a fixture file keeps the tail of the old value, like a kernel refusing the switch
        set_fixture(tmp.path(), CGROUP_TYPE, "domain invalid")?;
        let manager = manager_at(tmp.path(), tmp.path());

        match manager.make_threaded() {
            Err(V2ManagerError::StateMismatch {
                expected, observed, ..
            }) => {
                assert_eq!(expected, "threaded");
                assert_eq!(observed, "threadednvalid");
            }
            other => panic!("expected a state mismatch, got {other:?}"),
        }
        Ok(())
    }
}
