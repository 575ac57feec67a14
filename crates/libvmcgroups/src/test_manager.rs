use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use nix::unistd::Pid;
use oci_spec::runtime::LinuxResources;

use crate::common::{CgroupManager, CgroupVersion, TaskType, ThreadFilter};
use crate::controller_type::ControllerType;
use crate::v2;

/// Mutation recorded by a [`TestManager`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Set { path: PathBuf },
    SetCpuSet { path: PathBuf, cpus: Vec<usize> },
    SetCpuWeight { path: PathBuf, weight: u64 },
    CreateChild { path: PathBuf },
    AttachTask { path: PathBuf, id: Pid, task_type: TaskType },
    MakeThreaded { path: PathBuf },
}

#[derive(Debug, Default)]
struct State {
    events: Vec<Event>,
    cpu_sets: HashMap<PathBuf, Vec<usize>>,
    cpu_weights: HashMap<PathBuf, u64>,
    threads: HashMap<PathBuf, Vec<(Pid, String)>>,
    names: HashMap<Pid, String>,
}

/// In-memory cgroup tree. Managers created from one another share the tree and
/// the event log.
#[derive(Debug, Clone)]
pub struct TestManager {
    path: PathBuf,
    state: Rc<RefCell<State>>,
}

impl TestManager {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            state: Rc::default(),
        }
    }

    /// Another cgroup of the same tree
    pub fn sibling<P: Into<PathBuf>>(&self, path: P) -> Self {
        Self {
            path: path.into(),
            state: self.state.clone(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn with_cpu_set(self, cpus: &[usize]) -> Self {
        self.state
            .borrow_mut()
            .cpu_sets
            .insert(self.path.clone(), cpus.to_vec());
        self
    }

    /// Places a task owned by the named executable into this cgroup without
    /// recording an event
    pub fn with_thread(self, id: i32, executable: &str) -> Self {
        let id = Pid::from_raw(id);
        {
            let mut state = self.state.borrow_mut();
            state.names.insert(id, executable.to_owned());
            state
                .threads
                .entry(self.path.clone())
                .or_default()
                .push((id, executable.to_owned()));
        }
        self
    }

    pub fn events(&self) -> Vec<Event> {
        self.state.borrow().events.clone()
    }

    pub fn thread_ids(&self) -> Vec<Pid> {
        self.state
            .borrow()
            .threads
            .get(&self.path)
            .map(|threads| threads.iter().map(|(id, _)| *id).collect())
            .unwrap_or_default()
    }

    fn record(&self, event: Event) {
        self.state.borrow_mut().events.push(event);
    }
}

impl CgroupManager for TestManager {
    type Error = Infallible;

    fn set(&self, _resources: &LinuxResources) -> Result<(), Infallible> {
        self.record(Event::Set {
            path: self.path.clone(),
        });
        Ok(())
    }

    fn get_base_path_to_host_subsystem(
        &self,
        _subsystem: ControllerType,
    ) -> Result<PathBuf, Infallible> {
        Ok(self.path.clone())
    }

    fn cgroup_paths(&self) -> BTreeMap<String, PathBuf> {
        BTreeMap::from([(v2::manager::UNIFIED.to_owned(), self.path.clone())])
    }

    fn version(&self) -> CgroupVersion {
        CgroupVersion::V2
    }

    fn get_cpu_set(&self) -> Result<Vec<usize>, Infallible> {
        Ok(self
            .state
            .borrow()
            .cpu_sets
            .get(&self.path)
            .cloned()
            .unwrap_or_default())
    }

    fn set_cpu_set(&self, cpus: &[usize]) -> Result<(), Infallible> {
        self.record(Event::SetCpuSet {
            path: self.path.clone(),
            cpus: cpus.to_vec(),
        });
        self.state
            .borrow_mut()
            .cpu_sets
            .insert(self.path.clone(), cpus.to_vec());
        Ok(())
    }

    fn get_cpu_weight(&self) -> Result<u64, Infallible> {
        Ok(self
            .state
            .borrow()
            .cpu_weights
            .get(&self.path)
            .copied()
            .unwrap_or(100))
    }

    fn set_cpu_weight(&self, weight: u64) -> Result<(), Infallible> {
        self.record(Event::SetCpuWeight {
            path: self.path.clone(),
            weight,
        });
        self.state
            .borrow_mut()
            .cpu_weights
            .insert(self.path.clone(), weight);
        Ok(())
    }

    fn create_child_cgroup(
        &self,
        name: &str,
        _subsystems: &[ControllerType],
    ) -> Result<Self, Infallible> {
        let child = self.sibling(self.path.join(name));
        self.record(Event::CreateChild {
            path: child.path.clone(),
        });
        Ok(child)
    }

    fn attach_task(
        &self,
        id: Pid,
        _subsystem: ControllerType,
        task_type: TaskType,
    ) -> Result<(), Infallible> {
        self.record(Event::AttachTask {
            path: self.path.clone(),
            id,
            task_type,
        });

        let mut state = self.state.borrow_mut();
        for threads in state.threads.values_mut() {
            threads.retain(|(thread, _)| *thread != id);
        }
        let name = state.names.get(&id).cloned().unwrap_or_default();
        state
            .threads
            .entry(self.path.clone())
            .or_default()
            .push((id, name));
        Ok(())
    }

    fn get_cgroup_threads(&self, filter: Option<ThreadFilter>) -> Result<Vec<Pid>, Infallible> {
        let state = self.state.borrow();
        let threads = state.threads.get(&self.path).map(Vec::as_slice).unwrap_or(&[]);
        Ok(threads
            .iter()
            .filter(|(_, name)| filter.map_or(true, |f| f(name)))
            .map(|(id, _)| *id)
            .collect())
    }

    fn make_threaded(&self) -> Result<(), Infallible> {
        self.record(Event::MakeThreaded {
            path: self.path.clone(),
        });
        Ok(())
    }
}
