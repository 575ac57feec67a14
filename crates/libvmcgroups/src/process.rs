//! Process and thread discovery through procfs.
use std::{collections::HashSet, path::Path};

use nix::unistd::Pid;
use procfs::{
    process::{all_processes_with_root, Process},
    ProcError,
};

use crate::common::ThreadFilter;

#[derive(thiserror::Error, Debug)]
pub enum ProcessError {
    #[error("failed to list processes under {path}: {err}")]
    List {
        path: std::path::PathBuf,
        err: ProcError,
    },
    #[error("failed to inspect task {pid}: {err}")]
    Inspect { pid: Pid, err: ProcError },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: Pid,
    pub ppid: Pid,
    /// Executable name as reported by the kernel, truncated to 15 bytes
    pub executable: String,
}

/// The task exited between being listed and being inspected
fn vanished(err: &ProcError) -> bool {
    match err {
        ProcError::NotFound(_) | ProcError::Incomplete(_) => true,
        ProcError::Io(err, _) => err.raw_os_error() == Some(nix::libc::ESRCH),
        _ => false,
    }
}

fn process_info(process: &Process) -> Result<ProcessInfo, ProcError> {
    let stat = process.stat()?;
    Ok(ProcessInfo {
        pid: Pid::from_raw(stat.pid),
        ppid: Pid::from_raw(stat.ppid),
        executable: stat.comm,
    })
}

/// Lists every process visible under the procfs root, skipping processes that
/// exit while being read
pub fn list_processes(proc_root: &Path) -> Result<Vec<ProcessInfo>, ProcessError> {
    let processes = all_processes_with_root(proc_root).map_err(|err| ProcessError::List {
        path: proc_root.to_path_buf(),
        err,
    })?;

    let mut infos = Vec::new();
    for process in processes {
        let info = process.and_then(|p| process_info(&p));
        match info {
            Ok(info) => infos.push(info),
            Err(err) if vanished(&err) => tracing::debug!(?err, "process vanished while listing"),
            Err(err) => {
                return Err(ProcessError::List {
                    path: proc_root.to_path_buf(),
                    err,
                })
            }
        }
    }

    Ok(infos)
}

pub fn child_processes(processes: &[ProcessInfo], ppid: Pid) -> Vec<ProcessInfo> {
    processes
        .iter()
        .filter(|p| p.ppid == ppid)
        .cloned()
        .collect()
}

/// Returns the first process whose executable name starts with the prefix.
/// An empty prefix matches nothing.
pub fn lookup_process_by_executable_prefix<'a>(
    processes: &'a [ProcessInfo],
    prefix: &str,
) -> Option<&'a ProcessInfo> {
    if prefix.is_empty() {
        return None;
    }

    processes.iter().find(|p| p.executable.starts_with(prefix))
}

/// Resolves the executable name owning a task id. Returns `None` when the task
/// no longer exists.
pub fn executable_name(proc_root: &Path, id: Pid) -> Result<Option<String>, ProcessError> {
    let stat = Process::new_with_root(proc_root.join(id.to_string())).and_then(|p| p.stat());
    match stat {
        Ok(stat) => Ok(Some(stat.comm)),
        Err(err) if vanished(&err) => Ok(None),
        Err(err) => Err(ProcessError::Inspect { pid: id, err }),
    }
}

/// Keeps the ids whose executable name passes the filter. Tasks that exit
/// before they are resolved are left out.
pub fn filter_tasks(
    proc_root: &Path,
    ids: Vec<Pid>,
    filter: Option<ThreadFilter>,
) -> Result<Vec<Pid>, ProcessError> {
    let Some(filter) = filter else {
        return Ok(ids);
    };

    let mut kept = Vec::with_capacity(ids.len());
    for id in ids {
        match executable_name(proc_root, id)? {
            Some(name) if filter(&name) => kept.push(id),
            Some(_) => {}
            None => tracing::warn!(%id, "task exited before its executable could be resolved"),
        }
    }

    Ok(kept)
}

/// Pids of the calling process and all its ancestors. The walk stops at the
/// first ancestor that cannot be read.
fn own_lineage(proc_root: &Path) -> HashSet<i32> {
    let mut lineage = HashSet::new();
    let mut pid = std::process::id() as i32;
    while pid > 0 && lineage.insert(pid) {
        match Process::new_with_root(proc_root.join(pid.to_string())).and_then(|p| p.stat()) {
            Ok(stat) => pid = stat.ppid,
            Err(_) => break,
        }
    }

    lineage
}

/// Finds a process with the needle as one of its command line arguments, e.g.
/// the unique duration handed to a `sleep` placeholder. The calling process and
/// its ancestors are never returned, they may carry the needle themselves.
pub fn find_process_by_cmdline(
    proc_root: &Path,
    needle: &str,
) -> Result<Option<Pid>, ProcessError> {
    let processes = all_processes_with_root(proc_root).map_err(|err| ProcessError::List {
        path: proc_root.to_path_buf(),
        err,
    })?;
    let lineage = own_lineage(proc_root);

    for process in processes {
        let process = match process {
            Ok(process) => process,
            Err(err) if vanished(&err) => continue,
            Err(err) => {
                return Err(ProcessError::List {
                    path: proc_root.to_path_buf(),
                    err,
                })
            }
        };
        if lineage.contains(&process.pid()) {
            continue;
        }

        let pid = Pid::from_raw(process.pid());
        match process.cmdline() {
            Ok(cmdline) if cmdline.iter().any(|arg| arg == needle) => return Ok(Some(pid)),
            Ok(_) => {}
            Err(err) if vanished(&err) => {}
            Err(err) => return Err(ProcessError::Inspect { pid, err }),
        }
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use super::*;
    use crate::test::set_proc_fixture;

    fn info(pid: i32, ppid: i32, executable: &str) -> ProcessInfo {
        ProcessInfo {
            pid: Pid::from_raw(pid),
            ppid: Pid::from_raw(ppid),
            executable: executable.to_owned(),
        }
    }

    fn processes() -> Vec<ProcessInfo> {
        vec![
            info(120, 1, "processA"),
            info(110, 1, "processC"),
            info(2222, 110, "processB"),
            info(3333, 110, "processD"),
        ]
    }

    #[test]
    fn test_child_processes() {
        assert!(child_processes(&[], Pid::from_raw(300)).is_empty());
        assert!(child_processes(&processes(), Pid::from_raw(300)).is_empty());
        assert_eq!(
            child_processes(&processes(), Pid::from_raw(110)),
            vec![info(2222, 110, "processB"), info(3333, 110, "processD")]
        );
    }

    #[test]
    fn test_lookup_by_prefix_finds_nothing() {
        assert_eq!(lookup_process_by_executable_prefix(&[], ""), None);
        assert_eq!(lookup_process_by_executable_prefix(&[], "processA"), None);
        assert_eq!(lookup_process_by_executable_prefix(&processes(), ""), None);
    }

    #[test]
    fn test_lookup_by_prefix_returns_first_match() {
        let mut processes = processes();
        assert_eq!(
            lookup_process_by_executable_prefix(&processes, "processA"),
            Some(&info(120, 1, "processA"))
        );

        processes.push(info(220, 100, "processA"));
        assert_eq!(
            lookup_process_by_executable_prefix(&processes, "processA"),
            Some(&info(120, 1, "processA"))
        );
    }

    #[test]
    fn test_list_processes() -> Result<()> {
        let proc_root = tempfile::tempdir()?;
        set_proc_fixture(proc_root.path(), 1, 0, "init", &["/sbin/init"])?;
        set_proc_fixture(proc_root.path(), 42, 1, "qemu-kvm", &["/usr/libexec/qemu-kvm"])?;

        let mut listed = list_processes(proc_root.path())?;
        listed.sort_by_key(|p| p.pid);
        assert_eq!(listed, vec![info(1, 0, "init"), info(42, 1, "qemu-kvm")]);
        Ok(())
    }

    #[test]
    fn test_executable_name() -> Result<()> {
        let proc_root = tempfile::tempdir()?;
        set_proc_fixture(proc_root.path(), 77, 42, "CPU 0/KVM", &[])?;

        assert_eq!(
            executable_name(proc_root.path(), Pid::from_raw(77))?,
            Some("CPU 0/KVM".to_owned())
        );
        assert_eq!(executable_name(proc_root.path(), Pid::from_raw(78))?, None);
        Ok(())
    }

    #[test]
    fn test_filter_tasks_excludes_vanished() -> Result<()> {
        let proc_root = tempfile::tempdir()?;
        set_proc_fixture(proc_root.path(), 10, 1, "qemu-kvm", &[])?;
        set_proc_fixture(proc_root.path(), 11, 10, "CPU 0/KVM", &[])?;
        let ids = vec![Pid::from_raw(10), Pid::from_raw(11), Pid::from_raw(12)];

        let vcpus = filter_tasks(
            proc_root.path(),
            ids.clone(),
            Some(&|name: &str| name.contains("CPU ")),
        )?;
        assert_eq!(vcpus, vec![Pid::from_raw(11)]);

        let all = filter_tasks(proc_root.path(), ids.clone(), None)?;
        assert_eq!(all, ids);
        Ok(())
    }

    #[test]
    fn test_find_process_by_cmdline() -> Result<()> {
        let proc_root = tempfile::tempdir()?;
        set_proc_fixture(proc_root.path(), 5, 1, "virt-launcher", &["virt-launcher"])?;
        set_proc_fixture(proc_root.path(), 9, 1, "sleep", &["sleep", "8131942913"])?;

        assert_eq!(
            find_process_by_cmdline(proc_root.path(), "8131942913")?,
            Some(Pid::from_raw(9))
        );
        assert_eq!(find_process_by_cmdline(proc_root.path(), "12345")?, None);
        Ok(())
    }

    #[test]
    fn test_find_process_by_cmdline_skips_callers_and_partial_matches() -> Result<()> {
        let proc_root = tempfile::tempdir()?;
        let own = std::process::id() as i32;
        set_proc_fixture(
            proc_root.path(),
            own,
            300,
            "vmcgroupctl",
            &["vmcgroupctl", "dedicated-cpus", "--fingerprint", "777"],
        )?;
        set_proc_fixture(proc_root.path(), 300, 1, "bash", &["bash", "run.sh", "777"])?;
        set_proc_fixture(proc_root.path(), 12, 1, "sh", &["sh", "-c", "sleep 5; echo 777"])?;
        set_proc_fixture(proc_root.path(), 13, 1, "sleep", &["sleep", "17770"])?;

        assert_eq!(find_process_by_cmdline(proc_root.path(), "777")?, None);

        set_proc_fixture(proc_root.path(), 9, 1, "sleep", &["sleep", "777"])?;
        assert_eq!(
            find_process_by_cmdline(proc_root.path(), "777")?,
            Some(Pid::from_raw(9))
        );
        Ok(())
    }
}
