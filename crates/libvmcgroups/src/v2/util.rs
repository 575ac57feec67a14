use std::{fmt::Display, path::Path, str::FromStr};

use crate::common::{self, WrappedIoError};
use crate::controller_type::ControllerType;

pub const CGROUP_SUBTREE_CONTROL: &str = "cgroup.subtree_control";
pub const CGROUP_TYPE: &str = "cgroup.type";
pub const CGROUP_THREADS: &str = "cgroup.threads";

/// Value of `cgroup.type`. The only transition driven here is domain to threaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgroupType {
    Domain,
    Threaded,
    DomainThreaded,
    DomainInvalid,
}

impl AsRef<str> for CgroupType {
    fn as_ref(&self) -> &str {
        match self {
            CgroupType::Domain => "domain",
            CgroupType::Threaded => "threaded",
            CgroupType::DomainThreaded => "domain threaded",
            CgroupType::DomainInvalid => "domain invalid",
        }
    }
}

impl Display for CgroupType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_ref())
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("unknown cgroup type {0:?}")]
pub struct ParseCgroupTypeError(pub String);

impl FromStr for CgroupType {
    type Err = ParseCgroupTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "domain" => Ok(CgroupType::Domain),
            "threaded" => Ok(CgroupType::Threaded),
            "domain threaded" => Ok(CgroupType::DomainThreaded),
            "domain invalid" => Ok(CgroupType::DomainInvalid),
            other => Err(ParseCgroupTypeError(other.to_owned())),
        }
    }
}

/// Reads the controllers delegated to the children of the cgroup. Names are kept
/// as the kernel lists them, including controllers unknown to [`ControllerType`].
pub fn get_subtree_control<P: AsRef<Path>>(
    cgroup_path: P,
) -> Result<Vec<String>, WrappedIoError> {
    let content = common::read_cgroup_file(cgroup_path.as_ref().join(CGROUP_SUBTREE_CONTROL))?;
    Ok(content.split_whitespace().map(str::to_owned).collect())
}

/// Undelegates every controller that is not requested and delegates the requested
/// ones that are missing, in a single write. A threaded child can only be created
/// once controllers that do not support threaded mode are gone from the subtree.
pub fn reconcile_subtree_control<P: AsRef<Path>>(
    cgroup_path: P,
    requested: &[ControllerType],
) -> Result<(), WrappedIoError> {
    let cgroup_path = cgroup_path.as_ref();
    let current = get_subtree_control(cgroup_path)?;

    let removed = current
        .iter()
        .filter(|name| !requested.iter().any(|c| c.as_ref() == name.as_str()))
        .map(|name| format!("-{name}"));
    let added = requested
        .iter()
        .filter(|c| !current.iter().any(|name| name == c.as_ref()))
        .map(|c| format!("+{c}"));
    let changes: Vec<String> = removed.chain(added).collect();
    if changes.is_empty() {
        return Ok(());
    }

    tracing::debug!(path = ?cgroup_path, ?changes, "reconciling subtree control");
    common::write_cgroup_file_str(cgroup_path.join(CGROUP_SUBTREE_CONTROL), &changes.join(" "))
}

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use super::*;
    use crate::test::set_fixture;

    #[test]
    fn test_parse_cgroup_type() {
        assert_eq!("domain\n".parse(), Ok(CgroupType::Domain));
        assert_eq!("threaded".parse(), Ok(CgroupType::Threaded));
        assert_eq!("domain threaded".parse(), Ok(CgroupType::DomainThreaded));
        assert_eq!("domain invalid".parse(), Ok(CgroupType::DomainInvalid));
        assert_eq!(
            "threadedinvalid".parse::<CgroupType>(),
            Err(ParseCgroupTypeError("threadedinvalid".to_owned()))
        );
    }

    #[test]
    fn test_get_subtree_control() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        set_fixture(tmp.path(), CGROUP_SUBTREE_CONTROL, "cpuset cpu io memory misc pids\n")?;

        let controllers = get_subtree_control(tmp.path())?;
        assert_eq!(controllers, ["cpuset", "cpu", "io", "memory", "misc", "pids"]);
        Ok(())
    }

    #[test]
    fn test_reconcile_undelegates_unrequested_controllers() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        // misc has no ControllerType, it still has to go
        let path = set_fixture(tmp.path(), CGROUP_SUBTREE_CONTROL, "cpuset misc memory\n")?;

        reconcile_subtree_control(tmp.path(), &[ControllerType::CpuSet, ControllerType::Pids])?;
        assert_eq!(std::fs::read_to_string(path)?, "-misc -memory +pids");
        Ok(())
    }

    #[test]
    fn test_reconcile_with_nothing_to_do() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = set_fixture(tmp.path(), CGROUP_SUBTREE_CONTROL, "cpuset")?;

        reconcile_subtree_control(tmp.path(), &[ControllerType::CpuSet])?;
        assert_eq!(std::fs::read_to_string(path)?, "cpuset");
        Ok(())
    }

    #[test]
    fn test_reconcile_delegates_missing_controller() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = set_fixture(tmp.path(), CGROUP_SUBTREE_CONTROL, "")?;

        reconcile_subtree_control(tmp.path(), &[ControllerType::CpuSet])?;
        assert_eq!(std::fs::read_to_string(path)?, "+cpuset");
        Ok(())
    }

    #[test]
    fn test_reconcile_missing_file() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        assert!(reconcile_subtree_control(tmp.path(), &[ControllerType::CpuSet]).is_err());
        Ok(())
    }
}
