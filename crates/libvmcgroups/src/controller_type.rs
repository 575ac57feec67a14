use std::fmt::Display;
use std::str::FromStr;

#[derive(Hash, PartialEq, Eq, Debug, Clone, Copy, PartialOrd, Ord)]
pub enum ControllerType {
    Cpu,
    CpuAcct,
    CpuSet,
    Memory,
    Devices,
    Freezer,
    NetworkClassifier,
    Blkio,
    Io,
    PerfEvent,
    NetworkPriority,
    HugeTlb,
    Pids,
    Rdma,
}

impl Display for ControllerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_ref())
    }
}

impl AsRef<str> for ControllerType {
    fn as_ref(&self) -> &str {
        match *self {
            Self::Cpu => "cpu",
            Self::CpuAcct => "cpuacct",
            Self::CpuSet => "cpuset",
            Self::Memory => "memory",
            Self::Devices => "devices",
            Self::Freezer => "freezer",
            Self::NetworkClassifier => "net_cls",
            Self::Blkio => "blkio",
            Self::Io => "io",
            Self::PerfEvent => "perf_event",
            Self::NetworkPriority => "net_prio",
            Self::HugeTlb => "hugetlb",
            Self::Pids => "pids",
            Self::Rdma => "rdma",
        }
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("unknown cgroup controller {0}")]
pub struct UnknownControllerError(pub String);

impl FromStr for ControllerType {
    type Err = UnknownControllerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CONTROLLERS
            .iter()
            .find(|c| c.as_ref() == s)
            .copied()
            .ok_or_else(|| UnknownControllerError(s.to_owned()))
    }
}

pub const CONTROLLERS: &[ControllerType] = &[
    ControllerType::Cpu,
    ControllerType::CpuAcct,
    ControllerType::CpuSet,
    ControllerType::Memory,
    ControllerType::Devices,
    ControllerType::Freezer,
    ControllerType::NetworkClassifier,
    ControllerType::Blkio,
    ControllerType::Io,
    ControllerType::PerfEvent,
    ControllerType::NetworkPriority,
    ControllerType::HugeTlb,
    ControllerType::Pids,
    ControllerType::Rdma,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_controller_names_round_trip() {
        for controller in CONTROLLERS {
            let parsed: ControllerType = controller.to_string().parse().expect("known controller");
            assert_eq!(&parsed, controller);
        }
    }

    #[test]
    fn test_unknown_controller() {
        let err = "name=systemd".parse::<ControllerType>().unwrap_err();
        assert_eq!(err, UnknownControllerError("name=systemd".to_owned()));
    }
}
