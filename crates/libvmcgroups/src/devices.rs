use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
};

use oci_spec::{
    runtime::{LinuxDeviceCgroup, LinuxDeviceCgroupBuilder, LinuxDeviceType},
    OciSpecError,
};

use crate::common::CgroupVersion;

pub const DEVICES_LIST: &str = "devices.list";

const PTY_FIRST_MAJOR: i64 = 136;
const PTY_MAJORS: i64 = 16;

#[derive(thiserror::Error, Debug)]
pub enum MergeRulesError {
    #[error("new device rules cannot be empty while {current} rules are already applied")]
    EmptyNewRules { current: usize },
}

#[derive(thiserror::Error, Debug)]
pub enum DeviceRulesError {
    #[error(transparent)]
    Merge(#[from] MergeRulesError),
    #[error("failed to build device rule: {0}")]
    Build(#[from] OciSpecError),
    #[error("failed to parse device rule {line:?}: {reason}")]
    ParseDeviceList { line: String, reason: String },
}

fn device_rule(
    major: i64,
    minor: Option<i64>,
    access: &str,
) -> Result<LinuxDeviceCgroup, OciSpecError> {
    let builder = LinuxDeviceCgroupBuilder::default()
        .allow(true)
        .typ(LinuxDeviceType::C)
        .major(major)
        .access(access);

    match minor {
        Some(minor) => builder.minor(minor).build(),
        None => builder.build(),
    }
}

/// Devices a virtual machine launcher needs regardless of the requested policy
pub fn default_device_rules(
    version: CgroupVersion,
) -> Result<Vec<LinuxDeviceCgroup>, OciSpecError> {
    let access = match version {
        CgroupVersion::V1 => "rw",
        CgroupVersion::V2 => "rwm",
    };

    let mut rules = vec![
        // /dev/ptmx
        device_rule(5, Some(2), access)?,
        // /dev/null
        device_rule(1, Some(3), access)?,
        // /dev/kvm
        device_rule(10, Some(232), access)?,
        // /dev/net/tun
        device_rule(10, Some(200), access)?,
        // /dev/vhost-net
        device_rule(10, Some(238), access)?,
    ];

    // pty slaves, see Documentation/admin-guide/devices.txt
    for major in PTY_FIRST_MAJOR..PTY_FIRST_MAJOR + PTY_MAJORS {
        rules.push(device_rule(major, None, access)?);
    }

    Ok(rules)
}

fn same_device(a: &LinuxDeviceCgroup, b: &LinuxDeviceCgroup) -> bool {
    a.typ().unwrap_or_default() == b.typ().unwrap_or_default()
        && a.major() == b.major()
        && a.minor() == b.minor()
}

/// Returns every new rule followed by each current rule whose device
/// (type, major, minor) the new rules do not mention. A rule only loses effect
/// when a new request names the exact same device.
///
/// For example, with these rules applied
/// 1) {c 111:111 allow}
/// 2) {c 222:222 allow}
///
/// a request for {c 222:222 deny} results in [{c 222:222 deny}, {c 111:111 allow}].
pub fn merge_device_rules(
    current: &[LinuxDeviceCgroup],
    new: Option<&[LinuxDeviceCgroup]>,
) -> Result<Vec<LinuxDeviceCgroup>, MergeRulesError> {
    if current.is_empty() {
        return Ok(new.map(<[_]>::to_vec).unwrap_or_default());
    }

    let new = match new {
        Some(new) if !new.is_empty() => new,
        _ => {
            return Err(MergeRulesError::EmptyNewRules {
                current: current.len(),
            })
        }
    };

    let mut merged = new.to_vec();
    merged.extend(
        current
            .iter()
            .filter(|rule| !new.iter().any(|requested| same_device(rule, requested)))
            .cloned(),
    );

    Ok(merged)
}

fn parse_device_number(value: &str) -> Result<Option<i64>, String> {
    if value == "*" {
        return Ok(None);
    }
    value
        .parse()
        .map(Some)
        .map_err(|err| format!("invalid device number {value}: {err}"))
}

fn parse_device_line(line: &str) -> Result<LinuxDeviceCgroup, DeviceRulesError> {
    let parse_err = |reason: String| DeviceRulesError::ParseDeviceList {
        line: line.to_owned(),
        reason,
    };

    let fields: Vec<&str> = line.split_whitespace().collect();
    let [typ, numbers, access] = fields.as_slice() else {
        return Err(parse_err("expected <type> <major>:<minor> <access>".into()));
    };

    let typ = match *typ {
        "a" => LinuxDeviceType::A,
        "b" => LinuxDeviceType::B,
        "c" => LinuxDeviceType::C,
        other => return Err(parse_err(format!("unknown device type {other}"))),
    };
    let (major, minor) = numbers
        .split_once(':')
        .ok_or_else(|| parse_err("missing major:minor separator".into()))?;
    let major = parse_device_number(major).map_err(parse_err)?;
    let minor = parse_device_number(minor).map_err(parse_err)?;

    let mut builder = LinuxDeviceCgroupBuilder::default()
        .allow(true)
        .typ(typ)
        .access(*access);
    if let Some(major) = major {
        builder = builder.major(major);
    }
    if let Some(minor) = minor {
        builder = builder.minor(minor);
    }

    Ok(builder.build()?)
}

/// Parses the v1 `devices.list` file. Every listed entry is an allowed device.
pub fn parse_devices_list(content: &str) -> Result<Vec<LinuxDeviceCgroup>, DeviceRulesError> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(parse_device_line)
        .collect()
}

/// Rules believed to be applied to one cgroup directory. `None` until the first
/// successful apply.
pub type TrackedRules = Option<Vec<LinuxDeviceCgroup>>;

/// Device rules previously pushed per cgroup directory. The kernel offers no way to
/// list active v2 device rules, so the managers remember what they applied. Each
/// directory has its own lock, held across the whole read, merge and apply sequence.
#[derive(Debug, Default)]
pub struct DeviceRuleStore {
    entries: Mutex<HashMap<PathBuf, Arc<Mutex<TrackedRules>>>>,
}

impl DeviceRuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the lock guarding the rules of the directory
    pub fn entry(&self, path: &Path) -> Arc<Mutex<TrackedRules>> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.entry(path.to_path_buf()).or_default().clone()
    }

    /// Snapshot of the rules recorded for the directory
    pub fn rules(&self, path: &Path) -> TrackedRules {
        let entry = self.entry(path);
        let rules = entry.lock().unwrap_or_else(PoisonError::into_inner);
        rules.clone()
    }

    /// Drops what is known about the directory, the next apply starts from the defaults
    pub fn forget(&self, path: &Path) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.remove(path);
    }
}
