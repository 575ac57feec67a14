//! Hands resource changes to a helper binary running with elevated privileges.
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    process::Command,
};

use base64::{engine::general_purpose::STANDARD, Engine};
#[cfg(test)]
use mockall::automock;
use oci_spec::runtime::LinuxResources;
use serde::{Deserialize, Serialize};

use crate::common::CgroupVersion;

pub const DEFAULT_HELPER: &str = "virt-chroot";
pub const APPLY_SUBCOMMAND: &str = "set-cgroups-resources";

/// Everything the helper needs to apply a resource change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplyRequest {
    pub resources: LinuxResources,
    /// Subsystem name, or a role such as `target`, to the directory it applies to
    pub subsystem_paths: HashMap<String, PathBuf>,
    pub rootless: bool,
    pub version: CgroupVersion,
}

#[derive(thiserror::Error, Debug)]
pub enum TrampolineError {
    #[error("failed to encode {what}: {err}")]
    Encode {
        what: &'static str,
        err: serde_json::Error,
    },
    #[error("failed to spawn {helper}: {err}")]
    Spawn {
        helper: PathBuf,
        err: std::io::Error,
    },
    #[error("{command} failed with {status}: {output}")]
    HelperFailed {
        command: String,
        status: std::process::ExitStatus,
        output: String,
    },
}

#[cfg_attr(test, automock)]
pub trait ResourceApplier: Send + Sync {
    /// Applies the request exactly once. Failures are not retried.
    fn apply(&self, request: &ApplyRequest) -> Result<(), TrampolineError>;
}

/// Runs the privileged helper binary, waiting for it to exit
#[derive(Debug, Clone)]
pub struct HelperTrampoline {
    helper: PathBuf,
}

impl Default for HelperTrampoline {
    fn default() -> Self {
        Self::new(DEFAULT_HELPER)
    }
}

impl HelperTrampoline {
    pub fn new<P: Into<PathBuf>>(helper: P) -> Self {
        Self {
            helper: helper.into(),
        }
    }

    pub fn helper(&self) -> &Path {
        &self.helper
    }

    /// Arguments passed to the helper. The paths and the resources travel as
    /// base64 encoded JSON.
    pub fn command_args(request: &ApplyRequest) -> Result<Vec<String>, TrampolineError> {
        let paths = serde_json::to_vec(&request.subsystem_paths).map_err(|err| {
            TrampolineError::Encode {
                what: "subsystem paths",
                err,
            }
        })?;
        let resources =
            serde_json::to_vec(&request.resources).map_err(|err| TrampolineError::Encode {
                what: "resources",
                err,
            })?;

        Ok(vec![
            APPLY_SUBCOMMAND.to_owned(),
            "--subsystem-paths".to_owned(),
            STANDARD.encode(paths),
            "--resources".to_owned(),
            STANDARD.encode(resources),
            format!("--rootless={}", request.rootless),
            format!("--isV2={}", request.version == CgroupVersion::V2),
        ])
    }
}

impl ResourceApplier for HelperTrampoline {
    fn apply(&self, request: &ApplyRequest) -> Result<(), TrampolineError> {
        let args = Self::command_args(request)?;
        let command = format!("{} {}", self.helper.display(), args.join(" "));
        tracing::debug!(%command, "applying resources through helper");

        let output = Command::new(&self.helper)
            .args(&args)
            .output()
            .map_err(|err| TrampolineError::Spawn {
                helper: self.helper.clone(),
                err,
            })?;

        if !output.status.success() {
            let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
            return Err(TrampolineError::HelperFailed {
                command,
                status: output.status,
                output: combined,
            });
        }

        Ok(())
    }
}
