//! Helper scripts shipped to remote hosts
//!
//! The scripts are compiled into the binary and written to a private
//! temporary directory when a run starts, so `scp` has real files to copy.

use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::debug;

use crate::error::Result;

/// A script embedded in the binary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Script {
    /// File name, also used on the remote side
    pub name: &'static str,
    /// Script body
    pub contents: &'static str,
}

pub const INSTALL_GOLANG: Script = Script {
    name: "install-golang.sh",
    contents: include_str!("../scripts/install-golang.sh"),
};

pub const INSTALL_KIND: Script = Script {
    name: "install-kind.sh",
    contents: include_str!("../scripts/install-kind.sh"),
};

pub const KIND_CONFIG: Script = Script {
    name: "kind-config.yaml",
    contents: include_str!("../scripts/kind-config.yaml"),
};

/// cloud-init user data of the bootstrap VM; touches `/cloud-init-complete`
pub const CLOUD_INIT: Script = Script {
    name: "cloud-init.yaml",
    contents: include_str!("../scripts/cloud-init.yaml"),
};

pub const COLLECT_LOGS_LINUX: Script = Script {
    name: "collect-logs.sh",
    contents: include_str!("../scripts/collect-logs.sh"),
};

pub const COLLECT_LOGS_WINDOWS: Script = Script {
    name: "collect-logs.ps1",
    contents: include_str!("../scripts/collect-logs.ps1"),
};

/// Prints `True` once the Windows CNI is configured
pub const CONFIRM_READY_CNI: Script = Script {
    name: "confirm-ready-cni.ps1",
    contents: include_str!("../scripts/confirm-ready-cni.ps1"),
};

pub const INSTALL_PATCHES: Script = Script {
    name: "installPatches.ps1",
    contents: include_str!("../scripts/installPatches.ps1"),
};

/// Every embedded script
pub const ALL: &[Script] = &[
    INSTALL_GOLANG,
    INSTALL_KIND,
    KIND_CONFIG,
    CLOUD_INIT,
    COLLECT_LOGS_LINUX,
    COLLECT_LOGS_WINDOWS,
    CONFIRM_READY_CNI,
    INSTALL_PATCHES,
];

/// The embedded scripts written out to disk.
///
/// The directory is removed when the value is dropped.
#[derive(Debug)]
pub struct ScriptDir {
    dir: TempDir,
}

impl ScriptDir {
    /// Write every script into a fresh temporary directory
    pub fn materialize() -> Result<Self> {
        let dir = tempfile::Builder::new().prefix("e2e-scripts-").tempdir()?;
        for script in ALL {
            std::fs::write(dir.path().join(script.name), script.contents)?;
        }
        debug!(dir = %dir.path().display(), "Materialized helper scripts");
        Ok(Self { dir })
    }

    /// Directory holding the scripts
    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Local path of one script
    pub fn path(&self, script: &Script) -> PathBuf {
        self.dir.path().join(script.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_script_is_written_with_its_contents() {
        let scripts = ScriptDir::materialize().unwrap();
        for script in ALL {
            let written = std::fs::read_to_string(scripts.path(script)).unwrap();
            assert_eq!(written, script.contents);
        }
    }

    #[test]
    fn cloud_init_signals_completion() {
        assert!(CLOUD_INIT.contents.contains("/cloud-init-complete"));
    }

    #[test]
    fn directory_is_removed_on_drop() {
        let scripts = ScriptDir::materialize().unwrap();
        let root = scripts.root().to_path_buf();
        drop(scripts);
        assert!(!root.exists());
    }
}
