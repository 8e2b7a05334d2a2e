use std::path::{Path, PathBuf};

pub const ROOT_PATH: &str = "/var/run/minibox";
pub const ROOT_ENV: &str = "MINIBOX_ROOT";

/// Where the runtime keeps its persisted state.
#[derive(Debug, Clone)]
pub struct Config {
    root: PathBuf,
}

impl Config {
    pub fn with_root(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// `MINIBOX_ROOT` if set, [`ROOT_PATH`] otherwise.
    pub fn from_env() -> Self {
        match std::env::var_os(ROOT_ENV) {
            Some(root) if !root.is_empty() => Self::with_root(root),
            _ => Self::with_root(ROOT_PATH),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// One descriptor file per network lives here.
    pub fn network_dir(&self) -> PathBuf {
        self.root.join("network").join("network")
    }

    pub fn ipam_path(&self) -> PathBuf {
        self.root.join("network").join("ipam").join("subnet.json")
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::with_root(ROOT_PATH)
    }
}
