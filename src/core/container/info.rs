use rand::{thread_rng, Rng};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ContainerStatus {
    Running,
    Stopped,
    Exited,
}

/// What the network layer needs to know about a container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub pid: i32,
    pub id: String,
    pub name: String,
    pub command: String,
    /// Seconds since the epoch.
    pub created_time: u64,
    pub status: ContainerStatus,
    pub volume: Option<String>,
    /// "hostPort:containerPort" entries.
    pub port_mapping: Vec<String>,
}

impl ContainerInfo {
    /// A running container with a fresh id. An empty `name` falls back to
    /// the id.
    pub fn new(pid: i32, name: &str, command: &str) -> Self {
        let id = random_id();
        let name = if name.is_empty() {
            id.clone()
        } else {
            name.to_string()
        };

        Self {
            pid,
            id,
            name,
            command: command.to_string(),
            created_time: current_time(),
            status: ContainerStatus::Running,
            volume: None,
            port_mapping: Vec::new(),
        }
    }
}

pub fn random_id() -> String {
    let mut rng = thread_rng();
    let random_bytes: [u8; 16] = rng.gen();

    random_bytes
        .iter()
        .map(|byte| format!("{:02x}", byte))
        .collect()
}

pub fn current_time() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
