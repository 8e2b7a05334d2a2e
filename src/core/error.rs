use std::net::Ipv4Addr;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RTError {
    #[error("Invalid subnet {subnet}: {reason}")]
    InvalidSubnet { subnet: String, reason: String },

    #[error("No available IP in subnet {0}")]
    SubnetExhausted(String),

    #[error("IP {ip} is not allocated in subnet {subnet}")]
    NotAllocated { subnet: String, ip: Ipv4Addr },

    #[error("IP {ip} is out of range of subnet {subnet}")]
    OutOfRange { subnet: String, ip: Ipv4Addr },

    #[error("Network already exists: {0}")]
    NetworkExists(String),

    #[error("No such network: {0}")]
    NetworkNotFound(String),

    #[error("Invalid driver: {0}")]
    UnknownDriver(String),

    #[error("Device already exists: {0}")]
    DeviceExists(String),

    #[error("Link not found: {0}")]
    LinkNotFound(String),

    #[error("Invalid device name {name}: {reason}")]
    InvalidDeviceName { name: String, reason: String },

    #[error("Endpoint {0} has no attached device")]
    EndpointNotAttached(String),

    #[error("Namespace error: {message}")]
    Namespace {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Netlink error: {0}")]
    Netlink(#[from] rtnetlink::Error),

    #[error("`iptables {args}` failed: {message}")]
    Firewall { args: String, message: String },

    #[error("Storage error: {message}")]
    StorageError {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("System error: {0}")]
    System(#[from] nix::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RTError>;

impl RTError {
    pub fn invalid_subnet(subnet: &str, reason: impl ToString) -> Self {
        RTError::InvalidSubnet {
            subnet: subnet.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn namespace_error(
        message: &str,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        RTError::Namespace {
            message: message.to_string(),
            source,
        }
    }

    pub fn storage_error(
        message: &str,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        RTError::StorageError {
            message: message.to_string(),
            source,
        }
    }
}

impl From<serde_json::Error> for RTError {
    fn from(e: serde_json::Error) -> Self {
        RTError::storage_error("malformed state file", Some(Box::new(e)))
    }
}
