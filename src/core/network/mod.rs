use std::net::Ipv4Addr;

mod bridge;
mod driver;
mod endpoint;
mod ipam;
mod iptables;
mod link;
mod netns;
mod network;
mod persist;

pub use bridge::{veth_names, BridgeDriver, BRIDGE};
pub use driver::NetDriver;
pub use endpoint::{EndpointConfigurator, NetnsConfigurator, PortMapping};
pub use ipam::{parse_subnet, IpAllocator, SubnetBitmaps};
pub use iptables::{Firewall, Iptables, Rule};
pub use netns::{netns_path, run_in_netns, with_netns, NetnsGuard, NsSwitch, Setns};
pub use network::*;

use crate::core::error::{RTError, Result};

/// The pair of virtual interfaces behind an endpoint. `name` stays on the
/// host bridge, `peer_name` is moved into the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Veth {
    pub name: String,
    pub peer_name: String,
}

/// A container's attachment to a network. Lives only for the duration of
/// a connect; nothing persists it.
#[derive(Debug, Clone)]
pub struct Endpoint<'a> {
    pub id: String,
    pub device: Option<Veth>,
    pub ip: Ipv4Addr,
    pub mac: Option<String>,
    /// "hostPort:containerPort" entries.
    pub port_mapping: Vec<String>,
    pub network: &'a Network,
}

impl<'a> Endpoint<'a> {
    pub fn new(
        container_id: &str,
        network: &'a Network,
        ip: Ipv4Addr,
        port_mapping: Vec<String>,
    ) -> Self {
        Self {
            id: format!("{}-{}", container_id, network.name),
            device: None,
            ip,
            mac: None,
            port_mapping,
            network,
        }
    }

    pub fn device(&self) -> Result<&Veth> {
        self.device
            .as_ref()
            .ok_or_else(|| RTError::EndpointNotAttached(self.id.clone()))
    }
}
