use std::sync::Arc;

use async_trait::async_trait;
use log::{error, info, warn};

use super::{
    iptables::{Firewall, Iptables, Rule},
    link::Links,
    netns::{run_in_netns, NsSwitch, Setns},
    Endpoint,
};
use crate::core::{container::ContainerInfo, error::Result};

/// A "hostPort:containerPort" entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMapping {
    pub host: u16,
    pub container: u16,
}

impl PortMapping {
    pub fn parse(mapping: &str) -> Option<Self> {
        let (host, container) = mapping.split_once(':')?;
        if container.contains(':') {
            return None;
        }

        Some(Self {
            host: host.trim().parse().ok()?,
            container: container.trim().parse().ok()?,
        })
    }
}

/// Finishes an attachment once the driver has created the endpoint's device.
#[async_trait]
pub trait EndpointConfigurator: Send + Sync {
    /// Moves the container side of the endpoint into the container and gives
    /// it its address and a default route through the gateway.
    async fn config_ip_address_and_route(
        &self,
        endpoint: &Endpoint<'_>,
        info: &ContainerInfo,
    ) -> Result<()>;

    /// Installs one port forward per well-formed mapping. Malformed entries
    /// and failing rules are logged and skipped. Returns how many rules were
    /// installed.
    async fn config_port_mapping(&self, endpoint: &Endpoint<'_>, info: &ContainerInfo) -> usize;
}

pub struct NetnsConfigurator {
    firewall: Arc<dyn Firewall>,
}

impl NetnsConfigurator {
    pub fn new() -> Self {
        Self::with_firewall(Arc::new(Iptables))
    }

    pub fn with_firewall(firewall: Arc<dyn Firewall>) -> Self {
        Self { firewall }
    }
}

impl Default for NetnsConfigurator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EndpointConfigurator for NetnsConfigurator {
    async fn config_ip_address_and_route(
        &self,
        endpoint: &Endpoint<'_>,
        info: &ContainerInfo,
    ) -> Result<()> {
        let peer = endpoint.device()?.peer_name.clone();

        // Hand the peer over while still in the host namespace.
        let links = Links::new()?;
        let netns = Setns.open(info.pid)?;
        links.set_netns(&peer, &netns).await?;
        drop(netns);

        let ip = endpoint.ip;
        let prefix_len = endpoint.network.ip_range.prefix_len();
        let gateway = endpoint.network.gateway();
        let iface = peer.clone();

        run_in_netns(info.pid, move || {
            // The netlink socket joins the namespace the thread is in when
            // it is opened, so it has to be opened here.
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;

            rt.block_on(async move {
                let links = Links::new()?;
                links.add_address(&iface, ip, prefix_len).await?;
                links.set_up(&iface).await?;
                links.set_up("lo").await?;
                links.add_default_route(&iface, gateway).await
            })
        })
        .await?;

        info!(
            "[Endpoint] {} configured as {}/{} via {} in container {}",
            peer, ip, prefix_len, gateway, info.name
        );
        Ok(())
    }

    async fn config_port_mapping(&self, endpoint: &Endpoint<'_>, info: &ContainerInfo) -> usize {
        let mut installed = 0;

        for mapping in &endpoint.port_mapping {
            let Some(pm) = PortMapping::parse(mapping) else {
                warn!(
                    "Skipping malformed port mapping {:?} of container {}",
                    mapping, info.name
                );
                continue;
            };

            let rule = Rule::port_forward(pm.host, endpoint.ip, pm.container);
            match self.firewall.append(&rule).await {
                Ok(()) => installed += 1,
                Err(e) => error!(
                    "Failed to map port {} of container {}: {}",
                    mapping, info.name, e
                ),
            }
        }

        installed
    }
}
