use std::sync::Arc;

use async_trait::async_trait;
use ipnet::Ipv4Net;
use log::{error, info, warn};

use super::{
    driver::NetDriver,
    iptables::{Firewall, Iptables, Rule},
    link::{mac_address, validate_ifname, Links},
    network::Network,
    Endpoint, Veth,
};
use crate::core::error::{RTError, Result};

pub const BRIDGE: &str = "bridge";

/// How much of the endpoint id goes into the veth names.
const VETH_ID_LEN: usize = 8;

/// Host and container side names for an endpoint, derived from a prefix of
/// its id.
pub fn veth_names(endpoint_id: &str) -> Veth {
    let short: String = endpoint_id.chars().take(VETH_ID_LEN).collect();

    Veth {
        name: format!("veth{short}"),
        peer_name: format!("cif-{short}"),
    }
}

/// Linux bridge per network; containers hang off it through veth pairs.
pub struct BridgeDriver {
    firewall: Arc<dyn Firewall>,
}

impl BridgeDriver {
    pub fn new() -> Self {
        Self::with_firewall(Arc::new(Iptables))
    }

    pub fn with_firewall(firewall: Arc<dyn Firewall>) -> Self {
        Self { firewall }
    }

    async fn init_bridge(&self, links: &Links, network: &Network) -> Result<()> {
        links
            .add_address(&network.name, network.gateway(), network.ip_range.prefix_len())
            .await?;
        links.set_up(&network.name).await?;

        self.firewall
            .append(&Rule::forward_accept(&network.name))
            .await?;
        self.firewall
            .append(&Rule::masquerade(&network.subnet(), &network.name))
            .await?;

        Ok(())
    }
}

impl Default for BridgeDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NetDriver for BridgeDriver {
    fn name(&self) -> &str {
        BRIDGE
    }

    async fn create(&self, gateway: &Ipv4Net, name: &str) -> Result<Network> {
        validate_ifname(name)?;

        let links = Links::new()?;
        if links.find(name).await?.is_some() {
            return Err(RTError::DeviceExists(name.to_string()));
        }

        links.add_bridge(name).await?;

        let network = Network {
            name: name.to_string(),
            ip_range: *gateway,
            driver: BRIDGE.to_string(),
        };

        if let Err(e) = self.init_bridge(&links, &network).await {
            error!("Failed to init bridge {}: {}", name, e);
            if let Err(de) = links.delete(name).await {
                warn!("Failed to remove half-created bridge {}: {}", name, de);
            }
            return Err(e);
        }

        info!("[Bridge] created {} with gateway {}", name, gateway);
        Ok(network)
    }

    async fn delete(&self, network: &Network) -> Result<()> {
        // TODO: drop the FORWARD/MASQUERADE rules as well once overlapping
        // subnets no longer share them.
        let links = Links::new()?;
        links.delete(&network.name).await?;

        info!("[Bridge] deleted {}", network.name);
        Ok(())
    }

    async fn connect(&self, network: &Network, endpoint: &mut Endpoint<'_>) -> Result<()> {
        let veth = veth_names(&endpoint.id);
        validate_ifname(&veth.name)?;
        validate_ifname(&veth.peer_name)?;

        let links = Links::new()?;
        links.add_veth(&veth.name, &veth.peer_name).await?;

        let attach = async {
            links.set_master(&veth.name, &network.name).await?;
            links.set_up(&veth.name).await?;
            links.by_name(&veth.name).await
        };

        match attach.await {
            Ok(link) => {
                endpoint.mac = mac_address(&link);
                endpoint.device = Some(veth);
                Ok(())
            }
            Err(e) => {
                // Removing one end removes the pair.
                if let Err(de) = links.delete(&veth.name).await {
                    warn!("Failed to remove half-attached veth {}: {}", veth.name, de);
                }
                Err(e)
            }
        }
    }

    async fn disconnect(&self, _network: &Network, _endpoint: &Endpoint<'_>) -> Result<()> {
        Ok(())
    }
}
