use std::{
    collections::HashMap,
    fs,
    io::Write,
    net::Ipv4Addr,
    path::PathBuf,
    sync::Arc,
};

use ipnet::Ipv4Net;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tabwriter::TabWriter;

use super::{
    bridge::BridgeDriver,
    driver::NetDriver,
    endpoint::{EndpointConfigurator, NetnsConfigurator},
    ipam::{parse_subnet, IpAllocator},
    persist, Endpoint,
};
use crate::core::{
    config::Config,
    container::ContainerInfo,
    error::{RTError, Result},
};

/// Descriptor of a created network, persisted as one JSON file per network.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct Network {
    pub name: String,
    /// Gateway address with the subnet's prefix length.
    pub ip_range: Ipv4Net,
    pub driver: String,
}

impl Network {
    pub fn gateway(&self) -> Ipv4Addr {
        self.ip_range.addr()
    }

    pub fn subnet(&self) -> Ipv4Net {
        self.ip_range.trunc()
    }
}

/// Owns everything the network operations share: the catalog of networks,
/// the address allocator, the drivers and the endpoint configurator.
pub struct NetworkRegistry {
    config: Config,
    ipam: IpAllocator,
    drivers: HashMap<String, Arc<dyn NetDriver>>,
    configurator: Arc<dyn EndpointConfigurator>,
    networks: HashMap<String, Network>,
}

impl NetworkRegistry {
    /// Loads every descriptor under the config's network directory and sets
    /// up the bridge driver.
    pub fn load(config: Config) -> Result<Self> {
        let mut registry = Self {
            ipam: IpAllocator::new(config.ipam_path()),
            config,
            drivers: HashMap::new(),
            configurator: Arc::new(NetnsConfigurator::new()),
            networks: HashMap::new(),
        };
        registry.register_driver(Arc::new(BridgeDriver::new()));
        registry.load_networks()?;

        Ok(registry)
    }

    /// Replaces any driver registered under the same name.
    pub fn register_driver(&mut self, driver: Arc<dyn NetDriver>) {
        self.drivers.insert(driver.name().to_string(), driver);
    }

    pub fn set_configurator(&mut self, configurator: Arc<dyn EndpointConfigurator>) {
        self.configurator = configurator;
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn ipam(&self) -> &IpAllocator {
        &self.ipam
    }

    pub fn get(&self, name: &str) -> Option<&Network> {
        self.networks.get(name)
    }

    /// Networks sorted by name.
    pub fn networks(&self) -> Vec<&Network> {
        let mut networks: Vec<_> = self.networks.values().collect();
        networks.sort_by(|a, b| a.name.cmp(&b.name));
        networks
    }

    pub async fn create_network(
        &mut self,
        driver: &str,
        subnet: &str,
        name: &str,
    ) -> Result<&Network> {
        if self.networks.contains_key(name) {
            return Err(RTError::NetworkExists(name.to_string()));
        }
        validate_network_name(name)?;

        let subnet = parse_subnet(subnet)?;
        let driver = self.driver(driver)?;

        let gateway = self.ipam.allocate(&subnet)?;
        let gateway_net = Ipv4Net::new(gateway, subnet.prefix_len())
            .map_err(|e| RTError::invalid_subnet(&subnet.to_string(), e))?;

        let network = match driver.create(&gateway_net, name).await {
            Ok(network) => network,
            Err(e) => {
                error!("Failed to create network {}, driver error: {}", name, e);
                self.release_quietly(&subnet, gateway);
                return Err(e);
            }
        };

        if let Err(e) = self.dump(&network) {
            error!("Failed to create network {}, persist error: {}", name, e);
            if let Err(de) = driver.delete(&network).await {
                error!("Failed to remove device of network {}: {}", name, de);
            }
            self.release_quietly(&subnet, gateway);
            return Err(e);
        }

        info!(
            "Network {} created on {} with gateway {}",
            name, subnet, gateway
        );
        let network = self
            .networks
            .entry(network.name.clone())
            .or_insert(network);
        Ok(&*network)
    }

    pub async fn delete_network(&mut self, name: &str) -> Result<()> {
        let network = self
            .networks
            .get(name)
            .cloned()
            .ok_or_else(|| RTError::NetworkNotFound(name.to_string()))?;

        // The gateway stays allocated until the device is really gone.
        self.driver(&network.driver)?.delete(&network).await?;

        match self.ipam.release(&network.subnet(), network.gateway()) {
            Ok(()) => {}
            Err(e @ (RTError::NotAllocated { .. } | RTError::OutOfRange { .. })) => {
                warn!("Gateway of network {} was not allocated: {}", name, e)
            }
            Err(e) => return Err(e),
        }

        persist::remove_if_exists(&self.descriptor_path(name))?;
        self.networks.remove(name);

        info!("Network {} removed", name);
        Ok(())
    }

    /// Attaches the container to `network_name`: allocates its address, has
    /// the driver create its device, then configures the container side and
    /// the port mappings.
    pub async fn connect(&self, network_name: &str, info: &ContainerInfo) -> Result<Endpoint<'_>> {
        let network = self
            .networks
            .get(network_name)
            .ok_or_else(|| RTError::NetworkNotFound(network_name.to_string()))?;
        let driver = self.driver(&network.driver)?;

        let subnet = network.subnet();
        let ip = self.ipam.allocate(&subnet)?;
        let mut endpoint = Endpoint::new(&info.id, network, ip, info.port_mapping.clone());

        if let Err(e) = driver.connect(network, &mut endpoint).await {
            error!("Failed to connect {} to {}: {}", info.name, network_name, e);
            self.release_quietly(&subnet, ip);
            return Err(e);
        }

        if let Err(e) = self
            .configurator
            .config_ip_address_and_route(&endpoint, info)
            .await
        {
            error!("Failed to configure endpoint {}: {}", endpoint.id, e);
            self.release_quietly(&subnet, ip);
            return Err(e);
        }

        let mapped = self.configurator.config_port_mapping(&endpoint, info).await;
        debug!(
            "{} of {} port mappings installed for {}",
            mapped,
            endpoint.port_mapping.len(),
            endpoint.id
        );

        info!("Container {} connected to {} as {}", info.name, network_name, ip);
        Ok(endpoint)
    }

    pub async fn disconnect(&self, endpoint: &Endpoint<'_>) -> Result<()> {
        let network = endpoint.network;
        self.driver(&network.driver)?
            .disconnect(network, endpoint)
            .await
    }

    /// `NAME  IpRange  Driver` table of all networks.
    pub fn render_table(&self) -> Result<String> {
        let mut output = Vec::new();

        let mut tw = TabWriter::new(&mut output).padding(3);
        tw.write_all(b"NAME\tIpRange\tDriver\n")?;
        for network in self.networks() {
            writeln!(tw, "{}\t{}\t{}", network.name, network.ip_range, network.driver)?;
        }
        tw.flush()?;
        drop(tw);

        String::from_utf8(output)
            .map_err(|e| RTError::storage_error("network table is not UTF-8", Some(Box::new(e))))
    }

    fn driver(&self, name: &str) -> Result<Arc<dyn NetDriver>> {
        self.drivers
            .get(name)
            .cloned()
            .ok_or_else(|| RTError::UnknownDriver(name.to_string()))
    }

    fn release_quietly(&self, subnet: &Ipv4Net, ip: Ipv4Addr) {
        if let Err(e) = self.ipam.release(subnet, ip) {
            error!("Failed to release {} back to {}: {}", ip, subnet, e);
        }
    }

    fn descriptor_path(&self, name: &str) -> PathBuf {
        self.config.network_dir().join(name)
    }

    fn dump(&self, network: &Network) -> Result<()> {
        let contents = serde_json::to_vec(network)?;
        persist::write_atomic(&self.descriptor_path(&network.name), &contents)
    }

    fn load_networks(&mut self) -> Result<()> {
        let dir = self.config.network_dir();
        fs::create_dir_all(&dir)?;

        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if file_name.starts_with('.') || !entry.file_type()?.is_file() {
                continue;
            }

            let network = fs::read(entry.path())
                .map_err(RTError::from)
                .and_then(|contents| Ok(serde_json::from_slice::<Network>(&contents)?));

            match network {
                Ok(network) => {
                    self.networks.insert(network.name.clone(), network);
                }
                Err(e) => warn!("Skipping network descriptor {}: {}", file_name, e),
            }
        }

        debug!("Loaded {} networks from {}", self.networks.len(), dir.display());
        Ok(())
    }
}

/// Network names double as descriptor file names.
fn validate_network_name(name: &str) -> Result<()> {
    if name.is_empty() || name.starts_with('.') || name.contains('/') {
        return Err(RTError::InvalidDeviceName {
            name: name.to_string(),
            reason: "not usable as a network name".to_string(),
        });
    }

    Ok(())
}
