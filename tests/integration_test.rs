use std::{
    net::Ipv4Addr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use ipnet::Ipv4Net;
use pretty_assertions::assert_eq;
use tempfile::TempDir;

use minibox::{
    config::Config,
    container::ContainerInfo,
    error::{RTError, Result},
    network::{
        Endpoint, EndpointConfigurator, IpAllocator, NetDriver, Network, NetworkRegistry, Veth,
    },
};

const FAKE: &str = "fake";

/// Records what it was asked to do; can be told to fail.
#[derive(Default)]
struct FakeDriver {
    fail_create: AtomicBool,
    fail_connect: AtomicBool,
    fail_delete: AtomicBool,
    deleted: Mutex<Vec<String>>,
}

#[async_trait]
impl NetDriver for FakeDriver {
    fn name(&self) -> &str {
        FAKE
    }

    async fn create(&self, gateway: &Ipv4Net, name: &str) -> Result<Network> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(RTError::DeviceExists(name.to_string()));
        }

        Ok(Network {
            name: name.to_string(),
            ip_range: *gateway,
            driver: FAKE.to_string(),
        })
    }

    async fn delete(&self, network: &Network) -> Result<()> {
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(RTError::LinkNotFound(network.name.clone()));
        }
        self.deleted.lock().unwrap().push(network.name.clone());
        Ok(())
    }

    async fn connect(&self, _network: &Network, endpoint: &mut Endpoint<'_>) -> Result<()> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(RTError::LinkNotFound("fake0".to_string()));
        }

        endpoint.device = Some(Veth {
            name: "vethfake".to_string(),
            peer_name: "cif-fake".to_string(),
        });
        Ok(())
    }

    async fn disconnect(&self, _network: &Network, _endpoint: &Endpoint<'_>) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct FakeConfigurator {
    fail_route: AtomicBool,
    routed: Mutex<Vec<Ipv4Addr>>,
    mappings: Mutex<Vec<String>>,
}

#[async_trait]
impl EndpointConfigurator for FakeConfigurator {
    async fn config_ip_address_and_route(
        &self,
        endpoint: &Endpoint<'_>,
        _info: &ContainerInfo,
    ) -> Result<()> {
        endpoint.device()?;
        if self.fail_route.load(Ordering::SeqCst) {
            return Err(RTError::namespace_error("injected", None));
        }
        self.routed.lock().unwrap().push(endpoint.ip);
        Ok(())
    }

    async fn config_port_mapping(&self, endpoint: &Endpoint<'_>, _info: &ContainerInfo) -> usize {
        let mut mappings = self.mappings.lock().unwrap();
        mappings.extend(endpoint.port_mapping.iter().cloned());
        endpoint.port_mapping.len()
    }
}

struct Fixture {
    _dir: TempDir,
    config: Config,
    driver: Arc<FakeDriver>,
    configurator: Arc<FakeConfigurator>,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let config = Config::with_root(dir.path());

        Self {
            _dir: dir,
            config,
            driver: Arc::new(FakeDriver::default()),
            configurator: Arc::new(FakeConfigurator::default()),
        }
    }

    fn registry(&self) -> NetworkRegistry {
        let mut registry = NetworkRegistry::load(self.config.clone()).unwrap();
        registry.register_driver(self.driver.clone());
        registry.set_configurator(self.configurator.clone());
        registry
    }
}

fn container(id: &str, port_mapping: &[&str]) -> ContainerInfo {
    let mut info = ContainerInfo::new(4242, "web", "/bin/sh");
    info.id = id.to_string();
    info.port_mapping = port_mapping.iter().map(|s| s.to_string()).collect();
    info
}

#[tokio::test]
async fn test_create_network_takes_first_address() {
    let fixture = Fixture::new();
    let mut registry = fixture.registry();

    let network = registry
        .create_network(FAKE, "192.168.1.0/24", "testnet")
        .await
        .unwrap()
        .clone();

    assert_eq!(network.gateway(), Ipv4Addr::new(192, 168, 1, 1));
    assert_eq!(network.ip_range.to_string(), "192.168.1.1/24");

    let descriptor = std::fs::read_to_string(fixture.config.network_dir().join("testnet")).unwrap();
    assert_eq!(
        descriptor,
        r#"{"Name":"testnet","IpRange":"192.168.1.1/24","Driver":"fake"}"#
    );
}

#[tokio::test]
async fn test_subnet_is_normalized() {
    let fixture = Fixture::new();
    let mut registry = fixture.registry();

    let network = registry
        .create_network(FAKE, "192.168.1.77/24", "testnet")
        .await
        .unwrap();

    assert_eq!(network.ip_range.to_string(), "192.168.1.1/24");
}

#[tokio::test]
async fn test_duplicate_network_is_rejected() {
    let fixture = Fixture::new();
    let mut registry = fixture.registry();

    registry
        .create_network(FAKE, "192.168.1.0/24", "testnet")
        .await
        .unwrap();

    assert!(matches!(
        registry.create_network(FAKE, "10.0.0.0/24", "testnet").await,
        Err(RTError::NetworkExists(_))
    ));
}

#[tokio::test]
async fn test_delete_network_releases_gateway() {
    let fixture = Fixture::new();
    let mut registry = fixture.registry();

    registry
        .create_network(FAKE, "192.168.1.0/24", "testnet")
        .await
        .unwrap();
    registry.delete_network("testnet").await.unwrap();

    assert!(registry.get("testnet").is_none());
    assert!(!fixture.config.network_dir().join("testnet").exists());
    assert_eq!(*fixture.driver.deleted.lock().unwrap(), vec!["testnet"]);

    let network = registry
        .create_network(FAKE, "192.168.1.0/24", "testnet")
        .await
        .unwrap();
    assert_eq!(network.gateway(), Ipv4Addr::new(192, 168, 1, 1));
}

#[tokio::test]
async fn test_delete_unknown_network() {
    let fixture = Fixture::new();
    let mut registry = fixture.registry();

    assert!(matches!(
        registry.delete_network("nope").await,
        Err(RTError::NetworkNotFound(_))
    ));
}

#[tokio::test]
async fn test_failed_create_releases_gateway() {
    let fixture = Fixture::new();
    let mut registry = fixture.registry();

    fixture.driver.fail_create.store(true, Ordering::SeqCst);
    assert!(registry
        .create_network(FAKE, "192.168.1.0/24", "testnet")
        .await
        .is_err());
    assert!(registry.get("testnet").is_none());
    assert!(!fixture.config.network_dir().join("testnet").exists());

    fixture.driver.fail_create.store(false, Ordering::SeqCst);
    let network = registry
        .create_network(FAKE, "192.168.1.0/24", "testnet")
        .await
        .unwrap();
    assert_eq!(network.gateway(), Ipv4Addr::new(192, 168, 1, 1));
}

#[tokio::test]
async fn test_failed_delete_keeps_gateway() {
    let fixture = Fixture::new();
    let mut registry = fixture.registry();

    registry
        .create_network(FAKE, "192.168.1.0/24", "a")
        .await
        .unwrap();

    fixture.driver.fail_delete.store(true, Ordering::SeqCst);
    assert!(matches!(
        registry.delete_network("a").await,
        Err(RTError::LinkNotFound(_))
    ));
    assert!(registry.get("a").is_some());
    assert!(fixture.config.network_dir().join("a").exists());

    let b = registry
        .create_network(FAKE, "192.168.1.0/24", "b")
        .await
        .unwrap();
    assert_eq!(b.gateway(), Ipv4Addr::new(192, 168, 1, 2));

    fixture.driver.fail_delete.store(false, Ordering::SeqCst);
    registry.delete_network("a").await.unwrap();
    assert!(registry.get("a").is_none());
}

#[tokio::test]
async fn test_delete_with_unknown_driver_keeps_gateway() {
    let fixture = Fixture::new();
    let ipam = IpAllocator::new(fixture.config.ipam_path());
    let subnet: Ipv4Net = "10.20.0.0/24".parse().unwrap();
    assert_eq!(ipam.allocate(&subnet).unwrap(), Ipv4Addr::new(10, 20, 0, 1));

    std::fs::create_dir_all(fixture.config.network_dir()).unwrap();
    std::fs::write(
        fixture.config.network_dir().join("ghost"),
        r#"{"Name":"ghost","IpRange":"10.20.0.1/24","Driver":"overlay"}"#,
    )
    .unwrap();

    let mut registry = fixture.registry();
    assert!(matches!(
        registry.delete_network("ghost").await,
        Err(RTError::UnknownDriver(_))
    ));
    assert!(registry.get("ghost").is_some());
    assert_eq!(ipam.allocate(&subnet).unwrap(), Ipv4Addr::new(10, 20, 0, 2));
}

#[tokio::test]
async fn test_failed_persist_removes_device_and_gateway() {
    let fixture = Fixture::new();
    let mut registry = fixture.registry();

    // A plain file where the descriptor directory should be.
    let network_dir = fixture.config.network_dir();
    std::fs::remove_dir_all(&network_dir).unwrap();
    std::fs::write(&network_dir, b"").unwrap();

    assert!(registry
        .create_network(FAKE, "192.168.1.0/24", "testnet")
        .await
        .is_err());
    assert!(registry.get("testnet").is_none());
    assert_eq!(*fixture.driver.deleted.lock().unwrap(), vec!["testnet"]);

    let ipam = IpAllocator::new(fixture.config.ipam_path());
    assert_eq!(
        ipam.allocate(&"192.168.1.0/24".parse().unwrap()).unwrap(),
        Ipv4Addr::new(192, 168, 1, 1)
    );
}

#[tokio::test]
async fn test_connect_allocates_and_configures() {
    let fixture = Fixture::new();
    let mut registry = fixture.registry();

    registry
        .create_network(FAKE, "192.168.1.0/24", "testnet")
        .await
        .unwrap();

    let info = container("cid", &["8080:80"]);
    let endpoint = registry.connect("testnet", &info).await.unwrap();

    assert_eq!(endpoint.id, "cid-testnet");
    assert_eq!(endpoint.ip, Ipv4Addr::new(192, 168, 1, 2));
    assert_eq!(endpoint.device().unwrap().peer_name, "cif-fake");
    assert_eq!(endpoint.network.name, "testnet");
    registry.disconnect(&endpoint).await.unwrap();

    assert_eq!(
        *fixture.configurator.routed.lock().unwrap(),
        vec![Ipv4Addr::new(192, 168, 1, 2)]
    );
    assert_eq!(*fixture.configurator.mappings.lock().unwrap(), vec!["8080:80"]);

    let second = registry.connect("testnet", &container("cid2", &[])).await.unwrap();
    assert_eq!(second.ip, Ipv4Addr::new(192, 168, 1, 3));
}

#[tokio::test]
async fn test_connect_unknown_network() {
    let fixture = Fixture::new();
    let registry = fixture.registry();

    assert!(matches!(
        registry.connect("nope", &container("cid", &[])).await,
        Err(RTError::NetworkNotFound(_))
    ));
}

#[tokio::test]
async fn test_failed_connect_releases_address() {
    let fixture = Fixture::new();
    let mut registry = fixture.registry();

    registry
        .create_network(FAKE, "192.168.1.0/24", "testnet")
        .await
        .unwrap();

    fixture.driver.fail_connect.store(true, Ordering::SeqCst);
    assert!(registry.connect("testnet", &container("cid", &[])).await.is_err());
    assert!(fixture.configurator.routed.lock().unwrap().is_empty());

    fixture.driver.fail_connect.store(false, Ordering::SeqCst);
    let endpoint = registry.connect("testnet", &container("cid", &[])).await.unwrap();
    assert_eq!(endpoint.ip, Ipv4Addr::new(192, 168, 1, 2));
}

#[tokio::test]
async fn test_failed_route_releases_address() {
    let fixture = Fixture::new();
    let mut registry = fixture.registry();

    registry
        .create_network(FAKE, "192.168.1.0/24", "testnet")
        .await
        .unwrap();

    fixture.configurator.fail_route.store(true, Ordering::SeqCst);
    assert!(matches!(
        registry.connect("testnet", &container("cid", &["8080:80"])).await,
        Err(RTError::Namespace { .. })
    ));
    assert!(fixture.configurator.mappings.lock().unwrap().is_empty());

    fixture.configurator.fail_route.store(false, Ordering::SeqCst);
    let endpoint = registry.connect("testnet", &container("cid", &[])).await.unwrap();
    assert_eq!(endpoint.ip, Ipv4Addr::new(192, 168, 1, 2));
}

#[tokio::test]
async fn test_reload_sees_persisted_state() {
    let fixture = Fixture::new();
    {
        let mut registry = fixture.registry();
        registry
            .create_network(FAKE, "192.168.1.0/24", "alpha")
            .await
            .unwrap();
        registry
            .create_network(FAKE, "10.10.0.0/16", "beta")
            .await
            .unwrap();
    }

    let registry = fixture.registry();
    let names: Vec<_> = registry.networks().iter().map(|n| n.name.clone()).collect();
    assert_eq!(names, vec!["alpha", "beta"]);

    // The gateways are still taken.
    let ipam = IpAllocator::new(fixture.config.ipam_path());
    assert_eq!(
        ipam.allocate(&"192.168.1.0/24".parse().unwrap()).unwrap(),
        Ipv4Addr::new(192, 168, 1, 2)
    );
}

#[tokio::test]
async fn test_render_table() {
    let fixture = Fixture::new();
    let mut registry = fixture.registry();

    registry
        .create_network(FAKE, "192.168.1.0/24", "testnet")
        .await
        .unwrap();

    let table = registry.render_table().unwrap();
    let lines: Vec<Vec<&str>> = table
        .lines()
        .map(|line| line.split_whitespace().collect())
        .collect();

    assert_eq!(
        lines,
        vec![
            vec!["NAME", "IpRange", "Driver"],
            vec!["testnet", "192.168.1.1/24", "fake"],
        ]
    );
}
