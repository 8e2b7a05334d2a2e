use async_trait::async_trait;
use ipnet::Ipv4Net;

use super::{network::Network, Endpoint};
use crate::core::error::Result;

/// A kind of network the registry can create and attach containers to.
#[async_trait]
pub trait NetDriver: Send + Sync {
    /// Key under which the registry finds this driver; stored in every
    /// network descriptor the driver creates.
    fn name(&self) -> &str;

    /// `gateway` is the allocated gateway address with the subnet's prefix
    /// length, e.g. `192.168.1.1/24`. Fails if a device called `name`
    /// already exists.
    async fn create(&self, gateway: &Ipv4Net, name: &str) -> Result<Network>;

    async fn delete(&self, network: &Network) -> Result<()>;

    /// Creates the endpoint's device on the host and records it in
    /// `endpoint`. The container side is configured separately.
    async fn connect(&self, network: &Network, endpoint: &mut Endpoint<'_>) -> Result<()>;

    async fn disconnect(&self, network: &Network, endpoint: &Endpoint<'_>) -> Result<()>;
}
