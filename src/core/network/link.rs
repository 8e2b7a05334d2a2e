use std::{
    fs::File,
    net::{IpAddr, Ipv4Addr},
    os::fd::AsRawFd,
    time::Duration,
};

use futures::TryStreamExt;
use log::debug;
use netlink_packet_route::link::{LinkAttribute, LinkMessage};
use rtnetlink::Handle;

use crate::core::error::{RTError, Result};

/// A freshly created link may not be queryable by name right away.
pub const LINK_RETRIES: usize = 2;
pub const LINK_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Kernel limit on interface names, without the trailing NUL.
pub const IFNAME_MAX: usize = 15;

pub fn validate_ifname(name: &str) -> Result<()> {
    let reason = if name.is_empty() {
        "empty name"
    } else if name.len() > IFNAME_MAX {
        "longer than 15 bytes"
    } else if name.contains(|c: char| c == '/' || c == ':' || c.is_whitespace()) {
        "contains '/', ':' or whitespace"
    } else {
        return Ok(());
    };

    Err(RTError::InvalidDeviceName {
        name: name.to_string(),
        reason: reason.to_string(),
    })
}

pub fn mac_address(link: &LinkMessage) -> Option<String> {
    link.attributes.iter().find_map(|attr| match attr {
        LinkAttribute::Address(bytes) if !bytes.is_empty() => Some(
            bytes
                .iter()
                .map(|b| format!("{b:02x}"))
                .collect::<Vec<_>>()
                .join(":"),
        ),
        _ => None,
    })
}

/// Route netlink connection bound to the network namespace of the thread
/// that created it.
pub struct Links {
    handle: Handle,
}

impl Links {
    /// Must be called inside a tokio runtime.
    pub fn new() -> Result<Self> {
        let (connection, handle, _) = rtnetlink::new_connection()?;
        tokio::spawn(connection);

        Ok(Self { handle })
    }

    pub async fn find(&self, name: &str) -> Result<Option<LinkMessage>> {
        let res = self
            .handle
            .link()
            .get()
            .match_name(name.to_string())
            .execute()
            .try_next()
            .await;

        match res {
            Ok(link) => Ok(link),
            Err(rtnetlink::Error::NetlinkError(e)) if e.raw_code() == -nix::libc::ENODEV => {
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Looks `name` up, retrying a fixed number of times.
    pub async fn by_name(&self, name: &str) -> Result<LinkMessage> {
        for attempt in 1..=LINK_RETRIES {
            if let Some(link) = self.find(name).await? {
                return Ok(link);
            }

            if attempt < LINK_RETRIES {
                debug!("[Link] {} not visible yet, retrying", name);
                tokio::time::sleep(LINK_RETRY_DELAY).await;
            }
        }

        Err(RTError::LinkNotFound(name.to_string()))
    }

    pub async fn add_bridge(&self, name: &str) -> Result<()> {
        self.handle
            .link()
            .add()
            .bridge(name.to_string())
            .execute()
            .await?;

        Ok(())
    }

    pub async fn add_veth(&self, name: &str, peer: &str) -> Result<()> {
        self.handle
            .link()
            .add()
            .veth(name.to_string(), peer.to_string())
            .execute()
            .await?;

        Ok(())
    }

    pub async fn delete(&self, name: &str) -> Result<()> {
        let link = self.by_name(name).await?;
        self.handle.link().del(link.header.index).execute().await?;

        Ok(())
    }

    pub async fn set_up(&self, name: &str) -> Result<()> {
        let link = self.by_name(name).await?;
        self.handle
            .link()
            .set(link.header.index)
            .up()
            .execute()
            .await?;

        Ok(())
    }

    pub async fn add_address(&self, name: &str, ip: Ipv4Addr, prefix_len: u8) -> Result<()> {
        let link = self.by_name(name).await?;
        self.handle
            .address()
            .add(link.header.index, IpAddr::V4(ip), prefix_len)
            .execute()
            .await?;

        Ok(())
    }

    pub async fn set_master(&self, iface: &str, bridge: &str) -> Result<()> {
        let bridge_link = self.by_name(bridge).await?;
        let iface_link = self.by_name(iface).await?;

        self.handle
            .link()
            .set(iface_link.header.index)
            .controller(bridge_link.header.index)
            .execute()
            .await?;

        Ok(())
    }

    /// Moves `iface` into the namespace behind `netns`.
    pub async fn set_netns(&self, iface: &str, netns: &File) -> Result<()> {
        let link = self.by_name(iface).await?;
        self.handle
            .link()
            .set(link.header.index)
            .setns_by_fd(netns.as_raw_fd())
            .execute()
            .await?;

        Ok(())
    }

    pub async fn add_default_route(&self, iface: &str, gateway: Ipv4Addr) -> Result<()> {
        let link = self.by_name(iface).await?;
        self.handle
            .route()
            .add()
            .v4()
            .gateway(gateway)
            .output_interface(link.header.index)
            .execute()
            .await?;

        Ok(())
    }
}
