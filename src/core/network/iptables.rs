use std::{fmt, net::Ipv4Addr};

use async_trait::async_trait;
use ipnet::Ipv4Net;
use log::debug;

use crate::core::error::{RTError, Result};

/// One `iptables` invocation, kept as its argument vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    args: Vec<String>,
}

impl Rule {
    fn new(args: &[&str]) -> Self {
        Self {
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    /// SNAT traffic leaving `subnet` through anything but its own bridge.
    pub fn masquerade(subnet: &Ipv4Net, bridge: &str) -> Self {
        Self::new(&[
            "-t",
            "nat",
            "-A",
            "POSTROUTING",
            "-s",
            &subnet.trunc().to_string(),
            "!",
            "-o",
            bridge,
            "-j",
            "MASQUERADE",
        ])
    }

    pub fn forward_accept(bridge: &str) -> Self {
        Self::new(&["-A", "FORWARD", "-i", bridge, "-j", "ACCEPT"])
    }

    /// DNAT inbound TCP on `host_port` to `ip:container_port`.
    pub fn port_forward(host_port: u16, ip: Ipv4Addr, container_port: u16) -> Self {
        Self::new(&[
            "-t",
            "nat",
            "-A",
            "PREROUTING",
            "-p",
            "tcp",
            "-m",
            "tcp",
            "--dport",
            &host_port.to_string(),
            "-j",
            "DNAT",
            "--to-destination",
            &format!("{ip}:{container_port}"),
        ])
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.args.join(" "))
    }
}

/// Rules are only ever appended, never reconciled against existing ones.
#[async_trait]
pub trait Firewall: Send + Sync {
    async fn append(&self, rule: &Rule) -> Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Iptables;

#[async_trait]
impl Firewall for Iptables {
    async fn append(&self, rule: &Rule) -> Result<()> {
        debug!("[Firewall] iptables {}", rule);

        let output = tokio::process::Command::new("iptables")
            .args(rule.args())
            .output()
            .await?;

        if output.status.success() {
            Ok(())
        } else {
            Err(RTError::Firewall {
                args: rule.to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}
