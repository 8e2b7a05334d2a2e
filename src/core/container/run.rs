use anyhow::Context;
use log::{error, info, warn};
use nix::sys::wait::WaitStatus;

use super::{info::ContainerInfo, init::launch};
use crate::core::{config::Config, network::NetworkRegistry};

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub tty: bool,
    pub name: Option<String>,
    /// Network to attach the container to before it starts.
    pub network: Option<String>,
    /// "hostPort:containerPort" entries.
    pub publish: Vec<String>,
    pub command: Vec<String>,
}

/// Launches the container, attaches it to its network if one was asked for,
/// lets it run and waits for it. Returns the container's exit code.
pub async fn run_container(config: Config, opts: RunOptions) -> anyhow::Result<i32> {
    let process = launch(opts.tty, &opts.command)?;
    let pid = process.pid();

    let mut info = ContainerInfo::new(
        pid.as_raw(),
        opts.name.as_deref().unwrap_or_default(),
        &opts.command.join(" "),
    );
    info.port_mapping = opts.publish.clone();
    info!("Container {} ({}) launched as pid {}", info.name, info.id, pid);

    if let Some(network) = &opts.network {
        if let Err(e) = attach(config, network, &info).await {
            error!("Failed to attach container {} to {}: {:?}", info.name, network, e);
            process.abort();
            if let Err(we) = process.wait() {
                warn!("Failed to reap aborted container {}: {:?}", pid, we);
            }
            return Err(e);
        }
    }

    process.start()?;

    let status = tokio::task::spawn_blocking(move || process.wait())
        .await
        .context("Container waiter panicked")??;

    Ok(exit_code(status))
}

async fn attach(config: Config, network: &str, info: &ContainerInfo) -> anyhow::Result<()> {
    let registry = NetworkRegistry::load(config)?;
    let endpoint = registry
        .connect(network, info)
        .await
        .with_context(|| format!("Failed to connect to network {network}"))?;
    info!(
        "Endpoint {} of container {} has address {}",
        endpoint.id, info.name, endpoint.ip
    );

    Ok(())
}

fn exit_code(status: WaitStatus) -> i32 {
    match status {
        WaitStatus::Exited(_, code) => code,
        WaitStatus::Signaled(_, signal, _) => 128 + signal as i32,
        _ => -1,
    }
}
