use clap::{Args, Parser, Subcommand};

use super::network::BRIDGE;

#[derive(Parser, Debug, Clone)]
#[command(name = "minibox")]
#[command(about = "minibox is a small container runtime with bridge networking.")]
pub struct CLI {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run a command in new namespaces.
    Run(RunArgs),
    /// Container side bootstrap, invoked by `run`.
    #[command(hide = true)]
    Init(InitArgs),
    /// Manage container networks.
    #[command(subcommand)]
    Network(NetworkCommands),
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Keep the terminal attached to the container.
    #[arg(short = 't', long)]
    pub tty: bool,

    /// Name of the container.
    #[arg(long)]
    pub name: Option<String>,

    /// Network to connect the container to.
    #[arg(long)]
    pub net: Option<String>,

    /// Publish a container port, as hostPort:containerPort.
    #[arg(short = 'p', long = "publish")]
    pub publish: Vec<String>,

    /// Command to run in the container.
    #[arg(allow_hyphen_values = true, required = true, trailing_var_arg = true)]
    pub command: Vec<String>,
}

#[derive(Args, Debug, Clone)]
pub struct InitArgs {
    #[arg(allow_hyphen_values = true, required = true, trailing_var_arg = true)]
    pub command: Vec<String>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum NetworkCommands {
    /// Create a network.
    Create(NetCreateArgs),
    /// List networks.
    #[command(alias = "ls")]
    List,
    /// Remove a network.
    #[command(alias = "rm")]
    Remove(NetRemoveArgs),
}

#[derive(Args, Debug, Clone)]
pub struct NetCreateArgs {
    /// Network driver.
    #[arg(long, default_value = BRIDGE)]
    pub driver: String,

    /// Subnet in CIDR form, e.g. 192.168.10.0/24.
    #[arg(long, required = true)]
    pub subnet: String,

    /// Name of the network; also the name of its bridge.
    pub name: String,
}

#[derive(Args, Debug, Clone)]
pub struct NetRemoveArgs {
    pub name: String,
}
