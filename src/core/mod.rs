use log::info;

pub mod cmd;
pub mod config;
pub mod container;
pub mod error;
pub mod network;

pub use cmd::*;
use config::Config;
use container::RunOptions;
use network::NetworkRegistry;

/// Runs one command line to completion and returns the process exit code.
pub fn execute(cli: CLI) -> anyhow::Result<i32> {
    match cli.command {
        // init replaces the process image, so it must not start a runtime.
        Commands::Init(args) => {
            container::init(&args.command)?;
            Ok(0)
        }
        command => tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?
            .block_on(dispatch(Config::from_env(), command)),
    }
}

async fn dispatch(config: Config, command: Commands) -> anyhow::Result<i32> {
    match command {
        Commands::Run(args) => {
            let opts = RunOptions {
                tty: args.tty,
                name: args.name,
                network: args.net,
                publish: args.publish,
                command: args.command,
            };
            container::run_container(config, opts).await
        }
        Commands::Network(command) => {
            network_command(config, command).await?;
            Ok(0)
        }
        Commands::Init(_) => anyhow::bail!("init cannot run inside the runtime"),
    }
}

async fn network_command(config: Config, command: NetworkCommands) -> anyhow::Result<()> {
    let mut registry = NetworkRegistry::load(config)?;

    match command {
        NetworkCommands::Create(args) => {
            let network = registry
                .create_network(&args.driver, &args.subnet, &args.name)
                .await?;
            info!("Created network {} ({})", network.name, network.ip_range);
        }
        NetworkCommands::List => print!("{}", registry.render_table()?),
        NetworkCommands::Remove(args) => registry.delete_network(&args.name).await?,
    }

    Ok(())
}
