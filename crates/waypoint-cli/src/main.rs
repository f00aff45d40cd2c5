use clap::Parser;
use waypoint_cli::{Cli, commands, logging, settings};
use waypoint_client::{new_registry_client, shutdown_on_ctrl_c};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init_logging(&cli.log_level)?;

    let config = settings::load_config(&cli)?;
    let client = new_registry_client(config)?;
    let shutdown = shutdown_on_ctrl_c();

    let mut stdout = std::io::stdout();
    let result = commands::run(client.as_ref(), cli.command, &shutdown, &mut stdout).await;
    client.close();
    result
}
