mod bootstrap_helpers;
mod connector_config;
mod connector_runtime;

use anyhow::Result;
use clap::Parser;

use crate::bootstrap_helpers::init_tracing;
use crate::connector_config::{Cli, ConnectorConfig};
use crate::connector_runtime::run_connector;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = ConnectorConfig::load(&cli)?;
    for warning in config.warnings() {
        tracing::warn!("{warning}");
    }
    tracing::debug!(
        config_path = ?config.config_path,
        verbose = config.verbose,
        forward_thinking = config.bridge.forward_thinking,
        forward_tool_calls = config.bridge.forward_tool_calls,
        "connector config resolved"
    );
    run_connector(config).await
}
