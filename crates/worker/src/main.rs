use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tilefarm_core::config::RenderConfig;
use tilefarm_events::TracingView;
use tilefarm_pipeline::{Coordinator, FarmConnector, HookSource};
use tilefarm_remote::{SshConnector, SshOptions};
use tilefarm_worker::{init_tracing, Cli};

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = RenderConfig::from_env().context("Invalid TILEFARM_* configuration")?;
    init_tracing(config.log.as_deref())?;

    tracing::info!(
        nodes = ?config.nodes,
        region = config.region,
        overwrite = config.overwrite,
        "tilefarm starting",
    );

    let ssh = SshConnector::new(SshOptions {
        key: config.key.clone(),
        proxy: config.proxy.clone(),
        ..SshOptions::default()
    });
    let connector = Arc::new(FarmConnector::new(Arc::new(ssh)));
    let hook = HookSource::from_option(cli.hook);

    let summary = Coordinator::new(config, connector)
        .run(&cli.scene, &cli.output, &hook, TracingView)
        .await
        .context("Render setup failed")?;

    summary.log();
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    }

    Ok(if summary.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
