use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use multiview_common::config::RelayConfig;
use multiview_common::{Error, SourceId};
use multiview_gateway::GatewayState;
use multiview_relay::Injector;

#[derive(Parser, Debug)]
#[command(name = "multiview-gateway", version, about)]
struct Args {
    /// WebSocket listen address
    #[arg(long, env = "MULTIVIEW_GATEWAY_LISTEN", default_value = "127.0.0.1:3000")]
    listen: SocketAddr,

    /// Wait after injecting a capture agent before retrying delivery
    #[arg(long, env = "MULTIVIEW_SETTLE_DELAY_MS")]
    settle_delay_ms: Option<u64>,

    /// Shell command that (re)injects the capture agent into a source;
    /// `{source}` is replaced with the source id
    #[arg(long, env = "MULTIVIEW_INJECT_COMMAND")]
    inject_command: Option<String>,
}

fn command_injector(template: String) -> Injector {
    Arc::new(move |source: SourceId| -> multiview_common::Result<()> {
        let command = template.replace("{source}", &source.to_string());
        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&command)
            .spawn()
            .map_err(|e| Error::delivery(format!("inject command failed to start: {e}")))?;
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if status.success() => {}
                Ok(status) => warn!(%source, %status, "inject command failed"),
                Err(err) => warn!(%source, error = %err, "inject command failed"),
            }
        });
        Ok(())
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    multiview_common::init_tracing();
    let args = Args::parse();

    let mut config = RelayConfig::from_env();
    if let Some(ms) = args.settle_delay_ms {
        config.settle_delay = Duration::from_millis(ms);
    }
    let injector = args.inject_command.map(command_injector);
    if injector.is_none() {
        warn!("no inject command configured; unresponsive sources will not be recovered");
    }

    let state = GatewayState::new(config, injector);
    let listener = TcpListener::bind(args.listen).await?;
    info!("gateway listening on {}", listener.local_addr()?);

    multiview_gateway::serve(listener, state).await?;
    Ok(())
}
