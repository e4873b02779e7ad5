//! Runs a small topology until interrupted.
//!
//! ```text
//! Trigger_01 ──NEXT_tick──► Counter_01 ──count──► Parity_01 ──parity──► Sink_01
//!                                          └─────────────count────────────►┘
//! ```
//!
//! Usage: `relay-pipeline-demo [config.yml]` (defaults to
//! `demos/pipeline/relay.yml`). Set `RUST_LOG=debug` for lane-level detail.

use anyhow::Result;
use relay_core::{
    async_trait, ConfigLoader, Event, IoLaneType, Message, RuntimeBuilder, Stage, StageContext,
    StageDefinition,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG: &str = "demos/pipeline/relay.yml";

/// Labels each incoming number as `even` or `odd`.
struct Parity;

#[async_trait]
impl Stage for Parity {
    async fn start(&mut self, ctx: &StageContext) -> anyhow::Result<()> {
        let out = ctx.clone();
        ctx.subscribe(IoLaneType::Event, move |message: Message| {
            let label = if message.event().payload_as_long() % 2 == 0 {
                "even"
            } else {
                "odd"
            };
            out.publish(&out.derive(message.event(), Event::text(label)));
            async {}
        });
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let path = std::env::args().nth(1).unwrap_or_else(|| DEFAULT_CONFIG.to_string());
    let config = ConfigLoader::new().with_file(path).load()?;

    let runtime = RuntimeBuilder::new(config)
        .with_stage("demo.Parity", |_d: &StageDefinition| {
            Ok(Box::new(Parity) as Box<dyn Stage>)
        })
        .build()
        .await?;

    for failure in &runtime.boot_report().failed {
        warn!(document = %failure.document, error = %failure.error, "skipped");
    }
    info!(stages = ?runtime.boot_report().deployed, "pipeline running, ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    runtime.shutdown().await;
    Ok(())
}
