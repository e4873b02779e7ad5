use crate::stage::{Stage, StageContext};
use async_trait::async_trait;
use tracing::debug;

/// Starts and does nothing.
#[derive(Debug, Default)]
pub struct Dummy;

#[async_trait]
impl Stage for Dummy {
    async fn start(&mut self, ctx: &StageContext) -> anyhow::Result<()> {
        debug!(instance = %ctx.instance_name(), "started");
        Ok(())
    }
}
