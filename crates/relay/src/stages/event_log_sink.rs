use crate::bus::Message;
use crate::definition::IoLaneType;
use crate::stage::{Stage, StageContext};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Logs every event arriving on its EVENT input lanes.
#[derive(Debug, Default)]
pub struct EventLogSink {
    received: Arc<AtomicU64>,
}

impl EventLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Stage for EventLogSink {
    async fn start(&mut self, ctx: &StageContext) -> anyhow::Result<()> {
        let received = self.received.clone();
        let instance = ctx.instance_name().to_string();
        let lanes = ctx.subscribe(IoLaneType::Event, move |message: Message| {
            let count = received.fetch_add(1, Ordering::Relaxed) + 1;
            info!(
                instance = %instance,
                count,
                address = %message.address(),
                event = %message.event(),
                "event received"
            );
            async {}
        });
        debug!(instance = %ctx.instance_name(), lanes, "event log sink started");
        Ok(())
    }
}
