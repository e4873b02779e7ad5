use crate::event::Event;
use crate::options::ConfigKey;
use crate::stage::{Stage, StageContext};
use anyhow::anyhow;
use async_trait::async_trait;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, trace};

/// Publishes an increasing long counter every `timer.interval` ms.
///
/// ```yaml
/// options:
///   - section: timer
///     interval: 10000
/// ```
#[derive(Debug, Default)]
pub struct PeriodicTrigger {
    task: Option<JoinHandle<()>>,
}

#[async_trait]
impl Stage for PeriodicTrigger {
    async fn start(&mut self, ctx: &StageContext) -> anyhow::Result<()> {
        let interval_ms = ctx
            .opts()
            .section(ConfigKey::TIMER.key)
            .block()
            .get_long(ConfigKey::INTERVAL.key)
            .filter(|ms| *ms > 0)
            .ok_or_else(|| anyhow!("interval is not defined"))?;
        debug!(instance = %ctx.instance_name(), interval_ms, "periodic trigger");

        let period = Duration::from_millis(interval_ms.unsigned_abs());
        let out = ctx.clone();
        self.task = Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut counter: i64 = 0;
            loop {
                ticker.tick().await;
                counter += 1;
                trace!(instance = %out.instance_name(), counter, "tick");
                out.publish(&Event::long(counter));
            }
        }));
        Ok(())
    }

    async fn stop(&mut self, _ctx: &StageContext) -> anyhow::Result<()> {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::definition::{IoLane, StageDefinition};
    use crate::stages::test_support::started;
    use serde_json::json;

    fn definition(interval: serde_json::Value) -> StageDefinition {
        StageDefinition::new("ns", "Pulse", "core.PeriodicTrigger")
            .with_output_lane(IoLane::event("out_pulse"))
            .with_option_row(
                json!({ "section": "timer", "interval": interval })
                    .as_object()
                    .cloned()
                    .unwrap(),
            )
    }

    #[tokio::test(start_paused = true)]
    async fn publishes_increasing_counter() {
        let bus = EventBus::new();
        let mut out = bus.consumer("ns::out_pulse");
        let (mut trigger, ctx) = started(&bus, definition(json!(100)), PeriodicTrigger::default()).await;

        tokio::time::sleep(Duration::from_millis(350)).await;
        let mut values = Vec::new();
        for _ in 0..3 {
            let message = out.recv().await.unwrap();
            assert_eq!(message.event().path(), &["Pulse-id"]);
            values.push(message.event().payload_as_long());
        }
        assert_eq!(values, vec![1, 2, 3]);

        trigger.stop(&ctx).await.unwrap();
    }

    #[tokio::test]
    async fn missing_interval_fails_start() {
        let bus = EventBus::new();
        let definition = StageDefinition::new("ns", "Pulse", "core.PeriodicTrigger");
        let ctx = StageContext::new("id", std::sync::Arc::new(definition), bus, std::sync::Arc::new(json!({})))
            .unwrap();
        let err = PeriodicTrigger::default().start(&ctx).await.unwrap_err();
        assert!(err.to_string().contains("interval"));
    }

    #[tokio::test]
    async fn string_interval_is_coerced() {
        let bus = EventBus::new();
        let (mut trigger, ctx) = started(&bus, definition(json!("250")), PeriodicTrigger::default()).await;
        assert!(trigger.task.is_some());
        trigger.stop(&ctx).await.unwrap();
    }
}
