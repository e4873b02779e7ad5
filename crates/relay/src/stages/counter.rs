use crate::bus::Message;
use crate::definition::IoLaneType;
use crate::event::Event;
use crate::options::{ConfigKey, DEFAULT_SECTION_NAME};
use crate::stage::{Stage, StageContext};
use async_trait::async_trait;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::debug;

const NEXT_PREFIX: &str = "NEXT";
const THIS_PREFIX: &str = "THIS";

/// A counter driven by its input lanes.
///
/// Events on lanes prefixed `NEXT` advance the counter by `increment` and
/// publish the new value; events on lanes prefixed `THIS` publish the
/// current value.
#[derive(Debug, Default)]
pub struct Counter {
    value: Arc<AtomicI64>,
}

impl Counter {
    pub fn value(&self) -> i64 {
        self.value.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Stage for Counter {
    async fn start(&mut self, ctx: &StageContext) -> anyhow::Result<()> {
        let block = ctx.opts().section(DEFAULT_SECTION_NAME).block();
        let start_count: i64 = block.get_or(ConfigKey::START_COUNT.key, 0);
        let increment: i64 = block.get_or(ConfigKey::INCREMENT.key, 1);
        self.value.store(start_count, Ordering::SeqCst);
        debug!(instance = %ctx.instance_name(), start_count, increment, "counter");

        let value = self.value.clone();
        let out = ctx.clone();
        ctx.subscribe_prefix(IoLaneType::Event, NEXT_PREFIX, move |message: Message| {
            let next = value.fetch_add(increment, Ordering::SeqCst) + increment;
            out.publish(&out.derive(message.event(), Event::long(next)));
            async {}
        });

        let value = self.value.clone();
        let out = ctx.clone();
        ctx.subscribe_prefix(IoLaneType::Event, THIS_PREFIX, move |message: Message| {
            let current = value.load(Ordering::SeqCst);
            out.publish(&out.derive(message.event(), Event::long(current)));
            async {}
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{DeliveryOptions, EventBus};
    use crate::definition::{IoLane, StageDefinition};
    use crate::stages::test_support::started;
    use serde_json::json;

    #[tokio::test]
    async fn next_advances_and_this_reports() {
        let bus = EventBus::new();
        let definition = StageDefinition::new("ns", "Counter", "core.Counter")
            .with_input_lane(IoLane::event("NEXT_tick"))
            .with_input_lane(IoLane::event("THIS_value"))
            .with_output_lane(IoLane::event("count"))
            .with_option_row(
                json!({ "section": "main", "startCount": 10, "increment": "5" })
                    .as_object()
                    .cloned()
                    .unwrap(),
            );
        let mut out = bus.consumer("ns::count");
        let (counter, _ctx) = started(&bus, definition, Counter::default()).await;
        assert_eq!(counter.value(), 10);

        let trigger = Event::text("go").add_path("upstream");
        bus.publish("ns::NEXT_tick", &trigger, &DeliveryOptions::new());
        let first = out.recv().await.unwrap().into_event();
        assert_eq!(first.payload_as_long(), 15);
        assert_eq!(first.path(), &["upstream", "Counter-id"]);

        bus.publish("ns::NEXT_tick", &trigger, &DeliveryOptions::new());
        assert_eq!(out.recv().await.unwrap().event().payload_as_long(), 20);

        bus.publish("ns::THIS_value", &trigger, &DeliveryOptions::new());
        assert_eq!(out.recv().await.unwrap().event().payload_as_long(), 20);
        assert_eq!(counter.value(), 20);
    }

    #[tokio::test]
    async fn defaults_without_options() {
        let bus = EventBus::new();
        let definition = StageDefinition::new("ns", "Counter", "core.Counter")
            .with_input_lane(IoLane::event("NEXT"))
            .with_output_lane(IoLane::event("count"));
        let mut out = bus.consumer("ns::count");
        let _started = started(&bus, definition, Counter::default()).await;

        bus.publish("ns::NEXT", &Event::empty(), &DeliveryOptions::new());
        assert_eq!(out.recv().await.unwrap().event().payload_as_long(), 1);
    }
}
