use crate::bus::Message;
use crate::definition::IoLaneType;
use crate::event::Event;
use crate::lane::lane_name_from_address;
use crate::options::ConfigKey;
use crate::stage::{Stage, StageContext};
use crate::window::{EventWindow, WindowResult};
use anyhow::bail;
use async_trait::async_trait;
use serde_json::{json, Map};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

const DEFAULT_TIMEOUT_MS: i64 = 10_000;

/// Joins one event from each EVENT input lane.
///
/// Section `join` sets `timeout` (ms, default 10000, 0 for none) and
/// `maxElements` (default: the lane count). Each closed window is
/// published as `{"complete": bool, "values": {lane: payload text}}`. The
/// window reopens as it closes, so back-to-back rounds are all joined.
#[derive(Debug, Default)]
pub struct JoinProcessor {
    window: Option<EventWindow<Event>>,
    task: Option<JoinHandle<()>>,
}

fn result_event(result: &WindowResult<Event>) -> Event {
    let values: Map<String, serde_json::Value> = result
        .values
        .iter()
        .map(|(lane, event)| (lane.clone(), json!(event.payload_as_string())))
        .collect();
    Event::json(&json!({ "complete": result.complete, "values": values }))
}

#[async_trait]
impl Stage for JoinProcessor {
    async fn start(&mut self, ctx: &StageContext) -> anyhow::Result<()> {
        let lanes: Vec<String> = ctx
            .input_lanes(IoLaneType::Event)
            .map(|lane| lane.name.clone())
            .collect();
        if lanes.is_empty() {
            bail!("join processor needs at least one EVENT input lane");
        }

        let block = ctx.opts().section(ConfigKey::JOIN.key).block();
        let timeout_ms: i64 = block.get_or(ConfigKey::TIMEOUT.key, DEFAULT_TIMEOUT_MS);
        let max_elements = block
            .get_long(ConfigKey::MAX_ELEMENTS.key)
            .map(|n| usize::try_from(n.max(1)).unwrap_or(1));
        let time_window = (timeout_ms > 0).then(|| Duration::from_millis(timeout_ms.unsigned_abs()));
        debug!(
            instance = %ctx.instance_name(),
            lanes = ?lanes,
            timeout_ms,
            ?max_elements,
            "join window"
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        let window = EventWindow::recurring(lanes, max_elements, time_window, move |result| {
            let _ = tx.send(result);
        });

        let out = ctx.clone();
        self.task = Some(tokio::spawn(async move {
            while let Some(result) = rx.recv().await {
                if result.values.is_empty() {
                    debug!(instance = %out.instance_name(), "window closed empty");
                } else {
                    out.publish(&result_event(&result));
                }
            }
        }));

        let slots = window.clone();
        let instance = ctx.instance_name().to_string();
        ctx.subscribe(IoLaneType::Event, move |message: Message| {
            let slot = lane_name_from_address(message.address()).to_string();
            if !slots.offer(&slot, message.into_event()) {
                debug!(instance = %instance, slot = %slot, "event not joined, slot already filled");
            }
            async {}
        });
        self.window = Some(window);
        Ok(())
    }

    async fn stop(&mut self, _ctx: &StageContext) -> anyhow::Result<()> {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.window = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{DeliveryOptions, EventBus};
    use crate::definition::{IoLane, StageDefinition};
    use crate::stages::test_support::{settle, started};

    fn definition(join: serde_json::Value) -> StageDefinition {
        StageDefinition::new("ns", "Join", "core.JoinProcessor")
            .with_input_lane(IoLane::event("left"))
            .with_input_lane(IoLane::event("right"))
            .with_output_lane(IoLane::event("joined"))
            .with_option_row(join.as_object().cloned().unwrap())
    }

    #[tokio::test]
    async fn publishes_complete_join_and_reopens() {
        let bus = EventBus::new();
        let mut out = bus.consumer("ns::joined");
        let (_join, _ctx) =
            started(&bus, definition(json!({ "section": "join", "timeout": 0 })), JoinProcessor::default()).await;

        let options = DeliveryOptions::new();
        bus.publish("ns::left", &Event::text("L1"), &options);
        bus.publish("ns::right", &Event::text("R1"), &options);

        let joined = out.recv().await.unwrap().event().payload_as_json().unwrap();
        assert_eq!(joined, json!({ "complete": true, "values": { "left": "L1", "right": "R1" } }));

        bus.publish("ns::right", &Event::text("R2"), &options);
        bus.publish("ns::left", &Event::text("L3"), &options);
        let joined = out.recv().await.unwrap().event().payload_as_json().unwrap();
        assert_eq!(joined["values"], json!({ "left": "L3", "right": "R2" }));
    }

    #[tokio::test]
    async fn back_to_back_rounds_are_both_joined() {
        let bus = EventBus::new();
        let mut out = bus.consumer("ns::joined");
        let (_join, _ctx) =
            started(&bus, definition(json!({ "section": "join", "timeout": 0 })), JoinProcessor::default()).await;

        let options = DeliveryOptions::new();
        bus.publish("ns::left", &Event::text("L1"), &options);
        settle().await;
        // R1 closes the first round and R2 lands in the second before the
        // first result is published.
        bus.publish("ns::right", &Event::text("R1"), &options);
        bus.publish("ns::right", &Event::text("R2"), &options);
        bus.publish("ns::left", &Event::text("L2"), &options);

        let first = out.recv().await.unwrap().event().payload_as_json().unwrap();
        let second = out.recv().await.unwrap().event().payload_as_json().unwrap();
        assert_eq!(first["values"], json!({ "left": "L1", "right": "R1" }));
        assert_eq!(second["values"], json!({ "left": "L2", "right": "R2" }));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_publishes_partial_join() {
        let bus = EventBus::new();
        let mut out = bus.consumer("ns::joined");
        let (_join, _ctx) =
            started(&bus, definition(json!({ "section": "join", "timeout": 200 })), JoinProcessor::default()).await;

        bus.publish("ns::left", &Event::text("only"), &DeliveryOptions::new());
        let joined = out.recv().await.unwrap().event().payload_as_json().unwrap();
        assert_eq!(joined, json!({ "complete": false, "values": { "left": "only" } }));
    }
}
