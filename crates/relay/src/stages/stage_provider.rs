use crate::boot::builtin_definitions;
use crate::bus::Message;
use crate::definition::IoLaneType;
use crate::error::Result;
use crate::event::{Event, Status};
use crate::stage::{Stage, StageContext};
use async_trait::async_trait;
use tracing::error;

/// Serves the built-in stage definitions as a JSON array: as a reply on
/// INTERACTIVE lanes, as a published event for EVENT lanes.
#[derive(Debug, Default)]
pub struct StageProvider;

fn definitions_event(settings: &serde_json::Value) -> Result<Event> {
    let definitions = builtin_definitions(settings)?;
    Ok(Event::json(&serde_json::to_value(definitions)?))
}

#[async_trait]
impl Stage for StageProvider {
    async fn start(&mut self, ctx: &StageContext) -> anyhow::Result<()> {
        let out = ctx.clone();
        ctx.subscribe(IoLaneType::Event, move |message: Message| {
            let source = message.event();
            let event = match definitions_event(out.settings()) {
                Ok(event) => event.with_status(Status::Ok),
                Err(e) => {
                    error!(instance = %out.instance_name(), error = %e, "cannot load built-in stages");
                    Event::text(e.to_string()).with_status(Status::InternalServerError)
                }
            };
            out.publish(&out.derive(source, event));
            async {}
        });

        let out = ctx.clone();
        ctx.subscribe(IoLaneType::Interactive, move |message: Message| {
            match definitions_event(out.settings()) {
                Ok(event) => {
                    let reply = out.derive(message.event(), event.with_status(Status::Ok));
                    message.reply(reply);
                }
                Err(e) => {
                    error!(instance = %out.instance_name(), error = %e, "cannot load built-in stages");
                    message.fail(Status::InternalServerError.code(), e.to_string());
                }
            }
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
    use crate::event::ContentType;
    use crate::stages::test_support::started;

    fn definition() -> StageDefinition {
        StageDefinition::new("core", "StageProvider_01", "core.StageProvider")
            .with_input_lane(IoLane::interactive("get_core_stages"))
            .with_input_lane(IoLane::event("in_core_stages"))
            .with_output_lane(IoLane::event("out_core_stages"))
    }

    #[tokio::test]
    async fn replies_with_builtin_definitions() {
        let bus = EventBus::new();
        let _started = started(&bus, definition(), StageProvider).await;

        let reply = bus
            .request("core::get_core_stages", &Event::empty(), &DeliveryOptions::new())
            .await
            .unwrap();
        assert_eq!(reply.content_type(), ContentType::JsonArray);
        assert_eq!(reply.status(), Status::Ok);
        let stages = reply.payload_as_json().unwrap();
        let names: Vec<&str> = stages
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|s| s["instanceName"].as_str())
            .collect();
        assert!(names.contains(&"EventLogSink_01"));
        assert!(names.contains(&"StageProvider_01"));
    }

    #[tokio::test]
    async fn publishes_on_event_request() {
        let bus = EventBus::new();
        let mut out = bus.consumer("core::out_core_stages");
        let _started = started(&bus, definition(), StageProvider).await;

        bus.publish("core::in_core_stages", &Event::empty().add_path("asker"), &DeliveryOptions::new());
        let event = out.recv().await.unwrap().into_event();
        assert_eq!(event.path(), &["asker", "StageProvider_01-id"]);
        assert!(event.payload_as_json().unwrap().is_array());
    }
}
