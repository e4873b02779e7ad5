//! The stage lifecycle contract.
//!
//! A [`Stage`] is started with a [`StageContext`] and uses it to resolve
//! lanes, subscribe to input lanes and publish or send on output lanes.
//! Every consumer registered through the context is tracked and removed
//! when the stage stops, so no consumer outlives its stage.
//!
//! Provenance: an event published through the context carries the sender's
//! deployment id as its last path element, and a subscribed handler sees
//! the receiver's id appended after it.
//!
//! ```ignore
//! struct Upper;
//!
//! #[async_trait]
//! impl Stage for Upper {
//!     async fn start(&mut self, ctx: &StageContext) -> anyhow::Result<()> {
//!         let out = ctx.clone();
//!         ctx.subscribe(IoLaneType::Event, move |message: Message| {
//!             let out = out.clone();
//!             async move {
//!                 let text = message.event().payload_as_string().to_uppercase();
//!                 out.publish(&Event::text(text));
//!             }
//!         });
//!         Ok(())
//!     }
//! }
//! ```

use crate::bus::{ConsumerHandle, DeliveryOptions, EventBus, Message};
use crate::definition::{IoLane, IoLaneType, StageDefinition};
use crate::error::{RelayError, Result};
use crate::event::Event;
use crate::lane::{self, DeliveryMode};
use crate::options::StageOptions;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// A processing unit instantiated from a [`StageDefinition`].
#[async_trait]
pub trait Stage: Send + Sync + 'static {
    /// Subscribes to lanes and starts any background work.
    async fn start(&mut self, ctx: &StageContext) -> anyhow::Result<()>;

    /// Releases stage-owned resources. Consumers registered through the
    /// context are removed by the runtime after this returns.
    async fn stop(&mut self, _ctx: &StageContext) -> anyhow::Result<()> {
        Ok(())
    }
}

struct ContextInner {
    id: String,
    definition: Arc<StageDefinition>,
    opts: StageOptions,
    bus: EventBus,
    settings: Arc<serde_json::Value>,
    consumers: Mutex<Vec<ConsumerHandle>>,
}

/// What a running stage sees of the runtime. Cloning is cheap.
#[derive(Clone)]
pub struct StageContext {
    inner: Arc<ContextInner>,
}

impl StageContext {
    /// Builds a context for one stage instance.
    ///
    /// # Errors
    ///
    /// Fails when the definition's options cannot be grouped into sections.
    pub fn new(
        id: impl Into<String>,
        definition: Arc<StageDefinition>,
        bus: EventBus,
        settings: Arc<serde_json::Value>,
    ) -> Result<Self> {
        let opts = definition.opts()?;
        Ok(Self {
            inner: Arc::new(ContextInner {
                id: id.into(),
                definition,
                opts,
                bus,
                settings,
                consumers: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Deployment id shared by every instance of this deployment.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn definition(&self) -> &StageDefinition {
        &self.inner.definition
    }

    pub fn opts(&self) -> &StageOptions {
        &self.inner.opts
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    /// Process configuration.
    pub fn settings(&self) -> &serde_json::Value {
        &self.inner.settings
    }

    pub fn environment(&self) -> &std::collections::BTreeMap<String, String> {
        &self.inner.definition.environment
    }

    pub fn namespace(&self) -> &str {
        &self.inner.definition.namespace
    }

    pub fn instance_name(&self) -> &str {
        &self.inner.definition.instance_name
    }

    /// Bus address of a lane name in this stage's namespace.
    pub fn address(&self, lane_name: &str) -> String {
        lane::address(self.namespace(), lane_name)
    }

    /// Input lane by name, case-insensitively.
    pub fn input_lane(&self, name: &str) -> Result<&IoLane> {
        self.definition()
            .input_lane(name)
            .ok_or_else(|| RelayError::LaneNotFound(name.to_string()))
    }

    /// Output lane by name, case-insensitively.
    pub fn output_lane(&self, name: &str) -> Result<&IoLane> {
        self.definition()
            .output_lane(name)
            .ok_or_else(|| RelayError::LaneNotFound(name.to_string()))
    }

    pub fn input_lanes(&self, lane_type: IoLaneType) -> impl Iterator<Item = &IoLane> {
        self.definition()
            .input_lanes
            .iter()
            .filter(move |lane| lane.lane_type == lane_type)
    }

    pub fn output_lanes(&self, lane_type: IoLaneType) -> impl Iterator<Item = &IoLane> {
        self.definition()
            .output_lanes
            .iter()
            .filter(move |lane| lane.lane_type == lane_type)
    }

    /// Delivery options carrying this stage's origin header.
    pub fn delivery_options(&self) -> DeliveryOptions {
        DeliveryOptions::new().with_origin(self.id())
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    /// Registers `handler` on every input lane of `lane_type`.
    ///
    /// Returns the number of lanes subscribed.
    pub fn subscribe<H, Fut>(&self, lane_type: IoLaneType, handler: H) -> usize
    where
        H: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let lanes: Vec<IoLane> = self.input_lanes(lane_type).cloned().collect();
        self.subscribe_all(&lanes, handler)
    }

    /// Like [`subscribe`](Self::subscribe), limited to lanes whose name
    /// starts with `prefix`.
    pub fn subscribe_prefix<H, Fut>(&self, lane_type: IoLaneType, prefix: &str, handler: H) -> usize
    where
        H: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let lanes: Vec<IoLane> = self
            .input_lanes(lane_type)
            .filter(|lane| lane.name.starts_with(prefix))
            .cloned()
            .collect();
        self.subscribe_all(&lanes, handler)
    }

    /// Registers `handler` on one named input lane.
    pub fn subscribe_lane<H, Fut>(&self, lane_name: &str, handler: H) -> Result<()>
    where
        H: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let lane = self.input_lane(lane_name)?.clone();
        self.subscribe_all(std::slice::from_ref(&lane), handler);
        Ok(())
    }

    fn subscribe_all<H, Fut>(&self, lanes: &[IoLane], handler: H) -> usize
    where
        H: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler = Arc::new(handler);
        for lane in lanes {
            let address = self.address(&lane.name);
            debug!(
                instance = %self.instance_name(),
                address = %address,
                lane_type = ?lane.lane_type,
                "subscribing"
            );
            let handler = handler.clone();
            let receiver_id = self.id().to_string();
            let handle = self.bus().consumer_with_handler(address, move |message: Message| {
                (*handler)(message.map_event(|event| event.add_path(receiver_id.as_str())))
            });
            self.inner.consumers.lock().push(handle);
        }
        lanes.len()
    }

    /// Consumers registered through this context.
    pub fn consumer_count(&self) -> usize {
        self.inner.consumers.lock().len()
    }

    /// Unregisters every tracked consumer. Safe to call more than once.
    pub fn stop_consumers(&self) {
        let consumers = std::mem::take(&mut *self.inner.consumers.lock());
        for consumer in &consumers {
            consumer.unregister();
        }
        trace!(instance = %self.instance_name(), count = consumers.len(), "consumers stopped");
    }

    // ========================================================================
    // Output
    // ========================================================================

    fn stamp(&self, event: &Event) -> Event {
        if event.path().last().map(String::as_str) == Some(self.id()) {
            event.clone()
        } else {
            event.clone().add_path(self.id())
        }
    }

    /// `event` carrying `source`'s provenance, ending in this stage's id.
    pub fn derive(&self, source: &Event, event: Event) -> Event {
        let mut path = source.path().to_vec();
        if path.last().map(String::as_str) != Some(self.id()) {
            path.push(self.id().to_string());
        }
        event.with_path(path)
    }

    fn deliver(&self, lane: &IoLane, event: &Event) {
        let address = self.address(&lane.name);
        let options = self.delivery_options();
        match DeliveryMode::of(lane) {
            DeliveryMode::PointToPoint => {
                if let Err(e) = self.bus().send(&address, event, &options) {
                    warn!(instance = %self.instance_name(), address = %address, error = %e, "p2p delivery failed");
                }
            }
            DeliveryMode::Broadcast => {
                self.bus().publish(&address, event, &options);
            }
            DeliveryMode::RequestReply | DeliveryMode::Unrouted => {
                warn!(
                    instance = %self.instance_name(),
                    lane = %lane.name,
                    "lane does not accept published events"
                );
            }
        }
    }

    /// Publishes to every EVENT output lane, honoring each lane's `p2p`
    /// flag. Returns the number of lanes used.
    pub fn publish(&self, event: &Event) -> usize {
        let event = self.stamp(event);
        let lanes: Vec<&IoLane> = self.output_lanes(IoLaneType::Event).collect();
        for lane in &lanes {
            self.deliver(lane, &event);
        }
        lanes.len()
    }

    /// Publishes to one named output lane.
    pub fn publish_to(&self, lane_name: &str, event: &Event) -> Result<()> {
        let lane = self.output_lane(lane_name)?;
        self.deliver(lane, &self.stamp(event));
        Ok(())
    }

    /// Sends a request on an INTERACTIVE output lane and awaits the reply.
    ///
    /// # Errors
    ///
    /// - [`RelayError::LaneNotFound`] for an undeclared lane
    /// - [`RelayError::LaneType`] when the lane is not INTERACTIVE
    /// - any failure of [`EventBus::request`]
    pub async fn send(&self, lane_name: &str, event: &Event) -> Result<Event> {
        self.send_with_timeout(lane_name, event, self.bus().request_timeout())
            .await
    }

    pub async fn send_with_timeout(
        &self,
        lane_name: &str,
        event: &Event,
        timeout: Duration,
    ) -> Result<Event> {
        let lane = self.output_lane(lane_name)?;
        if lane.lane_type != IoLaneType::Interactive {
            return Err(RelayError::LaneType {
                lane: lane.name.clone(),
                expected: IoLaneType::Interactive,
                actual: lane.lane_type,
            });
        }
        let address = self.address(&lane.name);
        let options = self.delivery_options().with_timeout(timeout);
        self.bus().request(&address, &self.stamp(event), &options).await
    }

    /// Sends a request and invokes `reply_handler` exactly once with the
    /// reply or the failure.
    pub fn send_with_handler<F>(&self, lane_name: &str, event: Event, reply_handler: F)
    where
        F: FnOnce(Result<Event>) + Send + 'static,
    {
        let ctx = self.clone();
        let lane_name = lane_name.to_string();
        tokio::spawn(async move {
            let result = ctx.send(&lane_name, &event).await;
            reply_handler(result);
        });
    }
}

impl std::fmt::Debug for StageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageContext")
            .field("id", &self.inner.id)
            .field("instance", &self.inner.definition.instance_name)
            .field("namespace", &self.inner.definition.namespace)
            .finish()
    }
}

/// Builds a stage instance for a definition.
pub type StageFactory = Arc<dyn Fn(&StageDefinition) -> Result<Box<dyn Stage>> + Send + Sync>;

/// Maps the `type` string of a definition to a stage factory.
#[derive(Clone, Default)]
pub struct StageCatalog {
    factories: HashMap<String, StageFactory>,
}

impl StageCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory, replacing any previous one for `stage_type`.
    pub fn register<F>(&mut self, stage_type: impl Into<String>, factory: F)
    where
        F: Fn(&StageDefinition) -> Result<Box<dyn Stage>> + Send + Sync + 'static,
    {
        self.factories.insert(stage_type.into(), Arc::new(factory));
    }

    #[must_use]
    pub fn with_stage<F>(mut self, stage_type: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&StageDefinition) -> Result<Box<dyn Stage>> + Send + Sync + 'static,
    {
        self.register(stage_type, factory);
        self
    }

    pub fn contains(&self, stage_type: &str) -> bool {
        self.factories.contains_key(stage_type)
    }

    pub fn stage_types(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Instantiates the stage named by `definition.stage_type`.
    pub fn create(&self, definition: &StageDefinition) -> Result<Box<dyn Stage>> {
        let factory = self
            .factories
            .get(&definition.stage_type)
            .ok_or_else(|| RelayError::UnknownStageType(definition.stage_type.clone()))?;
        factory(definition)
    }
}

impl std::fmt::Debug for StageCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<&str> = self.stage_types().collect();
        types.sort_unstable();
        f.debug_struct("StageCatalog").field("types", &types).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::IoLane;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    fn context(bus: &EventBus, definition: StageDefinition) -> StageContext {
        StageContext::new("dep-1", Arc::new(definition), bus.clone(), Arc::new(serde_json::json!({})))
            .unwrap()
    }

    #[tokio::test]
    async fn publish_stamps_sender_and_receiver_ids() {
        let bus = EventBus::new();
        let sender = context(
            &bus,
            StageDefinition::new("ns", "A", "t").with_output_lane(IoLane::event("out")),
        );
        let receiver = StageContext::new(
            "dep-2",
            Arc::new(StageDefinition::new("ns", "B", "t").with_input_lane(IoLane::event("out"))),
            bus.clone(),
            Arc::new(serde_json::json!({})),
        )
        .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        receiver.subscribe(IoLaneType::Event, move |message: Message| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(message);
            }
        });

        assert_eq!(sender.publish(&Event::text("hello")), 1);
        let message = rx.recv().await.unwrap();
        assert_eq!(message.origin(), Some("dep-1"));
        assert_eq!(message.event().path(), &["dep-1", "dep-2"]);
        assert_eq!(message.event().payload_as_string(), "hello");
    }

    #[tokio::test]
    async fn subscribe_by_prefix_and_by_name() {
        let bus = EventBus::new();
        let ctx = context(
            &bus,
            StageDefinition::new("ns", "C", "t")
                .with_input_lane(IoLane::event("NEXT_a"))
                .with_input_lane(IoLane::event("NEXT_b"))
                .with_input_lane(IoLane::event("THIS_a")),
        );

        assert_eq!(ctx.subscribe_prefix(IoLaneType::Event, "NEXT", |_m: Message| async {}), 2);
        assert!(ctx.subscribe_lane("this_A", |_m: Message| async {}).is_ok());
        assert!(matches!(
            ctx.subscribe_lane("missing", |_m: Message| async {}),
            Err(RelayError::LaneNotFound(_))
        ));
        assert_eq!(ctx.consumer_count(), 3);
        assert!(bus.has_consumers("ns::NEXT_a"));

        ctx.stop_consumers();
        ctx.stop_consumers();
        assert_eq!(ctx.consumer_count(), 0);
        assert!(!bus.has_consumers("ns::NEXT_a"));
        assert!(!bus.has_consumers("ns::THIS_a"));
    }

    #[tokio::test]
    async fn p2p_output_reaches_one_subscriber() {
        let bus = EventBus::new();
        let ctx = context(
            &bus,
            StageDefinition::new("ns", "A", "t").with_output_lane(IoLane::event("work").p2p()),
        );
        let hits = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..3 {
            let hits = hits.clone();
            handles.push(bus.consumer_with_handler("ns::work", move |_m: Message| {
                let hits = hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }

        ctx.publish(&Event::text("job"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn send_with_handler_fires_once_on_failure() {
        let bus = EventBus::new();
        let ctx = context(
            &bus,
            StageDefinition::new("ns", "A", "t").with_output_lane(IoLane::interactive("ask")),
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        ctx.send_with_handler("ask", Event::text("?"), move |result| {
            let _ = tx.send(result.is_err());
        });
        assert_eq!(rx.recv().await, Some(true));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn send_requires_an_interactive_lane() {
        let bus = EventBus::new();
        let mut listener = bus.consumer("ns::out");
        let ctx = context(
            &bus,
            StageDefinition::new("ns", "A", "t").with_output_lane(IoLane::event("out")),
        );

        let err = ctx.send("out", &Event::text("?")).await.unwrap_err();
        assert!(matches!(
            err,
            RelayError::LaneType {
                expected: IoLaneType::Interactive,
                actual: IoLaneType::Event,
                ..
            }
        ));
        assert_eq!(err.status_code(), 400);
        assert!(matches!(
            ctx.send("missing", &Event::text("?")).await,
            Err(RelayError::LaneNotFound(_))
        ));
        // Nothing went out on the EVENT lane.
        assert!(listener.unregister());
        assert!(listener.recv().await.is_none());
    }

    #[test]
    fn catalog_rejects_unknown_types() {
        let catalog = StageCatalog::new();
        let err = catalog
            .create(&StageDefinition::new("ns", "X", "core.Missing"))
            .err()
            .unwrap();
        assert!(matches!(err, RelayError::UnknownStageType(t) if t == "core.Missing"));
    }
}
