//! Testing utilities for relay stages and topologies.
//!
//! - [`EventTap`] listens on a bus address and collects what arrives
//! - [`RecordingStage`] is a stage that records every event on its EVENT
//!   input lanes and can answer INTERACTIVE requests
//!
//! ```ignore
//! let runtime = RuntimeBuilder::new(config)
//!     .with_stage("test.Recorder", RecordingStage::factory(recorder.clone()))
//!     .build()
//!     .await?;
//!
//! let mut tap = EventTap::listen(runtime.bus(), "ns::out");
//! let event = tap.next_within(Duration::from_secs(1)).await?;
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use relay_core::{
    Event, EventBus, IoLaneType, Message, MessageConsumer, RelayError, Stage, StageContext,
    StageDefinition,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::trace;

// ============================================================================
// EventTap
// ============================================================================

/// A consumer on one address, for assertions.
pub struct EventTap {
    address: String,
    consumer: MessageConsumer,
}

impl EventTap {
    /// Registers on `address`. Events published after this returns are
    /// captured.
    pub fn listen(bus: &EventBus, address: impl Into<String>) -> Self {
        let address = address.into();
        let consumer = bus.consumer(address.as_str());
        Self { address, consumer }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Next event, waiting at most `timeout`.
    pub async fn next_within(&mut self, timeout: Duration) -> Result<Event, RelayError> {
        match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Ok(Some(message)) => Ok(message.into_event()),
            Ok(None) => Err(RelayError::Closed(self.address.clone())),
            Err(_) => Err(RelayError::timeout(self.address.as_str(), timeout.as_millis() as u64)),
        }
    }

    /// Collects `count` events, each within `timeout`.
    pub async fn take(&mut self, count: usize, timeout: Duration) -> Result<Vec<Event>, RelayError> {
        let mut events = Vec::with_capacity(count);
        for _ in 0..count {
            events.push(self.next_within(timeout).await?);
        }
        Ok(events)
    }

    /// True when nothing arrives within `window`.
    pub async fn is_quiet(&mut self, window: Duration) -> bool {
        self.next_within(window).await.is_err()
    }
}

impl std::fmt::Debug for EventTap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventTap")
            .field("address", &self.address)
            .finish()
    }
}

// ============================================================================
// RecordingStage
// ============================================================================

type Responder = Arc<dyn Fn(&Event) -> Event + Send + Sync>;

/// Events seen by every [`RecordingStage`] built from it.
#[derive(Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<Event>>>,
    ids: Arc<Mutex<Vec<String>>>,
    arrived: Arc<Notify>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// Deployment ids of the stages that started with this recorder.
    pub fn stage_ids(&self) -> Vec<String> {
        self.ids.lock().clone()
    }

    /// Waits until at least `count` events were recorded.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> Result<Vec<Event>, RelayError> {
        let wait = async {
            loop {
                let notified = self.arrived.notified();
                if self.len() >= count {
                    return self.events();
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| RelayError::timeout("recorder", timeout.as_millis() as u64))
    }

    fn record(&self, event: Event) {
        self.events.lock().push(event);
        self.arrived.notify_waiters();
    }
}

impl std::fmt::Debug for Recorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recorder").field("events", &self.len()).finish()
    }
}

/// Records EVENT-lane inputs into a [`Recorder`]. With a responder it also
/// answers INTERACTIVE requests.
pub struct RecordingStage {
    recorder: Recorder,
    responder: Option<Responder>,
}

impl RecordingStage {
    pub fn new(recorder: Recorder) -> Self {
        Self {
            recorder,
            responder: None,
        }
    }

    #[must_use]
    pub fn with_responder<F>(mut self, responder: F) -> Self
    where
        F: Fn(&Event) -> Event + Send + Sync + 'static,
    {
        self.responder = Some(Arc::new(responder));
        self
    }

    /// Catalog factory producing stages that share `recorder`.
    pub fn factory(
        recorder: Recorder,
    ) -> impl Fn(&StageDefinition) -> relay_core::Result<Box<dyn Stage>> + Send + Sync + 'static {
        move |_definition: &StageDefinition| {
            let stage: Box<dyn Stage> = Box::new(RecordingStage::new(recorder.clone()));
            Ok(stage)
        }
    }
}

#[async_trait]
impl Stage for RecordingStage {
    async fn start(&mut self, ctx: &StageContext) -> anyhow::Result<()> {
        self.recorder.ids.lock().push(ctx.id().to_string());

        let recorder = self.recorder.clone();
        ctx.subscribe(IoLaneType::Event, move |message: Message| {
            trace!(address = %message.address(), "recorded");
            recorder.record(message.into_event());
            async {}
        });

        if let Some(responder) = self.responder.clone() {
            let out = ctx.clone();
            ctx.subscribe(IoLaneType::Interactive, move |message: Message| {
                let reply = out.derive(message.event(), responder(message.event()));
                message.reply(reply);
                async {}
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for RecordingStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingStage")
            .field("recorder", &self.recorder)
            .field("responds", &self.responder.is_some())
            .finish()
    }
}
