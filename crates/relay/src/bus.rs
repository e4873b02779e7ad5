//! In-memory event bus.
//!
//! The bus maps flat string addresses to consumers. Three delivery styles
//! are supported:
//!
//! - [`EventBus::publish`]: every consumer registered on the address gets
//!   a copy.
//! - [`EventBus::send`]: exactly one consumer gets it.
//! - [`EventBus::request`]: exactly one consumer gets it and the caller
//!   awaits one reply, bounded by a timeout.
//!
//! Point-to-point and request delivery pick consumers in strict
//! round-robin order over the consumers registered at send time.
//!
//! Delivery is at-most-once and in-memory. A consumer that is slow only
//! grows its own queue; no ordering is promised across consumers.
//!
//! With wire-codec mode on, each delivered event is framed, encoded and
//! decoded again per recipient, the same path a cross-process transport
//! would take.

use crate::codec::{decode_frame, encode_frame};
use crate::error::{RelayError, Result};
use crate::event::{Event, Status};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tracing::{debug, error, trace, warn};

/// Delivery header naming the sending stage's deployment id.
pub const ORIGIN_HEADER: &str = "Origin";

/// Default bound on [`EventBus::request`].
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-delivery options: transport headers and an optional request timeout.
#[derive(Debug, Clone, Default)]
pub struct DeliveryOptions {
    headers: HashMap<String, String>,
    timeout: Option<Duration>,
}

impl DeliveryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_origin(self, deployment_id: impl Into<String>) -> Self {
        self.with_header(ORIGIN_HEADER, deployment_id)
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

type ReplySender = oneshot::Sender<Result<Event>>;

/// One delivery of an event to one consumer.
pub struct Message {
    address: String,
    event: Event,
    headers: HashMap<String, String>,
    reply: Option<ReplySender>,
    wire_codec: bool,
}

impl Message {
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn event(&self) -> &Event {
        &self.event
    }

    pub fn into_event(self) -> Event {
        self.event
    }

    pub(crate) fn map_event(mut self, f: impl FnOnce(Event) -> Event) -> Self {
        self.event = f(self.event);
        self
    }

    /// Delivery headers (not the event's own headers).
    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// Deployment id of the sender, if it attached one.
    pub fn origin(&self) -> Option<&str> {
        self.headers.get(ORIGIN_HEADER).map(String::as_str)
    }

    /// True when a caller is awaiting a reply.
    pub fn is_request(&self) -> bool {
        self.reply.is_some()
    }

    /// Replies to the requester. The reply is tagged with the request id
    /// unless it already names one.
    ///
    /// Returns false when nobody is waiting (not a request, or the caller
    /// already gave up).
    pub fn reply(self, event: Event) -> bool {
        let Some(tx) = self.reply else {
            return false;
        };
        let event = if event.in_reply_to().is_some() {
            event
        } else {
            event.reply_to(&self.event)
        };
        let event = if self.wire_codec {
            through_wire(&event)
        } else {
            Ok(event)
        };
        tx.send(event).is_ok()
    }

    /// Fails the request with an error status.
    pub fn fail(self, code: u16, message: impl Into<String>) -> bool {
        match self.reply {
            Some(tx) => tx
                .send(Err(RelayError::ReplyFailed {
                    code,
                    message: message.into(),
                }))
                .is_ok(),
            None => false,
        }
    }

    /// Fails the request with the status of `err`.
    pub fn fail_with(self, err: &RelayError) -> bool {
        let code = err.status_code();
        self.fail(code, err.to_string())
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("address", &self.address)
            .field("event", &self.event)
            .field("headers", &self.headers)
            .field("is_request", &self.reply.is_some())
            .finish()
    }
}

fn through_wire(event: &Event) -> Result<Event> {
    let mut frame = encode_frame(event)?;
    decode_frame(&mut frame)
}

struct Registration {
    id: u64,
    tx: mpsc::UnboundedSender<Message>,
}

#[derive(Default)]
struct Route {
    consumers: Vec<Registration>,
    cursor: usize,
}

impl Route {
    fn prune(&mut self) {
        self.consumers.retain(|c| !c.tx.is_closed());
    }

    fn next_sender(&mut self) -> Option<mpsc::UnboundedSender<Message>> {
        self.prune();
        if self.consumers.is_empty() {
            return None;
        }
        let index = self.cursor % self.consumers.len();
        self.cursor = self.cursor.wrapping_add(1);
        Some(self.consumers[index].tx.clone())
    }
}

struct BusInner {
    routes: DashMap<String, Route>,
    next_consumer_id: AtomicU64,
    wire_codec: bool,
    request_timeout: Duration,
}

impl BusInner {
    fn remove(&self, address: &str, id: u64) {
        if let Some(mut route) = self.routes.get_mut(address) {
            route.consumers.retain(|c| c.id != id);
        }
        self.routes.remove_if(address, |_, route| route.consumers.is_empty());
    }
}

/// Handle to the shared bus. Cloning is cheap.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("addresses", &self.inner.routes.len())
            .field("wire_codec", &self.inner.wire_codec)
            .field("request_timeout", &self.inner.request_timeout)
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::configured(false, DEFAULT_REQUEST_TIMEOUT)
    }

    /// Bus with wire-codec mode and a default request timeout.
    pub fn configured(wire_codec: bool, request_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(BusInner {
                routes: DashMap::new(),
                next_consumer_id: AtomicU64::new(1),
                wire_codec,
                request_timeout,
            }),
        }
    }

    pub fn wire_codec(&self) -> bool {
        self.inner.wire_codec
    }

    pub fn request_timeout(&self) -> Duration {
        self.inner.request_timeout
    }

    /// Number of live consumers on `address`.
    pub fn consumer_count(&self, address: &str) -> usize {
        self.inner
            .routes
            .get(address)
            .map_or(0, |route| route.consumers.iter().filter(|c| !c.tx.is_closed()).count())
    }

    pub fn has_consumers(&self, address: &str) -> bool {
        self.consumer_count(address) > 0
    }

    /// Registers a consumer and returns its message stream.
    ///
    /// Registration is complete when this returns; a publish issued after
    /// it is seen by the consumer.
    pub fn consumer(&self, address: impl Into<String>) -> MessageConsumer {
        let (rx, handle) = self.register(address.into());
        MessageConsumer { rx, handle }
    }

    fn register(&self, address: String) -> (mpsc::UnboundedReceiver<Message>, ConsumerHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_consumer_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .routes
            .entry(address.clone())
            .or_default()
            .consumers
            .push(Registration { id, tx });
        trace!(address = %address, consumer = id, "consumer registered");

        let handle = ConsumerHandle {
            inner: Arc::new(HandleInner {
                address,
                id,
                bus: Arc::downgrade(&self.inner),
                task: Mutex::new(None),
                active: AtomicBool::new(true),
            }),
        };
        (rx, handle)
    }

    /// Registers a consumer driven by `handler` on a spawned task.
    ///
    /// Messages are handled one at a time in arrival order. The task ends
    /// when the handle is unregistered.
    pub fn consumer_with_handler<F, Fut>(&self, address: impl Into<String>, handler: F) -> ConsumerHandle
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (mut rx, handle) = self.register(address.into());
        let task = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                handler(message).await;
            }
        });
        *handle.inner.task.lock() = Some(task.abort_handle());
        handle
    }

    /// Delivers a copy of `event` to every consumer on `address`.
    ///
    /// Returns the number of consumers reached. No consumers is not an
    /// error.
    pub fn publish(&self, address: &str, event: &Event, options: &DeliveryOptions) -> usize {
        let senders: Vec<_> = match self.inner.routes.get_mut(address) {
            Some(mut route) => {
                route.prune();
                route.consumers.iter().map(|c| c.tx.clone()).collect()
            }
            None => Vec::new(),
        };
        if senders.is_empty() {
            debug!(address = %address, event = %event.id(), "publish with no consumers");
            return 0;
        }

        let mut delivered = 0;
        for tx in senders {
            let copy = match self.transport(event) {
                Ok(copy) => copy,
                Err(e) => {
                    error!(address = %address, event = %event.id(), error = %e, "wire codec failed");
                    continue;
                }
            };
            if tx.send(self.message(address, copy, options, None)).is_ok() {
                delivered += 1;
            }
        }
        trace!(address = %address, event = %event.id(), delivered, "published");
        delivered
    }

    /// Delivers `event` to exactly one consumer on `address`.
    ///
    /// # Errors
    ///
    /// [`RelayError::NoHandlers`] when nobody consumes the address.
    pub fn send(&self, address: &str, event: &Event, options: &DeliveryOptions) -> Result<()> {
        let message = self.message(address, self.transport(event)?, options, None);
        self.deliver_one(address, message)?;
        trace!(address = %address, event = %event.id(), "sent");
        Ok(())
    }

    /// Delivers `event` to one consumer and awaits its reply.
    ///
    /// # Errors
    ///
    /// - [`RelayError::NoHandlers`] when nobody consumes the address
    /// - [`RelayError::Timeout`] when no reply arrives in time
    /// - [`RelayError::ReplyFailed`] when the responder fails the request
    /// - [`RelayError::Closed`] when the responder drops the request
    pub async fn request(&self, address: &str, event: &Event, options: &DeliveryOptions) -> Result<Event> {
        let timeout = options.timeout.unwrap_or(self.inner.request_timeout);
        let (tx, rx) = oneshot::channel();
        let message = self.message(address, self.transport(event)?, options, Some(tx));
        self.deliver_one(address, message)?;
        trace!(address = %address, event = %event.id(), timeout_ms = timeout.as_millis() as u64, "request sent");

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(RelayError::Closed(format!(
                "{address}: responder dropped request {}",
                event.id()
            ))),
            Err(_) => {
                warn!(address = %address, event = %event.id(), "request timed out");
                Err(RelayError::timeout(address, timeout.as_millis() as u64))
            }
        }
    }

    fn message(
        &self,
        address: &str,
        event: Event,
        options: &DeliveryOptions,
        reply: Option<ReplySender>,
    ) -> Message {
        Message {
            address: address.to_string(),
            event,
            headers: options.headers.clone(),
            reply,
            wire_codec: self.inner.wire_codec,
        }
    }

    fn transport(&self, event: &Event) -> Result<Event> {
        if self.inner.wire_codec {
            through_wire(event)
        } else {
            Ok(event.clone())
        }
    }

    fn deliver_one(&self, address: &str, mut message: Message) -> Result<()> {
        loop {
            let next = self
                .inner
                .routes
                .get_mut(address)
                .and_then(|mut route| route.next_sender());
            let Some(tx) = next else {
                return Err(RelayError::NoHandlers(address.to_string()));
            };
            match tx.send(message) {
                Ok(()) => return Ok(()),
                // consumer closed between selection and send; try the next one
                Err(mpsc::error::SendError(returned)) => message = returned,
            }
        }
    }
}

struct HandleInner {
    address: String,
    id: u64,
    bus: Weak<BusInner>,
    task: Mutex<Option<AbortHandle>>,
    active: AtomicBool,
}

/// Registration handle. Unregistering is idempotent.
#[derive(Clone)]
pub struct ConsumerHandle {
    inner: Arc<HandleInner>,
}

impl ConsumerHandle {
    pub fn address(&self) -> &str {
        &self.inner.address
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Removes the consumer from the bus and stops its handler task.
    ///
    /// Returns true only for the call that actually unregistered.
    pub fn unregister(&self) -> bool {
        if !self.inner.active.swap(false, Ordering::AcqRel) {
            return false;
        }
        if let Some(bus) = self.inner.bus.upgrade() {
            bus.remove(&self.inner.address, self.inner.id);
        }
        if let Some(task) = self.inner.task.lock().take() {
            task.abort();
        }
        trace!(address = %self.inner.address, consumer = self.inner.id, "consumer unregistered");
        true
    }
}

impl std::fmt::Debug for ConsumerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerHandle")
            .field("address", &self.inner.address)
            .field("id", &self.inner.id)
            .field("active", &self.is_active())
            .finish()
    }
}

/// A registered consumer read by the caller. Unregisters on drop.
pub struct MessageConsumer {
    rx: mpsc::UnboundedReceiver<Message>,
    handle: ConsumerHandle,
}

impl MessageConsumer {
    /// Next delivered message, or `None` once unregistered and drained.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    pub fn handle(&self) -> &ConsumerHandle {
        &self.handle
    }

    pub fn unregister(&self) -> bool {
        self.handle.unregister()
    }
}

impl Drop for MessageConsumer {
    fn drop(&mut self) {
        self.handle.unregister();
    }
}

/// Replies with a failure status event instead of an error.
///
/// Used on control addresses where the requester expects an event back.
pub fn reply_with_status(message: Message, status: Status, text: impl Into<String>) -> bool {
    message.reply(Event::failure(status, text))
}
