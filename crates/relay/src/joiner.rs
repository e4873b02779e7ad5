//! Request/response correlation across two addresses.
//!
//! [`RequestResponseJoiner`] turns a publish on one address into an awaited
//! reply on another. The response listener is registered before the request
//! goes out, responses that do not correlate are ignored, and the listener
//! is removed whether the call matches or times out.

use crate::bus::{DeliveryOptions, EventBus};
use crate::error::{RelayError, Result};
use crate::event::Event;
use std::time::Duration;
use tracing::{debug, trace};

/// How a response is matched to its request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Correlation {
    /// The response's reply-to header names the request id.
    #[default]
    ReplyTo,
    /// The response's path contains this id.
    Path(String),
}

impl Correlation {
    pub fn matches(&self, request: &Event, response: &Event) -> bool {
        match self {
            Correlation::ReplyTo => response.in_reply_to() == Some(request.id()),
            Correlation::Path(id) => response.path().iter().any(|p| p == id),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RequestResponseJoiner {
    bus: EventBus,
    request_address: String,
    response_address: String,
    timeout: Duration,
    correlation: Correlation,
    options: DeliveryOptions,
}

impl RequestResponseJoiner {
    /// Joiner bounded by the bus request timeout.
    pub fn new(
        bus: EventBus,
        request_address: impl Into<String>,
        response_address: impl Into<String>,
    ) -> Self {
        let timeout = bus.request_timeout();
        Self {
            bus,
            request_address: request_address.into(),
            response_address: response_address.into(),
            timeout,
            correlation: Correlation::default(),
            options: DeliveryOptions::new(),
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_correlation(mut self, correlation: Correlation) -> Self {
        self.correlation = correlation;
        self
    }

    #[must_use]
    pub fn with_options(mut self, options: DeliveryOptions) -> Self {
        self.options = options;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Publishes `request` and waits for the first correlated response.
    ///
    /// # Errors
    ///
    /// [`RelayError::Timeout`] when nothing matches in time.
    pub async fn run(&self, request: Event) -> Result<Event> {
        let mut consumer = self.bus.consumer(self.response_address.as_str());
        debug!(
            request = %self.request_address,
            response = %self.response_address,
            timeout_ms = self.timeout.as_millis() as u64,
            "joining"
        );
        self.bus.publish(&self.request_address, &request, &self.options);

        let wait = async {
            while let Some(message) = consumer.recv().await {
                let matched = self.correlation.matches(&request, message.event());
                trace!(matched, event = %message.event(), "response received");
                if matched {
                    return Ok(message.into_event());
                }
            }
            Err(RelayError::Closed(self.response_address.clone()))
        };
        let result = match tokio::time::timeout(self.timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(RelayError::timeout(
                self.response_address.as_str(),
                self.timeout.as_millis() as u64,
            )),
        };
        consumer.unregister();
        result
    }

    /// Publishes a text request stamped with `origin_id`, correlated by
    /// reply-to header.
    pub async fn run_text(&self, body: impl Into<String>, origin_id: &str) -> Result<Event> {
        self.run(Event::text(body).add_path(origin_id)).await
    }
}
