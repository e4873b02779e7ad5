//! A write-side buffer with a level-triggered drain signal.
//!
//! Every [`EventQueue::write`] enqueues the item and runs the item handler
//! synchronously. The queue never refuses a write; producers check
//! [`EventQueue::write_queue_full`] and wait for the drain signal.
//!
//! After each write the queue computes `max_size / size`. While that ratio
//! is at or below [`RESUME_LEVEL`] the drain handler fires on every write,
//! so drain handlers should be cheap and idempotent.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, trace};

pub const DEFAULT_QUEUE_SIZE: usize = 100;
pub const RESUME_LEVEL: f64 = 0.6;

type ItemHandler<T> = Arc<dyn Fn(&T) -> anyhow::Result<()> + Send + Sync>;
type ExceptionHandler = Arc<dyn Fn(anyhow::Error) + Send + Sync>;
type DrainHandler = Arc<dyn Fn() + Send + Sync>;

pub struct EventQueue<T> {
    name: String,
    items: Mutex<VecDeque<T>>,
    max_size: Mutex<usize>,
    handler: Option<ItemHandler<T>>,
    exception_handler: Mutex<Option<ExceptionHandler>>,
    drain_handler: Mutex<Option<DrainHandler>>,
}

impl<T> EventQueue<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            items: Mutex::new(VecDeque::new()),
            max_size: Mutex::new(DEFAULT_QUEUE_SIZE),
            handler: None,
            exception_handler: Mutex::new(None),
            drain_handler: Mutex::new(None),
        }
    }

    /// Queue whose writes also run `handler`.
    pub fn with_handler<F>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let mut queue = Self::new(name);
        queue.handler = Some(Arc::new(handler));
        queue
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_write_queue_max_size(&self, max_size: usize) {
        *self.max_size.lock() = max_size;
    }

    pub fn write_queue_max_size(&self) -> usize {
        *self.max_size.lock()
    }

    /// Receives item handler failures.
    pub fn set_exception_handler<F>(&self, handler: F)
    where
        F: Fn(anyhow::Error) + Send + Sync + 'static,
    {
        *self.exception_handler.lock() = Some(Arc::new(handler));
    }

    pub fn set_drain_handler<F>(&self, handler: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.drain_handler.lock() = Some(Arc::new(handler));
    }

    pub fn clear_drain_handler(&self) {
        *self.drain_handler.lock() = None;
    }

    /// Enqueues `item`, runs the item handler and checks the fill level.
    pub fn write(&self, item: T) {
        if let Some(handler) = &self.handler {
            if let Err(e) = handler(&item) {
                let e = e.context(format!("[{}] error handling event", self.name));
                debug!(queue = %self.name, error = %format!("{e:#}"), "item handler failed");
                let exception_handler = self.exception_handler.lock().clone();
                if let Some(exception_handler) = exception_handler {
                    exception_handler(e);
                }
            }
        }
        self.items.lock().push_back(item);
        self.check_fill_level();
    }

    fn check_fill_level(&self) {
        let size = self.len();
        if size == 0 {
            return;
        }
        let ratio = self.write_queue_max_size() as f64 / size as f64;
        trace!(queue = %self.name, ratio, "fill level");
        if ratio <= RESUME_LEVEL {
            // Cloned out so the handler may clear itself.
            let drain = self.drain_handler.lock().clone();
            if let Some(drain) = drain {
                drain();
            }
        }
    }

    pub fn write_queue_full(&self) -> bool {
        self.len() >= self.write_queue_max_size()
    }

    pub fn poll(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

impl<T> std::fmt::Debug for EventQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventQueue")
            .field("name", &self.name)
            .field("len", &self.len())
            .field("max_size", &self.write_queue_max_size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn full_at_max_size() {
        let queue = EventQueue::new("q");
        queue.set_write_queue_max_size(3);
        queue.write(1);
        queue.write(2);
        assert!(!queue.write_queue_full());
        queue.write(3);
        assert!(queue.write_queue_full());

        assert_eq!(queue.poll(), Some(1));
        assert!(!queue.write_queue_full());
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn handler_runs_on_every_write_and_failures_are_redirected() {
        let seen = Arc::new(AtomicUsize::new(0));
        let failures = Arc::new(Mutex::new(Vec::<String>::new()));

        let counter = seen.clone();
        let queue = EventQueue::with_handler("q", move |item: &i32| {
            counter.fetch_add(1, Ordering::SeqCst);
            anyhow::ensure!(*item >= 0, "negative item {item}");
            Ok(())
        });
        let sink = failures.clone();
        queue.set_exception_handler(move |e| sink.lock().push(format!("{e:#}")));

        queue.write(1);
        queue.write(-1);
        queue.write(2);

        assert_eq!(seen.load(Ordering::SeqCst), 3);
        assert_eq!(queue.len(), 3);
        let failures = failures.lock();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].contains("[q] error handling event"));
        assert!(failures[0].contains("negative item -1"));
    }

    #[test]
    fn drain_fires_once_per_crossing_when_listener_unregisters() {
        let queue = Arc::new(EventQueue::new("q"));
        queue.set_write_queue_max_size(3);
        let drains = Arc::new(AtomicUsize::new(0));

        let arm = |queue: &Arc<EventQueue<i32>>| {
            let count = drains.clone();
            let weak = Arc::downgrade(queue);
            queue.set_drain_handler(move || {
                count.fetch_add(1, Ordering::SeqCst);
                if let Some(q) = weak.upgrade() {
                    q.clear_drain_handler();
                }
            });
        };
        arm(&queue);

        // 3/n <= 0.6 first holds at n = 5.
        for i in 0..4 {
            queue.write(i);
        }
        assert!(queue.write_queue_full());
        assert_eq!(drains.load(Ordering::SeqCst), 0);
        for i in 4..8 {
            queue.write(i);
        }
        assert_eq!(drains.load(Ordering::SeqCst), 1);

        while queue.poll().is_some() {}
        arm(&queue);
        for i in 0..5 {
            queue.write(i);
        }
        assert_eq!(drains.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn drain_is_level_triggered() {
        let queue = EventQueue::new("q");
        queue.set_write_queue_max_size(1);
        let drains = Arc::new(AtomicUsize::new(0));
        let count = drains.clone();
        queue.set_drain_handler(move || {
            count.fetch_add(1, Ordering::SeqCst);
        });

        for i in 0..4 {
            queue.write(i);
        }
        // Ratios 1.0, 0.5, 0.33, 0.25.
        assert_eq!(drains.load(Ordering::SeqCst), 3);
    }
}
