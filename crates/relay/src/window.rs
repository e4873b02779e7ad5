//! Multi-slot join.
//!
//! An [`EventWindow`] collects at most one value per named slot. It closes
//! when `max_elements` slots are filled or when its time bound expires,
//! whichever happens first, and calls the completion handler exactly once
//! per opening. [`EventWindow::reset`] reopens it. A window built with
//! [`EventWindow::recurring`] reopens itself under the same lock that closed
//! it, so no offer lands between two openings.
//!
//! Acceptance and closing happen under one lock, so a last-slot arrival
//! racing the timer cannot complete the window twice. The completion handler
//! runs outside the lock.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Values collected by one window opening.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowResult<T> {
    pub values: BTreeMap<String, T>,
    /// False when the time bound closed the window first.
    pub complete: bool,
}

type CompletionHandler<T> = Box<dyn Fn(WindowResult<T>) + Send + Sync>;

struct WindowState<T> {
    data: BTreeMap<String, T>,
    closed: bool,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

struct WindowInner<T> {
    slots: Vec<String>,
    max_elements: usize,
    time_window: Option<Duration>,
    recurring: bool,
    state: Mutex<WindowState<T>>,
    on_complete: CompletionHandler<T>,
}

/// Cloning shares the window.
pub struct EventWindow<T> {
    inner: Arc<WindowInner<T>>,
}

impl<T> Clone for EventWindow<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> EventWindow<T> {
    /// Opens a window over `slots`.
    ///
    /// `max_elements` defaults to the slot count. With a `time_window` the
    /// timer is armed immediately, which requires a Tokio runtime.
    pub fn new<F>(
        slots: impl IntoIterator<Item = impl Into<String>>,
        max_elements: Option<usize>,
        time_window: Option<Duration>,
        on_complete: F,
    ) -> Self
    where
        F: Fn(WindowResult<T>) + Send + Sync + 'static,
    {
        Self::build(slots, max_elements, time_window, false, on_complete)
    }

    /// Like [`EventWindow::new`], but every close reopens the window at once.
    pub fn recurring<F>(
        slots: impl IntoIterator<Item = impl Into<String>>,
        max_elements: Option<usize>,
        time_window: Option<Duration>,
        on_complete: F,
    ) -> Self
    where
        F: Fn(WindowResult<T>) + Send + Sync + 'static,
    {
        Self::build(slots, max_elements, time_window, true, on_complete)
    }

    fn build<F>(
        slots: impl IntoIterator<Item = impl Into<String>>,
        max_elements: Option<usize>,
        time_window: Option<Duration>,
        recurring: bool,
        on_complete: F,
    ) -> Self
    where
        F: Fn(WindowResult<T>) + Send + Sync + 'static,
    {
        let slots: Vec<String> = slots.into_iter().map(Into::into).collect();
        let max_elements = max_elements.unwrap_or(slots.len()).max(1);
        let window = Self {
            inner: Arc::new(WindowInner {
                slots,
                max_elements,
                time_window,
                recurring,
                state: Mutex::new(WindowState {
                    data: BTreeMap::new(),
                    closed: false,
                    generation: 0,
                    timer: None,
                }),
                on_complete: Box::new(on_complete),
            }),
        };
        {
            let mut state = window.inner.state.lock();
            window.arm_timer(&mut state);
        }
        window
    }

    pub fn slots(&self) -> &[String] {
        &self.inner.slots
    }

    pub fn max_elements(&self) -> usize {
        self.inner.max_elements
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    pub fn is_slot_empty(&self, slot: &str) -> bool {
        !self.inner.state.lock().data.contains_key(slot)
    }

    /// Offers a value to `slot`. Returns whether it was accepted: a closed
    /// window, an unknown slot or an already filled slot discards it.
    pub fn offer(&self, slot: &str, value: T) -> bool {
        let completed = {
            let mut state = self.inner.state.lock();
            if state.closed || !self.inner.slots.iter().any(|s| s == slot) {
                trace!(slot, closed = state.closed, "value discarded");
                return false;
            }
            if state.data.contains_key(slot) {
                trace!(slot, "slot already filled");
                return false;
            }
            state.data.insert(slot.to_string(), value);
            if state.data.len() >= self.inner.max_elements {
                debug!(slots = state.data.len(), "window full, closing");
                Some(self.close(&mut state, true))
            } else {
                None
            }
        };
        if let Some(result) = completed {
            (self.inner.on_complete)(result);
        }
        true
    }

    /// Clears collected values, reopens the window and re-arms the timer.
    pub fn reset(&self) {
        let mut state = self.inner.state.lock();
        debug!("window reset");
        self.reopen(&mut state);
    }

    fn reopen(&self, state: &mut WindowState<T>) {
        state.data.clear();
        state.closed = false;
        state.generation += 1;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        self.arm_timer(state);
    }

    /// Closes the current opening and returns its result. A recurring
    /// window is open again when this returns.
    fn close(&self, state: &mut WindowState<T>, complete: bool) -> WindowResult<T> {
        let result = WindowResult {
            values: state.data.clone(),
            complete,
        };
        if self.inner.recurring {
            self.reopen(state);
        } else {
            state.closed = true;
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
        }
        result
    }

    fn arm_timer(&self, state: &mut WindowState<T>) {
        let Some(time_window) = self.inner.time_window else {
            return;
        };
        let generation = state.generation;
        let weak = Arc::downgrade(&self.inner);
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(time_window).await;
            if let Some(inner) = weak.upgrade() {
                EventWindow { inner }.expire(generation);
            }
        }));
    }

    fn expire(&self, generation: u64) {
        let result = {
            let mut state = self.inner.state.lock();
            if state.closed || state.generation != generation {
                return;
            }
            debug!(slots = state.data.len(), "window timed out, closing");
            // The running task is this timer.
            state.timer = None;
            self.close(&mut state, false)
        };
        (self.inner.on_complete)(result);
    }
}

impl<T> Drop for WindowInner<T> {
    fn drop(&mut self) {
        if let Some(timer) = self.state.get_mut().timer.take() {
            timer.abort();
        }
    }
}

impl<T> std::fmt::Debug for EventWindow<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("EventWindow")
            .field("slots", &self.inner.slots)
            .field("max_elements", &self.inner.max_elements)
            .field("filled", &state.data.len())
            .field("closed", &state.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recording() -> (
        Arc<Mutex<Vec<WindowResult<i32>>>>,
        impl Fn(WindowResult<i32>) + Send + Sync + 'static,
    ) {
        let results = Arc::new(Mutex::new(Vec::new()));
        let sink = results.clone();
        (results, move |r| sink.lock().push(r))
    }

    #[tokio::test]
    async fn closes_once_when_all_slots_fill() {
        let (results, on_complete) = recording();
        let window = EventWindow::new(["a", "b", "c"], None, None, on_complete);

        assert!(window.offer("a", 1));
        assert!(!window.offer("a", 99));
        assert!(window.offer("b", 2));
        assert!(results.lock().is_empty());
        assert!(window.offer("c", 3));
        assert!(!window.offer("c", 4));

        let results = results.lock();
        assert_eq!(results.len(), 1);
        assert!(results[0].complete);
        assert_eq!(results[0].values.values().copied().collect::<Vec<_>>(), vec![1, 2, 3]);
        assert!(window.is_closed());
    }

    #[tokio::test]
    async fn recurring_window_accepts_the_next_round_immediately() {
        let (results, on_complete) = recording();
        let window = EventWindow::recurring(["a", "b"], None, None, on_complete);

        assert!(window.offer("a", 1));
        assert!(window.offer("b", 2));
        assert!(!window.is_closed());
        assert!(window.offer("a", 3));
        assert!(window.offer("b", 4));

        let results = results.lock();
        assert_eq!(results.len(), 2);
        assert_eq!(results[1].values.values().copied().collect::<Vec<_>>(), vec![3, 4]);
    }

    #[tokio::test]
    async fn unknown_slots_are_discarded() {
        let (results, on_complete) = recording();
        let window = EventWindow::new(["a"], None, None, on_complete);
        assert!(!window.offer("zzz", 1));
        assert!(results.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_closes_with_partial_values() {
        let (results, on_complete) = recording();
        let window = EventWindow::new(["a", "b"], None, Some(Duration::from_millis(100)), on_complete);
        window.offer("a", 1);

        tokio::time::sleep(Duration::from_millis(150)).await;
        {
            let results = results.lock();
            assert_eq!(results.len(), 1);
            assert!(!results[0].complete);
            assert_eq!(results[0].values.len(), 1);
        }
        assert!(!window.offer("b", 2));
    }

    #[tokio::test(start_paused = true)]
    async fn completion_cancels_the_timer() {
        let (results, on_complete) = recording();
        let window = EventWindow::new(["a"], None, Some(Duration::from_millis(100)), on_complete);
        window.offer("a", 1);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(results.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_reopens_and_rearms() {
        let (results, on_complete) = recording();
        let window = EventWindow::new(["a", "b"], Some(1), Some(Duration::from_millis(100)), on_complete);
        window.offer("b", 7);
        window.reset();
        assert!(!window.is_closed());
        assert!(window.is_slot_empty("b"));

        tokio::time::sleep(Duration::from_millis(150)).await;
        let results = results.lock();
        assert_eq!(results.len(), 2);
        assert!(results[0].complete);
        assert!(!results[1].complete);
        assert!(results[1].values.is_empty());
    }
}
