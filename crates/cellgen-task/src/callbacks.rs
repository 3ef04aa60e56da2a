//! Completion callbacks that fire exactly once.
//!
//! The completer stores the result, closes the queue, then drains it. An adder
//! pushes, then drains too if it observes the queue closed. Both drains pop
//! from the same lock-free queue, so every callback is taken by exactly one of
//! them and always sees the stored result.

use std::panic::{self, AssertUnwindSafe};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};

use cellgen_exec::panic_message;
use crossbeam::queue::SegQueue;

/// A completion listener. `None` means the task was cancelled.
pub type Callback<T> = Box<dyn FnOnce(Option<&T>) + Send + 'static>;

type PanicHook = Box<dyn Fn(String) + Send + Sync + 'static>;

pub struct CallbackQueue<T> {
    result: OnceLock<Option<T>>,
    pending: SegQueue<Callback<T>>,
    closed: AtomicBool,
    on_panic: Option<PanicHook>,
}

impl<T> Default for CallbackQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> CallbackQueue<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            result: OnceLock::new(),
            pending: SegQueue::new(),
            closed: AtomicBool::new(false),
            on_panic: None,
        }
    }

    /// Callbacks that panic are reported through `hook` with the panic text.
    #[must_use]
    pub fn with_panic_hook(hook: impl Fn(String) + Send + Sync + 'static) -> Self {
        Self {
            on_panic: Some(Box::new(hook)),
            ..Self::new()
        }
    }

    /// Register a callback; runs synchronously if already completed.
    pub fn add(&self, callback: Callback<T>) {
        if self.closed.load(Ordering::SeqCst) {
            self.invoke(callback);
            return;
        }
        self.pending.push(callback);
        if self.closed.load(Ordering::SeqCst) {
            self.drain();
        }
    }

    /// Store the result and fire every callback.
    ///
    /// # Panics
    ///
    /// If the queue was already completed.
    pub fn complete(&self, result: Option<T>) {
        assert!(
            self.try_complete(result),
            "completion fired twice for the same task"
        );
    }

    /// Like [`CallbackQueue::complete`], returning false instead of panicking
    /// when a result is already stored.
    pub fn try_complete(&self, result: Option<T>) -> bool {
        if self.result.set(result).is_err() {
            return false;
        }
        self.closed.store(true, Ordering::SeqCst);
        self.drain();
        true
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// The stored result: `None` while pending, `Some(None)` once cancelled.
    #[must_use]
    pub fn result(&self) -> Option<Option<&T>> {
        self.result.get().map(Option::as_ref)
    }

    fn drain(&self) {
        while let Some(callback) = self.pending.pop() {
            self.invoke(callback);
        }
    }

    fn invoke(&self, callback: Callback<T>) {
        let result = self.result.get().and_then(Option::as_ref);
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| callback(result))) {
            let message = panic_message(payload.as_ref());
            match &self.on_panic {
                Some(hook) => hook(message),
                None => tracing::error!(panic = message, "completion callback panicked"),
            }
        }
    }
}

impl<T> core::fmt::Debug for CallbackQueue<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CallbackQueue")
            .field("completed", &self.is_completed())
            .field("pending", &self.pending.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Barrier};

    use parking_lot::Mutex;

    use super::*;

    #[test]
    fn test_callbacks_fire_once_with_result() {
        let queue = CallbackQueue::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let early = Arc::clone(&seen);
        queue.add(Box::new(move |v| early.lock().push(v.copied())));
        queue.complete(Some(7));

        let late = Arc::clone(&seen);
        queue.add(Box::new(move |v| late.lock().push(v.copied())));

        assert_eq!(*seen.lock(), vec![Some(7), Some(7)]);
        assert_eq!(queue.result(), Some(Some(&7)));
    }

    #[test]
    fn test_cancelled_completion_passes_none() {
        let queue = CallbackQueue::<u32>::new();
        let hit = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hit);
        queue.add(Box::new(move |v| {
            assert!(v.is_none());
            h.fetch_add(1, Ordering::SeqCst);
        }));
        queue.complete(None);
        assert_eq!(hit.load(Ordering::SeqCst), 1);
        assert_eq!(queue.result(), Some(None));
    }

    #[test]
    #[should_panic(expected = "completion fired twice")]
    fn test_double_completion_is_fatal() {
        let queue = CallbackQueue::<u32>::new();
        queue.complete(Some(1));
        queue.complete(Some(2));
    }

    #[test]
    fn test_panicking_callback_does_not_block_others() {
        let reported = Arc::new(Mutex::new(Vec::new()));
        let queue = {
            let reported = Arc::clone(&reported);
            CallbackQueue::<u32>::with_panic_hook(move |msg| reported.lock().push(msg))
        };
        let hit = Arc::new(AtomicUsize::new(0));

        queue.add(Box::new(|_| panic!("broken observer")));
        let h = Arc::clone(&hit);
        queue.add(Box::new(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        queue.complete(Some(1));

        assert_eq!(hit.load(Ordering::SeqCst), 1);
        assert_eq!(*reported.lock(), vec!["broken observer".to_owned()]);
    }

    #[test]
    fn test_racing_adders_all_fire_exactly_once() {
        let queue = Arc::new(CallbackQueue::<u32>::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(5));

        let adders: Vec<_> = (0..4)
            .map(|_| {
                let queue = Arc::clone(&queue);
                let hits = Arc::clone(&hits);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..250 {
                        let hits = Arc::clone(&hits);
                        queue.add(Box::new(move |v| {
                            assert_eq!(v, Some(&3));
                            hits.fetch_add(1, Ordering::SeqCst);
                        }));
                    }
                })
            })
            .collect();

        barrier.wait();
        queue.complete(Some(3));
        for adder in adders {
            adder.join().unwrap();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1000);
    }
}
