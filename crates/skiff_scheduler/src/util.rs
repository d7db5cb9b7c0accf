use std::fmt;

use parking_lot::Mutex;

/// A single-writer, multi-subscriber callback list.
///
/// Subscribers are registered at construction time of the owning object and
/// invoked synchronously on every notification, in registration order.
/// Notifications may arrive from multiple threads; subscribers must tolerate
/// out-of-order and repeated values.
pub struct Subscribers<T> {
    subs: Mutex<Vec<Box<dyn Fn(T) + Send + Sync>>>,
}

impl<T: Clone> Subscribers<T> {
    pub fn new() -> Self {
        Subscribers {
            subs: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self, f: impl Fn(T) + Send + Sync + 'static) {
        self.subs.lock().push(Box::new(f));
    }

    /// Invoke every subscriber with a clone of `value`.
    ///
    /// The subscriber list is locked for the duration of the fan-out; callers
    /// must not hold any lock a subscriber may try to take.
    pub fn notify(&self, value: T) {
        let subs = self.subs.lock();
        for sub in subs.iter() {
            sub(value.clone());
        }
    }
}

impl<T> fmt::Debug for Subscribers<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscribers")
            .field("count", &self.subs.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn notifies_all_subscribers_in_order() {
        let subs = Subscribers::new();
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let count = count.clone();
            subs.subscribe(move |v: usize| {
                count.fetch_add(v, Ordering::SeqCst);
            });
        }

        subs.notify(2);
        assert_eq!(6, count.load(Ordering::SeqCst));
    }
}
