//! Teardown handle for live feeds.
//!
//! Every `listen`/`subscribe` call in the workspace returns a [`Subscription`].
//! Its teardown runs exactly once: either through [`Subscription::unsubscribe`]
//! or, as a fallback, when the handle is dropped.

use std::fmt;

type Teardown = Box<dyn FnOnce() + Send + 'static>;

#[must_use = "dropping a Subscription tears the feed down immediately"]
pub struct Subscription {
    label: String,
    teardowns: Vec<Teardown>,
}

impl Subscription {
    pub fn new(label: impl Into<String>, teardown: impl FnOnce() + Send + 'static) -> Self {
        Self {
            label: label.into(),
            teardowns: vec![Box::new(teardown)],
        }
    }

    /// A handle with nothing to tear down.
    pub fn noop(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            teardowns: Vec::new(),
        }
    }

    /// Bundle several handles into one composite teardown.
    pub fn combine(label: impl Into<String>, parts: Vec<Subscription>) -> Self {
        let mut teardowns = Vec::new();
        for mut part in parts {
            teardowns.append(&mut part.teardowns);
        }
        Self {
            label: label.into(),
            teardowns,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_active(&self) -> bool {
        !self.teardowns.is_empty()
    }

    /// Tear the feed(s) down.
    pub fn unsubscribe(mut self) {
        self.run_teardowns();
    }

    fn run_teardowns(&mut self) {
        if self.teardowns.is_empty() {
            return;
        }
        tracing::debug!(subscription = %self.label, parts = self.teardowns.len(), "Tearing down subscription");
        for teardown in self.teardowns.drain(..) {
            teardown();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.run_teardowns();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("label", &self.label)
            .field("parts", &self.teardowns.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting(counter: &Arc<AtomicUsize>) -> Subscription {
        let c = counter.clone();
        Subscription::new("test", move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_unsubscribe_runs_teardown_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        let sub = counting(&counter);
        assert!(sub.is_active());
        sub.unsubscribe();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_runs_teardown() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let _sub = counting(&counter);
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_combined_teardown_runs_every_part() {
        let counter = Arc::new(AtomicUsize::new(0));
        let combined = Subscription::combine(
            "both",
            vec![counting(&counter), counting(&counter), Subscription::noop("none")],
        );
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        combined.unsubscribe();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }
}
