//! Telegram listeners.
//!
//! Listeners are called from the dispatcher task, never from the reader, so
//! a slow listener delays other listeners but not the serial port.

use std::sync::{Arc, RwLock};

use crate::error::ErrorStatus;
use crate::telegram::Telegram;

/// Consumer of decoded telegrams.
pub trait DsmrEventListener: Send + Sync {
    /// Called for every telegram that passed the checksum and decoding.
    fn telegram_received(&self, telegram: &Telegram);

    /// Called when the pipeline reports a problem.
    fn error_received(&self, _status: &ErrorStatus) {}
}

/// Shared, cloneable list of listeners.
#[derive(Clone, Default)]
pub struct ListenerRegistry {
    listeners: Arc<RwLock<Vec<Arc<dyn DsmrEventListener>>>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Arc<dyn DsmrEventListener>) {
        self.listeners
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(listener);
    }

    /// Removes a listener previously added. Returns false if it was not
    /// registered.
    pub fn remove(&self, listener: &Arc<dyn DsmrEventListener>) -> bool {
        let mut listeners = self
            .listeners
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = listeners.len();
        listeners.retain(|registered| !same_listener(registered, listener));
        listeners.len() != before
    }

    /// Copy of the current listeners; the lock is not held while calling them.
    pub fn snapshot(&self) -> Vec<Arc<dyn DsmrEventListener>> {
        self.listeners
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dispatch_telegram(&self, telegram: &Telegram) {
        for listener in self.snapshot() {
            listener.telegram_received(telegram);
        }
    }

    pub fn dispatch_error(&self, status: &ErrorStatus) {
        for listener in self.snapshot() {
            listener.error_received(status);
        }
    }
}

impl std::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("listeners", &self.len())
            .finish()
    }
}

fn same_listener(a: &Arc<dyn DsmrEventListener>, b: &Arc<dyn DsmrEventListener>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counter {
        telegrams: AtomicUsize,
        errors: AtomicUsize,
    }

    impl DsmrEventListener for Counter {
        fn telegram_received(&self, _telegram: &Telegram) {
            self.telegrams.fetch_add(1, Ordering::SeqCst);
        }

        fn error_received(&self, _status: &ErrorStatus) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_add_remove() {
        let registry = ListenerRegistry::new();
        let counter: Arc<dyn DsmrEventListener> = Arc::new(Counter::default());
        registry.add(counter.clone());
        assert_eq!(registry.len(), 1);
        assert!(registry.remove(&counter));
        assert!(!registry.remove(&counter));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_dispatch_error() {
        let registry = ListenerRegistry::new();
        let counter = Arc::new(Counter::default());
        registry.add(counter.clone());
        registry.dispatch_error(&ErrorStatus::TelegramCrcError);
        assert_eq!(counter.errors.load(Ordering::SeqCst), 1);
        assert_eq!(counter.telegrams.load(Ordering::SeqCst), 0);
    }
}
