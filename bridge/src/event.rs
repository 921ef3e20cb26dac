use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

/// One-shot flag that loop tasks can wait on and any thread can set.
#[derive(Debug, Clone, Default)]
pub struct Event {
    inner: Arc<EventInner>,
}

#[derive(Debug, Default)]
struct EventInner {
    set: AtomicBool,
    notify: Notify,
}

impl Event {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        if !self.inner.set.swap(true, Ordering::AcqRel) {
            self.inner.notify.notify_waiters();
        }
    }

    #[must_use]
    pub fn is_set(&self) -> bool {
        self.inner.set.load(Ordering::Acquire)
    }

    pub async fn wait(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn wait_returns_after_set_from_thread() {
        let event = Event::new();
        let setter = event.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            setter.set();
        });
        tokio::time::timeout(Duration::from_secs(1), event.wait())
            .await
            .unwrap();
        assert!(event.is_set());
        handle.join().unwrap();
    }

    #[tokio::test]
    async fn wait_on_set_event_is_immediate() {
        let event = Event::new();
        event.set();
        event.set();
        event.wait().await;
    }
}
