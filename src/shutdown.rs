//! Cooperative shutdown signal shared by a component's loops.
//!
//! Tripping the flag stops subscription loops and interval tasks from
//! taking new work; whatever flush or persist is already in flight runs
//! to completion first.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

#[derive(Debug, Default)]
pub struct Shutdown {
    requested: AtomicBool,
    notify: Notify,
}

impl Shutdown {
    pub fn new() -> Self {
        Shutdown::default()
    }

    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Resolve once shutdown has been requested. Usable from any number of
    /// tasks concurrently.
    pub async fn wait(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        // register before the flag check so a request between the two
        // cannot be missed
        notified.as_mut().enable();
        if self.is_requested() {
            return;
        }
        notified.await;
    }
}
