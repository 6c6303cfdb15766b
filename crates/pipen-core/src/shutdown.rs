//! Cancellation primitive shared by the pipeline driver and the process
//! runner (C7, spec §4.7/§5's suspension-point model).
//!
//! Two independent signals, both hand-rolled from `Arc<AtomicBool>` +
//! `Notify` so waiting never polls:
//! - `wait`/`trigger`: a shutdown was requested (e.g. Ctrl-C). Observed by
//!   `Pipeline::run` once per in-flight process to ask `on_proc_shutdown`
//!   whether it may act on it.
//! - `wait_confirmed`/`confirm`: the driver decided the request is *not*
//!   vetoed. Only once this fires does `Process::run_job` actually kill its
//!   in-flight jobs; a vetoed request never confirms, so jobs already
//!   racing `wait_confirmed` simply keep running.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Clone, Default)]
pub struct ShutdownSignal {
    requested: Arc<AtomicBool>,
    requested_notify: Arc<Notify>,
    confirmed: Arc<AtomicBool>,
    confirmed_notify: Arc<Notify>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.requested_notify.notify_waiters();
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    pub async fn wait(&self) {
        if self.is_requested() {
            return;
        }
        self.requested_notify.notified().await;
    }

    /// Mark a shutdown request as not vetoed: jobs racing `wait_confirmed`
    /// may now proceed to kill themselves.
    pub fn confirm(&self) {
        self.confirmed.store(true, Ordering::SeqCst);
        self.confirmed_notify.notify_waiters();
    }

    pub fn is_confirmed(&self) -> bool {
        self.confirmed.load(Ordering::SeqCst)
    }

    pub async fn wait_confirmed(&self) {
        if self.is_confirmed() {
            return;
        }
        self.confirmed_notify.notified().await;
    }
}
