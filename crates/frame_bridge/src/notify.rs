//! User-facing notifications.
//!
//! Handler failures are surfaced to whoever sits in front of the host (a toast
//! in a browser host, a log line in a headless one) through [`Notifier`].

use std::fmt;
use tracing::{error, info};

/// Sink for transient user-visible notifications.
pub trait Notifier: Send + Sync + fmt::Debug {
    /// Shows an error. `title` identifies the frame the failure came from.
    fn error(&self, title: &str, message: &str);

    fn info(&self, _title: &str, _message: &str) {}
}

/// Notifier for headless hosts: every notification becomes a log record.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn error(&self, title: &str, message: &str) {
        error!(target: "frame_bridge::notify", "🔴 {}{}", title, message);
    }

    fn info(&self, title: &str, message: &str) {
        info!(target: "frame_bridge::notify", "{}{}", title, message);
    }
}
