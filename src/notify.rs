use std::sync::{Arc, Mutex};

use tracing::info;

/// Receives human-readable alerts for the user
pub trait NotificationSink: Send + Sync {
    fn notify(&self, message: &str);
}

/// Writes alerts to the log
#[derive(Debug, Default)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn notify(&self, message: &str) {
        info!("🔔 {}", message);
    }
}

/// Keeps every alert in memory. Clones share the same buffer.
#[derive(Debug, Default, Clone)]
pub struct CollectingSink {
    messages: Arc<Mutex<Vec<String>>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn drain(&self) -> Vec<String> {
        std::mem::take(&mut *self.messages.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

impl NotificationSink for CollectingSink {
    fn notify(&self, message: &str) {
        self.messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(message.to_string());
    }
}

pub fn expired_message(count: usize) -> String {
    if count == 1 {
        "1 of your spots expired".to_string()
    } else {
        format!("{count} of your spots expired")
    }
}

pub fn expiring_message(remaining_seconds: i64) -> String {
    format!("Your spot expires in {remaining_seconds}s")
}
