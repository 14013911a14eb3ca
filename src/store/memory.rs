//! In-process notification store, used by the demo and in tests.

use std::sync::Mutex;

use async_trait::async_trait;
use log::debug;

use crate::calls::{NotificationRecord, NotificationRecorder, NotificationType};

/// Keeps notification rows in process memory.
#[derive(Debug, Default)]
pub struct MemoryNotificationStore {
    rows: Mutex<Vec<NotificationRecord>>,
}

impl MemoryNotificationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<NotificationRecord> {
        self.rows.lock().map(|rows| rows.clone()).unwrap_or_default()
    }

    /// Rows for `user_id` of the given kind, oldest first.
    pub fn records_of(&self, user_id: &str, kind: NotificationType) -> Vec<NotificationRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.user_id == user_id && r.kind == kind)
            .collect()
    }

    pub fn unread_count(&self, user_id: &str) -> usize {
        self.records()
            .iter()
            .filter(|r| r.user_id == user_id && !r.is_read)
            .count()
    }

    /// Mark every row of `user_id` as read, returning how many changed.
    pub fn mark_all_read(&self, user_id: &str) -> usize {
        let Ok(mut rows) = self.rows.lock() else {
            return 0;
        };
        let mut changed = 0;
        for row in rows.iter_mut().filter(|r| r.user_id == user_id && !r.is_read) {
            row.is_read = true;
            changed += 1;
        }
        changed
    }
}

#[async_trait]
impl NotificationRecorder for MemoryNotificationStore {
    async fn record(&self, record: NotificationRecord) -> Result<(), anyhow::Error> {
        debug!(target: "Store/Memory", "{} notification for {}", record.kind.as_str(), record.user_id);
        self.rows
            .lock()
            .map_err(|_| anyhow::anyhow!("notification store poisoned"))?
            .push(record);
        Ok(())
    }
}
