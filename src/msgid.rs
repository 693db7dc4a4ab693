// Message-id generation for outbound sends.
// Ack and nack frames from the relay are correlated by these ids, so a
// collision within the process would misattribute outcomes.

use std::sync::atomic::{AtomicU64, Ordering};

use uuid::Uuid;

/// Produces process-unique correlation ids for outbound sends.
///
/// Ids are `<prefix>-<n>` where the prefix is random per generator and the
/// counter is atomic, so `next` is safe to call from any number of
/// concurrent notification producers without locking.
pub struct MessageIdGenerator {
    prefix: String,
    counter: AtomicU64,
}

impl MessageIdGenerator {
    pub fn new() -> Self {
        MessageIdGenerator {
            prefix: Uuid::new_v4().simple().to_string(),
            counter: AtomicU64::new(0),
        }
    }

    pub fn next(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", self.prefix, n)
    }
}

impl Default for MessageIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
