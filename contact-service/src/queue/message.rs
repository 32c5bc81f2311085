//! Queue envelope and receive parameters.

use std::time::Duration;

/// Default number of messages returned by one receive.
pub const DEFAULT_MAX_MESSAGES: usize = 1;

/// Default long-poll wait.
pub const DEFAULT_WAIT: Duration = Duration::from_secs(20);

/// Default visibility window for received messages.
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(60);

/// A delivered contact request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Raw email address
    pub body: String,
    /// Opaque, queue-assigned handle used to acknowledge this delivery
    pub receipt_handle: String,
    /// Whether this message has been delivered before
    pub redelivered: bool,
}

/// Parameters for a single long-poll receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveOptions {
    /// Upper bound on messages returned
    pub max_messages: usize,
    /// How long to wait for the first message
    pub wait: Duration,
    /// How long returned messages stay hidden from other receivers
    pub visibility_timeout: Duration,
}

impl Default for ReceiveOptions {
    fn default() -> Self {
        Self {
            max_messages: DEFAULT_MAX_MESSAGES,
            wait: DEFAULT_WAIT,
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
        }
    }
}
