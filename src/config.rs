use std::rc::Rc;

use crate::header::HEADER_LEN;
use crate::logger::{Logger, NoOpLogger};

/// Size of the per-datagram receive buffer.
pub const RECV_BUFFER_LEN: usize = 32768;

/// Largest payload that fits in a single datagram alongside the header.
pub const MAX_PAYLOAD_LEN: usize = RECV_BUFFER_LEN - HEADER_LEN;

pub(crate) const DEFAULT_EVENTS_CAPACITY: usize = 1024;

/// Configuration for the runtime
#[derive(Clone)]
pub struct PostboxConfig {
    /// Receive buffer size per datagram
    pub recv_buffer_len: usize,
    /// Capacity of the readiness event list
    pub events_capacity: usize,
    /// Logger for diagnostics with no attributable connection
    pub logger: Rc<dyn Logger>,
}

impl PostboxConfig {
    /// Create a new builder for PostboxConfig
    pub fn builder() -> PostboxConfigBuilder {
        PostboxConfigBuilder::new()
    }
}

impl Default for PostboxConfig {
    fn default() -> Self {
        Self {
            recv_buffer_len: RECV_BUFFER_LEN,
            events_capacity: DEFAULT_EVENTS_CAPACITY,
            logger: Rc::new(NoOpLogger),
        }
    }
}

/// Builder for PostboxConfig
pub struct PostboxConfigBuilder {
    recv_buffer_len: Option<usize>,
    events_capacity: Option<usize>,
    logger: Option<Rc<dyn Logger>>,
}

impl PostboxConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self {
            recv_buffer_len: None,
            events_capacity: None,
            logger: None,
        }
    }

    /// Set the receive buffer size
    pub fn recv_buffer_len(mut self, len: usize) -> Self {
        self.recv_buffer_len = Some(len);
        self
    }

    /// Set the readiness event list capacity
    pub fn events_capacity(mut self, capacity: usize) -> Self {
        self.events_capacity = Some(capacity);
        self
    }

    /// Set the logger implementation
    pub fn logger(mut self, logger: Rc<dyn Logger>) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Build the PostboxConfig
    pub fn build(self) -> PostboxConfig {
        let default = PostboxConfig::default();
        PostboxConfig {
            recv_buffer_len: self.recv_buffer_len.unwrap_or(default.recv_buffer_len),
            events_capacity: self.events_capacity.unwrap_or(default.events_capacity),
            logger: self.logger.unwrap_or(default.logger),
        }
    }
}

impl Default for PostboxConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PostboxConfig::default();
        assert_eq!(config.recv_buffer_len, RECV_BUFFER_LEN);
        assert_eq!(config.events_capacity, DEFAULT_EVENTS_CAPACITY);
    }

    #[test]
    fn test_builder_overrides() {
        let config = PostboxConfig::builder()
            .recv_buffer_len(4096)
            .events_capacity(16)
            .build();
        assert_eq!(config.recv_buffer_len, 4096);
        assert_eq!(config.events_capacity, 16);
    }

    #[test]
    fn test_max_payload_leaves_room_for_the_header() {
        assert_eq!(MAX_PAYLOAD_LEN, 32760);
    }
}
