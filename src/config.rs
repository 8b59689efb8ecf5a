//! Runtime configuration for peers and services.
//!
//! There is nothing to persist to disk here (see the crate's data model:
//! persisted state is none) -- these are plain, validated, defaulted
//! builder structs passed to constructors, the same role a loaded
//! `AppConfig` plays for a daemon that does read one from TOML.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("max_frame_bytes must be greater than zero")]
    ZeroMaxFrameBytes,
    #[error("write_queue_depth must be greater than zero")]
    ZeroWriteQueueDepth,
}

/// Configuration for a single [`crate::peer::Peer`].
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Upper bound on a single decoded frame's byte length. Guards against
    /// a misbehaving or malicious peer claiming an enormous array/string
    /// length and never supplying the bytes.
    pub max_frame_bytes: usize,

    /// Bounded depth of the per-peer write queue (see [`crate::write_buffer`]).
    /// This is the adopted resolution of the "ports SHOULD cap buffer
    /// size" guidance: the queue is bounded, not literally unbounded.
    pub write_queue_depth: usize,

    /// The first id assigned to an outbound request from this peer.
    /// Exposed mainly so tests can pin deterministic ids; defaults to 1.
    pub first_request_id: u64,

    /// Capacity of the inbound [`crate::peer::PeerEvents`] channel.
    pub inbound_queue_depth: usize,
}

impl Default for PeerConfig {
    fn default() -> Self {
        PeerConfig {
            max_frame_bytes: 16 * 1024 * 1024,
            write_queue_depth: 1024,
            first_request_id: 1,
            inbound_queue_depth: 256,
        }
    }
}

impl PeerConfig {
    pub fn max_frame_bytes(mut self, bytes: usize) -> Self {
        self.max_frame_bytes = bytes;
        self
    }

    pub fn write_queue_depth(mut self, depth: usize) -> Self {
        self.write_queue_depth = depth;
        self
    }

    pub fn first_request_id(mut self, id: u64) -> Self {
        self.first_request_id = id;
        self
    }

    pub fn inbound_queue_depth(mut self, depth: usize) -> Self {
        self.inbound_queue_depth = depth;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.max_frame_bytes == 0 {
            return Err(ConfigError::ZeroMaxFrameBytes);
        }
        if self.write_queue_depth == 0 {
            return Err(ConfigError::ZeroWriteQueueDepth);
        }
        Ok(())
    }
}

/// Configuration for a [`crate::service::Service`], currently just the
/// [`PeerConfig`] applied to every peer it accepts.
#[derive(Debug, Clone, Default)]
pub struct ServiceConfig {
    pub peer: PeerConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(PeerConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_max_frame_bytes_is_rejected() {
        let cfg = PeerConfig::default().max_frame_bytes(0);
        assert!(matches!(cfg.validate(), Err(ConfigError::ZeroMaxFrameBytes)));
    }

    #[test]
    fn builder_setters_compose() {
        let cfg = PeerConfig::default()
            .max_frame_bytes(1024)
            .write_queue_depth(4)
            .first_request_id(100);
        assert_eq!(cfg.max_frame_bytes, 1024);
        assert_eq!(cfg.write_queue_depth, 4);
        assert_eq!(cfg.first_request_id, 100);
    }
}
