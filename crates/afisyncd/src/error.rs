//! Error types for afisyncd

use crate::types::IpAddress;
use thiserror::Error;

/// Errors that can occur in afisyncd
#[derive(Debug, Error)]
pub enum AfisyncError {
    /// Netlink socket error
    #[error("Netlink error: {0}")]
    Netlink(String),

    /// Framed (FPM) feed error
    #[error("FPM error: {0}")]
    Fpm(String),

    /// Forwarding plane rejected or failed a request
    #[error("Forwarding plane error: {0}")]
    ForwardingPlane(String),

    /// Fragment handle unknown to the forwarding plane
    #[error("Fragment not found: handle {0}")]
    FragmentNotFound(u64),

    /// Route next hop has no resolved neighbor yet
    #[error("Next hop {0} not resolved")]
    NextHopUnresolved(IpAddress),

    /// Interface lookup failed
    #[error("Interface not found: {0}")]
    InterfaceNotFound(String),

    /// Address could not be parsed or had the wrong width
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding error on the forwarding plane channel
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML configuration parse error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl AfisyncError {
    /// True for conditions the engine expects during normal operation and
    /// resolves on its own (a route waiting for its neighbor).
    pub fn is_pending(&self) -> bool {
        matches!(self, AfisyncError::NextHopUnresolved(_))
    }
}

/// Result type alias for afisyncd operations
pub type Result<T> = std::result::Result<T, AfisyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AfisyncError::ForwardingPlane("insert rejected".to_string());
        assert_eq!(err.to_string(), "Forwarding plane error: insert rejected");

        let err = AfisyncError::FragmentNotFound(42);
        assert_eq!(err.to_string(), "Fragment not found: handle 42");
    }

    #[test]
    fn test_pending_classification() {
        let nh: IpAddress = "192.168.1.1".parse().unwrap();
        assert!(AfisyncError::NextHopUnresolved(nh).is_pending());
        assert!(!AfisyncError::Netlink("x".into()).is_pending());
    }
}
