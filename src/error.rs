//! Error type shared across the flow statistics pipeline.

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlowError {
    /// A deny-path prefix did not match `<export>/<action>/<rule>/<policy>[/<tier>]`.
    #[error("malformed rule prefix {prefix:?}: {reason}")]
    MalformedPrefix { prefix: String, reason: String },

    #[error("no local endpoint for address {0}")]
    UnknownEndpoint(String),

    #[error("policy {tier}/{policy} is not applied to endpoint {endpoint}")]
    UnknownPolicy {
        endpoint: String,
        tier: String,
        policy: String,
    },

    #[error("conntrack snapshot failed: {0}")]
    Snapshot(String),

    #[error("dump I/O error: {0}")]
    Dump(#[from] io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl FlowError {
    pub fn malformed_prefix(prefix: &str, reason: impl Into<String>) -> Self {
        FlowError::MalformedPrefix {
            prefix: prefix.to_string(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = FlowError::malformed_prefix("x/y", "expected 4 or 5 fields");
        assert_eq!(
            err.to_string(),
            "malformed rule prefix \"x/y\": expected 4 or 5 fields"
        );

        let err = FlowError::UnknownPolicy {
            endpoint: "host/eth0".to_string(),
            tier: "tier1".to_string(),
            policy: "pol-a".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "policy tier1/pol-a is not applied to endpoint host/eth0"
        );
    }

    #[test]
    fn test_io_error_converts() {
        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        let err: FlowError = io_err.into();
        assert!(matches!(err, FlowError::Dump(_)));
    }
}
