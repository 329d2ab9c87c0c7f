// Error types for the strand runtime

use crate::context::ContextId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// A context-requiring operation ran with no current context bound.
    #[error("Unbound execution: {0} requires a current context")]
    UnboundExecution(&'static str),

    #[error("Affinity violation: expected {expected}, running on {}", display_context(.actual))]
    AffinityViolation {
        expected: ContextId,
        actual: Option<ContextId>,
    },

    #[error("Context not found: {0}")]
    ContextNotFound(ContextId),

    #[error("Runtime has been shut down")]
    RuntimeShutdown,

    #[error("Connection admission failed: {0}")]
    Admission(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Connection pool closed")]
    PoolClosed,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn display_context(context: &Option<ContextId>) -> String {
    match context {
        Some(id) => id.to_string(),
        None => "no context".to_string(),
    }
}

impl Error {
    /// Returns true for errors caused by calling an operation from the
    /// wrong place rather than by the environment.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            Error::UnboundExecution(_) | Error::AffinityViolation { .. }
        )
    }

    /// Returns true for errors raised by the network layer.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::Admission(_) | Error::ConnectionClosed | Error::Tls(_) | Error::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contract_violation_predicate() {
        assert!(Error::UnboundExecution("register").is_contract_violation());
        assert!(
            Error::AffinityViolation {
                expected: ContextId::from_raw(1),
                actual: None,
            }
            .is_contract_violation()
        );
        assert!(!Error::PoolClosed.is_contract_violation());
    }

    #[test]
    fn test_transport_predicate() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(Error::from(io).is_transport());
        assert!(Error::ConnectionClosed.is_transport());
        assert!(!Error::Config("bad".into()).is_transport());
    }

    #[test]
    fn test_affinity_message() {
        let err = Error::AffinityViolation {
            expected: ContextId::from_raw(3),
            actual: Some(ContextId::from_raw(7)),
        };
        assert_eq!(
            err.to_string(),
            "Affinity violation: expected ctx-3, running on ctx-7"
        );

        let err = Error::AffinityViolation {
            expected: ContextId::from_raw(3),
            actual: None,
        };
        assert!(err.to_string().ends_with("running on no context"));
    }

    #[test]
    fn test_unbound_message() {
        let err = Error::UnboundExecution("mailbox register");
        assert_eq!(
            err.to_string(),
            "Unbound execution: mailbox register requires a current context"
        );
    }
}
