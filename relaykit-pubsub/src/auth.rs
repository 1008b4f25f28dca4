//! Pluggable access capabilities consulted on publish and subscribe.
//!
//! The policies live with the owning process; this layer only asks.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::warn;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Publish,
    Subscribe,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Publish => f.write_str("publish"),
            Self::Subscribe => f.write_str("subscribe"),
        }
    }
}

/// What a caller is trying to do
#[derive(Debug, Clone)]
pub struct RequestContext<'a> {
    pub operation: Operation,
    pub topic: &'a str,
    /// Publication metadata; absent for subscriptions
    pub metadata: Option<&'a HashMap<String, String>>,
    /// Identity established by the authenticator, if any
    pub identity: Option<String>,
}

/// Establishes the caller's identity from the request context
pub trait Authenticator: Send + Sync {
    /// `None` rejects the request as unauthenticated
    fn authenticate(&self, context: &RequestContext<'_>) -> Option<String>;
}

/// Approves or denies an authenticated request
pub trait Authorizer: Send + Sync {
    fn authorize(&self, context: &RequestContext<'_>) -> bool;
}

/// The optional capabilities of a server, applied in order:
/// authenticate, then authorize.
#[derive(Clone, Default)]
pub struct AccessPolicy {
    pub authenticator: Option<Arc<dyn Authenticator>>,
    pub authorizer: Option<Arc<dyn Authorizer>>,
}

impl AccessPolicy {
    pub fn check(
        &self,
        operation: Operation,
        topic: &str,
        metadata: Option<&HashMap<String, String>>,
    ) -> Result<()> {
        let mut context = RequestContext {
            operation,
            topic,
            metadata,
            identity: None,
        };

        if let Some(authenticator) = &self.authenticator {
            match authenticator.authenticate(&context) {
                Some(identity) => context.identity = Some(identity),
                None => {
                    warn!(operation = %operation, topic = %topic, "Rejected unauthenticated request");
                    return Err(Error::Unauthorized(format!(
                        "unauthenticated {operation} on topic '{topic}'"
                    )));
                }
            }
        }

        if let Some(authorizer) = &self.authorizer {
            if !authorizer.authorize(&context) {
                warn!(
                    operation = %operation,
                    topic = %topic,
                    identity = ?context.identity,
                    "Rejected unauthorized request"
                );
                return Err(Error::Unauthorized(format!(
                    "{operation} on topic '{topic}' denied"
                )));
            }
        }

        Ok(())
    }
}

impl fmt::Debug for AccessPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessPolicy")
            .field("authenticator", &self.authenticator.is_some())
            .field("authorizer", &self.authorizer.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TokenAuthenticator;

    impl Authenticator for TokenAuthenticator {
        fn authenticate(&self, context: &RequestContext<'_>) -> Option<String> {
            context
                .metadata
                .and_then(|m| m.get("token"))
                .map(|token| format!("user-{token}"))
        }
    }

    struct ReadOnlyAuthorizer;

    impl Authorizer for ReadOnlyAuthorizer {
        fn authorize(&self, context: &RequestContext<'_>) -> bool {
            context.operation == Operation::Subscribe || context.identity.is_some()
        }
    }

    #[test]
    fn test_empty_policy_allows_everything() {
        let policy = AccessPolicy::default();
        assert!(policy.check(Operation::Publish, "events", None).is_ok());
        assert!(policy.check(Operation::Subscribe, "events", None).is_ok());
    }

    #[test]
    fn test_authenticator_rejects_missing_identity() {
        let policy = AccessPolicy {
            authenticator: Some(Arc::new(TokenAuthenticator)),
            authorizer: None,
        };

        let mut metadata = HashMap::new();
        assert!(matches!(
            policy.check(Operation::Publish, "events", Some(&metadata)),
            Err(Error::Unauthorized(_))
        ));

        metadata.insert("token".to_string(), "42".to_string());
        assert!(policy.check(Operation::Publish, "events", Some(&metadata)).is_ok());
    }

    #[test]
    fn test_authorizer_sees_operation() {
        let policy = AccessPolicy {
            authenticator: None,
            authorizer: Some(Arc::new(ReadOnlyAuthorizer)),
        };

        assert!(policy.check(Operation::Subscribe, "events", None).is_ok());
        assert!(matches!(
            policy.check(Operation::Publish, "events", None),
            Err(Error::Unauthorized(_))
        ));
    }
}
