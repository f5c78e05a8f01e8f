//! Caller identities and counter key derivation.

use uuid::Uuid;

use super::scope::Scope;
use crate::error::{Result, TollgateError};

/// Network origin of an unauthenticated request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Origin {
    /// Address of the directly connected peer
    pub peer_addr: Option<String>,
    /// Client address as reported by the trusted front proxy
    pub forwarded_for: Option<String>,
}

impl Origin {
    /// An origin known only by its peer address.
    pub fn peer(addr: impl Into<String>) -> Self {
        Self {
            peer_addr: Some(addr.into()),
            forwarded_for: None,
        }
    }

    /// Attach the forwarded client address.
    pub fn with_forwarded_for(mut self, addr: impl Into<String>) -> Self {
        self.forwarded_for = Some(addr.into());
        self
    }

    /// The address to count against.
    ///
    /// The forwarded address wins over the peer address: TLS terminates at a
    /// trusted front door, so the peer is always the proxy. Only the first
    /// hop of a forwarded list is the client.
    pub fn address(&self) -> Option<&str> {
        let forwarded = self
            .forwarded_for
            .as_deref()
            .and_then(|list| list.split(',').next())
            .map(str::trim)
            .filter(|addr| !addr.is_empty());

        forwarded.or_else(|| {
            self.peer_addr
                .as_deref()
                .map(str::trim)
                .filter(|addr| !addr.is_empty())
        })
    }
}

/// The identity issuing a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Actor {
    /// Trusted internal caller; never limited
    Internal,
    /// Authenticated end user
    User { id: i64 },
    /// Unauthenticated caller known by network origin
    Anonymous(Origin),
}

impl Actor {
    /// An authenticated user.
    pub fn user(id: i64) -> Self {
        Actor::User { id }
    }

    /// An anonymous caller.
    pub fn anonymous(origin: Origin) -> Self {
        Actor::Anonymous(origin)
    }

    pub fn is_internal(&self) -> bool {
        matches!(self, Actor::Internal)
    }

    pub fn user_id(&self) -> Option<i64> {
        match self {
            Actor::User { id } => Some(*id),
            _ => None,
        }
    }
}

/// A key that uniquely identifies one counter in the store.
///
/// Each identity kind has its own prefix so the key spaces never overlap.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey(String);

impl CounterKey {
    /// Derive the counter key for an actor.
    ///
    /// Internal actors are never counted and get no key.
    pub fn for_actor(actor: &Actor, scope: Scope) -> Result<Option<Self>> {
        match actor {
            Actor::Internal => Ok(None),
            Actor::User { id } => Ok(Some(Self(format!("user:{id}:{scope}")))),
            Actor::Anonymous(origin) => {
                let addr = origin.address().ok_or_else(|| {
                    TollgateError::IdentityRequired(
                        "cannot claim rate limit for unauthenticated caller without an origin address"
                            .to_string(),
                    )
                })?;
                Ok(Some(Self(format!("anon:{addr}:{scope}"))))
            }
        }
    }

    /// Derive the counter key for an entitlement.
    ///
    /// Keyed by the entitlement id rather than the access token, so every
    /// token issued under one entitlement draws from the same quota.
    pub fn for_entitlement(id: &Uuid, scope: Scope) -> Self {
        Self(format!("entitlement:{id}:{scope}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CounterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(actor: &Actor, scope: Scope) -> String {
        CounterKey::for_actor(actor, scope)
            .unwrap()
            .unwrap()
            .to_string()
    }

    #[test]
    fn test_user_key() {
        assert_eq!(key(&Actor::user(42), Scope::Completion), "user:42:completion");
        assert_eq!(
            key(&Actor::user(42), Scope::CodeCompletion),
            "user:42:code_completion"
        );
    }

    #[test]
    fn test_internal_actor_has_no_key() {
        assert_eq!(CounterKey::for_actor(&Actor::Internal, Scope::Completion).unwrap(), None);
    }

    #[test]
    fn test_anonymous_prefers_forwarded_address() {
        let origin = Origin::peer("10.0.0.1").with_forwarded_for("203.0.113.9");
        assert_eq!(
            key(&Actor::anonymous(origin), Scope::Completion),
            "anon:203.0.113.9:completion"
        );
    }

    #[test]
    fn test_anonymous_falls_back_to_peer() {
        let origin = Origin::peer("198.51.100.7").with_forwarded_for("  ");
        assert_eq!(
            key(&Actor::anonymous(origin), Scope::Completion),
            "anon:198.51.100.7:completion"
        );
    }

    #[test]
    fn test_forwarded_list_uses_client_hop() {
        let origin = Origin::default().with_forwarded_for("203.0.113.9, 10.1.1.1");
        assert_eq!(origin.address(), Some("203.0.113.9"));
    }

    #[test]
    fn test_anonymous_without_origin_requires_identity() {
        let err = CounterKey::for_actor(&Actor::anonymous(Origin::default()), Scope::Completion)
            .unwrap_err();
        assert!(matches!(err, TollgateError::IdentityRequired(_)));
    }

    #[test]
    fn test_distinct_addresses_never_collide() {
        let a = key(&Actor::anonymous(Origin::peer("203.0.113.9")), Scope::Completion);
        let b = key(&Actor::anonymous(Origin::peer("203.0.113.10")), Scope::Completion);
        let again = key(&Actor::anonymous(Origin::peer("203.0.113.9")), Scope::Completion);

        assert_ne!(a, b);
        assert_eq!(a, again);
    }

    #[test]
    fn test_entitlement_key() {
        let id = Uuid::nil();
        assert_eq!(
            CounterKey::for_entitlement(&id, Scope::Completion).as_str(),
            "entitlement:00000000-0000-0000-0000-000000000000:completion"
        );
    }
}
