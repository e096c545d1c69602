//! Credential validation.
//!
//! Configured keys are kept only as SHA-256 digests and compared in constant
//! time against every entry, so neither the key length nor the position of
//! the first differing byte shows up in response timing. The active set is
//! fetched on every call, which lets a reload swap it without restarting.

use crate::dispatcher::CallContext;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CredentialError {
    #[error("credential set is empty")]
    Empty,
    #[error("credential #{0} is empty")]
    EmptyKey(usize),
}

/// Immutable set of accepted keys.
pub struct CredentialSet {
    digests: Vec<[u8; 32]>,
}

impl CredentialSet {
    pub fn new<I, S>(keys: I) -> Result<Self, CredentialError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut digests = Vec::new();
        for (index, key) in keys.into_iter().enumerate() {
            let key = key.as_ref();
            if key.is_empty() {
                return Err(CredentialError::EmptyKey(index));
            }
            digests.push(digest(key));
        }
        if digests.is_empty() {
            return Err(CredentialError::Empty);
        }
        Ok(Self { digests })
    }

    pub fn len(&self) -> usize {
        self.digests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.digests.is_empty()
    }

    /// Index of the matching key. Every entry is compared regardless of
    /// where the match is.
    pub fn find(&self, presented: &str) -> Option<usize> {
        let presented = digest(presented);
        let mut matched = None;
        for (index, known) in self.digests.iter().enumerate() {
            let equal: bool = known[..].ct_eq(&presented[..]).into();
            if equal && matched.is_none() {
                matched = Some(index);
            }
        }
        matched
    }
}

fn digest(key: &str) -> [u8; 32] {
    Sha256::digest(key.as_bytes()).into()
}

/// Holder of the active credential set.
pub struct CredentialStore {
    active: RwLock<Arc<CredentialSet>>,
}

impl CredentialStore {
    pub fn new(set: CredentialSet) -> Self {
        Self {
            active: RwLock::new(Arc::new(set)),
        }
    }

    pub fn active(&self) -> Arc<CredentialSet> {
        self.active.read().clone()
    }

    /// Swap in a new set, returning the previous size.
    pub fn replace(&self, set: CredentialSet) -> usize {
        let mut active = self.active.write();
        let previous = active.len();
        *active = Arc::new(set);
        tracing::info!(
            target: "cassadmin::security",
            previous,
            current = active.len(),
            "credential set reloaded"
        );
        previous
    }
}

/// Outcome of checking one presented credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    Accepted,
    Missing,
    Rejected,
}

#[derive(Clone)]
pub struct CredentialValidator {
    store: Arc<CredentialStore>,
}

impl CredentialValidator {
    pub fn new(store: Arc<CredentialStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    /// Classify a presented credential and emit one security event.
    pub fn check(&self, presented: Option<&str>, ctx: &CallContext) -> AuthOutcome {
        let presented = match presented.filter(|key| !key.is_empty()) {
            Some(key) => key,
            None => {
                tracing::warn!(
                    target: "cassadmin::security",
                    request_id = %ctx.request_id,
                    client = %ctx.client,
                    outcome = "missing",
                    "authentication failed: no credential presented"
                );
                return AuthOutcome::Missing;
            }
        };

        match self.store.active().find(presented) {
            Some(key_index) => {
                tracing::info!(
                    target: "cassadmin::security",
                    request_id = %ctx.request_id,
                    client = %ctx.client,
                    outcome = "accepted",
                    key_index,
                    "authentication succeeded"
                );
                AuthOutcome::Accepted
            }
            None => {
                tracing::warn!(
                    target: "cassadmin::security",
                    request_id = %ctx.request_id,
                    client = %ctx.client,
                    outcome = "rejected",
                    "authentication failed: invalid credential"
                );
                AuthOutcome::Rejected
            }
        }
    }

    pub fn validate(&self, presented: Option<&str>, ctx: &CallContext) -> bool {
        self.check(presented, ctx) == AuthOutcome::Accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::EventCapture;

    fn validator(keys: &[&str]) -> CredentialValidator {
        let set = CredentialSet::new(keys.iter().copied()).unwrap();
        CredentialValidator::new(Arc::new(CredentialStore::new(set)))
    }

    #[test]
    fn test_accepts_configured_key() {
        let v = validator(&["alpha-key", "beta-key"]);
        let ctx = CallContext::new("test");
        assert!(v.validate(Some("alpha-key"), &ctx));
        assert!(v.validate(Some("beta-key"), &ctx));
    }

    #[test]
    fn test_rejects_unknown_key() {
        let v = validator(&["alpha-key"]);
        let ctx = CallContext::new("test");
        assert_eq!(v.check(Some("alpha-kez"), &ctx), AuthOutcome::Rejected);
        assert_eq!(v.check(Some("alpha-key-longer"), &ctx), AuthOutcome::Rejected);
    }

    #[test]
    fn test_empty_and_absent_are_missing() {
        let v = validator(&["alpha-key"]);
        let ctx = CallContext::new("test");
        assert_eq!(v.check(None, &ctx), AuthOutcome::Missing);
        assert_eq!(v.check(Some(""), &ctx), AuthOutcome::Missing);
        assert!(!v.validate(Some(""), &ctx));
    }

    #[test]
    fn test_find_returns_index() {
        let set = CredentialSet::new(["a1", "b2", "c3"]).unwrap();
        assert_eq!(set.find("c3"), Some(2));
        assert_eq!(set.find("d4"), None);
    }

    #[test]
    fn test_empty_set_rejected() {
        let keys: [&str; 0] = [];
        assert!(matches!(CredentialSet::new(keys), Err(CredentialError::Empty)));
        assert!(matches!(
            CredentialSet::new(["ok", ""]),
            Err(CredentialError::EmptyKey(1))
        ));
    }

    #[test]
    fn test_replace_takes_effect_on_next_call() {
        let v = validator(&["old-key"]);
        let ctx = CallContext::new("test");
        assert!(v.validate(Some("old-key"), &ctx));

        let previous = v
            .store()
            .replace(CredentialSet::new(["new-key", "other-key"]).unwrap());
        assert_eq!(previous, 1);
        assert!(!v.validate(Some("old-key"), &ctx));
        assert!(v.validate(Some("new-key"), &ctx));
        assert_eq!(v.store().active().len(), 2);
    }

    #[test]
    fn test_every_check_emits_one_security_event() {
        let capture = EventCapture::default();
        let _guard = capture.install();
        let v = validator(&["alpha-key"]);
        let ctx = CallContext::new("test");

        v.check(None, &ctx);
        v.check(Some(""), &ctx);
        v.check(Some("alpha-kez"), &ctx);
        v.validate(Some("alpha-key"), &ctx);

        assert_eq!(
            capture.outcomes("cassadmin::security"),
            vec!["missing", "missing", "rejected", "accepted"]
        );
    }
}
