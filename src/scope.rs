use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

use crate::config::UserConfig;
use crate::errors::{MultiplexError, MultiplexResult};

/// Number of leading scope-hash bytes used as the on-disk folder name.
pub const FINGERPRINT_BYTES: usize = 8;

const USER_ADDRESS_BYTES: usize = 20;

/// Computes the scope hash for a `(user address, scope name)` pair:
/// lowercase hex of `SHA256(address || ":" || scope)`.
///
/// The rendering is deterministic so that sorted hash lists, and therefore
/// port assignment, are stable across processes and restarts.
pub fn scope_hash(user_address: &str, scope_name: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(user_address.as_bytes());
    hasher.update(b":");
    hasher.update(scope_name.as_bytes());
    hex::encode(hasher.finalize())
}

/// A user-defined namespace within a user address identifying one
/// replicated chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScopeId {
    address: String,
    scope: String,
}

impl ScopeId {
    pub fn new(address: impl Into<String>, scope: impl Into<String>) -> MultiplexResult<Self> {
        let address = address.into();
        let scope = scope.into();
        validate_user_address(&address)?;
        if scope.is_empty() {
            return Err(MultiplexError::Config(format!(
                "empty scope name for user address {address}"
            )));
        }
        Ok(Self { address, scope })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn hash(&self) -> String {
        scope_hash(&self.address, &self.scope)
    }

    /// First [`FINGERPRINT_BYTES`] of the scope hash, lowercase hex.
    pub fn fingerprint(&self) -> String {
        fingerprint_of(&self.hash())
    }
}

/// Shortens a scope hash to its filesystem fingerprint.
pub fn fingerprint_of(scope_hash: &str) -> String {
    scope_hash
        .chars()
        .take(FINGERPRINT_BYTES * 2)
        .collect::<String>()
}

fn validate_user_address(address: &str) -> MultiplexResult<()> {
    if address.is_empty() {
        return Err(MultiplexError::Config("empty user address".to_string()));
    }
    let bytes = hex::decode(address)
        .map_err(|err| MultiplexError::Config(format!("invalid user address {address}: {err}")))?;
    if bytes.len() != USER_ADDRESS_BYTES {
        return Err(MultiplexError::Config(format!(
            "user address {address} must encode {USER_ADDRESS_BYTES} bytes, got {}",
            bytes.len()
        )));
    }
    Ok(())
}

/// Single source of truth for the scope hash to scope identity mapping.
///
/// Built once from the user configuration when the reactor is constructed
/// and immutable afterwards, so lookups need no locking.
#[derive(Clone, Debug, Default)]
pub struct ScopeRegistry {
    scopes: BTreeMap<String, ScopeId>,
}

impl ScopeRegistry {
    pub fn from_user_config(config: &UserConfig) -> MultiplexResult<Self> {
        let mut scopes = BTreeMap::new();
        for (address, names) in &config.user_scopes {
            for name in names {
                let scope_id = ScopeId::new(address.clone(), name.clone())?;
                scopes.insert(scope_id.hash(), scope_id);
            }
        }
        Ok(Self { scopes })
    }

    pub fn address_of(&self, scope_hash: &str) -> MultiplexResult<&str> {
        self.scope_id(scope_hash).map(ScopeId::address)
    }

    pub fn scope_id(&self, scope_hash: &str) -> MultiplexResult<&ScopeId> {
        self.scopes.get(scope_hash).ok_or_else(|| {
            MultiplexError::NotFound(format!("no scope registered under hash {scope_hash}"))
        })
    }

    pub fn fingerprint(&self, scope_hash: &str) -> MultiplexResult<String> {
        self.scope_id(scope_hash)
            .map(|scope_id| scope_id.fingerprint())
    }

    /// All registered scope hashes in lexicographic order.
    pub fn hashes(&self) -> Vec<String> {
        self.scopes.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ZERO_ADDRESS: &str = "0000000000000000000000000000000000000000";

    #[test]
    fn scope_hash_is_deterministic() {
        let scope_id = ScopeId::new(ZERO_ADDRESS, "Default").unwrap();
        let expected = {
            let mut hasher = Sha256::new();
            hasher.update(format!("{ZERO_ADDRESS}:Default").as_bytes());
            hex::encode(hasher.finalize())
        };
        assert_eq!(scope_id.hash(), expected);
        assert_eq!(scope_id.hash(), scope_id.hash());
        assert_eq!(scope_id.hash().len(), 64);
    }

    #[test]
    fn fingerprint_is_hash_prefix() {
        let scope_id = ScopeId::new(ZERO_ADDRESS, "Default").unwrap();
        let hash = scope_id.hash();
        assert_eq!(scope_id.fingerprint(), hash[..16]);
    }

    #[test]
    fn distinct_pairs_produce_distinct_hashes() {
        let a = ScopeId::new(ZERO_ADDRESS, "Default").unwrap();
        let b = ScopeId::new(ZERO_ADDRESS, "Other").unwrap();
        let c = ScopeId::new("1111111111111111111111111111111111111111", "Default").unwrap();
        assert_ne!(a.hash(), b.hash());
        assert_ne!(a.hash(), c.hash());
        assert_ne!(b.hash(), c.hash());
    }

    #[test]
    fn rejects_invalid_addresses_and_empty_scopes() {
        assert!(ScopeId::new("", "Default").is_err());
        assert!(ScopeId::new("zzzz", "Default").is_err());
        assert!(ScopeId::new("00ff", "Default").is_err());
        assert!(ScopeId::new(ZERO_ADDRESS, "").is_err());
    }

    #[test]
    fn registry_resolves_addresses_in_sorted_order() {
        let mut user_scopes = BTreeMap::new();
        user_scopes.insert(ZERO_ADDRESS.to_string(), vec!["Default".to_string()]);
        user_scopes.insert(
            "1111111111111111111111111111111111111111".to_string(),
            vec!["Default".to_string(), "Games".to_string()],
        );
        let config = UserConfig {
            user_scopes,
            ..UserConfig::default()
        };
        let registry = ScopeRegistry::from_user_config(&config).unwrap();
        assert_eq!(registry.len(), 3);

        let hashes = registry.hashes();
        let mut sorted = hashes.clone();
        sorted.sort();
        assert_eq!(hashes, sorted);

        for hash in &hashes {
            let address = registry.address_of(hash).unwrap();
            assert!(!address.is_empty());
            assert_eq!(registry.fingerprint(hash).unwrap(), hash[..16]);
        }
        assert!(registry.address_of("ffff").is_err());
    }
}
