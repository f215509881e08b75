use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::NodeConfig;
use crate::db::MultiplexDb;
use crate::errors::{MultiplexError, MultiplexResult};
use crate::genesis::{ChecksummedGenesisDocSet, GenesisDoc};
use crate::scope::fingerprint_of;
use crate::store::{StateStore, StoreOptions};
use crate::types::{StateVersion, ValidatorSet};

/// State database key holding the raw JSON of the scope's genesis doc.
pub const GENESIS_DOC_KEY: &[u8] = b"mxGenesisDoc";
/// State database key holding the SHA-256 of the genesis set blob.
pub const GENESIS_DOC_HASH_KEY: &[u8] = b"mxGenesisDocHash";

/// The consensus-visible state of one replicated chain.
///
/// Loaded once by the multiplex supervisor; only the chain's own
/// consensus engine mutates it afterwards.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScopedState {
    pub scope_hash: String,
    pub chain_id: String,
    pub initial_height: i64,
    pub last_block_height: u64,
    pub last_block_hash: String,
    pub validators: ValidatorSet,
    pub version: StateVersion,
    pub app_hash: String,
}

impl ScopedState {
    pub fn from_genesis(scope_hash: &str, genesis_doc: &GenesisDoc) -> Self {
        Self {
            scope_hash: scope_hash.to_string(),
            chain_id: genesis_doc.chain_id.clone(),
            initial_height: genesis_doc.initial_height,
            last_block_height: 0,
            last_block_hash: String::new(),
            validators: genesis_doc.validator_set(),
            version: StateVersion::default(),
            app_hash: genesis_doc.app_hash.clone(),
        }
    }
}

/// Scope hash → chain state for every replicated chain.
#[derive(Clone, Debug, Default)]
pub struct MultiplexState {
    entries: HashMap<String, ScopedState>,
}

impl MultiplexState {
    pub fn insert(&mut self, state: ScopedState) {
        self.entries.insert(state.scope_hash.clone(), state);
    }

    pub fn get(&self, scope_hash: &str) -> MultiplexResult<&ScopedState> {
        self.entries.get(scope_hash).ok_or_else(|| {
            MultiplexError::NotFound(format!("no state for scope hash {scope_hash:?}"))
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Loads the state of every replicated chain from its state database,
/// falling back to the chain's genesis doc for first boots.
///
/// Scopes are processed in sorted hash order. For each scope the genesis
/// doc is validated, the persisted genesis-set checksum is reconciled
/// (first write wins; a mismatch aborts), and the state is read through
/// the scope's state store. The first error aborts the whole load; writes
/// already performed are left in place, which keeps a retry idempotent.
pub fn load_multiplex_state(
    state_dbs: &MultiplexDb,
    genesis_set: &ChecksummedGenesisDocSet,
    operator_genesis_hash_hex: Option<&str>,
    config: &NodeConfig,
) -> MultiplexResult<MultiplexState> {
    let replicated_chains = config.user.scope_hashes();
    let store_options = StoreOptions::from_config(&config.storage)?;
    let mut multiplex_state = MultiplexState::default();

    if let Some(operator_hash) = operator_genesis_hash_hex {
        let decoded = hex::decode(operator_hash).map_err(|err| {
            MultiplexError::Config(format!(
                "genesis hash provided by operator cannot be decoded: {err}"
            ))
        })?;
        if decoded != genesis_set.checksum() {
            return Err(MultiplexError::GenesisHashMismatch(
                "loaded genesis doc set does not match the operator-provided genesis hash"
                    .to_string(),
            ));
        }
    }

    for scope_hash in &replicated_chains {
        let entry = genesis_set.doc_by_scope(scope_hash)?;
        let mut genesis_doc = entry.genesis_doc.clone();
        genesis_doc.validate_and_complete().map_err(|err| match err {
            MultiplexError::GenesisInvalid(reason) => MultiplexError::GenesisInvalid(format!(
                "scope {}: {reason}",
                fingerprint_of(scope_hash)
            )),
            other => other,
        })?;

        let state_db = state_dbs.get(scope_hash)?;
        let persisted_hash = state_db.get(GENESIS_DOC_HASH_KEY)?;
        match persisted_hash {
            None => {
                // First boot for this scope; persist the checksum durably
                // for future verification, along with the raw doc.
                state_db.set_sync(GENESIS_DOC_HASH_KEY, genesis_set.checksum())?;
                let raw_doc = serde_json::to_vec(&entry.genesis_doc).map_err(|err| {
                    MultiplexError::GenesisInvalid(format!(
                        "couldn't encode genesis doc for persistence: {err}"
                    ))
                })?;
                state_db.set(GENESIS_DOC_KEY, &raw_doc)?;
                debug!(
                    scope = %fingerprint_of(scope_hash),
                    "persisted genesis doc set checksum"
                );
            }
            Some(persisted) if persisted.as_slice() != genesis_set.checksum() => {
                return Err(MultiplexError::GenesisHashMismatch(format!(
                    "scope {}: genesis doc hash in db does not match loaded genesis doc",
                    fingerprint_of(scope_hash)
                )));
            }
            Some(_) => {}
        }

        let state_store = StateStore::new(state_db.clone(), store_options.clone());
        let state = state_store.load_from_db_or_genesis(scope_hash, &genesis_doc)?;
        info!(
            scope = %fingerprint_of(scope_hash),
            chain_id = %state.chain_id,
            height = state.last_block_height,
            "loaded chain state"
        );
        multiplex_state.insert(state);
    }

    Ok(multiplex_state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genesis::GenesisValidator;

    #[test]
    fn state_from_genesis_carries_validators() {
        let doc = GenesisDoc {
            chain_id: "chain-a".to_string(),
            initial_height: 1,
            genesis_time: None,
            validators: vec![GenesisValidator {
                address: "val-0".to_string(),
                pub_key: "00".repeat(32),
                power: 7,
                name: String::new(),
            }],
            app_hash: "aabb".to_string(),
            app_state: None,
        };
        let state = ScopedState::from_genesis("ff", &doc);
        assert_eq!(state.scope_hash, "ff");
        assert_eq!(state.chain_id, "chain-a");
        assert_eq!(state.last_block_height, 0);
        assert_eq!(state.validators.total_voting_power(), 7);
        assert_eq!(state.app_hash, "aabb");
    }

    #[test]
    fn multiplex_state_lookup_reports_unknown_scope() {
        let state = MultiplexState::default();
        assert!(matches!(
            state.get("none"),
            Err(MultiplexError::NotFound(_))
        ));
    }
}
