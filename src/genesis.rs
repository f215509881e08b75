use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::{MultiplexError, MultiplexResult};
use crate::scope::scope_hash;
use crate::types::{Validator, ValidatorSet};

pub const MAX_CHAIN_ID_LEN: usize = 50;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisValidator {
    pub address: String,
    pub pub_key: String,
    pub power: i64,
    #[serde(default)]
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GenesisDoc {
    pub chain_id: String,
    #[serde(default)]
    pub initial_height: i64,
    #[serde(default)]
    pub genesis_time: Option<String>,
    pub validators: Vec<GenesisValidator>,
    #[serde(default)]
    pub app_hash: String,
    #[serde(default)]
    pub app_state: Option<serde_json::Value>,
}

impl GenesisDoc {
    /// Fills in defaults and rejects documents a chain cannot start from.
    pub fn validate_and_complete(&mut self) -> MultiplexResult<()> {
        if self.chain_id.is_empty() {
            return Err(MultiplexError::GenesisInvalid(
                "genesis doc must include a non-empty chain_id".to_string(),
            ));
        }
        if self.chain_id.len() > MAX_CHAIN_ID_LEN {
            return Err(MultiplexError::GenesisInvalid(format!(
                "chain_id in genesis doc is too long (max: {MAX_CHAIN_ID_LEN})"
            )));
        }
        if self.initial_height < 0 {
            return Err(MultiplexError::GenesisInvalid(format!(
                "initial_height cannot be negative (got {})",
                self.initial_height
            )));
        }
        if self.initial_height == 0 {
            self.initial_height = 1;
        }
        if self.validators.is_empty() {
            return Err(MultiplexError::GenesisInvalid(
                "genesis doc must include at least one validator".to_string(),
            ));
        }
        for validator in &self.validators {
            if validator.power < 0 {
                return Err(MultiplexError::GenesisInvalid(format!(
                    "validator {} has negative voting power",
                    validator.address
                )));
            }
        }
        Ok(())
    }

    pub fn validator_set(&self) -> ValidatorSet {
        ValidatorSet::new(
            self.validators
                .iter()
                .map(|validator| Validator {
                    address: validator.address.clone(),
                    pub_key: validator.pub_key.clone(),
                    voting_power: validator.power,
                })
                .collect(),
        )
    }
}

/// One entry of the genesis doc set: the genesis doc of the chain
/// identified by `(user_address, scope)`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScopedGenesisDoc {
    pub user_address: String,
    pub scope: String,
    pub genesis_doc: GenesisDoc,
}

impl ScopedGenesisDoc {
    pub fn scope_hash(&self) -> String {
        scope_hash(&self.user_address, &self.scope)
    }
}

/// The genesis file of a multiplex node: a set of genesis docs, one per
/// replicated chain.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GenesisDocSet {
    pub genesis_docs: Vec<ScopedGenesisDoc>,
}

impl GenesisDocSet {
    pub fn doc_by_scope(&self, scope_hash: &str) -> MultiplexResult<&ScopedGenesisDoc> {
        self.genesis_docs
            .iter()
            .find(|entry| entry.scope_hash() == scope_hash)
            .ok_or_else(|| MultiplexError::GenesisMissing(scope_hash.to_string()))
    }

    pub fn len(&self) -> usize {
        self.genesis_docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.genesis_docs.is_empty()
    }
}

/// A loaded genesis doc set together with the SHA-256 of the raw JSON
/// blob it was parsed from.
///
/// The checksum intentionally covers the whole set blob rather than the
/// individual documents; per-doc checksums would be more precise, and the
/// raw doc persisted under the scope's state database keeps that
/// migration possible.
#[derive(Clone, Debug)]
pub struct ChecksummedGenesisDocSet {
    set: GenesisDocSet,
    checksum: [u8; 32],
}

impl ChecksummedGenesisDocSet {
    pub fn from_json(blob: &[u8]) -> MultiplexResult<Self> {
        let set: GenesisDocSet = serde_json::from_slice(blob).map_err(|err| {
            MultiplexError::GenesisInvalid(format!("couldn't parse genesis doc set: {err}"))
        })?;
        let mut hasher = Sha256::new();
        hasher.update(blob);
        Ok(Self {
            set,
            checksum: hasher.finalize().into(),
        })
    }

    pub fn load(path: &Path) -> MultiplexResult<Self> {
        let blob = fs::read(path).map_err(|err| {
            MultiplexError::GenesisInvalid(format!(
                "couldn't read genesis doc set from {}: {err}",
                path.display()
            ))
        })?;
        Self::from_json(&blob)
    }

    pub fn checksum(&self) -> &[u8; 32] {
        &self.checksum
    }

    pub fn checksum_hex(&self) -> String {
        hex::encode(self.checksum)
    }

    pub fn doc_by_scope(&self, scope_hash: &str) -> MultiplexResult<&ScopedGenesisDoc> {
        self.set.doc_by_scope(scope_hash)
    }

    pub fn set(&self) -> &GenesisDocSet {
        &self.set
    }
}
