use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Block protocol version spoken by this software.
pub const BLOCK_PROTOCOL: u64 = 11;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validator {
    pub address: String,
    pub pub_key: String,
    pub voting_power: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorSet {
    pub validators: Vec<Validator>,
}

impl ValidatorSet {
    pub fn new(validators: Vec<Validator>) -> Self {
        Self { validators }
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    pub fn total_voting_power(&self) -> i64 {
        self.validators
            .iter()
            .map(|validator| validator.voting_power)
            .sum()
    }

    pub fn has_address(&self, address: &str) -> bool {
        self.validators
            .iter()
            .any(|validator| validator.address == address)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateVersion {
    pub block_protocol: u64,
    pub app_version: u64,
}

impl Default for StateVersion {
    fn default() -> Self {
        Self {
            block_protocol: BLOCK_PROTOCOL,
            app_version: 0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub chain_id: String,
    pub height: u64,
    pub time_unix: u64,
    pub last_block_hash: String,
    pub app_hash: String,
}

impl BlockHeader {
    pub fn hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.chain_id.as_bytes());
        hasher.update(self.height.to_be_bytes());
        hasher.update(self.time_unix.to_be_bytes());
        hasher.update(self.last_block_hash.as_bytes());
        hasher.update(self.app_hash.as_bytes());
        hex::encode(hasher.finalize())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub txs: Vec<Vec<u8>>,
}

impl Block {
    pub fn hash(&self) -> String {
        self.header.hash()
    }

    pub fn meta(&self) -> BlockMeta {
        BlockMeta {
            height: self.header.height,
            hash: self.hash(),
            num_txs: self.txs.len(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMeta {
    pub height: u64,
    pub hash: String,
    pub num_txs: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteKind {
    Prevote,
    Precommit,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub kind: VoteKind,
    pub height: u64,
    pub round: u32,
    pub block_hash: String,
    #[serde(default)]
    pub signature: Vec<u8>,
}

impl Vote {
    pub fn sign_bytes(&self, chain_id: &str) -> Vec<u8> {
        canonical_sign_bytes(
            chain_id,
            match self.kind {
                VoteKind::Prevote => "prevote",
                VoteKind::Precommit => "precommit",
            },
            self.height,
            self.round,
            &self.block_hash,
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub height: u64,
    pub round: u32,
    pub block_hash: String,
    #[serde(default)]
    pub signature: Vec<u8>,
}

impl Proposal {
    pub fn sign_bytes(&self, chain_id: &str) -> Vec<u8> {
        canonical_sign_bytes(chain_id, "proposal", self.height, self.round, &self.block_hash)
    }
}

fn canonical_sign_bytes(
    chain_id: &str,
    kind: &str,
    height: u64,
    round: u32,
    block_hash: &str,
) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(chain_id.len() + kind.len() + block_hash.len() + 16);
    bytes.extend_from_slice(chain_id.as_bytes());
    bytes.push(b'/');
    bytes.extend_from_slice(kind.as_bytes());
    bytes.push(b'/');
    bytes.extend_from_slice(&height.to_be_bytes());
    bytes.extend_from_slice(&round.to_be_bytes());
    bytes.push(b'/');
    bytes.extend_from_slice(block_hash.as_bytes());
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_hash_covers_header_fields() {
        let header = BlockHeader {
            chain_id: "chain-a".to_string(),
            height: 7,
            time_unix: 1_700_000_000,
            last_block_hash: "aa".to_string(),
            app_hash: String::new(),
        };
        let mut other = header.clone();
        other.height = 8;
        assert_ne!(header.hash(), other.hash());
        assert_eq!(header.hash(), header.hash());
    }

    #[test]
    fn sign_bytes_distinguish_chains_and_kinds() {
        let vote = Vote {
            kind: VoteKind::Prevote,
            height: 4,
            round: 0,
            block_hash: "bb".to_string(),
            signature: Vec::new(),
        };
        let mut precommit = vote.clone();
        precommit.kind = VoteKind::Precommit;
        assert_ne!(vote.sign_bytes("chain-a"), vote.sign_bytes("chain-b"));
        assert_ne!(vote.sign_bytes("chain-a"), precommit.sign_bytes("chain-a"));
    }
}
