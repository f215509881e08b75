use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{MultiplexError, MultiplexResult};
use crate::scope::scope_hash;

pub const DEFAULT_LISTEN_PORT_BASE: u16 = 30001;

pub const MEMPOOL_KIND_FLOOD: &str = "flood";
pub const MEMPOOL_KIND_NOP: &str = "nop";

pub const BLOCKSYNC_V0: &str = "v0";

/// Replication mode of the node: a solitary chain or a multiplex of them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Replication {
    Singular,
    Plural,
}

impl Default for Replication {
    fn default() -> Self {
        Replication::Singular
    }
}

/// Enumerates the replicated chains owned by each user address and the
/// base port the per-chain listeners are assigned from.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct UserConfig {
    pub replication: Replication,
    pub listen_port_base: u16,
    pub user_scopes: BTreeMap<String, Vec<String>>,
}

impl Default for UserConfig {
    fn default() -> Self {
        Self {
            replication: Replication::default(),
            listen_port_base: DEFAULT_LISTEN_PORT_BASE,
            user_scopes: BTreeMap::new(),
        }
    }
}

impl UserConfig {
    pub fn new(
        replication: Replication,
        user_scopes: BTreeMap<String, Vec<String>>,
        listen_port_base: Option<u16>,
    ) -> Self {
        Self {
            replication,
            user_scopes,
            listen_port_base: listen_port_base.unwrap_or(DEFAULT_LISTEN_PORT_BASE),
        }
    }

    /// Scope hashes of every replicated chain, lexicographically sorted.
    ///
    /// The sorted order is what makes port offsets deterministic across
    /// restarts. Singular mode replicates nothing and yields an empty list.
    pub fn scope_hashes(&self) -> Vec<String> {
        if self.replication == Replication::Singular {
            return Vec::new();
        }
        let mut hashes: Vec<String> = self
            .user_scopes
            .iter()
            .flat_map(|(address, scopes)| {
                scopes.iter().map(|scope| scope_hash(address, scope))
            })
            .collect();
        hashes.sort();
        hashes
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct P2pConfig {
    pub listen_address: String,
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            listen_address: "tcp://0.0.0.0:26656".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    pub listen_address: String,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            listen_address: "tcp://127.0.0.1:26657".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GrpcConfig {
    pub listen_address: String,
    pub privileged: PrivilegedGrpcConfig,
}

impl Default for GrpcConfig {
    fn default() -> Self {
        Self {
            listen_address: "tcp://127.0.0.1:26670".to_string(),
            privileged: PrivilegedGrpcConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PrivilegedGrpcConfig {
    pub listen_address: String,
}

impl Default for PrivilegedGrpcConfig {
    fn default() -> Self {
        Self {
            listen_address: "tcp://127.0.0.1:26671".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MempoolConfig {
    /// One of `flood` (default, also selected by the empty string) or `nop`.
    pub kind: String,
    pub size: usize,
    pub max_tx_bytes: usize,
    pub max_txs_bytes: u64,
}

impl Default for MempoolConfig {
    fn default() -> Self {
        Self {
            kind: MEMPOOL_KIND_FLOOD.to_string(),
            size: 5_000,
            max_tx_bytes: 1024 * 1024,
            max_txs_bytes: 64 * 1024 * 1024,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockSyncConfig {
    pub version: String,
}

impl Default for BlockSyncConfig {
    fn default() -> Self {
        Self {
            version: BLOCKSYNC_V0.to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub discard_abci_responses: bool,
    pub compact: bool,
    pub compaction_interval_ms: u64,
    /// Database key layout: empty (legacy v1), `v1`, or `v2`.
    pub experimental_key_layout: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            discard_abci_responses: false,
            compact: false,
            compaction_interval_ms: 0,
            experimental_key_layout: String::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentationConfig {
    /// Profiling endpoint listen address; profiling stays off unless set.
    pub prof_laddr: Option<String>,
}

impl Default for InstrumentationConfig {
    fn default() -> Self {
        Self { prof_laddr: None }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub root_dir: PathBuf,
    pub genesis_file: PathBuf,
    /// Operator-provided genesis set checksum (hex); checked when nonempty.
    pub genesis_hash: String,
    pub node_key_file: PathBuf,
    pub priv_validator_key_file: PathBuf,
    pub priv_validator_state_file: PathBuf,
    /// When nonempty, votes are signed by an external process reachable at
    /// this socket address instead of a file-backed signer.
    pub priv_validator_listen_addr: String,
    /// ABCI application endpoint: `local` for the in-process application,
    /// otherwise a `host:port` socket address.
    pub proxy_app: String,
    pub filter_peers: bool,
    pub p2p: P2pConfig,
    pub rpc: RpcConfig,
    pub grpc: GrpcConfig,
    pub mempool: MempoolConfig,
    pub blocksync: BlockSyncConfig,
    pub storage: StorageConfig,
    pub instrumentation: InstrumentationConfig,
    pub user: UserConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("."),
            genesis_file: PathBuf::from("config/genesis.json"),
            genesis_hash: String::new(),
            node_key_file: PathBuf::from("config/node_key.json"),
            priv_validator_key_file: PathBuf::from("config/priv_validator_key.json"),
            priv_validator_state_file: PathBuf::from("data/priv_validator_state.json"),
            priv_validator_listen_addr: String::new(),
            proxy_app: "local".to_string(),
            filter_peers: false,
            p2p: P2pConfig::default(),
            rpc: RpcConfig::default(),
            grpc: GrpcConfig::default(),
            mempool: MempoolConfig::default(),
            blocksync: BlockSyncConfig::default(),
            storage: StorageConfig::default(),
            instrumentation: InstrumentationConfig::default(),
            user: UserConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn load(path: &Path) -> MultiplexResult<Self> {
        let content = fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|err| MultiplexError::Config(format!("unable to parse config: {err}")))
    }

    pub fn save(&self, path: &Path) -> MultiplexResult<()> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;
        let encoded = toml::to_string_pretty(self)
            .map_err(|err| MultiplexError::Config(format!("unable to encode config: {err}")))?;
        fs::write(path, encoded)?;
        Ok(())
    }

    /// Resolves a possibly-relative configured path against the root dir.
    pub fn rootify(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root_dir.join(path)
        }
    }

    pub fn genesis_file(&self) -> PathBuf {
        self.rootify(&self.genesis_file)
    }

    pub fn node_key_file(&self) -> PathBuf {
        self.rootify(&self.node_key_file)
    }

    pub fn priv_validator_key_file(&self) -> PathBuf {
        self.rootify(&self.priv_validator_key_file)
    }

    pub fn priv_validator_state_file(&self) -> PathBuf {
        self.rootify(&self.priv_validator_state_file)
    }

    pub fn operator_genesis_hash(&self) -> Option<&str> {
        if self.genesis_hash.is_empty() {
            None
        } else {
            Some(&self.genesis_hash)
        }
    }

    /// Rewrites the four service listen addresses, preserving everything
    /// but the port. Used when deriving per-scope configurations.
    pub fn set_listen_addresses(
        &mut self,
        p2p: String,
        rpc: String,
        grpc: String,
        grpc_privileged: String,
    ) {
        self.p2p.listen_address = p2p;
        self.rpc.listen_address = rpc;
        self.grpc.listen_address = grpc;
        self.grpc.privileged.listen_address = grpc_privileged;
    }

    /// Rejects configurations that cannot be started: unknown mempool and
    /// block-sync selections, unknown key layouts, and a plural replication
    /// mode with no scopes to replicate.
    pub fn validate_basic(&self) -> MultiplexResult<()> {
        match self.mempool.kind.as_str() {
            MEMPOOL_KIND_FLOOD | MEMPOOL_KIND_NOP | "" => {}
            other => {
                return Err(MultiplexError::Config(format!(
                    "unknown mempool kind: {other:?}"
                )));
            }
        }
        match self.blocksync.version.as_str() {
            BLOCKSYNC_V0 => {}
            version @ ("v1" | "v2") => {
                return Err(MultiplexError::Config(format!(
                    "block sync version {version} has been deprecated, please use v0"
                )));
            }
            other => {
                return Err(MultiplexError::Config(format!(
                    "unknown block sync version {other}"
                )));
            }
        }
        match self.storage.experimental_key_layout.as_str() {
            "" | "v1" | "v2" => {}
            other => {
                return Err(MultiplexError::Config(format!(
                    "unknown database key layout {other}"
                )));
            }
        }
        if self.user.replication == Replication::Plural && self.user.user_scopes.is_empty() {
            return Err(MultiplexError::Config(
                "plural replication requires at least one user scope".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_scope_config() -> UserConfig {
        let mut user_scopes = BTreeMap::new();
        user_scopes.insert(
            "0000000000000000000000000000000000000000".to_string(),
            vec!["Default".to_string(), "Games".to_string()],
        );
        UserConfig::new(Replication::Plural, user_scopes, None)
    }

    #[test]
    fn scope_hashes_are_sorted_and_stable() {
        let config = two_scope_config();
        let first = config.scope_hashes();
        let second = config.scope_hashes();
        assert_eq!(first.len(), 2);
        assert_eq!(first, second);
        let mut sorted = first.clone();
        sorted.sort();
        assert_eq!(first, sorted);
    }

    #[test]
    fn singular_mode_has_no_replicated_chains() {
        let mut config = two_scope_config();
        config.replication = Replication::Singular;
        assert!(config.scope_hashes().is_empty());
    }

    #[test]
    fn config_roundtrips_through_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = NodeConfig::default();
        config.user = two_scope_config();
        config.filter_peers = true;
        config.save(&path).unwrap();

        let loaded = NodeConfig::load(&path).unwrap();
        assert_eq!(loaded.user.scope_hashes(), config.user.scope_hashes());
        assert_eq!(loaded.user.listen_port_base, DEFAULT_LISTEN_PORT_BASE);
        assert!(loaded.filter_peers);
        assert_eq!(loaded.mempool.kind, MEMPOOL_KIND_FLOOD);
    }

    #[test]
    fn validate_basic_rejects_bad_selections() {
        let mut config = NodeConfig::default();
        assert!(config.validate_basic().is_ok());

        config.mempool.kind = "priority".to_string();
        assert!(config.validate_basic().is_err());
        config.mempool.kind = String::new();
        assert!(config.validate_basic().is_ok());

        config.blocksync.version = "v1".to_string();
        let err = config.validate_basic().unwrap_err();
        assert!(err.to_string().contains("deprecated"));
        config.blocksync.version = "v3".to_string();
        assert!(config.validate_basic().is_err());
        config.blocksync.version = BLOCKSYNC_V0.to_string();

        config.storage.experimental_key_layout = "v9".to_string();
        assert!(config.validate_basic().is_err());
        config.storage.experimental_key_layout = "v2".to_string();
        assert!(config.validate_basic().is_ok());

        config.user.replication = Replication::Plural;
        assert!(config.validate_basic().is_err());
    }
}
