use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::StorageConfig;
use crate::db::{MultiplexDb, ScopedDb};
use crate::errors::{MultiplexError, MultiplexResult};
use crate::genesis::GenesisDoc;
use crate::state::ScopedState;
use crate::types::{Block, BlockMeta};

/// Database key layout. `V1` is the legacy human-readable layout, `V2`
/// uses fixed-width big-endian height keys that sort natively.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyLayout {
    V1,
    V2,
}

impl Default for KeyLayout {
    fn default() -> Self {
        KeyLayout::V1
    }
}

impl KeyLayout {
    pub fn parse(value: &str) -> MultiplexResult<Self> {
        match value {
            "" | "v1" => Ok(KeyLayout::V1),
            "v2" => Ok(KeyLayout::V2),
            other => Err(MultiplexError::Config(format!(
                "unknown database key layout {other}"
            ))),
        }
    }

    fn block_key(self, prefix: &str, height: u64) -> Vec<u8> {
        match self {
            KeyLayout::V1 => format!("{prefix}:{height}").into_bytes(),
            KeyLayout::V2 => {
                let mut key = Vec::with_capacity(prefix.len() + 9);
                key.extend_from_slice(prefix.as_bytes());
                key.push(b'/');
                key.extend_from_slice(&height.to_be_bytes());
                key
            }
        }
    }
}

/// Options shared by the state and block store wrappers.
#[derive(Clone, Debug, Default)]
pub struct StoreOptions {
    pub discard_abci_responses: bool,
    pub compact: bool,
    pub compaction_interval: Duration,
    pub db_key_layout: KeyLayout,
}

impl StoreOptions {
    pub fn from_config(config: &StorageConfig) -> MultiplexResult<Self> {
        Ok(Self {
            discard_abci_responses: config.discard_abci_responses,
            compact: config.compact,
            compaction_interval: Duration::from_millis(config.compaction_interval_ms),
            db_key_layout: KeyLayout::parse(&config.experimental_key_layout)?,
        })
    }
}

const STATE_KEY: &[u8] = b"stateKey";
const ABCI_RESPONSES_PREFIX: &str = "abciResponses";
const BLOCK_META_PREFIX: &str = "H";
const BLOCK_PREFIX: &str = "B";
const BLOCK_STORE_HEIGHT_KEY: &[u8] = b"blockStoreHeight";
const BLOCK_STORE_BASE_KEY: &[u8] = b"blockStoreBase";

/// Persistent store for one scope's consensus state.
pub struct StateStore {
    db: ScopedDb,
    options: StoreOptions,
}

impl StateStore {
    pub fn new(db: ScopedDb, options: StoreOptions) -> Self {
        Self { db, options }
    }

    pub fn load(&self) -> MultiplexResult<Option<ScopedState>> {
        match self.db.get(STATE_KEY)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn save(&self, state: &ScopedState) -> MultiplexResult<()> {
        let bytes = bincode::serialize(state)?;
        self.db.set_sync(STATE_KEY, &bytes)
    }

    /// Returns the previously persisted state when one exists, otherwise
    /// initializes state from the genesis doc and persists it.
    pub fn load_from_db_or_genesis(
        &self,
        scope_hash: &str,
        genesis_doc: &GenesisDoc,
    ) -> MultiplexResult<ScopedState> {
        if let Some(state) = self.load()? {
            return Ok(state);
        }
        let state = ScopedState::from_genesis(scope_hash, genesis_doc);
        self.save(&state)?;
        Ok(state)
    }

    /// Persists a finalize-block response unless the store was configured
    /// to discard them.
    pub fn save_abci_responses(&self, height: u64, responses: &[u8]) -> MultiplexResult<()> {
        if self.options.discard_abci_responses {
            return Ok(());
        }
        let key = self.options.db_key_layout.block_key(ABCI_RESPONSES_PREFIX, height);
        self.db.set(&key, responses)
    }

    pub fn load_abci_responses(&self, height: u64) -> MultiplexResult<Option<Vec<u8>>> {
        let key = self.options.db_key_layout.block_key(ABCI_RESPONSES_PREFIX, height);
        self.db.get(&key)
    }
}

/// Persistent store for one scope's committed blocks.
pub struct BlockStore {
    db: ScopedDb,
    options: StoreOptions,
    last_compaction: Mutex<Instant>,
}

impl BlockStore {
    pub fn new(db: ScopedDb, options: StoreOptions) -> Self {
        Self {
            db,
            options,
            last_compaction: Mutex::new(Instant::now()),
        }
    }

    pub fn base(&self) -> MultiplexResult<u64> {
        self.load_height_slot(BLOCK_STORE_BASE_KEY)
    }

    pub fn height(&self) -> MultiplexResult<u64> {
        self.load_height_slot(BLOCK_STORE_HEIGHT_KEY)
    }

    fn load_height_slot(&self, key: &[u8]) -> MultiplexResult<u64> {
        match self.db.get(key)? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                    MultiplexError::Config("invalid block store height encoding".to_string())
                })?;
                Ok(u64::from_be_bytes(raw))
            }
            None => Ok(0),
        }
    }

    pub fn save_block(&self, block: &Block) -> MultiplexResult<()> {
        let height = block.header.height;
        let meta = block.meta();
        let meta_key = self.options.db_key_layout.block_key(BLOCK_META_PREFIX, height);
        let block_key = self.options.db_key_layout.block_key(BLOCK_PREFIX, height);
        self.db.set(&meta_key, &bincode::serialize(&meta)?)?;
        self.db.set(&block_key, &bincode::serialize(block)?)?;
        self.db
            .set_sync(BLOCK_STORE_HEIGHT_KEY, &height.to_be_bytes())?;
        if self.base()? == 0 {
            self.db.set(BLOCK_STORE_BASE_KEY, &height.to_be_bytes())?;
        }
        self.maybe_compact();
        Ok(())
    }

    pub fn load_block(&self, height: u64) -> MultiplexResult<Option<Block>> {
        let key = self.options.db_key_layout.block_key(BLOCK_PREFIX, height);
        match self.db.get(&key)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn load_block_meta(&self, height: u64) -> MultiplexResult<Option<BlockMeta>> {
        let key = self.options.db_key_layout.block_key(BLOCK_META_PREFIX, height);
        match self.db.get(&key)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn maybe_compact(&self) {
        if !self.options.compact || self.options.compaction_interval.is_zero() {
            return;
        }
        let mut last = self.last_compaction.lock();
        if last.elapsed() >= self.options.compaction_interval {
            self.db.compact();
            *last = Instant::now();
        }
    }
}

/// Scope hash → state store, one entry per replicated chain.
#[derive(Default)]
pub struct MultiplexStateStore {
    entries: HashMap<String, Arc<StateStore>>,
}

impl MultiplexStateStore {
    /// Builds a state store over every database in the state multiplex.
    pub fn new(state_dbs: &MultiplexDb, options: StoreOptions) -> Self {
        let mut entries = HashMap::new();
        for scope_hash in state_dbs.scope_hashes() {
            if let Ok(db) = state_dbs.get(&scope_hash) {
                entries.insert(
                    scope_hash,
                    Arc::new(StateStore::new(db.clone(), options.clone())),
                );
            }
        }
        Self { entries }
    }

    pub fn get(&self, scope_hash: &str) -> MultiplexResult<Arc<StateStore>> {
        self.entries.get(scope_hash).cloned().ok_or_else(|| {
            MultiplexError::NotFound(format!("no state store for scope hash {scope_hash:?}"))
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Scope hash → block store, one entry per replicated chain.
#[derive(Default)]
pub struct MultiplexBlockStore {
    entries: HashMap<String, Arc<BlockStore>>,
}

impl MultiplexBlockStore {
    pub fn new(blockstore_dbs: &MultiplexDb, options: StoreOptions) -> Self {
        let mut entries = HashMap::new();
        for scope_hash in blockstore_dbs.scope_hashes() {
            if let Ok(db) = blockstore_dbs.get(&scope_hash) {
                entries.insert(
                    scope_hash,
                    Arc::new(BlockStore::new(db.clone(), options.clone())),
                );
            }
        }
        Self { entries }
    }

    pub fn get(&self, scope_hash: &str) -> MultiplexResult<Arc<BlockStore>> {
        self.entries.get(scope_hash).cloned().ok_or_else(|| {
            MultiplexError::NotFound(format!("no block store for scope hash {scope_hash:?}"))
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genesis::GenesisValidator;
    use crate::types::BlockHeader;

    fn open_db(dir: &std::path::Path) -> ScopedDb {
        ScopedDb::open("aa", &dir.join("store.db")).unwrap()
    }

    fn sample_genesis() -> GenesisDoc {
        GenesisDoc {
            chain_id: "chain-a".to_string(),
            initial_height: 1,
            genesis_time: None,
            validators: vec![GenesisValidator {
                address: "val-0".to_string(),
                pub_key: "00".repeat(32),
                power: 5,
                name: String::new(),
            }],
            app_hash: String::new(),
            app_state: None,
        }
    }

    #[test]
    fn state_store_initializes_from_genesis_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(open_db(dir.path()), StoreOptions::default());
        let genesis = sample_genesis();

        let first = store.load_from_db_or_genesis("aa", &genesis).unwrap();
        assert_eq!(first.chain_id, "chain-a");
        assert_eq!(first.last_block_height, 0);

        // A second load must come from the database, not the genesis doc.
        let mut modified = genesis.clone();
        modified.chain_id = "chain-b".to_string();
        let second = store.load_from_db_or_genesis("aa", &modified).unwrap();
        assert_eq!(second, first);
    }

    #[test]
    fn abci_responses_respect_discard_option() {
        let dir = tempfile::tempdir().unwrap();
        let discarding = StateStore::new(
            open_db(dir.path()),
            StoreOptions {
                discard_abci_responses: true,
                ..StoreOptions::default()
            },
        );
        discarding.save_abci_responses(3, b"resp").unwrap();
        assert_eq!(discarding.load_abci_responses(3).unwrap(), None);

        let keeping = StateStore::new(
            ScopedDb::open("bb", &dir.path().join("keep.db")).unwrap(),
            StoreOptions::default(),
        );
        keeping.save_abci_responses(3, b"resp").unwrap();
        assert_eq!(keeping.load_abci_responses(3).unwrap().as_deref(), Some(&b"resp"[..]));
    }

    #[test]
    fn block_store_tracks_height_and_base() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlockStore::new(open_db(dir.path()), StoreOptions::default());
        assert_eq!(store.height().unwrap(), 0);
        assert_eq!(store.base().unwrap(), 0);

        let block = Block {
            header: BlockHeader {
                chain_id: "chain-a".to_string(),
                height: 1,
                time_unix: 1_700_000_000,
                last_block_hash: String::new(),
                app_hash: String::new(),
            },
            txs: vec![b"tx".to_vec()],
        };
        store.save_block(&block).unwrap();
        assert_eq!(store.height().unwrap(), 1);
        assert_eq!(store.base().unwrap(), 1);
        assert_eq!(store.load_block(1).unwrap().unwrap(), block);
        assert_eq!(store.load_block_meta(1).unwrap().unwrap().num_txs, 1);
        assert_eq!(store.load_block(2).unwrap(), None);
    }

    #[test]
    fn key_layouts_do_not_collide() {
        let v1 = KeyLayout::V1.block_key(BLOCK_PREFIX, 10);
        let v2 = KeyLayout::V2.block_key(BLOCK_PREFIX, 10);
        assert_ne!(v1, v2);
        assert_eq!(KeyLayout::parse("").unwrap(), KeyLayout::V1);
        assert_eq!(KeyLayout::parse("v2").unwrap(), KeyLayout::V2);
        assert!(KeyLayout::parse("v7").is_err());
    }
}
