use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use rocksdb::{DBWithThreadMode, MultiThreaded, Options, WriteOptions};

use crate::config::{NodeConfig, Replication};
use crate::errors::{MultiplexError, MultiplexResult};
use crate::fs::{scoped_data_dir, DEFAULT_DATA_DIR};
use crate::scope::ScopeRegistry;

/// The four per-scope database families. Families and scopes are
/// orthogonal: every `(family, scope)` pair maps to its own storage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DbFamily {
    Blockstore,
    State,
    Indexer,
    Evidence,
}

impl DbFamily {
    pub const ALL: [DbFamily; 4] = [
        DbFamily::Blockstore,
        DbFamily::State,
        DbFamily::Indexer,
        DbFamily::Evidence,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DbFamily::Blockstore => "blockstore",
            DbFamily::State => "state",
            DbFamily::Indexer => "indexer",
            DbFamily::Evidence => "evidence",
        }
    }

    /// On-disk directory name; the indexer family keeps its historical
    /// `tx_index` name.
    pub fn dir_name(self) -> &'static str {
        match self {
            DbFamily::Blockstore => "blockstore.db",
            DbFamily::State => "state.db",
            DbFamily::Indexer => "tx_index.db",
            DbFamily::Evidence => "evidence.db",
        }
    }
}

/// A database handle bound to one scope hash. Cloning shares the
/// underlying rocksdb instance, which is thread-safe by contract.
#[derive(Clone)]
pub struct ScopedDb {
    scope_hash: String,
    db: Arc<DBWithThreadMode<MultiThreaded>>,
}

impl ScopedDb {
    pub fn open(scope_hash: impl Into<String>, path: &Path) -> MultiplexResult<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DBWithThreadMode::open(&opts, path)?;
        Ok(Self {
            scope_hash: scope_hash.into(),
            db: Arc::new(db),
        })
    }

    pub fn scope_hash(&self) -> &str {
        &self.scope_hash
    }

    pub fn get(&self, key: &[u8]) -> MultiplexResult<Option<Vec<u8>>> {
        Ok(self.db.get(key)?)
    }

    pub fn set(&self, key: &[u8], value: &[u8]) -> MultiplexResult<()> {
        self.db.put(key, value)?;
        Ok(())
    }

    /// Durable write: the WAL is fsynced before this returns.
    pub fn set_sync(&self, key: &[u8], value: &[u8]) -> MultiplexResult<()> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(true);
        self.db.put_opt(key, value, &write_opts)?;
        Ok(())
    }

    pub fn delete(&self, key: &[u8]) -> MultiplexResult<()> {
        self.db.delete(key)?;
        Ok(())
    }

    pub fn compact(&self) {
        self.db.compact_range(None::<&[u8]>, None::<&[u8]>);
    }
}

impl std::fmt::Debug for ScopedDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedDb")
            .field("scope_hash", &self.scope_hash)
            .finish()
    }
}

/// One database family across all scopes: scope hash → scoped handle.
/// In singular mode the multiplex holds exactly one entry under the
/// empty scope hash.
#[derive(Clone, Debug, Default)]
pub struct MultiplexDb {
    entries: HashMap<String, ScopedDb>,
}

impl MultiplexDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, db: ScopedDb) {
        self.entries.insert(db.scope_hash().to_string(), db);
    }

    pub fn get(&self, scope_hash: &str) -> MultiplexResult<&ScopedDb> {
        self.entries.get(scope_hash).ok_or_else(|| {
            MultiplexError::NotFound(format!("no database for scope hash {scope_hash:?}"))
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn scope_hashes(&self) -> Vec<String> {
        let mut hashes: Vec<String> = self.entries.keys().cloned().collect();
        hashes.sort();
        hashes
    }
}

/// All four family multiplexes, in construction order.
#[derive(Debug, Default)]
pub struct DbMultiplexes {
    pub blockstore: MultiplexDb,
    pub state: MultiplexDb,
    pub indexer: MultiplexDb,
    pub evidence: MultiplexDb,
}

impl DbMultiplexes {
    pub fn family(&self, family: DbFamily) -> &MultiplexDb {
        match family {
            DbFamily::Blockstore => &self.blockstore,
            DbFamily::State => &self.state,
            DbFamily::Indexer => &self.indexer,
            DbFamily::Evidence => &self.evidence,
        }
    }
}

/// Opens the databases for all four families.
///
/// Plural replication opens one physical database per `(family, scope)`
/// under the scope's data directory. Singular replication falls back to
/// the basic node layout: a single blockstore and state database keyed
/// under the empty scope hash, with the indexer and evidence multiplexes
/// left empty (the solitary node wires those elsewhere).
pub fn init_dbs(
    config: &NodeConfig,
    registry: &ScopeRegistry,
) -> MultiplexResult<DbMultiplexes> {
    if config.user.replication == Replication::Plural {
        return init_multiplex_dbs(config, registry);
    }

    let data_dir = config.root_dir.join(DEFAULT_DATA_DIR);
    std::fs::create_dir_all(&data_dir)?;

    let mut multiplexes = DbMultiplexes::default();
    multiplexes
        .blockstore
        .insert(ScopedDb::open("", &data_dir.join(DbFamily::Blockstore.dir_name()))?);
    multiplexes
        .state
        .insert(ScopedDb::open("", &data_dir.join(DbFamily::State.dir_name()))?);
    Ok(multiplexes)
}

fn init_multiplex_dbs(
    config: &NodeConfig,
    registry: &ScopeRegistry,
) -> MultiplexResult<DbMultiplexes> {
    let mut multiplexes = DbMultiplexes::default();
    for scope_hash in registry.hashes() {
        let scope_id = registry.scope_id(&scope_hash)?;
        let data_dir = scoped_data_dir(
            &config.root_dir,
            scope_id.address(),
            &scope_id.fingerprint(),
        );
        std::fs::create_dir_all(&data_dir)?;

        for family in DbFamily::ALL {
            let db = ScopedDb::open(scope_hash.clone(), &data_dir.join(family.dir_name()))?;
            match family {
                DbFamily::Blockstore => multiplexes.blockstore.insert(db),
                DbFamily::State => multiplexes.state.insert(db),
                DbFamily::Indexer => multiplexes.indexer.insert(db),
                DbFamily::Evidence => multiplexes.evidence.insert(db),
            }
        }
    }
    Ok(multiplexes)
}
