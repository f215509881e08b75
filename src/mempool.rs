use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use sha2::{Digest, Sha256};
use tokio::sync::watch;

use crate::config::{MempoolConfig, MEMPOOL_KIND_FLOOD, MEMPOOL_KIND_NOP};
use crate::errors::{MultiplexError, MultiplexResult};

pub type Tx = Vec<u8>;
pub type TxKey = [u8; 32];

pub fn tx_key(tx: &[u8]) -> TxKey {
    let mut hasher = Sha256::new();
    hasher.update(tx);
    hasher.finalize().into()
}

pub type TxRemovedCallback = Box<dyn Fn(TxKey) + Send + Sync>;

/// The capability set a chain requires from its mempool.
///
/// `lock`/`unlock` bracket the consensus critical section during which
/// the reaped transaction set must not change underneath the proposer.
pub trait Mempool: Send + Sync {
    fn check_tx(&self, tx: Tx) -> MultiplexResult<()>;
    fn reap_max_bytes_max_gas(&self, max_bytes: u64, max_gas: u64) -> Vec<Tx>;
    fn reap_max_txs(&self, max: usize) -> Vec<Tx>;
    fn update(&self, height: u64, committed: &[Tx]) -> MultiplexResult<()>;
    fn flush(&self);
    fn flush_app_conn(&self) -> MultiplexResult<()>;
    fn size(&self) -> usize;
    fn size_bytes(&self) -> u64;
    fn lock(&self);
    fn unlock(&self);
    fn txs_available(&self) -> watch::Receiver<bool>;
    fn enable_txs_available(&self);
    fn remove_tx_by_key(&self, key: TxKey) -> bool;
    fn set_tx_removed_callback(&self, callback: TxRemovedCallback);
    fn get_tx_by_hash(&self, hash: &[u8]) -> Option<Tx>;
}

/// Builds the mempool selected by the configuration: `flood` (also the
/// empty string, for backward compatibility) or `nop`.
pub fn build_mempool(config: &MempoolConfig) -> MultiplexResult<Arc<dyn Mempool>> {
    match config.kind.as_str() {
        MEMPOOL_KIND_FLOOD | "" => Ok(Arc::new(FloodMempool::new(config.clone()))),
        MEMPOOL_KIND_NOP => Ok(Arc::new(NopMempool)),
        other => Err(MultiplexError::Config(format!(
            "unknown mempool kind: {other:?}"
        ))),
    }
}

struct FloodInner {
    txs: VecDeque<(TxKey, Tx)>,
    by_key: HashMap<TxKey, usize>,
    total_bytes: u64,
}

impl FloodInner {
    fn reindex(&mut self) {
        self.by_key.clear();
        for (index, (key, _)) in self.txs.iter().enumerate() {
            self.by_key.insert(*key, index);
        }
    }
}

/// FIFO gossip mempool: transactions are kept in arrival order and
/// removed when committed.
pub struct FloodMempool {
    config: MempoolConfig,
    inner: Mutex<FloodInner>,
    consensus_gate: Mutex<bool>,
    gate_released: Condvar,
    notify_enabled: Mutex<bool>,
    available_tx: watch::Sender<bool>,
    available_rx: watch::Receiver<bool>,
    removed_callback: Mutex<Option<TxRemovedCallback>>,
}

impl FloodMempool {
    pub fn new(config: MempoolConfig) -> Self {
        let (available_tx, available_rx) = watch::channel(false);
        Self {
            config,
            inner: Mutex::new(FloodInner {
                txs: VecDeque::new(),
                by_key: HashMap::new(),
                total_bytes: 0,
            }),
            consensus_gate: Mutex::new(false),
            gate_released: Condvar::new(),
            notify_enabled: Mutex::new(false),
            available_tx,
            available_rx,
            removed_callback: Mutex::new(None),
        }
    }

    fn notify_available(&self) {
        if *self.notify_enabled.lock() {
            let _ = self.available_tx.send(true);
        }
    }

    fn fire_removed(&self, key: TxKey) {
        if let Some(callback) = self.removed_callback.lock().as_ref() {
            callback(key);
        }
    }
}

impl Mempool for FloodMempool {
    fn check_tx(&self, tx: Tx) -> MultiplexResult<()> {
        if tx.len() > self.config.max_tx_bytes {
            return Err(MultiplexError::Config(format!(
                "tx too large: {} bytes (max: {})",
                tx.len(),
                self.config.max_tx_bytes
            )));
        }
        let key = tx_key(&tx);
        let mut inner = self.inner.lock();
        if inner.by_key.contains_key(&key) {
            return Err(MultiplexError::Config(
                "tx already in mempool".to_string(),
            ));
        }
        if inner.txs.len() >= self.config.size
            || inner.total_bytes + tx.len() as u64 > self.config.max_txs_bytes
        {
            return Err(MultiplexError::Config("mempool is full".to_string()));
        }
        inner.total_bytes += tx.len() as u64;
        inner.txs.push_back((key, tx));
        let index = inner.txs.len() - 1;
        inner.by_key.insert(key, index);
        drop(inner);
        self.notify_available();
        Ok(())
    }

    fn reap_max_bytes_max_gas(&self, max_bytes: u64, max_gas: u64) -> Vec<Tx> {
        let inner = self.inner.lock();
        let mut reaped = Vec::new();
        let mut bytes: u64 = 0;
        // Each tx accounts for one unit of gas.
        let mut gas: u64 = 0;
        for (_, tx) in &inner.txs {
            if bytes + tx.len() as u64 > max_bytes || gas + 1 > max_gas {
                break;
            }
            bytes += tx.len() as u64;
            gas += 1;
            reaped.push(tx.clone());
        }
        reaped
    }

    fn reap_max_txs(&self, max: usize) -> Vec<Tx> {
        let inner = self.inner.lock();
        inner.txs.iter().take(max).map(|(_, tx)| tx.clone()).collect()
    }

    fn update(&self, _height: u64, committed: &[Tx]) -> MultiplexResult<()> {
        let mut inner = self.inner.lock();
        let mut removed = Vec::new();
        for tx in committed {
            let key = tx_key(tx);
            if inner.by_key.remove(&key).is_some() {
                inner.txs.retain(|(existing, _)| *existing != key);
                removed.push(key);
            }
        }
        inner.total_bytes = inner.txs.iter().map(|(_, tx)| tx.len() as u64).sum();
        inner.reindex();
        let empty = inner.txs.is_empty();
        drop(inner);
        for key in removed {
            self.fire_removed(key);
        }
        if empty {
            let _ = self.available_tx.send(false);
        }
        Ok(())
    }

    fn flush(&self) {
        let mut inner = self.inner.lock();
        inner.txs.clear();
        inner.by_key.clear();
        inner.total_bytes = 0;
        drop(inner);
        let _ = self.available_tx.send(false);
    }

    fn flush_app_conn(&self) -> MultiplexResult<()> {
        Ok(())
    }

    fn size(&self) -> usize {
        self.inner.lock().txs.len()
    }

    fn size_bytes(&self) -> u64 {
        self.inner.lock().total_bytes
    }

    fn lock(&self) {
        let mut held = self.consensus_gate.lock();
        while *held {
            self.gate_released.wait(&mut held);
        }
        *held = true;
    }

    fn unlock(&self) {
        let mut held = self.consensus_gate.lock();
        *held = false;
        self.gate_released.notify_one();
    }

    fn txs_available(&self) -> watch::Receiver<bool> {
        self.available_rx.clone()
    }

    fn enable_txs_available(&self) {
        *self.notify_enabled.lock() = true;
    }

    fn remove_tx_by_key(&self, key: TxKey) -> bool {
        let mut inner = self.inner.lock();
        if inner.by_key.remove(&key).is_none() {
            return false;
        }
        inner.txs.retain(|(existing, _)| *existing != key);
        inner.total_bytes = inner.txs.iter().map(|(_, tx)| tx.len() as u64).sum();
        inner.reindex();
        drop(inner);
        self.fire_removed(key);
        true
    }

    fn set_tx_removed_callback(&self, callback: TxRemovedCallback) {
        *self.removed_callback.lock() = Some(callback);
    }

    fn get_tx_by_hash(&self, hash: &[u8]) -> Option<Tx> {
        let key: TxKey = hash.try_into().ok()?;
        let inner = self.inner.lock();
        let index = *inner.by_key.get(&key)?;
        inner.txs.get(index).map(|(_, tx)| tx.clone())
    }
}

/// Mempool that accepts nothing; used by chains that receive their
/// transactions through an external pipeline.
pub struct NopMempool;

impl Mempool for NopMempool {
    fn check_tx(&self, _tx: Tx) -> MultiplexResult<()> {
        Err(MultiplexError::Config(
            "tx rejected: the nop mempool does not accept transactions".to_string(),
        ))
    }

    fn reap_max_bytes_max_gas(&self, _max_bytes: u64, _max_gas: u64) -> Vec<Tx> {
        Vec::new()
    }

    fn reap_max_txs(&self, _max: usize) -> Vec<Tx> {
        Vec::new()
    }

    fn update(&self, _height: u64, _committed: &[Tx]) -> MultiplexResult<()> {
        Ok(())
    }

    fn flush(&self) {}

    fn flush_app_conn(&self) -> MultiplexResult<()> {
        Ok(())
    }

    fn size(&self) -> usize {
        0
    }

    fn size_bytes(&self) -> u64 {
        0
    }

    fn lock(&self) {}

    fn unlock(&self) {}

    fn txs_available(&self) -> watch::Receiver<bool> {
        let (_tx, rx) = watch::channel(false);
        rx
    }

    fn enable_txs_available(&self) {}

    fn remove_tx_by_key(&self, _key: TxKey) -> bool {
        false
    }

    fn set_tx_removed_callback(&self, _callback: TxRemovedCallback) {}

    fn get_tx_by_hash(&self, _hash: &[u8]) -> Option<Tx> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flood() -> FloodMempool {
        FloodMempool::new(MempoolConfig::default())
    }

    #[test]
    fn check_tx_dedupes_and_bounds() {
        let mempool = flood();
        mempool.check_tx(b"tx-1".to_vec()).unwrap();
        assert!(mempool.check_tx(b"tx-1".to_vec()).is_err());
        assert_eq!(mempool.size(), 1);
        assert_eq!(mempool.size_bytes(), 4);

        let small = FloodMempool::new(MempoolConfig {
            size: 1,
            ..MempoolConfig::default()
        });
        small.check_tx(b"tx-1".to_vec()).unwrap();
        assert!(small.check_tx(b"tx-2".to_vec()).is_err());
    }

    #[test]
    fn reap_preserves_arrival_order() {
        let mempool = flood();
        mempool.check_tx(b"first".to_vec()).unwrap();
        mempool.check_tx(b"second".to_vec()).unwrap();
        mempool.check_tx(b"third".to_vec()).unwrap();

        assert_eq!(
            mempool.reap_max_txs(2),
            vec![b"first".to_vec(), b"second".to_vec()]
        );
        // 11 bytes fits "first" (5) and "second" (6) but not "third".
        assert_eq!(mempool.reap_max_bytes_max_gas(11, 100).len(), 2);
        assert_eq!(mempool.reap_max_bytes_max_gas(1024, 1).len(), 1);
    }

    #[test]
    fn update_removes_committed_txs_and_fires_callback() {
        let mempool = flood();
        let seen: Arc<Mutex<Vec<TxKey>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        mempool.set_tx_removed_callback(Box::new(move |key| sink.lock().push(key)));

        mempool.check_tx(b"keep".to_vec()).unwrap();
        mempool.check_tx(b"commit".to_vec()).unwrap();
        mempool.update(5, &[b"commit".to_vec()]).unwrap();

        assert_eq!(mempool.size(), 1);
        assert_eq!(seen.lock().as_slice(), &[tx_key(b"commit")]);
        assert_eq!(mempool.get_tx_by_hash(&tx_key(b"keep")), Some(b"keep".to_vec()));
        assert_eq!(mempool.get_tx_by_hash(&tx_key(b"commit")), None);
    }

    #[test]
    fn txs_available_fires_only_when_enabled() {
        let mempool = flood();
        let rx = mempool.txs_available();
        mempool.check_tx(b"quiet".to_vec()).unwrap();
        assert!(!*rx.borrow());

        mempool.enable_txs_available();
        mempool.check_tx(b"loud".to_vec()).unwrap();
        assert!(*rx.borrow());
    }

    #[test]
    fn builder_selects_variant_by_kind() {
        let flood_cfg = MempoolConfig::default();
        assert_eq!(build_mempool(&flood_cfg).unwrap().size(), 0);

        let nop_cfg = MempoolConfig {
            kind: MEMPOOL_KIND_NOP.to_string(),
            ..MempoolConfig::default()
        };
        let nop = build_mempool(&nop_cfg).unwrap();
        assert!(nop.check_tx(b"tx".to_vec()).is_err());

        let unknown = MempoolConfig {
            kind: "priority".to_string(),
            ..MempoolConfig::default()
        };
        assert!(build_mempool(&unknown).is_err());
    }

    #[test]
    fn nop_mempool_is_inert() {
        let mempool = NopMempool;
        assert!(mempool.check_tx(b"tx".to_vec()).is_err());
        assert_eq!(mempool.size(), 0);
        assert_eq!(mempool.reap_max_txs(10), Vec::<Tx>::new());
        assert!(!mempool.remove_tx_by_key([0; 32]));
    }
}
