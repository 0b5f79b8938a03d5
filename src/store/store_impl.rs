use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use rocksdb::{Direction, IteratorMode, Options, WriteBatch, DB};

/// Process-wide durable store. All protocol-step mutations go through a
/// [`DbTransaction`]; reads outside a transaction see only committed state.
#[derive(Clone, Debug)]
pub struct Store {
    pub(crate) db: Arc<DB>,
    /// Serializes transactions process-wide; the database handle is shared.
    txn_lock: Arc<Mutex<()>>,
    /// Hard invariant: must be false before begin, true at every
    /// transactional write site, false again after commit/abort.
    in_transaction: Arc<AtomicBool>,
}

impl Store {
    /// Open (or create) the store under `path`.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, String> {
        let mut options = Options::default();
        options.create_if_missing(true);
        let db = Arc::new(DB::open(&options, path).map_err(|e| e.to_string())?);
        Ok(Self {
            db,
            txn_lock: Arc::new(Mutex::new(())),
            in_transaction: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn get<K: AsRef<[u8]>>(&self, key: K) -> Option<Vec<u8>> {
        self.db.get(key.as_ref()).expect("get should be OK")
    }

    /// Returns all committed (key, value) pairs under `prefix`.
    pub fn prefix_iterator<'a>(
        &'a self,
        prefix: &'a [u8],
    ) -> impl Iterator<Item = (Box<[u8]>, Box<[u8]>)> + 'a {
        self.db
            .iterator(IteratorMode::From(prefix, Direction::Forward))
            .map(|kv| kv.expect("iterate should be OK"))
            .take_while(move |(key, _)| key.starts_with(prefix))
    }

    /// Start a protocol-step transaction. Blocks until any other
    /// transaction commits or aborts; panics on reentrant use from the
    /// same logical flow.
    pub fn begin_transaction(&self) -> DbTransaction<'_> {
        let guard = self.txn_lock.lock().expect("db transaction lock");
        assert!(
            !self.in_transaction.swap(true, Ordering::SeqCst),
            "reentrant db transaction"
        );
        DbTransaction {
            store: self,
            wb: WriteBatch::default(),
            overlay: HashMap::new(),
            _guard: guard,
        }
    }

}

/// One protocol step's worth of writes. Everything staged here becomes
/// durable in a single atomic batch on [`DbTransaction::commit`]; dropping
/// the transaction (or calling [`DbTransaction::abort`]) discards it all.
///
/// Reads through the transaction observe earlier writes of the same
/// transaction (the overlay), which the guarded state updates depend on.
pub struct DbTransaction<'a> {
    store: &'a Store,
    wb: WriteBatch,
    overlay: HashMap<Vec<u8>, Option<Vec<u8>>>,
    _guard: MutexGuard<'a, ()>,
}

impl DbTransaction<'_> {
    pub(crate) fn store(&self) -> &Store {
        self.store
    }

    pub(crate) fn assert_in_transaction(&self) {
        assert!(
            self.store.in_transaction.load(Ordering::SeqCst),
            "write outside transaction"
        );
    }

    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        match self.overlay.get(key) {
            Some(value) => value.clone(),
            None => self.store.get(key),
        }
    }

    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.assert_in_transaction();
        self.wb.put(&key, &value);
        self.overlay.insert(key, Some(value));
    }

    pub fn delete(&mut self, key: Vec<u8>) {
        self.assert_in_transaction();
        self.wb.delete(&key);
        self.overlay.insert(key, None);
    }

    /// Commit every staged write atomically.
    pub fn commit(mut self) -> Result<(), String> {
        let wb = std::mem::take(&mut self.wb);
        self.store.db.write(wb).map_err(|e| e.to_string())
        // Drop clears the in_transaction flag and releases the lock.
    }

    /// Discard every staged write.
    pub fn abort(self) {}
}

impl Drop for DbTransaction<'_> {
    fn drop(&mut self) {
        self.store.in_transaction.store(false, Ordering::SeqCst);
    }
}
