//! Durable storage for blocked addresses
//!
//! Only block state has to survive a restart; request ledgers are rebuilt
//! from live traffic. The state is small, so [`JsonFileBlockStore`] keeps the
//! whole map in memory and rewrites the file on every change, writing to a
//! sibling temporary file first and renaming it into place.
//!
//! Stores are only touched from a dedicated writer thread. The tracker hands
//! it [`BlockCommand`]s over a channel, so a slow disk never holds up
//! admission.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use tokio::sync::{mpsc, oneshot};

/// Persisted block of one address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRecord {
    pub reason: String,
    /// Unix seconds
    pub blocked_at: u64,
    /// Requests inside the window when the block triggered
    pub requests_in_window: u32,
    pub total_requests: u64,
    /// Unix seconds
    pub first_seen: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("block store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("block store is corrupt: {0}")]
    Json(#[from] serde_json::Error),
}

/// Small durable side-store for block state
pub trait BlockStore: Send + Sync + 'static {
    /// Every persisted block, keyed by address
    fn load(&self) -> Result<BTreeMap<String, BlockRecord>, PersistError>;

    fn insert(&self, address: &str, record: &BlockRecord) -> Result<(), PersistError>;

    fn remove(&self, address: &str) -> Result<(), PersistError>;
}

/// Block store that forgets everything on restart
#[derive(Default)]
pub struct MemoryBlockStore {
    records: Mutex<BTreeMap<String, BlockRecord>>,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlockStore for MemoryBlockStore {
    fn load(&self) -> Result<BTreeMap<String, BlockRecord>, PersistError> {
        Ok(self.records.lock().clone())
    }

    fn insert(&self, address: &str, record: &BlockRecord) -> Result<(), PersistError> {
        self.records
            .lock()
            .insert(address.to_string(), record.clone());
        Ok(())
    }

    fn remove(&self, address: &str) -> Result<(), PersistError> {
        self.records.lock().remove(address);
        Ok(())
    }
}

/// Block store backed by a JSON file
///
/// # Example
///
/// ```no_run
/// use turnstile::abuse::JsonFileBlockStore;
///
/// let store = JsonFileBlockStore::open("blocked_addresses.json")?;
/// # Ok::<(), turnstile::abuse::PersistError>(())
/// ```
pub struct JsonFileBlockStore {
    path: PathBuf,
    records: Mutex<BTreeMap<String, BlockRecord>>,
}

impl JsonFileBlockStore {
    /// Open the store, reading existing records if the file exists
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PersistError> {
        let path = path.as_ref().to_path_buf();
        let records = match fs::read(&path) {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => BTreeMap::new(),
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(JsonFileBlockStore {
            path,
            records: Mutex::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write(&self, records: &BTreeMap<String, BlockRecord>) -> Result<(), PersistError> {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        let mut file = fs::File::create(&tmp)?;
        serde_json::to_writer_pretty(&mut file, records)?;
        file.write_all(b"\n")?;
        file.sync_all()?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl BlockStore for JsonFileBlockStore {
    fn load(&self) -> Result<BTreeMap<String, BlockRecord>, PersistError> {
        Ok(self.records.lock().clone())
    }

    fn insert(&self, address: &str, record: &BlockRecord) -> Result<(), PersistError> {
        let mut records = self.records.lock();
        records.insert(address.to_string(), record.clone());
        self.write(&records)
    }

    fn remove(&self, address: &str) -> Result<(), PersistError> {
        let mut records = self.records.lock();
        if records.remove(address).is_some() {
            self.write(&records)?;
        }
        Ok(())
    }
}

/// Change queued for the block store
#[derive(Debug)]
pub(crate) enum BlockCommand {
    Insert(String, BlockRecord),
    Remove(String),
    /// Acknowledged once every earlier command has been applied
    Flush(oneshot::Sender<()>),
}

/// Handle to the thread that applies block changes in order
///
/// Dropping the writer closes the queue and waits for pending writes.
pub(crate) struct BlockWriter {
    tx: Option<mpsc::UnboundedSender<BlockCommand>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl BlockWriter {
    pub(crate) fn spawn(store: Arc<dyn BlockStore>) -> Result<BlockWriter, PersistError> {
        let (tx, rx) = mpsc::unbounded_channel();

        let handle = thread::Builder::new()
            .name("turnstile-blocks".to_string())
            .spawn(move || run_writer(rx, store))?;

        Ok(BlockWriter {
            tx: Some(tx),
            handle: Some(handle),
        })
    }

    /// Queue a change without waiting for it to reach the store
    pub(crate) fn send(&self, command: BlockCommand) {
        let Some(tx) = &self.tx else {
            return;
        };
        if tx.send(command).is_err() {
            tracing::warn!("Block writer stopped, block change not persisted");
        }
    }

    /// Wait until everything queued so far has been applied
    pub(crate) async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        self.send(BlockCommand::Flush(ack));
        let _ = done.await;
    }
}

impl Drop for BlockWriter {
    fn drop(&mut self) {
        drop(self.tx.take());
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            tracing::error!("Block writer thread panicked");
        }
    }
}

fn run_writer(mut rx: mpsc::UnboundedReceiver<BlockCommand>, store: Arc<dyn BlockStore>) {
    while let Some(command) = rx.blocking_recv() {
        match command {
            BlockCommand::Insert(address, record) => {
                if let Err(e) = store.insert(&address, &record) {
                    tracing::warn!(address = %address, "Failed to persist address block: {}", e);
                }
            }
            BlockCommand::Remove(address) => {
                if let Err(e) = store.remove(&address) {
                    tracing::warn!(
                        address = %address,
                        "Failed to remove persisted address block: {}",
                        e
                    );
                }
            }
            BlockCommand::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }

    tracing::debug!("Block writer shutting down");
}
