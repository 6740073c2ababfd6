use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::SplitterConfig;
use crate::error::{constants, ProtocolError, Result};
use crate::splitter::file_ops::{write_at, FileWritePolicy};
use crate::splitter::info::{SplitterAnnounce, SplitterComplete, SplitterDto, SplitterInfo};
use crate::splitter::paths::PathResolver;
use crate::transport::{LinkContext, Linker};
use crate::utils::concurrent::{ConcurrentOperate, ConcurrentOperation};

type WriteLease = ConcurrentOperation<FileWritePolicy>;

/// How a transfer ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    Completed { path: PathBuf, info: SplitterInfo },
    TimedOut { received: u32, expected: u32 },
    Failed(String),
}

/// Observer for one incoming transfer
#[derive(Debug, Clone)]
pub struct TransferHandle {
    linker_id: u64,
    file_name: String,
    path: PathBuf,
    info: SplitterInfo,
    outcome: watch::Receiver<Option<TransferOutcome>>,
}

impl TransferHandle {
    pub fn linker_id(&self) -> u64 {
        self.linker_id
    }

    /// Name as announced by the sender
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Where the file is being written
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn info(&self) -> SplitterInfo {
        self.info
    }

    /// Outcome, if the transfer has ended
    pub fn outcome(&self) -> Option<TransferOutcome> {
        self.outcome.borrow().clone()
    }

    /// Wait for the transfer to end
    pub async fn wait(mut self) -> TransferOutcome {
        match self.outcome.wait_for(Option::is_some).await {
            Ok(outcome) => outcome
                .clone()
                .unwrap_or_else(|| TransferOutcome::Failed("no outcome".to_string())),
            Err(_) => TransferOutcome::Failed("assembler dropped".to_string()),
        }
    }
}

/// Which chunk indices have been written, one bit each
#[derive(Debug)]
struct ChunkSet {
    words: Vec<u64>,
    len: u32,
}

impl ChunkSet {
    fn with_capacity(chunks: u32) -> Self {
        Self {
            words: vec![0; (chunks as usize).div_ceil(64)],
            len: 0,
        }
    }

    /// Mark `index`, returning whether it was new
    fn insert(&mut self, index: u32) -> bool {
        let (word, bit) = ((index / 64) as usize, index % 64);
        let Some(slot) = self.words.get_mut(word) else {
            return false;
        };
        let mask = 1u64 << bit;
        if *slot & mask != 0 {
            return false;
        }
        *slot |= mask;
        self.len += 1;
        true
    }

    fn len(&self) -> u32 {
        self.len
    }
}

struct Transfer {
    file_name: String,
    path: PathBuf,
    info: SplitterInfo,
    received: ChunkSet,
    /// Destination handle, opened on the first chunk
    lease: Option<WriteLease>,
    last_activity: Instant,
    finished: bool,
    outcome: watch::Sender<Option<TransferOutcome>>,
}

impl Transfer {
    /// Record the outcome and hand back the lease so it can be closed outside any lock
    fn finish(&mut self, outcome: TransferOutcome) -> Option<WriteLease> {
        self.finished = true;
        self.last_activity = Instant::now();
        self.outcome.send_replace(Some(outcome));
        self.lease.take()
    }
}

/// Fail the transfer on `e`, closing its destination after the lock is released
fn abandon(mut transfer: MutexGuard<'_, Transfer>, e: ProtocolError) -> ProtocolError {
    let lease = transfer.finish(TransferOutcome::Failed(e.to_string()));
    drop(transfer);
    if let Some(lease) = lease {
        lease.close();
    }
    e
}

type Shared = Arc<Mutex<Transfer>>;

struct Inner {
    resolver: Arc<dyn PathResolver>,
    writers: ConcurrentOperate<FileWritePolicy>,
    transfers: Mutex<HashMap<u64, Shared>>,
    announced: mpsc::UnboundedSender<TransferHandle>,
    announcements: AsyncMutex<mpsc::UnboundedReceiver<TransferHandle>>,
    receive_timeout: Duration,
    busy_wait: Duration,
    max_transfer_size: u64,
    max_chunk_count: u32,
    shutdown: CancellationToken,
}

fn poisoned() -> ProtocolError {
    ProtocolError::Custom(constants::ERR_LOCK_POISONED.to_string())
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex.lock().map_err(|_| poisoned())
}

/// Receives announced files chunk by chunk.
///
/// One transfer is tracked per link. Each destination is written through a
/// single shared lease, opened on the first chunk and closed once every index
/// has been seen or the transfer goes idle for `receive_timeout`. Chunks are
/// written at their declared offset, so duplicates and out-of-order delivery
/// leave the same file behind.
#[derive(Clone)]
pub struct FileAssembler {
    inner: Arc<Inner>,
}

impl FileAssembler {
    pub fn new(config: &SplitterConfig, resolver: impl PathResolver) -> Self {
        let (announced, announcements) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                resolver: Arc::new(resolver),
                writers: ConcurrentOperate::new(FileWritePolicy, 0),
                transfers: Mutex::new(HashMap::new()),
                announced,
                announcements: AsyncMutex::new(announcements),
                receive_timeout: config.receive_timeout,
                busy_wait: config.busy_wait_timeout,
                max_transfer_size: config.max_transfer_size,
                max_chunk_count: config.max_chunk_count,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Register the chunk handlers on `context` and start the idle sweeper.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn attach(&self, context: &LinkContext) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        context
            .dispatcher()
            .register::<SplitterAnnounce, _>(move |announce, linker| inner.on_announce(announce, linker))?;

        let inner = Arc::clone(&self.inner);
        context
            .dispatcher()
            .register::<SplitterDto, _>(move |chunk, linker| inner.on_chunk(chunk, linker))?;

        tokio::spawn(sweep_loop(Arc::clone(&self.inner)));
        Ok(())
    }

    /// Next announced transfer, in arrival order
    pub async fn next_transfer(&self) -> Option<TransferHandle> {
        self.inner.announcements.lock().await.recv().await
    }

    /// Transfer currently tracked for a link
    pub fn transfer_for(&self, linker_id: u64) -> Option<TransferHandle> {
        let shared = lock(&self.inner.transfers).ok()?.get(&linker_id).cloned()?;
        let transfer = shared.lock().ok()?;
        Some(handle_of(linker_id, &transfer))
    }

    /// Number of transfers still receiving chunks
    pub fn active_transfers(&self) -> usize {
        lock(&self.inner.transfers)
            .map(|transfers| {
                transfers
                    .values()
                    .filter(|t| t.lock().map(|t| !t.finished).unwrap_or(false))
                    .count()
            })
            .unwrap_or(0)
    }

    /// Fail unfinished transfers and stop the sweeper
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let transfers: Vec<Shared> = match lock(&self.inner.transfers) {
            Ok(mut transfers) => transfers.drain().map(|(_, t)| t).collect(),
            Err(_) => Vec::new(),
        };
        for shared in transfers {
            let lease = match shared.lock() {
                Ok(mut transfer) if !transfer.finished => {
                    transfer.finish(TransferOutcome::Failed("assembler shut down".to_string()))
                }
                _ => None,
            };
            if let Some(lease) = lease {
                lease.close();
            }
        }
        self.inner.writers.shutdown();
    }
}

impl std::fmt::Debug for FileAssembler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileAssembler")
            .field("active", &self.active_transfers())
            .finish()
    }
}

fn handle_of(linker_id: u64, transfer: &Transfer) -> TransferHandle {
    TransferHandle {
        linker_id,
        file_name: transfer.file_name.clone(),
        path: transfer.path.clone(),
        info: transfer.info,
        outcome: transfer.outcome.subscribe(),
    }
}

impl Inner {
    fn on_announce(&self, announce: SplitterAnnounce, linker: &Linker) -> Result<()> {
        announce.info.validate()?;
        if let Err(e) = announce
            .info
            .check_limits(self.max_transfer_size, self.max_chunk_count)
        {
            warn!(linker = linker.id(), file = %announce.file_name, error = %e, "Transfer refused");
            return Err(e);
        }
        let path = self.resolver.resolve(&announce.file_name)?;
        let (outcome, _) = watch::channel(None);
        let transfer = Transfer {
            file_name: announce.file_name,
            path,
            info: announce.info,
            received: ChunkSet::with_capacity(announce.info.chunk_count),
            lease: None,
            last_activity: Instant::now(),
            finished: false,
            outcome,
        };
        let handle = handle_of(linker.id(), &transfer);

        let previous = lock(&self.transfers)?.insert(linker.id(), Arc::new(Mutex::new(transfer)));
        if let Some(previous) = previous {
            let lease = previous.lock().ok().and_then(|mut t| {
                if t.finished {
                    None
                } else {
                    warn!(linker = linker.id(), file = %t.file_name, "Transfer superseded");
                    t.finish(TransferOutcome::Failed("superseded by a new transfer".to_string()))
                }
            });
            if let Some(lease) = lease {
                lease.close();
            }
        }

        info!(
            linker = linker.id(),
            file = %handle.file_name,
            path = %handle.path.display(),
            bytes = handle.info.total_length,
            chunks = handle.info.chunk_count,
            "Incoming transfer"
        );
        let _ = self.announced.send(handle);
        Ok(())
    }

    fn on_chunk(&self, chunk: SplitterDto, linker: &Linker) -> Result<()> {
        let shared = lock(&self.transfers)?
            .get(&linker.id())
            .cloned()
            .ok_or_else(|| {
                ProtocolError::InvalidChunk(format!("chunk {} without announce", chunk.chunk_index))
            })?;
        let mut transfer = lock(&shared)?;

        if transfer.finished {
            trace!(chunk_index = chunk.chunk_index, "Chunk after transfer ended, ignored");
            return Ok(());
        }
        chunk.validate(&transfer.info)?;

        let offset = transfer.info.offset(chunk.chunk_index);
        if let Err(e) = self.write_chunk(&mut transfer, offset, &chunk) {
            return Err(abandon(transfer, e));
        }
        linker.context().metrics().chunk_written();

        if !transfer.received.insert(chunk.chunk_index) {
            debug!(chunk_index = chunk.chunk_index, "Duplicate chunk rewritten");
        }
        transfer.last_activity = Instant::now();
        trace!(
            chunk_index = chunk.chunk_index,
            bytes = chunk.bytes.len(),
            received = transfer.received.len(),
            "Chunk written"
        );

        if transfer.received.len() < transfer.info.chunk_count {
            return Ok(());
        }

        // Completion is only reported once the data is on disk
        let synced = match transfer.lease.as_mut() {
            Some(lease) => lease.execute(|file| Ok(file.sync_data()?)),
            None => Ok(()),
        };
        if let Err(e) = synced {
            return Err(abandon(transfer, e));
        }

        let completed = TransferOutcome::Completed {
            path: transfer.path.clone(),
            info: transfer.info,
        };
        let lease = transfer.finish(completed);
        let reply = SplitterComplete {
            file_name: transfer.file_name.clone(),
            chunk_count: transfer.info.chunk_count,
        };
        info!(
            linker = linker.id(),
            file = %transfer.file_name,
            path = %transfer.path.display(),
            "Transfer complete"
        );
        drop(transfer);

        if let Some(lease) = lease {
            lease.close();
        }
        linker.context().metrics().transfer_completed();
        if let Err(e) = linker.send_blocking(&reply) {
            warn!(linker = linker.id(), error = %e, "Could not acknowledge transfer");
        }
        Ok(())
    }

    fn write_chunk(&self, transfer: &mut Transfer, offset: u64, chunk: &SplitterDto) -> Result<()> {
        if transfer.lease.is_none() {
            transfer.lease = Some(self.open_destination(transfer)?);
        }
        match transfer.lease.as_mut() {
            Some(lease) => lease.execute(|file| write_at(file, offset, &chunk.bytes)),
            None => Err(ProtocolError::Disposed(constants::ERR_OPERATE_DISPOSED)),
        }
    }

    /// Check out the destination, waiting for another transfer of the same path
    fn open_destination(&self, transfer: &Transfer) -> Result<WriteLease> {
        let length = transfer.info.total_length.max(0) as u64;
        match self.writers.try_acquire(transfer.path.clone(), &length) {
            Err(ProtocolError::ResourceBusy(_)) => {
                let runtime = tokio::runtime::Handle::try_current()
                    .map_err(|e| ProtocolError::Custom(e.to_string()))?;
                debug!(path = %transfer.path.display(), "Destination busy, waiting");
                runtime.block_on(self.writers.acquire(transfer.path.clone(), &length, self.busy_wait))
            }
            other => other,
        }
    }

    /// Time out idle transfers and forget ended ones
    fn sweep(&self) -> Result<()> {
        let now = Instant::now();
        let mut expired = Vec::new();
        {
            let mut transfers = lock(&self.transfers)?;
            transfers.retain(|linker_id, shared| {
                let Ok(mut transfer) = shared.lock() else {
                    return false;
                };
                if now.duration_since(transfer.last_activity) < self.receive_timeout {
                    return true;
                }
                if !transfer.finished {
                    let outcome = TransferOutcome::TimedOut {
                        received: transfer.received.len(),
                        expected: transfer.info.chunk_count,
                    };
                    warn!(
                        linker = linker_id,
                        file = %transfer.file_name,
                        received = transfer.received.len(),
                        expected = transfer.info.chunk_count,
                        "Transfer timed out"
                    );
                    expired.extend(transfer.finish(outcome));
                }
                false
            });
        }
        for lease in expired {
            lease.close();
        }
        Ok(())
    }
}

async fn sweep_loop(inner: Arc<Inner>) {
    let period = (inner.receive_timeout / 4).max(Duration::from_millis(10));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }
        if let Err(e) = inner.sweep() {
            warn!(error = %e, "Sweep failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_set_counts_each_index_once() {
        let mut set = ChunkSet::with_capacity(130);
        assert_eq!(set.words.len(), 3);
        assert!(set.insert(0));
        assert!(set.insert(129));
        assert!(!set.insert(129));
        assert!(!set.insert(130 + 64));
        assert_eq!(set.len(), 2);
    }
}
