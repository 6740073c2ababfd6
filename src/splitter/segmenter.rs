use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::SplitterConfig;
use crate::error::{constants, ProtocolError, Result};
use crate::splitter::file_ops::{read_at, FileReadPolicy};
use crate::splitter::info::{Splitter, SplitterAnnounce, SplitterComplete, SplitterDto, SplitterInfo};
use crate::transport::{LinkContext, Linker};
use crate::utils::concurrent::{ConcurrentOperate, ConcurrentOperation};
use crate::utils::metrics::Timer;

type ReadLease = ConcurrentOperation<FileReadPolicy>;

/// Pending acknowledgements, by linker id and file name
type Waiters = HashMap<(u64, String), oneshot::Sender<u32>>;

struct Inner {
    readers: ConcurrentOperate<FileReadPolicy>,
    chunk_size: usize,
    busy_wait: Duration,
    receive_timeout: Duration,
    /// One transfer at a time per link, so chunks of different files never interleave
    lanes: Mutex<HashMap<u64, Arc<AsyncMutex<()>>>>,
    waiters: Mutex<Waiters>,
}

/// Sends files over a [`Linker`] as an announce followed by indexed chunks.
///
/// Each source file is opened once per transfer through a [`ConcurrentOperate`]
/// lease, so two transfers of the same file wait for each other instead of
/// opening a second handle.
#[derive(Clone)]
pub struct FileSegmenter {
    inner: Arc<Inner>,
}

impl FileSegmenter {
    pub fn new(config: &SplitterConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                readers: ConcurrentOperate::new(FileReadPolicy, 4),
                chunk_size: config.chunk_size,
                busy_wait: config.busy_wait_timeout,
                receive_timeout: config.receive_timeout,
                lanes: Mutex::new(HashMap::new()),
                waiters: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.inner.chunk_size
    }

    /// Listen for completion acknowledgements on `context`'s links.
    ///
    /// Needed by [`send_file_confirmed`](Self::send_file_confirmed). Only one
    /// segmenter can be attached to a context.
    pub fn attach(&self, context: &LinkContext) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        context
            .dispatcher()
            .register::<SplitterComplete, _>(move |complete, linker| {
                let waiter = inner
                    .waiters
                    .lock()
                    .map_err(|_| ProtocolError::Custom(constants::ERR_LOCK_POISONED.to_string()))?
                    .remove(&(linker.id(), complete.file_name.clone()));
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(complete.chunk_count);
                    }
                    None => debug!(file = %complete.file_name, "Unsolicited completion"),
                }
                Ok(())
            })
    }

    /// Send the file at `path`. Completes once every chunk is queued.
    pub async fn send_file(&self, linker: &Linker, path: impl AsRef<Path>) -> Result<SplitterInfo> {
        self.send_file_with_cancel(linker, path, &CancellationToken::new())
            .await
    }

    /// Send the file at `path` and wait for the receiver's acknowledgement
    pub async fn send_file_confirmed(
        &self,
        linker: &Linker,
        path: impl AsRef<Path>,
    ) -> Result<SplitterInfo> {
        let path = path.as_ref();
        let key = (linker.id(), file_name_of(path)?);
        let (tx, rx) = oneshot::channel();
        self.inner
            .waiters
            .lock()
            .map_err(|_| ProtocolError::Custom(constants::ERR_LOCK_POISONED.to_string()))?
            .insert(key.clone(), tx);

        let sent = self.send_file(linker, path).await;
        let outcome = match sent {
            Ok(info) => match tokio::time::timeout(self.inner.receive_timeout, rx).await {
                Ok(Ok(count)) if count == info.chunk_count => Ok(info),
                Ok(Ok(count)) => Err(ProtocolError::InvalidChunk(format!(
                    "receiver acknowledged {count} of {} chunks",
                    info.chunk_count
                ))),
                Ok(Err(_)) => Err(ProtocolError::ConnectionClosed),
                Err(_) => Err(ProtocolError::Timeout),
            },
            Err(e) => Err(e),
        };
        if outcome.is_err() {
            if let Ok(mut waiters) = self.inner.waiters.lock() {
                waiters.remove(&key);
            }
        }
        outcome
    }

    /// Send the file at `path`, abandoning the transfer when `cancel` fires.
    #[instrument(skip(self, linker, path, cancel), fields(linker = linker.id(), path = %path.as_ref().display()))]
    pub async fn send_file_with_cancel(
        &self,
        linker: &Linker,
        path: impl AsRef<Path>,
        cancel: &CancellationToken,
    ) -> Result<SplitterInfo> {
        let path = path.as_ref().to_path_buf();
        let file_name = file_name_of(&path)?;
        let lane = self.lane(linker.id())?;
        let _lane = lane.lock().await;
        let _timer = Timer::start("send_file");

        let lease = self
            .inner
            .readers
            .acquire(path.clone(), &(), self.inner.busy_wait)
            .await?;
        let (mut lease, total) = blocking(lease, |file| Ok(file.metadata()?.len())).await?;

        let info = SplitterInfo::new(total, self.inner.chunk_size)?;
        linker
            .send_with_cancel(&SplitterAnnounce { file_name: file_name.clone(), info }, cancel)
            .await?;

        if info.is_single_chunk() {
            let (returned, bytes) = blocking(lease, move |file| read_at(file, 0, total as usize)).await?;
            lease = returned;
            linker
                .send_with_cancel(&SplitterDto::new(0, Bytes::from(bytes))?, cancel)
                .await?;
        } else {
            for index in 0..info.chunk_count {
                let range = info.chunk_range(index)?;
                let len = (range.end - range.start) as usize;
                let (returned, bytes) =
                    blocking(lease, move |file| read_at(file, range.start, len)).await?;
                lease = returned;
                linker
                    .send_with_cancel(&SplitterDto::new(index, Bytes::from(bytes))?, cancel)
                    .await?;
                debug!(chunk_index = index, bytes = len, "Chunk queued");
            }
        }
        lease.release();

        info!(
            file = %file_name,
            bytes = total,
            chunks = info.chunk_count,
            "File sent"
        );
        Ok(info)
    }

    /// Send an in-memory payload under `file_name`
    #[instrument(skip(self, linker, payload), fields(linker = linker.id(), bytes = payload.len()))]
    pub async fn send_bytes(&self, linker: &Linker, file_name: &str, payload: Bytes) -> Result<SplitterInfo> {
        let lane = self.lane(linker.id())?;
        let _lane = lane.lock().await;

        let (info, chunks) = Splitter::split_bytes(&payload, self.inner.chunk_size)?;
        linker
            .send(&SplitterAnnounce {
                file_name: file_name.to_string(),
                info,
            })
            .await?;
        for chunk in &chunks {
            linker.send(chunk).await?;
        }
        Ok(info)
    }

    fn lane(&self, linker_id: u64) -> Result<Arc<AsyncMutex<()>>> {
        let mut lanes = self
            .inner
            .lanes
            .lock()
            .map_err(|_| ProtocolError::Custom(constants::ERR_LOCK_POISONED.to_string()))?;
        // Drop lanes nobody else holds
        lanes.retain(|id, lane| *id == linker_id || Arc::strong_count(lane) > 1);
        Ok(Arc::clone(lanes.entry(linker_id).or_default()))
    }
}

impl std::fmt::Debug for FileSegmenter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSegmenter")
            .field("chunk_size", &self.inner.chunk_size)
            .finish()
    }
}

fn file_name_of(path: &Path) -> Result<String> {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| ProtocolError::InvalidData(format!("{} has no file name", path.display())))
}

/// Run blocking file work on the lease, handing the lease back
async fn blocking<R, F>(mut lease: ReadLease, work: F) -> Result<(ReadLease, R)>
where
    R: Send + 'static,
    F: FnOnce(&mut std::fs::File) -> Result<R> + Send + 'static,
{
    let joined = tokio::task::spawn_blocking(move || {
        let result = lease.execute(work);
        (lease, result)
    })
    .await;
    match joined {
        Ok((lease, Ok(value))) => Ok((lease, value)),
        Ok((lease, Err(e))) => {
            warn!(path = %lease.key().display(), error = %e, "Read failed");
            Err(e)
        }
        Err(e) => Err(ProtocolError::Custom(format!("reader task failed: {e}"))),
    }
}
