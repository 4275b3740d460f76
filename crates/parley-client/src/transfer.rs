//! Chunked file transfer over the relay.
//!
//! The producer announces a file with a `FILE_TRANSFER` manifest and then
//! streams [`TransferChunk`]s tagged with the manifest's transfer ID. The
//! consumer writes chunks in arrival order into a pre-sized file and gives
//! up after [`TRANSFER_IDLE_POLLS`] consecutive empty one-second polls,
//! deleting whatever it had written.
//!
//! An executor runs at most one transfer at a time; a second start fails
//! with [`TransferError::ConcurrentTransfer`] instead of queueing.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use parley_shared::commands::file_transfer;
use parley_shared::constants::{MAX_CHUNK_SIZE, TRANSFER_IDLE_POLLS, TRANSFER_POLL_SECS};
use parley_shared::{Entity, EntityHeader, TransferChunk, TransferId, TransferManifest};

use crate::error::TransferError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransferProgress {
    pub bytes_done: u64,
    pub total_bytes: u64,
    pub elapsed: Duration,
    /// Bytes per second over the whole transfer so far.
    pub throughput: f64,
}

impl TransferProgress {
    fn new(bytes_done: u64, total_bytes: u64, started: Instant) -> Self {
        let elapsed = started.elapsed();
        let secs = elapsed.as_secs_f64();
        let throughput = if secs > 0.0 {
            bytes_done as f64 / secs
        } else {
            0.0
        };
        Self {
            bytes_done,
            total_bytes,
            elapsed,
            throughput,
        }
    }
}

/// Receives transfer progress. Stands in for whatever shows progress bars
/// and finished files to the user.
pub trait TransferObserver: Send + Sync {
    fn progress(&self, _manifest: &TransferManifest, _progress: &TransferProgress) {}

    fn completed(&self, _manifest: &TransferManifest, _path: &Path) {}
}

pub struct NoopObserver;

impl TransferObserver for NoopObserver {}

#[derive(Debug, Clone)]
pub struct TransferExecutor {
    busy: Arc<AtomicBool>,
    max_transfer_bytes: u64,
}

impl TransferExecutor {
    pub fn new(max_transfer_bytes: u64) -> Self {
        Self {
            busy: Arc::new(AtomicBool::new(false)),
            max_transfer_bytes,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Claim the executor. The claim is released when the returned slot
    /// (or the transfer consuming it) is dropped.
    pub fn begin(&self) -> Result<TransferSlot, TransferError> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| TransferError::ConcurrentTransfer)?;
        Ok(TransferSlot {
            busy: self.busy.clone(),
            max_transfer_bytes: self.max_transfer_bytes,
        })
    }

    pub async fn send_file(
        &self,
        path: &Path,
        chunk_size: usize,
        sender: &EntityHeader,
        outbound: &mpsc::Sender<Entity>,
        observer: &dyn TransferObserver,
    ) -> Result<TransferManifest, TransferError> {
        self.begin()?
            .send_file(path, chunk_size, sender, outbound, observer)
            .await
    }

    pub async fn receive(
        &self,
        manifest: &TransferManifest,
        chunks: &mut mpsc::UnboundedReceiver<TransferChunk>,
        dest_dir: &Path,
        observer: &dyn TransferObserver,
    ) -> Result<PathBuf, TransferError> {
        self.begin()?
            .receive(manifest, chunks, dest_dir, observer)
            .await
    }
}

/// Exclusive right to run one transfer on an executor.
#[derive(Debug)]
pub struct TransferSlot {
    busy: Arc<AtomicBool>,
    max_transfer_bytes: u64,
}

impl Drop for TransferSlot {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}

impl TransferSlot {
    /// Producer side: announce `path`, then stream it in `chunk_size` slices.
    pub async fn send_file(
        self,
        path: &Path,
        chunk_size: usize,
        sender: &EntityHeader,
        outbound: &mpsc::Sender<Entity>,
        observer: &dyn TransferObserver,
    ) -> Result<TransferManifest, TransferError> {
        let chunk_size = chunk_size.clamp(1, MAX_CHUNK_SIZE);
        let file = File::open(path).await?;
        let total_bytes = file.metadata().await?.len();
        if total_bytes > self.max_transfer_bytes {
            return Err(TransferError::TransferTooLarge {
                size: total_bytes,
                max: self.max_transfer_bytes,
            });
        }

        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unnamed".to_string());
        let manifest = TransferManifest {
            transfer_id: TransferId::generate(),
            total_bytes,
            chunk_size_hint: chunk_size as u32,
            filename,
        };

        let header = || EntityHeader::new(sender.sender_name.clone(), sender.sender_id);
        outbound
            .send(file_transfer(header(), manifest.clone()).into())
            .await
            .map_err(|_| TransferError::Interrupted)?;
        info!(
            transfer = %manifest.transfer_id,
            file = %manifest.filename,
            size = total_bytes,
            "Sending file"
        );

        // Never send past the size announced in the manifest.
        let mut reader = file.take(total_bytes);
        let started = Instant::now();
        let mut bytes_done = 0u64;
        loop {
            let mut buf = vec![0u8; chunk_size];
            let n = read_full(&mut reader, &mut buf).await?;
            if n == 0 {
                break;
            }
            buf.truncate(n);

            let chunk = TransferChunk {
                header: header(),
                transfer_id: manifest.transfer_id,
                filename: manifest.filename.clone(),
                data: buf,
            };
            outbound
                .send(chunk.into())
                .await
                .map_err(|_| TransferError::Interrupted)?;

            bytes_done += n as u64;
            observer.progress(&manifest, &TransferProgress::new(bytes_done, total_bytes, started));
        }

        if bytes_done < total_bytes {
            warn!(
                transfer = %manifest.transfer_id,
                sent = bytes_done,
                announced = total_bytes,
                "File shrank while sending"
            );
            return Err(TransferError::Interrupted);
        }
        debug!(transfer = %manifest.transfer_id, "File sent");
        Ok(manifest)
    }

    /// Consumer side: reassemble the transfer announced by `manifest` from
    /// `chunks` into `dest_dir`.
    pub async fn receive(
        self,
        manifest: &TransferManifest,
        chunks: &mut mpsc::UnboundedReceiver<TransferChunk>,
        dest_dir: &Path,
        observer: &dyn TransferObserver,
    ) -> Result<PathBuf, TransferError> {
        if manifest.total_bytes > self.max_transfer_bytes {
            return Err(TransferError::TransferTooLarge {
                size: manifest.total_bytes,
                max: self.max_transfer_bytes,
            });
        }

        fs::create_dir_all(dest_dir).await?;
        let path = unique_path(dest_dir, manifest).await;
        let file = File::create(&path).await?;

        match reassemble(file, manifest, chunks, observer).await {
            Ok(()) => {
                info!(transfer = %manifest.transfer_id, path = %path.display(), "File received");
                observer.completed(manifest, &path);
                Ok(path)
            }
            Err(e) => {
                warn!(transfer = %manifest.transfer_id, error = %e, "Transfer failed, discarding partial file");
                if let Err(rm) = fs::remove_file(&path).await {
                    warn!(path = %path.display(), error = %rm, "Could not delete partial file");
                }
                Err(e)
            }
        }
    }
}

async fn reassemble(
    mut file: File,
    manifest: &TransferManifest,
    chunks: &mut mpsc::UnboundedReceiver<TransferChunk>,
    observer: &dyn TransferObserver,
) -> Result<(), TransferError> {
    let total = manifest.total_bytes;
    file.set_len(total).await?;

    let poll = Duration::from_secs(TRANSFER_POLL_SECS);
    let started = Instant::now();
    let mut written = 0u64;
    let mut idle_polls = 0u32;

    while written < total {
        let chunk = match timeout(poll, chunks.recv()).await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => return Err(TransferError::Interrupted),
            Err(_) => {
                idle_polls += 1;
                if idle_polls >= TRANSFER_IDLE_POLLS {
                    return Err(TransferError::TransferTimedOut {
                        idle_secs: u64::from(idle_polls) * TRANSFER_POLL_SECS,
                    });
                }
                continue;
            }
        };

        if chunk.transfer_id != manifest.transfer_id {
            debug!(transfer = %chunk.transfer_id, "Ignoring chunk of another transfer");
            continue;
        }
        let len = chunk.data.len() as u64;
        if written + len > total {
            return Err(TransferError::Overflow { expected: total });
        }

        file.write_all(&chunk.data).await?;
        written += len;
        idle_polls = 0;
        observer.progress(manifest, &TransferProgress::new(written, total, started));
    }

    file.flush().await?;
    file.sync_all().await?;
    Ok(())
}

/// Fill `buf` as far as the reader allows. Returns less than `buf.len()`
/// only at end of input.
async fn read_full<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Keep only the final path component and drop anything that could
/// escape the download directory.
pub fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or("");
    let cleaned: String = base
        .chars()
        .filter(|c| !c.is_control() && !matches!(c, ':' | '*' | '?' | '"' | '<' | '>' | '|'))
        .collect();
    let cleaned = cleaned.trim().trim_start_matches('.');
    if cleaned.is_empty() {
        "unnamed".to_string()
    } else {
        cleaned.to_string()
    }
}

async fn unique_path(dir: &Path, manifest: &TransferManifest) -> PathBuf {
    let name = sanitize_filename(&manifest.filename);
    let candidate = dir.join(&name);
    if !fs::try_exists(&candidate).await.unwrap_or(false) {
        return candidate;
    }
    dir.join(format!("{}-{}", manifest.transfer_id, name))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use parley_shared::{CommandCode, UserId};
    use tempfile::TempDir;

    #[derive(Default)]
    struct Recorder {
        progress: Mutex<Vec<u64>>,
        completed: Mutex<Option<PathBuf>>,
    }

    impl TransferObserver for Recorder {
        fn progress(&self, _manifest: &TransferManifest, progress: &TransferProgress) {
            self.progress.lock().unwrap().push(progress.bytes_done);
        }

        fn completed(&self, _manifest: &TransferManifest, path: &Path) {
            *self.completed.lock().unwrap() = Some(path.to_path_buf());
        }
    }

    fn sender() -> EntityHeader {
        EntityHeader::new("alice", UserId([9u8; 32]))
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    /// Run the producer into a channel and split the result into the
    /// manifest and the chunks that followed it.
    async fn produce(dir: &TempDir, data: &[u8], chunk_size: usize) -> (TransferManifest, Vec<TransferChunk>) {
        let path = dir.path().join("source.bin");
        std::fs::write(&path, data).unwrap();

        let (tx, mut rx) = mpsc::channel(1024);
        let executor = TransferExecutor::new(u64::MAX);
        let sent = executor
            .send_file(&path, chunk_size, &sender(), &tx, &NoopObserver)
            .await
            .unwrap();
        drop(tx);

        let Some(Entity::Command(cmd)) = rx.recv().await else {
            panic!("manifest must come first");
        };
        assert_eq!(cmd.code, CommandCode::FileTransfer);
        let manifest = cmd.manifest(0).unwrap().clone();
        assert_eq!(manifest, sent);

        let mut chunks = Vec::new();
        while let Some(entity) = rx.recv().await {
            let Entity::TransferChunk(chunk) = entity else {
                panic!("only chunks after the manifest");
            };
            chunks.push(chunk);
        }
        (manifest, chunks)
    }

    #[tokio::test]
    async fn test_chunk_sizes() {
        let dir = TempDir::new().unwrap();
        let (manifest, chunks) = produce(&dir, &pattern(10_000), 4096).await;

        assert_eq!(manifest.total_bytes, 10_000);
        assert_eq!(manifest.filename, "source.bin");
        let sizes: Vec<usize> = chunks.iter().map(|c| c.data.len()).collect();
        assert_eq!(sizes, vec![4096, 4096, 1808]);
        assert!(chunks.iter().all(|c| c.transfer_id == manifest.transfer_id));
    }

    #[tokio::test]
    async fn test_roundtrip_various_sizes() {
        for (len, chunk_size) in [(0, 1), (1, 1), (4096, 4096), (4097, 4096), (9_999, 1000), (3, 7)] {
            let src = TempDir::new().unwrap();
            let data = pattern(len);
            let (manifest, chunks) = produce(&src, &data, chunk_size).await;
            assert_eq!(chunks.len(), len.div_ceil(chunk_size));

            let (tx, mut rx) = mpsc::unbounded_channel();
            for chunk in chunks {
                tx.send(chunk).unwrap();
            }

            let dest = TempDir::new().unwrap();
            let observer = Recorder::default();
            let path = TransferExecutor::new(u64::MAX)
                .receive(&manifest, &mut rx, dest.path(), &observer)
                .await
                .unwrap();

            assert_eq!(std::fs::read(&path).unwrap(), data, "len={len} chunk={chunk_size}");
            assert_eq!(observer.completed.lock().unwrap().as_deref(), Some(path.as_path()));
        }
    }

    #[tokio::test]
    async fn test_progress_reported_per_chunk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f.bin");
        std::fs::write(&path, pattern(10)).unwrap();

        let (tx, _rx) = mpsc::channel(16);
        let observer = Recorder::default();
        TransferExecutor::new(u64::MAX)
            .send_file(&path, 4, &sender(), &tx, &observer)
            .await
            .unwrap();
        assert_eq!(*observer.progress.lock().unwrap(), vec![4, 8, 10]);
    }

    #[tokio::test]
    async fn test_busy_executor_rejects_second_transfer() {
        let executor = TransferExecutor::new(u64::MAX);
        let first = executor.begin().unwrap();
        assert!(executor.is_busy());
        assert!(matches!(
            executor.begin(),
            Err(TransferError::ConcurrentTransfer)
        ));

        let dest = TempDir::new().unwrap();
        let manifest = TransferManifest {
            transfer_id: TransferId::generate(),
            total_bytes: 1,
            chunk_size_hint: 1,
            filename: "x".into(),
        };
        let (_tx, mut rx) = mpsc::unbounded_channel();
        let second = executor
            .receive(&manifest, &mut rx, dest.path(), &NoopObserver)
            .await;
        assert!(matches!(second, Err(TransferError::ConcurrentTransfer)));
        assert!(!dest.path().join("x").exists());

        drop(first);
        assert!(!executor.is_busy());
        assert!(executor.begin().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_transfer_times_out_and_leaves_no_file() {
        let dest = TempDir::new().unwrap();
        let manifest = TransferManifest {
            transfer_id: TransferId::generate(),
            total_bytes: 10,
            chunk_size_hint: 4,
            filename: "stalled.bin".into(),
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(TransferChunk {
            header: sender(),
            transfer_id: manifest.transfer_id,
            filename: manifest.filename.clone(),
            data: vec![1; 4],
        })
        .unwrap();

        let started = Instant::now();
        let result = TransferExecutor::new(u64::MAX)
            .receive(&manifest, &mut rx, dest.path(), &NoopObserver)
            .await;

        assert!(matches!(
            result,
            Err(TransferError::TransferTimedOut { idle_secs: 120 })
        ));
        assert!(started.elapsed() >= Duration::from_secs(120));
        assert!(!dest.path().join("stalled.bin").exists());
        drop(tx);
    }

    #[tokio::test]
    async fn test_closed_queue_interrupts() {
        let dest = TempDir::new().unwrap();
        let manifest = TransferManifest {
            transfer_id: TransferId::generate(),
            total_bytes: 10,
            chunk_size_hint: 10,
            filename: "cut.bin".into(),
        };
        let (tx, mut rx) = mpsc::unbounded_channel::<TransferChunk>();
        drop(tx);

        let result = TransferExecutor::new(u64::MAX)
            .receive(&manifest, &mut rx, dest.path(), &NoopObserver)
            .await;
        assert!(matches!(result, Err(TransferError::Interrupted)));
        assert!(!dest.path().join("cut.bin").exists());
    }

    #[tokio::test]
    async fn test_overflow_rejected() {
        let dest = TempDir::new().unwrap();
        let manifest = TransferManifest {
            transfer_id: TransferId::generate(),
            total_bytes: 2,
            chunk_size_hint: 2,
            filename: "small.bin".into(),
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(TransferChunk {
            header: sender(),
            transfer_id: manifest.transfer_id,
            filename: manifest.filename.clone(),
            data: vec![0; 3],
        })
        .unwrap();

        let result = TransferExecutor::new(u64::MAX)
            .receive(&manifest, &mut rx, dest.path(), &NoopObserver)
            .await;
        assert!(matches!(result, Err(TransferError::Overflow { expected: 2 })));
        assert!(!dest.path().join("small.bin").exists());
    }

    #[tokio::test]
    async fn test_too_large_rejected_before_sending() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("big.bin");
        std::fs::write(&path, pattern(100)).unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let result = TransferExecutor::new(50)
            .send_file(&path, 10, &sender(), &tx, &NoopObserver)
            .await;
        assert!(matches!(
            result,
            Err(TransferError::TransferTooLarge { size: 100, max: 50 })
        ));
        drop(tx);
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("C:\\Users\\x\\report.pdf"), "report.pdf");
        assert_eq!(sanitize_filename(".hidden"), "hidden");
        assert_eq!(sanitize_filename(".."), "unnamed");
        assert_eq!(sanitize_filename("a<b>.txt"), "ab.txt");
    }
}
