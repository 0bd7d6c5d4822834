//! On-disk tile cache with a single background writer.
//!
//! Persists go through a bounded FIFO queue drained by one dedicated thread
//! that encodes and writes JPEG files. When the queue is full, enqueueing
//! waits for space, and fails if the cache is shut down meanwhile. Tiles are
//! written to a temporary sibling and renamed into place, so a lookup never
//! observes a partial file. There is no eviction; writing the same address
//! again overwrites it.
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::thread;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::projection::TileAddress;
use crate::render::RasterBuffer;

const TILE_EXTENSION: &str = "jpg";

/// Reference to a tile persisted on disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CachedTile {
    pub address: TileAddress,
    pub path: PathBuf,
}

impl CachedTile {
    /// File name relative to the cache directory, e.g. `12_2200_1343.jpg`.
    pub fn file_name(&self) -> String {
        format!("{}.{}", self.address.cache_key(), TILE_EXTENSION)
    }
}

enum Job {
    Persist {
        raster: RasterBuffer,
        tile: CachedTile,
    },
    Flush(oneshot::Sender<()>),
}

pub struct TileCache {
    directory: PathBuf,
    queue: Mutex<Option<mpsc::Sender<Job>>>,
    writer: Mutex<Option<thread::JoinHandle<()>>>,
}

impl TileCache {
    /// Creates the cache directory if needed and starts the writer thread.
    pub fn open<P: AsRef<Path>>(directory: P, capacity: usize, quality: u8) -> Result<TileCache> {
        let directory = directory.as_ref().to_path_buf();
        fs::create_dir_all(&directory)?;

        let (tx, rx) = mpsc::channel(capacity.max(1));
        let writer = thread::Builder::new()
            .name(String::from("tile-cache-writer"))
            .spawn(move || run_writer(rx, quality))?;

        Ok(TileCache::with_queue(directory, tx, Some(writer)))
    }

    fn with_queue(
        directory: PathBuf,
        queue: mpsc::Sender<Job>,
        writer: Option<thread::JoinHandle<()>>,
    ) -> TileCache {
        TileCache {
            directory,
            queue: Mutex::new(Some(queue)),
            writer: Mutex::new(writer),
        }
    }

    /// The reference a tile is (or would be) cached under.
    pub fn reference(&self, address: TileAddress) -> CachedTile {
        let path = self
            .directory
            .join(format!("{}.{}", address.cache_key(), TILE_EXTENSION));
        CachedTile { address, path }
    }

    pub async fn lookup(&self, address: TileAddress) -> Result<Option<CachedTile>> {
        let tile = self.reference(address);
        if tokio::fs::try_exists(&tile.path).await? {
            Ok(Some(tile))
        } else {
            Ok(None)
        }
    }

    /// Queues a raster for writing. Returns once the job is queued, not
    /// written; fails with `CacheClosed` after shutdown.
    pub async fn enqueue_persist(&self, raster: RasterBuffer, tile: CachedTile) -> Result<()> {
        self.send(Job::Persist { raster, tile }).await
    }

    /// Resolves once every job queued before it has been processed.
    pub async fn flush(&self) -> Result<()> {
        let (done, wait) = oneshot::channel();
        self.send(Job::Flush(done)).await?;
        wait.await.map_err(|_| Error::CacheClosed)
    }

    /// Stops accepting jobs, drains the queue and joins the writer.
    pub async fn shutdown(&self) -> Result<()> {
        drop(self.queue.lock().unwrap_or_else(PoisonError::into_inner).take());

        let writer = self
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(writer) = writer {
            tokio::task::spawn_blocking(move || writer.join())
                .await
                .map_err(|_| Error::WorkerJoin)?
                .map_err(|_| Error::WorkerJoin)?;
            debug!(directory = ?self.directory, "tile cache writer stopped");
        }

        Ok(())
    }

    async fn send(&self, job: Job) -> Result<()> {
        let queue = self
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(Error::CacheClosed)?;

        let permit = queue.reserve().await.map_err(|_| Error::CacheClosed)?;

        // A shutdown may have started while waiting for space. Checking and
        // sending under the lock orders this job strictly before or after it.
        let open = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        if open.is_none() {
            return Err(Error::CacheClosed);
        }
        permit.send(job);
        Ok(())
    }
}

fn run_writer(mut rx: mpsc::Receiver<Job>, quality: u8) {
    while let Some(job) = rx.blocking_recv() {
        match job {
            Job::Persist { raster, tile } => match write_tile(&raster, &tile.path, quality) {
                Ok(()) => debug!(tile = %tile.address, "cached tile"),
                Err(e) => {
                    let e = Error::CacheWriteFailure {
                        path: tile.path,
                        source: Box::new(e),
                    };
                    warn!("{}", e);
                }
            },
            Job::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

fn write_tile(raster: &RasterBuffer, path: &Path, quality: u8) -> Result<()> {
    let bytes = raster.encode_jpeg(quality)?;
    let partial = path.with_extension(format!("{}.partial", TILE_EXTENSION));
    fs::write(&partial, bytes)?;
    fs::rename(&partial, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn raster() -> RasterBuffer {
        RasterBuffer::new(4, 4, vec![200; 4 * 4 * 3]).unwrap()
    }

    #[tokio::test]
    async fn test_persist_then_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TileCache::open(dir.path(), 4, 80).unwrap();
        let address = TileAddress::new(3, 4, 2);

        assert_eq!(None, cache.lookup(address).await.unwrap());

        let tile = cache.reference(address);
        assert_eq!("3_4_2.jpg", tile.file_name());
        cache.enqueue_persist(raster(), tile.clone()).await.unwrap();
        cache.flush().await.unwrap();

        assert_eq!(Some(tile.clone()), cache.lookup(address).await.unwrap());
        let bytes = fs::read(&tile.path).unwrap();
        assert_eq!(&[0xFF, 0xD8], &bytes[..2]);
        assert!(!tile.path.with_extension("jpg.partial").exists());

        cache.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_jobs_drain_in_order_before_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TileCache::open(dir.path(), 1, 80).unwrap();

        for x in 0..8 {
            let tile = cache.reference(TileAddress::new(5, x, 1));
            cache.enqueue_persist(raster(), tile).await.unwrap();
        }
        cache.shutdown().await.unwrap();

        for x in 0..8 {
            assert!(cache.lookup(TileAddress::new(5, x, 1)).await.unwrap().is_some());
        }
    }

    #[tokio::test]
    async fn test_enqueue_after_shutdown_fails() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TileCache::open(dir.path(), 4, 80).unwrap();
        cache.shutdown().await.unwrap();

        let tile = cache.reference(TileAddress::new(1, 0, 0));
        assert!(matches!(
            cache.enqueue_persist(raster(), tile).await,
            Err(Error::CacheClosed)
        ));
        assert!(matches!(cache.flush().await, Err(Error::CacheClosed)));

        // A second shutdown is a no-op
        cache.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_waiting_for_space_is_refused_after_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::channel(1);
        let cache = Arc::new(TileCache::with_queue(dir.path().to_path_buf(), tx, None));

        let first = cache.reference(TileAddress::new(4, 1, 1));
        cache.enqueue_persist(raster(), first.clone()).await.unwrap();

        // The queue is full, so this persist waits for space
        let waiting = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                let tile = cache.reference(TileAddress::new(4, 2, 1));
                cache.enqueue_persist(raster(), tile).await
            })
        };
        tokio::task::yield_now().await;
        assert!(!waiting.is_finished());

        cache.shutdown().await.unwrap();

        match rx.recv().await {
            Some(Job::Persist { tile, .. }) => assert_eq!(first, tile),
            _ => panic!("expected the persist queued before shutdown"),
        }
        assert!(matches!(waiting.await.unwrap(), Err(Error::CacheClosed)));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_write_failure_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TileCache::open(dir.path(), 4, 80).unwrap();

        let address = TileAddress::new(2, 1, 1);
        let unwritable = CachedTile {
            address,
            path: dir.path().join("missing-dir").join("2_1_1.jpg"),
        };
        cache.enqueue_persist(raster(), unwritable.clone()).await.unwrap();
        cache.flush().await.unwrap();
        assert!(!unwritable.path.exists());

        // The writer keeps serving later jobs
        cache.enqueue_persist(raster(), cache.reference(address)).await.unwrap();
        cache.flush().await.unwrap();
        assert!(cache.lookup(address).await.unwrap().is_some());

        cache.shutdown().await.unwrap();
    }
}
