//! Restore image acquisition.
//!
//! Two sources: the latest image the host supports, downloaded into the
//! bundle's cached-image path, or a file the caller already has.
//!
//! ## Download
//!
//! ```text
//! fetch_latest()
//!     └─► tokio task
//!             ├─► resolve URL          (settings override, else engine catalog)
//!             ├─► GET, stream chunks → <root>/.RestoreImage*  (temp file)
//!             │       └─► progress fractions on the handle's channel
//!             └─► rename temp → <root>/RestoreImage.ipsw
//! ```
//!
//! Only one download runs at a time per provider. A failed or cancelled
//! download removes its temp file and leaves nothing at the destination.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::Client;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{ImageError, InstallError, NetworkError, StorageError};
use crate::vm::bundle::{BundleLayout, DOWNLOAD_PREFIX};
use crate::vm::engine::Hypervisor;

const CONNECT_TIMEOUT_SEC: u64 = 10;
const READ_TIMEOUT_SEC: u64 = 30;

/// Where an [`ImageHandle`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageOrigin {
    Downloaded,
    Local,
}

/// An installable image on local disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageHandle {
    pub path: PathBuf,
    pub origin: ImageOrigin,
}

// ---------------------------------------------------------------------------
// Single-flight guard
// ---------------------------------------------------------------------------

/// Held by the download task; releases the provider when dropped, including
/// when the task is aborted.
struct InFlight(Arc<AtomicBool>);

impl InFlight {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(Arc::clone(flag)))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// Fetch handle
// ---------------------------------------------------------------------------

/// A running download. Dropping the handle aborts it.
pub struct FetchHandle {
    progress: mpsc::UnboundedReceiver<f64>,
    task: JoinHandle<Result<ImageHandle, NetworkError>>,
}

impl FetchHandle {
    /// Next progress fraction, or `None` once the download has ended.
    /// Fractions lie in `[0, 1]` and never decrease.
    pub async fn next_progress(&mut self) -> Option<f64> {
        self.progress.recv().await
    }

    /// Abort the download. The temp file is removed and [`Self::result`]
    /// reports [`NetworkError::Cancelled`].
    pub fn cancel(&self) {
        self.task.abort();
    }

    pub async fn result(mut self) -> Result<ImageHandle, NetworkError> {
        match (&mut self.task).await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(NetworkError::Cancelled),
            Err(e) => Err(NetworkError::Join(e)),
        }
    }
}

impl Drop for FetchHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

pub struct RestoreImageProvider<H> {
    engine: Arc<H>,
    layout: BundleLayout,
    url_override: Option<String>,
    client: Client,
    in_flight: Arc<AtomicBool>,
}

impl<H: Hypervisor> RestoreImageProvider<H> {
    /// `url_override` replaces the engine catalog lookup when set.
    pub fn new(
        engine: Arc<H>,
        layout: BundleLayout,
        url_override: Option<String>,
    ) -> Result<Self, NetworkError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SEC))
            .read_timeout(Duration::from_secs(READ_TIMEOUT_SEC))
            .build()
            .map_err(NetworkError::BuildClient)?;
        Ok(Self {
            engine,
            layout,
            url_override,
            client,
            in_flight: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn is_fetching(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Start downloading the latest compatible image into the bundle.
    ///
    /// The bundle root must already exist; the temp file is created there so
    /// the final rename never crosses filesystems.
    pub fn fetch_latest(&self) -> Result<FetchHandle, NetworkError> {
        let guard = InFlight::acquire(&self.in_flight).ok_or(NetworkError::AlreadyInProgress)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let engine = Arc::clone(&self.engine);
        let client = self.client.clone();
        let layout = self.layout.clone();
        let url_override = self.url_override.clone();

        let task = tokio::spawn(async move {
            let _guard = guard;
            let url = match url_override {
                Some(url) => url,
                None => engine.latest_restore_image_url().await?,
            };
            let url = Url::parse(&url).map_err(|source| NetworkError::InvalidUrl {
                url: url.clone(),
                source,
            })?;
            download(&client, url, &layout, tx).await
        });

        Ok(FetchHandle {
            progress: rx,
            task,
        })
    }

    /// Use an image the caller already has. The file is not copied.
    pub async fn load_local(&self, path: &Path) -> Result<ImageHandle, InstallError> {
        let meta = match tokio::fs::metadata(path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound {
                    path: path.to_path_buf(),
                }
                .into());
            }
            Err(e) => return Err(StorageError::io("stat restore image", path, e).into()),
        };

        if !meta.is_file() {
            return Err(ImageError::Invalid {
                path: path.to_path_buf(),
                reason: "not a regular file".into(),
            }
            .into());
        }

        if let Err(e) = tokio::fs::File::open(path).await {
            return Err(ImageError::Invalid {
                path: path.to_path_buf(),
                reason: format!("not readable: {e}"),
            }
            .into());
        }

        debug!(target: "restore_image", path = %path.display(), bytes = meta.len(), "local image accepted");
        Ok(ImageHandle {
            path: path.to_path_buf(),
            origin: ImageOrigin::Local,
        })
    }
}

async fn download(
    client: &Client,
    url: Url,
    layout: &BundleLayout,
    progress: mpsc::UnboundedSender<f64>,
) -> Result<ImageHandle, NetworkError> {
    let dest = layout.cached_image_path();
    info!(target: "restore_image", %url, dest = %dest.display(), "downloading restore image");

    let resp = client
        .get(url.clone())
        .send()
        .await
        .map_err(NetworkError::Request)?;

    if !resp.status().is_success() {
        return Err(NetworkError::Status {
            url: url.to_string(),
            status: resp.status().as_u16(),
        });
    }

    let total = resp.content_length().filter(|&n| n > 0);

    let temp = tempfile::Builder::new()
        .prefix(DOWNLOAD_PREFIX)
        .tempfile_in(layout.root())
        .map_err(|source| NetworkError::Write {
            path: layout.root().to_path_buf(),
            source,
        })?;
    let (std_file, temp_path) = temp.into_parts();
    let write_err = |source| NetworkError::Write {
        path: temp_path.to_path_buf(),
        source,
    };
    let mut file = tokio::fs::File::from_std(std_file);

    let _ = progress.send(0.0);
    let mut downloaded: u64 = 0;
    let mut stream = resp.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let bytes = chunk.map_err(NetworkError::Stream)?;
        file.write_all(&bytes).await.map_err(write_err)?;
        downloaded += bytes.len() as u64;
        if let Some(total) = total {
            let _ = progress.send((downloaded as f64 / total as f64).min(1.0));
        }
    }

    if let Some(total) = total.filter(|&total| downloaded < total) {
        warn!(target: "restore_image", downloaded, total, "download ended early");
        return Err(NetworkError::Write {
            path: temp_path.to_path_buf(),
            source: std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("received {downloaded} of {total} bytes"),
            ),
        });
    }

    file.flush().await.map_err(write_err)?;
    file.sync_all().await.map_err(write_err)?;
    drop(file);

    temp_path
        .persist(&dest)
        .map_err(|e| NetworkError::Write {
            path: dest.clone(),
            source: e.error,
        })?;

    let _ = progress.send(1.0);
    info!(target: "restore_image", dest = %dest.display(), bytes = downloaded, "restore image downloaded");

    Ok(ImageHandle {
        path: dest,
        origin: ImageOrigin::Downloaded,
    })
}
