//! Layer sources, media types, and the per-image once-guard for lazy materialization.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;

use crate::digest::Digest;
use crate::error::Result;

/// The layer media types the core understands. `docker-layer` and `oci-layer` are
/// gzip-compressed tars; `oci-layer+zstd` is zstd-compressed; `windows-layer` is a
/// gzip tar in the re-parented Windows base-layer shape from §4.7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaType {
    /// `application/vnd.docker.image.rootfs.diff.tar.gzip`.
    DockerLayer,
    /// `application/vnd.oci.image.layer.v1.tar+gzip`.
    OciLayer,
    /// `application/vnd.oci.image.layer.v1.tar+zstd`.
    OciLayerZstd,
    /// Windows base-layer shaped gzip tar; same wire media type as `OciLayer`/`DockerLayer`
    /// depending on format preference, distinguished only by the §4.7 writer having run.
    WindowsLayer,
}

impl MediaType {
    /// The wire media-type string for this layer, given a Docker-vs-OCI preference. Windows
    /// layers still publish as a normal OCI/Docker layer media type on the wire; the
    /// `WindowsLayer` variant only tracks that the §4.7 writer produced it.
    pub fn wire_str(self, prefer_docker: bool) -> &'static str {
        match self {
            Self::OciLayerZstd => "application/vnd.oci.image.layer.v1.tar+zstd",
            Self::DockerLayer | Self::WindowsLayer if prefer_docker => {
                "application/vnd.docker.image.rootfs.diff.tar.gzip"
            }
            _ => "application/vnd.oci.image.layer.v1.tar+gzip",
        }
    }

    /// Parse a manifest-observed wire media type back into our internal variant.
    pub fn from_wire_str(s: &str) -> Option<Self> {
        match s {
            "application/vnd.docker.image.rootfs.diff.tar.gzip" => Some(Self::DockerLayer),
            "application/vnd.oci.image.layer.v1.tar+gzip" => Some(Self::OciLayer),
            "application/vnd.oci.image.layer.v1.tar+zstd" => Some(Self::OciLayerZstd),
            _ => None,
        }
    }
}

/// Where a layer's bytes come from. Tagged variant per the design notes: each source knows
/// how to produce a readable stream of the *uncompressed* tar on demand.
///
/// `ReuseLayer`/rebase carry-forward does not get its own variant: a reused layer clones the
/// previous core's `Layer` wholesale, so it already carries whatever source (on-disk,
/// registry, daemon, or empty) the original layer had, and that source already knows how to
/// materialize itself.
#[derive(Debug, Clone)]
pub enum LayerSource {
    /// Bytes live in a local file, already uncompressed (or already the format the backend
    /// expects to read raw).
    OnDisk(PathBuf),
    /// Bytes live in a registry, identified by a blob digest. Not yet fetched.
    Registry {
        /// Repository the blob lives in, `registry/repository` form.
        repository: String,
        /// Compressed blob digest.
        blob_digest: Digest,
    },
    /// Bytes live inside a daemon-exported image tarball, not yet fetched. Materializing
    /// this triggers the at-most-once "save and extract base image" side effect.
    Daemon {
        /// Daemon-local image identifier to export.
        image_id: String,
    },
    /// Metadata known, no data: a synthetic placeholder for a layer whose diffID is known
    /// (e.g. from a manifest) but whose bytes were never requested.
    Empty,
}

/// A single layer in an image's stack.
#[derive(Debug, Clone)]
pub struct Layer {
    /// Digest of the uncompressed tar. Two layers with equal diffID are interchangeable.
    pub diff_id: Digest,
    /// Digest of the compressed blob, once known (after hashing or once read from a
    /// manifest). `None` for a layer that has only been added on-disk and not yet hashed
    /// into a blob, or that has not been fetched.
    pub digest: Option<Digest>,
    /// Layer media type.
    pub media_type: MediaType,
    /// Byte size of the compressed blob, or -1 when unknown/lazy.
    pub size: i64,
    /// Local path backing this layer, if it has been materialized to disk.
    pub path: Option<PathBuf>,
    /// How to obtain the bytes if they are not already resident.
    pub source: LayerSource,
}

impl Layer {
    /// Build a layer directly from an on-disk tar, hashing it for the diffID.
    pub fn from_path(path: PathBuf, media_type: MediaType) -> Result<Self> {
        let file = std::fs::File::open(&path)?;
        let diff_id = Digest::sha256_reader(file)?;
        let size = i64::try_from(std::fs::metadata(&path)?.len()).unwrap_or(i64::MAX);
        Ok(Self {
            diff_id,
            digest: None,
            media_type,
            size,
            path: Some(path.clone()),
            source: LayerSource::OnDisk(path),
        })
    }

    /// Build a layer from an on-disk tar, trusting a caller-supplied diffID rather than
    /// hashing the file (`AddLayerWithDiffID`).
    pub fn from_path_with_diff_id(path: PathBuf, diff_id: Digest, media_type: MediaType) -> Self {
        Self {
            diff_id,
            digest: None,
            media_type,
            size: -1,
            path: Some(path.clone()),
            source: LayerSource::OnDisk(path),
        }
    }

    /// True if this layer's bytes have not yet been fetched from its source.
    pub fn is_lazy(&self) -> bool {
        matches!(
            self.source,
            LayerSource::Registry { .. } | LayerSource::Daemon { .. } | LayerSource::Empty
        )
    }
}

/// Gates the "materialize every lazily-borrowed layer for this identifier" side effect so
/// it runs at most once per core per identifier, even under concurrent `GetLayer` calls.
#[derive(Debug, Clone, Default)]
pub struct OnceGuard {
    inner: Arc<OnceCell<()>>,
}

impl OnceGuard {
    /// Run `f` the first time this guard is awaited; subsequent callers wait on the first
    /// call's completion and then return without re-running it.
    pub async fn run_once<F, Fut>(&self, f: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        self.inner
            .get_or_try_init(f)
            .await
            .map(|()| ())
    }
}
