//! §4.5: the on-disk OCI image layout backend — `oci-layout` + `index.json` + `blobs/<alg>/<hex>`.

use std::io::Read;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::backend::{Backend, SaveOptions, SaveResult, publish_with_extras};
use crate::cancel::Cancellation;
use crate::config::Config;
use crate::digest::Digest;
use crate::error::{Error, Result};
use crate::image::Image;
use crate::layer::{Layer, LayerSource, MediaType};
use crate::manifest::{Descriptor, ImageManifest, ManifestMediaType};

const ANNOTATION_REF_NAME: &str = "org.opencontainers.image.ref.name";

#[derive(Debug, Serialize, Deserialize)]
struct OciLayoutFile {
    #[serde(rename = "imageLayoutVersion")]
    image_layout_version: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexFile {
    #[serde(rename = "schemaVersion")]
    schema_version: u32,
    manifests: Vec<Descriptor>,
}

/// Whether layer blobs are actually written to disk on save.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LayoutMode {
    /// Normal save: config, layers, and manifest are all written by content address.
    #[default]
    Full,
    /// §4.5's `sparse` variant: everything but layer blobs is written. Produces a
    /// digest-stable manifest whose layer bytes live elsewhere.
    Sparse,
}

/// The on-disk OCI image layout backend, rooted at `root`.
#[derive(Debug)]
pub struct LayoutBackend {
    root: PathBuf,
    mode: LayoutMode,
}

impl LayoutBackend {
    /// Open or prepare to create a layout at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            mode: LayoutMode::Full,
        }
    }

    /// Use the sparse save variant (§4.5 step 5): skip writing layer blobs.
    pub fn sparse(mut self) -> Self {
        self.mode = LayoutMode::Sparse;
        self
    }

    fn blob_path(&self, digest: &Digest) -> Result<PathBuf> {
        blob_path_at(&self.root, digest)
    }

    fn write_blob_if_absent(&self, digest: &Digest, data: &[u8]) -> Result<()> {
        write_blob_if_absent_at(&self.root, digest, data)
    }

    fn ensure_layout_marker(&self) -> Result<()> {
        ensure_layout_marker_at(&self.root)
    }

    fn read_index(&self) -> Result<IndexFile> {
        let path = self.root.join("index.json");
        if !path.exists() {
            return Ok(IndexFile {
                schema_version: 2,
                manifests: Vec::new(),
            });
        }
        Ok(serde_json::from_slice(&std::fs::read(path)?)?)
    }

    fn write_index(&self, index: &IndexFile) -> Result<()> {
        atomic_write(&self.root.join("index.json"), serde_json::to_string_pretty(index)?.as_bytes())
    }

    fn find_by_ref_name<'a>(index: &'a IndexFile, name: &str) -> Option<&'a Descriptor> {
        index.manifests.iter().find(|d| {
            d.annotations
                .as_ref()
                .and_then(|a| a.get(ANNOTATION_REF_NAME))
                .is_some_and(|v| v == name)
        })
    }
}

impl Backend for LayoutBackend {
    #[instrument(skip(self, cancel), fields(target = name))]
    async fn open(&self, name: &str, cancel: &Cancellation) -> Result<Image> {
        cancel.check()?;
        let index = self.read_index()?;
        let Some(descriptor) = Self::find_by_ref_name(&index, name) else {
            return Ok(Image::empty());
        };

        let manifest_bytes = std::fs::read(self.blob_path(&descriptor.digest)?)?;
        let manifest: ImageManifest = serde_json::from_slice(&manifest_bytes)?;
        let config_bytes = std::fs::read(self.blob_path(&manifest.config.digest)?)?;
        let config: Config = serde_json::from_slice(&config_bytes)?;

        let layers = manifest
            .layers
            .iter()
            .zip(config.rootfs.diff_ids.iter())
            .map(|(d, diff_id)| -> Result<Layer> {
                let path = self.blob_path(&d.digest)?;
                Ok(Layer {
                    diff_id: diff_id.clone(),
                    digest: Some(d.digest.clone()),
                    media_type: MediaType::from_wire_str(&d.media_type).unwrap_or(MediaType::OciLayer),
                    size: d.size,
                    path: path.exists().then_some(path.clone()),
                    source: if path.exists() {
                        LayerSource::OnDisk(path)
                    } else {
                        LayerSource::Empty
                    },
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let prefer_docker = manifest
            .media_type
            .as_deref()
            .and_then(ManifestMediaType::parse)
            .is_some_and(ManifestMediaType::is_docker);
        Ok(Image::from_base(config, layers, name, descriptor.digest.to_string(), prefer_docker))
    }

    #[instrument(skip(self, image, cancel), fields(target = name))]
    async fn save(&self, image: &Image, name: &str, options: SaveOptions, cancel: &Cancellation) -> Result<SaveResult> {
        cancel.check()?;
        if options.extra_names.len() > 1 {
            return Err(Error::MultipleNamesUnsupported);
        }
        self.ensure_layout_marker()?;

        let prefer_docker = image.prefer_docker_media_types();
        let mut layer_descriptors = Vec::with_capacity(image.layers().len());
        for layer in image.layers() {
            cancel.check()?;
            let (digest, size) = self.resolve_layer(image, layer).await?;
            layer_descriptors.push(Descriptor::new(layer.media_type.wire_str(prefer_docker), digest, size));
        }

        let config = image.materialize_config();
        let config_bytes = serde_json::to_vec(&config)?;
        let config_digest = Digest::sha256(&config_bytes);
        self.write_blob_if_absent(&config_digest, &config_bytes)?;

        let manifest = ImageManifest {
            schema_version: 2,
            media_type: Some(
                if prefer_docker {
                    ManifestMediaType::DockerManifest
                } else {
                    ManifestMediaType::OciManifest
                }
                .as_str()
                .to_owned(),
            ),
            config: Descriptor::new(
                if prefer_docker {
                    ManifestMediaType::DockerConfig
                } else {
                    ManifestMediaType::OciConfig
                }
                .as_str(),
                config_digest,
                config_bytes.len() as i64,
            ),
            layers: layer_descriptors,
            annotations: None,
        };
        let manifest_bytes = serde_json::to_vec(&manifest)?;
        let manifest_digest = Digest::sha256(&manifest_bytes);
        self.write_blob_if_absent(&manifest_digest, &manifest_bytes)?;

        let mut index = self.read_index()?;
        index.manifests.retain(|d| {
            d.annotations
                .as_ref()
                .and_then(|a| a.get(ANNOTATION_REF_NAME))
                .is_none_or(|v| v != name)
        });
        let mut descriptor = Descriptor::new(
            manifest.media_type.clone().unwrap_or_default(),
            manifest_digest.clone(),
            manifest_bytes.len() as i64,
        );
        let ref_name = options.extra_names.first().cloned().unwrap_or_else(|| name.to_owned());
        descriptor.annotations = Some([(ANNOTATION_REF_NAME.to_owned(), ref_name)].into_iter().collect());
        index.manifests.push(descriptor);
        self.write_index(&index)?;

        publish_with_extras(name, &[], cancel, |target| async move { Ok(target) })
            .await
            .map(|mut result| {
                result.identifier = manifest_digest.to_string();
                result
            })
    }

    #[instrument(skip(self, cancel), fields(target = name))]
    async fn delete(&self, name: &str, cancel: &Cancellation) -> Result<()> {
        cancel.check()?;
        let mut index = self.read_index()?;
        let before = index.manifests.len();
        index.manifests.retain(|d| {
            d.annotations
                .as_ref()
                .and_then(|a| a.get(ANNOTATION_REF_NAME))
                .is_none_or(|v| v != name)
        });
        if index.manifests.len() == before {
            return Err(Error::NotFound { target: name.to_owned() });
        }
        self.write_index(&index)
    }
}

impl LayoutBackend {
    /// Resolve a layer to its compressed-blob digest and size, writing the blob unless the
    /// sparse variant is in effect. In `Full` mode a lazily-sourced layer (daemon/registry
    /// base, or a placeholder never fetched) is pulled through `Image::get_layer` first —
    /// metadata-only resolution is reserved for `Sparse`, where no blob is ever written, so
    /// there's nothing to fall short of.
    async fn resolve_layer(&self, image: &Image, layer: &Layer) -> Result<(Digest, i64)> {
        match (&layer.source, self.mode) {
            (LayerSource::OnDisk(path), LayoutMode::Full) => {
                let data = std::fs::read(path)?;
                let digest = layer.digest.clone().unwrap_or_else(|| Digest::sha256(&data));
                self.write_blob_if_absent(&digest, &data)?;
                Ok((digest, data.len() as i64))
            }
            (LayerSource::OnDisk(path), LayoutMode::Sparse) => {
                let size = i64::try_from(std::fs::metadata(path)?.len()).unwrap_or(layer.size);
                let digest = layer
                    .digest
                    .clone()
                    .unwrap_or_else(|| Digest::sha256(std::fs::read(path).unwrap_or_default().as_slice()));
                Ok((digest, size))
            }
            (_, LayoutMode::Full) => {
                let mut reader = image.get_layer(&layer.diff_id).await?;
                let mut data = Vec::new();
                reader.read_to_end(&mut data)?;
                let digest = layer.digest.clone().unwrap_or_else(|| Digest::sha256(&data));
                self.write_blob_if_absent(&digest, &data)?;
                Ok((digest, data.len() as i64))
            }
            (_, LayoutMode::Sparse) => {
                let digest = layer.digest.clone().ok_or_else(|| Error::LayerNotFound(layer.diff_id.to_string()))?;
                Ok((digest, layer.size))
            }
        }
    }
}

/// The content-addressed blob path for `digest` under a layout rooted at `root`. Shared
/// with [`crate::index::Index`], which writes locally-added children's blobs into the same
/// `blobs/<alg>/<hex>` shape without going through a full [`LayoutBackend`].
pub(crate) fn blob_path_at(root: &Path, digest: &Digest) -> Result<PathBuf> {
    let alg = digest.algorithm().ok_or_else(|| Error::InvalidFsPath(root.to_path_buf()))?;
    let hex = digest.hex().ok_or_else(|| Error::InvalidFsPath(root.to_path_buf()))?;
    Ok(root.join("blobs").join(alg).join(hex))
}

/// Write `data` under `root`'s blob tree by content address, skipping if already present.
pub(crate) fn write_blob_if_absent_at(root: &Path, digest: &Digest, data: &[u8]) -> Result<()> {
    let path = blob_path_at(root, digest)?;
    if path.exists() {
        debug!(%digest, "blob already present, skipping write");
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    atomic_write(&path, data)
}

/// Ensure `root` exists and carries the `oci-layout` marker file.
pub(crate) fn ensure_layout_marker_at(root: &Path) -> Result<()> {
    std::fs::create_dir_all(root)?;
    let marker_path = root.join("oci-layout");
    if !marker_path.exists() {
        let marker = OciLayoutFile {
            image_layout_version: "1.0.0".to_owned(),
        };
        atomic_write(&marker_path, serde_json::to_string(&marker)?.as_bytes())?;
    }
    Ok(())
}

/// Write `data` to `path` via a staged temp file + rename, so a concurrent reader never
/// observes a partially-written blob.
pub(crate) fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    std::io::Write::write_all(&mut tmp, data)?;
    tmp.persist(path).map_err(|e| Error::Io(e.error))?;
    Ok(())
}
