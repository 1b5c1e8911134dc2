//! §4.3: the OCI distribution registry backend.

use std::collections::HashMap;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use oci_client::{
    Client, Reference as OciClientReference,
    client::{ClientConfig, ImageLayer},
    manifest::{OciDescriptor, OciImageManifest},
    secrets::RegistryAuth,
};
use tracing::{debug, instrument, warn};

use crate::backend::{Backend, SaveOptions, SaveResult, publish_with_extras};
use crate::cancel::Cancellation;
use crate::config::Config;
use crate::digest::Digest;
use crate::error::{Error, Result};
use crate::image::{Image, LayerFetcher};
use crate::layer::{Layer, LayerSource, MediaType};
use crate::manifest::ManifestMediaType;
use crate::platform::Platform;
use crate::reference::Reference;

/// Everything this crate needs from a remote OCI registry. §4.3 is specified only in terms
/// of this interface; [`OciClientTransport`] is the default implementation over `oci-client`.
pub trait RegistryTransport: std::fmt::Debug + Send + Sync {
    /// Fetch the manifest for `reference`, returning its raw JSON bytes and media type.
    fn get_manifest(
        &self,
        reference: &Reference,
    ) -> impl std::future::Future<Output = Result<(Vec<u8>, String)>> + Send;

    /// Fetch a blob's raw bytes by digest.
    fn get_blob(
        &self,
        repository: &str,
        digest: &Digest,
    ) -> impl std::future::Future<Output = Result<Vec<u8>>> + Send;

    /// True if the registry already has this blob, without downloading it.
    fn has_blob(
        &self,
        repository: &str,
        digest: &Digest,
    ) -> impl std::future::Future<Output = Result<bool>> + Send;

    /// Upload a blob's bytes, returning the digest the registry assigned (should equal the
    /// locally computed digest for content-addressed stores).
    fn put_blob(
        &self,
        repository: &str,
        data: Vec<u8>,
    ) -> impl std::future::Future<Output = Result<Digest>> + Send;

    /// Publish a manifest under `reference`.
    fn put_manifest(
        &self,
        reference: &Reference,
        media_type: &str,
        data: Vec<u8>,
    ) -> impl std::future::Future<Output = Result<()>> + Send;
}

/// Default [`RegistryTransport`] over the `oci-client` crate.
#[derive(Debug, Clone)]
pub struct OciClientTransport {
    client: Arc<Client>,
    auth: RegistryAuth,
}

impl OciClientTransport {
    /// Build a transport using anonymous auth and the crate's default TLS client config.
    pub fn anonymous() -> Self {
        Self {
            client: Arc::new(Client::new(ClientConfig::default())),
            auth: RegistryAuth::Anonymous,
        }
    }

    fn to_oci_client_reference(reference: &Reference) -> Result<OciClientReference> {
        reference
            .to_name_string()
            .parse()
            .map_err(|e| Error::InvalidReference {
                reference: reference.to_name_string(),
                reason: format!("could not parse reference: {e}"),
            })
    }
}

impl RegistryTransport for OciClientTransport {
    async fn get_manifest(&self, reference: &Reference) -> Result<(Vec<u8>, String)> {
        let oci_ref = Self::to_oci_client_reference(reference)?;
        let (manifest, _digest) = self
            .client
            .pull_manifest(&oci_ref, &self.auth)
            .await
            .map_err(|e| Error::Registry(Box::new(e)))?;
        let media_type = manifest
            .media_type()
            .unwrap_or_else(|| ManifestMediaType::OciManifest.as_str().to_owned());
        let bytes = serde_json::to_vec(&manifest)?;
        Ok((bytes, media_type))
    }

    async fn get_blob(&self, repository: &str, digest: &Digest) -> Result<Vec<u8>> {
        let oci_ref: OciClientReference = format!("{repository}@{digest}")
            .parse()
            .map_err(|e| Error::Registry(Box::new(std::io::Error::other(format!("{e}")))))?;
        let mut buf = Vec::new();
        self.client
            .pull_blob(&oci_ref, digest.as_str(), &mut buf)
            .await
            .map_err(|e| Error::Registry(Box::new(e)))?;
        Ok(buf)
    }

    async fn has_blob(&self, repository: &str, digest: &Digest) -> Result<bool> {
        let oci_ref: OciClientReference = repository
            .parse()
            .map_err(|e| Error::Registry(Box::new(std::io::Error::other(format!("{e}")))))?;
        Ok(self
            .client
            .check_blob_exists(&oci_ref, digest.as_str())
            .await
            .unwrap_or(false))
    }

    async fn put_blob(&self, repository: &str, data: Vec<u8>) -> Result<Digest> {
        let oci_ref: OciClientReference = repository
            .parse()
            .map_err(|e| Error::Registry(Box::new(std::io::Error::other(format!("{e}")))))?;
        let digest = Digest::sha256(&data);
        let layer = ImageLayer::new(data, MediaType::OciLayer.wire_str(false).to_owned(), None);
        self.client
            .push_blob(&oci_ref, &layer.data, &layer.sha256_digest())
            .await
            .map_err(|e| Error::Registry(Box::new(e)))?;
        Ok(digest)
    }

    async fn put_manifest(&self, reference: &Reference, _media_type: &str, data: Vec<u8>) -> Result<()> {
        let oci_ref = Self::to_oci_client_reference(reference)?;
        let manifest: OciImageManifest =
            serde_json::from_slice(&data).map_err(|e| Error::Registry(Box::new(e)))?;
        self.client
            .push_manifest(&oci_ref, &oci_client::manifest::OciManifest::Image(manifest))
            .await
            .map_err(|e| Error::Registry(Box::new(e)))?;
        Ok(())
    }
}

/// The registry backend: Open resolves a manifest (or index descriptor for the requested
/// platform), Save uploads blobs/config/manifest with dedup, Delete is a no-op placeholder
/// (the distribution spec has no reliable untag-by-name primitive in general).
#[derive(Debug)]
pub struct RegistryBackend<T: RegistryTransport = OciClientTransport> {
    transport: Arc<T>,
    prefer_docker: bool,
    platform_preference: Option<Platform>,
    scratch_dir: PathBuf,
}

impl RegistryBackend<OciClientTransport> {
    /// A registry backend using the default `oci-client`-backed transport, anonymous auth.
    pub fn new_default() -> Self {
        Self {
            transport: Arc::new(OciClientTransport::anonymous()),
            prefer_docker: false,
            platform_preference: None,
            scratch_dir: std::env::temp_dir(),
        }
    }
}

impl<T: RegistryTransport> RegistryBackend<T> {
    /// Build a registry backend over a custom transport (used by tests with a fixture).
    pub fn new(transport: T) -> Self {
        Self {
            transport: Arc::new(transport),
            prefer_docker: false,
            platform_preference: None,
            scratch_dir: std::env::temp_dir(),
        }
    }

    /// Directory under which lazily-fetched base-image layers are written once
    /// materialized (§5's at-most-once guarantee). Defaults to the system temp dir.
    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = dir.into();
        self
    }

    /// Prefer the requested platform when `Open` resolves a manifest list. Falls back to
    /// the first `linux/amd64` descriptor when unset, per §4.3.
    pub fn with_platform_preference(mut self, platform: Platform) -> Self {
        self.platform_preference = Some(platform);
        self
    }
}

impl<T: RegistryTransport> Backend for RegistryBackend<T> {
    #[instrument(skip(self, cancel), fields(target = name))]
    async fn open(&self, name: &str, cancel: &Cancellation) -> Result<Image> {
        cancel.check()?;
        let reference = Reference::parse(name)?;
        let (bytes, media_type) = match self.transport.get_manifest(&reference).await {
            Ok(v) => v,
            Err(Error::NotFound { .. }) => return Ok(Image::empty()),
            Err(err) => return Err(err),
        };

        let mt = ManifestMediaType::parse(&media_type);
        let manifest_bytes = if mt.is_some_and(ManifestMediaType::is_index) {
            let index: crate::manifest::IndexManifest = serde_json::from_slice(&bytes)?;
            let wanted = self.platform_preference.clone().unwrap_or_else(|| Platform {
                os: "linux".to_owned(),
                architecture: "amd64".to_owned(),
                ..Platform::default()
            });
            let chosen = index
                .manifests
                .iter()
                .find(|d| {
                    d.platform
                        .as_ref()
                        .is_some_and(|p| p.os == wanted.os && p.architecture == wanted.architecture)
                })
                .or_else(|| index.manifests.first())
                .ok_or_else(|| Error::NotFound { target: name.to_owned() })?;
            self.transport.get_blob(&reference.repository, &chosen.digest).await?
        } else {
            bytes
        };

        let manifest: crate::manifest::ImageManifest = serde_json::from_slice(&manifest_bytes)?;
        let config_bytes = self
            .transport
            .get_blob(&reference.repository, &manifest.config.digest)
            .await?;
        let config: Config = serde_json::from_slice(&config_bytes)?;

        let layers = manifest
            .layers
            .iter()
            .zip(config.rootfs.diff_ids.iter())
            .map(|(descriptor, diff_id)| Layer {
                diff_id: diff_id.clone(),
                digest: Some(descriptor.digest.clone()),
                media_type: MediaType::from_wire_str(&descriptor.media_type).unwrap_or(MediaType::OciLayer),
                size: descriptor.size,
                path: None,
                source: LayerSource::Registry {
                    repository: reference.repository.clone(),
                    blob_digest: descriptor.digest.clone(),
                },
            })
            .collect();

        let prefer_docker = mt.is_some_and(ManifestMediaType::is_docker);
        let lazy_layers = manifest
            .layers
            .iter()
            .zip(config.rootfs.diff_ids.iter())
            .map(|(d, diff_id)| (diff_id.clone(), d.digest.clone()))
            .collect();
        let mut image = Image::from_base(config, layers, name, name, prefer_docker);
        let fetcher: Arc<dyn LayerFetcher> = Arc::new(RegistryLayerFetcher {
            transport: self.transport.clone(),
            repository: reference.repository.clone(),
            scratch_dir: self.scratch_dir.clone(),
            layers: lazy_layers,
        });
        image.set_layer_fetcher(fetcher);
        Ok(image)
    }

    #[instrument(skip(self, image, cancel), fields(target = name))]
    async fn save(&self, image: &Image, name: &str, options: SaveOptions, cancel: &Cancellation) -> Result<SaveResult> {
        cancel.check()?;
        let reference = Reference::parse(name)?;
        let prefer_docker = image.prefer_docker_media_types() || self.prefer_docker;

        let mut uploaded = HashMap::new();
        let mut layer_descriptors = Vec::with_capacity(image.layers().len());
        for layer in image.layers() {
            cancel.check()?;
            let digest = self.ensure_layer_uploaded(&reference.repository, image, layer, &mut uploaded).await?;
            layer_descriptors.push(OciDescriptor {
                media_type: layer.media_type.wire_str(prefer_docker).to_owned(),
                digest: digest.to_string(),
                size: layer.size,
                urls: None,
                annotations: None,
            });
            debug!(diff_id = %layer.diff_id, "layer upload resolved");
        }

        let config = image.materialize_config();
        let config_bytes = serde_json::to_vec(&config)?;
        let config_digest = self.transport.put_blob(&reference.repository, config_bytes.clone()).await?;

        let manifest = crate::manifest::ImageManifest {
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
            config: crate::manifest::Descriptor::new(
                if prefer_docker {
                    ManifestMediaType::DockerConfig
                } else {
                    ManifestMediaType::OciConfig
                }
                .as_str(),
                config_digest,
                config_bytes.len() as i64,
            ),
            layers: layer_descriptors
                .into_iter()
                .map(|d| crate::manifest::Descriptor {
                    media_type: d.media_type,
                    digest: Digest::from_raw(d.digest),
                    size: d.size,
                    platform: None,
                    annotations: d.annotations.map(|a| a.into_iter().collect()),
                    urls: d.urls,
                })
                .collect(),
            annotations: None,
        };
        let manifest_media_type = manifest.media_type.clone().unwrap_or_default();
        let manifest_bytes = serde_json::to_vec(&manifest)?;

        // Manifest-list membership and per-name PUTs are handled uniformly by
        // `publish_with_extras`: the primary name is fatal on failure, extras aggregate.
        publish_with_extras(name, &options.extra_names, cancel, |target| {
            let manifest_bytes = manifest_bytes.clone();
            let manifest_media_type = manifest_media_type.clone();
            async move {
                let target_ref = Reference::parse(&target)?;
                self.transport
                    .put_manifest(&target_ref, &manifest_media_type, manifest_bytes)
                    .await?;
                Ok(target)
            }
        })
        .await
    }

    #[instrument(skip(self, cancel), fields(target = name))]
    async fn delete(&self, name: &str, cancel: &Cancellation) -> Result<()> {
        cancel.check()?;
        warn!("registry delete-by-name is not a reliable distribution-spec primitive; no-op");
        let _ = Reference::parse(name)?;
        Ok(())
    }
}

impl<T: RegistryTransport> RegistryBackend<T> {
    /// Upload `layer`'s blob if the registry does not already have it, deduplicating by
    /// diffID within a single save so an identical layer is never uploaded twice (§4.3).
    async fn ensure_layer_uploaded(
        &self,
        repository: &str,
        image: &Image,
        layer: &Layer,
        uploaded: &mut HashMap<Digest, Digest>,
    ) -> Result<Digest> {
        if let Some(digest) = uploaded.get(&layer.diff_id) {
            return Ok(digest.clone());
        }

        let bytes = match &layer.source {
            LayerSource::OnDisk(path) => std::fs::read(path)?,
            LayerSource::Registry { blob_digest, .. } => {
                if self.transport.has_blob(repository, blob_digest).await? {
                    uploaded.insert(layer.diff_id.clone(), blob_digest.clone());
                    return Ok(blob_digest.clone());
                }
                self.transport.get_blob(repository, blob_digest).await?
            }
            // Daemon-sourced or placeholder layers (e.g. a base image saved to a different
            // backend than it was opened from) have no blob to fetch directly; fall back to
            // `Image::get_layer`, which knows how to materialize them through the attached
            // fetcher, the same path `save` relies on for any lazily-sourced layer.
            LayerSource::Daemon { .. } | LayerSource::Empty => {
                let mut reader = image.get_layer(&layer.diff_id).await?;
                let mut bytes = Vec::new();
                reader.read_to_end(&mut bytes)?;
                bytes
            }
        };

        let digest = if let Some(existing) = &layer.digest {
            if self.transport.has_blob(repository, existing).await? {
                uploaded.insert(layer.diff_id.clone(), existing.clone());
                return Ok(existing.clone());
            }
            existing.clone()
        } else {
            Digest::sha256(&bytes)
        };

        self.transport.put_blob(repository, bytes).await?;
        uploaded.insert(layer.diff_id.clone(), digest.clone());
        Ok(digest)
    }
}

/// Materializes every layer of a registry-sourced base image that was never uploaded to
/// this save (lazy pull path for `GetLayer`). Blobs are stored uncompressed-tar content
/// addressed by diffID, the same convention `ensure_layer_uploaded` and the layout backend
/// use, so the fetched bytes are written to disk as-is.
#[derive(Debug)]
struct RegistryLayerFetcher<T: RegistryTransport> {
    transport: Arc<T>,
    repository: String,
    scratch_dir: PathBuf,
    /// (diffID, blob digest) pairs for every layer of the image this fetcher was built for.
    layers: Vec<(Digest, Digest)>,
}

impl<T: RegistryTransport + 'static> LayerFetcher for RegistryLayerFetcher<T> {
    fn materialize_all(
        &self,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<HashMap<Digest, PathBuf>>> + Send + '_>> {
        Box::pin(async move {
            debug!(repository = %self.repository, count = self.layers.len(), "materializing registry base image layers");
            std::fs::create_dir_all(&self.scratch_dir)?;
            let mut paths = HashMap::with_capacity(self.layers.len());
            for (diff_id, blob_digest) in &self.layers {
                let bytes = self.transport.get_blob(&self.repository, blob_digest).await?;
                let target = self.scratch_dir.join(format!("{}.tar", diff_id.hex().unwrap_or("layer")));
                std::fs::write(&target, &bytes)?;
                paths.insert(diff_id.clone(), target);
            }
            Ok(paths)
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::{RegistryBackend, RegistryTransport};
    use crate::backend::Backend;
    use crate::cancel::Cancellation;
    use crate::digest::Digest;
    use crate::image::Image;
    use crate::reference::Reference;

    /// In-memory [`RegistryTransport`] fixture sharing state across clones via `Arc`, so
    /// the same backing store can be wrapped by two distinct `RegistryBackend`s (one for
    /// `save`, one for a later `open`), matching how a registry persists across calls.
    #[derive(Debug, Clone, Default)]
    struct FakeRegistryTransport {
        blobs: std::sync::Arc<Mutex<std::collections::HashMap<String, Vec<u8>>>>,
        manifests: std::sync::Arc<Mutex<std::collections::HashMap<String, (Vec<u8>, String)>>>,
        put_blob_calls: std::sync::Arc<AtomicUsize>,
    }

    impl RegistryTransport for FakeRegistryTransport {
        async fn get_manifest(&self, reference: &Reference) -> crate::error::Result<(Vec<u8>, String)> {
            self.manifests
                .lock()
                .unwrap()
                .get(&reference.to_name_string())
                .cloned()
                .ok_or_else(|| crate::error::Error::NotFound { target: reference.to_name_string() })
        }

        async fn get_blob(&self, _repository: &str, digest: &Digest) -> crate::error::Result<Vec<u8>> {
            self.blobs
                .lock()
                .unwrap()
                .get(digest.as_str())
                .cloned()
                .ok_or_else(|| crate::error::Error::NotFound { target: digest.to_string() })
        }

        async fn has_blob(&self, _repository: &str, digest: &Digest) -> crate::error::Result<bool> {
            Ok(self.blobs.lock().unwrap().contains_key(digest.as_str()))
        }

        async fn put_blob(&self, _repository: &str, data: Vec<u8>) -> crate::error::Result<Digest> {
            self.put_blob_calls.fetch_add(1, Ordering::SeqCst);
            let digest = Digest::sha256(&data);
            self.blobs.lock().unwrap().insert(digest.as_str().to_owned(), data);
            Ok(digest)
        }

        async fn put_manifest(&self, reference: &Reference, media_type: &str, data: Vec<u8>) -> crate::error::Result<()> {
            self.manifests
                .lock()
                .unwrap()
                .insert(reference.to_name_string(), (data, media_type.to_owned()));
            Ok(())
        }
    }

    fn make_tar(dir: &std::path::Path, name: &str, content: &[u8]) -> std::path::PathBuf {
        let path = dir.join(name);
        let file = std::fs::File::create(&path).expect("create");
        let mut builder = tar::Builder::new(file);
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, "f", content).expect("append");
        builder.finish().expect("finish");
        path
    }

    #[tokio::test]
    async fn save_then_open_lazily_refetches_layer_bytes() {
        let scratch = tempfile::tempdir().expect("scratch");
        let layer_path = make_tar(scratch.path(), "layer.tar", b"abc");
        let mut image = Image::empty();
        image.add_layer(&layer_path).expect("add layer");
        image.set_os("linux").expect("set os");
        image.set_architecture("amd64");

        let transport = FakeRegistryTransport::default();
        let save_backend = RegistryBackend::new(transport.clone());
        save_backend
            .save(&image, "repo:v1", crate::backend::SaveOptions::default(), &Cancellation::none())
            .await
            .expect("save");

        let open_scratch = tempfile::tempdir().expect("open scratch");
        let open_backend = RegistryBackend::new(transport).with_scratch_dir(open_scratch.path());
        let reopened = open_backend.open("repo:v1", &Cancellation::none()).await.expect("open");
        assert!(reopened.found());
        assert_eq!(reopened.layers().len(), 1);

        let diff_id = reopened.layers()[0].diff_id.clone();
        let mut bytes = Vec::new();
        std::io::Read::read_to_end(&mut reopened.get_layer(&diff_id).await.expect("get layer"), &mut bytes)
            .expect("read");
        let mut archive = tar::Archive::new(&bytes[..]);
        let mut entry = archive.entries().expect("entries").next().expect("one entry").expect("entry");
        let mut content = Vec::new();
        std::io::Read::read_to_end(&mut entry, &mut content).expect("read entry");
        assert_eq!(content, b"abc");
    }

    #[tokio::test]
    async fn ensure_layer_uploaded_dedups_identical_diff_id_within_one_save() {
        let scratch = tempfile::tempdir().expect("scratch");
        let layer_path = make_tar(scratch.path(), "layer.tar", b"xyz");
        let diff_id = Digest::sha256_reader(std::fs::File::open(&layer_path).expect("open")).expect("hash");

        let mut image = Image::empty();
        // Two layers backed by the same on-disk bytes/diffID exercise the dedup path.
        image.add_layer_with_diff_id(&layer_path, diff_id.clone());
        image.add_layer_with_diff_id(&layer_path, diff_id);

        let transport = FakeRegistryTransport::default();
        let backend = RegistryBackend::new(transport.clone());
        backend
            .save(&image, "repo:v1", crate::backend::SaveOptions::default(), &Cancellation::none())
            .await
            .expect("save");

        // One upload for the (deduplicated) layer blob, one for the config blob. Without
        // dedup this would be 3 (layer uploaded twice plus config).
        assert_eq!(transport.put_blob_calls.load(Ordering::SeqCst), 2, "identical diffID must upload once");
    }

    /// Serves a single fixed layer regardless of the identifier it's asked for, standing in
    /// for a daemon/registry fetcher when only `ensure_layer_uploaded`'s fallback matters.
    #[derive(Debug)]
    struct FakeLayerFetcher {
        diff_id: Digest,
        path: std::path::PathBuf,
    }

    impl crate::image::LayerFetcher for FakeLayerFetcher {
        fn materialize_all(
            &self,
        ) -> std::pin::Pin<
            Box<dyn std::future::Future<Output = crate::error::Result<HashMap<Digest, std::path::PathBuf>>> + Send + '_>,
        > {
            let diff_id = self.diff_id.clone();
            let path = self.path.clone();
            Box::pin(async move { Ok(HashMap::from([(diff_id, path)])) })
        }
    }

    #[tokio::test]
    async fn save_materializes_a_daemon_sourced_layer_saved_to_a_different_backend() {
        let scratch = tempfile::tempdir().expect("scratch");
        let layer_path = make_tar(scratch.path(), "layer.tar", b"from-daemon");
        let diff_id = Digest::sha256_reader(std::fs::File::open(&layer_path).expect("open")).expect("hash");

        let mut image = Image::from_base(
            Config {
                os: "linux".to_owned(),
                architecture: "amd64".to_owned(),
                rootfs: crate::config::RootFs { fs_type: "layers".to_owned(), diff_ids: vec![diff_id.clone()] },
                ..Default::default()
            },
            vec![Layer {
                diff_id: diff_id.clone(),
                digest: None,
                media_type: crate::layer::MediaType::DockerLayer,
                size: -1,
                path: None,
                source: LayerSource::Daemon { image_id: "deadbeef".to_owned() },
            }],
            "base:v1",
            "deadbeef",
            true,
        );
        image.set_layer_fetcher(std::sync::Arc::new(FakeLayerFetcher { diff_id, path: layer_path }));

        let transport = FakeRegistryTransport::default();
        let backend = RegistryBackend::new(transport.clone());
        backend
            .save(&image, "repo:v1", crate::backend::SaveOptions::default(), &Cancellation::none())
            .await
            .expect("save must materialize the daemon-sourced layer via the fetcher, not error");

        assert_eq!(transport.put_blob_calls.load(Ordering::SeqCst), 2, "one layer blob plus config");
    }

    #[tokio::test]
    async fn open_missing_reference_returns_empty_core() {
        let transport = FakeRegistryTransport::default();
        let backend = RegistryBackend::new(transport);
        let image = backend.open("repo:missing", &Cancellation::none()).await.expect("open never fails for a miss");
        assert!(!image.found());
    }

    #[tokio::test]
    async fn save_fails_cancelled_before_touching_the_transport() {
        let transport = FakeRegistryTransport::default();
        let backend = RegistryBackend::new(transport.clone());

        let mut image = Image::empty();
        image.set_os("linux").expect("set os");

        let canceller = crate::cancel::Canceller::new();
        canceller.cancel();
        let err = backend
            .save(&image, "repo:v1", crate::backend::SaveOptions::default(), &canceller.token())
            .await
            .expect_err("must fail cancelled");
        assert!(matches!(err, crate::error::Error::Cancelled));
        assert_eq!(transport.put_blob_calls.load(Ordering::SeqCst), 0, "must not upload once cancelled");
    }
}
