//! §4.6: the multi-platform index engine — a manifest list plus per-descriptor overlays.
//!
//! §9's "Side-table overlays in the Index" design note: per-descriptor platform/annotation
//! edits land in [`Overlay`] entries keyed by digest, parallel to the underlying
//! [`IndexManifest`], and are folded in only on [`Index::save`]/[`Index::push`] — the
//! underlying manifest is never mutated by a setter directly.

use std::collections::HashMap;
use std::path::PathBuf;

use tracing::{debug, instrument, warn};

use crate::backend::layout::{ensure_layout_marker_at, write_blob_if_absent_at};
use crate::backend::registry::{OciClientTransport, RegistryTransport};
use crate::digest::Digest;
use crate::error::{Error, Field, Result};
use crate::image::Image;
use crate::layer::LayerSource;
use crate::manifest::{Descriptor, ImageManifest, IndexManifest, ManifestMediaType};
use crate::platform::{Annotations, Platform, PlatformQuery};
use crate::reference::Reference;

/// Per-descriptor overlay: fields set via `Index::set_*` since the manifest was last
/// loaded/built, not yet folded into the underlying [`IndexManifest`].
#[derive(Debug, Clone, Default)]
struct Overlay {
    os: Option<String>,
    os_version: Option<String>,
    architecture: Option<String>,
    variant: Option<String>,
    features: Option<Vec<String>>,
    os_features: Option<Vec<String>>,
    annotations: Option<Annotations>,
    urls: Option<Vec<String>>,
}

/// Options for [`Index::add`]'s reference-resolution semantics (§4.6 Add table). Only
/// meaningful for [`AddTarget::Reference`]; ignored for [`AddTarget::Image`].
#[derive(Debug, Clone, Default)]
pub struct AddOptions {
    /// Append every child descriptor of a resolved list, rather than one.
    pub all: bool,
    /// When any field is set, select the first child whose platform matches all of them and
    /// append it with those fields overlaid (§9's resolved "first match in manifest order").
    pub platform: PlatformQuery,
}

/// What `ref` refers to in an [`Index::add`] call.
pub enum AddTarget {
    /// Resolve `reference` against the attached registry transport — it may turn out to be
    /// a single image manifest or a list/index.
    Reference(String),
    /// An in-process image, appended by reference without touching the registry
    /// (`Local=true`). The engine takes ownership so its layers can be written on `save`.
    Image(Box<Image>),
}

/// Options for [`Index::push`].
#[derive(Debug, Clone, Default)]
pub struct PushOptions {
    /// Tags to publish the list under. Defaults to this index's own name if empty.
    pub names: Vec<String>,
    /// Remove the on-disk copy after a successful push.
    pub purge: bool,
    /// Negotiate over plain HTTP. The transport must already be configured for this; the
    /// flag only affects logging here, since the transport is injected pre-configured.
    pub insecure: bool,
}

/// The multi-platform index engine: an [`IndexManifest`] plus side tables for pending
/// per-descriptor overrides and locally-added children (§3's "Index Engine State").
#[derive(Debug)]
pub struct Index<T: RegistryTransport = OciClientTransport> {
    transport: Option<T>,
    base_dir: PathBuf,
    name: String,
    docker_format: bool,
    manifest: Option<IndexManifest>,
    overlays: HashMap<Digest, Overlay>,
    child_images: HashMap<Digest, Image>,
    dirty: bool,
    deleted: bool,
}

/// Default XDG-rooted directory for on-disk index persistence (§6's "XDG runtime path"),
/// resolved the way the rest of this crate's corpus resolves default data directories.
/// Overridable per call via [`Index::open`] and [`Index::new`]'s `base_dir` argument.
pub fn default_base_dir() -> PathBuf {
    dirs::data_local_dir().unwrap_or_else(std::env::temp_dir).join("imgutil").join("indexes")
}

impl Index<OciClientTransport> {
    /// Build an index over the default `oci-client`-backed registry transport,
    /// anonymous auth. Attach a different transport with [`Index::with_transport`].
    pub fn new_default(name: impl Into<String>, base_dir: impl Into<PathBuf>, docker_format: bool) -> Self {
        Self::new(name, base_dir, docker_format).with_transport(OciClientTransport::anonymous())
    }
}

impl<T: RegistryTransport> Index<T> {
    /// A brand-new index, with an empty manifest already built (dirty: a fresh index needs
    /// `save` before `push`/`inspect` will accept it).
    pub fn new(name: impl Into<String>, base_dir: impl Into<PathBuf>, docker_format: bool) -> Self {
        Self {
            transport: None,
            base_dir: base_dir.into(),
            name: name.into(),
            docker_format,
            manifest: Some(IndexManifest::new(docker_format)),
            overlays: HashMap::new(),
            child_images: HashMap::new(),
            dirty: true,
            deleted: false,
        }
    }

    /// Open a previously-saved index from `base_dir`. If none was ever saved under `name`,
    /// the engine starts with no manifest built (`Inspect`/`Push` will fail
    /// `ManifestUndefined` until the first `Add`).
    pub fn open(name: impl Into<String>, base_dir: impl Into<PathBuf>, docker_format: bool) -> Result<Self> {
        let name = name.into();
        let base_dir = base_dir.into();
        let path = base_dir.join(&name).join("index.json");
        let manifest = if path.exists() {
            Some(serde_json::from_slice(&std::fs::read(&path)?)?)
        } else {
            None
        };
        Ok(Self {
            transport: None,
            base_dir,
            name,
            docker_format,
            manifest,
            overlays: HashMap::new(),
            child_images: HashMap::new(),
            dirty: false,
            deleted: false,
        })
    }

    /// Attach a registry transport, used by [`Index::add`] (for [`AddTarget::Reference`])
    /// and [`Index::push`].
    pub fn with_transport(mut self, transport: T) -> Self {
        self.transport = Some(transport);
        self
    }

    /// True if the underlying manifest uses the Docker manifest-list media type.
    pub fn is_docker_format(&self) -> bool {
        self.manifest.as_ref().map_or(self.docker_format, IndexManifest::is_docker_format)
    }

    /// True if this engine has unsaved mutations (`Push`/`Inspect` refuse while dirty).
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn guard_deleted(&self) -> Result<()> {
        if self.deleted { Err(Error::IndexDeleted) } else { Ok(()) }
    }

    fn descriptor(&self, digest: &Digest) -> Option<&Descriptor> {
        self.manifest.as_ref()?.manifests.iter().find(|d| &d.digest == digest)
    }

    // --- getters (§4.6) -----------------------------------------------------------------

    /// The OS of the descriptor's platform.
    pub fn os(&self, digest: &Digest) -> Result<String> {
        self.guard_deleted()?;
        if let Some(v) = self.overlays.get(digest).and_then(|o| o.os.clone()) {
            return Ok(v);
        }
        self.descriptor(digest)
            .and_then(|d| d.platform.as_ref())
            .map(|p| p.os.clone())
            .ok_or(Error::Undefined(Field::Os))
    }

    /// The architecture of the descriptor's platform.
    pub fn architecture(&self, digest: &Digest) -> Result<String> {
        self.guard_deleted()?;
        if let Some(v) = self.overlays.get(digest).and_then(|o| o.architecture.clone()) {
            return Ok(v);
        }
        self.descriptor(digest)
            .and_then(|d| d.platform.as_ref())
            .map(|p| p.architecture.clone())
            .ok_or(Error::Undefined(Field::Architecture))
    }

    /// The CPU variant of the descriptor's platform.
    pub fn variant(&self, digest: &Digest) -> Result<String> {
        self.guard_deleted()?;
        if let Some(v) = self.overlays.get(digest).and_then(|o| o.variant.clone()) {
            return Ok(v);
        }
        self.descriptor(digest)
            .and_then(|d| d.platform.as_ref())
            .and_then(|p| p.variant.clone())
            .ok_or(Error::Undefined(Field::Variant))
    }

    /// The OS version of the descriptor's platform.
    pub fn os_version(&self, digest: &Digest) -> Result<String> {
        self.guard_deleted()?;
        if let Some(v) = self.overlays.get(digest).and_then(|o| o.os_version.clone()) {
            return Ok(v);
        }
        self.descriptor(digest)
            .and_then(|d| d.platform.as_ref())
            .and_then(|p| p.os_version.clone())
            .ok_or(Error::Undefined(Field::OsVersion))
    }

    /// The Docker manifest-list `features` list of the descriptor's platform.
    pub fn features(&self, digest: &Digest) -> Result<Vec<String>> {
        self.guard_deleted()?;
        if let Some(v) = self.overlays.get(digest).and_then(|o| o.features.clone()) {
            return Ok(v);
        }
        self.descriptor(digest)
            .and_then(|d| d.platform.as_ref())
            .and_then(|p| p.features.clone())
            .ok_or(Error::Undefined(Field::Features))
    }

    /// The mandatory OS features of the descriptor's platform.
    pub fn os_features(&self, digest: &Digest) -> Result<Vec<String>> {
        self.guard_deleted()?;
        if let Some(v) = self.overlays.get(digest).and_then(|o| o.os_features.clone()) {
            return Ok(v);
        }
        self.descriptor(digest)
            .and_then(|d| d.platform.as_ref())
            .and_then(|p| p.os_features.clone())
            .ok_or(Error::Undefined(Field::OsFeatures))
    }

    /// The descriptor's annotations. Always an empty mapping on a Docker-format index,
    /// never an error, per §4.6's invariant — Docker-format lists carry no per-descriptor
    /// annotations at all.
    pub fn annotations(&self, digest: &Digest) -> Result<Annotations> {
        self.guard_deleted()?;
        if self.is_docker_format() {
            return Ok(Annotations::new());
        }
        if let Some(v) = self.overlays.get(digest).and_then(|o| o.annotations.clone()) {
            return Ok(v);
        }
        self.descriptor(digest).and_then(|d| d.annotations.clone()).ok_or(Error::Undefined(Field::Annotations))
    }

    /// The descriptor's alternate download URLs.
    pub fn urls(&self, digest: &Digest) -> Result<Vec<String>> {
        self.guard_deleted()?;
        if let Some(v) = self.overlays.get(digest).and_then(|o| o.urls.clone()) {
            return Ok(v);
        }
        self.descriptor(digest).and_then(|d| d.urls.clone()).ok_or(Error::Undefined(Field::Urls))
    }

    // --- setters (§4.6) -----------------------------------------------------------------

    /// Override the descriptor's OS, folded in on the next `save`/`push`.
    pub fn set_os(&mut self, digest: &Digest, os: impl Into<String>) -> Result<()> {
        self.guard_deleted()?;
        self.overlays.entry(digest.clone()).or_default().os = Some(os.into());
        self.dirty = true;
        Ok(())
    }

    /// Override the descriptor's architecture.
    pub fn set_architecture(&mut self, digest: &Digest, arch: impl Into<String>) -> Result<()> {
        self.guard_deleted()?;
        self.overlays.entry(digest.clone()).or_default().architecture = Some(arch.into());
        self.dirty = true;
        Ok(())
    }

    /// Override the descriptor's CPU variant.
    pub fn set_variant(&mut self, digest: &Digest, variant: impl Into<String>) -> Result<()> {
        self.guard_deleted()?;
        self.overlays.entry(digest.clone()).or_default().variant = Some(variant.into());
        self.dirty = true;
        Ok(())
    }

    /// Override the descriptor's OS version.
    pub fn set_os_version(&mut self, digest: &Digest, version: impl Into<String>) -> Result<()> {
        self.guard_deleted()?;
        self.overlays.entry(digest.clone()).or_default().os_version = Some(version.into());
        self.dirty = true;
        Ok(())
    }

    /// Override the descriptor's Docker manifest-list `features` list.
    pub fn set_features(&mut self, digest: &Digest, features: Vec<String>) -> Result<()> {
        self.guard_deleted()?;
        self.overlays.entry(digest.clone()).or_default().features = Some(features);
        self.dirty = true;
        Ok(())
    }

    /// Override the descriptor's mandatory OS features.
    pub fn set_os_features(&mut self, digest: &Digest, features: Vec<String>) -> Result<()> {
        self.guard_deleted()?;
        self.overlays.entry(digest.clone()).or_default().os_features = Some(features);
        self.dirty = true;
        Ok(())
    }

    /// Override the descriptor's annotations. Recorded even on a Docker-format index, but
    /// never folded in or surfaced by the getter there (§4.6's invariant).
    pub fn set_annotations(&mut self, digest: &Digest, annotations: Annotations) -> Result<()> {
        self.guard_deleted()?;
        self.overlays.entry(digest.clone()).or_default().annotations = Some(annotations);
        self.dirty = true;
        Ok(())
    }

    /// Override the descriptor's alternate download URLs.
    pub fn set_urls(&mut self, digest: &Digest, urls: Vec<String>) -> Result<()> {
        self.guard_deleted()?;
        self.overlays.entry(digest.clone()).or_default().urls = Some(urls);
        self.dirty = true;
        Ok(())
    }

    // --- membership ----------------------------------------------------------------------

    /// Append a child per §4.6's `Add` table. Returns the digest(s) appended.
    #[instrument(skip(self, target), fields(index = %self.name))]
    pub async fn add(&mut self, target: AddTarget, opts: AddOptions) -> Result<Vec<Digest>> {
        self.guard_deleted()?;
        self.ensure_manifest_exists();
        match target {
            AddTarget::Image(image) => Ok(vec![self.append_local_image(*image)?]),
            AddTarget::Reference(reference) => self.add_reference(&reference, opts).await,
        }
    }

    fn ensure_manifest_exists(&mut self) {
        if self.manifest.is_none() {
            self.manifest = Some(IndexManifest::new(self.docker_format));
        }
    }

    fn push_descriptor(&mut self, descriptor: Descriptor) {
        let manifest = self.manifest.as_mut().expect("ensure_manifest_exists called by add()");
        manifest.manifests.retain(|d| d.digest != descriptor.digest);
        manifest.manifests.push(descriptor);
        self.dirty = true;
    }

    fn apply_platform_overlay(&mut self, digest: &Digest, query: &PlatformQuery) {
        let overlay = self.overlays.entry(digest.clone()).or_default();
        if let Some(v) = &query.os {
            overlay.os = Some(v.clone());
        }
        if let Some(v) = &query.architecture {
            overlay.architecture = Some(v.clone());
        }
        if let Some(v) = &query.variant {
            overlay.variant = Some(v.clone());
        }
        if let Some(v) = &query.os_version {
            overlay.os_version = Some(v.clone());
        }
        if let Some(v) = &query.features {
            overlay.features = Some(v.clone());
        }
        if let Some(v) = &query.os_features {
            overlay.os_features = Some(v.clone());
        }
    }

    /// `Local=true`: append an in-process image's manifest by reference, computing its
    /// digest and platform from the image's own config without contacting any backend.
    fn append_local_image(&mut self, image: Image) -> Result<Digest> {
        let (manifest, digest, size) = build_child_manifest(&image)?;
        let media_type = manifest.media_type.clone().unwrap_or_else(|| ManifestMediaType::OciManifest.as_str().to_owned());
        let mut descriptor = Descriptor::new(media_type, digest.clone(), size);
        descriptor.platform = Some(Platform {
            os: image.config().os.clone(),
            architecture: image.config().architecture.clone(),
            os_version: image.config().os_version.clone(),
            os_features: image.config().os_features.clone(),
            variant: image.config().variant.clone(),
            features: None,
        });
        self.push_descriptor(descriptor);
        self.child_images.insert(digest.clone(), image);
        Ok(digest)
    }

    /// Resolve `reference` against the attached transport and append per the `all`/
    /// `platform` option table.
    async fn add_reference(&mut self, reference_str: &str, opts: AddOptions) -> Result<Vec<Digest>> {
        let transport = self.transport.as_ref().ok_or_else(no_transport)?;
        let reference = Reference::parse(reference_str)?;
        let (bytes, media_type) = transport.get_manifest(&reference).await?;
        let mt = ManifestMediaType::parse(&media_type);

        if mt.is_some_and(ManifestMediaType::is_index) {
            let remote_index: IndexManifest = serde_json::from_slice(&bytes)?;

            if opts.all {
                let mut appended = Vec::with_capacity(remote_index.manifests.len());
                for d in &remote_index.manifests {
                    appended.push(d.digest.clone());
                    self.push_descriptor(d.clone());
                }
                debug!(count = appended.len(), "appended every child of remote index");
                return Ok(appended);
            }

            let query = if opts.platform.is_empty() {
                let host = Platform::host();
                PlatformQuery {
                    os: Some(host.os),
                    architecture: Some(host.architecture),
                    ..PlatformQuery::default()
                }
            } else {
                opts.platform.clone()
            };
            // Resolved open question: first match in manifest order, not "most specific".
            let chosen = remote_index
                .manifests
                .iter()
                .find(|d| d.platform.as_ref().is_some_and(|p| p.matches(&query)))
                .cloned()
                .ok_or_else(|| Error::NotFound { target: reference_str.to_owned() })?;
            let digest = chosen.digest.clone();
            self.push_descriptor(chosen);
            if !opts.platform.is_empty() {
                self.apply_platform_overlay(&digest, &opts.platform);
            }
            return Ok(vec![digest]);
        }

        // Single image.
        let manifest: ImageManifest = serde_json::from_slice(&bytes)?;
        let manifest_digest = Digest::sha256(&bytes);
        let mut descriptor = Descriptor::new(media_type, manifest_digest.clone(), bytes.len() as i64);
        if opts.platform.is_empty() {
            let config_bytes = transport.get_blob(&reference.repository, &manifest.config.digest).await?;
            let config: crate::config::Config = serde_json::from_slice(&config_bytes)?;
            descriptor.platform = Some(Platform {
                os: config.os,
                architecture: config.architecture,
                variant: config.variant,
                os_version: config.os_version,
                os_features: config.os_features,
                features: None,
            });
        } else {
            descriptor.platform = Some(Platform {
                os: opts.platform.os.clone().unwrap_or_default(),
                architecture: opts.platform.architecture.clone().unwrap_or_default(),
                variant: opts.platform.variant.clone(),
                os_version: opts.platform.os_version.clone(),
                os_features: opts.platform.os_features.clone(),
                features: opts.platform.features.clone(),
            });
        }
        self.push_descriptor(descriptor);
        Ok(vec![manifest_digest])
    }

    /// Remove a descriptor and any side-table state attached to it.
    pub fn remove(&mut self, digest: &Digest) -> Result<()> {
        self.guard_deleted()?;
        let manifest = self.manifest.as_mut().ok_or(Error::ManifestUndefined)?;
        manifest.manifests.retain(|d| &d.digest != digest);
        self.overlays.remove(digest);
        self.child_images.remove(digest);
        self.dirty = true;
        Ok(())
    }

    /// Fold every pending overlay into a copy of the underlying manifest, leaving `self`
    /// untouched. Annotation overlays are dropped on a Docker-format manifest, which never
    /// carries per-descriptor annotations on the wire.
    fn fold_overlays(&self) -> IndexManifest {
        let mut manifest = self.manifest.clone().unwrap_or_else(|| IndexManifest::new(self.docker_format));
        let docker_format = manifest.is_docker_format();
        for d in &mut manifest.manifests {
            let Some(overlay) = self.overlays.get(&d.digest) else { continue };
            if overlay.os.is_some()
                || overlay.architecture.is_some()
                || overlay.variant.is_some()
                || overlay.os_version.is_some()
                || overlay.os_features.is_some()
                || overlay.features.is_some()
            {
                let platform = d.platform.get_or_insert_with(Platform::default);
                if let Some(v) = &overlay.os {
                    platform.os = v.clone();
                }
                if let Some(v) = &overlay.architecture {
                    platform.architecture = v.clone();
                }
                if let Some(v) = overlay.variant.clone() {
                    platform.variant = Some(v);
                }
                if let Some(v) = overlay.os_version.clone() {
                    platform.os_version = Some(v);
                }
                if let Some(v) = overlay.os_features.clone() {
                    platform.os_features = Some(v);
                }
                if let Some(v) = overlay.features.clone() {
                    platform.features = Some(v);
                }
            }
            if !docker_format {
                if let Some(v) = overlay.annotations.clone() {
                    d.annotations = Some(v);
                }
            }
            if let Some(v) = overlay.urls.clone() {
                d.urls = Some(v);
            }
        }
        manifest
    }

    // --- persistence (§4.6 Save/Push/Inspect/Delete) --------------------------------------

    /// Write the manifest list plus any freshly-added local children's manifests/blobs to
    /// `base_dir/name`, folding pending overlays in. Clears the dirty flag.
    #[instrument(skip(self), fields(index = %self.name))]
    pub async fn save(&mut self) -> Result<()> {
        self.guard_deleted()?;
        let manifest = self.fold_overlays();
        let root = self.base_dir.join(&self.name);
        ensure_layout_marker_at(&root)?;

        for image in self.child_images.values() {
            let (child_manifest, _digest, _size) = build_child_manifest(image)?;
            write_child_blobs(&root, &child_manifest, image)?;
        }

        crate::backend::layout::atomic_write(&root.join("index.json"), serde_json::to_vec_pretty(&manifest)?.as_slice())?;

        self.manifest = Some(manifest);
        self.overlays.clear();
        self.dirty = false;
        Ok(())
    }

    /// Upload any freshly-added local children's blobs/manifests the registry doesn't
    /// already have, then PUT the list under every requested tag. Refuses on a dirty
    /// engine (§4.6 invariant).
    #[instrument(skip(self, opts), fields(index = %self.name))]
    pub async fn push(&mut self, opts: PushOptions) -> Result<()> {
        self.guard_deleted()?;
        if self.dirty {
            return Err(Error::IndexUnsaved);
        }
        if opts.insecure {
            warn!("insecure push requested; transport must already be configured for plain HTTP");
        }
        let transport = self.transport.as_ref().ok_or_else(no_transport)?;
        let manifest = self.manifest.clone().ok_or(Error::ManifestUndefined)?;
        let repository = Reference::parse(&self.name)?.repository;

        for image in self.child_images.values() {
            let (child_manifest, _digest, _size) = build_child_manifest(image)?;
            upload_child(transport, &repository, &child_manifest, image).await?;
        }

        let manifest_bytes = serde_json::to_vec(&manifest)?;
        let media_type = manifest.media_type.clone().unwrap_or_default();
        let mut targets = opts.names.clone();
        if targets.is_empty() {
            targets.push(self.name.clone());
        }
        for target in &targets {
            let target_ref = Reference::parse(target)?;
            transport.put_manifest(&target_ref, &media_type, manifest_bytes.clone()).await?;
        }

        if opts.purge {
            self.remove_on_disk()?;
        }
        Ok(())
    }

    /// Serialize the manifest list as indented JSON. Fails `IndexUnsaved` if dirty (so the
    /// JSON always matches what a push would send) and `ManifestUndefined` if no manifest
    /// has been built yet.
    pub fn inspect(&self) -> Result<String> {
        self.guard_deleted()?;
        if self.dirty {
            return Err(Error::IndexUnsaved);
        }
        let manifest = self.manifest.as_ref().ok_or(Error::ManifestUndefined)?;
        Ok(serde_json::to_string_pretty(manifest)?)
    }

    /// Remove the on-disk copy and tombstone this engine; every subsequent operation fails
    /// `IndexDeleted`.
    pub fn delete(&mut self) -> Result<()> {
        self.guard_deleted()?;
        self.remove_on_disk()?;
        self.deleted = true;
        Ok(())
    }

    fn remove_on_disk(&self) -> Result<()> {
        let root = self.base_dir.join(&self.name);
        if root.exists() {
            std::fs::remove_dir_all(&root)?;
        }
        Ok(())
    }
}

fn no_transport() -> Error {
    Error::Registry(Box::new(std::io::Error::other("no registry transport attached to this index")))
}

/// Build the manifest an in-process [`Image`] would publish under, without touching any
/// backend: the same blob-digest-from-bytes approach the registry and layout backends use
/// for on-disk layers (§9 reuses this for `Add(Local=true)` and `Index::save`/`push`).
fn build_child_manifest(image: &Image) -> Result<(ImageManifest, Digest, i64)> {
    let prefer_docker = image.prefer_docker_media_types();
    let mut layer_descriptors = Vec::with_capacity(image.layers().len());
    for layer in image.layers() {
        let (digest, size) = match &layer.source {
            LayerSource::OnDisk(path) => {
                let data = std::fs::read(path)?;
                let digest = layer.digest.clone().unwrap_or_else(|| Digest::sha256(&data));
                (digest, data.len() as i64)
            }
            _ => {
                let digest = layer.digest.clone().ok_or_else(|| Error::LayerNotFound(layer.diff_id.to_string()))?;
                (digest, layer.size)
            }
        };
        layer_descriptors.push(Descriptor::new(layer.media_type.wire_str(prefer_docker), digest, size));
    }

    let config = image.materialize_config();
    let config_bytes = serde_json::to_vec(&config)?;
    let config_digest = Digest::sha256(&config_bytes);

    let manifest = ImageManifest {
        schema_version: 2,
        media_type: Some(
            if prefer_docker { ManifestMediaType::DockerManifest } else { ManifestMediaType::OciManifest }
                .as_str()
                .to_owned(),
        ),
        config: Descriptor::new(
            if prefer_docker { ManifestMediaType::DockerConfig } else { ManifestMediaType::OciConfig }.as_str(),
            config_digest,
            config_bytes.len() as i64,
        ),
        layers: layer_descriptors,
        annotations: None,
    };
    let manifest_bytes = serde_json::to_vec(&manifest)?;
    let digest = Digest::sha256(&manifest_bytes);
    Ok((manifest, digest, manifest_bytes.len() as i64))
}

/// Write a locally-added child's layer/config/manifest blobs under `root`'s `blobs/` tree.
fn write_child_blobs(root: &std::path::Path, manifest: &ImageManifest, image: &Image) -> Result<()> {
    for (layer, descriptor) in image.layers().iter().zip(&manifest.layers) {
        if let LayerSource::OnDisk(path) = &layer.source {
            let data = std::fs::read(path)?;
            write_blob_if_absent_at(root, &descriptor.digest, &data)?;
        }
    }
    let config = image.materialize_config();
    let config_bytes = serde_json::to_vec(&config)?;
    write_blob_if_absent_at(root, &manifest.config.digest, &config_bytes)?;
    let manifest_bytes = serde_json::to_vec(manifest)?;
    let manifest_digest = Digest::sha256(&manifest_bytes);
    write_blob_if_absent_at(root, &manifest_digest, &manifest_bytes)?;
    Ok(())
}

/// Upload a locally-added child's blobs/manifest to the registry if it doesn't already
/// have them, ahead of the list PUT that references it.
async fn upload_child<T: RegistryTransport>(
    transport: &T,
    repository: &str,
    manifest: &ImageManifest,
    image: &Image,
) -> Result<()> {
    for layer in image.layers() {
        if let LayerSource::OnDisk(path) = &layer.source {
            let data = std::fs::read(path)?;
            let digest = layer.digest.clone().unwrap_or_else(|| Digest::sha256(&data));
            if !transport.has_blob(repository, &digest).await? {
                transport.put_blob(repository, data).await?;
            }
        }
    }
    let config = image.materialize_config();
    let config_bytes = serde_json::to_vec(&config)?;
    if !transport.has_blob(repository, &manifest.config.digest).await? {
        transport.put_blob(repository, config_bytes).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::Mutex;

    use super::{AddOptions, AddTarget, Index, PushOptions};
    use crate::digest::Digest;
    use crate::error::Error;
    use crate::image::Image;

    fn make_tar(dir: &std::path::Path, name: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        let file = std::fs::File::create(&path).expect("create");
        let mut builder = tar::Builder::new(file);
        let mut header = tar::Header::new_gnu();
        header.set_size(3);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, "f", &b"abc"[..]).expect("append");
        builder.finish().expect("finish");
        path
    }

    fn one_layer_image(scratch: &std::path::Path, os: &str) -> Image {
        let mut image = Image::empty();
        image.add_layer(&make_tar(scratch, "layer.tar")).expect("add layer");
        image.set_os(os).expect("set os");
        image.set_architecture("amd64");
        image
    }

    /// Concrete scenario 5: NewIndex(oci-format, 1 child, 1 layer), `SetOS(d, "some-os")`
    /// then `OS(d) == "some-os"`; after `Save; Reopen`, the child descriptor's platform OS
    /// still equals the set value.
    #[tokio::test]
    async fn scenario_5_set_os_round_trips_through_save_and_reopen() {
        let scratch = tempfile::tempdir().expect("scratch");
        let base_dir = tempfile::tempdir().expect("base dir");
        let image = one_layer_image(scratch.path(), "linux");

        let mut index = Index::<crate::backend::registry::OciClientTransport>::new("myindex", base_dir.path(), false);
        let digests = index.add(AddTarget::Image(Box::new(image)), AddOptions::default()).await.expect("add");
        let digest = digests[0].clone();

        index.set_os(&digest, "some-os").expect("set os");
        assert_eq!(index.os(&digest).expect("get os"), "some-os");

        index.save().await.expect("save");
        assert!(!index.is_dirty());

        let reopened =
            Index::<crate::backend::registry::OciClientTransport>::open("myindex", base_dir.path(), false).expect("reopen");
        assert_eq!(reopened.os(&digest).expect("get os after reopen"), "some-os");
    }

    #[test]
    fn annotations_on_docker_format_index_is_always_empty_ok() {
        let base_dir = tempfile::tempdir().expect("base dir");
        let index = Index::<crate::backend::registry::OciClientTransport>::new("dockerlist", base_dir.path(), true);
        let digest = Digest::sha256(b"nonexistent");
        let annotations = index.annotations(&digest).expect("never errors on docker format");
        assert!(annotations.is_empty());
    }

    #[tokio::test]
    async fn every_getter_and_setter_fails_after_delete() {
        let base_dir = tempfile::tempdir().expect("base dir");
        let mut index = Index::<crate::backend::registry::OciClientTransport>::new("todelete", base_dir.path(), false);
        index.save().await.expect("save");
        index.delete().expect("first delete succeeds");

        let digest = Digest::sha256(b"x");
        assert!(matches!(index.os(&digest), Err(Error::IndexDeleted)));
        assert!(matches!(index.set_os(&digest, "linux"), Err(Error::IndexDeleted)));
        assert!(matches!(index.remove(&digest), Err(Error::IndexDeleted)));
        let err = index.delete().expect_err("second delete fails");
        assert!(matches!(err, Error::IndexDeleted));
    }

    #[tokio::test]
    async fn push_refuses_on_dirty_engine() {
        let base_dir = tempfile::tempdir().expect("base dir");
        let scratch = tempfile::tempdir().expect("scratch");
        let mut index = Index::new_default("dirty", base_dir.path(), false);
        let image = one_layer_image(scratch.path(), "linux");
        index.add(AddTarget::Image(Box::new(image)), AddOptions::default()).await.expect("add");

        let err = index.push(PushOptions::default()).await.expect_err("must fail while dirty");
        assert!(matches!(err, Error::IndexUnsaved));
    }

    #[test]
    fn inspect_fails_manifest_undefined_when_never_built() {
        let base_dir = tempfile::tempdir().expect("base dir");
        let index =
            Index::<crate::backend::registry::OciClientTransport>::open("neverexisted", base_dir.path(), false).expect("open");
        let err = index.inspect().expect_err("must fail");
        assert!(matches!(err, Error::ManifestUndefined));
    }

    /// In-memory [`crate::backend::registry::RegistryTransport`] fixture, matching the
    /// "test helpers and registry fixtures" the spec marks out of scope for the transport
    /// itself but in scope for the trait it implements.
    #[derive(Debug, Default)]
    struct FakeRegistryTransport {
        blobs: Mutex<std::collections::HashMap<String, Vec<u8>>>,
        manifests: Mutex<std::collections::HashMap<String, (Vec<u8>, String)>>,
    }

    impl crate::backend::registry::RegistryTransport for FakeRegistryTransport {
        async fn get_manifest(&self, reference: &crate::reference::Reference) -> crate::error::Result<(Vec<u8>, String)> {
            self.manifests
                .lock()
                .unwrap()
                .get(&reference.to_name_string())
                .cloned()
                .ok_or_else(|| Error::NotFound { target: reference.to_name_string() })
        }

        async fn get_blob(&self, _repository: &str, digest: &Digest) -> crate::error::Result<Vec<u8>> {
            self.blobs
                .lock()
                .unwrap()
                .get(digest.as_str())
                .cloned()
                .ok_or_else(|| Error::NotFound { target: digest.to_string() })
        }

        async fn has_blob(&self, _repository: &str, digest: &Digest) -> crate::error::Result<bool> {
            Ok(self.blobs.lock().unwrap().contains_key(digest.as_str()))
        }

        async fn put_blob(&self, _repository: &str, data: Vec<u8>) -> crate::error::Result<Digest> {
            let digest = Digest::sha256(&data);
            self.blobs.lock().unwrap().insert(digest.as_str().to_owned(), data);
            Ok(digest)
        }

        async fn put_manifest(
            &self,
            reference: &crate::reference::Reference,
            media_type: &str,
            data: Vec<u8>,
        ) -> crate::error::Result<()> {
            self.manifests
                .lock()
                .unwrap()
                .insert(reference.to_name_string(), (data, media_type.to_owned()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn push_uploads_local_child_then_puts_list() {
        let base_dir = tempfile::tempdir().expect("base dir");
        let scratch = tempfile::tempdir().expect("scratch");
        let transport = FakeRegistryTransport::default();
        let mut index = Index::new("repo", base_dir.path(), false).with_transport(transport);

        let image = one_layer_image(scratch.path(), "linux");
        index.add(AddTarget::Image(Box::new(image)), AddOptions::default()).await.expect("add");
        index.save().await.expect("save");
        index.push(PushOptions::default()).await.expect("push");
    }
}
