//! The backend-neutral image core: mutable configuration plus an ordered layer stack.

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::config::{Config, Healthcheck, History};
use crate::digest::Digest;
use crate::error::{Error, Result};
use crate::layer::{Layer, LayerSource, MediaType, OnceGuard};

/// Materializes every lazily-sourced layer belonging to one backing image (a base image
/// pulled from a registry or exported from a daemon) onto local disk, in one shot.
///
/// Implemented by the owning backend (`registry`, `daemon`) and handed to an [`Image`] so
/// `get_layer` can fulfil the "always returns bytes" contract without the core itself
/// knowing how to authenticate or speak the backend's wire protocol.
pub trait LayerFetcher: std::fmt::Debug + Send + Sync {
    /// Fetch and extract every layer for this fetcher's backing image, returning a
    /// diffID -> local path map for every layer it produced.
    fn materialize_all(
        &self,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<HashMap<Digest, PathBuf>>> + Send + '_>>;
}

/// The backend-neutral working state of one image: a mutable [`Config`], an ordered
/// [`Layer`] stack, and bookkeeping for layer reuse and lazy materialization.
///
/// Setters mutate in-memory state only; nothing is published until [`Image::save`] (or the
/// equivalent on whichever backend opened this core) is called.
#[derive(Debug)]
pub struct Image {
    config: Config,
    layers: Vec<Layer>,
    /// diffID -> layer, populated from the previous image when one was opened, consulted by
    /// `reuse_layer`.
    previous_layers: HashMap<Digest, Layer>,
    preserve_history: bool,
    created_at_override: Option<String>,
    /// Set when this core was loaded from (or is destined for) a Docker-media-type source;
    /// `None` means no preference was observed, so OCI is used by default.
    prefer_docker_media_types: Option<bool>,
    found: bool,
    identifier: Option<String>,
    name: Option<String>,
    /// Cached daemon platform, populated only when this core was opened via the daemon
    /// backend. `set_os` checks against it without contacting the backend.
    daemon_os: Option<String>,
    /// Shared per-core guard for "materialize every borrowed layer" (§5).
    once_guard: OnceGuard,
    /// Backend-provided materializer for this core's lazy layers, if any were opened lazily.
    fetcher: Option<Arc<dyn LayerFetcher>>,
    /// Populated by `fetcher.materialize_all()` the first time `get_layer` needs it.
    materialized: Mutex<HashMap<Digest, PathBuf>>,
}

impl Image {
    /// A brand-new, empty image core: no layers, default config, `found = false`.
    pub fn empty() -> Self {
        Self {
            config: Config::default(),
            layers: Vec::new(),
            previous_layers: HashMap::new(),
            preserve_history: false,
            created_at_override: None,
            prefer_docker_media_types: None,
            found: false,
            identifier: None,
            name: None,
            daemon_os: None,
            once_guard: OnceGuard::default(),
            fetcher: None,
            materialized: Mutex::new(HashMap::new()),
        }
    }

    /// Construct a core already populated from a backend's `Open`: a base config, its
    /// layers (possibly lazy), and the previous-image diffID map used by `reuse_layer`.
    pub fn from_base(
        config: Config,
        layers: Vec<Layer>,
        name: impl Into<String>,
        identifier: impl Into<String>,
        prefer_docker: bool,
    ) -> Self {
        let previous_layers = layers
            .iter()
            .map(|l| (l.diff_id.clone(), l.clone()))
            .collect();
        Self {
            config,
            layers,
            previous_layers,
            preserve_history: false,
            created_at_override: None,
            prefer_docker_media_types: Some(prefer_docker),
            found: true,
            identifier: Some(identifier.into()),
            name: Some(name.into()),
            daemon_os: None,
            once_guard: OnceGuard::default(),
            fetcher: None,
            materialized: Mutex::new(HashMap::new()),
        }
    }

    /// Attach the backend's materializer for this core's lazily-sourced layers.
    pub fn set_layer_fetcher(&mut self, fetcher: Arc<dyn LayerFetcher>) {
        self.fetcher = Some(fetcher);
    }

    /// Record the daemon's reported OS so that `set_os` can enforce §4.1's daemon check
    /// without a network round trip. Called by the daemon backend after `Open`/resolve.
    pub fn bind_daemon_os(&mut self, os: impl Into<String>) {
        self.daemon_os = Some(os.into());
    }

    // --- observational -----------------------------------------------------------------

    /// True if this core was loaded from an existing backend artifact (vs. created empty).
    pub fn found(&self) -> bool {
        self.found
    }

    /// The backend-assigned identifier, if this core has been saved or was opened from one.
    pub fn identifier(&self) -> Option<&str> {
        self.identifier.as_deref()
    }

    /// The name this core is known by.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Rename this core's primary name. Pure in-memory rebind; does not touch the backend.
    pub fn rename(&mut self, name: impl Into<String>) {
        self.name = Some(name.into());
    }

    /// diffID of the last layer, or the empty sentinel if there are no layers.
    pub fn top_layer(&self) -> Digest {
        self.layers
            .last()
            .map(|l| l.diff_id.clone())
            .unwrap_or_else(Digest::empty)
    }

    /// Read-only view of the layer stack, bottom to top.
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// Read-only view of the current configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Whether a Docker-format media-type preference was recorded (`None` = default OCI).
    pub fn prefer_docker_media_types(&self) -> bool {
        self.prefer_docker_media_types.unwrap_or(false)
    }

    /// Override the media-type preference recorded on this core (forced, not observed).
    pub fn set_prefer_docker_media_types(&mut self, prefer: bool) {
        self.prefer_docker_media_types = Some(prefer);
    }

    // --- config setters ------------------------------------------------------------------

    /// Set (or replace) a label.
    pub fn set_label(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.config.labels.insert(key.into(), value.into());
    }

    /// Remove a label, if present.
    pub fn remove_label(&mut self, key: &str) {
        self.config.labels.remove(key);
    }

    /// Set (or replace) an environment variable, preserving insertion order overall.
    pub fn set_env(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.config.env.insert(key.into(), value.into());
    }

    /// Replace the entrypoint.
    pub fn set_entrypoint(&mut self, args: Vec<String>) {
        self.config.entrypoint = args;
    }

    /// Replace the default command.
    pub fn set_cmd(&mut self, args: Vec<String>) {
        self.config.cmd = args;
    }

    /// Replace the working directory.
    pub fn set_working_dir(&mut self, dir: impl Into<String>) {
        self.config.working_dir = Some(dir.into());
    }

    /// Replace the default user.
    pub fn set_user(&mut self, user: impl Into<String>) {
        self.config.user = Some(user.into());
    }

    /// Replace the stop signal.
    pub fn set_stop_signal(&mut self, signal: impl Into<String>) {
        self.config.stop_signal = Some(signal.into());
    }

    /// Replace the default shell.
    pub fn set_shell(&mut self, shell: Vec<String>) {
        self.config.shell = shell;
    }

    /// Set the OS. Fails `InvalidOsForDaemon` if this core is bound to a daemon backend
    /// whose platform disagrees (§4.1, §8 scenario 6).
    pub fn set_os(&mut self, os: impl Into<String>) -> Result<()> {
        let os = os.into();
        if let Some(daemon_os) = &self.daemon_os {
            if daemon_os != &os {
                return Err(Error::InvalidOsForDaemon {
                    daemon_os: daemon_os.clone(),
                    requested: os,
                });
            }
        }
        self.config.os = os;
        Ok(())
    }

    /// Replace the OS version.
    pub fn set_os_version(&mut self, version: impl Into<String>) {
        self.config.os_version = Some(version.into());
    }

    /// Replace the architecture.
    pub fn set_architecture(&mut self, arch: impl Into<String>) {
        self.config.architecture = arch.into();
    }

    /// Replace the CPU variant.
    pub fn set_variant(&mut self, variant: impl Into<String>) {
        self.config.variant = Some(variant.into());
    }

    /// Replace the OS feature list.
    pub fn set_os_features(&mut self, features: Vec<String>) {
        self.config.os_features = Some(features);
    }

    /// Replace the healthcheck.
    pub fn set_healthcheck(&mut self, healthcheck: Healthcheck) {
        self.config.healthcheck = Some(healthcheck);
    }

    /// Override `Config.created`, computed at save rather than immediately.
    pub fn set_created_at(&mut self, timestamp: impl Into<String>) {
        self.created_at_override = Some(timestamp.into());
    }

    /// Replace the history list outright. The non-empty-entry-count/diffID-count alignment
    /// rule is only enforced at save.
    pub fn set_history(&mut self, history: Vec<History>) {
        self.config.history = history;
    }

    /// Keep the caller-set history verbatim at save instead of normalizing it.
    pub fn set_preserve_history(&mut self, preserve: bool) {
        self.preserve_history = preserve;
    }

    // --- layers ----------------------------------------------------------------------------

    /// Add a layer from an on-disk tar, hashing it to compute the diffID, and append a
    /// matching blank history entry.
    pub fn add_layer(&mut self, path: &Path) -> Result<()> {
        self.add_layer_with_media_type(path, self.default_layer_media_type())
    }

    /// As [`Image::add_layer`] but with an explicit media type. For a Windows-OS image the
    /// tar is first run through the §4.7 writer and the media type is forced to
    /// `MediaType::WindowsLayer`, regardless of what was requested.
    pub fn add_layer_with_media_type(&mut self, path: &Path, media_type: MediaType) -> Result<()> {
        let (path, media_type) = self.rewrite_for_windows_if_needed(path, media_type)?;
        let layer = Layer::from_path(path, media_type)?;
        self.config.rootfs.diff_ids.push(layer.diff_id.clone());
        self.layers.push(layer);
        self.config.history.push(History::default());
        Ok(())
    }

    /// For a Windows-OS image, re-parent every entry of the tar at `path` under `Files/`
    /// through the Windows layer writer, writing the result to a fresh temp file in the
    /// same directory and forcing `MediaType::WindowsLayer`. A no-op for any other OS.
    fn rewrite_for_windows_if_needed(&self, path: &Path, media_type: MediaType) -> Result<(PathBuf, MediaType)> {
        if self.config.os != "windows" {
            return Ok((path.to_path_buf(), media_type));
        }

        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        {
            let mut writer = crate::tarutil::LayerWriter::for_os("windows", &mut tmp);
            let mut archive = tar::Archive::new(std::fs::File::open(path)?);
            for entry in archive.entries()? {
                let mut entry = entry?;
                let mut name = entry.path()?.to_string_lossy().into_owned();
                if !name.starts_with('/') {
                    name.insert(0, '/');
                }
                let mut header = entry.header().clone();
                let mut data = Vec::new();
                entry.read_to_end(&mut data)?;
                writer.append(&name, &mut header, &data[..])?;
            }
            writer.finish()?;
        }
        let (_file, out_path) = tmp.keep().map_err(|e| Error::Io(e.error))?;
        Ok((out_path, MediaType::WindowsLayer))
    }

    /// Add a layer trusting a caller-supplied diffID rather than hashing the file.
    pub fn add_layer_with_diff_id(&mut self, path: &Path, diff_id: Digest) {
        let layer =
            Layer::from_path_with_diff_id(path.to_path_buf(), diff_id.clone(), self.default_layer_media_type());
        self.config.rootfs.diff_ids.push(diff_id);
        self.layers.push(layer);
        self.config.history.push(History::default());
    }

    /// As [`Image::add_layer_with_diff_id`] but with a caller-provided, already-aligned
    /// history entry instead of a blank one.
    pub fn add_layer_with_diff_id_and_history(&mut self, path: &Path, diff_id: Digest, history: History) {
        let layer =
            Layer::from_path_with_diff_id(path.to_path_buf(), diff_id.clone(), self.default_layer_media_type());
        self.config.rootfs.diff_ids.push(diff_id);
        self.layers.push(layer);
        self.config.history.push(history);
    }

    /// Look up `diff_id` in the previous-image layer map and append the borrowed handle.
    /// Fails [`Error::LayerNotFound`] on miss.
    pub fn reuse_layer(&mut self, diff_id: &Digest) -> Result<()> {
        self.reuse_layer_with_history(diff_id, History::default())
    }

    /// As [`Image::reuse_layer`] but with caller-provided history.
    pub fn reuse_layer_with_history(&mut self, diff_id: &Digest, history: History) -> Result<()> {
        let layer = self
            .previous_layers
            .get(diff_id)
            .cloned()
            .ok_or_else(|| Error::LayerNotFound(diff_id.to_string()))?;
        self.config.rootfs.diff_ids.push(layer.diff_id.clone());
        self.layers.push(layer);
        self.config.history.push(history);
        Ok(())
    }

    fn default_layer_media_type(&self) -> MediaType {
        if self.prefer_docker_media_types() {
            MediaType::DockerLayer
        } else {
            MediaType::OciLayer
        }
    }

    /// Return a reader over the uncompressed layer tar for `diff_id`. For lazily-sourced
    /// layers this may trigger materializing the whole backing image first, gated by the
    /// per-core once-guard so the side effect runs at most once even under concurrent
    /// requests for different layers of the same source image.
    pub async fn get_layer(&self, diff_id: &Digest) -> Result<Box<dyn Read + Send>> {
        let layer = self
            .layers
            .iter()
            .find(|l| &l.diff_id == diff_id)
            .ok_or_else(|| Error::LayerNotFound(diff_id.to_string()))?;

        if let LayerSource::OnDisk(path) = &layer.source {
            return Ok(Box::new(std::fs::File::open(path)?));
        }

        if let Some(path) = self.materialized.lock().await.get(diff_id).cloned() {
            return Ok(Box::new(std::fs::File::open(path)?));
        }

        let Some(fetcher) = &self.fetcher else {
            return Err(Error::LayerNotFound(diff_id.to_string()));
        };

        // At-most-once: concurrent `get_layer` calls for distinct layers of the same
        // backing image all await the same in-flight materialization instead of each
        // triggering their own daemon export / registry pull.
        let materialized = &self.materialized;
        self.once_guard
            .run_once(|| async move {
                let paths = fetcher.materialize_all().await?;
                materialized.lock().await.extend(paths);
                Ok(())
            })
            .await?;

        let path = self
            .materialized
            .lock()
            .await
            .get(diff_id)
            .cloned()
            .ok_or_else(|| Error::LayerNotFound(diff_id.to_string()))?;
        Ok(Box::new(std::fs::File::open(path)?))
    }

    /// The once-guard shared by all of this core's lazily-sourced layers, exposed so a
    /// backend can drive the actual fetch while still gating it per §5.
    pub fn once_guard(&self) -> &OnceGuard {
        &self.once_guard
    }

    /// Replace the layer stack and rootfs diffIDs wholesale. Used by [`crate::rebase`].
    pub(crate) fn set_layers(&mut self, layers: Vec<Layer>) {
        self.config.rootfs.diff_ids = layers.iter().map(|l| l.diff_id.clone()).collect();
        self.layers = layers;
    }

    /// Mutable access to the config, for the rebase algorithm's platform-field copy step.
    pub(crate) fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    /// Push a layer/history pair directly without going through the on-disk `add_layer`
    /// path. Only exists to let the rebase tests build a stack without real tar files.
    #[cfg(test)]
    pub(crate) fn push_layer_for_test(&mut self, layer: Layer, history: History) {
        self.config.rootfs.diff_ids.push(layer.diff_id.clone());
        self.layers.push(layer);
        self.config.history.push(history);
    }

    /// Compute the config blob that would be written on save: normalizes history (unless
    /// `preserve_history` is set) and applies the `created` override.
    pub fn materialize_config(&self) -> Config {
        let mut config = self.config.clone();
        if let Some(created) = &self.created_at_override {
            config.created = Some(created.clone());
        }
        if !self.preserve_history {
            config.normalize_history();
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::Image;
    use crate::digest::Digest;

    fn make_tar(dir: &std::path::Path, name: &str, content: &[u8]) -> std::path::PathBuf {
        let path = dir.join(name);
        let file = std::fs::File::create(&path).expect("create");
        let mut builder = tar::Builder::new(file);
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, "file.txt", content).expect("append");
        builder.finish().expect("finish");
        path
    }

    #[test]
    fn add_layer_appends_diff_id_and_history() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = make_tar(dir.path(), "a.tar", b"hello");
        let mut image = Image::empty();
        image.add_layer(&path).expect("add layer");
        assert_eq!(image.layers().len(), 1);
        assert_eq!(image.config().history.len(), 1);
        assert_eq!(image.config().rootfs.diff_ids.len(), 1);
        assert_eq!(image.top_layer(), image.layers()[0].diff_id);
    }

    #[test]
    fn empty_core_top_layer_is_empty_sentinel() {
        let image = Image::empty();
        assert!(image.top_layer().is_empty());
    }

    #[test]
    fn reuse_layer_missing_fails_layer_not_found() {
        let mut image = Image::empty();
        let err = image
            .reuse_layer(&Digest::sha256(b"missing"))
            .expect_err("must fail");
        assert!(matches!(err, crate::error::Error::LayerNotFound(_)));
    }

    #[test]
    fn set_os_rejects_disagreement_with_daemon() {
        let mut image = Image::empty();
        image.bind_daemon_os("linux");
        let err = image.set_os("windows").expect_err("must fail");
        assert!(matches!(err, crate::error::Error::InvalidOsForDaemon { .. }));
    }

    #[test]
    fn set_os_agreeing_with_daemon_succeeds() {
        let mut image = Image::empty();
        image.bind_daemon_os("linux");
        image.set_os("linux").expect("matches daemon os");
    }

    #[test]
    fn add_layer_on_windows_image_routes_through_windows_writer() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = make_tar(dir.path(), "a.tar", b"hello");
        let mut image = Image::empty();
        image.set_os("windows").expect("set os");
        image.add_layer(&path).expect("add layer");

        assert_eq!(image.layers().len(), 1);
        assert_eq!(image.layers()[0].media_type, super::MediaType::WindowsLayer);

        let rewritten = image.layers()[0].path.as_ref().expect("on-disk path");
        let mut archive = tar::Archive::new(std::fs::File::open(rewritten).expect("open rewritten"));
        let names: Vec<String> = archive
            .entries()
            .expect("entries")
            .map(|e| e.expect("entry").path().expect("path").to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["Files/".to_owned(), "Hives/".to_owned(), "Files/file.txt".to_owned()]);
    }
}
