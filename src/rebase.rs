//! §4.2: swap a prefix of an image's layer stack for a new base's layers.

use crate::config::History;
use crate::digest::Digest;
use crate::error::{Error, Result};
use crate::image::Image;
use crate::layer::Layer;

/// A minimal view of the new base image rebase needs: its materialized layers (bottom to
/// top) and aligned history, plus the platform fields §4.2 step 6 says to copy.
#[derive(Debug, Clone)]
pub struct NewBase {
    /// New base's layers, bottom to top, already materialized (not lazy).
    pub layers: Vec<Layer>,
    /// New base's history, aligned with `layers` the same way `Config.history` is aligned
    /// with `RootFS.DiffIDs`.
    pub history: Vec<History>,
    /// Copied verbatim onto the rebased image's config: OS.
    pub os: String,
    /// Copied verbatim: Architecture.
    pub architecture: String,
    /// Copied verbatim: Variant.
    pub variant: Option<String>,
    /// Copied verbatim: OSVersion.
    pub os_version: Option<String>,
    /// Copied verbatim: OSFeatures.
    pub os_features: Option<Vec<String>>,
}

/// Swap the prefix of `image`'s layer stack up to and including `old_base_top_diff_id` for
/// `new_base`'s layers, per §4.2.
///
/// Leaves `image` dirty; the caller must still call `save` to publish. Working directory,
/// user, labels, env, entrypoint, and cmd are left untouched — only the platform-shape
/// fields in [`NewBase`] are copied from the new base (§9's resolved open question).
pub fn rebase(image: &mut Image, old_base_top_diff_id: &Digest, new_base: NewBase) -> Result<()> {
    let seam = image
        .layers()
        .iter()
        .position(|l| &l.diff_id == old_base_top_diff_id)
        .ok_or_else(|| Error::RebaseSeamNotFound(old_base_top_diff_id.to_string()))?;

    let app_layers: Vec<Layer> = image.layers()[seam + 1..].to_vec();
    let app_history = app_history_for(image, seam);

    let mut rebased_layers = new_base.layers;
    rebased_layers.extend(app_layers);
    image.set_layers(rebased_layers);

    let mut rebased_history = new_base.history;
    rebased_history.extend(app_history);
    image.config_mut().history = rebased_history;

    let config = image.config_mut();
    config.os = new_base.os;
    config.architecture = new_base.architecture;
    config.variant = new_base.variant;
    config.os_version = new_base.os_version;
    config.os_features = new_base.os_features;

    Ok(())
}

/// History entries belonging to the app layers above `seam`, including any empty-layer
/// entries interleaved among them, preserved relative to their layer (§4.2 step 5).
fn app_history_for(image: &Image, seam: usize) -> Vec<History> {
    // Non-empty history entries are one-to-one with layers in order; empty-layer entries
    // have no layer of their own. We keep every history entry whose "non-empty index" (the
    // count of non-empty entries seen so far, including itself if non-empty) is > seam, or
    // that is an empty-layer entry occurring after the first such kept non-empty entry's
    // position in the list.
    let history = &image.config().history;
    let mut non_empty_seen = 0usize;
    let mut result = Vec::new();
    let mut started = false;
    for entry in history {
        if entry.empty_layer {
            if started {
                result.push(entry.clone());
            }
            continue;
        }
        if non_empty_seen > seam {
            started = true;
            result.push(entry.clone());
        }
        non_empty_seen += 1;
    }
    result
}
