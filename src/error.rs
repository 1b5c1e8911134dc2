//! Typed error taxonomy shared by every backend and the index engine.

use std::path::PathBuf;

use thiserror::Error;

/// One failed additional-name publish collected during a multi-tag [`crate::image::Image::save`]
/// or [`crate::index::Index::push`].
#[derive(Debug)]
pub struct TagDiagnostic {
    /// The tag or reference that failed to publish.
    pub name: String,
    /// The underlying cause, preserved as a boxed error rather than stringified so callers
    /// can still downcast it.
    pub cause: Box<Error>,
}

/// A descriptor field a getter was asked for but that is absent on the target descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    /// `Platform.os`.
    Os,
    /// `Platform.os_version`.
    OsVersion,
    /// `Platform.architecture`.
    Architecture,
    /// `Platform.variant`.
    Variant,
    /// `Platform.features` (Docker manifest-list feature list).
    Features,
    /// `Platform.os_features`.
    OsFeatures,
    /// `Descriptor.annotations`.
    Annotations,
    /// `Descriptor.urls`.
    Urls,
}

impl std::fmt::Display for Field {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Os => "OS",
            Self::OsVersion => "OSVersion",
            Self::Architecture => "Architecture",
            Self::Variant => "Variant",
            Self::Features => "Features",
            Self::OsFeatures => "OSFeatures",
            Self::Annotations => "Annotations",
            Self::Urls => "URLs",
        };
        f.write_str(name)
    }
}

/// Every error this crate's public API can return.
#[derive(Debug, Error)]
pub enum Error {
    /// The named image or index was not present in the backend.
    #[error("{target}: not found")]
    NotFound {
        /// The name or reference that was looked up.
        target: String,
    },

    /// An operation was attempted on an index after [`crate::index::Index::delete`].
    #[error("index has been deleted")]
    IndexDeleted,

    /// [`crate::index::Index::push`] or [`crate::index::Index::inspect`] was called while the
    /// index still has unsaved mutations.
    #[error("index has unsaved changes")]
    IndexUnsaved,

    /// [`crate::index::Index::inspect`] was called before any manifest has been built.
    #[error("index manifest is not yet defined")]
    ManifestUndefined,

    /// A name or tag failed to parse as a valid image reference.
    #[error("invalid reference {reference:?}: {reason}")]
    InvalidReference {
        /// The raw string that failed to parse.
        reference: String,
        /// Human-readable parse failure reason.
        reason: String,
    },

    /// [`crate::image::Image::set_os`] disagreed with the daemon backend's platform.
    #[error("daemon OS is {daemon_os}, cannot set image OS to {requested}")]
    InvalidOsForDaemon {
        /// The OS reported by the daemon.
        daemon_os: String,
        /// The OS that was requested.
        requested: String,
    },

    /// A descriptor or layer carried a media type this crate does not understand.
    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),

    /// A tar header in a Windows base layer failed the path validation in §4.7.
    #[error("invalid path in windows layer tar: {0:?}")]
    InvalidPath(String),

    /// [`crate::image::Image::reuse_layer`] missed in the previous-image diffID map.
    #[error("layer not found for diffID {0}")]
    LayerNotFound(String),

    /// [`crate::rebase::rebase`] could not find `old_base_top_diff_id` in the layer stack.
    #[error("rebase seam not found: diffID {0} is not in the layer stack")]
    RebaseSeamNotFound(String),

    /// The OCI layout backend was asked to write more than one additional name in a single save.
    #[error("oci layout backend supports at most one additional name per save")]
    MultipleNamesUnsupported,

    /// Save published under the primary name but one or more additional names failed.
    #[error("{} additional name(s) failed to publish", diagnostics.len())]
    MultiTagError {
        /// One entry per name that failed to publish.
        diagnostics: Vec<TagDiagnostic>,
    },

    /// The caller's cancellation context fired mid-operation.
    #[error("operation cancelled")]
    Cancelled,

    /// A getter was asked for a field that is not set on the target descriptor.
    #[error("{0} is not defined on this descriptor")]
    Undefined(Field),

    /// A filesystem path used by the OCI layout backend or a layer source was invalid.
    #[error("invalid path: {0}")]
    InvalidFsPath(PathBuf),

    /// Propagated from the registry transport (`oci-client` by default).
    #[error("registry transport error")]
    Registry(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Propagated from the daemon transport (`bollard` by default).
    #[error("daemon transport error")]
    Daemon(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Local filesystem I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failure for a manifest, config, or index file.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience alias used throughout the crate's public API.
pub type Result<T> = std::result::Result<T, Error>;
