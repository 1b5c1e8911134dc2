//! Manifest and index-manifest wire types: descriptors, image manifests, manifest lists.

use serde::{Deserialize, Serialize};

use crate::digest::Digest;
use crate::platform::{Annotations, Platform};

/// `application/vnd.oci.image.manifest.v1+json` vs the Docker equivalent, and the two
/// index/manifest-list media types. Kept distinct from [`crate::layer::MediaType`], which
/// only covers layer blobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestMediaType {
    /// `application/vnd.oci.image.manifest.v1+json`.
    OciManifest,
    /// `application/vnd.docker.distribution.manifest.v2+json`.
    DockerManifest,
    /// `application/vnd.oci.image.index.v1+json`.
    OciIndex,
    /// `application/vnd.docker.distribution.manifest.list.v2+json`.
    DockerManifestList,
    /// `application/vnd.oci.image.config.v1+json`.
    OciConfig,
    /// `application/vnd.docker.container.image.v1+json`.
    DockerConfig,
}

impl ManifestMediaType {
    /// The wire string for this media type.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OciManifest => "application/vnd.oci.image.manifest.v1+json",
            Self::DockerManifest => "application/vnd.docker.distribution.manifest.v2+json",
            Self::OciIndex => "application/vnd.oci.image.index.v1+json",
            Self::DockerManifestList => "application/vnd.docker.distribution.manifest.list.v2+json",
            Self::OciConfig => "application/vnd.oci.image.config.v1+json",
            Self::DockerConfig => "application/vnd.docker.container.image.v1+json",
        }
    }

    /// True for either index/manifest-list variant.
    pub fn is_index(self) -> bool {
        matches!(self, Self::OciIndex | Self::DockerManifestList)
    }

    /// True for a Docker-format variant (manifest, manifest list, or config).
    pub fn is_docker(self) -> bool {
        matches!(self, Self::DockerManifest | Self::DockerManifestList | Self::DockerConfig)
    }

    /// Parse a wire media-type string.
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "application/vnd.oci.image.manifest.v1+json" => Self::OciManifest,
            "application/vnd.docker.distribution.manifest.v2+json" => Self::DockerManifest,
            "application/vnd.oci.image.index.v1+json" => Self::OciIndex,
            "application/vnd.docker.distribution.manifest.list.v2+json" => Self::DockerManifestList,
            "application/vnd.oci.image.config.v1+json" => Self::OciConfig,
            "application/vnd.docker.container.image.v1+json" => Self::DockerConfig,
            _ => return None,
        })
    }
}

/// A content descriptor: `{mediaType, digest, size, platform?, annotations?, urls?}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Descriptor {
    /// Media type of the referenced content.
    #[serde(rename = "mediaType")]
    pub media_type: String,
    /// Digest of the referenced content.
    pub digest: Digest,
    /// Size in bytes of the referenced content.
    pub size: i64,
    /// Minimum runtime requirements of the referenced content, when it is a platform-specific
    /// image.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    /// Arbitrary metadata.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Annotations>,
    /// URIs this content may alternately be downloaded from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub urls: Option<Vec<String>>,
}

impl Descriptor {
    /// Construct a descriptor with only the required fields set.
    pub fn new(media_type: impl Into<String>, digest: Digest, size: i64) -> Self {
        Self {
            media_type: media_type.into(),
            digest,
            size,
            platform: None,
            annotations: None,
            urls: None,
        }
    }
}

/// A single-platform image manifest: config descriptor plus ordered layer descriptors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageManifest {
    /// Always 2.
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    /// Manifest media type (OCI or Docker).
    #[serde(rename = "mediaType", skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    /// Descriptor pointing at the image configuration blob.
    pub config: Descriptor,
    /// Ordered layer descriptors, bottom to top.
    pub layers: Vec<Descriptor>,
    /// Arbitrary metadata.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Annotations>,
}

/// A manifest list / image index: a descriptor-of-descriptors grouping per-platform
/// images (or nested indexes) under one name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexManifest {
    /// Always 2.
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    /// `oci-image-index` or `docker-manifest-list` media type.
    #[serde(rename = "mediaType", skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    /// Ordered child descriptors.
    pub manifests: Vec<Descriptor>,
    /// Subject descriptor, for referrers-API-style attachment.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<Descriptor>,
    /// Top-level annotations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Annotations>,
}

impl IndexManifest {
    /// An empty manifest list of the given media type.
    pub fn new(docker_format: bool) -> Self {
        Self {
            schema_version: 2,
            media_type: Some(
                if docker_format {
                    ManifestMediaType::DockerManifestList
                } else {
                    ManifestMediaType::OciIndex
                }
                .as_str()
                .to_owned(),
            ),
            manifests: Vec::new(),
            subject: None,
            annotations: None,
        }
    }

    /// True if this index uses the Docker manifest-list media type, which does not carry
    /// per-descriptor annotations.
    pub fn is_docker_format(&self) -> bool {
        self.media_type
            .as_deref()
            .and_then(ManifestMediaType::parse)
            .is_some_and(ManifestMediaType::is_docker)
    }
}

#[cfg(test)]
mod tests {
    use super::{IndexManifest, ManifestMediaType};

    #[test]
    fn oci_index_round_trips_media_type() {
        let idx = IndexManifest::new(false);
        assert!(!idx.is_docker_format());
        assert_eq!(idx.media_type.as_deref(), Some(ManifestMediaType::OciIndex.as_str()));
    }

    #[test]
    fn docker_format_detected() {
        let idx = IndexManifest::new(true);
        assert!(idx.is_docker_format());
    }

    #[test]
    fn parse_round_trip() {
        for mt in [
            ManifestMediaType::OciManifest,
            ManifestMediaType::DockerManifest,
            ManifestMediaType::OciIndex,
            ManifestMediaType::DockerManifestList,
        ] {
            assert_eq!(ManifestMediaType::parse(mt.as_str()), Some(mt));
        }
    }
}
