//! The minimum runtime requirements of an image: OS, architecture, and variant.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Mirrors the OCI image-index `Platform` object, plus the Docker manifest-list
/// `features` field which OCI format does not carry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    /// CPU architecture, e.g. `amd64`.
    pub architecture: String,
    /// Operating system, e.g. `linux`.
    pub os: String,
    #[serde(rename = "os.version", skip_serializing_if = "Option::is_none")]
    /// OS version, e.g. `10.0.14393.1066` on Windows.
    pub os_version: Option<String>,
    #[serde(rename = "os.features", skip_serializing_if = "Option::is_none")]
    /// Mandatory OS features, e.g. `["win32k"]`.
    pub os_features: Option<Vec<String>>,
    /// CPU variant, e.g. `v7` for arm.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    /// Docker manifest-list-only feature list; absent in OCI format.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub features: Option<Vec<String>>,
}

impl Platform {
    /// Construct a platform from the running process's own OS/arch, used as the default
    /// match target for `Add` without a platform preference.
    pub fn host() -> Self {
        Self {
            architecture: std::env::consts::ARCH.to_owned(),
            os: std::env::consts::OS.to_owned(),
            ..Self::default()
        }
    }

    /// Parse a `os/arch[/variant]` string, the conventional compact platform spelling.
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.split('/');
        let os = parts.next()?.to_owned();
        let architecture = parts.next()?.to_owned();
        let variant = parts.next().map(str::to_owned);
        if os.is_empty() || architecture.is_empty() {
            return None;
        }
        Some(Self {
            os,
            architecture,
            variant,
            ..Self::default()
        })
    }

    /// True if `other`'s set fields all agree with self. Fields unset on `other` are
    /// wildcards. Used by the Index engine's `Add` platform-overlay matching, which
    /// selects "the first child whose platform matches all specified fields."
    pub fn matches(&self, other: &PlatformQuery) -> bool {
        other.os.as_deref().is_none_or(|v| v == self.os)
            && other
                .architecture
                .as_deref()
                .is_none_or(|v| v == self.architecture)
            && other
                .variant
                .as_deref()
                .is_none_or(|v| Some(v) == self.variant.as_deref())
            && other
                .os_version
                .as_deref()
                .is_none_or(|v| Some(v) == self.os_version.as_deref())
            && other.features.as_ref().is_none_or(|v| {
                self.features.as_ref().is_some_and(|f| v.iter().all(|x| f.contains(x)))
            })
            && other.os_features.as_ref().is_none_or(|v| {
                self.os_features
                    .as_ref()
                    .is_some_and(|f| v.iter().all(|x| f.contains(x)))
            })
    }
}

/// A partial platform specification used to query/filter children in `Index::add`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlatformQuery {
    /// Exact OS to require, if any.
    pub os: Option<String>,
    /// Exact architecture to require, if any.
    pub architecture: Option<String>,
    /// Exact variant to require, if any.
    pub variant: Option<String>,
    /// Exact OS version to require, if any.
    pub os_version: Option<String>,
    /// Subset of Docker manifest-list features to require, if any.
    pub features: Option<Vec<String>>,
    /// Subset of OS features to require, if any.
    pub os_features: Option<Vec<String>>,
}

impl PlatformQuery {
    /// True if no field was set: the "no preference" case in `Index::add`'s option table.
    pub fn is_empty(&self) -> bool {
        self.os.is_none()
            && self.architecture.is_none()
            && self.variant.is_none()
            && self.os_version.is_none()
            && self.features.is_none()
            && self.os_features.is_none()
    }
}

/// Annotation mapping, ordered for determinism when it round-trips through the engine.
pub type Annotations = BTreeMap<String, String>;
