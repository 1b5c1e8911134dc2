//! Image configuration: the JSON blob an image's manifest points its `config` descriptor at.

use std::collections::{BTreeMap, BTreeSet};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::digest::Digest;

/// `RootFS.DiffIDs`: the ordered list of uncompressed layer digests, one per non-empty
/// layer, in the order they apply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootFs {
    /// Always `layers` per the image spec.
    #[serde(rename = "type")]
    pub fs_type: String,
    /// One diffID per non-empty layer, first to last.
    pub diff_ids: Vec<Digest>,
}

impl RootFs {
    /// A fresh, empty rootfs with the spec-mandated `type` field set.
    pub fn new() -> Self {
        Self {
            fs_type: "layers".to_owned(),
            diff_ids: Vec::new(),
        }
    }
}

/// One entry in `Config.history`, aligned so that the count of entries with
/// `empty_layer == false` equals `len(RootFS.DiffIDs)`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct History {
    /// Creation timestamp of this layer, RFC 3339.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    /// Command that produced this layer, as recorded by the tool that built it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    /// Free-form comment.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    /// Author of this layer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    /// True if this history entry corresponds to no layer (a metadata-only build step).
    #[serde(skip_serializing_if = "std::ops::Not::not", default)]
    pub empty_layer: bool,
}

/// Healthcheck configuration, carried through untouched by this crate's mutation API.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Healthcheck {
    /// The probe command, Docker `HEALTHCHECK` shape: `["CMD", ...]` or `["CMD-SHELL", ...]`.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub test: Vec<String>,
    /// Nanosecond interval between probes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval: Option<i64>,
    /// Nanosecond timeout per probe.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<i64>,
    /// Nanosecond grace period before probes count toward failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_period: Option<i64>,
    /// Consecutive failures before the container is marked unhealthy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retries: Option<i64>,
}

/// The `Config` object inside the image configuration: runtime defaults for a container
/// started from this image, plus the platform fields that `Rebase` treats specially.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Operating system, e.g. `linux`.
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub os: String,
    /// OS version string, Windows-only in practice.
    #[serde(rename = "os.version", skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    /// Mandatory OS features.
    #[serde(rename = "os.features", skip_serializing_if = "Option::is_none")]
    pub os_features: Option<Vec<String>>,
    /// CPU architecture, e.g. `amd64`.
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub architecture: String,
    /// CPU variant, e.g. `v7`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    /// Author string.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    /// Creation timestamp, RFC 3339. Overridden at save by `Image::set_created_at` when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    /// Daemon-assigned container ID this config was captured from, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    /// Daemon version string that produced this config, if any.
    #[serde(rename = "docker_version", skip_serializing_if = "Option::is_none")]
    pub docker_version: Option<String>,
    /// Default working directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    /// Default user (`name`, `uid`, or `uid:gid`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Default command, appended to `entrypoint` when both are set.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub cmd: Vec<String>,
    /// Default entrypoint.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub entrypoint: Vec<String>,
    /// Environment variables, insertion-ordered for determinism, `KEY=VALUE` on the wire.
    #[serde(with = "env_list", skip_serializing_if = "IndexMap::is_empty", default)]
    pub env: IndexMap<String, String>,
    /// Arbitrary string labels.
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub labels: BTreeMap<String, String>,
    /// Exposed ports, `"port/proto"` form.
    #[serde(
        with = "docker_set",
        rename = "ExposedPorts",
        skip_serializing_if = "BTreeSet::is_empty",
        default
    )]
    pub exposed_ports: BTreeSet<String>,
    /// Declared volume mount points.
    #[serde(with = "docker_set", skip_serializing_if = "BTreeSet::is_empty", default)]
    pub volumes: BTreeSet<String>,
    /// Container healthcheck.
    #[serde(rename = "Healthcheck", skip_serializing_if = "Option::is_none")]
    pub healthcheck: Option<Healthcheck>,
    /// Default shell used to interpret `CMD-SHELL` healthchecks and similar.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub shell: Vec<String>,
    /// True if `cmd`/`entrypoint` were already escaped for the Windows shell at config time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args_escaped: Option<bool>,
    /// Signal sent to stop the container, e.g. `SIGTERM`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_signal: Option<String>,
    /// Layer digest bookkeeping; `diff_ids.len()` pins the history-alignment invariant.
    pub rootfs: RootFs,
    /// Per-layer build history, first to last.
    pub history: Vec<History>,
}

impl Config {
    /// Normalize `history` so its empty-layer-excluded count matches `rootfs.diff_ids.len()`,
    /// padding with blank empty-layer entries or trimming from the tail as needed. Called on
    /// save, per the data model's History-entry invariant.
    pub fn normalize_history(&mut self) {
        let want = self.rootfs.diff_ids.len();
        let have = self.history.iter().filter(|h| !h.empty_layer).count();
        if have < want {
            for _ in have..want {
                self.history.push(History::default());
            }
        } else if have > want {
            let mut to_drop = have - want;
            let mut i = self.history.len();
            while to_drop > 0 && i > 0 {
                i -= 1;
                if !self.history[i].empty_layer {
                    self.history.remove(i);
                    to_drop -= 1;
                }
            }
        }
    }
}

/// Docker's `map[string]struct{}` set encoding: `{"a": {}, "b": {}}` on the wire.
mod docker_set {
    use std::collections::BTreeSet;

    use serde::{Deserialize, Deserializer, Serialize, Serializer, ser::SerializeMap};

    pub fn serialize<S: Serializer>(set: &BTreeSet<String>, s: S) -> Result<S::Ok, S::Error> {
        let mut map = s.serialize_map(Some(set.len()))?;
        for key in set {
            map.serialize_entry(key, &serde_json::Map::new())?;
        }
        map.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<BTreeSet<String>, D::Error> {
        let map = BTreeMapShim::deserialize(d)?;
        Ok(map.0.into_keys().collect())
    }

    #[derive(Deserialize)]
    struct BTreeMapShim(std::collections::BTreeMap<String, serde_json::Value>);
}

/// Config's `Env` as an ordered `["KEY=VALUE", ...]` list on the wire, an ordered map in memory.
mod env_list {
    use indexmap::IndexMap;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(map: &IndexMap<String, String>, s: S) -> Result<S::Ok, S::Error> {
        let list: Vec<String> = map.iter().map(|(k, v)| format!("{k}={v}")).collect();
        list.serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<IndexMap<String, String>, D::Error> {
        let list = Vec::<String>::deserialize(d)?;
        let mut map = IndexMap::new();
        for entry in list {
            if let Some((k, v)) = entry.split_once('=') {
                map.insert(k.to_owned(), v.to_owned());
            }
        }
        Ok(map)
    }
}
