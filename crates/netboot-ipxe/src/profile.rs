//! Machine profiles and the groups that select them
//!
//! Layout under the data root:
//!
//! ```text
//! groups/<id>.json    {"id": "...", "profile": "<profile id>", "selector": {"mac": "..."}}
//! profiles/<id>.json  {"id": "...", "boot": {"kernel": "...", "initrd": [...], "args": [...]}}
//! ```
//!
//! A group matches when every selector attribute equals the machine's
//! announced value. The group with the most selector attributes wins; an
//! empty selector matches everything and acts as a default.

use crate::error::{IpxeError, Result};
use crate::selection::{normalize_mac, BootSelection};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Kernel, initrds and kernel arguments of a profile
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BootSpec {
    pub kernel: String,
    #[serde(default)]
    pub initrd: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
}

/// A bootable machine profile
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Profile {
    pub id: String,
    pub boot: BootSpec,
}

/// Maps matching machines onto a profile
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Group {
    pub id: String,
    pub profile: String,
    #[serde(default)]
    pub selector: BTreeMap<String, String>,
}

impl Group {
    /// Whether every selector attribute matches `selection`
    pub fn matches(&self, selection: &BootSelection) -> bool {
        self.selector.iter().all(|(key, want)| {
            let want = if key == "mac" {
                normalize_mac(want)
            } else {
                Some(want.trim().to_ascii_lowercase())
            };
            want.is_some() && selection.attribute(key) == want
        })
    }
}

/// Profile store reading JSON files below a data root
#[derive(Debug, Clone)]
pub struct FileProfileStore {
    root: PathBuf,
}

impl FileProfileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// All groups, sorted by id. A missing `groups` directory means none.
    pub fn groups(&self) -> Result<Vec<Group>> {
        let dir = self.root.join("groups");
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(IpxeError::Io { path: dir, source }),
        };

        let mut groups = Vec::new();
        for entry in entries {
            let path = entry
                .map_err(|source| IpxeError::Io {
                    path: dir.clone(),
                    source,
                })?
                .path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            groups.push(read_json::<Group>(&path)?);
        }
        groups.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(groups)
    }

    /// Profile by id, `None` if no such file
    pub fn profile(&self, id: &str) -> Result<Option<Profile>> {
        if id.is_empty() || id.contains(['/', '\\']) || id.contains("..") {
            warn!(profile = %id, "Refusing suspicious profile id");
            return Ok(None);
        }

        let path = self.root.join("profiles").join(format!("{}.json", id));
        if !path.is_file() {
            return Ok(None);
        }
        read_json(&path).map(Some)
    }

    /// Profile of the most specific group matching `selection`
    pub fn lookup(&self, selection: &BootSelection) -> Result<Option<Profile>> {
        let best = self
            .groups()?
            .into_iter()
            .filter(|group| group.matches(selection))
            .fold(None::<Group>, |best, group| match best {
                Some(b) if b.selector.len() >= group.selector.len() => Some(b),
                _ => Some(group),
            });

        let Some(group) = best else {
            debug!(selection = ?selection, "No group matches");
            return Ok(None);
        };

        debug!(group = %group.id, profile = %group.profile, "Matched group");
        match self.profile(&group.profile)? {
            Some(profile) => Ok(Some(profile)),
            None => Err(IpxeError::MissingProfile {
                group: group.id,
                profile: group.profile,
            }),
        }
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = std::fs::read(path).map_err(|source| IpxeError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&bytes).map_err(|source| IpxeError::InvalidJson {
        path: path.to_path_buf(),
        source,
    })
}
