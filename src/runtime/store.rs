//! Content-addressed artifact store with a persistent mirror on disk.
//!
//! Used for both the seed corpus and the crash archive. Entries are keyed by
//! the blake3 digest of their bytes and written as `<hex>` (or `<hex>-<tag>`).
//! Companion description files are `<hex of key>.<kind>`.

use walkdir::WalkDir;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub const DIGEST_HEX_LEN: usize = 64;

pub type Digest = blake3::Hash;

pub fn digest(data: &[u8]) -> Digest {
    blake3::hash(data)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub data: Vec<u8>,
    /// Arbitrary numeric payload, persisted as a `-<tag>` filename suffix when non-zero.
    pub tag: u64,
    /// Placed in the directory by a user rather than written by the store.
    pub user: bool,
}

impl Artifact {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            tag: 0,
            user: false,
        }
    }

    pub fn with_tag(mut self, tag: u64) -> Self {
        self.tag = tag;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileRole {
    Description,
    Stored { tag: u64 },
    User,
}

fn classify(name: &str) -> FileRole {
    if !name.get(..DIGEST_HEX_LEN).is_some_and(is_hex) {
        return FileRole::User;
    }
    match name.as_bytes().get(DIGEST_HEX_LEN) {
        Some(b'.') if name.len() > DIGEST_HEX_LEN + 1 => FileRole::Description,
        Some(b'-') if name.len() > DIGEST_HEX_LEN + 1 => FileRole::Stored {
            tag: name[DIGEST_HEX_LEN + 1..].parse().unwrap_or(0),
        },
        _ => FileRole::Stored { tag: 0 },
    }
}

fn is_hex(s: &str) -> bool {
    s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

#[derive(Debug)]
pub struct ArtifactStore {
    dir: PathBuf,
    entries: HashMap<Digest, Artifact>,
}

impl ArtifactStore {
    /// Opens (creating if needed) `dir` and loads every artifact found in it.
    /// Unreadable files are logged and skipped.
    pub fn open(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        if let Err(err) = std::fs::create_dir_all(&dir) {
            tracing::warn!("failed to create store dir {}: {err}", dir.display());
        }
        let mut store = Self {
            dir,
            entries: HashMap::new(),
        };
        store.read_in_dir();
        store
    }

    fn read_in_dir(&mut self) {
        for entry in WalkDir::new(&self.dir).min_depth(1).follow_links(false) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    tracing::warn!("error during store dir walk: {err}");
                    continue;
                }
            };
            if entry.file_type().is_dir() {
                continue;
            }
            let data = match std::fs::read(entry.path()) {
                Ok(data) => data,
                Err(err) => {
                    tracing::warn!("failed to read {}: {err}", entry.path().display());
                    continue;
                }
            };
            let sig = digest(&data);
            if self.entries.contains_key(&sig) {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            let artifact = match classify(&name) {
                FileRole::Description => continue,
                FileRole::Stored { tag } => Artifact {
                    data,
                    tag,
                    user: false,
                },
                FileRole::User => Artifact {
                    data,
                    tag: 0,
                    user: true,
                },
            };
            self.entries.insert(sig, artifact);
        }
    }

    /// Inserts an artifact unless its digest is already present. Returns whether
    /// it was new. The disk write is best-effort.
    pub fn add(&mut self, artifact: Artifact) -> bool {
        let sig = digest(&artifact.data);
        if self.entries.contains_key(&sig) {
            return false;
        }
        let path = self.artifact_path(&artifact, &sig);
        if let Err(err) = std::fs::write(&path, &artifact.data) {
            tracing::warn!("failed to write {}: {err}", path.display());
        }
        self.entries.insert(sig, artifact);
        true
    }

    /// Writes `<hex digest of key>.<kind>` unless that file already exists.
    /// Returns whether a file was written.
    pub fn add_description(&self, key: &[u8], payload: &[u8], kind: &str) -> bool {
        let path = self.description_path(key, kind);
        if path.exists() {
            return false;
        }
        match std::fs::write(&path, payload) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!("failed to write {}: {err}", path.display());
                false
            }
        }
    }

    pub fn description_path(&self, key: &[u8], kind: &str) -> PathBuf {
        self.dir.join(format!("{}.{kind}", digest(key).to_hex()))
    }

    fn artifact_path(&self, artifact: &Artifact, sig: &Digest) -> PathBuf {
        let mut name = sig.to_hex().to_string();
        if artifact.tag != 0 {
            name.push_str(&format!("-{}", artifact.tag));
        }
        self.dir.join(name)
    }

    pub fn get(&self, sig: &Digest) -> Option<&Artifact> {
        self.entries.get(sig)
    }

    /// Current digests in map iteration order (not stable across runs).
    pub fn digests(&self) -> Vec<Digest> {
        self.entries.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Digest, &Artifact)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Ends the store's lifetime. Every accepted artifact was written on `add`,
    /// so there is nothing left to flush.
    pub fn close(self) -> usize {
        tracing::debug!("closing store {} with {} artifacts", self.dir.display(), self.entries.len());
        self.entries.len()
    }
}
