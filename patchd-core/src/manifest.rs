use anyhow::{Context, Result};
use fs2::FileExt;
use globset::{Glob, GlobSet, GlobSetBuilder};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::hash;

pub const MANIFEST_FILE: &str = "manifest.json";
pub const INITIAL_VERSION: &str = "1.0.0";
const LOCK_FILE: &str = ".manifest.lock";
const TMP_PREFIX: &str = ".manifest.tmp";

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub file_name: String,
    pub directory: String,
    pub hash: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Manifest {
    pub version: String,
    pub files: Vec<FileEntry>,
}

impl Manifest {
    pub fn entry(&self, file_name: &str) -> Option<&FileEntry> {
        self.files.iter().find(|f| f.file_name == file_name)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

#[derive(Clone, Debug, Default)]
pub struct ManifestOptions {
    /// Glob patterns (matched against the bare file name) kept out of the scan.
    pub exclude: Vec<String>,
}

impl ManifestOptions {
    fn exclude_set(&self) -> Result<GlobSet> {
        let mut b = GlobSetBuilder::new();
        for g in &self.exclude {
            b.add(Glob::new(g).with_context(|| format!("bad exclude glob {:?}", g))?);
        }
        Ok(b.build()?)
    }
}

pub fn manifest_path(root: &Path) -> PathBuf {
    root.join(MANIFEST_FILE)
}

/// Files the store itself writes into the root; never part of a release.
fn is_bookkeeping(name: &str) -> bool {
    name == MANIFEST_FILE || name == LOCK_FILE || name.starts_with(TMP_PREFIX)
}

pub fn load(root: &Path) -> Result<Manifest> {
    load_with(root, &ManifestOptions::default())
}

/// Load the persisted manifest, or scan `root` at the initial version and
/// persist that when nothing usable is on disk.
pub fn load_with(root: &Path, opts: &ManifestOptions) -> Result<Manifest> {
    let path = manifest_path(root);
    match std::fs::read(&path) {
        Ok(bytes) => match serde_json::from_slice::<Manifest>(&bytes) {
            Ok(m) => {
                tracing::debug!(version = %m.version, files = m.files.len(), "loaded persisted manifest");
                return Ok(m);
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "persisted manifest unreadable, regenerating");
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(path = %path.display(), "no persisted manifest, generating");
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "cannot read persisted manifest, regenerating");
        }
    }
    let m = generate_with(INITIAL_VERSION, root, opts)?;
    save(&m, root)?;
    Ok(m)
}

pub fn generate(version: &str, root: &Path) -> Result<Manifest> {
    generate_with(version, root, &ManifestOptions::default())
}

/// Scan the immediate regular files of `root` and hash each one.
pub fn generate_with(version: &str, root: &Path, opts: &ManifestOptions) -> Result<Manifest> {
    if !root.is_dir() {
        anyhow::bail!("unable to read directory {:?}: not a directory", root);
    }
    let exclude = opts.exclude_set()?;
    let mut files: Vec<(String, PathBuf)> = Vec::new();
    for ent in walkdir::WalkDir::new(root).min_depth(1).max_depth(1).sort_by_file_name() {
        let ent = ent.with_context(|| format!("unable to read directory {:?}", root))?;
        if !ent.file_type().is_file() {
            continue;
        }
        let name = ent.file_name().to_string_lossy().to_string();
        if is_bookkeeping(&name) || exclude.is_match(&name) {
            continue;
        }
        files.push((name, ent.into_path()));
    }
    let directory = root.to_string_lossy().to_string();
    let entries = files
        .par_iter()
        .map(|(name, path)| -> Result<FileEntry> {
            let hash = hash::hash_file(path)
                .with_context(|| format!("unable to compute hash for file {}", name))?;
            Ok(FileEntry { file_name: name.clone(), directory: directory.clone(), hash })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(Manifest { version: version.to_string(), files: entries })
}

/// Persist as indented JSON: write a temp sibling, fsync, rename over the
/// real file. An exclusive lock on the root's lock file serializes writers
/// from other processes.
pub fn save(manifest: &Manifest, root: &Path) -> Result<()> {
    let lock = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(root.join(LOCK_FILE))
        .with_context(|| format!("open lock file in {:?}", root))?;
    lock.lock_exclusive().context("lock manifest")?;

    let res = (|| -> Result<()> {
        let mut tmp = tempfile::Builder::new()
            .prefix(TMP_PREFIX)
            .tempfile_in(root)
            .with_context(|| format!("create temp manifest in {:?}", root))?;
        let json = serde_json::to_string_pretty(manifest)?;
        tmp.write_all(json.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(manifest_path(root)).context("replace manifest.json")?;
        Ok(())
    })();

    let _ = FileExt::unlock(&lock);
    res
}

/// Read a manifest file from an arbitrary path (client side: a downloaded copy).
pub fn read_from(path: &Path) -> Result<Manifest> {
    let f = File::open(path).with_context(|| format!("open {:?}", path))?;
    serde_json::from_reader(f).with_context(|| format!("parse {:?}", path))
}
