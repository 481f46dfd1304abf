use anyhow::{bail, Context, Result};
use std::collections::HashSet;
use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::path::Path;
use tokio_util::sync::CancellationToken;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::path_safety;

/// A finished zip archive, rewound and ready to stream.
#[derive(Debug)]
pub struct Bundle {
    pub file: File,
    pub len: u64,
    pub included: Vec<String>,
    pub skipped: Vec<Skipped>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Skipped {
    pub path: String,
    pub reason: String,
}

impl Bundle {
    pub fn is_partial(&self) -> bool {
        !self.skipped.is_empty()
    }
}

/// Pack the requested files into a zip in an anonymous temp file.
///
/// Best effort per entry: a path that fails resolution, cannot be opened or
/// fails mid-copy is left out and recorded in `skipped`, and the archive is
/// still produced. Only failures of the archive itself (temp file, central
/// directory) or cancellation fail the call. Entries are named by their
/// normalized relative path.
pub fn write_bundle(root: &Path, paths: &[String], cancel: &CancellationToken) -> Result<Bundle> {
    let tmp = tempfile::tempfile().context("create bundle temp file")?;
    let mut zip = ZipWriter::new(tmp);
    let mut included = Vec::new();
    let mut skipped = Vec::new();
    let mut seen = HashSet::new();

    for requested in paths {
        if cancel.is_cancelled() {
            bail!("bundle cancelled after {} entries", included.len());
        }
        match add_entry(&mut zip, root, requested, &mut seen) {
            Ok(name) => included.push(name),
            Err(reason) => {
                tracing::warn!(path = %requested, %reason, "skipping bundle entry");
                skipped.push(Skipped { path: requested.clone(), reason });
            }
        }
    }

    let mut file = zip.finish().context("finish zip archive")?;
    file.seek(SeekFrom::Start(0))?;
    let len = file.metadata()?.len();
    Ok(Bundle { file, len, included, skipped })
}

fn add_entry(
    zip: &mut ZipWriter<File>,
    root: &Path,
    requested: &str,
    seen: &mut HashSet<String>,
) -> std::result::Result<String, String> {
    let name = path_safety::normalize(requested)
        .map_err(|e| e.to_string())?
        .to_string_lossy()
        .replace('\\', "/");
    if !seen.insert(name.clone()) {
        return Err("duplicate entry".to_string());
    }
    let full = path_safety::resolve(root, requested).map_err(|e| e.to_string())?;
    let mut src = File::open(&full).map_err(|e| format!("open: {e}"))?;
    let meta = src.metadata().map_err(|e| format!("stat: {e}"))?;
    if !meta.is_file() {
        return Err("not a regular file".to_string());
    }

    let opts = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .unix_permissions(0o644)
        .large_file(meta.len() >= u64::from(u32::MAX));
    zip.start_file(name.as_str(), opts).map_err(|e| format!("zip entry: {e}"))?;
    if let Err(e) = std::io::copy(&mut src, zip) {
        let _ = zip.abort_file();
        return Err(format!("read: {e}"));
    }
    Ok(name)
}
