use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use tokio_util::sync::CancellationToken;

use crate::bundle::{self, Bundle};
use crate::error::ServiceError;
use crate::manifest::{self, Manifest, ManifestOptions};
use crate::path_safety;
use crate::reconcile::{self, ClientFileSet, ReconciliationResult};

/// Outcome of a conditional manifest read. Both arms carry the snapshot the
/// decision was made against.
#[derive(Debug, Clone)]
pub enum Conditional<T> {
    Modified(T),
    Unchanged(T),
}

#[derive(Debug)]
pub struct ServedFile {
    pub path: PathBuf,
    pub len: u64,
    pub file: tokio::fs::File,
}

/// Owns the file root and the manifest currently being served.
///
/// The manifest is an immutable `Arc` snapshot. Readers clone the `Arc` and
/// keep that generation for as long as they need it; `create_patch` builds a
/// complete new manifest first and only then swaps the pointer. The `RwLock`
/// only ever guards the pointer clone or swap.
pub struct DistributionService {
    root: PathBuf,
    options: ManifestOptions,
    current: RwLock<Arc<Manifest>>,
    patch_lock: tokio::sync::Mutex<()>,
}

impl DistributionService {
    pub fn new(root: impl Into<PathBuf>, manifest: Manifest, options: ManifestOptions) -> Self {
        Self {
            root: root.into(),
            options,
            current: RwLock::new(Arc::new(manifest)),
            patch_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Load (or generate and persist) the manifest for `root`.
    pub fn open(root: impl Into<PathBuf>, options: ManifestOptions) -> Result<Self> {
        let root = root.into();
        let m = manifest::load_with(&root, &options)
            .with_context(|| format!("establish manifest for {:?}", root))?;
        Ok(Self::new(root, m, options))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest(&self) -> Arc<Manifest> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn version(&self) -> String {
        self.manifest().version.clone()
    }

    /// Cache validator for the current manifest: its version string.
    pub fn etag(&self) -> String {
        self.version()
    }

    /// `Unchanged` when any of the caller's validators is the current
    /// version. The comparison and the returned snapshot are the same
    /// generation.
    pub fn manifest_if_changed(&self, seen: &[&str]) -> Conditional<Arc<Manifest>> {
        let m = self.manifest();
        if seen.iter().any(|v| *v == m.version) {
            Conditional::Unchanged(m)
        } else {
            Conditional::Modified(m)
        }
    }

    pub async fn open_file(&self, client_path: &str) -> Result<ServedFile, ServiceError> {
        let path = path_safety::resolve(&self.root, client_path)?;
        let meta = match tokio::fs::metadata(&path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ServiceError::NotFound(client_path.to_string()))
            }
            Err(e) => return Err(anyhow::Error::new(e).context(format!("stat {:?}", path)).into()),
        };
        if !meta.is_file() {
            return Err(ServiceError::NotFound(client_path.to_string()));
        }
        let file = tokio::fs::File::open(&path)
            .await
            .with_context(|| format!("open {:?}", path))?;
        Ok(ServedFile { path, len: meta.len(), file })
    }

    /// Build a zip of `paths` on the blocking pool. Entries that cannot be
    /// resolved or read are skipped and reported in the bundle.
    pub async fn bundle(
        &self,
        paths: Vec<String>,
        cancel: CancellationToken,
    ) -> Result<Bundle, ServiceError> {
        if paths.is_empty() {
            return Err(ServiceError::Validation("no files specified".into()));
        }
        let root = self.root.clone();
        let b = tokio::task::spawn_blocking(move || bundle::write_bundle(&root, &paths, &cancel))
            .await
            .map_err(|e| anyhow!("bundle task failed: {e}"))??;
        Ok(b)
    }

    pub fn verify(&self, client: &ClientFileSet) -> ReconciliationResult {
        reconcile::reconcile(&self.manifest(), client)
    }

    /// Rescan the root under `version`, persist, then swap it in. On any
    /// failure the previously served manifest stays in place.
    pub async fn create_patch(&self, version: &str) -> Result<Arc<Manifest>, ServiceError> {
        let version = version.trim();
        if version.is_empty() {
            return Err(ServiceError::Validation("version is required".into()));
        }
        // the version doubles as the HTTP cache validator
        if !version.chars().all(|c| c.is_ascii_graphic() && c != '"') {
            return Err(ServiceError::Validation(
                "version must be printable ASCII without quotes".into(),
            ));
        }
        let _guard = self.patch_lock.lock().await;

        let root = self.root.clone();
        let options = self.options.clone();
        let v = version.to_string();
        let fresh = tokio::task::spawn_blocking(move || -> Result<Manifest> {
            let m = manifest::generate_with(&v, &root, &options)?;
            manifest::save(&m, &root)?;
            Ok(m)
        })
        .await
        .map_err(|e| anyhow!("patch task failed: {e}"))??;

        let fresh = Arc::new(fresh);
        let previous = {
            let mut cur = self.current.write().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *cur, Arc::clone(&fresh))
        };
        tracing::info!(
            from = %previous.version,
            to = %fresh.version,
            files = fresh.files.len(),
            "manifest replaced"
        );
        Ok(fresh)
    }
}
