use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::manifest::Manifest;

/// filename -> hash as reported by a client.
pub type ClientFileSet = HashMap<String, String>;

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct ReconciliationResult {
    pub valid: bool,
    pub mismatches: Vec<String>,
    pub missing: Vec<String>,
}

/// Classify the server's files against what the client holds.
///
/// Client files the manifest does not list are ignored here; see [`extras`].
/// Both result lists come back sorted so the output does not depend on map
/// iteration or manifest order.
pub fn reconcile(manifest: &Manifest, client: &ClientFileSet) -> ReconciliationResult {
    let mut mismatches = Vec::new();
    let mut missing = Vec::new();
    for fe in &manifest.files {
        match client.get(&fe.file_name) {
            None => missing.push(fe.file_name.clone()),
            Some(h) if *h != fe.hash => mismatches.push(fe.file_name.clone()),
            Some(_) => {}
        }
    }
    mismatches.sort_unstable();
    missing.sort_unstable();
    ReconciliationResult { valid: mismatches.is_empty() && missing.is_empty(), mismatches, missing }
}

/// Client-side names that the manifest does not know about, sorted.
pub fn extras(manifest: &Manifest, client: &ClientFileSet) -> Vec<String> {
    let known: std::collections::HashSet<&str> =
        manifest.files.iter().map(|f| f.file_name.as_str()).collect();
    let mut out: Vec<String> =
        client.keys().filter(|k| !known.contains(k.as_str())).cloned().collect();
    out.sort_unstable();
    out
}
