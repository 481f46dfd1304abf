use percent_encoding::percent_decode_str;
use std::io;
use std::path::{Component, Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum PathError {
    #[error("path violation: {reason} ({requested:?})")]
    Violation { requested: String, reason: &'static str },
    #[error("resolve {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl PathError {
    fn violation(requested: &str, reason: &'static str) -> Self {
        PathError::Violation { requested: requested.to_string(), reason }
    }

    pub fn is_violation(&self) -> bool {
        matches!(self, PathError::Violation { .. })
    }
}

/// Normalize a client-supplied relative path into plain `Normal` segments.
///
/// Backslashes count as separators, `.` and empty segments collapse, and
/// anything that could climb out (`..`, absolute roots, drive prefixes) is
/// refused outright instead of being folded away.
///
/// The HTTP layer has already decoded the path once. A segment that still
/// holds `%` is decoded one more time and refused if that form is a dot
/// segment or carries a separator or NUL (`..%2f`, `..%252f`). Otherwise the
/// segment is kept literally, so a file named `100%.txt` stays reachable.
pub fn normalize(client_path: &str) -> Result<PathBuf, PathError> {
    if client_path.is_empty() {
        return Err(PathError::violation(client_path, "empty path"));
    }
    if client_path.contains('\0') {
        return Err(PathError::violation(client_path, "null byte"));
    }
    let unified = client_path.replace('\\', "/");
    if unified.starts_with('/') {
        return Err(PathError::violation(client_path, "absolute path"));
    }

    let mut out = PathBuf::new();
    for seg in unified.split('/') {
        match seg {
            "" | "." => continue,
            ".." => return Err(PathError::violation(client_path, "parent traversal")),
            s if s.contains('%') && hides_traversal(s) => {
                return Err(PathError::violation(client_path, "encoded traversal"))
            }
            s => {
                // Catches drive prefixes (`C:`) and anything else the platform
                // would not treat as one plain name.
                let mut comps = Path::new(s).components();
                match (comps.next(), comps.next()) {
                    (Some(Component::Normal(_)), None) => out.push(s),
                    _ => return Err(PathError::violation(client_path, "invalid segment")),
                }
            }
        }
    }
    if out.as_os_str().is_empty() {
        return Err(PathError::violation(client_path, "empty path"));
    }
    Ok(out)
}

fn hides_traversal(segment: &str) -> bool {
    let decoded = percent_decode_str(segment).decode_utf8_lossy();
    decoded == "."
        || decoded == ".."
        || decoded.contains(|c| matches!(c, '/' | '\\' | '\0'))
}

/// Links followed while looking for the existing part of a missing path.
const MAX_LINK_HOPS: u8 = 8;

/// Resolve `client_path` under `root`, refusing anything that lands outside it.
///
/// Containment is checked on path components (`pathdiff` plus
/// `Path::starts_with`), so `/data-secret` never passes for root `/data`.
/// The candidate is then checked again on canonical paths, which stops a
/// symlink inside the root from pointing elsewhere. A candidate that does not
/// exist is judged by its deepest existing ancestor (dangling links followed),
/// so a link out of the root gives the same answer whether or not the file
/// behind it exists.
pub fn resolve(root: &Path, client_path: &str) -> Result<PathBuf, PathError> {
    let rel = normalize(client_path)?;
    let candidate = root.join(&rel);

    match pathdiff::diff_paths(&candidate, root) {
        Some(d) if d.components().all(|c| matches!(c, Component::Normal(_))) => {}
        _ => return Err(PathError::violation(client_path, "escapes root")),
    }
    if !candidate.starts_with(root) {
        return Err(PathError::violation(client_path, "escapes root"));
    }

    let root_can = std::fs::canonicalize(root)
        .map_err(|e| PathError::Io { path: root.to_path_buf(), source: e })?;
    match std::fs::canonicalize(&candidate) {
        Ok(cand_can) => {
            if !cand_can.starts_with(&root_can) {
                return Err(PathError::violation(client_path, "escapes root via symlink"));
            }
            Ok(cand_can)
        }
        // missing, or under something that is not a directory
        Err(e) if e.kind() == io::ErrorKind::NotFound || !exists_as_entry(&candidate) => {
            let reached = existing_ancestor(&candidate, MAX_LINK_HOPS)
                .map_err(|e| PathError::Io { path: candidate.clone(), source: e })?;
            if !reached.starts_with(&root_can) {
                return Err(PathError::violation(client_path, "escapes root via symlink"));
            }
            // nothing to serve, but nothing escaped either
            Ok(candidate)
        }
        Err(e) => Err(PathError::Io { path: candidate, source: e }),
    }
}

fn exists_as_entry(p: &Path) -> bool {
    std::fs::symlink_metadata(p).is_ok()
}

/// Canonical form of the deepest ancestor of `path` that exists. A dangling
/// link on the way is followed to its target.
fn existing_ancestor(path: &Path, hops: u8) -> io::Result<PathBuf> {
    for a in path.ancestors() {
        let err = match std::fs::canonicalize(a) {
            Ok(c) => return Ok(c),
            Err(e) => e,
        };
        match std::fs::symlink_metadata(a) {
            Err(_) => continue,
            Ok(m) if m.file_type().is_symlink() => {
                if hops == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::Other,
                        "too many levels of symbolic links",
                    ));
                }
                let target = std::fs::read_link(a)?;
                let base = a.parent().unwrap_or(a);
                return existing_ancestor(&base.join(target), hops - 1);
            }
            Ok(_) => return Err(err),
        }
    }
    Err(io::Error::new(io::ErrorKind::NotFound, "no existing ancestor"))
}
