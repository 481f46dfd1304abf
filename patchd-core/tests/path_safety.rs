use patchd_core::path_safety::{normalize, resolve};
use std::fs;
use std::path::PathBuf;

fn root_with_file() -> (tempfile::TempDir, PathBuf) {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().join("data");
    fs::create_dir_all(root.join("sub")).unwrap();
    fs::write(root.join("file.txt"), b"hello").unwrap();
    fs::write(root.join("sub/inner.txt"), b"inner").unwrap();
    (tmp, root)
}

#[test]
fn plain_names_resolve_inside_root() {
    let (_tmp, root) = root_with_file();
    let p = resolve(&root, "file.txt").unwrap();
    assert_eq!(fs::read(&p).unwrap(), b"hello");
    let p = resolve(&root, "sub/inner.txt").unwrap();
    assert_eq!(fs::read(&p).unwrap(), b"inner");
    // dot segments and doubled separators collapse
    let p = resolve(&root, "./sub//inner.txt").unwrap();
    assert_eq!(fs::read(&p).unwrap(), b"inner");
}

#[test]
fn nonexistent_file_resolves_to_candidate() {
    let (_tmp, root) = root_with_file();
    let p = resolve(&root, "later.bin").unwrap();
    assert_eq!(p, root.join("later.bin"));
}

#[test]
fn traversal_forms_are_rejected() {
    let (_tmp, root) = root_with_file();
    for bad in [
        "../etc/passwd",
        "../../etc/passwd",
        "sub/../../secret",
        "sub/../file.txt",
        "..",
        "..\\..\\windows\\win.ini",
        "sub\\..\\..\\x",
        "..%2f..%2fetc%2fpasswd",
        "..%5c..%5csecret",
        "%2e%2e/secret",
        "sub/%2e%2e%2f%2e%2e%2fsecret",
        "a%00.txt",
        "/etc/passwd",
        "\\etc\\passwd",
        "",
        "/",
        ".",
        "file.txt\0.png",
    ] {
        let err = resolve(&root, bad).expect_err(bad);
        assert!(err.is_violation(), "{bad:?} gave {err}");
    }
}

#[test]
fn literal_percent_names_are_reachable() {
    let (_tmp, root) = root_with_file();
    fs::write(root.join("100%.txt"), b"full").unwrap();
    let p = resolve(&root, "100%.txt").unwrap();
    assert_eq!(fs::read(p).unwrap(), b"full");
    // one decode only: a doubly escaped separator stays part of the name
    let p = resolve(&root, "..%252fetc").unwrap();
    assert_eq!(p, root.join("..%252fetc"));
}

#[test]
fn normalize_keeps_only_plain_segments() {
    assert_eq!(normalize("a/./b").unwrap(), PathBuf::from("a").join("b"));
    assert_eq!(normalize("a\\b").unwrap(), PathBuf::from("a").join("b"));
    assert!(normalize("a/../b").is_err());
    assert!(normalize("./").is_err());
}

#[cfg(target_family = "unix")]
#[test]
fn symlink_pointing_outside_is_rejected() {
    let (tmp, root) = root_with_file();
    let outside = tmp.path().join("outside.txt");
    fs::write(&outside, b"outside").unwrap();
    std::os::unix::fs::symlink(&outside, root.join("escape.txt")).unwrap();
    std::os::unix::fs::symlink(tmp.path(), root.join("up")).unwrap();

    let err = resolve(&root, "escape.txt").unwrap_err();
    assert!(err.is_violation());
    let err = resolve(&root, "up/outside.txt").unwrap_err();
    assert!(err.is_violation());
}

#[cfg(target_family = "unix")]
#[test]
fn symlink_staying_inside_is_followed() {
    let (_tmp, root) = root_with_file();
    std::os::unix::fs::symlink(root.join("sub/inner.txt"), root.join("alias.txt")).unwrap();
    let p = resolve(&root, "alias.txt").unwrap();
    assert_eq!(fs::read(p).unwrap(), b"inner");
}

#[cfg(target_family = "unix")]
#[test]
fn sibling_directory_with_shared_prefix_is_not_inside() {
    let (tmp, root) = root_with_file();
    let sibling = tmp.path().join("data-other");
    fs::create_dir_all(&sibling).unwrap();
    fs::write(sibling.join("secret.txt"), b"secret").unwrap();
    // the canonical target starts with the root's string, not its components
    std::os::unix::fs::symlink(sibling.join("secret.txt"), root.join("peek")).unwrap();
    std::os::unix::fs::symlink(&sibling, root.join("peekdir")).unwrap();

    assert!(resolve(&root, "peek").unwrap_err().is_violation());
    assert!(resolve(&root, "peekdir/secret.txt").unwrap_err().is_violation());
}

#[cfg(target_family = "unix")]
#[test]
fn missing_files_behind_escaping_links_look_the_same_as_existing_ones() {
    let (tmp, root) = root_with_file();
    fs::write(tmp.path().join("outside.txt"), b"outside").unwrap();
    std::os::unix::fs::symlink(tmp.path(), root.join("up")).unwrap();
    std::os::unix::fs::symlink(tmp.path().join("gone.txt"), root.join("dangling")).unwrap();
    std::os::unix::fs::symlink(tmp.path().join("gone"), root.join("dangling_dir")).unwrap();

    for p in ["up/outside.txt", "up/not-there.txt", "up/no/such/dir", "dangling", "dangling_dir/x"] {
        let err = resolve(&root, p).expect_err(p);
        assert!(err.is_violation(), "{p:?} gave {err}");
    }
}

#[cfg(target_family = "unix")]
#[test]
fn dangling_link_inside_root_is_just_missing() {
    let (_tmp, root) = root_with_file();
    std::os::unix::fs::symlink(root.join("not-yet.bin"), root.join("stale")).unwrap();
    assert_eq!(resolve(&root, "stale").unwrap(), root.join("stale"));
    assert_eq!(resolve(&root, "sub/later/deeper.bin").unwrap(), root.join("sub/later/deeper.bin"));
}

#[cfg(target_family = "unix")]
#[test]
fn path_below_a_regular_file_is_just_missing() {
    let (_tmp, root) = root_with_file();
    assert_eq!(resolve(&root, "file.txt/x").unwrap(), root.join("file.txt/x"));
}
