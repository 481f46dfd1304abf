use patchd_core::hash::hash_bytes;
use patchd_core::manifest::{self, ManifestOptions, INITIAL_VERSION};
use patchd_core::reconcile::ClientFileSet;
use patchd_core::service::{Conditional, DistributionService};
use patchd_core::ServiceError;
use std::io::Read;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

fn service() -> (tempfile::TempDir, DistributionService) {
    let td = tempfile::tempdir().unwrap();
    std::fs::write(td.path().join("game.pak"), b"pak-v1").unwrap();
    std::fs::write(td.path().join("readme.txt"), b"hello").unwrap();
    let svc = DistributionService::open(td.path(), ManifestOptions::default()).unwrap();
    (td, svc)
}

#[test]
fn open_establishes_initial_manifest() {
    let (td, svc) = service();
    assert_eq!(svc.version(), INITIAL_VERSION);
    assert_eq!(svc.etag(), INITIAL_VERSION);
    assert_eq!(svc.manifest().len(), 2);
    assert!(manifest::manifest_path(td.path()).exists());
}

#[test]
fn conditional_read_compares_against_current_version() {
    let (_td, svc) = service();
    assert!(matches!(svc.manifest_if_changed(&["1.0.0"]), Conditional::Unchanged(_)));
    assert!(matches!(svc.manifest_if_changed(&["0.9", "1.0.0"]), Conditional::Unchanged(_)));
    assert!(matches!(svc.manifest_if_changed(&["0.9"]), Conditional::Modified(_)));
    assert!(matches!(svc.manifest_if_changed(&[]), Conditional::Modified(_)));
}

#[tokio::test]
async fn open_file_streams_contents() {
    let (_td, svc) = service();
    let mut served = svc.open_file("readme.txt").await.unwrap();
    assert_eq!(served.len, 5);
    let mut buf = Vec::new();
    served.file.read_to_end(&mut buf).await.unwrap();
    assert_eq!(buf, b"hello");
}

#[tokio::test]
async fn open_file_classifies_failures() {
    let (td, svc) = service();
    std::fs::create_dir(td.path().join("subdir")).unwrap();
    assert!(matches!(svc.open_file("../etc/passwd").await, Err(ServiceError::PathViolation(_))));
    assert!(matches!(svc.open_file("nope.bin").await, Err(ServiceError::NotFound(_))));
    assert!(matches!(svc.open_file("subdir").await, Err(ServiceError::NotFound(_))));
}

#[test]
fn verify_uses_current_manifest() {
    let (_td, svc) = service();
    let mut c = ClientFileSet::new();
    c.insert("game.pak".into(), hash_bytes(b"pak-v1"));
    let r = svc.verify(&c);
    assert!(!r.valid);
    assert_eq!(r.missing, ["readme.txt"]);
    c.insert("readme.txt".into(), hash_bytes(b"hello"));
    assert!(svc.verify(&c).valid);
}

#[tokio::test]
async fn create_patch_rescans_persists_and_swaps() {
    let (td, svc) = service();
    let old = svc.manifest();
    std::fs::write(td.path().join("game.pak"), b"pak-v2").unwrap();
    std::fs::write(td.path().join("extra.dlc"), b"dlc").unwrap();

    let m = svc.create_patch(" 1.1.0 ").await.unwrap();
    assert_eq!(m.version, "1.1.0");
    assert_eq!(svc.version(), "1.1.0");
    assert_eq!(m.entry("game.pak").unwrap().hash, hash_bytes(b"pak-v2"));
    assert!(m.entry("extra.dlc").is_some());

    // earlier snapshots are untouched
    assert_eq!(old.version, INITIAL_VERSION);
    assert_eq!(old.entry("game.pak").unwrap().hash, hash_bytes(b"pak-v1"));

    let persisted = manifest::load(td.path()).unwrap();
    assert_eq!(persisted, *m);
}

#[tokio::test]
async fn create_patch_rejects_unusable_versions() {
    let (_td, svc) = service();
    for bad in ["", "   ", "1.0 beta", "v\"2"] {
        assert!(
            matches!(svc.create_patch(bad).await, Err(ServiceError::Validation(_))),
            "{bad:?}"
        );
    }
    assert_eq!(svc.version(), INITIAL_VERSION);
}

#[tokio::test]
async fn failed_patch_keeps_serving_previous_manifest() {
    let td = tempfile::tempdir().unwrap();
    let root = td.path().join("release");
    std::fs::create_dir(&root).unwrap();
    std::fs::write(root.join("a.bin"), b"a").unwrap();
    let svc = DistributionService::open(&root, ManifestOptions::default()).unwrap();

    std::fs::remove_dir_all(&root).unwrap();
    let err = svc.create_patch("2.0.0").await.unwrap_err();
    assert!(matches!(err, ServiceError::Io(_)));
    assert_eq!(svc.version(), INITIAL_VERSION);
    assert_eq!(svc.manifest().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn readers_always_see_a_whole_generation() {
    let (td, svc) = service();
    let svc = Arc::new(svc);
    let v1_files = svc.manifest().files.clone();
    std::fs::write(td.path().join("game.pak"), b"pak-v2").unwrap();
    let v2_hash = hash_bytes(b"pak-v2");

    let readers: Vec<_> = (0..8)
        .map(|_| {
            let svc = svc.clone();
            let v1_files = v1_files.clone();
            let v2_hash = v2_hash.clone();
            tokio::spawn(async move {
                for _ in 0..200 {
                    let m = svc.manifest();
                    let pak = &m.entry("game.pak").unwrap().hash;
                    match m.version.as_str() {
                        "1.0.0" => assert_eq!(m.files, v1_files),
                        "2.0.0" => assert_eq!(pak, &v2_hash),
                        other => panic!("unexpected version {other}"),
                    }
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();

    svc.create_patch("2.0.0").await.unwrap();
    for r in readers {
        r.await.unwrap();
    }
    assert_eq!(svc.version(), "2.0.0");
}

#[tokio::test]
async fn bundle_packs_requested_files_and_skips_bad_ones() {
    let (_td, svc) = service();
    let req = vec![
        "game.pak".to_string(),
        "../../etc/passwd".to_string(),
        "missing.bin".to_string(),
        "readme.txt".to_string(),
        "game.pak".to_string(),
    ];
    let b = svc.bundle(req, CancellationToken::new()).await.unwrap();
    assert_eq!(b.included, ["game.pak", "readme.txt"]);
    let skipped: Vec<_> = b.skipped.iter().map(|s| s.path.as_str()).collect();
    assert_eq!(skipped, ["../../etc/passwd", "missing.bin", "game.pak"]);
    assert!(b.is_partial());

    let mut zip = zip::ZipArchive::new(b.file).unwrap();
    assert_eq!(zip.len(), 2);
    let mut s = String::new();
    zip.by_name("readme.txt").unwrap().read_to_string(&mut s).unwrap();
    assert_eq!(s, "hello");
}

#[tokio::test]
async fn bundle_requires_at_least_one_path() {
    let (_td, svc) = service();
    let err = svc.bundle(Vec::new(), CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, ServiceError::Validation(_)));
}

#[tokio::test]
async fn cancelled_bundle_fails() {
    let (_td, svc) = service();
    let cancel = CancellationToken::new();
    cancel.cancel();
    assert!(svc.bundle(vec!["game.pak".into()], cancel).await.is_err());
}
