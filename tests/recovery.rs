// tests/recovery.rs

//! Interrupted transactions: repair classification and fsck reporting.

mod common;

use cefs::config::FsckConfig;
use cefs::fsck::{Fsck, ManifestCheck};
use cefs::image;
use cefs::manifest;
use cefs::paths::{backup_path, delete_marker_path};
use cefs::transaction::{backup_and_symlink_with, find_inprogress_manifests, RepairAction};
use cefs::{
    backup_and_symlink, deploy_transactional, BackupCleanup, ContentEntry, ContentHash, Error,
    Filter, Manifest, Operation, Repairer, TransactionStatus,
};
use common::{FakeTool, TestStore};
use std::fs;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

const OLD: u64 = 2 * 3600;

/// Leave an in-progress transaction for `rels`, swapping only `swapped`
fn interrupted(store: &TestStore, rels: &[&str], swapped: &[&str]) -> PathBuf {
    let key = rels.join("+");
    let source = store.staged(&key, "VERSION", &key);
    let built = image::build_from_dir(&FakeTool, &source, &store.work_dir()).unwrap();
    let image_path = store.layout.image_path(&built.hash, "consolidated");
    let manifest = Manifest::create(
        Operation::Consolidate,
        "interrupted",
        rels.iter()
            .map(|rel| ContentEntry::new(format!("libs/{} 1.0", rel), store.ns(rel)))
            .collect(),
        None,
    );

    let result: Result<(), Error> = deploy_transactional(built.path(), &image_path, &manifest, |_| {
        for rel in swapped {
            let target = store.layout.mount_path(&built.hash, Some(rel.as_ref()));
            std::os::unix::fs::symlink(target, store.ns(rel))?;
        }
        Err(Error::NotFound("simulated crash".to_string()))
    });
    assert!(result.is_err());

    let inprogress = manifest::inprogress_path(&image_path);
    store.age(&inprogress, OLD);
    image_path
}

fn repairer(store: &TestStore) -> Repairer<'_> {
    Repairer::new(&store.layout, Duration::from_secs(3600))
}

#[test]
fn test_classification_buckets() {
    let store = TestStore::new();
    let complete = interrupted(&store, &["a", "b"], &["a", "b"]);
    let partial = interrupted(&store, &["c", "d"], &["c"]);
    let early = interrupted(&store, &["e"], &[]);

    let r = repairer(&store);
    let status = |image: &PathBuf| {
        r.classify(&manifest::inprogress_path(image))
            .unwrap()
            .status
    };
    assert_eq!(status(&complete), TransactionStatus::FullyComplete);
    assert_eq!(status(&partial), TransactionStatus::PartiallyComplete);
    assert_eq!(status(&early), TransactionStatus::FailedEarly);
}

#[test]
fn test_conflicting_destination_is_left_alone() {
    let store = TestStore::new();
    let image = interrupted(&store, &["a", "b"], &["a"]);
    std::os::unix::fs::symlink("/elsewhere/entirely", store.ns("b")).unwrap();

    let report = repairer(&store)
        .classify(&manifest::inprogress_path(&image))
        .unwrap();
    assert_eq!(report.status, TransactionStatus::Conflicted);
    assert_eq!(report.action(), RepairAction::Skip);
    assert_eq!(report.destinations.conflicting.len(), 1);
}

#[test]
fn test_fully_superseded_transaction_is_kept_for_operator() {
    let store = TestStore::new();
    let image = interrupted(&store, &["a", "b"], &[]);
    let newer = ContentHash::new("0123456789abcdef01234567").unwrap();
    for rel in ["a", "b"] {
        store.point(rel, &store.layout.mount_path(&newer, None));
    }

    let (outcomes, failures) = repairer(&store).run(&Filter::default(), false).unwrap();

    assert!(failures.is_empty());
    assert_eq!(outcomes[0].report.status, TransactionStatus::Conflicted);
    assert_eq!(outcomes[0].report.destinations.conflicting.len(), 2);
    assert!(!outcomes[0].applied);
    assert!(image.exists());
    assert!(manifest::inprogress_path(&image).exists());
}

/// Deploy `content` for `rel` the way install does; `Err` when the swap fails
fn deploy(store: &TestStore, name: &str, rel: &str, content: &str) -> Result<PathBuf, Error> {
    let source = store.staged(rel, "VERSION", content);
    let built = image::build_from_dir(&FakeTool, &source, &store.work_dir())?;
    let dest = store.ns(rel);
    let image_path = store.layout.image_path(
        &built.hash,
        &store.layout.describe_suffix("install", Some(&dest)),
    );
    let manifest = Manifest::create(
        Operation::Install,
        format!("install {}", name),
        vec![ContentEntry::new(name, &dest)],
        None,
    );
    let mount = store.layout.mount_path(&built.hash, None);

    deploy_transactional(built.path(), &image_path, &manifest, |_| {
        backup_and_symlink(&dest, &mount, BackupCleanup::Immediate)
    })?;
    Ok(image_path)
}

#[test]
fn test_failed_twin_install_leaves_live_image() {
    let store = TestStore::new();
    let live = deploy(&store, "compilers/gcc 13.1.0", "gcc-13.1.0", "13.1.0").unwrap();

    // Same bytes under another name; the namespace parent is missing so the
    // swap fails after the in-progress manifest is written
    let err = deploy(&store, "compilers/gcc-copy 13.1.0", "missing/gcc-copy", "13.1.0");
    assert!(matches!(err, Err(Error::SymlinkFailure { .. })));
    let inprogress = find_inprogress_manifests(&store.layout).unwrap();
    assert_eq!(inprogress.len(), 1);
    assert_ne!(manifest::image_for_inprogress(&inprogress[0]).unwrap(), live);
    store.age(&inprogress[0], OLD);

    let (outcomes, failures) = Repairer::new(&store.layout, Duration::ZERO)
        .run(&Filter::default(), false)
        .unwrap();

    assert!(failures.is_empty());
    assert_eq!(outcomes[0].report.status, TransactionStatus::FailedEarly);
    assert!(outcomes[0].applied);
    assert!(live.exists());
    let manifest = Manifest::read_alongside(&live).unwrap().unwrap();
    assert_eq!(manifest.names().collect::<Vec<_>>(), vec!["compilers/gcc 13.1.0"]);
    let target = fs::read_link(store.ns("gcc-13.1.0")).unwrap();
    let hash = store.layout.hash_from_mount_path(&target).unwrap();
    assert_eq!(store.layout.find_image(&hash).unwrap(), Some(live));
}

#[test]
fn test_failed_redeploy_keeps_finalized_image() {
    let store = TestStore::new();
    let live = deploy(&store, "compilers/gcc 13.1.0", "gcc-13.1.0", "13.1.0").unwrap();

    // A second transaction on the very same file that never swapped
    let manifest = Manifest::create(
        Operation::Install,
        "install compilers/gcc 13.1.0",
        vec![ContentEntry::new("compilers/gcc 13.1.0", store.ns("elsewhere"))],
        None,
    );
    let result: Result<(), Error> = deploy_transactional(&live, &live, &manifest, |_| {
        Err(Error::NotFound("simulated crash".to_string()))
    });
    assert!(result.is_err());
    store.age(&manifest::inprogress_path(&live), OLD);

    let (outcomes, _) = Repairer::new(&store.layout, Duration::ZERO)
        .run(&Filter::default(), false)
        .unwrap();

    assert_eq!(outcomes[0].report.status, TransactionStatus::FailedEarly);
    assert!(outcomes[0].kept_image.is_some());
    assert!(live.exists());
    assert!(manifest::manifest_path(&live).exists());
    assert!(!manifest::inprogress_path(&live).exists());
}

#[test]
fn test_rolled_back_destination_still_counts() {
    let store = TestStore::new();
    let image = interrupted(&store, &["a"], &["a"]);
    // A rollback moved the new link to .bak and restored a plain directory
    fs::rename(store.ns("a"), backup_path(&store.ns("a"))).unwrap();
    fs::create_dir(store.ns("a")).unwrap();

    let report = repairer(&store)
        .classify(&manifest::inprogress_path(&image))
        .unwrap();
    assert_eq!(report.status, TransactionStatus::FullyComplete);
}

#[test]
fn test_repair_is_idempotent() {
    let store = TestStore::new();
    let complete = interrupted(&store, &["a"], &["a"]);
    let early = interrupted(&store, &["b"], &[]);
    let early_size = fs::metadata(&early).unwrap().len()
        + fs::metadata(manifest::inprogress_path(&early)).unwrap().len();

    let (outcomes, failures) = repairer(&store).run(&Filter::default(), false).unwrap();
    assert!(failures.is_empty());
    assert_eq!(outcomes.len(), 2);
    assert_eq!(
        outcomes.iter().map(|o| o.reclaimed_bytes).sum::<u64>(),
        early_size
    );
    assert!(manifest::manifest_path(&complete).exists());
    assert!(!early.exists());

    let (outcomes, failures) = repairer(&store).run(&Filter::default(), false).unwrap();
    assert!(outcomes.is_empty());
    assert!(failures.is_empty());
}

#[test]
fn test_repair_dry_run_and_filter() {
    let store = TestStore::new();
    let a = interrupted(&store, &["a"], &["a"]);
    let b = interrupted(&store, &["b"], &[]);

    let (outcomes, _) = repairer(&store).run(&Filter::new(["libs/a"]), true).unwrap();
    assert_eq!(outcomes.len(), 1);
    assert!(!outcomes[0].applied);
    assert!(manifest::inprogress_path(&a).exists());
    assert!(manifest::inprogress_path(&b).exists());
}

#[test]
fn test_young_transaction_waits() {
    let store = TestStore::new();
    let image = interrupted(&store, &["a"], &[]);
    store.age(&manifest::inprogress_path(&image), 60);

    let (outcomes, _) = repairer(&store).run(&Filter::default(), false).unwrap();
    assert_eq!(outcomes[0].report.status, TransactionStatus::TooRecent);
    assert!(image.exists());
}

#[test]
fn test_failed_swap_restores_previous_entry() {
    let store = TestStore::new();
    let dest = store.ns("gcc");
    fs::create_dir(&dest).unwrap();
    fs::write(dest.join("VERSION"), "old").unwrap();

    let err = backup_and_symlink_with(
        &dest,
        &store.layout.mount_point.join("ab/whatever"),
        BackupCleanup::Immediate,
        |_, _| Err(io::Error::new(io::ErrorKind::PermissionDenied, "denied")),
    )
    .unwrap_err();

    assert!(matches!(err, Error::SymlinkFailure { .. }));
    assert_eq!(fs::read_to_string(dest.join("VERSION")).unwrap(), "old");
    assert!(!backup_path(&dest).exists());
}

#[test]
fn test_fsck_reports_leftovers() {
    let store = TestStore::new();
    let image = interrupted(&store, &["a"], &[]);
    let bak = backup_path(&store.ns("lib"));
    fs::create_dir_all(bak.join("nested.bak")).unwrap();
    let marker = delete_marker_path(&store.ns("old"), chrono::Local::now());
    fs::write(&marker, "x").unwrap();
    for path in [&bak, &marker] {
        let when = std::time::SystemTime::now() - Duration::from_secs(OLD);
        fs::File::open(path).unwrap().set_modified(when).unwrap();
    }

    let config = FsckConfig {
        stale_after_secs: 3600,
        ..FsckConfig::default()
    };
    let report = Fsck::new(&store.layout, &config).run().unwrap();

    // In-progress images have no finalized manifest yet
    assert_eq!(report.images.len(), 1);
    assert_eq!(report.images[0].manifest, ManifestCheck::Missing);
    assert!(!report.manifests_ok());
    assert_eq!(report.stale_inprogress.len(), 1);
    assert_eq!(report.stale_inprogress[0].path, manifest::inprogress_path(&image));
    assert_eq!(report.stale_backups.len(), 1, "matched .bak is not descended into");
    assert_eq!(report.stale_backups[0].path, bak);
    assert_eq!(report.stale_delete_markers.len(), 1);
}
