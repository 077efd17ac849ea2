//! Integration tests for the stage/deploy cycle.
//!
//! These tests drive `CharmDeployer` against a real directory tree with an
//! in-memory charm store and check what is left on disk after each outcome.

mod common;

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use plfm_charm_agent::cancel::{CancelHandle, CancelSignal};
use plfm_charm_agent::charm::{
    CharmDeployer, ConflictReason, DeployLock, DeployerConfig, DeploymentOutcome,
};

use common::{deployer, desired, entries, simple_charm, MemoryDownloader};

fn store_with(charms: &[(&str, &str)]) -> Arc<MemoryDownloader> {
    let downloader = MemoryDownloader::new();
    for (locator, name) in charms {
        downloader.serve(locator, simple_charm(name));
    }
    downloader
}

#[tokio::test]
async fn test_deploy_exposes_charm_through_current() {
    let tmp = TempDir::new().unwrap();
    let archive = simple_charm("mysql");
    let downloader = MemoryDownloader::new();
    downloader.serve("cs:mysql-7", archive.clone());
    let deployer = deployer(tmp.path(), downloader, "worker-a");
    let cancel = CancelSignal::never();

    assert!(deployer.active().unwrap().is_none());

    let spec = desired("cs:mysql-7", &archive, 1);
    let outcome = deployer.run_cycle(&spec.descriptor(), &cancel).await;
    assert!(outcome.is_deployed(), "{outcome:?}");

    let active = deployer.active().unwrap().unwrap();
    assert_eq!(active.locator, "cs:mysql-7");
    assert_eq!(active.digest, spec.content_digest);

    let metadata = fs::read_to_string(deployer.current_path().join("metadata.yaml")).unwrap();
    assert!(metadata.contains("name: mysql"));

    assert!(entries(&deployer.staging_dir()).is_empty());
    assert!(!deployer.lock_path().exists());
}

#[tokio::test]
async fn test_stage_does_not_touch_active_deployment() {
    let tmp = TempDir::new().unwrap();
    let downloader = store_with(&[("cs:mysql-7", "mysql"), ("cs:mysql-8", "mysql-next")]);
    let deployer = deployer(tmp.path(), downloader, "worker-a");
    let cancel = CancelSignal::never();

    let v7 = desired("cs:mysql-7", &simple_charm("mysql"), 1);
    assert!(deployer.run_cycle(&v7.descriptor(), &cancel).await.is_deployed());
    let before = deployer.active().unwrap().unwrap();

    let v8 = desired("cs:mysql-8", &simple_charm("mysql-next"), 2);
    let handle = deployer.stage(&v8.descriptor(), &cancel).await.unwrap();

    assert!(handle.candidate_dir().join("metadata.yaml").exists());
    assert_eq!(handle.staged_against(), Some(before.version.as_str()));
    assert_eq!(deployer.active().unwrap().unwrap().version, before.version);
    let metadata = fs::read_to_string(deployer.current_path().join("metadata.yaml")).unwrap();
    assert!(metadata.contains("name: mysql\n"));

    assert!(deployer.deploy(handle, &cancel).await.is_deployed());
    let after = deployer.active().unwrap().unwrap();
    assert_eq!(after.locator, "cs:mysql-8");
    assert_ne!(after.version, before.version);

    // Only the new version remains.
    assert_eq!(entries(&deployer.versions_dir()), vec![after.version]);
    assert!(entries(&deployer.staging_dir()).is_empty());
}

#[tokio::test]
async fn test_dropped_handle_cleans_staging() {
    let tmp = TempDir::new().unwrap();
    let downloader = store_with(&[("cs:mysql-7", "mysql")]);
    let deployer = deployer(tmp.path(), downloader, "worker-a");

    let spec = desired("cs:mysql-7", &simple_charm("mysql"), 1);
    let handle = deployer
        .stage(&spec.descriptor(), &CancelSignal::never())
        .await
        .unwrap();
    assert!(!entries(&deployer.staging_dir()).is_empty());

    drop(handle);
    assert!(entries(&deployer.staging_dir()).is_empty());
    assert!(deployer.active().unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_deploys_exactly_one_wins() {
    let tmp = TempDir::new().unwrap();
    let downloader = store_with(&[("cs:mysql-7", "mysql"), ("cs:mysql-8", "mysql-next")]);

    let a = Arc::new(deployer(tmp.path(), downloader.clone(), "worker-a"));
    let b = Arc::new(deployer(tmp.path(), downloader, "worker-b"));
    let cancel = CancelSignal::never();

    let v7 = desired("cs:mysql-7", &simple_charm("mysql"), 1);
    let v8 = desired("cs:mysql-8", &simple_charm("mysql-next"), 1);
    let handle_a = a.stage(&v7.descriptor(), &cancel).await.unwrap();
    let handle_b = b.stage(&v8.descriptor(), &cancel).await.unwrap();

    let task_a = tokio::spawn({
        let a = Arc::clone(&a);
        async move { a.deploy(handle_a, &CancelSignal::never()).await }
    });
    let task_b = tokio::spawn({
        let b = Arc::clone(&b);
        async move { b.deploy(handle_b, &CancelSignal::never()).await }
    });
    let outcomes = [task_a.await.unwrap(), task_b.await.unwrap()];

    let deployed = outcomes.iter().filter(|o| o.is_deployed()).count();
    let conflicts = outcomes.iter().filter(|o| o.is_conflict()).count();
    assert_eq!(deployed, 1, "{outcomes:?}");
    assert_eq!(conflicts, 1, "{outcomes:?}");

    let winner = if outcomes[0].is_deployed() {
        "cs:mysql-7"
    } else {
        "cs:mysql-8"
    };
    let active = a.active().unwrap().unwrap();
    assert_eq!(active.locator, winner);
    assert_eq!(entries(&a.versions_dir()), vec![active.version]);
    assert!(entries(&a.staging_dir()).is_empty());
    assert!(!a.lock_path().exists());
}

#[tokio::test]
async fn test_unsyncable_root_keeps_new_version() {
    use std::os::unix::fs::PermissionsExt;

    let tmp = TempDir::new().unwrap();
    let archive = simple_charm("mysql");
    let downloader = MemoryDownloader::new();
    downloader.serve("cs:mysql-7", archive.clone());
    let deployer = deployer(tmp.path(), downloader, "worker-a");
    let cancel = CancelSignal::never();

    let spec = desired("cs:mysql-7", &archive, 1);
    let handle = deployer.stage(&spec.descriptor(), &cancel).await.unwrap();

    // Write and search but no read: the root can be changed but not opened for fsync.
    let root = deployer.root().to_path_buf();
    fs::set_permissions(&root, fs::Permissions::from_mode(0o300)).unwrap();
    if fs::read_dir(&root).is_ok() {
        // Permission bits are not enforced for this user.
        fs::set_permissions(&root, fs::Permissions::from_mode(0o755)).unwrap();
        return;
    }

    let outcome = deployer.deploy(handle, &cancel).await;
    fs::set_permissions(&root, fs::Permissions::from_mode(0o755)).unwrap();

    assert!(outcome.is_deployed(), "{outcome:?}");
    let active = deployer.active().unwrap().unwrap();
    assert_eq!(active.locator, "cs:mysql-7");
    assert!(deployer.current_path().join("metadata.yaml").exists());
}

#[tokio::test]
async fn test_deploy_while_peer_holds_lock_conflicts() {
    let tmp = TempDir::new().unwrap();
    let downloader = store_with(&[("cs:mysql-7", "mysql")]);
    let deployer = deployer(tmp.path(), downloader, "worker-a");
    let cancel = CancelSignal::never();
    let spec = desired("cs:mysql-7", &simple_charm("mysql"), 1);

    let peer = DeployLock::try_acquire(&deployer.lock_path(), "worker-b", Duration::from_secs(900))
        .unwrap()
        .unwrap();

    let handle = deployer.stage(&spec.descriptor(), &cancel).await.unwrap();
    match deployer.deploy(handle, &cancel).await {
        DeploymentOutcome::Conflict(ConflictReason::LockHeld { holder }) => {
            assert_eq!(holder.as_deref(), Some("worker-b"));
        }
        other => panic!("expected lock conflict, got {other:?}"),
    }
    assert!(deployer.active().unwrap().is_none());
    assert!(entries(&deployer.staging_dir()).is_empty());
    assert!(deployer.lock_path().exists());

    peer.release().unwrap();
    assert!(deployer.run_cycle(&spec.descriptor(), &cancel).await.is_deployed());
}

#[tokio::test]
async fn test_active_changed_since_stage_conflicts() {
    let tmp = TempDir::new().unwrap();
    let downloader = store_with(&[("cs:mysql-7", "mysql"), ("cs:mysql-8", "mysql-next")]);
    let a = deployer(tmp.path(), downloader.clone(), "worker-a");
    let b = deployer(tmp.path(), downloader, "worker-b");
    let cancel = CancelSignal::never();

    let v7 = desired("cs:mysql-7", &simple_charm("mysql"), 1);
    let v8 = desired("cs:mysql-8", &simple_charm("mysql-next"), 1);
    let stale = a.stage(&v7.descriptor(), &cancel).await.unwrap();
    assert!(b.run_cycle(&v8.descriptor(), &cancel).await.is_deployed());

    match a.deploy(stale, &cancel).await {
        DeploymentOutcome::Conflict(ConflictReason::ActiveChanged {
            staged_against,
            found,
        }) => {
            assert!(staged_against.is_none());
            assert!(found.is_some());
        }
        other => panic!("expected active-changed conflict, got {other:?}"),
    }
    assert_eq!(a.active().unwrap().unwrap().locator, "cs:mysql-8");
    assert!(!a.lock_path().exists());
}

#[tokio::test]
async fn test_stale_lock_is_taken_over() {
    let tmp = TempDir::new().unwrap();
    let downloader = store_with(&[("cs:mysql-7", "mysql")]);
    let deployer = CharmDeployer::new(
        DeployerConfig {
            root: tmp.path().to_path_buf(),
            lock_stale_after: Duration::from_millis(10),
        },
        downloader,
        "worker-a",
    );

    // Left behind by a crashed peer.
    fs::write(
        deployer.lock_path(),
        br#"{"owner":"worker-b","pid":1,"acquired_at":"2020-01-01T00:00:00Z"}"#,
    )
    .unwrap();
    std::thread::sleep(Duration::from_millis(50));

    let spec = desired("cs:mysql-7", &simple_charm("mysql"), 1);
    let outcome = deployer
        .run_cycle(&spec.descriptor(), &CancelSignal::never())
        .await;
    assert!(outcome.is_deployed(), "{outcome:?}");
    assert!(!deployer.lock_path().exists());
}

#[tokio::test]
async fn test_cancel_between_stage_and_deploy() {
    let tmp = TempDir::new().unwrap();
    let downloader = store_with(&[("cs:mysql-7", "mysql")]);
    let deployer = deployer(tmp.path(), downloader, "worker-a");
    let (cancel_handle, cancel) = CancelHandle::new();

    let spec = desired("cs:mysql-7", &simple_charm("mysql"), 1);
    let handle = deployer.stage(&spec.descriptor(), &cancel).await.unwrap();
    cancel_handle.cancel();

    assert!(matches!(
        deployer.deploy(handle, &cancel).await,
        DeploymentOutcome::Cancelled
    ));
    assert!(deployer.active().unwrap().is_none());
    assert!(entries(&deployer.staging_dir()).is_empty());
}

#[tokio::test]
async fn test_cancelled_download_yields_cancelled_outcome() {
    let tmp = TempDir::new().unwrap();
    let downloader = store_with(&[("cs:mysql-7", "mysql")]);
    downloader.hang_until_cancelled();
    let deployer = deployer(tmp.path(), downloader, "worker-a");
    let (cancel_handle, cancel) = CancelHandle::new();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel_handle.cancel();
    });

    let spec = desired("cs:mysql-7", &simple_charm("mysql"), 1);
    let outcome = tokio::time::timeout(
        Duration::from_secs(5),
        deployer.run_cycle(&spec.descriptor(), &cancel),
    )
    .await
    .unwrap();

    assert!(matches!(outcome, DeploymentOutcome::Cancelled), "{outcome:?}");
    assert!(deployer.active().unwrap().is_none());
}

#[tokio::test]
async fn test_digest_mismatch_fails_without_side_effects() {
    let tmp = TempDir::new().unwrap();
    let downloader = store_with(&[("cs:mysql-7", "mysql")]);
    let deployer = deployer(tmp.path(), downloader, "worker-a");

    let spec = desired("cs:mysql-7", b"a different archive", 1);
    match deployer
        .run_cycle(&spec.descriptor(), &CancelSignal::never())
        .await
    {
        DeploymentOutcome::Failed(e) => {
            let (expected, _actual) = e.digest_mismatch().unwrap();
            assert_eq!(expected, spec.content_digest);
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert!(deployer.active().unwrap().is_none());
    assert!(entries(&deployer.staging_dir()).is_empty());
}

#[tokio::test]
async fn test_recover_removes_leftovers_and_keeps_active() {
    let tmp = TempDir::new().unwrap();
    let downloader = store_with(&[("cs:mysql-7", "mysql"), ("cs:mysql-8", "mysql-next")]);
    let deployer = deployer(tmp.path(), downloader, "worker-a");
    let cancel = CancelSignal::never();

    let v7 = desired("cs:mysql-7", &simple_charm("mysql"), 1);
    assert!(deployer.run_cycle(&v7.descriptor(), &cancel).await.is_deployed());
    let active = deployer.active().unwrap().unwrap();

    // A crash mid-cycle: staged candidate never committed or cleaned.
    let v8 = desired("cs:mysql-8", &simple_charm("mysql-next"), 2);
    let handle = deployer.stage(&v8.descriptor(), &cancel).await.unwrap();
    std::mem::forget(handle);

    // A crash between commit rename and swap.
    fs::create_dir_all(deployer.versions_dir().join("orphan-1")).unwrap();
    std::os::unix::fs::symlink("versions/orphan-1", tmp.path().join("current.tmp-dead")).unwrap();

    // A crash during stale lock takeover.
    fs::write(tmp.path().join("deploy.lock.stale-dead"), b"{}").unwrap();

    let removed = deployer.recover().unwrap();
    assert_eq!(removed, 5, "archive, candidate, orphan version, temp link, lock aside");

    assert_eq!(deployer.active().unwrap().unwrap(), active);
    assert!(entries(&deployer.staging_dir()).is_empty());
    assert_eq!(entries(&deployer.versions_dir()), vec![active.version]);
    assert!(!tmp.path().join("current.tmp-dead").exists());
    assert!(fs::symlink_metadata(tmp.path().join("current.tmp-dead")).is_err());
    assert!(!tmp.path().join("deploy.lock.stale-dead").exists());

    // Nothing left to do the second time.
    assert_eq!(deployer.recover().unwrap(), 0);
}

#[tokio::test]
async fn test_recover_skipped_while_deploy_in_progress() {
    let tmp = TempDir::new().unwrap();
    let deployer = deployer(tmp.path(), MemoryDownloader::new(), "worker-a");

    fs::create_dir_all(deployer.staging_dir().join("candidate-peer")).unwrap();
    let _peer =
        DeployLock::try_acquire(&deployer.lock_path(), "worker-b", Duration::from_secs(900))
            .unwrap()
            .unwrap();

    assert_eq!(deployer.recover().unwrap(), 0);
    assert_eq!(entries(&deployer.staging_dir()), vec!["candidate-peer"]);
}
