mod common;

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::time::Duration;

use common::{collect_until_terminal, wait_for_bytes, Artifact, Harness};
use galaxy_client::config::SettingsUpdate;
use galaxy_client::error::InstallError;
use galaxy_client::installer::{InstallManifest, InstallState};

#[tokio::test]
async fn install_reports_progress_until_installed() {
    let h = Harness::with_title_42().await;
    let mut progress = h.ctx.subscribe_progress("title-42");

    let job = h.ctx.request_install("title-42", &h.games_dir()).unwrap();
    let events = collect_until_terminal(&mut progress).await;

    assert_eq!(events[0].state, InstallState::Queued);
    let mut bytes: Vec<u64> = events.iter().map(|e| e.bytes_downloaded).collect();
    bytes.dedup();
    assert_eq!(bytes, vec![0, 500, 1000]);

    let last = events.last().unwrap();
    assert_eq!(last.state, InstallState::Installed);
    assert_eq!(last.bytes_downloaded, 1000);
    assert_eq!(last.bytes_total, 1000);

    let snapshot = job.wait().await;
    assert_eq!(snapshot.state, InstallState::Installed);

    let record = h.ctx.get_title("title-42").unwrap();
    assert_eq!(record.install_state, InstallState::Installed);
    let install_path = record.install_path.unwrap();
    assert_eq!(install_path, h.games_dir().join("Title Forty-Two"));

    let manifest = InstallManifest::read(&install_path).unwrap().unwrap();
    assert_eq!(manifest.title_id, "title-42");
    assert_eq!(fs::read(install_path.join("start.sh")).unwrap(), vec![7u8; 1000]);
    assert!(!h.partial_file("title-42").exists());
    assert!(h.ctx.job("title-42").is_none());
}

#[tokio::test]
async fn duplicate_request_returns_the_running_job() {
    let h = Harness::with_title_42().await;
    h.content.close_gate();
    let mut progress = h.ctx.subscribe_progress("title-42");

    let first = h.ctx.request_install("title-42", &h.games_dir()).unwrap();
    wait_for_bytes(&mut progress, 500, InstallState::Downloading).await;
    let second = h.ctx.request_install("title-42", &h.games_dir()).unwrap();

    assert_eq!(first.id(), second.id());
    assert_eq!(first, second);

    first.cancel();
    assert_eq!(second.wait().await.state, InstallState::Cancelled);
}

#[tokio::test]
async fn cancel_keeps_partial_download_for_resume() {
    let h = Harness::with_title_42().await;
    h.content.close_gate();
    let mut progress = h.ctx.subscribe_progress("title-42");

    let job = h.ctx.request_install("title-42", &h.games_dir()).unwrap();
    wait_for_bytes(&mut progress, 500, InstallState::Downloading).await;

    assert!(h.ctx.cancel_install("title-42"));
    let snapshot = job.wait().await;
    assert_eq!(snapshot.state, InstallState::Cancelled);
    assert!(snapshot.cancel_requested);

    let events = collect_until_terminal(&mut progress).await;
    assert_eq!(events.last().unwrap().state, InstallState::Cancelled);

    let install_path = h.games_dir().join("Title Forty-Two");
    assert!(InstallManifest::read(&install_path).unwrap().is_none());
    assert_eq!(
        h.ctx.get_title("title-42").unwrap().install_state,
        InstallState::Cancelled
    );
    assert_eq!(fs::metadata(h.partial_file("title-42")).unwrap().len(), 500);
    assert!(!h.ctx.cancel_install("title-42"));

    // Re-requesting dismisses the cancelled job and picks up the partial file
    h.content.open_gate();
    let resumed = h.ctx.request_install("title-42", &h.games_dir()).unwrap();
    assert_ne!(resumed.id(), job.id());
    assert_eq!(resumed.wait().await.state, InstallState::Installed);
    assert_eq!(h.content.starts().last(), Some(&500));
}

#[tokio::test]
async fn cancelled_install_without_resume_drops_partial_file() {
    let h = Harness::with_title_42_and(|s| s.downloads.resume_partial = false).await;
    h.content.close_gate();
    let mut progress = h.ctx.subscribe_progress("title-42");

    let job = h.ctx.request_install("title-42", &h.games_dir()).unwrap();
    wait_for_bytes(&mut progress, 500, InstallState::Downloading).await;
    job.cancel();

    assert_eq!(job.wait().await.state, InstallState::Cancelled);
    assert!(!h.partial_file("title-42").exists());
}

#[tokio::test]
async fn dismiss_returns_title_to_not_installed() {
    let h = Harness::with_title_42().await;
    h.content.close_gate();
    let mut progress = h.ctx.subscribe_progress("title-42");

    let job = h.ctx.request_install("title-42", &h.games_dir()).unwrap();
    wait_for_bytes(&mut progress, 500, InstallState::Downloading).await;
    assert_eq!(h.ctx.dismiss("title-42"), Err(InstallError::Busy));

    job.cancel();
    job.wait().await;
    h.ctx.dismiss("title-42").unwrap();

    assert!(h.ctx.job("title-42").is_none());
    assert_eq!(
        h.ctx.get_title("title-42").unwrap().install_state,
        InstallState::NotInstalled
    );
}

#[tokio::test]
async fn corrupt_artifact_fails_and_leaves_nothing_behind() {
    let h = Harness::with_title_42().await;
    let mut artifact = Artifact::new(vec![7u8; 1000], 500, "start.sh");
    artifact.checksum = common::sha256_hex(b"something else");
    h.content.add("title-42", artifact);

    let job = h.ctx.request_install("title-42", &h.games_dir()).unwrap();
    let snapshot = job.wait().await;

    assert_eq!(
        snapshot.state,
        InstallState::Failed(InstallError::CorruptArtifact)
    );
    assert_eq!(snapshot.error, Some(InstallError::CorruptArtifact));
    assert!(!h.partial_file("title-42").exists());
    assert!(!h.games_dir().join("Title Forty-Two").exists());
    assert_eq!(
        h.ctx.get_title("title-42").unwrap().install_state,
        InstallState::Failed(InstallError::CorruptArtifact)
    );
}

#[tokio::test]
async fn transient_network_failures_are_retried() {
    let h = Harness::with_title_42().await;
    h.content.fail_streams.store(2, Ordering::SeqCst);

    let job = h.ctx.request_install("title-42", &h.games_dir()).unwrap();

    assert_eq!(job.wait().await.state, InstallState::Installed);
    assert_eq!(&h.content.starts()[..2], &[0, 500]);
}

#[tokio::test]
async fn exhausted_retries_fail_with_network_unavailable() {
    let h = Harness::with_title_42_and(|s| s.downloads.max_retries = 1).await;
    h.content.fail_streams.store(100, Ordering::SeqCst);

    let job = h.ctx.request_install("title-42", &h.games_dir()).unwrap();

    assert_eq!(
        job.wait().await.state,
        InstallState::Failed(InstallError::NetworkUnavailable)
    );
    assert_eq!(h.content.starts().len(), 2);
    // kept for a later resume
    assert!(h.partial_file("title-42").exists());
}

#[tokio::test]
async fn install_requires_a_known_title() {
    let h = Harness::with_title_42().await;

    let err = h.ctx.request_install("title-404", &h.games_dir()).unwrap_err();
    assert_eq!(err, InstallError::UnknownTitle("title-404".to_string()));
}

#[tokio::test]
async fn installed_title_cannot_be_requested_again() {
    let h = Harness::with_title_42().await;
    let job = h.ctx.request_install("title-42", &h.games_dir()).unwrap();
    job.wait().await;

    let err = h.ctx.request_install("title-42", &h.games_dir()).unwrap_err();
    assert_eq!(err, InstallError::AlreadyInstalled);
}

#[tokio::test]
async fn target_directories_must_not_collide() {
    let h = Harness::with_title_42().await;
    h.catalog.add("title-43", "Title Forty-Two", 1000);
    h.content
        .add("title-43", Artifact::new(vec![3u8; 1000], 500, "start.sh"));
    h.ctx.sync_library().await.unwrap();
    h.content.close_gate();

    let job = h.ctx.request_install("title-42", &h.games_dir()).unwrap();
    let err = h.ctx.request_install("title-43", &h.games_dir()).unwrap_err();
    assert_eq!(
        err,
        InstallError::TargetInUse(h.games_dir().join("Title Forty-Two"))
    );

    job.cancel();
    job.wait().await;
}

#[tokio::test]
async fn target_directory_must_be_empty() {
    let h = Harness::with_title_42().await;
    let target = h.games_dir().join("Title Forty-Two");
    fs::create_dir_all(&target).unwrap();
    fs::write(target.join("savegame.dat"), b"keep me").unwrap();

    let err = h.ctx.request_install("title-42", &h.games_dir()).unwrap_err();

    assert_eq!(err, InstallError::TargetNotEmpty(target.clone()));
    assert_eq!(fs::read(target.join("savegame.dat")).unwrap(), b"keep me");
}

#[tokio::test]
async fn jobs_beyond_the_limit_wait_in_queue() {
    let h = Harness::with_title_42_and(|s| s.downloads.max_concurrent = 1).await;
    h.catalog.add("title-7", "Seventh Title", 1000);
    h.content
        .add("title-7", Artifact::new(vec![1u8; 1000], 500, "run.sh"));
    h.ctx.sync_library().await.unwrap();
    h.content.close_gate();

    let mut progress = h.ctx.subscribe_progress("title-42");
    let first = h.ctx.request_install("title-42", &h.games_dir()).unwrap();
    let second = h.ctx.request_install("title-7", &h.games_dir()).unwrap();
    wait_for_bytes(&mut progress, 500, InstallState::Downloading).await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(second.snapshot().state, InstallState::Queued);

    // a queued job cancels without ever starting
    second.cancel();
    assert_eq!(second.wait().await.state, InstallState::Cancelled);
    assert_eq!(h.content.starts(), vec![0]);

    first.cancel();
    assert_eq!(first.wait().await.state, InstallState::Cancelled);
}

#[tokio::test]
async fn uninstall_removes_files_and_record_state() {
    let h = Harness::with_title_42().await;
    let job = h.ctx.request_install("title-42", &h.games_dir()).unwrap();
    job.wait().await;
    let install_path = h.games_dir().join("Title Forty-Two");
    assert!(h.ctx.check_installation("title-42").unwrap().is_empty());

    h.ctx.uninstall("title-42").await.unwrap();

    assert!(!install_path.join("start.sh").exists());
    let record = h.ctx.get_title("title-42").unwrap();
    assert_eq!(record.install_state, InstallState::NotInstalled);
    assert_eq!(record.install_path, None);
    assert_eq!(
        h.ctx.uninstall("title-42").await,
        Err(InstallError::NotInstalled)
    );
}

#[tokio::test]
async fn check_installation_reports_missing_files() {
    let h = Harness::with_title_42().await;
    let job = h.ctx.request_install("title-42", &h.games_dir()).unwrap();
    job.wait().await;
    let install_path = h.games_dir().join("Title Forty-Two");

    fs::remove_file(install_path.join("start.sh")).unwrap();

    let missing = h.ctx.check_installation("title-42").unwrap();
    assert_eq!(missing, vec![PathBuf::from("start.sh")]);
}

#[tokio::test]
async fn stalled_download_request_times_out_and_is_retried() {
    let h = Harness::with_title_42_and(|s| s.downloads.request_timeout_secs = 1).await;
    h.content.stall_opens.store(1, Ordering::SeqCst);

    let job = h.ctx.request_install("title-42", &h.games_dir()).unwrap();
    let snapshot = tokio::time::timeout(Duration::from_secs(20), job.wait())
        .await
        .expect("stalled request was never abandoned");

    assert_eq!(snapshot.state, InstallState::Installed);
    assert_eq!(h.content.starts(), vec![0, 0]);
}

#[tokio::test]
async fn cancel_reaches_a_stalled_download_request() {
    let h = Harness::with_title_42_and(|s| s.downloads.request_timeout_secs = 600).await;
    h.content.stall_opens.store(1, Ordering::SeqCst);
    let mut progress = h.ctx.subscribe_progress("title-42");

    let job = h.ctx.request_install("title-42", &h.games_dir()).unwrap();
    wait_for_bytes(&mut progress, 0, InstallState::Downloading).await;
    job.cancel();

    let snapshot = tokio::time::timeout(Duration::from_secs(10), job.wait())
        .await
        .expect("cancelled job stayed in Downloading");
    assert_eq!(snapshot.state, InstallState::Cancelled);
}

#[tokio::test]
async fn cancel_during_verification_installs_nothing() {
    let h = Harness::new(|_| {});
    let data: Vec<u8> = (0..1024 * 1024).map(|i| (i % 251) as u8).collect();
    h.catalog.add("title-5", "Large Title", data.len() as u64);
    h.content
        .add("title-5", Artifact::new(data.clone(), 256 * 1024, "data.bin"));
    h.login_and_sync().await;
    let mut progress = h.ctx.subscribe_progress("title-5");

    let job = h.ctx.request_install("title-5", &h.games_dir()).unwrap();
    wait_for_bytes(&mut progress, 1024 * 1024, InstallState::Verifying).await;
    job.cancel();

    let snapshot = job.wait().await;
    assert_eq!(snapshot.state, InstallState::Cancelled);
    let install_path = h.games_dir().join("Large Title");
    assert!(InstallManifest::read(&install_path).unwrap().is_none());
    assert!(!install_path.join("data.bin").exists());
    assert_eq!(
        h.ctx.get_title("title-5").unwrap().install_state,
        InstallState::Cancelled
    );
    // the complete download is kept and installs without another request
    assert_eq!(
        fs::metadata(h.partial_file("title-5")).unwrap().len(),
        data.len() as u64
    );

    let again = h.ctx.request_install("title-5", &h.games_dir()).unwrap();
    assert_eq!(again.wait().await.state, InstallState::Installed);
    assert_eq!(h.content.starts(), vec![0]);
    assert_eq!(fs::read(install_path.join("data.bin")).unwrap(), data);
}

#[tokio::test]
async fn resume_setting_applies_to_the_next_job() {
    let h = Harness::with_title_42().await;
    h.ctx
        .update_settings(SettingsUpdate {
            resume_partial: Some(false),
            ..Default::default()
        })
        .unwrap();
    h.content.close_gate();
    let mut progress = h.ctx.subscribe_progress("title-42");

    let job = h.ctx.request_install("title-42", &h.games_dir()).unwrap();
    wait_for_bytes(&mut progress, 500, InstallState::Downloading).await;
    job.cancel();

    assert_eq!(job.wait().await.state, InstallState::Cancelled);
    assert!(!h.partial_file("title-42").exists());
}

#[tokio::test]
async fn retry_setting_applies_to_the_next_job() {
    let h = Harness::with_title_42().await;
    h.ctx
        .update_settings(SettingsUpdate {
            max_retries: Some(0),
            ..Default::default()
        })
        .unwrap();
    h.content.fail_streams.store(1, Ordering::SeqCst);

    let job = h.ctx.request_install("title-42", &h.games_dir()).unwrap();

    assert_eq!(
        job.wait().await.state,
        InstallState::Failed(InstallError::NetworkUnavailable)
    );
    assert_eq!(h.content.starts(), vec![0]);
}

#[tokio::test]
async fn similar_title_ids_keep_separate_partial_files() {
    let h = Harness::new(|_| {});
    h.catalog.add("a.b", "Dotted", 1000);
    h.catalog.add("a_b", "Underscored", 1000);
    h.content.add("a.b", Artifact::new(vec![1u8; 1000], 500, "dot.bin"));
    h.content.add("a_b", Artifact::new(vec![2u8; 1000], 500, "under.bin"));
    h.login_and_sync().await;
    h.content.close_gate();
    let mut progress = h.ctx.subscribe_progress("a.b");

    let dotted = h.ctx.request_install("a.b", &h.games_dir()).unwrap();
    wait_for_bytes(&mut progress, 500, InstallState::Downloading).await;
    dotted.cancel();
    assert_eq!(dotted.wait().await.state, InstallState::Cancelled);

    h.content.open_gate();
    let underscored = h.ctx.request_install("a_b", &h.games_dir()).unwrap();
    assert_eq!(underscored.wait().await.state, InstallState::Installed);

    assert_eq!(h.content.starts(), vec![0, 0]);
    assert_eq!(
        fs::read(h.games_dir().join("Underscored").join("under.bin")).unwrap(),
        vec![2u8; 1000]
    );
    let dotted_partial = h.dir.path().join("tmp").join("a_2eb.part");
    assert_eq!(fs::metadata(dotted_partial).unwrap().len(), 500);
}

#[tokio::test]
async fn sync_keeps_a_title_while_it_installs() {
    let h = Harness::with_title_42().await;
    h.content.close_gate();
    let mut progress = h.ctx.subscribe_progress("title-42");

    let job = h.ctx.request_install("title-42", &h.games_dir()).unwrap();
    wait_for_bytes(&mut progress, 500, InstallState::Downloading).await;

    h.catalog.titles.lock().unwrap().clear();
    let diff = h.ctx.sync_library().await.unwrap();
    assert!(diff.removed.is_empty());

    job.cancel();
    assert_eq!(job.wait().await.state, InstallState::Cancelled);
    assert_eq!(
        h.ctx.get_title("title-42").unwrap().install_state,
        InstallState::Cancelled
    );

    let diff = h.ctx.sync_library().await.unwrap();
    assert_eq!(diff.removed, vec!["title-42".to_string()]);
}
