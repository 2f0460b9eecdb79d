// End-to-end pipeline tests: scan -> compress -> copy -> finalize,
// running against temp directories with a directory standing in for the
// LTFS tape mount.
//
// # cargo test --test backup_pipeline

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Error;

use tapeback::server::TaskRunner;
use tapeback::tape::FinalDirMonitor;
use tbk_api_types::{TaskConfig, TaskStatus, TaskType};
use tbk_catalog::CatalogStore;
use tbk_config::{BackupConfig, CompressionMethod};
use tbk_tools::CancelToken;

fn testdir(name: &str) -> PathBuf {
    let mut dir: PathBuf = String::from("./target/testout").into();
    dir.push("backup_pipeline");
    dir.push(name);
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

struct TestEnv {
    #[allow(dead_code)]
    dir: PathBuf,
    source: PathBuf,
    mount: PathBuf,
    config: BackupConfig,
    catalog: Arc<CatalogStore>,
}

fn setup_env(name: &str, direct_to_tape: bool) -> TestEnv {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = testdir(name);
    let source = dir.join("source");
    let mount = dir.join("tape-mount");
    std::fs::create_dir_all(&source).unwrap();
    std::fs::create_dir_all(&mount).unwrap();

    let mut config = BackupConfig::default();
    config.backup_compress_dir = dir.join("staging");
    config.tape_drive_letter = mount.display().to_string();
    config.compress_directly_to_tape = direct_to_tape;
    config.compression_method = CompressionMethod::Tar;
    config.enable_tape_format_before_full = false;
    config.scan_threads = 2;

    let catalog = Arc::new(CatalogStore::open_with_defaults(&dir.join("catalog.db")).unwrap());
    TestEnv {
        dir,
        source,
        mount,
        config,
        catalog,
    }
}

fn create_execution(env: &TestEnv, name: &str) -> i64 {
    env.catalog
        .create_task(&TaskConfig {
            task_name: name.to_string(),
            task_type: TaskType::Full,
            source_paths: vec![env.source.display().to_string()],
            exclude_patterns: Vec::new(),
            compression_enabled: true,
            encryption_enabled: false,
            enable_simple_scan: false,
            retention_days: 180,
            tape_device: None,
            is_template: false,
        })
        .unwrap()
}

fn archives_under(dir: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    if dir.exists() {
        for entry in walkdir::WalkDir::new(dir)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if entry.file_type().is_file() {
                found.push(entry.into_path());
            }
        }
    }
    found.sort();
    found
}

#[test]
fn test_small_full_backup_direct_to_tape() -> Result<(), Error> {
    let env = setup_env("small_direct", true);
    std::fs::write(env.source.join("a.txt"), vec![b'a'; 100])?;
    std::fs::write(env.source.join("b.txt"), vec![b'b'; 200])?;
    std::fs::write(env.source.join("c.bin"), vec![0u8; 300])?;

    let task_id = create_execution(&env, "small full");
    let runner = TaskRunner::new(
        Arc::clone(&env.catalog),
        env.config.clone(),
        None,
        None,
    );
    let status = runner.run_task(task_id, &CancelToken::new())?;
    assert_eq!(status, TaskStatus::Completed);

    let task = env.catalog.get_task(task_id)?.unwrap();
    assert_eq!(task.total_files, 3);
    assert_eq!(task.processed_files, 3);
    assert_eq!(task.total_bytes, 600);
    assert_eq!(task.processed_bytes, 600);
    let summary = task.result_summary.unwrap();
    assert_eq!(summary.estimated_archive_count, 1);
    assert_eq!(summary.total_scanned_bytes, 600);

    // exactly one archive on the mount, under the backup-set directory
    let archives = archives_under(&env.mount);
    assert_eq!(archives.len(), 1);
    assert!(archives[0].to_string_lossy().ends_with(".tar"));

    // all three inventory rows are marked copied
    assert_eq!(env.catalog.count_copied_files(task_id, 1)?, 3);

    // the backup-set record points at the archive
    let set_dir_name = archives[0]
        .parent()
        .unwrap()
        .file_name()
        .unwrap()
        .to_string_lossy()
        .into_owned();
    let set = env.catalog.get_backup_set(&set_dir_name)?.unwrap();
    assert_eq!(set.archive_count, 1);
    Ok(())
}

#[test]
fn test_staged_backup_drains_through_monitor() -> Result<(), Error> {
    let env = setup_env("staged_monitor", false);
    for i in 0..5 {
        std::fs::write(env.source.join(format!("f{}.dat", i)), vec![i as u8; 1000])?;
    }

    let task_id = create_execution(&env, "staged full");
    let monitor = Arc::new(FinalDirMonitor::new(
        env.config.clone(),
        Arc::clone(&env.catalog),
        None,
    ));
    monitor.start();

    let runner = TaskRunner::new(
        Arc::clone(&env.catalog),
        env.config.clone(),
        None,
        Some(Arc::clone(&monitor)),
    );
    let status = runner.run_task(task_id, &CancelToken::new())?;
    assert_eq!(status, TaskStatus::Completed);

    // the staging directory drained, the archive lives on the mount
    assert!(monitor.is_final_dir_empty());
    let archives = archives_under(&env.mount);
    assert_eq!(archives.len(), 1);
    assert_eq!(monitor.processed_count(), 1);
    assert_eq!(monitor.failure_count(), 0);
    assert_eq!(env.catalog.count_copied_files(task_id, 1)?, 5);

    monitor.stop();
    Ok(())
}

#[test]
fn test_unit_boundaries_from_inventory_order() -> Result<(), Error> {
    let env = setup_env("unit_boundary", true);
    // written in scan order within one directory: x 600, y 500, z 400
    std::fs::write(env.source.join("x"), vec![1u8; 600])?;
    std::fs::write(env.source.join("y"), vec![2u8; 500])?;
    std::fs::write(env.source.join("z"), vec![3u8; 400])?;

    let mut config = env.config.clone();
    config.max_file_size = 1000;
    config.use_scan_multithread = false; // deterministic inventory order

    let task_id = create_execution(&env, "unit boundary");
    let runner = TaskRunner::new(Arc::clone(&env.catalog), config, None, None);
    let status = runner.run_task(task_id, &CancelToken::new())?;
    assert_eq!(status, TaskStatus::Completed);

    let task = env.catalog.get_task(task_id)?.unwrap();
    let summary = task.result_summary.unwrap();
    assert_eq!(summary.estimated_archive_count, 2);
    assert_eq!(archives_under(&env.mount).len(), 2);
    Ok(())
}

#[test]
fn test_oversize_file_gets_own_unit() -> Result<(), Error> {
    let env = setup_env("oversize", true);
    std::fs::write(env.source.join("big"), vec![9u8; 5000])?;
    std::fs::write(env.source.join("small"), vec![1u8; 100])?;

    let mut config = env.config.clone();
    config.max_file_size = 1000;

    let task_id = create_execution(&env, "oversize");
    let runner = TaskRunner::new(Arc::clone(&env.catalog), config, None, None);
    runner.run_task(task_id, &CancelToken::new())?;

    let task = env.catalog.get_task(task_id)?.unwrap();
    assert_eq!(task.result_summary.unwrap().estimated_archive_count, 2);
    assert_eq!(task.processed_files, 2);
    Ok(())
}

#[test]
fn test_cancellation_mid_compress() -> Result<(), Error> {
    let env = setup_env("cancel_mid", true);
    // 9 files of 1000 bytes, 3 units of 3 files each
    for i in 0..9 {
        std::fs::write(env.source.join(format!("f{}.dat", i)), vec![i as u8; 1000])?;
    }

    let mut config = env.config.clone();
    config.max_file_size = 3000;
    config.use_scan_multithread = false;
    config.compression_parallel_batches = 1;
    config.enable_background_copy_update = true;
    // a slow fake archiver makes the cancellation window deterministic
    config.compression_method = CompressionMethod::SevenzipCommand;
    config.sevenzip_path = Some(fake_slow_sevenzip(&env.dir));

    let task_id = create_execution(&env, "cancel mid-compress");
    let cancel = CancelToken::new();

    // cancel as soon as the first finished archive appears on the mount
    let watcher_cancel = cancel.clone();
    let mount = env.mount.clone();
    let watcher = std::thread::spawn(move || {
        let deadline = Instant::now() + Duration::from_secs(60);
        while Instant::now() < deadline {
            let done = archives_under(&mount)
                .iter()
                .any(|p| p.extension().map(|e| e == "7z").unwrap_or(false));
            if done {
                watcher_cancel.cancel();
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    });

    let runner = TaskRunner::new(Arc::clone(&env.catalog), config, None, None);
    let status = runner.run_task(task_id, &cancel)?;
    watcher.join().unwrap();

    assert_eq!(status, TaskStatus::Cancelled);
    let task = env.catalog.get_task(task_id)?.unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);

    // no partial outputs survive a cancel
    let leftovers: Vec<_> = archives_under(&env.mount)
        .into_iter()
        .filter(|p| p.to_string_lossy().ends_with(".partial"))
        .collect();
    assert!(leftovers.is_empty(), "partial files left: {:?}", leftovers);

    // flags are set exactly for the files of completed units
    let completed_units = archives_under(&env.mount)
        .iter()
        .filter(|p| p.extension().map(|e| e == "7z").unwrap_or(false))
        .count() as u64;
    assert!(completed_units < 3, "cancel came too late to be meaningful");
    assert_eq!(
        env.catalog.count_copied_files(task_id, 1)?,
        completed_units * 3
    );
    Ok(())
}

/// A stand-in archiver: copies its inputs' bytes into the target slowly
/// enough that a cancel request lands between units.
fn fake_slow_sevenzip(dir: &Path) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join("fake7z.sh");
    let script = r#"#!/bin/sh
# args: a -t7z -mx.. -md.. -mmt.. -y <output> <inputs..>
out=$7
shift 7
sleep 1
cat "$@" > "$out"
"#;
    std::fs::write(&path, script).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}
