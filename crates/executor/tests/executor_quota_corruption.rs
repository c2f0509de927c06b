mod support;

use sfl_common::{AppShuffleId, MetricsRegistry, SflError};
use sfl_executor::StageFileStatus;

use support::*;

#[test]
fn quota_violation_truncates_the_application() {
    let root = temp_root("sfl_quota");
    let mut config = test_config(&root);
    config.app_max_write_bytes = 100;
    let metrics = MetricsRegistry::new();
    let executor = start_executor(config, metrics.clone());
    let stage = AppShuffleId::new("app-1", 1);

    executor
        .register_shuffle(&stage, 1, 1, default_write_config())
        .expect("register");
    let id = attempt(&stage, 0, 1);
    executor.start_upload(&id).expect("start upload");

    executor
        .write_data(write_op(&stage, 0, 1, 0, &[7u8; 60]))
        .expect("write under quota");
    assert!(executor.check_app_max_write_bytes(&stage.app_id).is_ok());

    let err = executor
        .write_data(write_op(&stage, 0, 1, 0, &[7u8; 41]))
        .expect_err("write over quota");
    assert!(matches!(err, SflError::QuotaExceeded(_)));
    assert_eq!(metrics.truncated_applications(), 1);

    let status = executor.get_shuffle_stage_status(&stage);
    assert_eq!(status.file_status, StageFileStatus::Corrupted);
    assert!(executor.check_app_max_write_bytes(&stage.app_id).is_err());

    executor.stop(true);

    let items = read_state_items(&root);
    assert!(count_stage_corruptions(&items) >= 1);

    let _ = std::fs::remove_dir_all(root);
}

#[test]
fn registration_mismatch_corrupts_the_stage() {
    let root = temp_root("sfl_register_mismatch");
    let executor = start_executor(test_config(&root), MetricsRegistry::new());
    let stage = AppShuffleId::new("app-1", 2);

    executor
        .register_shuffle(&stage, 4, 10, default_write_config())
        .expect("register");
    let err = executor
        .register_shuffle(&stage, 5, 10, default_write_config())
        .expect_err("conflicting register");
    assert!(matches!(err, SflError::StageCorrupted(_)));

    let status = executor.get_shuffle_stage_status(&stage);
    assert_eq!(status.file_status, StageFileStatus::Corrupted);

    executor.stop(true);

    let items = read_state_items(&root);
    assert_eq!(count_stage_infos(&items), 1);
    assert!(count_stage_corruptions(&items) >= 1);

    let _ = std::fs::remove_dir_all(root);
}

#[test]
fn corruption_is_absorbing() {
    let root = temp_root("sfl_corruption_absorbing");
    let executor = start_executor(test_config(&root), MetricsRegistry::new());
    let stage = AppShuffleId::new("app-1", 3);

    executor
        .register_shuffle(&stage, 2, 2, default_write_config())
        .expect("register");
    executor
        .register_shuffle(&stage, 3, 2, default_write_config())
        .expect_err("conflicting register");

    // a matching registration succeeds again, but the status never clears
    executor
        .register_shuffle(&stage, 2, 2, default_write_config())
        .expect("matching register");
    let status = executor.get_shuffle_stage_status(&stage);
    assert_eq!(status.file_status, StageFileStatus::Corrupted);

    executor.stop(true);
    let _ = std::fs::remove_dir_all(root);
}

#[test]
fn idempotent_registration_logs_one_stage_info() {
    let root = temp_root("sfl_register_idempotent");
    let executor = start_executor(test_config(&root), MetricsRegistry::new());
    let stage = AppShuffleId::new("app-1", 4);

    for _ in 0..5 {
        executor
            .register_shuffle(&stage, 2, 3, default_write_config())
            .expect("register");
    }
    assert_eq!(
        executor.get_shuffle_stage_status(&stage).file_status,
        StageFileStatus::Ok
    );

    executor.stop(true);

    let items = read_state_items(&root);
    assert_eq!(count_stage_infos(&items), 1);
    assert_eq!(count_stage_corruptions(&items), 0);

    let _ = std::fs::remove_dir_all(root);
}

#[test]
fn out_of_range_partition_corrupts_the_stage() {
    let root = temp_root("sfl_partition_range");
    let executor = start_executor(test_config(&root), MetricsRegistry::new());
    let stage = AppShuffleId::new("app-1", 5);

    executor
        .register_shuffle(&stage, 1, 2, default_write_config())
        .expect("register");
    let id = attempt(&stage, 0, 1);
    executor.start_upload(&id).expect("start upload");

    let err = executor
        .write_data(write_op(&stage, 0, 1, 9, b"abc"))
        .expect_err("out of range write");
    assert!(matches!(err, SflError::InvalidState(_)));
    assert_eq!(
        executor.get_shuffle_stage_status(&stage).file_status,
        StageFileStatus::Corrupted
    );

    executor.stop(true);
    let _ = std::fs::remove_dir_all(root);
}
