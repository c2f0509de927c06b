mod support;

use sfl_common::{AppShuffleId, MetricsRegistry};
use sfl_executor::StageFileStatus;

use support::*;

#[test]
fn two_maps_upload_flush_and_commit() {
    let root = temp_root("sfl_commit_happy");
    let executor = start_executor(test_config(&root), MetricsRegistry::new());
    let stage = AppShuffleId::new("app-1", 1);

    executor
        .register_shuffle(&stage, 2, 3, default_write_config())
        .expect("register");

    let first = attempt(&stage, 0, 1);
    executor.start_upload(&first).expect("start upload");
    executor
        .write_data(write_op(&stage, 0, 1, 0, b"abc"))
        .expect("write");
    executor
        .write_data(write_op(&stage, 0, 1, 1, b"de"))
        .expect("write");
    executor.finish_upload(&first).expect("finish upload");
    executor
        .wait_map_attempt_committed(&first, WAIT)
        .expect("first commit");

    let second = attempt(&stage, 1, 7);
    executor.start_upload(&second).expect("start upload");
    executor
        .write_data(write_op(&stage, 1, 7, 2, b"fgh"))
        .expect("write");
    executor.finish_upload(&second).expect("finish upload");
    executor
        .wait_map_attempt_committed(&second, WAIT)
        .expect("second commit");
    executor
        .wait_shuffle_files_closed(&stage, WAIT)
        .expect("files closed");

    let status = executor.get_shuffle_stage_status(&stage);
    assert_eq!(status.file_status, StageFileStatus::Ok);
    assert_eq!(status.num_maps, 2);
    assert_eq!(status.committed_attempts.get(&0), Some(&1));
    assert_eq!(status.committed_attempts.get(&1), Some(&7));

    let partition0 = executor
        .get_persisted_bytes(&stage, 0)
        .expect("persisted bytes");
    assert_eq!(partition0.len(), 1);
    assert_eq!(partition0[0].length, 3);

    executor.stop(true);

    let items = read_state_items(&root);
    assert_eq!(count_stage_infos(&items), 1);
    assert_eq!(count_task_attempt_commits(&items), 2);
    assert_eq!(count_stage_corruptions(&items), 0);

    let _ = std::fs::remove_dir_all(root);
}

#[test]
fn retried_attempt_supersedes_the_first() {
    let root = temp_root("sfl_commit_retry");
    let executor = start_executor(test_config(&root), MetricsRegistry::new());
    let stage = AppShuffleId::new("app-1", 2);

    executor
        .register_shuffle(&stage, 1, 1, default_write_config())
        .expect("register");

    let stale = attempt(&stage, 0, 1);
    executor.start_upload(&stale).expect("start upload");
    executor
        .write_data(write_op(&stage, 0, 1, 0, b"x"))
        .expect("write");

    let retry = attempt(&stage, 0, 2);
    executor.start_upload(&retry).expect("start retry upload");

    executor.finish_upload(&stale).expect("finish stale");
    executor
        .wait_map_attempt_committed(&stale, WAIT)
        .expect("stale commit");

    // the stale commit is recorded but does not close the stage
    let status = executor.get_shuffle_stage_status(&stage);
    assert_eq!(status.file_status, StageFileStatus::Ok);
    assert_eq!(status.committed_attempts.get(&0), Some(&1));

    executor
        .write_data(write_op(&stage, 0, 2, 0, b"yz"))
        .expect("write retry");
    executor.finish_upload(&retry).expect("finish retry");
    executor
        .wait_map_attempt_committed(&retry, WAIT)
        .expect("retry commit");
    executor
        .wait_shuffle_files_closed(&stage, WAIT)
        .expect("files closed");

    let status = executor.get_shuffle_stage_status(&stage);
    assert_eq!(status.committed_attempts.get(&0), Some(&2));

    executor.stop(true);
    let _ = std::fs::remove_dir_all(root);
}

#[test]
fn persisted_length_never_shrinks() {
    let root = temp_root("sfl_commit_monotonic");
    let executor = start_executor(test_config(&root), MetricsRegistry::new());
    let stage = AppShuffleId::new("app-1", 3);

    // a second map never starts, so writers stay open across flushes
    executor
        .register_shuffle(&stage, 2, 1, default_write_config())
        .expect("register");

    let first = attempt(&stage, 0, 1);
    executor.start_upload(&first).expect("start upload");
    executor
        .write_data(write_op(&stage, 0, 1, 0, b"abc"))
        .expect("write");
    executor.finish_upload(&first).expect("finish");
    executor
        .wait_map_attempt_committed(&first, WAIT)
        .expect("commit");
    let total_before: u64 = executor
        .get_persisted_bytes(&stage, 0)
        .expect("persisted bytes")
        .iter()
        .map(|f| f.length)
        .sum();
    assert_eq!(total_before, 3);

    let retry = attempt(&stage, 0, 2);
    executor.start_upload(&retry).expect("start retry");
    executor
        .write_data(write_op(&stage, 0, 2, 0, b"de"))
        .expect("write");
    executor.finish_upload(&retry).expect("finish retry");
    executor
        .wait_map_attempt_committed(&retry, WAIT)
        .expect("retry commit");

    let total_after: u64 = executor
        .get_persisted_bytes(&stage, 0)
        .expect("persisted bytes")
        .iter()
        .map(|f| f.length)
        .sum();
    assert!(total_after >= total_before);
    assert_eq!(total_after, 5);

    executor.stop(true);
    let _ = std::fs::remove_dir_all(root);
}

#[test]
fn concurrent_finish_uploads_serialize_per_stage() {
    let root = temp_root("sfl_commit_concurrent");
    let executor = start_executor(test_config(&root), MetricsRegistry::new());
    let stage = AppShuffleId::new("app-1", 4);
    let num_maps = 8;

    executor
        .register_shuffle(&stage, num_maps, 2, default_write_config())
        .expect("register");

    std::thread::scope(|scope| {
        for map_id in 0..num_maps {
            let executor = &executor;
            let stage = &stage;
            scope.spawn(move || {
                let task_attempt_id = i64::from(map_id) * 10 + 1;
                let id = attempt(stage, map_id, task_attempt_id);
                executor.start_upload(&id).expect("start upload");
                executor
                    .write_data(write_op(stage, map_id, task_attempt_id, map_id % 2, b"payload"))
                    .expect("write");
                executor.finish_upload(&id).expect("finish upload");
            });
        }
    });

    for map_id in 0..num_maps {
        let id = attempt(&stage, map_id, i64::from(map_id) * 10 + 1);
        executor
            .wait_map_attempt_committed(&id, WAIT)
            .expect("commit");
    }
    executor
        .wait_shuffle_files_closed(&stage, WAIT)
        .expect("files closed");

    let status = executor.get_shuffle_stage_status(&stage);
    assert_eq!(status.file_status, StageFileStatus::Ok);
    assert_eq!(status.committed_attempts.len(), num_maps as usize);

    executor.stop(true);

    let items = read_state_items(&root);
    assert_eq!(count_stage_corruptions(&items), 0);

    let _ = std::fs::remove_dir_all(root);
}

#[test]
fn unknown_stage_reports_not_started() {
    let root = temp_root("sfl_commit_unknown");
    let executor = start_executor(test_config(&root), MetricsRegistry::new());
    let stage = AppShuffleId::new("app-none", 1);

    let status = executor.get_shuffle_stage_status(&stage);
    assert_eq!(status.file_status, StageFileStatus::NotStarted);
    assert!(executor.get_shuffle_write_config(&stage).is_err());
    assert!(executor
        .write_data(write_op(&stage, 0, 1, 0, b"abc"))
        .is_err());

    executor.stop(true);
    let _ = std::fs::remove_dir_all(root);
}
