// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pool plan and full-mode tests against the simulated cloud.

mod common;

use serde_json::{Value, json};

use batchforge::cli::Mode;
use batchforge::metadata::HandoffError;
use batchforge::plan::{RunState, image_plan, pool_plan};
use batchforge::{Error, PoolMetadata, StepState};
use common::{FakeCloud, config, driver, mutating_calls};

const IMAGE_ID: &str = "/subscriptions/s/resourceGroups/rg-batchforge/providers/Microsoft.Compute/galleries/batchforge_gallery/images/batchforge-ubuntu2204-gpu/versions/1.0.0";

fn metadata_document() -> Value {
    json!({
        "image_id": IMAGE_ID,
        "node_agent_sku_id": "batch.node.ubuntu 22.04",
        "gallery_name": "batchforge_gallery",
        "image_definition": "batchforge-ubuntu2204-gpu",
        "image_version": "1.0.0",
        "batch_account": "batchforgeacct",
        "gpu": true,
    })
}

fn read_json(path: &std::path::Path) -> Value {
    serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
}

#[tokio::test]
async fn test_pool_only_without_metadata_fails_before_any_create() {
    let dir = tempfile::tempdir().unwrap();
    let cloud = FakeCloud::new();
    let executor = cloud.executor();
    let config = config(dir.path()).build().unwrap();

    let failure = driver(config.clone(), executor.clone())
        .run(&pool_plan(&config), &mut RunState::new())
        .await
        .unwrap_err();

    assert_eq!(failure.step, "load-image-metadata");
    assert_eq!(failure.exit_code(), 3);
    assert!(matches!(failure.error, Error::Handoff(HandoffError::Missing(_))));
    assert!(failure.error.to_string().contains("--image-id"));
    assert_eq!(mutating_calls(&executor), Vec::<String>::new());
    assert!(!config.pool_spec_path().exists());
}

#[tokio::test]
async fn test_metadata_missing_field_is_named() {
    let dir = tempfile::tempdir().unwrap();
    let cloud = FakeCloud::new();
    let executor = cloud.executor();
    let config = config(dir.path()).build().unwrap();
    let mut document = metadata_document();
    document.as_object_mut().unwrap().remove("node_agent_sku_id");
    std::fs::write(config.image_metadata_path(), document.to_string()).unwrap();

    let failure = driver(config.clone(), executor.clone())
        .run(&pool_plan(&config), &mut RunState::new())
        .await
        .unwrap_err();

    assert_eq!(failure.exit_code(), 3);
    assert!(failure.error.to_string().contains("node_agent_sku_id"));
    assert!(!executor.was_called(&["batch"]));
}

#[tokio::test]
async fn test_malformed_metadata_is_a_handoff_error() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path()).build().unwrap();
    std::fs::write(config.image_metadata_path(), "{\"image_id\": ").unwrap();

    let failure = driver(config.clone(), FakeCloud::new().executor())
        .run(&pool_plan(&config), &mut RunState::new())
        .await
        .unwrap_err();

    assert!(matches!(
        failure.error,
        Error::Handoff(HandoffError::Malformed { .. })
    ));
}

#[tokio::test]
async fn test_gpu_pool_from_metadata_file() {
    let dir = tempfile::tempdir().unwrap();
    let cloud = FakeCloud::new();
    let executor = cloud.executor();
    let config = config(dir.path()).gpu(true).build().unwrap();
    std::fs::write(config.image_metadata_path(), metadata_document().to_string()).unwrap();

    let report = driver(config.clone(), executor.clone())
        .run(&pool_plan(&config), &mut RunState::new())
        .await
        .unwrap();

    assert_eq!(report.state_of("pool"), Some(StepState::Succeeded));
    let create = executor
        .calls()
        .into_iter()
        .find(|c| c.starts_with(&["batch", "pool", "create"]))
        .unwrap();
    assert_eq!(create.value_of("--account-name"), Some("batchforgeacct"));

    let spec = read_json(&config.pool_spec_path());
    assert_eq!(spec["id"], "batchforge-pool");
    assert_eq!(spec["vmSize"], "Standard_NC4as_T4_v3");
    assert_eq!(
        spec["virtualMachineConfiguration"]["imageReference"]["virtualMachineImageId"],
        IMAGE_ID
    );
    assert_eq!(
        spec["virtualMachineConfiguration"]["nodeAgentSKUId"],
        "batch.node.ubuntu 22.04"
    );
    let command_line = spec["startTask"]["commandLine"].as_str().unwrap();
    assert!(command_line.contains("nvidia-ctk runtime configure"));
    assert!(command_line.contains("nvidia-smi"));
    assert_eq!(spec["startTask"]["userIdentity"]["autoUser"]["elevationLevel"], "admin");
    assert_eq!(spec["startTask"]["waitForSuccess"], true);
    assert_eq!(cloud.world().submitted_pool.as_ref(), Some(&spec));

    let pool = PoolMetadata::load(&config.pool_metadata_path()).await.unwrap();
    assert_eq!(pool.pool_id, "batchforge-pool");
    assert_eq!(pool.image_id, IMAGE_ID);
    assert!(pool.gpu);
}

#[tokio::test]
async fn test_cpu_pool_start_task_has_no_gpu_fragments() {
    let dir = tempfile::tempdir().unwrap();
    let cloud = FakeCloud::new();
    let config = config(dir.path())
        .gpu(false)
        .apply(batchforge::config::Overrides {
            image_id: Some(IMAGE_ID.to_string()),
            node_count: Some(3),
            ..Default::default()
        })
        .build()
        .unwrap();

    driver(config.clone(), cloud.executor())
        .run(&pool_plan(&config), &mut RunState::new())
        .await
        .unwrap();

    let spec = read_json(&config.pool_spec_path());
    assert_eq!(spec["vmSize"], "Standard_D2s_v3");
    assert_eq!(spec["targetDedicatedNodes"], 3);
    let command_line = spec["startTask"]["commandLine"].as_str().unwrap();
    assert!(command_line.contains("docker"));
    assert!(!command_line.contains("nvidia"));
    // The override stands in for the metadata file; nothing is written back.
    assert!(!config.image_metadata_path().exists());
}

#[tokio::test]
async fn test_existing_pool_is_not_recreated() {
    let dir = tempfile::tempdir().unwrap();
    let cloud = FakeCloud::new();
    let config = config(dir.path()).build().unwrap();
    std::fs::write(config.image_metadata_path(), metadata_document().to_string()).unwrap();
    let plan = pool_plan(&config);

    driver(config.clone(), cloud.executor())
        .run(&plan, &mut RunState::new())
        .await
        .unwrap();
    let executor = cloud.executor();
    let report = driver(config.clone(), executor.clone())
        .run(&plan, &mut RunState::new())
        .await
        .unwrap();

    assert_eq!(report.state_of("batch-account"), Some(StepState::Skipped));
    assert_eq!(report.state_of("pool"), Some(StepState::Skipped));
    assert_eq!(mutating_calls(&executor), Vec::<String>::new());
    assert!(config.pool_metadata_path().exists());
}

#[tokio::test]
async fn test_pool_resize_error_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let cloud = FakeCloud::new();
    cloud.world().resize_errors = vec![json!({
        "code": "AllocationFailed",
        "message": "Insufficient capacity for Standard_NC4as_T4_v3",
    })];
    let config = config(dir.path()).build().unwrap();
    std::fs::write(config.image_metadata_path(), metadata_document().to_string()).unwrap();

    let failure = driver(config.clone(), cloud.executor())
        .run(&pool_plan(&config), &mut RunState::new())
        .await
        .unwrap_err();

    assert_eq!(failure.step, "pool");
    assert!(matches!(failure.error, Error::FailedState { .. }));
    assert!(failure.error.to_string().contains("AllocationFailed"));
    assert_eq!(failure.report.state_of("save-pool-metadata"), Some(StepState::Pending));
    assert!(!config.pool_metadata_path().exists());
}

#[tokio::test]
async fn test_full_mode_shares_state_between_plans() {
    let dir = tempfile::tempdir().unwrap();
    let cloud = FakeCloud::new();
    let executor = cloud.executor();
    let config = config(dir.path()).gpu(true).build().unwrap();
    let plans = Mode::Full.plans(&config);
    let mut state = RunState::new();

    let report = driver(config.clone(), executor.clone())
        .run_all(&plans, &mut state)
        .await
        .unwrap();

    assert_eq!(report.names_in(StepState::Failed), Vec::<&str>::new());
    // Preflight ran once; the pool plan reuses its results.
    assert_eq!(executor.call_count(&["version"]), 1);
    assert_eq!(executor.call_count(&["account", "show"]), 1);
    let pool_steps: Vec<_> = report.steps.iter().filter(|s| s.plan == "pool").collect();
    assert_eq!(pool_steps[0].state, StepState::Skipped);
    assert_eq!(pool_steps[1].state, StepState::Skipped);

    let image_id = state.image_metadata.as_ref().unwrap().image_id.clone();
    let spec = state.pool_spec.as_ref().unwrap();
    assert_eq!(
        spec.virtual_machine_configuration.image_reference.virtual_machine_image_id,
        image_id
    );
    assert!(config.image_metadata_path().exists());
    assert!(config.pool_metadata_path().exists());
}

#[tokio::test]
async fn test_image_then_pool_only_hand_off() {
    let dir = tempfile::tempdir().unwrap();
    let cloud = FakeCloud::new();
    let config = config(dir.path()).gpu(false).build().unwrap();

    let mut image_state = RunState::new();
    driver(config.clone(), cloud.executor())
        .run(&image_plan(&config), &mut image_state)
        .await
        .unwrap();

    let mut pool_state = RunState::new();
    driver(config.clone(), cloud.executor())
        .run(&pool_plan(&config), &mut pool_state)
        .await
        .unwrap();

    let image_id = image_state.image_metadata.unwrap().image_id;
    assert_eq!(pool_state.image_metadata.unwrap().image_id, image_id);
    let pool = PoolMetadata::load(&config.pool_metadata_path()).await.unwrap();
    assert_eq!(pool.image_id, image_id);
    assert!(!pool.gpu);
}

#[tokio::test(start_paused = true)]
async fn test_pool_waits_across_resizing_polls_until_steady() {
    let dir = tempfile::tempdir().unwrap();
    let cloud = FakeCloud::new();
    cloud
        .world()
        .settle_after("pool/batchforgeacct/batchforge-pool", 3);
    let executor = cloud.executor();
    let config = config(dir.path()).build().unwrap();
    std::fs::write(config.image_metadata_path(), metadata_document().to_string()).unwrap();
    let start = tokio::time::Instant::now();

    let report = driver(config.clone(), executor.clone())
        .run(&pool_plan(&config), &mut RunState::new())
        .await
        .unwrap();

    assert_eq!(report.state_of("pool"), Some(StepState::Succeeded));
    assert_eq!(executor.call_count(&["batch", "pool", "create"]), 1);
    // Absent before create, three resizing polls, then steady.
    assert_eq!(executor.call_count(&["batch", "pool", "show"]), 5);
    assert!(start.elapsed() >= config.timeouts.poll_interval * 3);
    assert!(config.pool_metadata_path().exists());
}

#[tokio::test(start_paused = true)]
async fn test_rerun_while_pool_resizes_waits_without_recreating() {
    let dir = tempfile::tempdir().unwrap();
    let cloud = FakeCloud::new();
    cloud.world().insert("account/batchforgeacct");
    cloud.world().insert("pool/batchforgeacct/batchforge-pool");
    cloud
        .world()
        .settle_after("pool/batchforgeacct/batchforge-pool", 2);
    let executor = cloud.executor();
    let config = config(dir.path()).build().unwrap();
    std::fs::write(config.image_metadata_path(), metadata_document().to_string()).unwrap();

    let report = driver(config.clone(), executor.clone())
        .run(&pool_plan(&config), &mut RunState::new())
        .await
        .unwrap();

    assert_eq!(report.state_of("pool"), Some(StepState::Succeeded));
    assert!(!executor.was_called(&["batch", "pool", "create"]));
    assert_eq!(executor.call_count(&["batch", "pool", "show"]), 3);
}

#[tokio::test(start_paused = true)]
async fn test_batch_account_still_creating_delays_login() {
    let dir = tempfile::tempdir().unwrap();
    let cloud = FakeCloud::new();
    cloud.world().insert("account/batchforgeacct");
    cloud.world().settle_after("account/batchforgeacct", 2);
    let executor = cloud.executor();
    let config = config(dir.path()).build().unwrap();
    std::fs::write(config.image_metadata_path(), metadata_document().to_string()).unwrap();

    let report = driver(config.clone(), executor.clone())
        .run(&pool_plan(&config), &mut RunState::new())
        .await
        .unwrap();

    assert_eq!(report.state_of("batch-account"), Some(StepState::Succeeded));
    assert!(!executor.was_called(&["batch", "account", "create"]));
    let calls = executor.calls();
    let last_show = calls
        .iter()
        .rposition(|c| c.starts_with(&["batch", "account", "show"]))
        .unwrap();
    let login = calls
        .iter()
        .position(|c| c.starts_with(&["batch", "account", "login"]))
        .unwrap();
    assert!(last_show < login);
    assert_eq!(executor.call_count(&["batch", "account", "show"]), 3);
}
