//! Inference orchestrator integration tests
//!
//! End-to-end flows against a scripted backend and an in-process push topic.

mod helpers;

use cdss_ai::error::InferenceError;
use cdss_ai::models::{
    FailureKind, InputRefs, JobState, ModelType, RetryAction, UpdateSource, VisualizationState,
    VolumeShape,
};
use cdss_ai::services::PollSettings;
use cdss_ai::{InferenceOrchestrator, OrchestratorSettings};
use cdss_common::events::{InferenceResultMessage, PushEvent, PushHub, RemoteStatus};
use helpers::{
    cached, completed, failed, pending, segmentation_payload, status, volumetric_result,
    ScriptedApi,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn settings(max_attempts: u32) -> OrchestratorSettings {
    OrchestratorSettings {
        poll: PollSettings {
            max_attempts,
            max_consecutive_errors: 3,
            interval: Duration::from_secs(3),
            recovery_delay: Duration::from_secs(1),
        },
        ..OrchestratorSettings::default()
    }
}

fn push(job_id: &str, status: RemoteStatus, result: Option<serde_json::Value>) -> PushEvent {
    PushEvent::AiInferenceResult(InferenceResultMessage {
        job_id: job_id.to_string(),
        status,
        result,
        error: (status == RemoteStatus::Failed).then(|| "pushed failure".to_string()),
    })
}

// ============================================================================
// Happy path
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_single_modality_scenario_with_volume() {
    let api = Arc::new(
        ScriptedApi::new()
            .submit_reply(pending("job-123"))
            .status_replies([
                status(RemoteStatus::Processing),
                status(RemoteStatus::Processing),
                completed(volumetric_result()),
            ])
            .volume_reply(Ok(segmentation_payload())),
    );
    let orchestrator =
        InferenceOrchestrator::with_settings(api.clone(), ModelType::SingleModality, settings(60));

    let job = orchestrator
        .submit(InputRefs::new().with("ocs_id", 42))
        .await
        .unwrap();

    assert_eq!(job.job_id.as_deref(), Some("job-123"));
    assert_eq!(job.state, JobState::Completed);
    assert!(!job.cached);
    assert_eq!(job.source, Some(UpdateSource::Poll));
    assert_eq!(job.result.as_ref().unwrap()["confidence"], 0.91);

    let submitted = api.submitted.lock().unwrap().clone();
    assert_eq!(submitted.len(), 1);
    assert_eq!(submitted[0].model_code, "M1");
    assert_eq!(submitted[0].input_refs.get("ocs_id"), Some(&json!(42)));
    assert_eq!(api.polls(), 3);
    assert!(api.polled_ids.lock().unwrap().iter().all(|id| id == "job-123"));

    match orchestrator.visualization() {
        VisualizationState::Ready(volume) => {
            assert_eq!(volume.shape, VolumeShape::new(2, 2, 2));
            let t1 = &volume.channels["t1"];
            assert_eq!(t1.shape(), VolumeShape::new(2, 2, 2));
            assert_eq!(t1.get(1, 1, 1), Some(3.5));
            assert_eq!(t1.get(0, 1, 0), Some(1.0));

            let seg = &volume.channels["segmentation"];
            assert_eq!(seg.distinct_labels(), vec![0, 1, 2, 4]);
            assert_eq!(volume.label_channels, vec!["segmentation".to_string()]);
        }
        other => panic!("expected decoded volume, got {:?}", other),
    }
    assert!(!orchestrator.is_in_flight());
}

#[tokio::test(start_paused = true)]
async fn test_result_without_volume_skips_fetch() {
    let api = Arc::new(
        ScriptedApi::new()
            .submit_reply(pending("job-g"))
            .status_reply(completed(json!({"risk_score": 0.4}))),
    );
    let orchestrator =
        InferenceOrchestrator::with_settings(api.clone(), ModelType::GeneExpression, settings(60));

    let job = orchestrator
        .submit(InputRefs::new().with("ocs_id", "OCS-9"))
        .await
        .unwrap();

    assert_eq!(job.state, JobState::Completed);
    assert_eq!(api.volume_fetches(), 0);
    assert_eq!(orchestrator.visualization(), VisualizationState::NotApplicable);
}

// ============================================================================
// Cache short-circuit
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_cached_result_short_circuits() {
    let hub = PushHub::new(16);
    let api = Arc::new(
        ScriptedApi::new()
            .submit_reply(cached("job-old", volumetric_result()))
            .volume_reply(Ok(segmentation_payload())),
    );
    let orchestrator =
        InferenceOrchestrator::with_settings(api.clone(), ModelType::MultiModal, settings(60))
            .with_push_hub(hub.clone());

    let job = orchestrator
        .submit(
            InputRefs::new()
                .with("mri_ocs_id", 1)
                .with("gene_ocs_id", 2)
                .with("protein_ocs_id", 3),
        )
        .await
        .unwrap();

    assert_eq!(job.state, JobState::Completed);
    assert!(job.cached);
    assert_eq!(job.source, Some(UpdateSource::Cache));
    assert_eq!(api.polls(), 0);
    // No push reconciler left listening
    assert_eq!(hub.subscriber_count(), 0);
    // Volume still fetched for a cached volumetric result
    assert_eq!(api.volume_fetches(), 1);
    assert!(orchestrator.visualization().is_ready());
}

// ============================================================================
// Dual-channel reconciliation
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_push_wins_race_and_stops_polling() {
    let hub = PushHub::new(16);
    let hook_hub = hub.clone();
    let api = Arc::new(
        ScriptedApi::new()
            .submit_reply(pending("job-push"))
            .status_forever(status(RemoteStatus::Processing))
            .on_status(move |n| {
                if n == 1 {
                    hook_hub.publish_lossy(push("job-other", RemoteStatus::Completed, Some(json!({}))));
                    hook_hub.publish_lossy(push(
                        "job-push",
                        RemoteStatus::Completed,
                        Some(json!({"fused": true})),
                    ));
                }
            }),
    );
    let orchestrator =
        InferenceOrchestrator::with_settings(api.clone(), ModelType::MultiModal, settings(60))
            .with_push_hub(hub.clone());

    let job = orchestrator
        .submit(InputRefs::new().with("mri_ocs_id", 7))
        .await
        .unwrap();

    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.source, Some(UpdateSource::Push));
    assert_eq!(job.result.unwrap()["fused"], true);
    // Polling stopped during its first interval
    assert_eq!(api.polls(), 1);
    assert_eq!(hub.subscriber_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_first_terminal_wins_over_later_push() {
    let hub = PushHub::new(16);
    let hook_hub = hub.clone();
    // The push failure is published while the poll that returns Completed is in flight
    let api = Arc::new(
        ScriptedApi::new()
            .submit_reply(pending("job-r"))
            .status_reply(completed(json!({"grade": "I"})))
            .on_status(move |_| {
                hook_hub.publish_lossy(push("job-r", RemoteStatus::Failed, None));
            }),
    );
    let orchestrator =
        InferenceOrchestrator::with_settings(api.clone(), ModelType::SingleModality, settings(60))
            .with_push_hub(hub);

    let job = orchestrator
        .submit(InputRefs::new().with("ocs_id", 5))
        .await
        .unwrap();

    // Exactly one terminal state, never overwritten
    match job.state {
        JobState::Completed => {
            assert_eq!(job.source, Some(UpdateSource::Poll));
            assert!(job.error_message.is_none());
        }
        JobState::Failed => {
            assert_eq!(job.source, Some(UpdateSource::Push));
            assert!(job.result.is_none());
        }
        other => panic!("unexpected state {:?}", other),
    }
    assert_eq!(orchestrator.snapshot().unwrap(), job);
}

#[tokio::test(start_paused = true)]
async fn test_push_progress_updates_last_status() {
    let hub = PushHub::new(16);
    let api = Arc::new(
        ScriptedApi::new()
            .submit_reply(pending("job-p"))
            .status_replies([status(RemoteStatus::Pending), completed(json!({}))]),
    );
    let orchestrator = Arc::new(
        InferenceOrchestrator::with_settings(api.clone(), ModelType::SingleModality, settings(60))
            .with_push_hub(hub.clone()),
    );

    let task = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move { orchestrator.submit(InputRefs::new().with("ocs_id", 1)).await })
    };

    tokio::time::sleep(Duration::from_secs(1)).await;
    let mut rx = orchestrator.subscribe().unwrap();
    hub.publish_lossy(push("job-p", RemoteStatus::Validating, None));
    rx.wait_for(|job| job.last_status == Some(RemoteStatus::Validating))
        .await
        .unwrap();

    let job = task.await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Completed);
}

// ============================================================================
// Failures and retry
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_submission_failure_then_resubmit() {
    let api = Arc::new(
        ScriptedApi::new()
            .submit_reply(Err("upstream inference engine unavailable".to_string()))
            .submit_reply(pending("job-2nd"))
            .status_reply(completed(json!({"grade": "III"}))),
    );
    let orchestrator =
        InferenceOrchestrator::with_settings(api.clone(), ModelType::SingleModality, settings(60));

    let job = orchestrator
        .submit(InputRefs::new().with("ocs_id", 42))
        .await
        .unwrap();

    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.failure, Some(FailureKind::Submission));
    assert!(job.job_id.is_none());
    assert!(job.error_message.unwrap().contains("unavailable"));
    assert_eq!(api.polls(), 0);
    assert_eq!(
        orchestrator.snapshot().unwrap().retry_action(),
        Some(RetryAction::Resubmit)
    );

    let retried = orchestrator.retry().await.unwrap();
    assert_eq!(retried.state, JobState::Completed);
    assert_eq!(retried.job_id.as_deref(), Some("job-2nd"));
    assert_eq!(api.submits(), 2);
    // Same inputs resubmitted
    let submitted = api.submitted.lock().unwrap().clone();
    assert_eq!(submitted[0].input_refs, submitted[1].input_refs);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_then_repoll_same_job() {
    let api = Arc::new(
        ScriptedApi::new()
            .submit_reply(pending("job-long"))
            .status_replies([
                status(RemoteStatus::Processing),
                status(RemoteStatus::Processing),
                completed(json!({"grade": "II"})),
            ]),
    );
    let orchestrator =
        InferenceOrchestrator::with_settings(api.clone(), ModelType::SingleModality, settings(2));

    let job = orchestrator
        .submit(InputRefs::new().with("ocs_id", 42))
        .await
        .unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.failure, Some(FailureKind::TimedOut));
    assert_eq!(job.retry_action(), Some(RetryAction::Repoll));
    assert_eq!(api.polls(), 2);

    let retried = orchestrator.retry().await.unwrap();
    assert_eq!(retried.state, JobState::Completed);
    assert_eq!(retried.job_id.as_deref(), Some("job-long"));
    assert_eq!(api.submits(), 1);
    assert_eq!(api.polls(), 3);
    assert!(api.polled_ids.lock().unwrap().iter().all(|id| id == "job-long"));
}

#[tokio::test(start_paused = true)]
async fn test_server_failure_not_retried_automatically() {
    let api = Arc::new(
        ScriptedApi::new()
            .submit_reply(pending("job-f"))
            .status_reply(failed("Tumor segmentation model crashed: CUDA error 700")),
    );
    let orchestrator =
        InferenceOrchestrator::with_settings(api.clone(), ModelType::SingleModality, settings(60));

    let job = orchestrator
        .submit(InputRefs::new().with("ocs_id", 42))
        .await
        .unwrap();

    assert_eq!(job.failure, Some(FailureKind::ServerReported));
    assert_eq!(
        job.error_message.as_deref(),
        Some("Tumor segmentation model crashed: CUDA error 700")
    );
    assert_eq!(api.polls(), 1);
    assert_eq!(api.submits(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_retry_without_job_or_on_completed() {
    let api = Arc::new(
        ScriptedApi::new()
            .submit_reply(pending("job-ok"))
            .status_reply(completed(json!({}))),
    );
    let orchestrator =
        InferenceOrchestrator::with_settings(api.clone(), ModelType::SingleModality, settings(60));

    assert!(matches!(orchestrator.retry().await, Err(InferenceError::NoJob)));

    orchestrator
        .submit(InputRefs::new().with("ocs_id", 1))
        .await
        .unwrap();
    assert!(matches!(
        orchestrator.retry().await,
        Err(InferenceError::InvalidInput(_))
    ));
}

// ============================================================================
// Volume failures
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_decode_failure_keeps_result_and_is_retryable() {
    let mut bad = segmentation_payload();
    bad.shape = VolumeShape::new(3, 2, 2);

    let api = Arc::new(
        ScriptedApi::new()
            .submit_reply(pending("job-v"))
            .status_reply(completed(volumetric_result()))
            .volume_reply(Ok(bad)),
    );
    let orchestrator =
        InferenceOrchestrator::with_settings(api.clone(), ModelType::SingleModality, settings(60));

    let job = orchestrator
        .submit(InputRefs::new().with("ocs_id", 42))
        .await
        .unwrap();

    assert_eq!(job.state, JobState::Completed);
    assert!(job.result.is_some());
    match orchestrator.visualization() {
        VisualizationState::Unavailable(reason) => {
            assert!(reason.starts_with("Decode error"), "{}", reason);
            assert!(reason.contains("segmentation"), "{}", reason);
            assert!(reason.contains("mismatch"), "{}", reason);
        }
        other => panic!("expected unavailable, got {:?}", other),
    }

    api.set_volume(Ok(segmentation_payload()));
    let state = orchestrator.retry_visualization().await.unwrap();
    assert!(state.is_ready());
    assert!(orchestrator.visualization().is_ready());
    assert_eq!(api.volume_fetches(), 2);
    // Retrying the visualization never touches the job
    assert_eq!(orchestrator.snapshot().unwrap(), job);
}

#[tokio::test(start_paused = true)]
async fn test_retry_visualization_rejected_while_next_job_runs() {
    let api = Arc::new(
        ScriptedApi::new()
            .submit_reply(pending("job-1"))
            .submit_reply(pending("job-2"))
            .status_reply(completed(volumetric_result()))
            .status_forever(status(RemoteStatus::Processing))
            .volume_reply(Ok(segmentation_payload())),
    );
    let orchestrator = Arc::new(InferenceOrchestrator::with_settings(
        api.clone(),
        ModelType::SingleModality,
        settings(60),
    ));

    orchestrator
        .submit(InputRefs::new().with("ocs_id", 1))
        .await
        .unwrap();
    assert!(orchestrator.visualization().is_ready());

    let task = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move { orchestrator.submit(InputRefs::new().with("ocs_id", 2)).await })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;

    // The previous job's volume must not come back for the new job
    match orchestrator.retry_visualization().await {
        Err(InferenceError::JobInFlight(job_id)) => assert_eq!(job_id, "job-2"),
        other => panic!("expected JobInFlight, got {:?}", other),
    }
    assert_eq!(orchestrator.visualization(), VisualizationState::NotApplicable);

    orchestrator.cancel().unwrap();
    let job = task.await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Cancelled);
    assert_eq!(orchestrator.visualization(), VisualizationState::NotApplicable);
    assert_eq!(api.volume_fetches(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_volume_fetch_failure_keeps_result() {
    let api = Arc::new(
        ScriptedApi::new()
            .submit_reply(pending("job-n"))
            .status_reply(completed(json!({"volume": {"available": true}})))
            .volume_reply(Err("connection refused".to_string())),
    );
    let orchestrator =
        InferenceOrchestrator::with_settings(api.clone(), ModelType::SingleModality, settings(60));

    let job = orchestrator
        .submit(InputRefs::new().with("ocs_id", 42))
        .await
        .unwrap();

    assert_eq!(job.state, JobState::Completed);
    assert!(matches!(
        orchestrator.visualization(),
        VisualizationState::Unavailable(_)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_job_is_polling_before_any_status_arrives() {
    let api = Arc::new(
        ScriptedApi::new()
            .submit_reply(pending("job-e"))
            .status_forever(Err("connection reset".to_string())),
    );
    let orchestrator = Arc::new(InferenceOrchestrator::with_settings(
        api.clone(),
        ModelType::SingleModality,
        settings(60),
    ));

    let task = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move { orchestrator.submit(InputRefs::new().with("ocs_id", 1)).await })
    };
    // First lookup failed; waiting out the recovery delay
    tokio::time::sleep(Duration::from_millis(500)).await;

    let job = orchestrator.snapshot().unwrap();
    assert_eq!(job.state, JobState::Polling);
    assert_eq!(job.last_status, None);
    assert_eq!(api.polls(), 1);

    let job = task.await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.failure, Some(FailureKind::LookupFailed));
}

// ============================================================================
// Validation, cancellation, lifecycle
// ============================================================================

#[tokio::test]
async fn test_invalid_inputs_never_submitted() {
    let api = Arc::new(ScriptedApi::new());
    let orchestrator = InferenceOrchestrator::new(api.clone(), ModelType::MultiModal);

    let err = orchestrator
        .submit(InputRefs::new().with("ocs_id", 1))
        .await
        .unwrap_err();
    assert!(matches!(err, InferenceError::InvalidInput(_)));

    let err = orchestrator.submit(InputRefs::new()).await.unwrap_err();
    assert!(matches!(err, InferenceError::InvalidInput(_)));

    assert_eq!(api.submits(), 0);
    assert!(orchestrator.snapshot().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_second_submit_while_in_flight_rejected() {
    let api = Arc::new(
        ScriptedApi::new()
            .submit_reply(pending("job-busy"))
            .status_forever(status(RemoteStatus::Processing)),
    );
    let orchestrator = Arc::new(InferenceOrchestrator::with_settings(
        api.clone(),
        ModelType::SingleModality,
        settings(60),
    ));

    let task = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move { orchestrator.submit(InputRefs::new().with("ocs_id", 1)).await })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert!(orchestrator.is_in_flight());
    match orchestrator.submit(InputRefs::new().with("ocs_id", 2)).await {
        Err(InferenceError::JobInFlight(job_id)) => assert_eq!(job_id, "job-busy"),
        other => panic!("expected JobInFlight, got {:?}", other),
    }

    orchestrator.cancel().unwrap();
    let job = task.await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Cancelled);
    assert!(!orchestrator.is_in_flight());
}

#[tokio::test(start_paused = true)]
async fn test_user_cancel_stops_polling() {
    let hub = PushHub::new(16);
    let api = Arc::new(
        ScriptedApi::new()
            .submit_reply(pending("job-c"))
            .status_forever(status(RemoteStatus::Processing)),
    );
    let orchestrator = Arc::new(
        InferenceOrchestrator::with_settings(api.clone(), ModelType::SingleModality, settings(60))
            .with_push_hub(hub.clone()),
    );

    let task = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move { orchestrator.submit(InputRefs::new().with("ocs_id", 1)).await })
    };
    tokio::time::sleep(Duration::from_millis(4500)).await;

    let cancelled = orchestrator.cancel().unwrap().unwrap();
    assert_eq!(cancelled.state, JobState::Cancelled);

    let job = task.await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Cancelled);
    assert_eq!(job.source, Some(UpdateSource::Local));
    assert_eq!(job.retry_action(), Some(RetryAction::Repoll));
    assert_eq!(api.polls(), 2);
    assert_eq!(hub.subscriber_count(), 0);

    // A late push for the cancelled job changes nothing
    hub.publish_lossy(push("job-c", RemoteStatus::Completed, Some(json!({}))));
    assert_eq!(orchestrator.snapshot().unwrap().state, JobState::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn test_close_abandons_job_and_volume() {
    let api = Arc::new(
        ScriptedApi::new()
            .submit_reply(pending("job-x"))
            .status_forever(status(RemoteStatus::Processing)),
    );
    let orchestrator = Arc::new(InferenceOrchestrator::with_settings(
        api.clone(),
        ModelType::SingleModality,
        settings(60),
    ));

    let task = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move { orchestrator.submit(InputRefs::new().with("ocs_id", 1)).await })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;

    orchestrator.close();
    let job = task.await.unwrap().unwrap();

    assert!(job.is_terminal());
    assert_eq!(job.state, JobState::Cancelled);
    assert_eq!(api.polls(), 1);
    assert_eq!(orchestrator.visualization(), VisualizationState::NotApplicable);
    assert!(orchestrator.is_closed());

    let err = orchestrator
        .submit(InputRefs::new().with("ocs_id", 1))
        .await
        .unwrap_err();
    assert!(matches!(err, InferenceError::InvalidInput(_)));
}

#[tokio::test(start_paused = true)]
async fn test_parent_token_cancels_screen() {
    let shutdown = tokio_util::sync::CancellationToken::new();
    let api = Arc::new(ScriptedApi::new());
    let orchestrator = InferenceOrchestrator::new(api, ModelType::SingleModality)
        .with_parent_token(&shutdown);

    assert!(!orchestrator.is_closed());
    shutdown.cancel();
    assert!(orchestrator.is_closed());
}
