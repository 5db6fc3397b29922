//! Approval-gated issuance end to end.

mod common;

use cmp_core::error::CmpError;
use cmp_core::models::approval::{ApproverSpec, CreateApprovalWorkflow, WorkflowStatus};
use cmp_core::models::issuance::IssuanceStatus;
use cmp_core::principal::Principal;
use cmp_lifecycle::ApprovalGate;
use cmp_core::metrics::NoopMetrics;
use common::{developer, harness, three_approvers};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio_util::sync::CancellationToken;

fn approver(name: &str) -> Principal {
    Principal::new(name, &["security"])
}

#[tokio::test]
async fn two_of_three_approvals_release_the_request() {
    let h = harness(three_approvers(2)).await;
    let request = h
        .service
        .request_certificate(&developer(), h.new_issuance("gated.example.com"))
        .await
        .unwrap();
    assert_eq!(request.status, IssuanceStatus::AwaitingApproval);
    let workflow_id = request.approval_workflow_id.unwrap();

    let wf = h
        .service
        .approve(&approver("a"), workflow_id, Some("looks fine".into()))
        .await
        .unwrap();
    assert_eq!(wf.status, WorkflowStatus::Pending);
    assert_eq!(wf.approved_count(), 1);
    assert!(wf.completed_at.is_none());
    assert_eq!(
        h.pipeline.get_request(request.id).await.unwrap().status,
        IssuanceStatus::AwaitingApproval
    );

    let wf = h
        .service
        .approve(&approver("b"), workflow_id, None)
        .await
        .unwrap();
    assert_eq!(wf.status, WorkflowStatus::Approved);
    assert!(wf.completed_at.is_some());
    assert_eq!(wf.version, 2);

    h.pipeline.wait_idle().await;
    let issued = h.pipeline.get_request(request.id).await.unwrap();
    assert_eq!(issued.status, IssuanceStatus::Issued);
    assert!(issued.issued_certificate_id.is_some());

    // A decided workflow is frozen.
    let err = h
        .service
        .approve(&approver("c"), workflow_id, None)
        .await
        .unwrap_err();
    assert!(matches!(err, CmpError::Conflict { .. }), "got {err:?}");

    assert_eq!(
        h.actions("approval_workflow", workflow_id).await,
        vec!["approve", "approve"]
    );
    let request_actions = h.actions("issuance_request", request.id).await;
    assert_eq!(request_actions[..2], ["create", "approved"]);
    assert_eq!(request_actions.last().map(String::as_str), Some("issued"));
}

#[tokio::test]
async fn single_rejection_fails_the_request() {
    let h = harness(three_approvers(2)).await;
    let request = h
        .service
        .request_certificate(&developer(), h.new_issuance("nope.example.com"))
        .await
        .unwrap();
    let workflow_id = request.approval_workflow_id.unwrap();

    h.service
        .approve(&approver("a"), workflow_id, None)
        .await
        .unwrap();
    let wf = h
        .service
        .reject(&approver("c"), workflow_id, Some("wildcard not allowed".into()))
        .await
        .unwrap();
    assert_eq!(wf.status, WorkflowStatus::Rejected);

    let failed = h.pipeline.get_request(request.id).await.unwrap();
    assert_eq!(failed.status, IssuanceStatus::Failed);
    assert_eq!(
        failed.error_message.as_deref(),
        Some("rejected by c: wildcard not allowed")
    );
    assert_eq!(failed.attempts, 0);
}

#[tokio::test]
async fn deciding_twice_conflicts() {
    let h = harness(three_approvers(3)).await;
    let request = h
        .service
        .request_certificate(&developer(), h.new_issuance("twice.example.com"))
        .await
        .unwrap();
    let workflow_id = request.approval_workflow_id.unwrap();

    h.service
        .approve(&approver("a"), workflow_id, None)
        .await
        .unwrap();
    let err = h
        .service
        .approve(&approver("a"), workflow_id, None)
        .await
        .unwrap_err();
    assert!(matches!(err, CmpError::Conflict { .. }));
}

#[tokio::test]
async fn only_designated_approvers_with_the_role_may_decide() {
    let h = harness(three_approvers(1)).await;
    let request = h
        .service
        .request_certificate(&developer(), h.new_issuance("who.example.com"))
        .await
        .unwrap();
    let workflow_id = request.approval_workflow_id.unwrap();

    let err = h
        .service
        .approve(&approver("mallory"), workflow_id, None)
        .await
        .unwrap_err();
    assert!(matches!(err, CmpError::NotFound { .. }));

    // Member, and allowed to approve in general, but not in the named role.
    let err = h
        .service
        .approve(&Principal::new("a", &["admin"]), workflow_id, None)
        .await
        .unwrap_err();
    assert!(matches!(err, CmpError::PermissionDenied { .. }));

    // Named role but no approval permission at all.
    let err = h
        .service
        .approve(&Principal::new("a", &["viewer"]), workflow_id, None)
        .await
        .unwrap_err();
    assert!(matches!(err, CmpError::PermissionDenied { .. }));

    let wf = h.service.get_workflow(&developer(), workflow_id).await.unwrap();
    assert_eq!(wf.status, WorkflowStatus::Pending);
    assert_eq!(wf.version, 0);
}

#[tokio::test]
async fn standalone_workflows_gate_nothing() {
    let h = harness(three_approvers(1)).await;
    let gate = ApprovalGate::new(h.store.clone(), Arc::new(NoopMetrics));
    let wf = gate
        .create(
            &developer(),
            CreateApprovalWorkflow {
                entity_type: "adapter_config".into(),
                entity_id: h.adapter_id.to_string(),
                requester_id: "dev".into(),
                approvers: vec![ApproverSpec {
                    user_id: "a".into(),
                    role: "security".into(),
                }],
                required_approvals: 1,
            },
        )
        .await
        .unwrap();
    assert!(wf.request_id.is_none());

    let decided = h
        .service
        .approve(&approver("a"), wf.id, None)
        .await
        .unwrap();
    assert_eq!(decided.status, WorkflowStatus::Approved);
    assert_eq!(
        h.actions("approval_workflow", wf.id).await,
        vec!["create", "approve"]
    );

    let err = gate
        .create(
            &developer(),
            CreateApprovalWorkflow {
                entity_type: "x".into(),
                entity_id: "y".into(),
                requester_id: "dev".into(),
                approvers: vec![],
                required_approvals: 1,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CmpError::Validation { .. }));
}

#[tokio::test]
async fn decisions_recorded_without_a_release_are_swept_up() {
    let h = harness(three_approvers(1)).await;
    // The gate alone saves decisions; it never touches the request.
    let gate = ApprovalGate::new(h.store.clone(), Arc::new(NoopMetrics));
    let approved = h
        .service
        .request_certificate(&developer(), h.new_issuance("swept.example.com"))
        .await
        .unwrap();
    let rejected = h
        .service
        .request_certificate(&developer(), h.new_issuance("refused.example.com"))
        .await
        .unwrap();

    gate.approve(&approver("a"), approved.approval_workflow_id.unwrap(), None)
        .await
        .unwrap();
    gate.reject(&approver("b"), rejected.approval_workflow_id.unwrap(), Some("no".into()))
        .await
        .unwrap();
    for id in [approved.id, rejected.id] {
        assert_eq!(
            h.pipeline.get_request(id).await.unwrap().status,
            IssuanceStatus::AwaitingApproval
        );
    }

    assert_eq!(h.pipeline.release_decided().await.unwrap(), 2);
    h.pipeline.wait_idle().await;
    assert_eq!(
        h.pipeline.get_request(approved.id).await.unwrap().status,
        IssuanceStatus::Issued
    );
    let failed = h.pipeline.get_request(rejected.id).await.unwrap();
    assert_eq!(failed.status, IssuanceStatus::Failed);
    assert_eq!(failed.error_message.as_deref(), Some("rejected by b: no"));

    assert_eq!(h.pipeline.release_decided().await.unwrap(), 0);
}

#[tokio::test]
async fn the_worker_loop_releases_approved_requests() {
    let h = harness(three_approvers(1)).await;
    let gate = ApprovalGate::new(h.store.clone(), Arc::new(NoopMetrics));
    let request = h
        .service
        .request_certificate(&developer(), h.new_issuance("loop-gated.example.com"))
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let worker = {
        let pipeline = h.pipeline.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { pipeline.run(cancel).await })
    };
    gate.approve(&approver("c"), request.approval_workflow_id.unwrap(), None)
        .await
        .unwrap();

    let pipeline = h.pipeline.clone();
    common::eventually(|| {
        let pipeline = pipeline.clone();
        async move {
            pipeline.get_request(request.id).await.unwrap().status == IssuanceStatus::Issued
        }
    })
    .await;
    cancel.cancel();
    worker.await.unwrap();
}

#[tokio::test]
async fn applying_a_decided_workflow_twice_is_harmless() {
    let h = harness(three_approvers(1)).await;
    let request = h
        .service
        .request_certificate(&developer(), h.new_issuance("again.example.com"))
        .await
        .unwrap();
    let wf = h
        .service
        .approve(&approver("a"), request.approval_workflow_id.unwrap(), None)
        .await
        .unwrap();
    assert_eq!(wf.status, WorkflowStatus::Approved);

    let again = h
        .pipeline
        .on_workflow_decided(&Principal::system(), &wf)
        .await
        .unwrap();
    assert!(again.is_none());
    h.pipeline.wait_idle().await;
    assert_eq!(
        h.pipeline.get_request(request.id).await.unwrap().status,
        IssuanceStatus::Issued
    );
    assert_eq!(h.adapter.issue_calls.load(Ordering::SeqCst), 1);
}
