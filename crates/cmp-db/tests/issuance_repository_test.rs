//! Integration tests for issuance requests and approval workflows using
//! in-memory SurrealDB.

use chrono::{Duration, Utc};
use cmp_core::error::CmpError;
use cmp_core::models::approval::{
    ApproverSpec, CreateApprovalWorkflow, Decision, WorkflowStatus,
};
use cmp_core::models::audit::AuditRecord;
use cmp_core::models::certificate::{
    CertificateMetadata, CertificateRecord, CertificateStatus, DiscoveredCertificate,
    KeyAlgorithm, NewCertificate,
};
use cmp_core::models::issuance::{
    CreateIssuanceRequest, CsrAttributes, IssuanceStatus, NewApprovalWorkflow,
};
use cmp_core::principal::Principal;
use cmp_core::repository::{
    ApprovalRepository, AuditLogRepository, CertificateRepository, IssuanceRequestRepository,
    LifecycleStore,
};
use cmp_db::SurrealStore;
use surrealdb::Surreal;
use surrealdb::engine::local::{Db, Mem};
use uuid::Uuid;

async fn setup() -> SurrealStore<Db> {
    let db = Surreal::new::<Mem>(()).await.unwrap();
    db.use_ns("test").use_db("test").await.unwrap();
    cmp_db::run_migrations(&db).await.unwrap();
    SurrealStore::new(db, [5u8; 32])
}

fn metadata(fingerprint: &str, cn: &str) -> CertificateMetadata {
    let now = Utc::now();
    CertificateMetadata {
        fingerprint: fingerprint.into(),
        common_name: cn.into(),
        sans: vec![cn.into()],
        issuer: "CN=Test CA".into(),
        not_before: now,
        not_after: now + Duration::days(10),
        key_algorithm: KeyAlgorithm::Ecdsa,
        key_size: 256,
        serial: Some("0a".into()),
        cert_pem: "-----BEGIN CERTIFICATE-----\n-----END CERTIFICATE-----\n".into(),
    }
}

async fn seed_certificate(store: &SurrealStore<Db>, fingerprint: &str) -> CertificateRecord {
    let input = DiscoveredCertificate {
        id: Uuid::new_v4(),
        metadata: metadata(fingerprint, "web.example.com"),
        source: "h:443".into(),
        scanned_at: Utc::now(),
    };
    let audit = AuditRecord::new("certificate", input.id, "discovered", &Principal::system());
    store
        .certificates()
        .upsert_discovered(input, audit)
        .await
        .unwrap()
        .record()
        .clone()
}

fn csr(cn: &str) -> CsrAttributes {
    CsrAttributes {
        common_name: cn.into(),
        sans: vec![],
        key_algorithm: KeyAlgorithm::Ecdsa,
        key_size: None,
    }
}

fn request(original: Option<Uuid>) -> CreateIssuanceRequest {
    CreateIssuanceRequest {
        id: Uuid::new_v4(),
        owner_id: "alice".into(),
        csr: csr("web.example.com"),
        adapter_id: Uuid::new_v4(),
        renewal: original.is_some(),
        original_certificate_id: original,
        approval: None,
    }
}

fn audit_for(id: Uuid, action: &str) -> AuditRecord {
    AuditRecord::new("issuance_request", id, action, &Principal::system())
}

#[tokio::test]
async fn renewal_claims_target_and_blocks_second_request() {
    let store = setup().await;
    let cert = seed_certificate(&store, "f1").await;

    let first = request(Some(cert.id));
    let created = store
        .requests()
        .create(first.clone(), audit_for(first.id, "create"))
        .await
        .unwrap();
    assert_eq!(created.status, IssuanceStatus::Pending);
    assert!(created.renewal);

    let claimed = store.certificates().get_by_id(cert.id).await.unwrap();
    assert_eq!(claimed.open_request_id, Some(first.id));

    let second = request(Some(cert.id));
    let err = store
        .requests()
        .create(second.clone(), audit_for(second.id, "create"))
        .await
        .unwrap_err();
    assert!(matches!(err, CmpError::Conflict { .. }), "got {err:?}");

    // The rejected request left nothing behind, not even an audit entry.
    assert!(store.requests().get_by_id(second.id).await.is_err());
    let entries = store.audit().list(0, 100).await.unwrap();
    assert!(entries.iter().all(|e| e.entity_id != second.id.to_string()));

    // The claimed certificate is no longer a renewal candidate.
    let candidates = store
        .certificates()
        .list_renewal_candidates(Utc::now() + Duration::days(30), 10)
        .await
        .unwrap();
    assert!(candidates.is_empty());
}

#[tokio::test]
async fn revoked_certificates_cannot_be_renewed() {
    let store = setup().await;
    let cert = seed_certificate(&store, "f2").await;
    store
        .certificates()
        .revoke(cert.id, AuditRecord::new("certificate", cert.id, "revoke", &Principal::system()))
        .await
        .unwrap();

    let input = request(Some(cert.id));
    let err = store
        .requests()
        .create(input.clone(), audit_for(input.id, "create"))
        .await
        .unwrap_err();
    assert!(matches!(err, CmpError::Validation { .. }), "got {err:?}");
}

#[tokio::test]
async fn failure_releases_the_claim() {
    let store = setup().await;
    let cert = seed_certificate(&store, "f3").await;
    let input = request(Some(cert.id));
    let requests = store.requests();
    requests
        .create(input.clone(), audit_for(input.id, "create"))
        .await
        .unwrap();
    requests
        .transition(
            input.id,
            IssuanceStatus::Pending,
            IssuanceStatus::Processing,
            audit_for(input.id, "processing"),
        )
        .await
        .unwrap();
    let attempt = requests
        .record_attempt(input.id, 1, "vault unavailable".into(), audit_for(input.id, "issuance_attempt_failed"))
        .await
        .unwrap();
    assert_eq!(attempt.attempts, 1);

    let failed = requests
        .fail(
            input.id,
            IssuanceStatus::Processing,
            3,
            "vault unavailable".into(),
            audit_for(input.id, "fail"),
        )
        .await
        .unwrap();
    assert_eq!(failed.status, IssuanceStatus::Failed);
    assert_eq!(failed.attempts, 3);
    assert_eq!(failed.error_message.as_deref(), Some("vault unavailable"));
    assert!(failed.completed_at.is_some());

    let released = store.certificates().get_by_id(cert.id).await.unwrap();
    assert_eq!(released.open_request_id, None);

    // A new renewal may now be opened.
    let retry = request(Some(cert.id));
    requests
        .create(retry.clone(), audit_for(retry.id, "create"))
        .await
        .unwrap();
}

#[tokio::test]
async fn stale_transition_is_a_conflict() {
    let store = setup().await;
    let input = request(None);
    let requests = store.requests();
    requests
        .create(input.clone(), audit_for(input.id, "create"))
        .await
        .unwrap();
    requests
        .transition(input.id, IssuanceStatus::Pending, IssuanceStatus::Processing, audit_for(input.id, "processing"))
        .await
        .unwrap();

    let err = requests
        .transition(input.id, IssuanceStatus::Pending, IssuanceStatus::Processing, audit_for(input.id, "processing"))
        .await
        .unwrap_err();
    assert!(matches!(err, CmpError::Conflict { .. }), "got {err:?}");

    let err = requests
        .transition(input.id, IssuanceStatus::Processing, IssuanceStatus::Issued, audit_for(input.id, "issue"))
        .await
        .unwrap_err();
    assert!(matches!(err, CmpError::Internal(_)), "got {err:?}");
}

#[tokio::test]
async fn completion_creates_certificate_and_releases_claim() {
    let store = setup().await;
    let original = seed_certificate(&store, "f4").await;
    let input = request(Some(original.id));
    let requests = store.requests();
    requests
        .create(input.clone(), audit_for(input.id, "create"))
        .await
        .unwrap();
    requests
        .transition(input.id, IssuanceStatus::Pending, IssuanceStatus::Processing, audit_for(input.id, "processing"))
        .await
        .unwrap();

    let new_cert = NewCertificate {
        id: Uuid::new_v4(),
        metadata: metadata("f4-renewed", "web.example.com"),
        chain_pem: Some("chain".into()),
        private_key_ref: Some("secret:abc".into()),
        owner_id: Some("alice".into()),
        adapter_id: Some(input.adapter_id),
    };
    let (issued, cert) = requests
        .complete_issued(input.id, 1, new_cert.clone(), audit_for(input.id, "issue"))
        .await
        .unwrap();
    assert_eq!(issued.status, IssuanceStatus::Issued);
    assert_eq!(issued.issued_certificate_id, Some(new_cert.id));
    assert_eq!(cert.id, new_cert.id);
    assert_eq!(cert.status, CertificateStatus::Active);
    assert_eq!(cert.private_key_ref.as_deref(), Some("secret:abc"));
    assert_eq!(cert.adapter_id, Some(input.adapter_id));

    let released = store.certificates().get_by_id(original.id).await.unwrap();
    assert_eq!(released.open_request_id, None);
    assert_eq!(released.renewed_by, Some(new_cert.id));

    // Only the replacement remains eligible for renewal.
    let candidates = store
        .certificates()
        .list_renewal_candidates(Utc::now() + Duration::days(30), 10)
        .await
        .unwrap();
    let ids: Vec<Uuid> = candidates.iter().map(|c| c.id).collect();
    assert_eq!(ids, vec![new_cert.id]);

    // Terminal requests stay terminal.
    let err = requests
        .fail(input.id, IssuanceStatus::Processing, 1, "late".into(), audit_for(input.id, "fail"))
        .await
        .unwrap_err();
    assert!(matches!(err, CmpError::Conflict { .. }));
}

#[tokio::test]
async fn completion_racing_discovery_yields_one_certificate() {
    let store = setup().await;
    let input = request(None);
    let requests = store.requests();
    requests
        .create(input.clone(), audit_for(input.id, "create"))
        .await
        .unwrap();
    requests
        .transition(input.id, IssuanceStatus::Pending, IssuanceStatus::Processing, audit_for(input.id, "processing"))
        .await
        .unwrap();

    let issued = NewCertificate {
        id: Uuid::new_v4(),
        metadata: metadata("shared", "web.example.com"),
        chain_pem: None,
        private_key_ref: Some("secret:race".into()),
        owner_id: Some("alice".into()),
        adapter_id: Some(input.adapter_id),
    };
    let seen = DiscoveredCertificate {
        id: Uuid::new_v4(),
        metadata: metadata("shared", "web.example.com"),
        source: "web:443".into(),
        scanned_at: Utc::now(),
    };
    let discovered_audit = AuditRecord::new("certificate", seen.id, "discovered", &Principal::system());
    let (completed, discovered) = tokio::join!(
        requests.complete_issued(input.id, 1, issued, audit_for(input.id, "issue")),
        store.certificates().upsert_discovered(seen, discovered_audit),
    );
    let (request, _) = completed.unwrap();
    discovered.unwrap();

    // Whichever insert ran first, both sides now point at one record that
    // carries the pipeline's key.
    let record = store.certificates().get_by_fingerprint("shared").await.unwrap();
    assert_eq!(request.status, IssuanceStatus::Issued);
    assert_eq!(request.issued_certificate_id, Some(record.id));
    assert_eq!(record.private_key_ref.as_deref(), Some("secret:race"));
    assert_eq!(record.adapter_id, Some(input.adapter_id));
}

#[tokio::test]
async fn completion_adopts_a_record_discovery_created_first() {
    let store = setup().await;
    let discovered = seed_certificate(&store, "seen-first").await;
    let input = request(None);
    let requests = store.requests();
    requests
        .create(input.clone(), audit_for(input.id, "create"))
        .await
        .unwrap();
    requests
        .transition(input.id, IssuanceStatus::Pending, IssuanceStatus::Processing, audit_for(input.id, "processing"))
        .await
        .unwrap();

    let issued = NewCertificate {
        id: Uuid::new_v4(),
        metadata: metadata("seen-first", "web.example.com"),
        chain_pem: None,
        private_key_ref: Some("secret:adopted".into()),
        owner_id: Some("alice".into()),
        adapter_id: Some(input.adapter_id),
    };
    let (request, record) = requests
        .complete_issued(input.id, 1, issued, audit_for(input.id, "issue"))
        .await
        .unwrap();
    assert_eq!(record.id, discovered.id);
    assert_eq!(request.issued_certificate_id, Some(discovered.id));
    assert_eq!(record.owner_id.as_deref(), Some("alice"));
    assert_eq!(record.private_key_ref.as_deref(), Some("secret:adopted"));
    assert_eq!(record.source.as_deref(), Some("h:443"));
}

#[tokio::test]
async fn only_the_first_sighting_of_an_issued_certificate_is_audited() {
    let store = setup().await;
    let input = request(None);
    let requests = store.requests();
    requests
        .create(input.clone(), audit_for(input.id, "create"))
        .await
        .unwrap();
    requests
        .transition(input.id, IssuanceStatus::Pending, IssuanceStatus::Processing, audit_for(input.id, "processing"))
        .await
        .unwrap();
    let issued = NewCertificate {
        id: Uuid::new_v4(),
        metadata: metadata("deployed", "web.example.com"),
        chain_pem: None,
        private_key_ref: None,
        owner_id: Some("alice".into()),
        adapter_id: Some(input.adapter_id),
    };
    let (_, record) = requests
        .complete_issued(input.id, 1, issued, audit_for(input.id, "issue"))
        .await
        .unwrap();
    assert_eq!(record.source, None);

    let mut last_scan = None;
    for source in ["10.0.0.1:443", "10.0.0.2:443", "10.0.0.1:443"] {
        let seen = DiscoveredCertificate {
            id: Uuid::new_v4(),
            metadata: metadata("deployed", "web.example.com"),
            source: source.into(),
            scanned_at: Utc::now(),
        };
        let audit = AuditRecord::new("certificate", seen.id, "discovered", &Principal::system());
        let refreshed = store
            .certificates()
            .upsert_discovered(seen, audit)
            .await
            .unwrap()
            .record()
            .clone();
        assert_eq!(refreshed.id, record.id);
        assert_eq!(refreshed.source.as_deref(), Some(source));
        assert!(refreshed.last_scanned_at.is_some());
        assert!(refreshed.last_scanned_at >= last_scan);
        last_scan = refreshed.last_scanned_at;
    }

    let entries = store
        .audit()
        .list_for_entity("certificate", &record.id.to_string())
        .await
        .unwrap();
    let actions: Vec<&str> = entries.iter().map(|e| e.action.as_str()).collect();
    assert_eq!(actions, vec!["first_seen"]);
    assert_eq!(entries[0].details["source"], "10.0.0.1:443");
}

#[tokio::test]
async fn gated_request_creates_workflow_atomically() {
    let store = setup().await;
    let mut input = request(None);
    let workflow_id = Uuid::new_v4();
    input.approval = Some(NewApprovalWorkflow {
        id: workflow_id,
        spec: CreateApprovalWorkflow {
            entity_type: "issuance_request".into(),
            entity_id: input.id.to_string(),
            requester_id: "alice".into(),
            approvers: vec![
                ApproverSpec { user_id: "bob".into(), role: "security".into() },
                ApproverSpec { user_id: "carol".into(), role: "security".into() },
            ],
            required_approvals: 1,
        },
    });

    let created = store
        .requests()
        .create(input.clone(), audit_for(input.id, "create"))
        .await
        .unwrap();
    assert_eq!(created.status, IssuanceStatus::AwaitingApproval);
    assert_eq!(created.approval_workflow_id, Some(workflow_id));

    let workflow = store.approvals().get_by_request(input.id).await.unwrap();
    assert_eq!(workflow.id, workflow_id);
    assert_eq!(workflow.status, WorkflowStatus::Pending);
    assert_eq!(workflow.approvers.len(), 2);
    assert_eq!(workflow.approvers[1].step, 2);
    assert_eq!(workflow.version, 0);
}

#[tokio::test]
async fn stale_decision_is_a_conflict() {
    let store = setup().await;
    let mut input = request(None);
    input.approval = Some(NewApprovalWorkflow {
        id: Uuid::new_v4(),
        spec: CreateApprovalWorkflow {
            entity_type: "issuance_request".into(),
            entity_id: input.id.to_string(),
            requester_id: "alice".into(),
            approvers: vec![
                ApproverSpec { user_id: "bob".into(), role: "security".into() },
                ApproverSpec { user_id: "carol".into(), role: "security".into() },
            ],
            required_approvals: 2,
        },
    });
    store
        .requests()
        .create(input.clone(), audit_for(input.id, "create"))
        .await
        .unwrap();

    let approvals = store.approvals();
    let loaded = approvals.get_by_request(input.id).await.unwrap();

    let mut by_bob = loaded.clone();
    by_bob
        .record_decision("bob", Decision::Approve, None, Utc::now())
        .unwrap();
    let saved = approvals
        .save_decision(
            by_bob,
            loaded.version,
            AuditRecord::new("approval_workflow", loaded.id, "approve", &Principal::new("bob", &["security"])),
        )
        .await
        .unwrap();
    assert_eq!(saved.version, 1);
    assert_eq!(saved.approved_count(), 1);
    assert_eq!(saved.status, WorkflowStatus::Pending);

    // Carol decided on the copy loaded before Bob's decision was saved.
    let mut by_carol = loaded.clone();
    by_carol
        .record_decision("carol", Decision::Approve, None, Utc::now())
        .unwrap();
    let err = approvals
        .save_decision(
            by_carol,
            loaded.version,
            AuditRecord::new("approval_workflow", loaded.id, "approve", &Principal::new("carol", &["security"])),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CmpError::Conflict { .. }), "got {err:?}");

    let current = approvals.get_by_id(loaded.id).await.unwrap();
    assert_eq!(current.approved_count(), 1);
}
