//! Facade operations: agents, installation jobs, reads and audit export.

mod common;

use cmp_core::error::CmpError;
use cmp_core::models::agent::RegisterAgent;
use cmp_core::models::installation::JobStatus;
use cmp_core::principal::Principal;
use cmp_lifecycle::config::ApprovalConfig;
use common::{admin, developer, harness};
use uuid::Uuid;

fn agent_principal() -> Principal {
    Principal::new("agent-web-01", &["agent"])
}

#[tokio::test]
async fn installation_job_runs_to_completion() {
    let h = harness(ApprovalConfig::default()).await;
    let cert_id = h.issue("web.example.com").await.issued_certificate_id.unwrap();

    let agent = h
        .service
        .register_agent(
            &agent_principal(),
            RegisterAgent {
                hostname: "web-01".into(),
                ip: Some("10.0.0.5".into()),
            },
        )
        .await
        .unwrap();
    h.service
        .agent_heartbeat(&agent_principal(), agent.id)
        .await
        .unwrap();
    assert_eq!(h.service.list_agents(&developer()).await.unwrap().len(), 1);

    let job = h
        .service
        .create_installation_job(
            &admin(),
            agent.id,
            cert_id,
            "/etc/nginx/tls/web.pem".into(),
            Some("systemctl reload nginx".into()),
        )
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Pending);

    let pending = h.service.pending_jobs(&agent_principal(), agent.id).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, job.id);

    let started = h.service.start_job(&agent_principal(), job.id).await.unwrap();
    assert_eq!(started.status, JobStatus::InProgress);
    let done = h
        .service
        .report_job(&agent_principal(), job.id, true, None)
        .await
        .unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert!(h.service.pending_jobs(&agent_principal(), agent.id).await.unwrap().is_empty());

    let err = h
        .service
        .report_job(&agent_principal(), job.id, false, Some("late".into()))
        .await
        .unwrap_err();
    assert!(matches!(err, CmpError::Conflict { .. }), "got {err:?}");

    assert_eq!(
        h.actions("installation_job", job.id).await,
        vec!["create", "start", "complete"]
    );
}

#[tokio::test]
async fn failed_installation_keeps_the_reason() {
    let h = harness(ApprovalConfig::default()).await;
    let cert_id = h.issue("db.example.com").await.issued_certificate_id.unwrap();
    let agent = h
        .service
        .register_agent(
            &admin(),
            RegisterAgent {
                hostname: "db-01".into(),
                ip: None,
            },
        )
        .await
        .unwrap();
    let job = h
        .service
        .create_installation_job(&admin(), agent.id, cert_id, "/srv/tls/db.pem".into(), None)
        .await
        .unwrap();

    let failed = h
        .service
        .report_job(&agent_principal(), job.id, false, Some("permission denied".into()))
        .await
        .unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.error_message.as_deref(), Some("permission denied"));
}

#[tokio::test]
async fn installation_jobs_are_validated() {
    let h = harness(ApprovalConfig::default()).await;
    let cert_id = h.issue("v.example.com").await.issued_certificate_id.unwrap();
    let agent = h
        .service
        .register_agent(
            &admin(),
            RegisterAgent {
                hostname: "v-01".into(),
                ip: None,
            },
        )
        .await
        .unwrap();

    let err = h
        .service
        .create_installation_job(&admin(), agent.id, cert_id, "relative/path.pem".into(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, CmpError::Validation { .. }));

    let err = h
        .service
        .create_installation_job(&admin(), Uuid::new_v4(), cert_id, "/x.pem".into(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, CmpError::NotFound { .. }));

    let err = h
        .service
        .create_installation_job(&developer(), agent.id, cert_id, "/x.pem".into(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, CmpError::PermissionDenied { .. }));

    let security = Principal::new("sec", &["security"]);
    h.service
        .revoke_certificate(&security, cert_id, None)
        .await
        .unwrap();
    let err = h
        .service
        .create_installation_job(&admin(), agent.id, cert_id, "/x.pem".into(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, CmpError::Validation { .. }));
}

#[tokio::test]
async fn reads_and_audit_export_check_permissions() {
    let h = harness(ApprovalConfig::default()).await;
    let done = h.issue("read.example.com").await;
    let cert_id = done.issued_certificate_id.unwrap();

    let cert = h.service.get_certificate(&developer(), cert_id).await.unwrap();
    assert_eq!(cert.common_name, "read.example.com");
    let request = h.service.get_request(&developer(), done.id).await.unwrap();
    assert_eq!(request.issued_certificate_id, Some(cert_id));

    let nobody = Principal::new("nobody", &[]);
    let err = h.service.get_certificate(&nobody, cert_id).await.unwrap_err();
    assert!(matches!(err, CmpError::PermissionDenied { .. }));

    let entries = h.service.audit_entries(&admin(), 0, 10).await.unwrap();
    assert_eq!(entries.len(), 3);
    assert!(entries.windows(2).all(|w| w[1].previous_hash == w[0].hash));
    let later = h.service.audit_entries(&admin(), 2, 10).await.unwrap();
    assert_eq!(later.len(), 1);
    assert_eq!(later[0].action, "issued");

    let history = h
        .service
        .entity_history(&admin(), "issuance_request", &done.id.to_string())
        .await
        .unwrap();
    assert_eq!(history.len(), 3);

    let err = h.service.audit_entries(&developer(), 0, 10).await.unwrap_err();
    assert!(matches!(err, CmpError::PermissionDenied { .. }));
}
