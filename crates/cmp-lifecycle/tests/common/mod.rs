//! Shared fixtures: in-memory store, scripted CA adapter and a wired-up
//! service.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{Datelike, Utc};
use cmp_core::metrics::NoopMetrics;
use cmp_core::models::adapter::{AdapterConfig, AdapterKind, AdapterSettings, CreateAdapterConfig};
use cmp_core::models::approval::ApproverSpec;
use cmp_core::models::issuance::{CsrAttributes, IssuanceRequest, IssuanceStatus};
use cmp_core::models::certificate::KeyAlgorithm;
use cmp_core::principal::Principal;
use cmp_core::repository::{AdapterConfigRepository, AuditLogRepository, LifecycleStore};
use cmp_db::SurrealStore;
use cmp_lifecycle::config::{ApprovalConfig, PipelineConfig, RetryPolicy};
use cmp_lifecycle::{
    ApprovalGate, AuditService, IssuancePipeline, LifecycleService, NewIssuance, RoleRegistry,
};
use cmp_pki::{AdapterError, AdapterResolver, CaAdapter, IssuedCertificate, PrivateKeyMaterial};
use rcgen::{CertificateParams, DnType, KeyPair};
use serde_json::{Value, json};
use surrealdb::Surreal;
use surrealdb::engine::local::{Db, Mem};
use uuid::Uuid;

pub type Store = SurrealStore<Db>;
pub type Pipeline = IssuancePipeline<Store, ScriptedResolver>;
pub type Service = LifecycleService<Store, ScriptedResolver>;

/// CA adapter replaying queued outcomes; an empty queue means success.
pub struct ScriptedAdapter {
    outcomes: Mutex<VecDeque<AdapterError>>,
    pub issue_calls: AtomicU32,
    /// Lifetime of issued certificates in days from today.
    pub lifetime_days: AtomicI64,
    pub revoked: Mutex<Vec<String>>,
    revoke_outcomes: Mutex<VecDeque<AdapterError>>,
    pub revoke_calls: AtomicU32,
    /// Key algorithms `supports_key` turns away.
    refused: Mutex<Vec<KeyAlgorithm>>,
    next_serial: AtomicU32,
}

impl Default for ScriptedAdapter {
    fn default() -> Self {
        Self {
            outcomes: Mutex::new(VecDeque::new()),
            issue_calls: AtomicU32::new(0),
            lifetime_days: AtomicI64::new(90),
            revoked: Mutex::new(Vec::new()),
            revoke_outcomes: Mutex::new(VecDeque::new()),
            revoke_calls: AtomicU32::new(0),
            refused: Mutex::new(Vec::new()),
            next_serial: AtomicU32::new(1),
        }
    }
}

impl ScriptedAdapter {
    pub fn fail_next(&self, errors: impl IntoIterator<Item = AdapterError>) {
        self.outcomes.lock().unwrap().extend(errors);
    }

    pub fn set_lifetime_days(&self, days: i64) {
        self.lifetime_days.store(days, Ordering::SeqCst);
    }

    pub fn fail_next_revoke(&self, errors: impl IntoIterator<Item = AdapterError>) {
        self.revoke_outcomes.lock().unwrap().extend(errors);
    }

    pub fn refuse(&self, algorithm: KeyAlgorithm) {
        self.refused.lock().unwrap().push(algorithm);
    }

    pub fn accept_all(&self) {
        self.refused.lock().unwrap().clear();
    }
}

impl CaAdapter for ScriptedAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Manual
    }

    async fn issue(&self, csr: &CsrAttributes) -> Result<IssuedCertificate, AdapterError> {
        self.issue_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.outcomes.lock().unwrap().pop_front() {
            return Err(err);
        }
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(csr.effective_sans()).unwrap();
        params
            .distinguished_name
            .push(DnType::CommonName, csr.common_name.clone());
        let expiry = Utc::now() + chrono::Duration::days(self.lifetime_days.load(Ordering::SeqCst));
        params.not_after = rcgen::date_time_ymd(expiry.year(), expiry.month() as u8, expiry.day() as u8);
        let cert = params.self_signed(&key).unwrap();
        let serial = format!("0a:{:02x}", self.next_serial.fetch_add(1, Ordering::SeqCst));
        Ok(IssuedCertificate {
            certificate_pem: cert.pem(),
            chain_pem: None,
            private_key: PrivateKeyMaterial::Pem(key.serialize_pem()),
            serial: Some(serial),
        })
    }

    fn supports_key(&self, algorithm: KeyAlgorithm, key_size: u32) -> Result<(), AdapterError> {
        if self.refused.lock().unwrap().contains(&algorithm) {
            return Err(AdapterError::UnsupportedAlgorithm(format!(
                "{algorithm:?} ({key_size} bits) refused by the scripted CA"
            )));
        }
        Ok(())
    }

    async fn revoke(&self, serial: &str) -> Result<(), AdapterError> {
        self.revoke_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.revoke_outcomes.lock().unwrap().pop_front() {
            return Err(err);
        }
        self.revoked.lock().unwrap().push(serial.to_string());
        Ok(())
    }

    async fn status(&self, certificate_ref: &str) -> Result<Value, AdapterError> {
        Ok(json!({ "adapter": "scripted", "ref": certificate_ref }))
    }
}

/// Hands out the same scripted adapter for every enabled config.
#[derive(Clone, Default)]
pub struct ScriptedResolver {
    pub adapter: Arc<ScriptedAdapter>,
}

impl AdapterResolver for ScriptedResolver {
    type Adapter = ScriptedAdapter;

    fn resolve(&self, config: &AdapterConfig) -> Result<Arc<ScriptedAdapter>, AdapterError> {
        if !config.enabled {
            return Err(AdapterError::Permanent(format!("adapter '{}' is disabled", config.name)));
        }
        Ok(self.adapter.clone())
    }
}

pub struct Harness {
    pub db: Surreal<Db>,
    pub store: Arc<Store>,
    pub adapter: Arc<ScriptedAdapter>,
    pub adapter_id: Uuid,
    pub pipeline: Pipeline,
    pub service: Service,
}

pub fn fast_pipeline_config() -> PipelineConfig {
    PipelineConfig {
        poll_interval_secs: 1,
        max_concurrent: 4,
        batch_size: 50,
        adapter_timeout_ms: 2_000,
        default_adapter_id: None,
        retry: RetryPolicy {
            max_attempts: 3,
            initial_backoff_ms: 10,
            max_backoff_ms: 40,
            multiplier: 2.0,
        },
    }
}

/// Approvers `a`, `b` and `c`, all needing the `security` role.
pub fn three_approvers(required: u32) -> ApprovalConfig {
    ApprovalConfig {
        approvers: ["a", "b", "c"]
            .iter()
            .map(|u| ApproverSpec {
                user_id: u.to_string(),
                role: "security".into(),
            })
            .collect(),
        required_approvals: required,
    }
}

pub async fn harness(approval: ApprovalConfig) -> Harness {
    harness_with(approval, fast_pipeline_config()).await
}

/// Like [`harness`] with a custom pipeline config. `default_adapter_id` is
/// always overwritten with the scripted adapter.
pub async fn harness_with(approval: ApprovalConfig, mut config: PipelineConfig) -> Harness {
    let db = Surreal::new::<Mem>(()).await.unwrap();
    db.use_ns("test").use_db("test").await.unwrap();
    cmp_db::run_migrations(&db).await.unwrap();
    let store = Arc::new(SurrealStore::new(db.clone(), [7u8; 32]));

    let adapter_config = store
        .adapters()
        .create(CreateAdapterConfig {
            name: "scripted".into(),
            settings: AdapterSettings::Manual,
            enabled: true,
        })
        .await
        .unwrap();

    let resolver = ScriptedResolver::default();
    let adapter = resolver.adapter.clone();
    let checker = Arc::new(RoleRegistry::default());
    let metrics = Arc::new(NoopMetrics);
    config.default_adapter_id = Some(adapter_config.id);

    let pipeline = IssuancePipeline::new(
        store.clone(),
        Arc::new(resolver),
        checker.clone(),
        metrics.clone(),
        config,
        approval,
    );
    let service = LifecycleService::new(
        store.clone(),
        checker,
        pipeline.clone(),
        ApprovalGate::new(store.clone(), metrics),
        AuditService::new(store.clone()),
    );
    Harness {
        db,
        store,
        adapter,
        adapter_id: adapter_config.id,
        pipeline,
        service,
    }
}

pub fn admin() -> Principal {
    Principal::new("root", &["admin"])
}

pub fn developer() -> Principal {
    Principal::new("dev", &["developer"])
}

pub fn rsa_csr(common_name: &str) -> CsrAttributes {
    CsrAttributes {
        key_algorithm: KeyAlgorithm::Rsa,
        ..csr(common_name)
    }
}

pub fn csr(common_name: &str) -> CsrAttributes {
    CsrAttributes {
        common_name: common_name.into(),
        sans: vec![common_name.into()],
        key_algorithm: KeyAlgorithm::Ecdsa,
        key_size: None,
    }
}

impl Harness {
    pub fn new_issuance(&self, common_name: &str) -> NewIssuance {
        NewIssuance {
            csr: csr(common_name),
            adapter_id: self.adapter_id,
        }
    }

    /// Submit as admin and process to completion.
    pub async fn issue(&self, common_name: &str) -> IssuanceRequest {
        let request = self
            .pipeline
            .submit(&admin(), self.new_issuance(common_name))
            .await
            .unwrap();
        let done = self.pipeline.process(request.id).await.unwrap();
        assert_eq!(done.status, IssuanceStatus::Issued, "{:?}", done.error_message);
        done
    }

    /// Audit actions recorded for one entity, in chain order.
    pub async fn actions(&self, entity_type: &str, entity_id: impl ToString) -> Vec<String> {
        self.store
            .audit()
            .list_for_entity(entity_type, &entity_id.to_string())
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.action)
            .collect()
    }
}

/// Poll `check` every 20ms for up to five seconds.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..250 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not met within 5s");
}
