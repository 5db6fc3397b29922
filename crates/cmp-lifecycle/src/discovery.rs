//! Discovery scanner: records certificates presented by network endpoints.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cmp_core::error::CmpResult;
use cmp_core::metrics::MetricsSink;
use cmp_core::models::audit::AuditRecord;
use cmp_core::models::certificate::{DiscoveredCertificate, DiscoveryOutcome};
use cmp_core::models::scan::{ScanProtocol, ScanTarget};
use cmp_core::principal::Principal;
use cmp_core::repository::{CertificateRepository, LifecycleStore};
use cmp_pki::x509;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, ring, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{MissedTickBehavior, interval, timeout};
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::DiscoveryConfig;

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("connect failed: {0}")]
    Connect(#[from] std::io::Error),

    #[error("{stage} timed out after {after:?}")]
    Timeout {
        stage: &'static str,
        after: Duration,
    },

    #[error("invalid server name '{0}'")]
    ServerName(String),

    #[error("TLS handshake failed: {0}")]
    Handshake(String),

    #[error("endpoint presented no certificate")]
    NoCertificate,

    #[error("TLS setup failed: {0}")]
    Setup(String),
}

/// Fetches the leaf certificate an endpoint presents.
pub trait CertificateProbe: Send + Sync + 'static {
    /// DER encoding of the leaf certificate.
    fn probe(&self, target: &ScanTarget) -> impl Future<Output = Result<Vec<u8>, ProbeError>> + Send;
}

/// Accepts any server certificate: the scanner records what it is shown,
/// it does not trust it.
#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// TLS handshake probe with certificate verification disabled.
#[derive(Clone)]
pub struct TlsProbe {
    tls: TlsConnector,
    https: TlsConnector,
    connect_timeout: Duration,
    handshake_timeout: Duration,
}

impl TlsProbe {
    pub fn new(connect_timeout: Duration, handshake_timeout: Duration) -> Result<Self, ProbeError> {
        let provider = Arc::new(ring::default_provider());
        let build = |alpn: &[&[u8]]| -> Result<TlsConnector, ProbeError> {
            let mut config = ClientConfig::builder_with_provider(provider.clone())
                .with_safe_default_protocol_versions()
                .map_err(|e| ProbeError::Setup(e.to_string()))?
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert {
                    provider: provider.clone(),
                }))
                .with_no_client_auth();
            config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
            Ok(TlsConnector::from(Arc::new(config)))
        };
        Ok(Self {
            tls: build(&[])?,
            https: build(&[b"h2".as_slice(), b"http/1.1".as_slice()])?,
            connect_timeout,
            handshake_timeout,
        })
    }

    pub fn from_config(config: &DiscoveryConfig) -> Result<Self, ProbeError> {
        Self::new(
            Duration::from_millis(config.connect_timeout_ms),
            Duration::from_millis(config.handshake_timeout_ms),
        )
    }
}

impl CertificateProbe for TlsProbe {
    async fn probe(&self, target: &ScanTarget) -> Result<Vec<u8>, ProbeError> {
        let server_name = ServerName::try_from(target.host.clone())
            .map_err(|_| ProbeError::ServerName(target.host.clone()))?;

        let stream = timeout(
            self.connect_timeout,
            TcpStream::connect((target.host.as_str(), target.port)),
        )
        .await
        .map_err(|_| ProbeError::Timeout {
            stage: "connect",
            after: self.connect_timeout,
        })??;

        let connector = match target.protocol {
            ScanProtocol::Tls => &self.tls,
            ScanProtocol::Https => &self.https,
        };
        let tls = timeout(self.handshake_timeout, connector.connect(server_name, stream))
            .await
            .map_err(|_| ProbeError::Timeout {
                stage: "handshake",
                after: self.handshake_timeout,
            })?
            .map_err(|e| ProbeError::Handshake(e.to_string()))?;

        let (_, session) = tls.get_ref();
        session
            .peer_certificates()
            .and_then(|chain| chain.first())
            .map(|leaf| leaf.as_ref().to_vec())
            .ok_or(ProbeError::NoCertificate)
    }
}

/// Outcome of one scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub probed: usize,
    pub created: usize,
    pub refreshed: usize,
    pub failed: usize,
}

pub struct DiscoveryScanner<S: LifecycleStore, P: CertificateProbe> {
    store: Arc<S>,
    probe: Arc<P>,
    metrics: Arc<dyn MetricsSink>,
    config: DiscoveryConfig,
}

impl<S: LifecycleStore, P: CertificateProbe> DiscoveryScanner<S, P> {
    pub fn new(
        store: Arc<S>,
        probe: Arc<P>,
        metrics: Arc<dyn MetricsSink>,
        config: DiscoveryConfig,
    ) -> Self {
        Self {
            store,
            probe,
            metrics,
            config,
        }
    }

    pub fn targets(&self) -> &[ScanTarget] {
        &self.config.targets
    }

    /// Probe every configured target once.
    pub async fn tick(&self) -> ScanReport {
        self.scan(&self.config.targets).await
    }

    /// Probe `targets` concurrently, at most `workers` at a time. A failing
    /// target is logged and counted; it never aborts the scan.
    pub async fn scan(&self, targets: &[ScanTarget]) -> ScanReport {
        let permits = Arc::new(Semaphore::new(self.config.workers.max(1)));
        let mut probes = JoinSet::new();
        for target in targets.iter().cloned() {
            let probe = self.probe.clone();
            let permits = permits.clone();
            probes.spawn(async move {
                let result = match permits.acquire_owned().await {
                    Ok(_permit) => probe.probe(&target).await,
                    Err(e) => Err(ProbeError::Setup(e.to_string())),
                };
                (target, result)
            });
        }

        let mut report = ScanReport::default();
        while let Some(joined) = probes.join_next().await {
            report.probed += 1;
            let (target, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    warn!(error = %e, "Probe task failed");
                    report.failed += 1;
                    continue;
                }
            };
            let der = match result {
                Ok(der) => der,
                Err(e) => {
                    warn!(target = %target.address(), error = %e, "Probe failed");
                    self.metrics
                        .increment("cmp_discovery_probe_failures_total", &[]);
                    report.failed += 1;
                    continue;
                }
            };
            match self.record(&target, &der).await {
                Ok(DiscoveryOutcome::Created(_)) => report.created += 1,
                Ok(DiscoveryOutcome::Refreshed(_)) => report.refreshed += 1,
                Err(e) => {
                    warn!(target = %target.address(), error = %e, "Failed to record discovered certificate");
                    report.failed += 1;
                }
            }
        }

        self.metrics.increment("cmp_discovery_scans_total", &[]);
        info!(
            probed = report.probed,
            created = report.created,
            refreshed = report.refreshed,
            failed = report.failed,
            "Discovery scan complete"
        );
        report
    }

    async fn record(&self, target: &ScanTarget, der: &[u8]) -> CmpResult<DiscoveryOutcome> {
        let metadata = x509::parse_der(der)?;
        let source = target.address();
        let id = Uuid::new_v4();
        let audit = AuditRecord::new("certificate", id, "discovered", &Principal::system())
            .with_details(json!({
                "source": source,
                "fingerprint": metadata.fingerprint,
                "common_name": metadata.common_name,
                "not_after": metadata.not_after.to_rfc3339(),
            }));
        let outcome = self
            .store
            .certificates()
            .upsert_discovered(
                DiscoveredCertificate {
                    id,
                    metadata,
                    source,
                    scanned_at: Utc::now(),
                },
                audit,
            )
            .await?;
        if let DiscoveryOutcome::Created(record) = &outcome {
            info!(
                certificate_id = %record.id,
                fingerprint = %record.fingerprint,
                source = record.source.as_deref().unwrap_or_default(),
                "New certificate discovered"
            );
        } else {
            debug!(fingerprint = %outcome.record().fingerprint, "Known certificate seen again");
        }
        Ok(outcome)
    }

    /// Scan every `interval_secs` until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        let period = Duration::from_secs(self.config.interval_secs.max(1));
        info!(
            interval_secs = period.as_secs(),
            targets = self.config.targets.len(),
            workers = self.config.workers,
            "Discovery scanner started"
        );
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }
        info!("Discovery scanner stopped");
    }
}
