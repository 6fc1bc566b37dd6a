use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::error::ScanError;
use crate::fingerprint::{self, ServiceId};
use crate::headers::{HeaderAnalyzer, HeaderFinding};
use crate::ports::{self, PortSpec, WEB_PORTS};
use crate::risk::{self, RiskContext};
use crate::scanner::{self, now_rfc3339, sanitize_banner, Observation, ProbeReport, SharedProgress};
use crate::target::{self, ScanTarget, Scheme, TargetKind};
use crate::types::{
    HeaderScanReport, Host, HostState, PartialReason, Port, PortState, ProbeFailure, ScanRequest,
    ScanResult, ScriptOutput, TransportProtocol,
};

/// Upper bound on a DNS lookup for the scan target.
pub const RESOLVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle of one scan.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanPhase {
    Pending = 0,
    Resolving = 1,
    Expanding = 2,
    Probing = 3,
    Identifying = 4,
    Analyzing = 5,
    Classifying = 6,
    Done = 7,
    Failed = 8,
    Cancelled = 9,
}

impl ScanPhase {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => ScanPhase::Resolving,
            2 => ScanPhase::Expanding,
            3 => ScanPhase::Probing,
            4 => ScanPhase::Identifying,
            5 => ScanPhase::Analyzing,
            6 => ScanPhase::Classifying,
            7 => ScanPhase::Done,
            8 => ScanPhase::Failed,
            9 => ScanPhase::Cancelled,
            _ => ScanPhase::Pending,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ScanPhase::Done | ScanPhase::Failed | ScanPhase::Cancelled)
    }
}

impl fmt::Display for ScanPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScanPhase::Pending => "pending",
            ScanPhase::Resolving => "resolving",
            ScanPhase::Expanding => "expanding",
            ScanPhase::Probing => "probing",
            ScanPhase::Identifying => "identifying",
            ScanPhase::Analyzing => "analyzing",
            ScanPhase::Classifying => "classifying",
            ScanPhase::Done => "done",
            ScanPhase::Failed => "failed",
            ScanPhase::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Cancels a token once the wall-clock budget runs out.
struct Deadline {
    expired: Arc<AtomicBool>,
    timer: JoinHandle<()>,
}

impl Deadline {
    fn arm(after: Duration, token: CancellationToken) -> Self {
        let expired = Arc::new(AtomicBool::new(false));
        let flag = expired.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            flag.store(true, Ordering::SeqCst);
            token.cancel();
        });
        Self { expired, timer }
    }

    fn expired(&self) -> bool {
        self.expired.load(Ordering::SeqCst)
    }
}

impl Drop for Deadline {
    fn drop(&mut self) {
        self.timer.abort();
    }
}

/// Per-host output of the pipeline.
struct HostOutcome {
    index: usize,
    host: Host,
    failures: Vec<ProbeFailure>,
}

/// Drives resolution, probing, identification, header analysis and risk
/// classification for scan requests. Stateless between scans.
#[derive(Debug, Clone)]
pub struct ScanEngine {
    config: Arc<EngineConfig>,
    analyzer: HeaderAnalyzer,
}

impl ScanEngine {
    pub fn new(config: EngineConfig) -> Self {
        let analyzer = HeaderAnalyzer::new(config.http_timeout, config.user_agent.clone());
        Self {
            config: Arc::new(config),
            analyzer,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run a port scan. Request validation failures and internal faults are
    /// errors; cancellation and the scan deadline yield a partial result.
    pub async fn scan(
        &self,
        req: &ScanRequest,
        cancel: CancellationToken,
        progress: &SharedProgress,
    ) -> Result<ScanResult, ScanError> {
        let result = self.scan_inner(req, cancel, progress).await;
        match &result {
            Ok(r) => progress.set_phase(match r.partial {
                Some(PartialReason::Cancelled) => ScanPhase::Cancelled,
                _ => ScanPhase::Done,
            }),
            Err(e) => {
                warn!(target = %req.target, error = %e, "scan failed");
                progress.set_phase(ScanPhase::Failed);
            }
        }
        result
    }

    async fn scan_inner(
        &self,
        req: &ScanRequest,
        cancel: CancellationToken,
        progress: &SharedProgress,
    ) -> Result<ScanResult, ScanError> {
        info!(target = %req.target, port_range = %req.port_range, quick = req.quick_scan, "scan requested");
        let scan_cancel = cancel.child_token();
        let deadline = Deadline::arm(self.config.scan_timeout, scan_cancel.clone());

        progress.set_phase(ScanPhase::Resolving);
        // Both inputs are checked before any lookup goes out.
        let spec = target::parse_target(&req.target)?;
        let ports = ports::expand(&req.port_range, req.quick_scan)?;
        let targets = tokio::select! {
            biased;
            _ = scan_cancel.cancelled() => {
                if deadline.expired() {
                    return Err(ScanError::Timeout);
                }
                return Ok(empty_result(Some(PartialReason::Cancelled)));
            }
            resolved = target::resolve(&spec, RESOLVE_TIMEOUT) => resolved?,
        };

        progress.set_phase(ScanPhase::Expanding);
        debug!(hosts = targets.len(), ports = ports.len(), "scan expanded");

        let outcomes = self.run_hosts(targets, ports, &scan_cancel, progress).await?;

        let mut hosts = Vec::with_capacity(outcomes.len());
        let mut errors = Vec::new();
        for outcome in outcomes {
            hosts.push(outcome.host);
            errors.extend(outcome.failures);
        }
        let partial = if deadline.expired() {
            Some(PartialReason::Timeout)
        } else if scan_cancel.is_cancelled() {
            Some(PartialReason::Cancelled)
        } else {
            None
        };
        info!(
            target = %req.target,
            hosts = hosts.len(),
            open = hosts.iter().filter_map(|h| h.total_open_ports).sum::<u32>(),
            partial = ?partial,
            "scan finished"
        );
        Ok(ScanResult {
            hosts,
            timestamp: now_rfc3339(),
            partial,
            errors,
        })
    }

    async fn run_hosts(
        &self,
        targets: Vec<ScanTarget>,
        ports: PortSpec,
        cancel: &CancellationToken,
        progress: &SharedProgress,
    ) -> Result<Vec<HostOutcome>, ScanError> {
        let ports: Arc<[u16]> = Arc::from(ports.as_slice());
        let sem = Arc::new(Semaphore::new(self.config.max_parallel_hosts.max(1)));
        let mut set = JoinSet::new();

        // With several hosts in flight the per-host stages overlap, so only
        // the coarse phases are published from here.
        let per_host_phases = targets.len() == 1;
        if !per_host_phases {
            progress.set_phase(ScanPhase::Probing);
        }

        for (index, target) in targets.into_iter().enumerate() {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                permit = sem.clone().acquire_owned() => permit
                    .map_err(|e| ScanError::Internal(e.to_string()))?,
            };
            let engine = self.clone();
            let ports = ports.clone();
            let cancel = cancel.clone();
            let progress = progress.clone();
            set.spawn(async move {
                let _permit = permit;
                let phases = per_host_phases.then_some(&progress);
                engine.run_host(index, target, &ports, &cancel, &progress, phases).await
            });
        }

        let mut outcomes = Vec::new();
        while let Some(res) = set.join_next().await {
            match res {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    error!(error = %e, "host pipeline task failed");
                    return Err(ScanError::Internal(e.to_string()));
                }
            }
        }
        if !per_host_phases {
            progress.set_phase(ScanPhase::Classifying);
        }
        outcomes.sort_by_key(|o| o.index);
        Ok(outcomes)
    }

    async fn run_host(
        &self,
        index: usize,
        target: ScanTarget,
        ports: &[u16],
        cancel: &CancellationToken,
        progress: &SharedProgress,
        phases: Option<&SharedProgress>,
    ) -> HostOutcome {
        let enter = |phase: ScanPhase| {
            if let Some(p) = phases {
                p.set_phase(phase);
            }
        };
        enter(ScanPhase::Probing);
        let report = scanner::scan_ports(&target, ports, &self.config, cancel, progress).await;

        enter(ScanPhase::Identifying);
        let ids = identify_all(&report);

        enter(ScanPhase::Analyzing);
        let findings = self.analyze_web_ports(&target, &report, &ids, cancel).await;

        enter(ScanPhase::Classifying);
        let host = assemble_host(&target, &report, &ids, &findings, self.config.include_closed);
        HostOutcome {
            index,
            host,
            failures: report.failures,
        }
    }

    async fn analyze_web_ports(
        &self,
        target: &ScanTarget,
        report: &ProbeReport,
        ids: &BTreeMap<u16, ServiceId>,
        cancel: &CancellationToken,
    ) -> BTreeMap<u16, HeaderFinding> {
        let mut findings = BTreeMap::new();
        for obs in &report.observations {
            let Some(id) = ids.get(&obs.port) else { continue };
            if !id.is_web() {
                continue;
            }
            let tls = obs.tls || id.is_tls_web();
            let finding = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                f = self.analyzer.analyze(target, obs.port, tls) => f,
            };
            findings.insert(obs.port, finding);
        }
        findings
    }

    /// Run a security-header scan against a single host.
    pub async fn scan_headers(
        &self,
        raw_target: &str,
        cancel: CancellationToken,
        progress: &SharedProgress,
    ) -> Result<HeaderScanReport, ScanError> {
        let result = self.scan_headers_inner(raw_target, cancel, progress).await;
        match &result {
            Ok(r) => progress.set_phase(match r.partial {
                Some(PartialReason::Cancelled) => ScanPhase::Cancelled,
                _ => ScanPhase::Done,
            }),
            Err(e) => {
                warn!(target = %raw_target, error = %e, "header scan failed");
                progress.set_phase(ScanPhase::Failed);
            }
        }
        result
    }

    async fn scan_headers_inner(
        &self,
        raw_target: &str,
        cancel: CancellationToken,
        progress: &SharedProgress,
    ) -> Result<HeaderScanReport, ScanError> {
        info!(target = %raw_target, "header scan requested");
        let scan_cancel = cancel.child_token();
        let deadline = Deadline::arm(self.config.scan_timeout, scan_cancel.clone());
        let mut report = HeaderScanReport {
            target: raw_target.trim().to_string(),
            ports: BTreeMap::new(),
            partial: None,
        };

        progress.set_phase(ScanPhase::Resolving);
        let spec = target::parse_target(raw_target)?;
        if matches!(spec.kind, TargetKind::Cidr(_)) {
            return Err(ScanError::InvalidTarget(format!(
                "{raw_target} (header scans take a single host)"
            )));
        }
        let resolved = tokio::select! {
            biased;
            _ = scan_cancel.cancelled() => {
                if deadline.expired() {
                    return Err(ScanError::Timeout);
                }
                report.partial = Some(PartialReason::Cancelled);
                return Ok(report);
            }
            resolved = target::resolve(&spec, RESOLVE_TIMEOUT) => resolved?,
        };
        let target = resolved
            .into_iter()
            .next()
            .ok_or_else(|| ScanError::Internal("resolver returned no address".into()))?;

        progress.set_phase(ScanPhase::Expanding);
        let ports = header_scan_ports(&target);

        progress.set_phase(ScanPhase::Probing);
        let probe = scanner::scan_ports(&target, ports.as_slice(), &self.config, &scan_cancel, progress).await;

        progress.set_phase(ScanPhase::Identifying);
        let mut ids = identify_all(&probe);
        if let Some(scheme) = target.scheme {
            // The URL scheme says what to speak even when identification could not.
            for id in ids.values_mut().filter(|id| !id.is_web()) {
                id.service = Some(scheme.to_string());
            }
        }

        progress.set_phase(ScanPhase::Analyzing);
        let findings = self.analyze_web_ports(&target, &probe, &ids, &scan_cancel).await;
        report.ports = findings.iter().map(|(port, f)| (*port, f.report())).collect();

        report.partial = if deadline.expired() {
            Some(PartialReason::Timeout)
        } else if scan_cancel.is_cancelled() {
            Some(PartialReason::Cancelled)
        } else {
            None
        };
        info!(target = %raw_target, ports = report.ports.len(), "header scan finished");
        Ok(report)
    }
}

/// Ports probed by the header scan: the URL's port, else the scheme default,
/// else the common web ports.
pub fn header_scan_ports(target: &ScanTarget) -> PortSpec {
    match (target.port, target.scheme) {
        (Some(p), _) => PortSpec::from_ports([p]),
        (None, Some(Scheme::Https)) => PortSpec::from_ports([443]),
        (None, Some(Scheme::Http)) => PortSpec::from_ports([80]),
        (None, None) => PortSpec::from_ports(WEB_PORTS.iter().copied()),
    }
}

/// Identify every open port of a probe report.
pub fn identify_all(report: &ProbeReport) -> BTreeMap<u16, ServiceId> {
    report
        .observations
        .iter()
        .filter(|o| o.state == PortState::Open)
        .map(|o| (o.port, fingerprint::identify_observation(o)))
        .collect()
}

/// Turn one observation plus its identification and header analysis into a
/// classified finding.
pub fn build_port(
    obs: &Observation,
    id: Option<&ServiceId>,
    headers: Option<&HeaderFinding>,
    tls_sibling: bool,
) -> Port {
    let mut port = Port::new(obs.port, TransportProtocol::Tcp, obs.state);
    if obs.state != PortState::Open {
        return port;
    }
    if let Some(id) = id {
        id.apply_to(&mut port);
    }
    if let Some(banner) = &obs.banner {
        port.scripts.push(ScriptOutput {
            id: "banner".into(),
            output: sanitize_banner(banner),
        });
    }
    if let Some(cert) = &obs.cert {
        port.scripts.push(ScriptOutput {
            id: "ssl-cert".into(),
            output: cert.render(),
        });
    }
    if let Some(h) = headers {
        h.apply_to(&mut port);
    }
    risk::classify_port(
        &mut port,
        RiskContext {
            security_score: headers.map(HeaderFinding::security_score),
            tls_sibling,
            valid_certificate: obs.cert.as_ref().is_some_and(|c| c.currently_valid),
        },
    );
    port
}

/// Build the `Host` record for one target from its pipeline outputs.
pub fn assemble_host(
    target: &ScanTarget,
    report: &ProbeReport,
    ids: &BTreeMap<u16, ServiceId>,
    findings: &BTreeMap<u16, HeaderFinding>,
    include_closed: bool,
) -> Host {
    let tls_sibling = report
        .observations
        .iter()
        .any(|o| o.tls || ids.get(&o.port).is_some_and(ServiceId::is_tls_web));

    let responded = report
        .observations
        .iter()
        .any(|o| matches!(o.state, PortState::Open | PortState::Closed));
    let state = if responded { HostState::Up } else { HostState::Down };

    let ports: Vec<Port> = report
        .observations
        .iter()
        .filter(|o| include_closed || o.state == PortState::Open)
        .map(|o| {
            let is_tls = o.tls || ids.get(&o.port).is_some_and(ServiceId::is_tls_web);
            build_port(o, ids.get(&o.port), findings.get(&o.port), tls_sibling && !is_tls)
        })
        .collect();

    Host::from_ports(
        target.label.clone(),
        target.hostname.clone(),
        Some(target.ip.to_string()),
        state,
        ports,
    )
}

fn empty_result(partial: Option<PartialReason>) -> ScanResult {
    ScanResult {
        hosts: Vec::new(),
        timestamp: now_rfc3339(),
        partial,
        errors: Vec::new(),
    }
}
