use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ::time::{format_description::well_known, OffsetDateTime};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::engine::ScanPhase;
use crate::error::ProbeError;
use crate::target::ScanTarget;
use crate::tls::{self, CertSummary, TLS_PORTS};
use crate::types::{PortState, ProbeFailure};

/// Raw outcome of probing one port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub ip: IpAddr,
    pub port: u16,
    pub state: PortState,
    pub latency_ms: u64,
    /// Bytes the service sent unprompted after connect.
    pub banner: Option<Vec<u8>>,
    /// Reply to the active HTTP probe, plaintext or inside TLS.
    pub response: Option<Vec<u8>>,
    pub tls: bool,
    pub cert: Option<CertSummary>,
    /// Connect error that did not map cleanly to closed/filtered.
    pub error: Option<String>,
    pub timestamp: String,
}

impl Observation {
    fn new(addr: SocketAddr, state: PortState) -> Self {
        Self {
            ip: addr.ip(),
            port: addr.port(),
            state,
            latency_ms: 0,
            banner: None,
            response: None,
            tls: false,
            cert: None,
            error: None,
            timestamp: now_rfc3339(),
        }
    }
}

/// Every completed probe for one host, sorted by port.
#[derive(Debug, Clone, Default)]
pub struct ProbeReport {
    pub observations: Vec<Observation>,
    pub failures: Vec<ProbeFailure>,
    pub cancelled: bool,
}

/// Progress counters shared between a running scan and its observers.
#[derive(Clone, Debug)]
pub struct SharedProgress {
    pub scanned_total: Arc<AtomicU64>,
    pub scanned_done: Arc<AtomicU64>,
    pub open_count: Arc<AtomicU64>,
    phase: Arc<AtomicU8>,
}

impl SharedProgress {
    pub fn new() -> Self {
        Self {
            scanned_total: Arc::new(AtomicU64::new(0)),
            scanned_done: Arc::new(AtomicU64::new(0)),
            open_count: Arc::new(AtomicU64::new(0)),
            phase: Arc::new(AtomicU8::new(ScanPhase::Pending as u8)),
        }
    }

    pub fn phase(&self) -> ScanPhase {
        ScanPhase::from_u8(self.phase.load(Ordering::Relaxed))
    }

    pub fn set_phase(&self, phase: ScanPhase) {
        self.phase.store(phase as u8, Ordering::Relaxed);
    }

    pub fn done(&self) -> u64 {
        self.scanned_done.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.scanned_total.load(Ordering::Relaxed)
    }

    pub fn open(&self) -> u64 {
        self.open_count.load(Ordering::Relaxed)
    }
}

impl Default for SharedProgress {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy, Debug)]
struct ProbeSettings {
    connect_timeout: Duration,
    banner_timeout: Duration,
    max_bytes: usize,
}

/// Probe every port of `target` with bounded concurrency.
///
/// - Limits concurrent socket attempts using a `Semaphore`.
/// - Bounds connects, banner reads and HTTP/TLS probes with timeouts.
/// - On cancellation, stops issuing probes and aborts the ones in flight; only
///   probes that completed appear in the report.
pub async fn scan_ports(
    target: &ScanTarget,
    ports: &[u16],
    config: &EngineConfig,
    cancel: &CancellationToken,
    progress: &SharedProgress,
) -> ProbeReport {
    let settings = ProbeSettings {
        connect_timeout: config.probe_timeout,
        banner_timeout: config.banner_timeout,
        max_bytes: config.banner_max_bytes.max(1),
    };
    let server_name: Arc<str> = Arc::from(target.server_name());
    let sem = Arc::new(Semaphore::new(config.effective_concurrency()));
    let mut set = JoinSet::new();

    progress.scanned_total.fetch_add(ports.len() as u64, Ordering::Relaxed);
    info!(target = %target.label, ip = %target.ip, ports = ports.len(), "probing ports");

    for &port in ports {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            permit = sem.clone().acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => break,
            },
        };
        let cancel = cancel.clone();
        let progress = progress.clone();
        let server_name = server_name.clone();
        let ip = target.ip;

        set.spawn(async move {
            let _permit = permit; // keep permit until task completes
            let obs = tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                obs = probe_port(SocketAddr::new(ip, port), &server_name, settings) => obs,
            };
            if obs.state == PortState::Open {
                progress.open_count.fetch_add(1, Ordering::Relaxed);
            }
            progress.scanned_done.fetch_add(1, Ordering::Relaxed);
            Some(obs)
        });
    }

    let mut report = ProbeReport::default();
    while let Some(res) = set.join_next().await {
        match res {
            Ok(Some(obs)) => report.observations.push(obs),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "probe task failed"),
        }
    }
    report.cancelled = cancel.is_cancelled();
    report.observations.sort_by_key(|o| o.port);
    report.failures = report
        .observations
        .iter()
        .filter_map(|o| {
            o.error.as_ref().map(|e| ProbeFailure {
                host: target.label.clone(),
                port: o.port,
                error: e.clone(),
            })
        })
        .collect();
    debug!(
        target = %target.label,
        completed = report.observations.len(),
        cancelled = report.cancelled,
        "probing finished"
    );
    report
}

async fn connect(addr: SocketAddr, timeout: Duration) -> Result<TcpStream, ProbeError> {
    match time::timeout(timeout, TcpStream::connect(addr)).await {
        Err(_) => Err(ProbeError::Timeout),
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => Err(ProbeError::Refused),
        Ok(Err(e)) => Err(ProbeError::Io(e)),
        Ok(Ok(stream)) => Ok(stream),
    }
}

/// Port state for a failed connect. Only errors other than refusal and
/// timeout are worth reporting.
fn failed_connect(addr: SocketAddr, err: &ProbeError) -> Observation {
    match err {
        ProbeError::Refused => Observation::new(addr, PortState::Closed),
        ProbeError::Timeout => Observation::new(addr, PortState::Filtered),
        ProbeError::Io(_) => {
            let mut obs = Observation::new(addr, PortState::Filtered);
            obs.error = Some(err.to_string());
            obs
        }
    }
}

async fn probe_port(addr: SocketAddr, server_name: &str, s: ProbeSettings) -> Observation {
    let start = Instant::now();
    let mut stream = match connect(addr, s.connect_timeout).await {
        Ok(stream) => stream,
        Err(e) => return failed_connect(addr, &e),
    };

    let mut obs = Observation::new(addr, PortState::Open);
    obs.latency_ms = start.elapsed().as_millis() as u64;

    obs.banner = read_banner(&mut stream, s.banner_timeout, s.max_bytes).await;
    if obs.banner.is_some() {
        return obs;
    }

    let tls_port = TLS_PORTS.contains(&addr.port());
    if tls_port {
        drop(stream);
        if let Some(t) = tls::probe(addr, server_name, s.connect_timeout, s.banner_timeout, s.max_bytes).await {
            obs.tls = true;
            obs.cert = t.cert;
            obs.response = t.response;
            return obs;
        }
        stream = match connect(addr, s.connect_timeout).await {
            Ok(stream) => stream,
            Err(_) => return obs,
        };
    }

    let reply = tls::http_exchange(&mut stream, server_name, s.banner_timeout, s.max_bytes).await;
    drop(stream);
    if !tls_port && reply.as_deref().is_some_and(tls::looks_like_tls_rejection) {
        if let Some(t) = tls::probe(addr, server_name, s.connect_timeout, s.banner_timeout, s.max_bytes).await {
            obs.tls = true;
            obs.cert = t.cert;
            obs.response = t.response;
            return obs;
        }
    }
    obs.response = reply;
    obs
}

/// Single passive read of whatever the service sends first.
async fn read_banner(stream: &mut TcpStream, timeout: Duration, max_bytes: usize) -> Option<Vec<u8>> {
    let mut buf = vec![0u8; max_bytes];
    match time::timeout(timeout, stream.read(&mut buf)).await {
        Ok(Ok(n)) if n > 0 => {
            buf.truncate(n);
            Some(buf)
        }
        _ => None,
    }
}

/// Printable one-line rendition of raw banner bytes.
pub fn sanitize_banner(raw: &[u8]) -> String {
    let s = String::from_utf8_lossy(raw);
    let s = s.trim_end_matches(['\r', '\n', '\0']);
    s.replace('\n', "\\n").replace('\r', "\\r").replace('\0', "\\0")
}

pub fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&well_known::Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}
