use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use axum::{http::HeaderName, response::IntoResponse, routing::get, Router};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use netaudit_rs::config::EngineConfig;
use netaudit_rs::engine::{assemble_host, identify_all, ScanEngine, ScanPhase};
use netaudit_rs::error::ScanError;
use netaudit_rs::headers;
use netaudit_rs::scanner::{Observation, ProbeReport, SharedProgress};
use netaudit_rs::target::ScanTarget;
use netaudit_rs::tls::CertSummary;
use netaudit_rs::types::{HostState, PartialReason, Port, PortState, RiskLevel, ScanRequest};

fn test_config() -> EngineConfig {
    EngineConfig {
        concurrency: 16,
        probe_timeout: Duration::from_millis(500),
        banner_timeout: Duration::from_millis(200),
        http_timeout: Duration::from_secs(3),
        scan_timeout: Duration::from_secs(30),
        ..EngineConfig::default()
    }
}

fn request(target: &str, port_range: &str) -> ScanRequest {
    ScanRequest {
        target: target.into(),
        port_range: port_range.into(),
        quick_scan: false,
    }
}

async fn ssh_listener() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let _ = stream.write_all(b"SSH-2.0-OpenSSH_8.9p1 Ubuntu-3ubuntu0.1\r\n").await;
                tokio::time::sleep(Duration::from_secs(2)).await;
            });
        }
    });
    port
}

async fn partly_hardened() -> impl IntoResponse {
    (
        [
            (HeaderName::from_static("server"), "unit-test"),
            (HeaderName::from_static("x-frame-options"), "SAMEORIGIN"),
            (HeaderName::from_static("x-content-type-options"), "nosniff"),
        ],
        "hello",
    )
}

async fn http_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let app = Router::new().route("/", get(partly_hardened));
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    port
}

async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

fn all_ports(host: &netaudit_rs::types::Host) -> Vec<&Port> {
    host.protocols.iter().flat_map(|p| p.ports.iter()).collect()
}

#[tokio::test]
async fn scans_local_services_end_to_end() {
    let ssh = ssh_listener().await;
    let http = http_server().await;
    let closed = closed_port().await;

    let engine = ScanEngine::new(test_config());
    let progress = SharedProgress::new();
    let range = format!("{ssh},{http},{closed}");
    let result = engine
        .scan(&request("127.0.0.1", &range), CancellationToken::new(), &progress)
        .await
        .expect("scan succeeds");

    assert_eq!(result.partial, None);
    assert_eq!(result.hosts.len(), 1);
    let host = &result.hosts[0];
    assert_eq!(host.state, Some(HostState::Up));
    assert_eq!(host.total_open_ports, Some(2));
    assert_eq!(host.total_open_ports, Some(host.count_open_ports()));

    let ports = all_ports(host);
    assert_eq!(ports.len(), 2, "closed ports are omitted by default");
    assert!(ports.windows(2).all(|w| w[0].port < w[1].port));

    let ssh_port = ports.iter().find(|p| p.port == ssh).unwrap();
    assert_eq!(ssh_port.service.as_deref(), Some("ssh"));
    assert_eq!(ssh_port.product.as_deref(), Some("OpenSSH"));
    assert_eq!(ssh_port.version.as_deref(), Some("8.9p1"));
    assert_eq!(ssh_port.conf.as_deref(), Some("10"));
    assert_eq!(ssh_port.risk_level, Some(RiskLevel::Medium));
    assert_eq!(ssh_port.scripts[0].id, "banner");

    let http_port = ports.iter().find(|p| p.port == http).unwrap();
    assert_eq!(http_port.service.as_deref(), Some("http"));
    let parsed = http_port.parsed_headers.as_ref().unwrap();
    assert_eq!(parsed.get("X-Frame-Options").map(String::as_str), Some("SAMEORIGIN"));
    assert_eq!(http_port.security_headers_present.as_ref().unwrap().len(), 2);
    assert_eq!(http_port.security_headers_missing.as_ref().unwrap().len(), 3);
    assert_eq!(http_port.risk_level, Some(RiskLevel::Medium));
    assert_eq!(
        http_port.risk_data.as_ref().unwrap().description,
        "Unencrypted HTTP service detected"
    );
    assert_eq!(http_port.scripts.last().unwrap().id, "http-headers");

    assert_eq!(progress.phase(), ScanPhase::Done);
    assert_eq!(progress.done(), 3);
    assert_eq!(progress.open(), 2);
}

#[tokio::test]
async fn include_closed_reports_every_port() {
    let closed = closed_port().await;
    let engine = ScanEngine::new(EngineConfig {
        include_closed: true,
        ..test_config()
    });
    let result = engine
        .scan(
            &request("127.0.0.1", &closed.to_string()),
            CancellationToken::new(),
            &SharedProgress::new(),
        )
        .await
        .unwrap();

    let host = &result.hosts[0];
    let ports = all_ports(host);
    assert_eq!(ports.len(), 1);
    assert_eq!(ports[0].state, PortState::Closed);
    assert_eq!(ports[0].risk_level, None);
    assert_eq!(host.total_open_ports, Some(0));
    assert_eq!(host.state, Some(HostState::Up));
}

#[tokio::test]
async fn rejects_bad_requests_before_probing() {
    let engine = ScanEngine::new(test_config());
    let progress = SharedProgress::new();

    let err = engine
        .scan(&request("127.0.0.1", "80-"), CancellationToken::new(), &progress)
        .await
        .unwrap_err();
    assert!(matches!(err, ScanError::InvalidPortRange(_)));
    assert_eq!(progress.phase(), ScanPhase::Failed);
    assert_eq!(progress.done(), 0);

    let err = engine
        .scan(&request("bad host!", "80"), CancellationToken::new(), &SharedProgress::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ScanError::InvalidTarget(_)));

    let err = engine
        .scan(&request("no-such-host.invalid", "80"), CancellationToken::new(), &SharedProgress::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ScanError::UnresolvableTarget { .. }));

    // A hostname never gets looked up when the range is already bad.
    let progress = SharedProgress::new();
    let err = engine
        .scan(&request("no-such-host.invalid", "80-"), CancellationToken::new(), &progress)
        .await
        .unwrap_err();
    assert!(matches!(err, ScanError::InvalidPortRange(_)));
    assert_eq!(progress.phase(), ScanPhase::Failed);
}

#[tokio::test]
async fn cancelled_scan_returns_partial_result() {
    let engine = ScanEngine::new(test_config());
    let progress = SharedProgress::new();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = engine
        .scan(&request("127.0.0.1", "1-1024"), cancel, &progress)
        .await
        .unwrap();
    assert_eq!(result.partial, Some(PartialReason::Cancelled));
    assert!(result.hosts.is_empty());
    assert_eq!(progress.phase(), ScanPhase::Cancelled);
}

#[tokio::test]
async fn deadline_yields_timeout_partial() {
    // Listeners that never accept: the kernel completes the handshake, reads
    // time out, and each probe takes several hundred milliseconds.
    let mut listeners = Vec::new();
    let mut ports = Vec::new();
    for _ in 0..10 {
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        ports.push(l.local_addr().unwrap().port().to_string());
        listeners.push(l);
    }
    let engine = ScanEngine::new(EngineConfig {
        concurrency: 1,
        scan_timeout: Duration::from_millis(600),
        ..test_config()
    });
    let progress = SharedProgress::new();
    let result = engine
        .scan(&request("127.0.0.1", &ports.join(",")), CancellationToken::new(), &progress)
        .await
        .unwrap();

    assert_eq!(result.partial, Some(PartialReason::Timeout));
    assert!(progress.done() < 10);
    let reported: u32 = result.hosts.iter().filter_map(|h| h.total_open_ports).sum();
    assert!(reported as u64 <= progress.done());
    drop(listeners);
}

#[tokio::test]
async fn header_scan_reports_url_port() {
    let http = http_server().await;
    let engine = ScanEngine::new(test_config());
    let report = engine
        .scan_headers(
            &format!("http://127.0.0.1:{http}/"),
            CancellationToken::new(),
            &SharedProgress::new(),
        )
        .await
        .unwrap();

    assert_eq!(report.ports.len(), 1);
    let found = &report.ports[&http];
    assert_eq!(found.analysis.security_score, 40);
    assert_eq!(found.analysis.vulnerability_percentage, 60);
    assert!(found.analysis.missing_headers.contains(&"Content-Security-Policy".to_string()));
    assert_eq!(found.headers_found.get("Server").map(String::as_str), Some("unit-test"));
}

fn observation(port: u16, banner: Option<&[u8]>, response: Option<&[u8]>, tls: bool) -> Observation {
    Observation {
        ip: IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7)),
        port,
        state: PortState::Open,
        latency_ms: 12,
        banner: banner.map(<[u8]>::to_vec),
        response: response.map(<[u8]>::to_vec),
        tls,
        cert: None,
        error: None,
        timestamp: "2025-01-01T00:00:00Z".into(),
    }
}

fn header_map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

// Web server with HTTP and HTTPS plus an exposed MySQL.
#[test]
fn web_and_database_host_is_classified() {
    let nginx: &[u8] = b"HTTP/1.1 200 OK\r\nServer: nginx/1.18.0 (Ubuntu)\r\nContent-Type: text/html\r\n\r\n";
    let mysql: &[u8] = b"\x4a\x00\x00\x00\x0a8.0.35\x00\x08\x00\x00\x00abcdefgh\x00";
    let mut https_obs = observation(443, None, Some(nginx), true);
    https_obs.cert = Some(CertSummary {
        subject: "CN=ivp.isea.in".into(),
        issuer: "CN=R11, O=Let's Encrypt, C=US".into(),
        not_after: "2099-04-19T12:00:00Z".into(),
        currently_valid: true,
    });
    let report = ProbeReport {
        observations: vec![
            observation(80, None, Some(nginx), false),
            https_obs,
            observation(3306, Some(mysql), None, false),
        ],
        failures: Vec::new(),
        cancelled: false,
    };
    let ids = identify_all(&report);

    let mut findings = BTreeMap::new();
    findings.insert(
        80,
        headers::evaluate(header_map(&[
            ("Server", "nginx/1.18.0 (Ubuntu)"),
            ("Date", "Sun, 19 Jan 2025 13:42:39 GMT"),
            ("Content-Type", "text/html"),
            ("X-Frame-Options", "SAMEORIGIN"),
        ])),
    );
    findings.insert(
        443,
        headers::evaluate(header_map(&[
            ("Strict-Transport-Security", "max-age=63072000; includeSubDomains; preload"),
            ("X-Frame-Options", "DENY"),
        ])),
    );
    assert_eq!(findings[&80].score.security_score, 20);
    assert_eq!(findings[&443].score.security_score, 40);

    let target = ScanTarget {
        label: "ivp.isea.in".into(),
        hostname: Some("ivp.isea.in".into()),
        ip: IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7)),
        scheme: None,
        port: None,
    };
    let host = assemble_host(&target, &report, &ids, &findings, false);

    assert_eq!(host.host, "ivp.isea.in");
    assert_eq!(host.total_open_ports, Some(3));
    let ports = all_ports(&host);
    assert_eq!(ports.iter().map(|p| p.port).collect::<Vec<_>>(), vec![80, 443, 3306]);

    let http = ports[0];
    assert_eq!(http.service.as_deref(), Some("http"));
    assert_eq!(http.product.as_deref(), Some("nginx"));
    assert_eq!(http.version.as_deref(), Some("1.18.0"));
    assert_eq!(http.extrainfo.as_deref(), Some("(Ubuntu)"));
    assert_eq!(http.cpe.as_deref(), Some("cpe:/a:igor_sysoev:nginx:1.18.0"));
    assert_eq!(http.conf.as_deref(), Some("10"));
    assert_eq!(http.risk_level, Some(RiskLevel::Medium));
    let http_risk = http.risk_data.as_ref().unwrap();
    assert_eq!(http_risk.description, "Unencrypted HTTP service detected");
    assert_eq!(
        http_risk.remediation,
        "Implement HTTPS with TLS 1.2+ and redirect HTTP to HTTPS"
    );

    let https = ports[1];
    assert_eq!(https.service.as_deref(), Some("https"));
    assert_eq!(https.risk_level, Some(RiskLevel::Low));
    let https_risk = https.risk_data.as_ref().unwrap();
    assert_eq!(https_risk.description, "HTTPS service with valid certificate");
    assert_eq!(https_risk.remediation, "Ensure TLS 1.2+ only and strong cipher suites");
    assert!(https.scripts.iter().any(|s| s.id == "ssl-cert"));

    let db = ports[2];
    assert_eq!(db.service.as_deref(), Some("mysql"));
    assert_eq!(db.version.as_deref(), Some("8.0.35"));
    assert_eq!(db.risk_level, Some(RiskLevel::High));
    assert_eq!(
        db.risk_data.as_ref().unwrap().description,
        "Database service exposed to internet"
    );
}
