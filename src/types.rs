use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Body of `POST /api/scan_ports`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ScanRequest {
    pub target: String,
    pub port_range: String,
    #[serde(default)]
    pub quick_scan: bool,
}

/// Body of `POST /api/scan/`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct HeaderScanRequest {
    pub target: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum PortState {
    Open,
    Closed,
    Filtered,
}

impl fmt::Display for PortState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortState::Open => write!(f, "open"),
            PortState::Closed => write!(f, "closed"),
            PortState::Filtered => write!(f, "filtered"),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum TransportProtocol {
    Tcp,
    Udp,
}

impl fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportProtocol::Tcp => write!(f, "tcp"),
            TransportProtocol::Udp => write!(f, "udp"),
        }
    }
}

/// Categorical severity attached to an open port.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    Info,
    Low,
    Medium,
    High,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskLevel::Info => write!(f, "INFO"),
            RiskLevel::Low => write!(f, "LOW"),
            RiskLevel::Medium => write!(f, "MEDIUM"),
            RiskLevel::High => write!(f, "HIGH"),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RiskData {
    pub description: String,
    pub remediation: String,
}

/// Output of one post-probe script (banner, certificate, headers dump).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ScriptOutput {
    pub id: String,
    pub output: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PresentHeader {
    pub header: String,
    pub value: String,
    pub purpose: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct MissingHeader {
    pub header: String,
    pub purpose: String,
    pub recommended: String,
}

/// One port finding. Optional fields are omitted from JSON when absent.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Port {
    pub port: u16,
    pub protocol: TransportProtocol,
    pub state: PortState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extrainfo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conf: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpe: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_level: Option<RiskLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_data: Option<RiskData>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scripts: Vec<ScriptOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parsed_headers: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_headers_present: Option<Vec<PresentHeader>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_headers_missing: Option<Vec<MissingHeader>>,
}

impl Port {
    /// A bare finding with only the probe outcome filled in.
    pub fn new(port: u16, protocol: TransportProtocol, state: PortState) -> Self {
        Self {
            port,
            protocol,
            state,
            service: None,
            product: None,
            version: None,
            extrainfo: None,
            conf: None,
            cpe: None,
            risk_level: None,
            risk_data: None,
            scripts: Vec::new(),
            parsed_headers: None,
            security_headers_present: None,
            security_headers_missing: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Protocol {
    pub protocol: TransportProtocol,
    pub ports: Vec<Port>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HostState {
    Up,
    Down,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Host {
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<HostState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    pub protocols: Vec<Protocol>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_open_ports: Option<u32>,
}

impl Host {
    /// Group findings by transport protocol, sort each group by port number and
    /// derive `total_open_ports` from the result.
    pub fn from_ports(
        host: String,
        hostname: Option<String>,
        ip: Option<String>,
        state: HostState,
        mut ports: Vec<Port>,
    ) -> Self {
        ports.sort_by_key(|p| (p.protocol, p.port));
        let mut protocols: Vec<Protocol> = Vec::new();
        for port in ports {
            match protocols.last_mut() {
                Some(group) if group.protocol == port.protocol => group.ports.push(port),
                _ => protocols.push(Protocol {
                    protocol: port.protocol,
                    ports: vec![port],
                }),
            }
        }
        let mut out = Self {
            host,
            hostname,
            state: Some(state),
            ip,
            protocols,
            total_open_ports: None,
        };
        out.total_open_ports = Some(out.count_open_ports());
        out
    }

    pub fn count_open_ports(&self) -> u32 {
        self.protocols
            .iter()
            .flat_map(|p| p.ports.iter())
            .filter(|p| p.state == PortState::Open)
            .count() as u32
    }
}

/// Why a result holds less than the full requested coverage.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PartialReason {
    Timeout,
    Cancelled,
}

/// A probe-level failure that did not map to a port state.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ProbeFailure {
    pub host: String,
    pub port: u16,
    pub error: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ScanResult {
    pub hosts: Vec<Host>,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial: Option<PartialReason>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ProbeFailure>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct HeaderScore {
    pub security_score: u8,
    pub missing_headers: Vec<String>,
    pub vulnerability_percentage: u8,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PortHeaderReport {
    pub headers_found: BTreeMap<String, String>,
    pub analysis: HeaderScore,
}

/// Response of the headers-scan mode, keyed by port number.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct HeaderScanReport {
    pub target: String,
    pub ports: BTreeMap<u16, PortHeaderReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial: Option<PartialReason>,
}
