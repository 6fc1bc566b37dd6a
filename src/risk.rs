//! Deterministic risk rules for open ports.
//!
//! Every assessment comes from the static [`RULES`] table, so identical inputs
//! always produce identical level, description and remediation text.

use crate::types::{Port, PortState, RiskData, RiskLevel};

/// Header scores below this make a web service HIGH risk.
pub const WEAK_HEADER_THRESHOLD: u8 = 30;
/// Header scores at or above this make an HTTPS service LOW risk.
pub const STRONG_HEADER_THRESHOLD: u8 = 70;

const DATABASES: &[&str] = &[
    "mysql", "postgresql", "ms-sql-s", "oracle", "mongodb", "redis", "memcache", "elasticsearch",
    "couchdb",
];
const DATABASE_PORTS: &[u16] = &[1433, 1521, 3306, 5432, 5984, 6379, 9200, 11211, 27017, 27018];

const CLEARTEXT_SHELLS: &[&str] = &["telnet", "exec", "login", "shell"];
const CLEARTEXT_SHELL_PORTS: &[u16] = &[23, 512, 513, 514];

const REMOTE_DESKTOPS: &[&str] = &["ms-wbt-server", "vnc"];
const REMOTE_DESKTOP_PORTS: &[u16] = &[3389, 5900, 5901];

const CONTAINER_APIS: &[&str] = &["docker"];
const CONTAINER_API_PORTS: &[u16] = &[2375];

const FILE_SHARING: &[&str] = &["microsoft-ds", "netbios-ssn", "nfs"];
const FILE_SHARING_PORTS: &[u16] = &[139, 445, 2049];

const CLEARTEXT_PROTOCOLS: &[&str] = &["ftp", "pop3", "imap", "snmp", "ldap"];

const PLAIN_WEB: &[&str] = &["http", "http-alt", "http-proxy"];
const TLS_WEB: &[&str] = &["https", "https-alt"];

/// Rule that produced an assessment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RiskRule {
    ExposedDatabase,
    CleartextRemoteShell,
    ExposedRemoteDesktop,
    ExposedContainerApi,
    ExposedFileSharing,
    WeakHttpHeaders,
    UnencryptedHttp,
    ValidCertificateHttps,
    HttpsUnassessed,
    PartialHttpsHeaders,
    HardenedHttps,
    RemoteAdministration,
    CleartextProtocol,
    OpenPort,
}

pub struct RuleDetail {
    pub rule: RiskRule,
    pub level: RiskLevel,
    pub description: &'static str,
    pub remediation: &'static str,
}

pub static RULES: &[RuleDetail] = &[
    RuleDetail {
        rule: RiskRule::ExposedDatabase,
        level: RiskLevel::High,
        description: "Database service exposed to internet",
        remediation: "Restrict access with firewall rules, use VPN, enable authentication",
    },
    RuleDetail {
        rule: RiskRule::CleartextRemoteShell,
        level: RiskLevel::High,
        description: "Unencrypted remote shell service exposed",
        remediation: "Disable the service and use SSH with key-based authentication instead",
    },
    RuleDetail {
        rule: RiskRule::ExposedRemoteDesktop,
        level: RiskLevel::High,
        description: "Remote desktop service reachable from the network",
        remediation: "Place remote desktop behind a VPN or gateway and enforce network level authentication",
    },
    RuleDetail {
        rule: RiskRule::ExposedContainerApi,
        level: RiskLevel::High,
        description: "Unauthenticated container management API exposed",
        remediation: "Bind the Docker API to a local socket or enable TLS client authentication",
    },
    RuleDetail {
        rule: RiskRule::ExposedFileSharing,
        level: RiskLevel::High,
        description: "File sharing service exposed to the network",
        remediation: "Block SMB/NFS at the perimeter and restrict shares to trusted hosts",
    },
    RuleDetail {
        rule: RiskRule::WeakHttpHeaders,
        level: RiskLevel::High,
        description: "Web service is missing most security headers",
        remediation: "Add Strict-Transport-Security, Content-Security-Policy, X-Frame-Options, X-Content-Type-Options and Permissions-Policy headers",
    },
    RuleDetail {
        rule: RiskRule::UnencryptedHttp,
        level: RiskLevel::Medium,
        description: "Unencrypted HTTP service detected",
        remediation: "Implement HTTPS with TLS 1.2+ and redirect HTTP to HTTPS",
    },
    RuleDetail {
        rule: RiskRule::ValidCertificateHttps,
        level: RiskLevel::Low,
        description: "HTTPS service with valid certificate",
        remediation: "Ensure TLS 1.2+ only and strong cipher suites",
    },
    RuleDetail {
        rule: RiskRule::HttpsUnassessed,
        level: RiskLevel::Low,
        description: "HTTPS service detected; security headers not assessed",
        remediation: "Ensure TLS 1.2+ only and review security headers",
    },
    RuleDetail {
        rule: RiskRule::PartialHttpsHeaders,
        level: RiskLevel::Medium,
        description: "HTTPS service with incomplete security headers",
        remediation: "Add the missing security headers listed for this port",
    },
    RuleDetail {
        rule: RiskRule::HardenedHttps,
        level: RiskLevel::Low,
        description: "HTTPS service with most security headers present",
        remediation: "Keep TLS 1.2+ only and add the remaining missing headers",
    },
    RuleDetail {
        rule: RiskRule::RemoteAdministration,
        level: RiskLevel::Medium,
        description: "Remote administration service exposed",
        remediation: "Allow key-based authentication only and restrict source addresses",
    },
    RuleDetail {
        rule: RiskRule::CleartextProtocol,
        level: RiskLevel::Medium,
        description: "Service uses a cleartext protocol",
        remediation: "Switch to the TLS variant of the protocol or tunnel it over a VPN",
    },
    RuleDetail {
        rule: RiskRule::OpenPort,
        level: RiskLevel::Info,
        description: "Open port with no specific risk rule",
        remediation: "Close the port if the service is not required",
    },
];

/// Facts gathered about a port and its host before classification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RiskContext {
    pub security_score: Option<u8>,
    /// Another port on the same host serves HTTPS.
    pub tls_sibling: bool,
    /// The port presented a certificate inside its validity period.
    pub valid_certificate: bool,
}

/// Everything the classifier looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RiskInput<'a> {
    pub service: Option<&'a str>,
    pub port: u16,
    pub context: RiskContext,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RiskAssessment {
    pub rule: RiskRule,
    pub level: RiskLevel,
    pub description: &'static str,
    pub remediation: &'static str,
}

impl RiskAssessment {
    pub fn apply_to(&self, port: &mut Port) {
        port.risk_level = Some(self.level);
        port.risk_data = Some(RiskData {
            description: self.description.to_string(),
            remediation: self.remediation.to_string(),
        });
    }
}

pub fn rule_detail(rule: RiskRule) -> &'static RuleDetail {
    RULES
        .iter()
        .find(|d| d.rule == rule)
        .unwrap_or(&RULES[RULES.len() - 1])
}

fn matches(input: &RiskInput<'_>, services: &[&str], ports: &[u16]) -> bool {
    match input.service {
        Some(s) => services.contains(&s),
        None => ports.contains(&input.port),
    }
}

/// Pick the first rule that applies.
///
/// Exposure and transport decide the level first; the header score only
/// escalates a web service that has nothing else going for it. Plain HTTP on
/// a host that also serves HTTPS is the redirect entry point and stays MEDIUM
/// whatever its headers, and HTTPS with a valid certificate stays LOW unless
/// its headers are below [`WEAK_HEADER_THRESHOLD`].
pub fn select_rule(input: &RiskInput<'_>) -> RiskRule {
    if matches(input, DATABASES, DATABASE_PORTS) {
        return RiskRule::ExposedDatabase;
    }
    if matches(input, CLEARTEXT_SHELLS, CLEARTEXT_SHELL_PORTS) {
        return RiskRule::CleartextRemoteShell;
    }
    if matches(input, REMOTE_DESKTOPS, REMOTE_DESKTOP_PORTS) {
        return RiskRule::ExposedRemoteDesktop;
    }
    if matches(input, CONTAINER_APIS, CONTAINER_API_PORTS) {
        return RiskRule::ExposedContainerApi;
    }
    if matches(input, FILE_SHARING, FILE_SHARING_PORTS) {
        return RiskRule::ExposedFileSharing;
    }

    let service = input.service.unwrap_or_default();
    let ctx = &input.context;
    let weak_headers = ctx.security_score.is_some_and(|s| s < WEAK_HEADER_THRESHOLD);
    if PLAIN_WEB.contains(&service) {
        if weak_headers && !ctx.tls_sibling {
            return RiskRule::WeakHttpHeaders;
        }
        return RiskRule::UnencryptedHttp;
    }
    if TLS_WEB.contains(&service) {
        if weak_headers {
            return RiskRule::WeakHttpHeaders;
        }
        if ctx.valid_certificate {
            return RiskRule::ValidCertificateHttps;
        }
        return match ctx.security_score {
            None => RiskRule::HttpsUnassessed,
            Some(s) if s < STRONG_HEADER_THRESHOLD => RiskRule::PartialHttpsHeaders,
            Some(_) => RiskRule::HardenedHttps,
        };
    }

    if service == "ssh" {
        return RiskRule::RemoteAdministration;
    }
    if CLEARTEXT_PROTOCOLS.contains(&service) {
        return RiskRule::CleartextProtocol;
    }
    RiskRule::OpenPort
}

pub fn classify(input: &RiskInput<'_>) -> RiskAssessment {
    let detail = rule_detail(select_rule(input));
    RiskAssessment {
        rule: detail.rule,
        level: detail.level,
        description: detail.description,
        remediation: detail.remediation,
    }
}

/// Classify an open finding in place. Closed and filtered ports are left
/// without a risk level.
pub fn classify_port(port: &mut Port, context: RiskContext) {
    if port.state != PortState::Open {
        return;
    }
    let assessment = classify(&RiskInput {
        service: port.service.as_deref(),
        port: port.port,
        context,
    });
    assessment.apply_to(port);
}
