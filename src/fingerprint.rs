//! Service and version identification from banners and probe replies.
//!
//! Signatures are tried in table order against the passive banner first, then
//! the active-probe reply; the first match wins. Without a match the
//! well-known port table supplies a service name at lower confidence.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::bytes::Regex;

use crate::scanner::Observation;
use crate::types::Port;

/// Confidence reported for a banner/response signature match.
pub const CONF_MATCHED: u8 = 10;
/// Confidence reported for a port-table guess.
pub const CONF_PORT_TABLE: u8 = 3;

const WEB_SERVICES: &[&str] = &["http", "https", "http-alt", "http-proxy", "https-alt"];

#[derive(Debug, Clone, Copy)]
enum Product {
    Literal(&'static str),
    Group(usize),
}

struct Signature {
    regex: Regex,
    service: &'static str,
    product: Option<Product>,
    version_group: Option<usize>,
    info_group: Option<usize>,
    /// `part:vendor:product` used to build a CPE 2.2 URI.
    cpe: Option<&'static str>,
}

impl Signature {
    fn new(pattern: &str, service: &'static str) -> Self {
        Self {
            regex: Regex::new(&format!("(?s-u){pattern}")).expect("static signature regex"),
            service,
            product: None,
            version_group: None,
            info_group: None,
            cpe: None,
        }
    }

    fn product(mut self, name: &'static str) -> Self {
        self.product = Some(Product::Literal(name));
        self
    }

    fn product_group(mut self, idx: usize) -> Self {
        self.product = Some(Product::Group(idx));
        self
    }

    fn version(mut self, idx: usize) -> Self {
        self.version_group = Some(idx);
        self
    }

    fn info(mut self, idx: usize) -> Self {
        self.info_group = Some(idx);
        self
    }

    fn cpe(mut self, base: &'static str) -> Self {
        self.cpe = Some(base);
        self
    }

    fn try_match(&self, data: &[u8]) -> Option<ServiceId> {
        let caps = self.regex.captures(data)?;
        let group = |idx: usize| {
            caps.get(idx)
                .map(|m| String::from_utf8_lossy(m.as_bytes()).trim().to_string())
                .filter(|s| !s.is_empty())
        };
        let product = match self.product {
            Some(Product::Literal(p)) => Some(p.to_string()),
            Some(Product::Group(idx)) => group(idx),
            None => None,
        };
        let version = self.version_group.and_then(group);
        let extrainfo = self.info_group.and_then(group);
        let cpe = self.cpe.map(|base| match &version {
            Some(v) => format!("cpe:/{base}:{v}"),
            None => format!("cpe:/{base}"),
        });
        Some(ServiceId {
            service: Some(self.service.to_string()),
            product,
            version,
            extrainfo,
            cpe,
            confidence: Some(CONF_MATCHED),
        })
    }
}

// An HTTP response whose headers contain `Server: <value>`.
const HTTP_SERVER: &str = r"^HTTP/1\.[01] \d{3}[^\n]*\n(?:[^\n]*\n)*?(?i:server):[ \t]*";

static SIGNATURES: LazyLock<Vec<Signature>> = LazyLock::new(|| {
    vec![
        // --- SSH ---
        Signature::new(r"^SSH-[\d.]+-OpenSSH[_-]([\w.]+)(?:[ \t]+([^\r\n]+))?", "ssh")
            .product("OpenSSH")
            .version(1)
            .info(2)
            .cpe("a:openbsd:openssh"),
        Signature::new(r"^SSH-[\d.]+-dropbear[_-]?([\w.]*)", "ssh")
            .product("Dropbear sshd")
            .version(1)
            .cpe("a:matt_johnston:dropbear_ssh_server"),
        Signature::new(r"^SSH-[\d.]+-([^\s]+)", "ssh").product_group(1),
        // --- HTTP, specific servers before the generic Server header ---
        Signature::new(
            &format!(r"{HTTP_SERVER}nginx(?:/([\d.]+)(?:[ \t]+(\([^)\r\n]*\)))?|[ \t]*\r?\n)"),
            "http",
        )
        .product("nginx")
        .version(1)
        .info(2)
        .cpe("a:igor_sysoev:nginx"),
        Signature::new(
            &format!(r"{HTTP_SERVER}Apache(?:/([\d.]+)(?:[ \t]+(\([^)\r\n]*\)))?|[ \t]*\r?\n)"),
            "http",
        )
        .product("Apache httpd")
        .version(1)
        .info(2)
        .cpe("a:apache:http_server"),
        Signature::new(&format!(r"{HTTP_SERVER}Microsoft-IIS/([\d.]+)"), "http")
            .product("Microsoft IIS httpd")
            .version(1)
            .cpe("a:microsoft:internet_information_services"),
        Signature::new(&format!(r"{HTTP_SERVER}lighttpd(?:/([\d.]+))?"), "http")
            .product("lighttpd")
            .version(1)
            .cpe("a:lighttpd:lighttpd"),
        Signature::new(&format!(r"{HTTP_SERVER}([^/\r\n]+?)(?:/([^\s\r\n]+))?[ \t]*\r?\n"), "http")
            .product_group(1)
            .version(2),
        Signature::new(r"^HTTP/1\.[01] \d{3}", "http"),
        // --- FTP ---
        Signature::new(r"^220 \(vsFTPd ([\d.]+)\)", "ftp")
            .product("vsftpd")
            .version(1)
            .cpe("a:beasts:vsftpd"),
        Signature::new(r"^220 ProFTPD ([\d.]+[a-z]?)", "ftp")
            .product("ProFTPD")
            .version(1)
            .cpe("a:proftpd:proftpd"),
        Signature::new(r"^220-FileZilla Server(?: version)? ([\d.]+)", "ftp")
            .product("FileZilla ftpd")
            .version(1)
            .cpe("a:filezilla-project:filezilla_server"),
        Signature::new(r"^220[ -][^\r\n]*Pure-FTPd", "ftp").product("Pure-FTPd"),
        // --- SMTP ---
        Signature::new(r"^220 \S+ ESMTP Postfix(?: \(([^)\r\n]+)\))?", "smtp")
            .product("Postfix smtpd")
            .info(1)
            .cpe("a:postfix:postfix"),
        Signature::new(r"^220 \S+ ESMTP Exim ([\d.]+)", "smtp")
            .product("Exim smtpd")
            .version(1)
            .cpe("a:exim:exim"),
        Signature::new(r"^220 [^\r\n]*Microsoft ESMTP MAIL Service", "smtp")
            .product("Microsoft ESMTP")
            .cpe("a:microsoft:exchange_server"),
        Signature::new(r"^220 \S+ E?SMTP", "smtp"),
        Signature::new(r"^220[ -][^\r\n]*(?i:ftp)", "ftp"),
        // --- Mail retrieval ---
        Signature::new(r"^\+OK [^\r\n]*(?i:dovecot)", "pop3")
            .product("Dovecot pop3d")
            .cpe("a:dovecot:dovecot"),
        Signature::new(r"^\+OK", "pop3"),
        Signature::new(r"^\* OK [^\r\n]*(?i:dovecot)", "imap")
            .product("Dovecot imapd")
            .cpe("a:dovecot:dovecot"),
        Signature::new(r"^\* OK", "imap"),
        // --- Databases and caches ---
        Signature::new(r"^.{4}\x0a[\d.]+-([\d.]+)-MariaDB", "mysql")
            .product("MariaDB")
            .version(1)
            .cpe("a:mariadb:mariadb"),
        Signature::new(r"^.{4}\x0a(\d+\.\d+\.\d+)[^\x00]*\x00", "mysql")
            .product("MySQL")
            .version(1)
            .cpe("a:mysql:mysql"),
        Signature::new(
            r"^.{4}\xff.{2}(Host '[^']*' is not allowed to connect to this (MySQL|MariaDB) server)",
            "mysql",
        )
        .product_group(2)
        .info(1),
        Signature::new(r"^-(?:ERR|NOAUTH|DENIED) [^\r\n]*", "redis").product("Redis key-value store"),
        // --- Remote access ---
        Signature::new(r"^RFB (\d{3}\.\d{3})", "vnc").info(1),
        Signature::new(r"^\xff[\xfb-\xfe]", "telnet"),
        // --- Misc ---
        Signature::new(r"^AMQP\x00", "amqp"),
        Signature::new(r"^RTSP/1\.0 \d{3}", "rtsp"),
    ]
});

static PORT_SERVICES: LazyLock<HashMap<u16, &'static str>> = LazyLock::new(|| {
    HashMap::from([
        (21, "ftp"),
        (22, "ssh"),
        (23, "telnet"),
        (25, "smtp"),
        (53, "domain"),
        (80, "http"),
        (81, "http"),
        (110, "pop3"),
        (111, "rpcbind"),
        (135, "msrpc"),
        (139, "netbios-ssn"),
        (143, "imap"),
        (161, "snmp"),
        (389, "ldap"),
        (443, "https"),
        (445, "microsoft-ds"),
        (465, "smtps"),
        (512, "exec"),
        (513, "login"),
        (514, "shell"),
        (587, "submission"),
        (631, "ipp"),
        (636, "ldaps"),
        (873, "rsync"),
        (993, "imaps"),
        (995, "pop3s"),
        (1433, "ms-sql-s"),
        (1521, "oracle"),
        (1723, "pptp"),
        (1883, "mqtt"),
        (2049, "nfs"),
        (2375, "docker"),
        (2376, "docker-tls"),
        (3128, "squid-http"),
        (3306, "mysql"),
        (3389, "ms-wbt-server"),
        (4369, "epmd"),
        (5432, "postgresql"),
        (5601, "kibana"),
        (5672, "amqp"),
        (5900, "vnc"),
        (5901, "vnc"),
        (5984, "couchdb"),
        (5985, "wsman"),
        (5986, "wsmans"),
        (6379, "redis"),
        (8000, "http-alt"),
        (8008, "http"),
        (8080, "http-proxy"),
        (8081, "http-alt"),
        (8443, "https-alt"),
        (8888, "http-alt"),
        (9092, "kafka"),
        (9200, "elasticsearch"),
        (9443, "https-alt"),
        (11211, "memcache"),
        (15672, "http"),
        (27017, "mongodb"),
        (27018, "mongodb"),
    ])
});

/// Identification result. Every field is optional: an unmatched port is not
/// an error.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceId {
    pub service: Option<String>,
    pub product: Option<String>,
    pub version: Option<String>,
    pub extrainfo: Option<String>,
    pub cpe: Option<String>,
    pub confidence: Option<u8>,
}

impl ServiceId {
    /// Whether the header analyzer should look at this port.
    pub fn is_web(&self) -> bool {
        self.service
            .as_deref()
            .is_some_and(|s| WEB_SERVICES.contains(&s))
    }

    /// Whether the service speaks HTTP over TLS.
    pub fn is_tls_web(&self) -> bool {
        matches!(self.service.as_deref(), Some("https" | "https-alt"))
    }

    /// Copy identification fields onto a finding.
    pub fn apply_to(&self, port: &mut Port) {
        port.service = self.service.clone();
        port.product = self.product.clone();
        port.version = self.version.clone();
        port.extrainfo = self.extrainfo.clone();
        port.cpe = self.cpe.clone();
        port.conf = self.confidence.map(|c| c.to_string());
    }
}

/// Well-known service name for a TCP port.
pub fn port_service(port: u16) -> Option<&'static str> {
    PORT_SERVICES.get(&port).copied()
}

/// Identify a service from raw probe data. Deterministic in its inputs.
pub fn identify(port: u16, banner: Option<&[u8]>, response: Option<&[u8]>, tls: bool) -> ServiceId {
    let matched = [banner, response]
        .into_iter()
        .flatten()
        .find_map(|data| SIGNATURES.iter().find_map(|sig| sig.try_match(data)));

    let mut id = matched.unwrap_or_else(|| ServiceId {
        service: port_service(port).map(str::to_string),
        confidence: port_service(port).map(|_| CONF_PORT_TABLE),
        ..ServiceId::default()
    });

    if tls {
        id.service = Some(match id.service.as_deref() {
            Some("http" | "http-proxy") => "https".to_string(),
            Some("http-alt") => "https-alt".to_string(),
            Some(other) => other.to_string(),
            None => "ssl".to_string(),
        });
    }
    id
}

/// Identify the service behind an observed port.
pub fn identify_observation(obs: &Observation) -> ServiceId {
    identify(obs.port, obs.banner.as_deref(), obs.response.as_deref(), obs.tls)
}
