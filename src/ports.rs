use std::collections::BTreeSet;

use crate::error::ScanError;

/// Ports probed by a quick scan: common service ports, ascending.
///
/// A quick scan intersects the requested range with this list. When the
/// intersection is empty the lowest `QUICK_SCAN_PORTS.len()` requested ports
/// are used instead, so a quick scan never probes more than this many ports.
pub const QUICK_SCAN_PORTS: &[u16] = &[
    7, 21, 22, 23, 25, 53, 79, 80, 81, 88, 106, 110, 111, 113, 119, 135, 139, 143, 161, 179, 199,
    389, 427, 443, 445, 465, 513, 514, 515, 548, 554, 587, 631, 636, 873, 990, 993, 995, 1025, 1080,
    1433, 1521, 1723, 1883, 1900, 2049, 2121, 2375, 2376, 3000, 3128, 3268, 3306, 3389, 4369, 4443,
    5000, 5060, 5432, 5601, 5672, 5800, 5900, 5901, 5984, 5985, 5986, 6000, 6379, 6443, 7001, 7070,
    8000, 8008, 8009, 8080, 8081, 8088, 8181, 8443, 8500, 8888, 9000, 9090, 9092, 9100, 9200, 9300,
    9443, 9999, 10000, 11211, 15672, 27017, 27018, 32768, 49152, 50000, 50070, 61616,
];

/// Ports tried by the headers scan when the target names no port.
pub const WEB_PORTS: &[u16] = &[80, 443, 8080, 8443];

/// Named port ranges accepted wherever a range is expected.
pub const PORT_PRESETS: &[(&str, &str)] = &[
    ("common", "21-23,25,53,80,110,143,443,445,3306,3389,5432,8080"),
    ("all", "1-65535"),
    ("web", "80,443,8080,8443,3000,5000"),
    ("database", "1433,3306,5432,5984,6379,9200,27017"),
    ("remote", "22,23,3389,5900,5901"),
];

/// Range text for a preset name, or the input unchanged.
pub fn resolve_preset(range: &str) -> &str {
    let name = range.trim();
    PORT_PRESETS
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, r)| *r)
        .unwrap_or(range)
}

/// Deduplicated, ascending set of TCP ports in 1..=65535.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSpec(Vec<u16>);

impl PortSpec {
    /// Parse `segment (',' segment)*` where `segment = N | N-M`.
    ///
    /// Whitespace around segments is ignored. Empty segments, values outside
    /// 1..=65535 and inverted ranges are rejected.
    pub fn parse(s: &str) -> Result<Self, ScanError> {
        if s.trim().is_empty() {
            return Err(ScanError::InvalidPortRange("empty port range".into()));
        }
        let mut set = BTreeSet::new();
        for raw in s.split(',') {
            let segment = raw.trim();
            if segment.is_empty() {
                return Err(ScanError::InvalidPortRange(format!("empty segment in '{s}'")));
            }
            if let Some((a, b)) = segment.split_once('-') {
                let start = parse_port_str(a.trim())?;
                let end = parse_port_str(b.trim())?;
                if start > end {
                    return Err(ScanError::InvalidPortRange(format!(
                        "inverted range {start}-{end}"
                    )));
                }
                set.extend(start..=end);
            } else {
                set.insert(parse_port_str(segment)?);
            }
        }
        Ok(Self(set.into_iter().collect()))
    }

    /// Build from arbitrary ports, dropping zero and duplicates.
    pub fn from_ports(ports: impl IntoIterator<Item = u16>) -> Self {
        let set: BTreeSet<u16> = ports.into_iter().filter(|&p| p != 0).collect();
        Self(set.into_iter().collect())
    }

    /// Restrict to the quick-scan subset.
    pub fn quick(self) -> Self {
        let common: Vec<u16> = self
            .0
            .iter()
            .copied()
            .filter(|p| QUICK_SCAN_PORTS.binary_search(p).is_ok())
            .collect();
        if common.is_empty() {
            Self(self.0.into_iter().take(QUICK_SCAN_PORTS.len()).collect())
        } else {
            Self(common)
        }
    }

    pub fn as_slice(&self) -> &[u16] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, port: u16) -> bool {
        self.0.binary_search(&port).is_ok()
    }
}

/// Expand a request's `port_range`, applying the quick-scan policy when set.
pub fn expand(port_range: &str, quick_scan: bool) -> Result<PortSpec, ScanError> {
    let spec = PortSpec::parse(port_range)?;
    Ok(if quick_scan { spec.quick() } else { spec })
}

fn parse_port_str(s: &str) -> Result<u16, ScanError> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ScanError::InvalidPortRange(format!("not a port number: '{s}'")));
    }
    let val: u32 = s
        .parse::<u32>()
        .map_err(|_| ScanError::InvalidPortRange(format!("port out of range: {s}")))?;
    if val == 0 || val > 65535 {
        return Err(ScanError::InvalidPortRange(format!("port out of range: {val}")));
    }
    Ok(val as u16)
}
