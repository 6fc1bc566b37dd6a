use std::net::SocketAddr;
use std::time::Duration;

use ::time::{format_description::well_known, OffsetDateTime};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time;
use tracing::debug;

/// Ports where a TLS handshake is attempted before any plaintext probe.
pub const TLS_PORTS: &[u16] = &[443, 465, 636, 853, 993, 995, 8443, 9443];

/// Summary of the certificate presented during a handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertSummary {
    pub subject: String,
    pub issuer: String,
    pub not_after: String,
    pub currently_valid: bool,
}

impl CertSummary {
    /// Text for the `ssl-cert` script entry.
    pub fn render(&self) -> String {
        format!(
            "Subject: {}\nIssuer: {}\nNot valid after: {}\nValid now: {}",
            self.subject, self.issuer, self.not_after, self.currently_valid
        )
    }
}

/// Result of a successful TLS probe.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TlsProbe {
    pub cert: Option<CertSummary>,
    /// Bytes the service returned to an HTTP request sent inside the tunnel.
    pub response: Option<Vec<u8>>,
}

/// True when a plaintext reply looks like a TLS endpoint rejecting cleartext.
pub fn looks_like_tls_rejection(reply: &[u8]) -> bool {
    // TLS alert record: content type 21, major version 3.
    if reply.len() >= 2 && reply[0] == 0x15 && reply[1] == 0x03 {
        return true;
    }
    let text = String::from_utf8_lossy(reply).to_ascii_lowercase();
    text.contains("plain http request was sent to https port")
        || text.contains("speaking plain http to an ssl-enabled server")
}

/// Handshake with `addr` (certificate checks disabled), summarise the peer
/// certificate, then send an HTTP probe through the tunnel.
///
/// Returns `None` when the connect or handshake fails or times out.
pub async fn probe(
    addr: SocketAddr,
    server_name: &str,
    timeout: Duration,
    read_timeout: Duration,
    max_bytes: usize,
) -> Option<TlsProbe> {
    let connector = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(true)
        .danger_accept_invalid_hostnames(true)
        .build()
        .ok()?;
    let connector = tokio_native_tls::TlsConnector::from(connector);

    let tcp = time::timeout(timeout, TcpStream::connect(addr)).await.ok()?.ok()?;
    let mut stream = match time::timeout(timeout, connector.connect(server_name, tcp)).await {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => {
            debug!(%addr, error = %e, "tls handshake failed");
            return None;
        }
        Err(_) => {
            debug!(%addr, "tls handshake timed out");
            return None;
        }
    };

    let cert = stream
        .get_ref()
        .peer_certificate()
        .ok()
        .flatten()
        .and_then(|c| c.to_der().ok())
        .and_then(|der| summarize_der(&der));

    let response = http_exchange(&mut stream, server_name, read_timeout, max_bytes).await;
    Some(TlsProbe { cert, response })
}

/// Send `HEAD / HTTP/1.0` and read the reply, bounded in size and time.
pub async fn http_exchange<S>(
    stream: &mut S,
    host: &str,
    read_timeout: Duration,
    max_bytes: usize,
) -> Option<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = format!("HEAD / HTTP/1.0\r\nHost: {host}\r\nUser-Agent: netaudit-rs\r\n\r\n");
    time::timeout(read_timeout, stream.write_all(request.as_bytes()))
        .await
        .ok()?
        .ok()?;
    read_bounded(stream, read_timeout, max_bytes).await
}

/// Read until EOF, `max_bytes`, or `read_timeout` elapses. `None` if nothing
/// arrived.
pub async fn read_bounded<S>(stream: &mut S, read_timeout: Duration, max_bytes: usize) -> Option<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; max_bytes];
    let mut filled = 0;
    let deadline = time::Instant::now() + read_timeout;
    while filled < max_bytes {
        match time::timeout_at(deadline, stream.read(&mut buf[filled..])).await {
            Ok(Ok(0)) | Ok(Err(_)) | Err(_) => break,
            Ok(Ok(n)) => filled += n,
        }
    }
    if filled == 0 {
        return None;
    }
    buf.truncate(filled);
    Some(buf)
}

fn summarize_der(der: &[u8]) -> Option<CertSummary> {
    let (_, cert) = x509_parser::parse_x509_certificate(der).ok()?;
    let not_after = cert.validity().not_after.timestamp();
    let not_after = OffsetDateTime::from_unix_timestamp(not_after)
        .ok()
        .and_then(|t| t.format(&well_known::Rfc3339).ok())
        .unwrap_or_else(|| not_after.to_string());
    Some(CertSummary {
        subject: cert.subject().to_string(),
        issuer: cert.issuer().to_string(),
        not_after,
        currently_valid: cert.validity().is_valid(),
    })
}
