use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use netaudit_rs::config::{EngineArgs, EngineConfig};
use netaudit_rs::engine::ScanEngine;
use netaudit_rs::scanner::SharedProgress;
use netaudit_rs::types::{HeaderScanReport, ScanRequest, ScanResult};
use netaudit_rs::{logging, ports, server};

/// netaudit-rs: async TCP port scanner with service fingerprinting, security
/// header analysis and risk ratings, usable from the shell or over HTTP.
#[derive(Debug, Parser)]
#[command(name = "netaudit-rs", version, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the scan API (`/api/scan_ports`, `/api/scan/`).
    Serve {
        /// Address to listen on.
        #[arg(long, env = "NETAUDIT_BIND", default_value = "127.0.0.1:8000")]
        bind: String,

        #[command(flatten)]
        engine: EngineArgs,
    },
    /// Run one scan and print the findings.
    Scan {
        /// Hostname, IP, http(s) URL or IPv4 CIDR block.
        #[arg(long)]
        target: String,

        /// Port list (`22,80,8000-8100`) or a preset: common, all, web, database, remote.
        #[arg(long, default_value = "common")]
        ports: String,

        /// Restrict the range to common service ports.
        #[arg(long, default_value_t = false)]
        quick: bool,

        /// Run a security-header scan instead of a port scan.
        #[arg(long, default_value_t = false)]
        headers: bool,

        /// Write results as pretty JSON to this path.
        #[arg(long)]
        output: Option<PathBuf>,

        #[command(flatten)]
        engine: EngineArgs,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init()?;
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { bind, engine } => {
            let config = EngineConfig::from(engine);
            info!(bind = %bind, concurrency = config.effective_concurrency(), "starting server");
            tokio::select! {
                res = server::spawn_server(&bind, config) => res?,
                _ = tokio::signal::ctrl_c() => info!("shutting down"),
            }
        }
        Command::Scan {
            target,
            ports: range,
            quick,
            headers,
            output,
            engine,
        } => {
            let engine = ScanEngine::new(EngineConfig::from(engine));
            let progress = SharedProgress::new();
            let cancel = CancellationToken::new();
            let ctrl_c = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupted, returning partial results");
                    ctrl_c.cancel();
                }
            });

            if headers {
                let report = engine.scan_headers(&target, cancel, &progress).await?;
                print_header_table(&report);
                if let Some(path) = output.as_deref() {
                    write_json(path, &report)?;
                    println!("Wrote JSON results to {}", path.display());
                }
            } else {
                let req = ScanRequest {
                    target,
                    port_range: ports::resolve_preset(&range).to_string(),
                    quick_scan: quick,
                };
                let result = engine.scan(&req, cancel, &progress).await?;
                print_results_table(&result);
                if let Some(path) = output.as_deref() {
                    write_json(path, &result)?;
                    println!("Wrote JSON results to {}", path.display());
                }
            }
        }
    }
    Ok(())
}

fn print_results_table(result: &ScanResult) {
    for host in &result.hosts {
        let name = match (&host.hostname, &host.ip) {
            (Some(h), Some(ip)) if h != ip => format!("{} ({h})", ip),
            (_, Some(ip)) => ip.clone(),
            _ => host.host.clone(),
        };
        println!(
            "\n{name}: {} open port(s)",
            host.total_open_ports.unwrap_or_else(|| host.count_open_ports())
        );

        let rows: Vec<[String; 5]> = host
            .protocols
            .iter()
            .flat_map(|p| p.ports.iter())
            .map(|p| {
                let product = [p.product.as_deref(), p.version.as_deref()]
                    .into_iter()
                    .flatten()
                    .collect::<Vec<_>>()
                    .join(" ");
                [
                    format!("{}/{}", p.port, p.protocol),
                    p.state.to_string(),
                    p.service.clone().unwrap_or_default(),
                    product,
                    p.risk_level.map(|r| r.to_string()).unwrap_or_default(),
                ]
            })
            .collect();

        let header = ["port", "state", "service", "product", "risk"];
        let mut widths = header.map(str::len);
        for row in &rows {
            for (w, cell) in widths.iter_mut().zip(row) {
                *w = (*w).max(cell.len().min(40));
            }
        }
        println!(
            "{:<w0$}  {:<w1$}  {:<w2$}  {:<w3$}  {:<w4$}",
            header[0], header[1], header[2], header[3], header[4],
            w0 = widths[0], w1 = widths[1], w2 = widths[2], w3 = widths[3], w4 = widths[4]
        );
        println!(
            "{:-<w0$}  {:-<w1$}  {:-<w2$}  {:-<w3$}  {:-<w4$}",
            "", "", "", "", "",
            w0 = widths[0], w1 = widths[1], w2 = widths[2], w3 = widths[3], w4 = widths[4]
        );
        for row in &rows {
            let mut product = row[3].clone();
            if product.len() > 40 {
                product.truncate(40);
            }
            println!(
                "{:<w0$}  {:<w1$}  {:<w2$}  {:<w3$}  {:<w4$}",
                row[0], row[1], row[2], product, row[4],
                w0 = widths[0], w1 = widths[1], w2 = widths[2], w3 = widths[3], w4 = widths[4]
            );
        }
        for p in host.protocols.iter().flat_map(|p| p.ports.iter()) {
            if let Some(risk) = &p.risk_data {
                println!("  {}: {} -> {}", p.port, risk.description, risk.remediation);
            }
        }
    }
    if let Some(reason) = result.partial {
        println!("\nPartial result ({reason:?})");
    }
    if !result.errors.is_empty() {
        println!("\n{} probe error(s)", result.errors.len());
    }
}

fn print_header_table(report: &HeaderScanReport) {
    println!("\nSecurity headers for {}", report.target);
    if report.ports.is_empty() {
        println!("  no web service found");
    }
    for (port, found) in &report.ports {
        println!(
            "  port {port}: score {}/100, missing: {}",
            found.analysis.security_score,
            if found.analysis.missing_headers.is_empty() {
                "none".to_string()
            } else {
                found.analysis.missing_headers.join(", ")
            }
        );
    }
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    serde_json::to_writer_pretty(file, value)?;
    Ok(())
}
