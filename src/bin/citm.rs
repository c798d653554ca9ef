#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc)]

//! CLI for the citm IMAP gateway

use citm::{AddrSpec, Gateway, GatewayConfig};
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "citm")]
#[command(about = "End-to-end-encryption IMAP gateway (crypt-in-the-middle)")]
struct Args {
    /// Listen spec(s), e.g. imap+starttls://127.0.0.1:1143
    /// (falls back to CITM_LISTEN)
    #[arg(long)]
    listen: Vec<String>,

    /// Upstream server spec, e.g. imaps://mail.example.com
    /// (falls back to CITM_REMOTE)
    #[arg(long)]
    remote: Option<String>,

    /// Keysync API base URL (falls back to CITM_API)
    #[arg(long)]
    api: Option<String>,

    /// TLS private key path
    #[arg(long)]
    key: Option<PathBuf>,

    /// TLS certificate path
    #[arg(long)]
    cert: Option<PathBuf>,

    /// Root directory for per-user key material
    #[arg(long)]
    maildir_root: Option<PathBuf>,

    /// Skip upstream certificate verification (self-signed upstreams)
    #[arg(long)]
    trust_upstream: bool,

    /// Print READY on stdout once all listeners are bound
    #[arg(long)]
    indicate_ready: bool,
}

fn build_config(args: &Args) -> anyhow::Result<GatewayConfig> {
    // A fully CLI-specified invocation works without any environment;
    // otherwise the environment provides the base configuration.
    let mut config = match (&args.remote, &args.api) {
        (Some(remote), Some(api)) => GatewayConfig {
            listens: vec![AddrSpec::parse("imap+starttls://127.0.0.1:1143")?],
            remote: AddrSpec::parse(remote)?,
            key: "citm.key".into(),
            cert: "citm.cert".into(),
            maildir_root: "./maildir".into(),
            api: url::Url::parse(api)?,
            trust_upstream: false,
            indicate_ready: false,
        },
        _ => GatewayConfig::from_env()?,
    };
    if !args.listen.is_empty() {
        config.listens = args
            .listen
            .iter()
            .map(|s| AddrSpec::parse(s))
            .collect::<citm::Result<_>>()?;
    }
    if let Some(remote) = &args.remote {
        config.remote = AddrSpec::parse(remote)?;
    }
    if let Some(api) = &args.api {
        config.api = url::Url::parse(api)?;
    }
    if let Some(key) = &args.key {
        config.key.clone_from(key);
    }
    if let Some(cert) = &args.cert {
        config.cert.clone_from(cert);
    }
    if let Some(root) = &args.maildir_root {
        config.maildir_root.clone_from(root);
    }
    config.trust_upstream |= args.trust_upstream;
    config.indicate_ready = args.indicate_ready;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = build_config(&args)?;

    let running = Gateway::new(config)?.start().await?;

    tokio::signal::ctrl_c().await?;
    running.quit().await;

    Ok(())
}
