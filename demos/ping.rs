//! Ping - connect to a live daemon, register, ping, close.
//!
//! This demo shows:
//! - Installing a `tracing` subscriber in the host application
//! - Loading the client identity and daemon CA from PEM files
//! - The connect / register / request / close lifecycle
//!
//! # Running
//!
//! ```text
//! DAEMON_URI=wss://localhost:55400 \
//! DAEMON_CERT=client.crt DAEMON_KEY=client.key DAEMON_CA=daemon_ca.crt \
//! RUST_LOG=daemon_client=debug \
//! cargo run --example ping -- wallet_ui
//! ```

use std::env;

use anyhow::Context;
use daemon_client::{DaemonClient, Endpoint, Identity};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

fn var(name: &str) -> anyhow::Result<String> {
    env::var(name).with_context(|| format!("{} is not set", name))
}

fn load_endpoint() -> anyhow::Result<Endpoint> {
    let chain = CertificateDer::pem_file_iter(var("DAEMON_CERT")?)?
        .collect::<Result<Vec<_>, _>>()
        .context("reading client certificate")?;
    let key = PrivateKeyDer::from_pem_file(var("DAEMON_KEY")?).context("reading client key")?;
    let roots = CertificateDer::pem_file_iter(var("DAEMON_CA")?)?
        .collect::<Result<Vec<_>, _>>()
        .context("reading daemon CA")?;

    let uri = env::var("DAEMON_URI").unwrap_or_else(|_| "wss://localhost:55400".to_string());
    Ok(Endpoint::new(&uri, Identity::new(chain, key)?)?.with_roots(roots))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let service = env::args().nth(1).unwrap_or_else(|| "client".to_string());
    let client = DaemonClient::builder()
        .endpoint(load_endpoint()?)
        .origin(service.clone())
        .build();

    // Ctrl-C releases every pending wait.
    let token = CancellationToken::new();
    let on_signal = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    client.connect(&token).await?;
    client.register(&service, &token).await?;

    let reply = client.ping(&token).await?;
    println!("ping ok: {}", reply.data.unwrap_or_default());

    client.close(&token).await?;
    Ok(())
}
