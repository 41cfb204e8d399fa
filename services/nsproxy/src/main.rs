//! nsproxy
//!
//! Binds a TCP listener inside the configured network namespace and
//! forwards each connection to the next backend announced under an etcd
//! directory. Exits when either the accept loop or the etcd watch fails.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use nsproxy::{BackendRegistry, Config, Dispatcher, EtcdSource, FeedConsumer};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();

    // Prefer RUST_LOG, fall back to --log-level
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    config.validate()?;

    let namespace = config.namespace();
    info!(
        addr = %config.addr,
        path = %config.path,
        peers = ?config.peers,
        namespace = %namespace,
        policy = ?config.payload_policy(),
        "Starting nsproxy"
    );

    let client = nsproxy_etcd::Client::new(&config.peers).context("invalid etcd peers")?;
    let registry = Arc::new(BackendRegistry::new());
    let consumer = FeedConsumer::new(
        EtcdSource::new(client, config.path.clone()),
        Arc::clone(&registry),
        config.payload_policy(),
    );

    let watermark = consumer.bootstrap().await?;

    let listener = nsproxy_netns::listen(&namespace, config.addr)
        .await
        .with_context(|| format!("failed to listen on {} in {namespace}", config.addr))?;
    let dispatcher = Arc::new(Dispatcher::new(listener, Arc::clone(&registry)));

    let mut feed = tokio::spawn(async move { consumer.follow(watermark).await });
    let mut accept = tokio::spawn(Arc::clone(&dispatcher).run());

    tokio::select! {
        res = &mut accept => {
            let res = res.context("accept loop panicked")?;
            error!(result = ?res, "Accept loop stopped");
            res.context("accept loop failed")?;
            bail!("accept loop stopped")
        }
        res = &mut feed => {
            let res = res.context("backend watch panicked")?;
            error!(result = ?res, "Backend watch stopped");
            res.context("backend watch failed")?;
            bail!("backend watch stopped")
        }
    }
}
