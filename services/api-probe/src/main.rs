//! api-probe
//!
//! Command-line host for the authenticated request pipeline:
//! 1. Loads configuration and opens the token store
//! 2. Seeds the session from `API_ACCESS_TOKEN` if set
//! 3. Runs one request through an executor (refresh and retry included)
//! 4. Prints the JSON result, or the normalized error
//!
//! Ctrl-C aborts the in-flight request.

mod config;

use anyhow::{Context, Result, bail};
use api_client::metrics::DURATION_BUCKETS;
use api_client::{AuthMode, ExecutorOptions, Pipeline, RequestDescriptor};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use serde_json::Value;
use session::{FileTokenStore, MemoryTokenStore, StorageKeys, TokenManager, TokenStore};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transport::{Method, ReqwestTransport};

use crate::config::Config;

const USAGE: &str = "usage: api-probe [--config PATH] [--method METHOD] \
                     [--auth default|public|optional] [--data JSON] [--metrics] PATH";

/// Parsed command line
#[derive(Debug, PartialEq)]
struct Args {
    config: Option<String>,
    method: Method,
    auth_mode: AuthMode,
    data: Option<Value>,
    print_metrics: bool,
    path: String,
}

impl Args {
    fn parse(args: impl IntoIterator<Item = String>) -> Result<Self> {
        let mut config = None;
        let mut method = Method::GET;
        let mut auth_mode = AuthMode::Default;
        let mut data = None;
        let mut print_metrics = false;
        let mut path = None;

        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            let mut value = |flag: &str| {
                args.next()
                    .with_context(|| format!("{flag} needs a value\n{USAGE}"))
            };
            match arg.as_str() {
                "--config" => config = Some(value("--config")?),
                "--method" => {
                    let raw = value("--method")?;
                    method = Method::from_bytes(raw.to_ascii_uppercase().as_bytes())
                        .with_context(|| format!("invalid method: {raw}"))?;
                }
                "--auth" => {
                    auth_mode = match value("--auth")?.as_str() {
                        "default" => AuthMode::Default,
                        "public" => AuthMode::Public,
                        "optional" => AuthMode::Optional,
                        other => bail!("invalid auth mode: {other}\n{USAGE}"),
                    };
                }
                "--data" => {
                    let raw = value("--data")?;
                    data = Some(serde_json::from_str(&raw).context("--data must be JSON")?);
                }
                "--metrics" => print_metrics = true,
                flag if flag.starts_with("--") => bail!("unknown flag: {flag}\n{USAGE}"),
                _ if path.is_some() => bail!("unexpected argument: {arg}\n{USAGE}"),
                _ => path = Some(arg),
            }
        }

        Ok(Self {
            config,
            method,
            auth_mode,
            data,
            print_metrics,
            path: path.with_context(|| format!("missing request path\n{USAGE}"))?,
        })
    }

    fn descriptor(&self) -> RequestDescriptor {
        let descriptor =
            RequestDescriptor::new(self.method.clone(), self.path.clone()).auth_mode(self.auth_mode);
        match &self.data {
            Some(data) => descriptor.json(data.clone()),
            None => descriptor,
        }
    }
}

/// Open the configured token store and seed it from the environment.
async fn build_session(config: &Config) -> Result<Arc<TokenManager>> {
    let store: Arc<dyn TokenStore> = match &config.session.token_file {
        Some(path) => Arc::new(
            FileTokenStore::open(path.clone())
                .await
                .with_context(|| format!("failed to open token file {}", path.display()))?,
        ),
        None => Arc::new(MemoryTokenStore::new()),
    };
    let tokens = Arc::new(TokenManager::with_keys(
        store,
        StorageKeys::namespaced(&config.session.namespace),
    ));

    if let Some(token) = &config.session.access_token {
        tokens.set_credential(token.expose_str(), config.session.expires_in_secs).await;
        info!(expires_in_secs = config.session.expires_in_secs, "session seeded from environment");
    }
    if tokens.is_expired() {
        info!("stored access token is expired; the first request will refresh it");
    }
    Ok(tokens)
}

fn build_pipeline(config: &Config, tokens: Arc<TokenManager>) -> Result<Pipeline> {
    let transport =
        ReqwestTransport::new(config.api.base_url.clone()).context("failed to build HTTP client")?;
    Ok(Pipeline::builder(Arc::new(transport), tokens)
        .refresh_path(config.api.refresh_path.clone())
        .timeout(config.timeout())
        .on_token_refresh_failed(|| warn!("session expired, log in again to continue"))
        .build())
}

fn executor_options(config: &Config) -> ExecutorOptions<Value> {
    let options = ExecutorOptions::default().on_error(|e| {
        error!(status = e.status, kind = ?e.kind, error = %e, "request failed");
        for line in e.validation_messages() {
            warn!(field_error = %line, "validation");
        }
    });
    match config.retry_policy() {
        Some(policy) => options.retry(policy),
        None => options,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
        .init();

    let prometheus = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("api_request_duration_seconds".to_string()),
            DURATION_BUCKETS,
        )
        .context("invalid histogram buckets")?
        .install_recorder()
        .context("failed to install metrics recorder")?;

    let args = Args::parse(std::env::args().skip(1))?;
    let config_path = Config::resolve_path(args.config.as_deref());
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        base_url = %config.api.base_url,
        refresh_path = %config.api.refresh_path,
        timeout_secs = config.api.timeout_secs,
        max_retries = config.retry.max_retries,
        "configuration loaded"
    );

    let tokens = build_session(&config).await?;
    let pipeline = build_pipeline(&config, tokens)?;
    let executor = pipeline.executor(executor_options(&config));

    let descriptor = args.descriptor();
    info!(request_id = %descriptor.request_id(), method = %args.method, path = %args.path, "sending request");

    let outcome = tokio::select! {
        result = executor.execute(descriptor) => Some(result),
        _ = shutdown_signal() => {
            executor.abort(Some("interrupted"));
            None
        }
    };

    if args.print_metrics {
        eprintln!("{}", prometheus.render());
    }

    match outcome {
        Some(Ok(Some(data))) => {
            println!("{}", serde_json::to_string_pretty(&data)?);
            Ok(())
        }
        Some(Ok(None)) | None => {
            warn!("request cancelled");
            Ok(())
        }
        Some(Err(e)) => {
            println!("{}", serde_json::to_string_pretty(&e)?);
            bail!("request failed with status {}: {}", e.status, e.message)
        }
    }
}

/// Wait for SIGTERM or SIGINT.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, aborting"),
        _ = terminate => info!("received SIGTERM, aborting"),
    }
}
