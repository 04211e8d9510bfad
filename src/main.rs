use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tokengate::authz::KeyCache;
use tokengate::cli::{self, Commands, TokenCommands};
use tokengate::config::{self, Config, LogFormat};
use tokengate::jobs;
use tokengate::models::token::{ConfigPatch, Header, TokenConfig};
use tokengate::server::{self, AppState};
use tokengate::service::TokenService;
use tokengate::store;
use tokengate::usage::UsageRecorder;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = config::load()?;
    init_tracing(cfg.log_format)?;

    let args = cli::Cli::parse();

    let result = match args.command {
        Some(Commands::Serve {
            admin_bind,
            auth_bind,
        }) => {
            let mut cfg = cfg;
            if let Some(addr) = admin_bind {
                cfg.admin_bind = addr;
            }
            if let Some(addr) = auth_bind {
                cfg.auth_bind = addr;
            }
            run_server(cfg).await
        }
        Some(Commands::Token { command }) => handle_token_command(cfg, command).await,
        None => run_server(cfg).await,
    };

    if let Err(ref e) = result {
        eprintln!("Error: {:?}", e);
    }
    opentelemetry::global::shutdown_tracer_provider();
    result
}

fn init_tracing(format: LogFormat) -> anyhow::Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_sdk::{trace as sdktrace, Resource};

    // OTLP export is opt-in via OTEL_EXPORTER_OTLP_ENDPOINT
    let telemetry_layer = if std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok() {
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(opentelemetry_otlp::new_exporter().tonic())
            .with_trace_config(sdktrace::config().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "tokengate"),
            ])))
            .install_batch(opentelemetry_sdk::runtime::Tokio)
            .context("failed to install OpenTelemetry tracer")?;
        Some(tracing_opentelemetry::layer().with_tracer(tracer))
    } else {
        None
    };

    let (text, json) = match format {
        LogFormat::Text => (Some(tracing_subscriber::fmt::layer()), None),
        LogFormat::Json => (None, Some(tracing_subscriber::fmt::layer().json())),
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "tokengate=info,tower_http=info".into()),
        ))
        .with(text)
        .with(json)
        .with(telemetry_layer)
        .init();
    Ok(())
}

async fn run_server(cfg: Config) -> anyhow::Result<()> {
    tracing::info!("Opening token store...");
    let store = store::open(&cfg.database_url, cfg.db_max_conn).await?;

    let (usage, usage_rx) = UsageRecorder::channel(cfg.stats_buffer);
    let usage_worker = jobs::usage_sync::spawn(
        store.clone(),
        usage_rx,
        cfg.stats_interval,
        cfg.store_timeout,
    );

    let state = Arc::new(AppState::new(cfg.clone(), store, usage));

    if state.cache.is_enabled() {
        jobs::cleanup::spawn(state.cache.clone(), cfg.cache_ttl.max(Duration::from_secs(1)));
        tracing::info!(ttl_secs = cfg.cache_ttl.as_secs(), "key cache sweep started");
    }
    if let Some(user) = &cfg.debug_impersonate {
        tracing::warn!(%user, "DEBUG_IMPERSONATE is set; every admin request acts as this user");
    }

    let admin_listener = tokio::net::TcpListener::bind(cfg.admin_bind)
        .await
        .with_context(|| format!("failed to bind admin listener on {}", cfg.admin_bind))?;
    let auth_listener = tokio::net::TcpListener::bind(cfg.auth_bind)
        .await
        .with_context(|| format!("failed to bind forward-auth listener on {}", cfg.auth_bind))?;
    tracing::info!("tokengate admin API listening on {}", cfg.admin_bind);
    tracing::info!("tokengate forward-auth listening on {}", cfg.auth_bind);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
        }
        let _ = shutdown_tx.send(true);
    });

    let admin = axum::serve(admin_listener, server::admin_app(state.clone()))
        .with_graceful_shutdown(wait_for(shutdown_rx.clone()));
    let auth = axum::serve(auth_listener, server::auth_app(state.clone()))
        .with_graceful_shutdown(wait_for(shutdown_rx));
    drop(state);

    tokio::try_join!(async { admin.await }, async { auth.await })?;

    // the routers held the last recorders; the worker now flushes and exits
    if tokio::time::timeout(cfg.store_timeout * 2, usage_worker)
        .await
        .is_err()
    {
        tracing::warn!("usage worker did not finish its final flush in time");
    }
    Ok(())
}

async fn wait_for(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

async fn handle_token_command(cfg: Config, cmd: TokenCommands) -> anyhow::Result<()> {
    let store = store::open(&cfg.database_url, cfg.db_max_conn).await?;
    let tokens = TokenService::new(
        store,
        Arc::new(KeyCache::new(Duration::ZERO)),
        cfg.store_timeout,
        cfg.store_retries,
    );

    match cmd {
        TokenCommands::Create {
            user,
            label,
            host,
            path,
            headers,
        } => {
            let headers = headers
                .iter()
                .map(|raw| {
                    raw.split_once('=')
                        .map(|(name, value)| Header::new(name.trim(), value.trim()))
                        .with_context(|| format!("invalid header '{}', expected NAME=VALUE", raw))
                })
                .collect::<anyhow::Result<Vec<_>>>()?;
            let config = TokenConfig {
                label,
                host,
                path,
                headers,
            };
            let issued = tokens.create(&user, ConfigPatch::from(config)).await?;
            println!(
                "Token created:\n  ID:     {}\n  KeyID:  {}\n  Key:    {}\n\nStore the key now, it cannot be shown again.",
                issued.credential.id, issued.credential.key_id, issued.credential.key
            );
        }
        TokenCommands::List { user } => {
            let list = tokens.list(&user).await?;
            if list.is_empty() {
                println!("No tokens found.");
            } else {
                println!(
                    "{:<8} {:<18} {:<20} {:<24} {:<24} {:<10}",
                    "ID", "KEY ID", "LABEL", "HOST", "PATH", "REQUESTS"
                );
                for t in list {
                    println!(
                        "{:<8} {:<18} {:<20} {:<24} {:<24} {:<10}",
                        t.id, t.key_id.to_string(), t.label, t.host, t.path, t.requests
                    );
                }
            }
        }
        TokenCommands::Rotate { user, id } => {
            let issued = tokens.rotate(&user, id).await?;
            println!(
                "Token rotated:\n  ID:     {}\n  KeyID:  {}\n  Key:    {}",
                issued.credential.id, issued.credential.key_id, issued.credential.key
            );
        }
        TokenCommands::Delete { user, id } => {
            tokens.delete(&user, id).await?;
            println!("Token {} deleted.", id);
        }
    }
    Ok(())
}
