//! `suite` — boots the fabric singletons, opens the HTTP surface, and hosts
//! the CLI described in spec §6: `start`, `stop`, `status`, `sync-now`, `diag`.
//! Exit codes: 0 success, 2 config error, 3 partial degradation, 4 fatal
//! startup failure.

mod boot;
mod http;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use suite_core::diagnostics::{run_diagnostics, DependencyCheck, ServiceProbeSpec};

const EXIT_OK: i32 = 0;
const EXIT_CONFIG_ERROR: i32 = 2;
const EXIT_DEGRADED: i32 = 3;
const EXIT_FATAL: i32 = 4;

#[derive(Parser)]
#[command(name = "suite", about = "Local-first personal-assistant suite fabric")]
struct Cli {
    #[arg(long, global = true, default_value = ".")]
    base_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Boot the fabric and open the HTTP surface; blocks until shutdown.
    Start,
    /// Ask a running suite to shut down gracefully.
    Stop,
    /// Print the running suite's aggregated health.
    Status,
    /// Trigger one cloud-bridge sync cycle.
    SyncNow,
    /// Run the diagnostics analyzer and print a report.
    Diag,
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let exit_code = match cli.command {
        Commands::Start => cmd_start(&cli.base_dir).await,
        Commands::Stop => cmd_stop(&cli.base_dir).await,
        Commands::Status => cmd_status(&cli.base_dir).await,
        Commands::SyncNow => cmd_sync_now(&cli.base_dir).await,
        Commands::Diag => cmd_diag(&cli.base_dir).await,
    };
    std::process::exit(exit_code);
}

async fn cmd_start(base_dir: &std::path::Path) -> i32 {
    let suite = match boot::boot(base_dir).await {
        Ok(s) => Arc::new(s),
        Err(e) => {
            eprintln!("fatal startup failure: {e}");
            return EXIT_FATAL;
        }
    };

    let effective = suite.config.effective();
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);
    let state = http::AppState { suite: Arc::clone(&suite), shutdown_tx };
    let app = http::router(state);

    let addr = format!("{}:{}", effective.bind_host, effective.http_port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "failed to bind http surface");
            return EXIT_FATAL;
        }
    };
    tracing::info!(addr = %addr, "http surface open");

    let server = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    wait_for_shutdown_signal(&mut shutdown_rx).await;
    server.abort();
    boot::shutdown(&suite).await;

    let any_unhealthy = suite
        .registry
        .snapshot()
        .iter()
        .any(|m| m.state == suite_core::ModuleState::Unhealthy);
    if any_unhealthy {
        EXIT_DEGRADED
    } else {
        EXIT_OK
    }
}

/// Waits for either an OS signal or an HTTP `/shutdown` call. A second OS
/// signal within 2s of the first escalates to immediate exit (spec §4.11).
async fn wait_for_shutdown_signal(shutdown_rx: &mut tokio::sync::mpsc::Receiver<()>) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).expect("install SIGTERM handler");
        sigterm.recv().await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
        _ = shutdown_rx.recv() => { return; }
    }

    tracing::info!("shutdown signal received; a second signal within 2s forces termination");
    let escalate = async {
        let ctrl_c2 = async { let _ = tokio::signal::ctrl_c().await; };
        #[cfg(unix)]
        let terminate2 = async {
            let mut s = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).expect("install SIGTERM handler");
            s.recv().await;
        };
        #[cfg(not(unix))]
        let terminate2 = std::future::pending::<()>();
        tokio::select! { _ = ctrl_c2 => {}, _ = terminate2 => {} }
    };
    if tokio::time::timeout(Duration::from_secs(2), escalate).await.is_ok() {
        tracing::warn!("second shutdown signal received; forcing termination");
        std::process::exit(EXIT_FATAL);
    }
}

fn load_client(base_dir: &std::path::Path) -> Option<(reqwest::Client, String, String)> {
    let mut secret_paths = std::collections::HashSet::new();
    secret_paths.insert("auth_token".to_string());
    let config = suite_core::ConfigStore::open(base_dir.join("config/suite_config.json"), base_dir.join("config/modules"), secret_paths).ok()?;
    let effective = config.effective();
    let token = config.get("auth_token").and_then(|v| v.as_str().map(|s| s.to_string()))?;
    let base_url = format!("http://{}:{}", effective.bind_host, effective.http_port);
    Some((reqwest::Client::new(), base_url, token))
}

async fn cmd_stop(base_dir: &std::path::Path) -> i32 {
    let Some((client, base_url, token)) = load_client(base_dir) else {
        eprintln!("could not load suite config");
        return EXIT_CONFIG_ERROR;
    };
    match client.post(format!("{base_url}/shutdown")).bearer_auth(token).send().await {
        Ok(resp) if resp.status().is_success() => EXIT_OK,
        Ok(resp) => {
            eprintln!("stop request returned {}", resp.status());
            EXIT_DEGRADED
        }
        Err(e) => {
            eprintln!("could not reach running suite: {e}");
            EXIT_FATAL
        }
    }
}

async fn cmd_status(base_dir: &std::path::Path) -> i32 {
    let Some((client, base_url, token)) = load_client(base_dir) else {
        eprintln!("could not load suite config");
        return EXIT_CONFIG_ERROR;
    };
    match client.get(format!("{base_url}/health/full")).bearer_auth(token).send().await {
        Ok(resp) => {
            let body: serde_json::Value = resp.json().await.unwrap_or_default();
            println!("{}", serde_json::to_string_pretty(&body).unwrap_or_default());
            let any_unhealthy = body
                .get("modules")
                .and_then(|m| m.as_array())
                .map(|modules| modules.iter().any(|m| m.get("state").and_then(|s| s.as_str()) == Some("unhealthy")))
                .unwrap_or(false);
            if any_unhealthy {
                EXIT_DEGRADED
            } else {
                EXIT_OK
            }
        }
        Err(e) => {
            eprintln!("could not reach running suite: {e}");
            EXIT_FATAL
        }
    }
}

async fn cmd_sync_now(base_dir: &std::path::Path) -> i32 {
    let Some((client, base_url, token)) = load_client(base_dir) else {
        eprintln!("could not load suite config");
        return EXIT_CONFIG_ERROR;
    };
    match client.post(format!("{base_url}/sync/now")).bearer_auth(token).send().await {
        Ok(resp) if resp.status().is_success() => EXIT_OK,
        Ok(resp) => {
            eprintln!("sync-now returned {}", resp.status());
            EXIT_DEGRADED
        }
        Err(e) => {
            eprintln!("could not reach running suite: {e}");
            EXIT_FATAL
        }
    }
}

async fn cmd_diag(base_dir: &std::path::Path) -> i32 {
    let mut secret_paths = std::collections::HashSet::new();
    secret_paths.insert("auth_token".to_string());
    let config = match suite_core::ConfigStore::open(base_dir.join("config/suite_config.json"), base_dir.join("config/modules"), secret_paths) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("config error: {e}");
            return EXIT_CONFIG_ERROR;
        }
    };
    let effective = config.effective();

    let vector_store_is_chroma = effective.vector_store == "chroma-like";
    let deps = vec![DependencyCheck { name: "chroma-like-client".to_string(), min_version: None, required_when: vector_store_is_chroma }];
    let probes = vec![ServiceProbeSpec { host: effective.bind_host.clone(), port: effective.http_port, service_tag: "suite".to_string() }];

    let report = run_diagnostics(&deps, &probes, &PathBuf::from("data/vectors")).await;
    println!("{}", serde_json::to_string_pretty(&report).unwrap_or_default());

    if !report.errors.is_empty() {
        EXIT_FATAL
    } else if !report.warnings.is_empty() || !report.missing_deps.is_empty() {
        EXIT_DEGRADED
    } else {
        EXIT_OK
    }
}
