//! Proxy server binary.

use magpie::{serve, Application, HttpTransport, ProxyConfig, Ring, Rings};
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = match load_config() {
        Ok(config) => config,
        Err(message) => {
            eprintln!("{message}");
            return ExitCode::FAILURE;
        }
    };

    let rings = match load_rings(&config) {
        Ok(rings) => rings,
        Err(message) => {
            eprintln!("{message}");
            return ExitCode::FAILURE;
        }
    };

    let bind = format!("{}:{}", config.bind_ip, config.bind_port);
    let listener = match tokio::net::TcpListener::bind(&bind).await {
        Ok(listener) => listener,
        Err(err) => {
            eprintln!("cannot bind {bind}: {err}");
            return ExitCode::FAILURE;
        }
    };
    tracing::info!(bind = %bind, "proxy listening");

    let app = Arc::new(
        Application::builder(config, rings, Arc::new(HttpTransport)).build(),
    );

    tokio::select! {
        result = serve(app, listener) => {
            if let Err(err) = result {
                tracing::error!(error = %err, "accept loop failed");
                return ExitCode::FAILURE;
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
        }
    }
    ExitCode::SUCCESS
}

fn load_config() -> Result<ProxyConfig, String> {
    let mut args = std::env::args().skip(1);
    match (args.next().as_deref(), args.next()) {
        (Some("--config"), Some(path)) => ProxyConfig::from_file(Path::new(&path))
            .map_err(|err| format!("cannot load {path}: {err}")),
        (None, _) => Ok(ProxyConfig::default()),
        _ => Err("usage: magpie [--config <path.json>]".into()),
    }
}

fn load_rings(config: &ProxyConfig) -> Result<Rings, String> {
    let ring = |name: &str| {
        let path = config.swift_dir.join(name);
        Ring::load(&path, config.hash_path_suffix.clone())
            .map(Arc::new)
            .map_err(|err| format!("cannot load ring {}: {err}", path.display()))
    };
    Ok(Rings {
        account: ring("account.ring.json")?,
        container: ring("container.ring.json")?,
        object: ring("object.ring.json")?,
    })
}
