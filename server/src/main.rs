use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use mirror_node::auth::broker::CredentialBroker;
use mirror_node::config::{generate_config_template, Config};
use mirror_node::error::Error;
use mirror_node::fault::FaultGovernor;
use mirror_node::sync::authority::AuthorityClient;
use mirror_node::sync::engine::Reconciler;
use mirror_node::{routes, state, storage, sync};

/// In-flight requests get this long after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load config with layered precedence: defaults < TOML < env < CLI
    let (config, cli) = Config::load()?;

    // Handle --generate-config: print template and exit
    if cli.generate_config {
        print!("{}", generate_config_template());
        return Ok(());
    }

    // Initialize tracing/logging
    let filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("mirror_node=info,access=info"))
    };
    if config.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(filter()).init();
    } else {
        tracing_subscriber::fmt().pretty().with_env_filter(filter()).init();
    }

    tracing::info!("Mirror node v{} starting", env!("CARGO_PKG_VERSION"));

    if let Err(e) = config.validate() {
        tracing::error!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    let governor = Arc::new(FaultGovernor::new(config.fault_threshold));

    // Storage: open, init, check. Failure here aborts startup.
    let store = storage::open(&config.storage)?;
    let ready = match store.init().await {
        Ok(()) => store.check().await,
        Err(e) => Err(e),
    };
    match ready {
        Ok(true) => tracing::info!(backend = store.kind(), "Storage ready"),
        Ok(false) => {
            let err = Error::Storage(format!("{} storage is not usable", store.kind()));
            governor.record_failure(&err);
            return Err(err.into());
        }
        Err(e) => {
            governor.record_failure(&e);
            return Err(e.into());
        }
    }

    // Credential: the first token must be obtained before anything else talks
    // to the authority.
    let broker = CredentialBroker::new(
        &config.cluster.id,
        &config.cluster.secret,
        &config.cluster.server_url,
    )?;
    if let Err(e) = broker.acquire_token().await {
        governor.record_failure(&e);
        return Err(e.into());
    }
    governor.reset();

    let client = AuthorityClient::new(
        &config.cluster.server_url,
        broker.clone(),
        config.sync.read_timeout(),
    )?;
    let reconciler = Arc::new(Reconciler::new(
        client,
        store.clone(),
        governor.clone(),
        &config.sync,
    ));

    // Initial reconciliation runs in the background.
    let shutdown = CancellationToken::new();
    let sync_task = {
        let reconciler = reconciler.clone();
        let interval = config.sync.interval();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match reconciler.run().await {
                Ok(report) => tracing::info!(
                    succeeded = report.succeeded,
                    "Initial reconciliation complete"
                ),
                Err(e) => tracing::error!("Initial reconciliation failed: {}", e),
            }
            if let Some(interval) = interval {
                tracing::info!(interval_secs = interval.as_secs(), "Periodic reconciliation enabled");
                if let Err(e) = sync::schedule::spawn_periodic(reconciler, interval, shutdown).await {
                    tracing::error!("Periodic reconciliation task ended abnormally: {}", e);
                }
            }
        })
    };

    // Build router
    let app_state = state::AppState::new(
        store,
        &config.cluster.secret,
        !config.disable_access_log,
    );
    let app = routes::build_router(app_state);

    // Bind and serve
    let addr = format!("{}:{}", config.bind_address, config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    let signal = shutdown.clone();
    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        signal.cancel();
    });

    let mut server = tokio::spawn(async move { server.await });

    tokio::select! {
        _ = shutdown.cancelled() => {}
        exited = &mut server => {
            // Stopped without a signal: bind or accept failure.
            broker.shutdown();
            shutdown.cancel();
            return match exited {
                Ok(result) => result.map_err(Into::into),
                Err(e) => Err(e.into()),
            };
        }
    }
    tracing::info!("Shutting down, waiting up to {:?} for requests", SHUTDOWN_GRACE);

    broker.shutdown();
    sync_task.abort();

    match tokio::time::timeout(SHUTDOWN_GRACE, server).await {
        Ok(Ok(Ok(()))) => tracing::info!("Server stopped"),
        Ok(Ok(Err(e))) => tracing::error!("Server error: {}", e),
        Ok(Err(e)) => tracing::error!("Server task join error: {}", e),
        Err(_) => tracing::warn!("Grace period elapsed, closing remaining connections"),
    }

    Ok(())
}

/// Resolves on Ctrl-C or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
