use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use certflow_core::{
    create_audit_system, load_config, validate_config, AuditEvent, AuditStore,
    CertificateOrchestrator, Config, LifecycleStore, PkiEngine, RecordStore, ServiceNowClient,
    SqliteAuditStore, SqliteRecordStore, TicketingSystem, VaultPkiClient,
};
use certflow_server::api::create_router;
use certflow_server::state::AppState;

/// Application version
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Buffer size for audit event channel
const AUDIT_BUFFER_SIZE: usize = 1000;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Fatal error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path = std::env::var("CERTFLOW_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config.toml"));

    info!("Loading configuration from {:?}", config_path);
    let config = load_config(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;

    validate_config(&config).context("Configuration validation failed")?;

    info!("Configuration loaded successfully");
    info!("Database path: {:?}", config.database.path);

    // Compute config hash for audit
    let config_json = serde_json::to_string(&config).unwrap_or_default();
    let config_hash = format!("{:x}", Sha256::digest(config_json.as_bytes()));
    let config_hash_short = &config_hash[..16];

    let audit_store: Arc<dyn AuditStore> = Arc::new(
        SqliteAuditStore::new(&config.database.path).context("Failed to create audit store")?,
    );
    info!("Audit store initialized");

    let record_store: Arc<dyn RecordStore> = Arc::new(
        SqliteRecordStore::new(&config.database.path)
            .context("Failed to create certificate request store")?,
    );
    info!("Certificate request store initialized");

    let (audit_handle, audit_writer) =
        create_audit_system(Arc::clone(&audit_store), AUDIT_BUFFER_SIZE);
    let writer_handle = tokio::spawn(audit_writer.run());

    audit_handle
        .emit(AuditEvent::ServiceStarted {
            version: VERSION.to_string(),
            config_hash: config_hash_short.to_string(),
        })
        .await;
    info!("Emitted ServiceStarted audit event");

    let pki = create_pki_engine(&config)?;
    let ticketing = create_ticketing_system(&config)?;

    let store = Arc::new(LifecycleStore::new(record_store).with_audit(audit_handle.clone()));
    let orchestrator = Arc::new(CertificateOrchestrator::new(
        config.orchestrator.clone(),
        config.validation.clone(),
        store,
        pki,
        ticketing,
        Some(audit_handle.clone()),
    ));

    if config.orchestrator.enabled {
        orchestrator.start().await;
        info!(
            sweep_interval_secs = config.orchestrator.sweep_interval_secs,
            max_concurrent_requests = config.orchestrator.max_concurrent_requests,
            "Certificate orchestrator started"
        );
    } else {
        info!("Orchestrator disabled in config; requests are stored but not processed");
    }

    let state = Arc::new(AppState::new(
        config.clone(),
        audit_handle.clone(),
        audit_store,
        Arc::clone(&orchestrator),
    ));

    let app = create_router(state);

    let addr = SocketAddr::new(config.server.host, config.server.port);
    info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    if orchestrator.is_running() {
        info!("Stopping orchestrator...");
        orchestrator.stop().await;
        info!("Orchestrator stopped");
    }

    info!("Server shutting down...");
    audit_handle
        .emit(AuditEvent::ServiceStopped {
            reason: "graceful_shutdown".to_string(),
        })
        .await;

    // Every AuditHandle clone must be gone before the writer's channel closes.
    // The orchestrator and its store hold clones; the router state was dropped
    // when the server returned.
    drop(orchestrator);
    drop(audit_handle);

    let _ = writer_handle.await;
    info!("Audit writer stopped");

    Ok(())
}

fn create_pki_engine(config: &Config) -> Result<Arc<dyn PkiEngine>> {
    let vault_config = config
        .pki
        .vault
        .clone()
        .context("pki.vault section is required")?;
    info!(
        address = %vault_config.address,
        mount = %vault_config.mount,
        role = %vault_config.role,
        "Initializing Vault PKI client"
    );
    let client = VaultPkiClient::new(vault_config).context("Failed to create Vault PKI client")?;
    Ok(Arc::new(client))
}

fn create_ticketing_system(config: &Config) -> Result<Arc<dyn TicketingSystem>> {
    let snow_config = config
        .ticketing
        .servicenow
        .clone()
        .context("ticketing.servicenow section is required")?;
    info!(
        instance = %snow_config.instance_url,
        table = %snow_config.table,
        "Initializing ServiceNow client"
    );
    let client =
        ServiceNowClient::new(snow_config).context("Failed to create ServiceNow client")?;
    Ok(Arc::new(client))
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
