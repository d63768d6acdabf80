//! Process bootstrap for the datafeed orchestrator.
//!
//! Wires configuration from flags/env vars, initializes logging and the
//! metrics exporter, starts the coordinator with its status endpoint, and
//! optionally runs the built-in archive persistence module in-process.
//! A broker connection failure exits non-zero; restart policy belongs to
//! the supervisor, not this process.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use datafeed_server::{
    open_store, ArchiveConfig, ArchiveModule, Broker, ClientConfig, HttpConfig, MemoryBroker,
    Orchestrator, OrchestratorConfig, StatusServer, StorageConfig,
};

#[derive(Parser, Debug)]
#[command(
    name = "datafeed-orchestrator",
    version,
    about = "Message-routing orchestrator over a work-queue broker"
)]
struct Cli {
    /// Coordinator display name; generated when absent.
    #[arg(long, env = "DATAFEED_NAME")]
    name: Option<String>,

    /// Broker URL. The in-process broker serves mem:// URLs.
    #[arg(long, env = "DATAFEED_BROKER_URL", default_value = "mem://local")]
    broker_url: String,

    /// Queue modules register on.
    #[arg(long, env = "DATAFEED_REGISTER_QUEUE", default_value = "o_register")]
    register_queue: String,

    /// Queue completed messages return on.
    #[arg(long, env = "DATAFEED_MESSAGES_QUEUE", default_value = "o_messages")]
    messages_queue: String,

    /// Embedded database path; omit for in-memory storage.
    #[arg(long, env = "DATAFEED_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Status endpoint bind host.
    #[arg(long, env = "DATAFEED_HTTP_HOST", default_value = "0.0.0.0")]
    http_host: String,

    /// Status endpoint port.
    #[arg(long, env = "DATAFEED_HTTP_PORT", default_value_t = 3000)]
    http_port: u16,

    /// Prometheus exporter port.
    #[arg(long, env = "DATAFEED_METRICS_PORT", default_value_t = 9464)]
    metrics_port: u16,

    /// Run the built-in archive persistence module in-process.
    #[arg(
        long,
        env = "DATAFEED_ENABLE_ARCHIVE",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    enable_archive: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let metrics_addr = SocketAddr::from(([0, 0, 0, 0], cli.metrics_port));
    if let Err(err) = PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
    {
        warn!(error = %err, "metrics exporter failed to start; continuing without it");
    }

    let name = cli.name.clone().unwrap_or_else(|| {
        let suffix: String = uuid::Uuid::new_v4().to_string().chars().take(8).collect();
        format!("orchestrator-{suffix}")
    });

    let store = open_store(&StorageConfig {
        db_path: cli.db_path.clone(),
        messages_collection: "messages".to_string(),
    })?;
    let broker = MemoryBroker::new();

    let config = OrchestratorConfig {
        name: name.clone(),
        broker_url: cli.broker_url.clone(),
        register_queue: cli.register_queue.clone(),
        messages_queue: cli.messages_queue.clone(),
        ..OrchestratorConfig::default()
    };
    let orchestrator = Arc::new(Orchestrator::new(
        config,
        Arc::new(broker.clone()),
        store.clone(),
    ));
    orchestrator.init().await?;

    let mut status = StatusServer::new(
        HttpConfig {
            host: cli.http_host.clone(),
            port: cli.http_port,
            ..HttpConfig::default()
        },
        orchestrator.lifecycle(),
        orchestrator.registry(),
        name.clone(),
    );
    let status_port = status.start().await?;
    info!(port = status_port, "status endpoint listening");

    let mut shutdown_rx = orchestrator.lifecycle().shutdown_receiver();
    tokio::spawn(async move {
        let shutdown = async move {
            let _ = shutdown_rx.changed().await;
        };
        if let Err(err) = status.serve(shutdown).await {
            warn!(error = %err, "status server failed");
        }
    });

    // The archive module registers concurrently: its registration is
    // answered once listen() opens the registration endpoint, and it is
    // the persistence module the startup gate is waiting for.
    let archive_task = if cli.enable_archive {
        let ctx = broker.connect(&cli.broker_url).await?;
        let archive_store = store.clone();
        let client_config = ClientConfig {
            register_queue: cli.register_queue.clone(),
            messages_queue: cli.messages_queue.clone(),
        };
        Some(tokio::spawn(async move {
            ArchiveModule::spawn(ctx, archive_store, &client_config, ArchiveConfig::default())
                .await
        }))
    } else {
        None
    };

    if let Err(err) = orchestrator.listen().await {
        error!(
            error = %err,
            "error starting orchestrator, exiting process; make sure restart behaviors are in place"
        );
        return Err(err.into());
    }
    info!(
        %name,
        queue = %cli.register_queue,
        "orchestrator ready to receive new modules"
    );

    let archive = match archive_task {
        Some(task) => match task.await? {
            Ok(archive) => {
                info!(
                    queue = %archive.descriptor().work_queue_name,
                    "archive module waiting for new messages"
                );
                Some(archive)
            }
            Err(err) => {
                warn!(error = %err, "archive module failed to start");
                None
            }
        },
        None => None,
    };

    tokio::signal::ctrl_c().await?;
    warn!("gracefully shutting down from SIGINT");
    if let Some(archive) = &archive {
        archive.stop();
    }
    orchestrator.shutdown().await;
    warn!("shutdown complete");
    Ok(())
}
