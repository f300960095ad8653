//! reqtrack CLI: API server, status-change worker, operator commands.

use clap::{Parser, Subcommand};
use reqtrack::api::{self, AppState};
use reqtrack::config::{self, Config};
use reqtrack::db::Db;
use reqtrack::engine::{Engine, EngineConfig, Worker, WorkerConfig};
use reqtrack::model::RequestId;
use reqtrack::store::RequestStore;
use reqtrack::telemetry::{TelemetryConfig, TelemetryGuard, init_telemetry};
use secrecy::ExposeSecret;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "reqtrack", about = "Request status tracking")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the HTTP API
    Serve {
        /// Bind address (overrides LISTEN_ADDR)
        #[arg(long)]
        listen: Option<String>,
    },
    /// Run the status-change worker
    Worker,
    /// Request operations
    Request {
        #[command(subcommand)]
        action: RequestAction,
    },
}

#[derive(Subcommand)]
enum RequestAction {
    /// Create a request and print its tracking URL
    Create {
        /// Request title
        title: String,
    },
    /// Show a stored request, including its status history
    Show {
        /// Request ID (full UUID)
        id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    config::load_dotenv();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Command::Serve { listen } => cmd_serve(config, listen).await,
        Command::Worker => cmd_worker(config).await,
        Command::Request { action } => {
            let db = connect(&config).await?;
            match action {
                RequestAction::Create { title } => cmd_request_create(config, db, title).await,
                RequestAction::Show { id } => cmd_request_show(&db, id).await,
            }
        }
    }
}

fn telemetry(config: &Config, service_name: &str) -> anyhow::Result<TelemetryGuard> {
    Ok(init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: service_name.to_string(),
        default_filter: config.log_level.clone(),
    })?)
}

/// Connect, migrate, and make sure the queue exists.
async fn connect(config: &Config) -> anyhow::Result<Db> {
    let db = Db::connect(config.database_url.expose_secret()).await?;
    db.migrate().await?;
    db.create_queue(&config.queue_name).await?;
    Ok(db)
}

fn engine(config: Config, db: Db) -> Engine {
    let queue = Arc::new(db.queue(config.queue_name.clone()));
    Engine::new(
        Arc::new(db),
        queue,
        EngineConfig {
            admin_token: config.admin_token,
            public_base_url: config.public_base_url,
        },
    )
}

async fn cmd_serve(config: Config, listen: Option<String>) -> anyhow::Result<()> {
    let _guard = telemetry(&config, "reqtrack-api")?;
    let db = connect(&config).await?;

    let addr = listen.unwrap_or_else(|| config.listen_addr.clone());
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    let state = AppState {
        engine: Arc::new(engine(config, db)),
    };
    api::serve(listener, state, async {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("shutdown signal received");
    })
    .await?;
    Ok(())
}

async fn cmd_worker(config: Config) -> anyhow::Result<()> {
    let _guard = telemetry(&config, "reqtrack-worker")?;
    let db = connect(&config).await?;
    tracing::info!(queue = %config.queue_name, "connected");

    let worker = Worker::new(
        Arc::new(db.clone()),
        Arc::new(db.queue(config.queue_name.clone())),
        WorkerConfig {
            receive: config.receive,
            receive_error_backoff: Duration::from_secs(1),
        },
    );

    let w = worker.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("shutdown signal received, draining");
        w.shutdown();
    });

    worker.run().await;
    Ok(())
}

async fn cmd_request_create(config: Config, db: Db, title: String) -> anyhow::Result<()> {
    let created = engine(config, db).create_request(&title).await?;
    println!("Created:  {}", created.request.id);
    println!("Tracking: {}", created.tracking_url);
    Ok(())
}

async fn cmd_request_show(db: &Db, id: String) -> anyhow::Result<()> {
    let id: RequestId = uuid::Uuid::parse_str(&id).map(RequestId)?;
    let Some(request) = db.read_consistent(id).await? else {
        anyhow::bail!("no request with id {id}");
    };

    println!("ID:          {}", request.id);
    println!("Title:       {}", request.title);
    println!("Status:      {}", request.status);
    println!("Created:     {}", request.created_at);
    if let Some(at) = request.status_updated_at {
        println!("Updated:     {at}");
    }
    if let Some(at) = request.notified_at {
        println!("Notified:    {at}");
    }
    if let Some(event_id) = request.last_event_id {
        println!("Last Event:  {event_id}");
    }

    if request.status_history.is_empty() {
        println!("History:     -");
        return Ok(());
    }
    println!("---");
    println!(
        "{:<36}  {:<11}  {:<20}  HANDLED",
        "EVENT", "STATUS", "CHANGED"
    );
    for entry in &request.status_history {
        println!(
            "{:<36}  {:<11}  {:<20}  {}",
            entry.event_id.to_string(),
            entry.new_status.as_str(),
            entry.changed_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            entry.handled_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}
