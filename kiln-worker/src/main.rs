use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use hf_hub::api::tokio::Api;
use kiln_core::{load_model, DeviceMap, LoadOptions, ModelState};
use kiln_worker::{router, BucketStore, HttpFetcher, ImageStore, InlineStore, Worker};
use tokio::net::TcpListener;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

// Define command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "Kiln Stable Diffusion job worker")]
struct Args {
    /// Use CPU instead of GPU
    #[arg(long)]
    cpu: bool,

    /// Hub repository of the model to serve
    #[arg(long, default_value = "nitrosocke/Ghibli-Diffusion")]
    model: String,

    /// Load half-precision weights
    #[arg(long)]
    use_f16: bool,

    /// Host address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to bind the server to
    #[arg(long, default_value_t = 8000)]
    port: u16,

    /// Upload results here instead of returning them inline
    #[arg(long, env = "BUCKET_ENDPOINT_URL")]
    bucket_endpoint_url: Option<String>,

    /// Bearer token for bucket uploads
    #[arg(long, env = "BUCKET_ACCESS_TOKEN", hide_env_values = true)]
    bucket_access_token: Option<String>,

    /// Log at debug level
    #[arg(short, long)]
    verbose: bool,

    /// Disable colored log output
    #[arg(long)]
    no_color: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(if args.verbose { Level::DEBUG } else { Level::INFO })
        .with_ansi(!args.no_color)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let backend = load_model(
        &args.model,
        Api::new()?,
        DeviceMap::new(args.cpu, 0),
        LoadOptions {
            use_f16: args.use_f16,
        },
    )
    .await?;

    let client = reqwest::Client::new();
    let store: Arc<dyn ImageStore> = match &args.bucket_endpoint_url {
        Some(endpoint) => {
            info!(endpoint = %endpoint, "uploading results to bucket");
            Arc::new(BucketStore::new(
                client.clone(),
                endpoint,
                args.bucket_access_token.clone(),
            ))
        }
        None => Arc::new(InlineStore),
    };
    let worker = Worker::new(
        ModelState::new(backend),
        Arc::new(HttpFetcher::new(client)),
        store,
    );

    // --- Start the server ---
    let bind_address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind {bind_address}"))?;
    info!("Started worker on {}", listener.local_addr()?);
    axum::serve(listener, router(Arc::new(worker)).into_make_service()).await?;

    Ok(())
}
