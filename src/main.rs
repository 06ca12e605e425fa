//! Covenant - consent exchange gateway

use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use covenant::{
    config::Args,
    consent::{
        engine::EngineSettings, ConsentEngine, ConsentSigner, HttpDelivery, LogMailer,
    },
    db::MongoClient,
    repo::{ConsentRepository, MemoryRepository, MongoRepository},
    server,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    // Parse command line arguments
    let args = Args::parse();

    // Initialize tracing/logging
    let log_level = args.log_level.clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("covenant={},info", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Validate configuration
    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    // Print startup banner
    info!("======================================");
    info!("  Covenant - Consent Exchange Gateway");
    info!("======================================");
    info!("Node ID: {}", args.node_id);
    info!("Listen: {}", args.listen);
    info!(
        "Mode: {}",
        if args.dev_mode { "DEVELOPMENT" } else { "PRODUCTION" }
    );
    info!("Public URL: {}", args.public_url);
    info!("MongoDB: {}", args.mongodb_uri);
    info!("======================================");

    // Connect to MongoDB (optional in dev mode)
    let mongo = match MongoClient::new(&args.mongodb_uri, &args.mongodb_db).await {
        Ok(client) => {
            info!("MongoDB connected successfully");
            Some(client)
        }
        Err(e) => {
            if args.dev_mode {
                warn!(
                    "MongoDB connection failed (dev mode, using in-memory repository): {}",
                    e
                );
                None
            } else {
                error!("MongoDB connection failed: {}", e);
                std::process::exit(1);
            }
        }
    };

    let (repo, persistent): (Arc<dyn ConsentRepository>, bool) = match mongo {
        Some(client) => match MongoRepository::new(&client).await {
            Ok(r) => (Arc::new(r), true),
            Err(e) => {
                error!("Repository initialization failed: {}", e);
                std::process::exit(1);
            }
        },
        None => (Arc::new(MemoryRepository::new()), false),
    };

    // Consent envelope signer: fixed seed in production, ephemeral in dev
    let signer = match args.signing_seed() {
        Ok(Some(seed)) => ConsentSigner::from_seed(seed),
        Ok(None) => {
            warn!("No signing key configured, using an ephemeral key (dev mode)");
            ConsentSigner::ephemeral()
        }
        Err(e) => {
            error!("Signing key error: {}", e);
            std::process::exit(1);
        }
    };

    let delivery = match HttpDelivery::new(Duration::from_millis(args.partner_timeout_ms)) {
        Ok(d) => Arc::new(d),
        Err(e) => {
            error!("Delivery client error: {}", e);
            std::process::exit(1);
        }
    };
    let mailer = Arc::new(LogMailer);

    let engine = Arc::new(ConsentEngine::new(
        Arc::clone(&repo),
        delivery,
        mailer,
        signer,
        EngineSettings {
            public_url: args.public_url.clone(),
            email_token_expiry_hours: args.email_token_expiry_hours,
            confirmation_expiry_hours: args.confirmation_expiry_hours,
        },
    ));

    let state = Arc::new(server::AppState::new(args, engine, repo, persistent));

    // Run the server
    if let Err(e) = server::run(state).await {
        error!("Server error: {:?}", e);
        std::process::exit(1);
    }

    Ok(())
}
