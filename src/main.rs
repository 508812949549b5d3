use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use dotenvy::dotenv;

use tracing::{info, warn};

use resolver::{AppConfig, EdgeApplicationServer, Logger, RedisDatabase};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let config = Arc::new(AppConfig::parse());

    // guards are kept alive to flush logs and keep sentry connected
    let _guards = Logger::init(config.cargo_env, config.sentry_dsn.clone());

    info!("logger and env prepped...");

    // redis only receives resolution events, the resolver runs fine without it
    let redis_db = match &config.redis_url {
        Some(url) => {
            info!("connecting to redis...");
            match RedisDatabase::connect(url).await {
                Ok(db) => Some(db),
                Err(e) => {
                    warn!("redis unavailable, events will only be logged: {:#}", e);
                    None
                }
            }
        }
        None => None,
    };

    info!("starting edge server...");

    EdgeApplicationServer::serve(config, redis_db)
        .await
        .context("edge server failed to start")?;

    Ok(())
}
