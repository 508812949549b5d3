use anyhow::Context;
use redis::Client;
use redis::aio::MultiplexedConnection;
use std::time::Instant;
use tracing::info;

/// list resolution events are pushed onto for whoever wants to read them
pub const EVENTS_KEY: &str = "resolver:events";

/// newest entries kept in the events list
pub const EVENTS_CAP: isize = 1000;

#[derive(Debug, Clone)]
pub struct RedisDatabase {
    pub connection: MultiplexedConnection,
}

// only an outbound sink, the resolver never reads anything back out of it
impl RedisDatabase {
    pub async fn connect(connection_string: &str) -> anyhow::Result<Self> {
        let client = Client::open(connection_string).context("Failed to create Redis client")?;

        let connection = client
            .get_multiplexed_tokio_connection()
            .await
            .context("Failed to connect to Redis database")?;

        info!("Redis connection established");

        Ok(Self { connection })
    }

    /// ping round trip in milliseconds
    pub async fn health_check(&self) -> anyhow::Result<f64> {
        let start = Instant::now();

        let mut conn = self.connection.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .context("Redis health check failed")?;

        let elapsed = start.elapsed();
        Ok(elapsed.as_secs_f64() * 1000.0)
    }

    /// push one serialized event and trim the list back to its cap in a single round trip
    pub async fn push_event(&self, payload: &str) -> anyhow::Result<()> {
        let mut conn = self.connection.clone();

        let _: () = redis::pipe()
            .lpush(EVENTS_KEY, payload)
            .ignore()
            .ltrim(EVENTS_KEY, 0, EVENTS_CAP - 1)
            .ignore()
            .query_async(&mut conn)
            .await
            .context("Failed to push resolution event")?;

        Ok(())
    }
}
