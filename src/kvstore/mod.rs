//! Shared key-value store plumbing.
//!
//! One process-wide connection manager serves all point reads; the
//! keyspace pub/sub listener in `keywatch` opens its own connection.

use redis::AsyncCommands;

#[derive(Clone)]
pub struct KvStore {
    conn: redis::aio::ConnectionManager,
}

impl KvStore {
    pub async fn connect(url: &str) -> Result<(Self, redis::Client), redis::RedisError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok((Self { conn }, client))
    }

    /// Read a string value; `None` when the key does not exist.
    pub async fn get_string(&self, key: &str) -> Result<Option<String>, redis::RedisError> {
        let mut conn = self.conn.clone();
        conn.get(key).await
    }
}
