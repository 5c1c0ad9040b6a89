use anyhow::{Context as _, Result};
use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

use super::{CheckpointState, CheckpointStore};

const KEY_PREFIX: &str = "canvasflow:checkpoint:";

/// Checkpoints in Redis, one JSON string per execution tree.
#[derive(Clone)]
pub struct RedisCheckpointStore {
    conn: ConnectionManager,
}

impl RedisCheckpointStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).with_context(|| format!("Invalid redis url: {}", url))?;
        let conn = ConnectionManager::new(client)
            .await
            .context("Failed to connect to redis")?;
        Ok(Self { conn })
    }

    fn key(execute_id: &str) -> String {
        format!("{}{}", KEY_PREFIX, execute_id)
    }
}

#[async_trait]
impl CheckpointStore for RedisCheckpointStore {
    async fn save(&self, execute_id: &str, state: &CheckpointState) -> Result<()> {
        let data = serde_json::to_string(state)?;
        let mut conn = self.conn.clone();
        let _: () = conn.set(Self::key(execute_id), data).await?;
        Ok(())
    }

    async fn load(&self, execute_id: &str) -> Result<Option<CheckpointState>> {
        let mut conn = self.conn.clone();
        let data: Option<String> = conn.get(Self::key(execute_id)).await?;
        data.map(|d| {
            serde_json::from_str(&d).with_context(|| format!("Failed to parse checkpoint: {}", execute_id))
        })
        .transpose()
    }

    async fn delete(&self, execute_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(Self::key(execute_id)).await?;
        Ok(())
    }
}
