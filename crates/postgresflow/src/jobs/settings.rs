//! `good_job_settings`: typed key/value store for pause flags, cron
//! enable flags, and small operator toggles (spec §3). Reads go through
//! an explicit in-process cache with explicit invalidation on write
//! (spec §9's "Operator-mutable settings" translation) rather than
//! hitting the database on every check.

use serde_json::Value;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Clone)]
pub struct SettingsRepo {
    pool: PgPool,
    cache: std::sync::Arc<RwLock<HashMap<String, Value>>>,
}

impl SettingsRepo {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            cache: std::sync::Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn get(&self, key: &str) -> anyhow::Result<Option<Value>> {
        if let Some(v) = self.cache.read().unwrap().get(key).cloned() {
            return Ok(Some(v));
        }

        let row: Option<Value> =
            sqlx::query_scalar("SELECT value FROM good_job_settings WHERE key = $1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        if let Some(v) = &row {
            self.cache.write().unwrap().insert(key.to_string(), v.clone());
        }
        Ok(row)
    }

    pub async fn set(&self, key: &str, value: Value) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO good_job_settings (key, value)
            VALUES ($1, $2)
            ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = now()
            "#,
        )
        .bind(key)
        .bind(&value)
        .execute(&self.pool)
        .await?;

        self.cache.write().unwrap().insert(key.to_string(), value);
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM good_job_settings WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        self.cache.write().unwrap().remove(key);
        Ok(())
    }

    /// Invalidates the whole cache, forcing the next `get` of every key to
    /// re-read from the database. Useful after an external process (e.g.
    /// an operator's `pgflowctl`) wrote settings this process hasn't seen.
    pub fn invalidate(&self) {
        self.cache.write().unwrap().clear();
    }

    /// `Setting` key for pausing a queue (spec §6.4 `enable_pauses`).
    pub fn queue_paused_key(queue_name: &str) -> String {
        format!("paused_queue:{queue_name}")
    }

    /// `Setting` key for pausing a cron entry (spec §4.8).
    pub fn cron_enabled_key(cron_key: &str) -> String {
        format!("cron_enabled:{cron_key}")
    }

    pub async fn is_queue_paused(&self, queue_name: &str) -> anyhow::Result<bool> {
        Ok(self
            .get(&Self::queue_paused_key(queue_name))
            .await?
            .and_then(|v| v.as_bool())
            .unwrap_or(false))
    }

    pub async fn is_cron_enabled(&self, cron_key: &str) -> anyhow::Result<bool> {
        Ok(self
            .get(&Self::cron_enabled_key(cron_key))
            .await?
            .and_then(|v| v.as_bool())
            .unwrap_or(true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_helpers_are_namespaced() {
        assert_eq!(SettingsRepo::queue_paused_key("mailers"), "paused_queue:mailers");
        assert_eq!(SettingsRepo::cron_enabled_key("tick"), "cron_enabled:tick");
    }
}
