use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::models::{ModelCacheEntry, ProviderId, Theme};

const KEY_THEME: &str = "theme";
const KEY_LAST_PROVIDER: &str = "last_provider";
const KEY_LAST_MODEL: &str = "last_model";
const KEY_SELECTION_BUTTON: &str = "selection_button_enabled";
const KEY_TELEMETRY: &str = "telemetry_enabled";
const MODEL_CACHE_PREFIX: &str = "model_cache.";

fn api_key_key(provider: ProviderId) -> String {
    format!("api_key.{}", provider)
}

fn model_cache_key(provider: ProviderId) -> String {
    format!("{}{}", MODEL_CACHE_PREFIX, provider)
}

/**
 * \brief 设置存储接口：凭据、界面偏好、最近使用项与模型列表缓存。
 * \details 核心只依赖本接口，不接触具体后端；键彼此独立解释，
 *          写入遵循 last-writer-wins，无跨键事务。
 */
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn api_key(&self, provider: ProviderId) -> Result<Option<String>>;
    /** \brief 写入凭据；None 或空串表示删除。 */
    async fn set_api_key(&self, provider: ProviderId, api_key: Option<&str>) -> Result<()>;

    async fn theme(&self) -> Result<Theme>;
    async fn set_theme(&self, theme: Theme) -> Result<()>;

    /** \brief 最近一次使用的服务商与模型，两者都存在才返回。 */
    async fn last_used(&self) -> Result<Option<(ProviderId, String)>>;
    async fn set_last_used(&self, provider: ProviderId, model: &str) -> Result<()>;

    /** \brief 划词触发按钮开关，默认开启。 */
    async fn selection_button_enabled(&self) -> Result<bool>;
    async fn set_selection_button_enabled(&self, enabled: bool) -> Result<()>;

    /** \brief 遥测开关，默认关闭。 */
    async fn telemetry_enabled(&self) -> Result<bool>;
    async fn set_telemetry_enabled(&self, enabled: bool) -> Result<()>;

    async fn model_cache(&self, provider: ProviderId) -> Result<Option<ModelCacheEntry>>;
    async fn set_model_cache(&self, provider: ProviderId, entry: &ModelCacheEntry) -> Result<()>;
    /** \brief 无条件清空所有服务商的模型缓存。 */
    async fn clear_model_cache(&self) -> Result<()>;
}

/**
 * \brief SQLite 后端：单张 settings 键值表，值为 JSON 文本。
 */
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /**
     * \brief 打开（或创建）指定路径的设置库。
     */
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /** \brief 仅存活于进程内的库，测试用。 */
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        retry_on_locked(|| {
            conn.execute_batch(
                r#"
            PRAGMA journal_mode=WAL;
            CREATE TABLE IF NOT EXISTS settings (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            "#,
            )
        })?;
        Ok(SqliteStore {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("settings store lock poisoned"))
    }

    fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let conn = self.lock()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT value FROM settings WHERE key=?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    fn set_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let text = serde_json::to_string(value)?;
        let conn = self.lock()?;
        retry_on_locked(|| {
            conn.execute(
                "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value=excluded.value",
                params![key, text],
            )
        })?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let conn = self.lock()?;
        retry_on_locked(|| conn.execute("DELETE FROM settings WHERE key=?1", params![key]))?;
        Ok(())
    }

    fn remove_prefix(&self, prefix: &str) -> Result<()> {
        let pattern = format!("{}%", prefix);
        let conn = self.lock()?;
        retry_on_locked(|| {
            conn.execute("DELETE FROM settings WHERE key LIKE ?1", params![pattern])
        })?;
        Ok(())
    }
}

#[async_trait]
impl SettingsStore for SqliteStore {
    async fn api_key(&self, provider: ProviderId) -> Result<Option<String>> {
        self.get_json(&api_key_key(provider))
    }

    async fn set_api_key(&self, provider: ProviderId, api_key: Option<&str>) -> Result<()> {
        match api_key.filter(|key| !key.is_empty()) {
            Some(key) => self.set_json(&api_key_key(provider), &key),
            None => self.remove(&api_key_key(provider)),
        }
    }

    async fn theme(&self) -> Result<Theme> {
        Ok(self.get_json(KEY_THEME)?.unwrap_or_default())
    }

    async fn set_theme(&self, theme: Theme) -> Result<()> {
        self.set_json(KEY_THEME, &theme)
    }

    async fn last_used(&self) -> Result<Option<(ProviderId, String)>> {
        let provider: Option<ProviderId> = self.get_json(KEY_LAST_PROVIDER)?;
        let model: Option<String> = self.get_json(KEY_LAST_MODEL)?;
        Ok(provider.zip(model))
    }

    async fn set_last_used(&self, provider: ProviderId, model: &str) -> Result<()> {
        self.set_json(KEY_LAST_PROVIDER, &provider)?;
        self.set_json(KEY_LAST_MODEL, &model)
    }

    async fn selection_button_enabled(&self) -> Result<bool> {
        Ok(self.get_json(KEY_SELECTION_BUTTON)?.unwrap_or(true))
    }

    async fn set_selection_button_enabled(&self, enabled: bool) -> Result<()> {
        self.set_json(KEY_SELECTION_BUTTON, &enabled)
    }

    async fn telemetry_enabled(&self) -> Result<bool> {
        Ok(self.get_json(KEY_TELEMETRY)?.unwrap_or(false))
    }

    async fn set_telemetry_enabled(&self, enabled: bool) -> Result<()> {
        self.set_json(KEY_TELEMETRY, &enabled)
    }

    async fn model_cache(&self, provider: ProviderId) -> Result<Option<ModelCacheEntry>> {
        self.get_json(&model_cache_key(provider))
    }

    async fn set_model_cache(&self, provider: ProviderId, entry: &ModelCacheEntry) -> Result<()> {
        self.set_json(&model_cache_key(provider), entry)
    }

    async fn clear_model_cache(&self) -> Result<()> {
        self.remove_prefix(MODEL_CACHE_PREFIX)
    }
}

/**
 * \brief 针对 SQLite 锁冲突的重试助手：退避后重试，最多尝试 6 次。
 */
fn retry_on_locked<T, F>(mut action: F) -> Result<T>
where
    F: FnMut() -> rusqlite::Result<T>,
{
    const MAX_RETRIES: usize = 5;
    for attempt in 0..=MAX_RETRIES {
        match action() {
            Ok(value) => return Ok(value),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if matches!(err.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
                    && attempt < MAX_RETRIES =>
            {
                let backoff = Duration::from_millis(200 * (attempt as u64 + 1));
                thread::sleep(backoff);
                continue;
            }
            Err(e) => return Err(e.into()),
        }
    }
    unreachable!("retry_on_locked should have returned within the loop");
}

/**
 * \brief 内存后端：测试与一次性运行使用，键空间与 SQLite 后端一致。
 */
#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, serde_json::Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let values = self
            .values
            .lock()
            .map_err(|_| anyhow!("memory store lock poisoned"))?;
        match values.get(key) {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }

    fn set_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let encoded = serde_json::to_value(value)?;
        self.values
            .lock()
            .map_err(|_| anyhow!("memory store lock poisoned"))?
            .insert(key.to_string(), encoded);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.values
            .lock()
            .map_err(|_| anyhow!("memory store lock poisoned"))?
            .remove(key);
        Ok(())
    }

    fn remove_prefix(&self, prefix: &str) -> Result<()> {
        self.values
            .lock()
            .map_err(|_| anyhow!("memory store lock poisoned"))?
            .retain(|key, _| !key.starts_with(prefix));
        Ok(())
    }
}

#[async_trait]
impl SettingsStore for MemoryStore {
    async fn api_key(&self, provider: ProviderId) -> Result<Option<String>> {
        self.get_json(&api_key_key(provider))
    }

    async fn set_api_key(&self, provider: ProviderId, api_key: Option<&str>) -> Result<()> {
        match api_key.filter(|key| !key.is_empty()) {
            Some(key) => self.set_json(&api_key_key(provider), &key),
            None => self.remove(&api_key_key(provider)),
        }
    }

    async fn theme(&self) -> Result<Theme> {
        Ok(self.get_json(KEY_THEME)?.unwrap_or_default())
    }

    async fn set_theme(&self, theme: Theme) -> Result<()> {
        self.set_json(KEY_THEME, &theme)
    }

    async fn last_used(&self) -> Result<Option<(ProviderId, String)>> {
        let provider: Option<ProviderId> = self.get_json(KEY_LAST_PROVIDER)?;
        let model: Option<String> = self.get_json(KEY_LAST_MODEL)?;
        Ok(provider.zip(model))
    }

    async fn set_last_used(&self, provider: ProviderId, model: &str) -> Result<()> {
        self.set_json(KEY_LAST_PROVIDER, &provider)?;
        self.set_json(KEY_LAST_MODEL, &model)
    }

    async fn selection_button_enabled(&self) -> Result<bool> {
        Ok(self.get_json(KEY_SELECTION_BUTTON)?.unwrap_or(true))
    }

    async fn set_selection_button_enabled(&self, enabled: bool) -> Result<()> {
        self.set_json(KEY_SELECTION_BUTTON, &enabled)
    }

    async fn telemetry_enabled(&self) -> Result<bool> {
        Ok(self.get_json(KEY_TELEMETRY)?.unwrap_or(false))
    }

    async fn set_telemetry_enabled(&self, enabled: bool) -> Result<()> {
        self.set_json(KEY_TELEMETRY, &enabled)
    }

    async fn model_cache(&self, provider: ProviderId) -> Result<Option<ModelCacheEntry>> {
        self.get_json(&model_cache_key(provider))
    }

    async fn set_model_cache(&self, provider: ProviderId, entry: &ModelCacheEntry) -> Result<()> {
        self.set_json(&model_cache_key(provider), entry)
    }

    async fn clear_model_cache(&self) -> Result<()> {
        self.remove_prefix(MODEL_CACHE_PREFIX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ModelEntry;

    #[tokio::test]
    async fn test_sqlite_store_round_trips_every_setting() {
        let store = SqliteStore::open_in_memory().expect("open store");

        assert_eq!(store.theme().await.expect("default theme"), Theme::Light);
        assert!(store
            .selection_button_enabled()
            .await
            .expect("default toggle"));
        assert!(!store.telemetry_enabled().await.expect("default telemetry"));
        assert!(store.last_used().await.expect("empty last used").is_none());

        store
            .set_api_key(ProviderId::OpenAi, Some("sk-1"))
            .await
            .expect("set key");
        store.set_theme(Theme::Dark).await.expect("set theme");
        store
            .set_last_used(ProviderId::OpenAi, "gpt-4o")
            .await
            .expect("set last used");
        store
            .set_selection_button_enabled(false)
            .await
            .expect("set toggle");
        store
            .set_telemetry_enabled(true)
            .await
            .expect("set telemetry");

        assert_eq!(
            store.api_key(ProviderId::OpenAi).await.expect("get key"),
            Some("sk-1".to_string())
        );
        assert!(store
            .api_key(ProviderId::Anthropic)
            .await
            .expect("unset key")
            .is_none());
        assert_eq!(store.theme().await.expect("get theme"), Theme::Dark);
        assert_eq!(
            store.last_used().await.expect("get last used"),
            Some((ProviderId::OpenAi, "gpt-4o".to_string()))
        );
        assert!(!store.selection_button_enabled().await.expect("toggle"));
        assert!(store.telemetry_enabled().await.expect("telemetry"));
    }

    #[tokio::test]
    async fn test_empty_api_key_removes_credential() {
        let store = SqliteStore::open_in_memory().expect("open store");
        store
            .set_api_key(ProviderId::Xai, Some("sk-x"))
            .await
            .expect("set key");
        store
            .set_api_key(ProviderId::Xai, Some(""))
            .await
            .expect("clear key");
        assert!(store
            .api_key(ProviderId::Xai)
            .await
            .expect("get key")
            .is_none());
    }

    #[tokio::test]
    async fn test_model_cache_entries_are_per_provider_and_clearable() {
        let store = SqliteStore::open_in_memory().expect("open store");
        let entry = ModelCacheEntry {
            models: vec![ModelEntry::new("gpt-4o", "gpt-4o")],
            fetched_at: 1_700_000_000,
        };
        store
            .set_model_cache(ProviderId::OpenAi, &entry)
            .await
            .expect("set cache");

        let cached = store
            .model_cache(ProviderId::OpenAi)
            .await
            .expect("get cache")
            .expect("entry present");
        assert_eq!(cached.fetched_at, 1_700_000_000);
        assert_eq!(cached.models, entry.models);
        assert!(store
            .model_cache(ProviderId::Google)
            .await
            .expect("other provider")
            .is_none());

        store.clear_model_cache().await.expect("clear cache");
        assert!(store
            .model_cache(ProviderId::OpenAi)
            .await
            .expect("after clear")
            .is_none());
    }

    #[tokio::test]
    async fn test_memory_store_matches_sqlite_semantics() {
        let store = MemoryStore::new();
        assert_eq!(store.theme().await.expect("default"), Theme::Light);

        store
            .set_api_key(ProviderId::DeepSeek, Some("sk-d"))
            .await
            .expect("set key");
        assert_eq!(
            store.api_key(ProviderId::DeepSeek).await.expect("get key"),
            Some("sk-d".to_string())
        );
        store
            .set_api_key(ProviderId::DeepSeek, None)
            .await
            .expect("remove key");
        assert!(store
            .api_key(ProviderId::DeepSeek)
            .await
            .expect("get key")
            .is_none());

        let entry = ModelCacheEntry {
            models: vec![ModelEntry::new("deepseek-chat", "DeepSeek Chat")],
            fetched_at: 42,
        };
        store
            .set_model_cache(ProviderId::DeepSeek, &entry)
            .await
            .expect("set cache");
        store.clear_model_cache().await.expect("clear");
        assert!(store
            .model_cache(ProviderId::DeepSeek)
            .await
            .expect("after clear")
            .is_none());
    }
}
