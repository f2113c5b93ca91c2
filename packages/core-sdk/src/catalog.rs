use anyhow::{anyhow, bail, Result};
use serde_json::Value;
use time::OffsetDateTime;

use crate::models::{ModelCacheEntry, ModelEntry, ProviderId};
use crate::registry::provider_info;
use crate::store::SettingsStore;
use crate::transport::{HttpRequest, HttpTransport};

/** \brief 模型列表缓存有效期：24 小时。 */
pub const MODEL_CACHE_TTL_SECONDS: i64 = 24 * 60 * 60;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const OPENAI_CHAT_PREFIXES: [&str; 5] = ["gpt-", "o1", "o3", "o4", "chatgpt-"];

/**
 * \brief 取指定服务商的模型目录。
 * \details 缓存未过期直接返回；否则在配置了凭据时实时抓取并回写缓存，
 *          未配置凭据返回 None（不是错误）。抓取失败不回退到过期缓存。
 */
pub async fn get_models(
    store: &dyn SettingsStore,
    transport: &dyn HttpTransport,
    provider: ProviderId,
) -> Result<Option<Vec<ModelEntry>>> {
    let now = OffsetDateTime::now_utc().unix_timestamp();
    if let Some(entry) = store.model_cache(provider).await? {
        if now - entry.fetched_at < MODEL_CACHE_TTL_SECONDS {
            return Ok(Some(entry.models));
        }
    }

    let Some(api_key) = store
        .api_key(provider)
        .await?
        .filter(|key| !key.is_empty())
    else {
        return Ok(None);
    };

    let models = fetch_provider_models(transport, provider, &api_key).await?;
    store
        .set_model_cache(
            provider,
            &ModelCacheEntry {
                models: models.clone(),
                fetched_at: now,
            },
        )
        .await?;
    Ok(Some(models))
}

/**
 * \brief 清空全部模型缓存；随后的任何 `get_models` 都会重新抓取。
 */
pub async fn clear_model_cache(store: &dyn SettingsStore) -> Result<()> {
    store.clear_model_cache().await
}

async fn fetch_provider_models(
    transport: &dyn HttpTransport,
    provider: ProviderId,
    api_key: &str,
) -> Result<Vec<ModelEntry>> {
    let info = provider_info(provider);
    let response = transport.execute(model_list_request(provider, api_key)).await?;
    if !response.is_success() {
        bail!("{} models API error: {}", info.name, response.status);
    }
    let body: Value = serde_json::from_str(&response.body)
        .map_err(|_| anyhow!("unexpected {} models payload", info.name))?;
    shape_models(provider, &body)
}

fn model_list_request(provider: ProviderId, api_key: &str) -> HttpRequest {
    let endpoint = provider_info(provider).models_endpoint;
    match provider {
        ProviderId::Anthropic => HttpRequest::get(endpoint)
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION),
        ProviderId::Google => HttpRequest::get(format!("{}?key={}", endpoint, api_key)),
        _ => HttpRequest::get(endpoint).header("Authorization", format!("Bearer {}", api_key)),
    }
}

fn shape_models(provider: ProviderId, body: &Value) -> Result<Vec<ModelEntry>> {
    match provider {
        ProviderId::OpenAi => shape_openai(body),
        ProviderId::Anthropic => shape_anthropic(body),
        ProviderId::Google => shape_google(body),
        ProviderId::Xai => shape_by_created_desc(body, ProviderId::Xai),
        ProviderId::DeepSeek => shape_deepseek(body),
    }
}

fn data_array<'a>(body: &'a Value, provider: ProviderId, field: &str) -> Result<&'a Vec<Value>> {
    body.get(field)
        .and_then(|v| v.as_array())
        .ok_or_else(|| anyhow!("unexpected {} models payload", provider_info(provider).name))
}

/** \brief OpenAI：仅保留聊天模型前缀，按创建时间倒序。 */
fn shape_openai(body: &Value) -> Result<Vec<ModelEntry>> {
    let mut models: Vec<(i64, ModelEntry)> = data_array(body, ProviderId::OpenAi, "data")?
        .iter()
        .filter_map(|item| {
            let id = item.get("id").and_then(|v| v.as_str())?;
            if !OPENAI_CHAT_PREFIXES.iter().any(|p| id.starts_with(p)) {
                return None;
            }
            let created = item.get("created").and_then(|v| v.as_i64()).unwrap_or(0);
            Some((created, ModelEntry::new(id, id)))
        })
        .collect();
    models.sort_by(|a, b| b.0.cmp(&a.0));
    Ok(models.into_iter().map(|(_, entry)| entry).collect())
}

/** \brief Anthropic：按 created_at 倒序，展示名缺失时退回 id。 */
fn shape_anthropic(body: &Value) -> Result<Vec<ModelEntry>> {
    let mut models: Vec<(String, ModelEntry)> = data_array(body, ProviderId::Anthropic, "data")?
        .iter()
        .filter_map(|item| {
            let id = item.get("id").and_then(|v| v.as_str())?;
            let name = item
                .get("display_name")
                .and_then(|v| v.as_str())
                .unwrap_or(id);
            let created_at = item
                .get("created_at")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            Some((created_at, ModelEntry::new(id, name)))
        })
        .collect();
    // RFC3339 时间戳的字典序即时间序。
    models.sort_by(|a, b| b.0.cmp(&a.0));
    Ok(models.into_iter().map(|(_, entry)| entry).collect())
}

/** \brief Google：仅保留 gemini 系列，剥掉 models/ 前缀，按 id 升序。 */
fn shape_google(body: &Value) -> Result<Vec<ModelEntry>> {
    let mut models: Vec<ModelEntry> = data_array(body, ProviderId::Google, "models")?
        .iter()
        .filter_map(|item| {
            let name = item.get("name").and_then(|v| v.as_str())?;
            if !name.contains("gemini") {
                return None;
            }
            let id = name.strip_prefix("models/").unwrap_or(name);
            let display = item
                .get("displayName")
                .and_then(|v| v.as_str())
                .unwrap_or(id);
            Some(ModelEntry::new(id, display))
        })
        .collect();
    models.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(models)
}

/** \brief xAI：按创建时间倒序。 */
fn shape_by_created_desc(body: &Value, provider: ProviderId) -> Result<Vec<ModelEntry>> {
    let mut models: Vec<(i64, ModelEntry)> = data_array(body, provider, "data")?
        .iter()
        .filter_map(|item| {
            let id = item.get("id").and_then(|v| v.as_str())?;
            let created = item.get("created").and_then(|v| v.as_i64()).unwrap_or(0);
            Some((created, ModelEntry::new(id, id)))
        })
        .collect();
    models.sort_by(|a, b| b.0.cmp(&a.0));
    Ok(models.into_iter().map(|(_, entry)| entry).collect())
}

/** \brief DeepSeek：按 id 升序。 */
fn shape_deepseek(body: &Value) -> Result<Vec<ModelEntry>> {
    let mut models: Vec<ModelEntry> = data_array(body, ProviderId::DeepSeek, "data")?
        .iter()
        .filter_map(|item| {
            let id = item.get("id").and_then(|v| v.as_str())?;
            Some(ModelEntry::new(id, id))
        })
        .collect();
    models.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(models)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::transport::MockTransport;

    async fn store_with_key(provider: ProviderId) -> MemoryStore {
        let store = MemoryStore::new();
        store
            .set_api_key(provider, Some("sk-test"))
            .await
            .expect("store api key");
        store
    }

    const OPENAI_MODELS: &str = r#"{"data":[
        {"id":"gpt-3.5-turbo","created":1},
        {"id":"whisper-1","created":99},
        {"id":"gpt-4o","created":5},
        {"id":"o4-mini","created":3}
    ]}"#;

    #[tokio::test]
    async fn test_get_models_within_ttl_hits_network_exactly_once() {
        let store = store_with_key(ProviderId::OpenAi).await;
        let transport = MockTransport::new();
        transport.queue_response(200, OPENAI_MODELS);

        let first = get_models(&store, &transport, ProviderId::OpenAi)
            .await
            .expect("first fetch")
            .expect("models present");
        let second = get_models(&store, &transport, ProviderId::OpenAi)
            .await
            .expect("second fetch")
            .expect("models present");

        assert_eq!(transport.request_count(), 1);
        assert_eq!(first, second);
        let ids: Vec<&str> = first.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["gpt-4o", "o4-mini", "gpt-3.5-turbo"]);
    }

    #[tokio::test]
    async fn test_clear_cache_forces_refetch_regardless_of_age() {
        let store = store_with_key(ProviderId::OpenAi).await;
        let transport = MockTransport::new();
        transport.queue_response(200, OPENAI_MODELS);
        transport.queue_response(200, OPENAI_MODELS);

        get_models(&store, &transport, ProviderId::OpenAi)
            .await
            .expect("first fetch");
        clear_model_cache(&store).await.expect("clear cache");
        get_models(&store, &transport, ProviderId::OpenAi)
            .await
            .expect("second fetch");

        assert_eq!(transport.request_count(), 2);
    }

    #[tokio::test]
    async fn test_missing_credential_returns_absent_without_network() {
        let store = MemoryStore::new();
        let transport = MockTransport::new();

        let models = get_models(&store, &transport, ProviderId::Xai)
            .await
            .expect("call succeeds");
        assert!(models.is_none());
        assert_eq!(transport.request_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_fetch_is_a_provider_named_error_and_caches_nothing() {
        let store = store_with_key(ProviderId::OpenAi).await;
        let transport = MockTransport::new();
        transport.queue_response(500, "boom");

        let err = get_models(&store, &transport, ProviderId::OpenAi)
            .await
            .expect_err("fetch must fail");
        assert_eq!(err.to_string(), "OpenAI models API error: 500");
        assert!(store
            .model_cache(ProviderId::OpenAi)
            .await
            .expect("cache lookup")
            .is_none());
    }

    #[tokio::test]
    async fn test_google_models_are_filtered_stripped_and_sorted_by_id() {
        let store = store_with_key(ProviderId::Google).await;
        let transport = MockTransport::new();
        transport.queue_response(
            200,
            r#"{"models":[
                {"name":"models/gemini-2.5-pro","displayName":"Gemini 2.5 Pro"},
                {"name":"models/text-embedding-004","displayName":"Embedding"},
                {"name":"models/gemini-2.0-flash"}
            ]}"#,
        );

        let models = get_models(&store, &transport, ProviderId::Google)
            .await
            .expect("fetch")
            .expect("models present");
        let shaped: Vec<(&str, &str)> = models
            .iter()
            .map(|m| (m.id.as_str(), m.name.as_str()))
            .collect();
        assert_eq!(
            shaped,
            [
                ("gemini-2.0-flash", "gemini-2.0-flash"),
                ("gemini-2.5-pro", "Gemini 2.5 Pro"),
            ]
        );
        let request = transport.requests().remove(0);
        assert!(request.url.ends_with("?key=sk-test"));
        assert!(request.headers.is_empty());
    }

    #[tokio::test]
    async fn test_anthropic_models_sort_by_created_at_desc_with_name_fallback() {
        let store = store_with_key(ProviderId::Anthropic).await;
        let transport = MockTransport::new();
        transport.queue_response(
            200,
            r#"{"data":[
                {"id":"claude-old","created_at":"2024-01-01T00:00:00Z"},
                {"id":"claude-new","display_name":"Claude New","created_at":"2025-06-01T00:00:00Z"}
            ]}"#,
        );

        let models = get_models(&store, &transport, ProviderId::Anthropic)
            .await
            .expect("fetch")
            .expect("models present");
        assert_eq!(models[0].id, "claude-new");
        assert_eq!(models[0].name, "Claude New");
        assert_eq!(models[1].name, "claude-old");

        let request = transport.requests().remove(0);
        let header_names: Vec<&str> = request.headers.iter().map(|(n, _)| *n).collect();
        assert!(header_names.contains(&"x-api-key"));
        assert!(header_names.contains(&"anthropic-version"));
    }

    #[tokio::test]
    async fn test_deepseek_models_sort_lexicographically() {
        let store = store_with_key(ProviderId::DeepSeek).await;
        let transport = MockTransport::new();
        transport.queue_response(
            200,
            r#"{"data":[{"id":"deepseek-reasoner"},{"id":"deepseek-chat"}]}"#,
        );

        let models = get_models(&store, &transport, ProviderId::DeepSeek)
            .await
            .expect("fetch")
            .expect("models present");
        let ids: Vec<&str> = models.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["deepseek-chat", "deepseek-reasoner"]);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_reported_not_swallowed() {
        let store = store_with_key(ProviderId::Xai).await;
        let transport = MockTransport::new();
        transport.queue_response(200, r#"{"unexpected":true}"#);

        let err = get_models(&store, &transport, ProviderId::Xai)
            .await
            .expect_err("must fail");
        assert_eq!(err.to_string(), "unexpected xAI models payload");
    }
}
