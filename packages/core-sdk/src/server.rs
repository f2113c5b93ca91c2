use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{Query, State},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::models::{ChatRequest, ProviderId, Theme, Turn};
use crate::registry::PROVIDERS;
use crate::store::SettingsStore;
use crate::transport::HttpTransport;
use crate::{catalog, llm, telemetry};

/**
 * \brief 注入给所有处理器的共享依赖：设置存储与 HTTP 传输。
 */
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn SettingsStore>,
    pub transport: Arc<dyn HttpTransport>,
}

/**
 * \brief 启动本地 HTTP 服务，暴露聊天、模型目录与设置接口。
 * \param addr 监听地址，如 "127.0.0.1:5173"
 */
pub async fn run(addr: &str, state: AppState) -> Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    println!("AskAI API listening on http://{}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

/**
 * \brief 组装路由。独立出来便于在进程内挂载测试。
 */
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/ask", post(ask))
        .route("/api/models", get(list_models))
        .route("/api/models/cache", delete(clear_model_cache))
        .route("/api/providers", get(list_providers))
        .route("/api/config", get(get_config).post(set_config))
        .route("/api/health", get(health_check))
        .with_state(state)
}

#[derive(Deserialize, Debug)]
struct AskRequest {
    provider: ProviderId,
    model: String,
    /** \brief 触发会话的选中文本（可选） */
    #[serde(default)]
    selected_text: Option<String>,
    /** \brief 截图 data URL（可选） */
    #[serde(default)]
    screenshot: Option<String>,
    /** \brief 本轮提问 */
    prompt: String,
    /** \brief 不含本轮提问的历史轮次 */
    #[serde(default)]
    history: Vec<Turn>,
}

#[derive(Serialize, Debug)]
struct AskResponse {
    result: String,
}

#[derive(Deserialize, Debug)]
struct ModelQuery {
    provider: ProviderId,
}

#[derive(Serialize, Debug)]
struct ProviderDto {
    id: ProviderId,
    name: &'static str,
    supports_vision: bool,
    models: Vec<crate::models::ModelEntry>,
}

#[derive(Serialize, Debug)]
struct ConfigState {
    theme: Theme,
    selection_button_enabled: bool,
    telemetry_enabled: bool,
    /** \brief 已配置凭据的服务商 */
    configured: Vec<ProviderId>,
    last_provider: Option<ProviderId>,
    last_model: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ConfigUpdate {
    #[serde(default)]
    theme: Option<Theme>,
    #[serde(default)]
    selection_button_enabled: Option<bool>,
    #[serde(default)]
    telemetry_enabled: Option<bool>,
    /** \brief 按服务商写入的密钥；空串表示删除 */
    #[serde(default)]
    api_keys: Option<HashMap<String, String>>,
    #[serde(default)]
    last_provider: Option<ProviderId>,
    #[serde(default)]
    last_model: Option<String>,
}

/**
 * \brief 聊天接口：一次请求对应一次服务商调用，错误原样返回。
 */
async fn ask(
    State(state): State<AppState>,
    Json(payload): Json<AskRequest>,
) -> Result<Json<AskResponse>, (axum::http::StatusCode, String)> {
    let request = ChatRequest {
        provider: payload.provider,
        model: payload.model,
        leading_context: payload.selected_text.filter(|text| !text.is_empty()),
        image: payload.screenshot,
        prompt: payload.prompt,
        prior_turns: payload.history,
    };
    telemetry::log_event(
        "server.ask",
        &format!(
            "provider={} model={} turns={} prompt_len={}",
            request.provider,
            request.model,
            request.prior_turns.len(),
            request.prompt.len()
        ),
    );

    match llm::send_chat(state.store.as_ref(), state.transport.as_ref(), &request).await {
        Ok(result) => Ok(Json(AskResponse { result })),
        Err(err) => {
            telemetry::log_error(
                "server.ask",
                &format!("provider={} error={}", request.provider, err),
            );
            Err(internal_err(err))
        }
    }
}

/**
 * \brief 模型目录接口：缓存命中或实时抓取；未配置凭据时返回 null。
 */
async fn list_models(
    State(state): State<AppState>,
    Query(q): Query<ModelQuery>,
) -> Result<Json<serde_json::Value>, (axum::http::StatusCode, String)> {
    let models = catalog::get_models(state.store.as_ref(), state.transport.as_ref(), q.provider)
        .await
        .map_err(|err| {
            telemetry::log_error(
                "server.models",
                &format!("provider={} error={}", q.provider, err),
            );
            internal_err(err)
        })?;
    Ok(Json(serde_json::json!({ "models": models })))
}

/**
 * \brief 清空模型缓存。
 */
async fn clear_model_cache(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, (axum::http::StatusCode, String)> {
    catalog::clear_model_cache(state.store.as_ref())
        .await
        .map_err(internal_err)?;
    telemetry::log_event("server.models", "cache cleared");
    Ok(Json(serde_json::json!({ "ok": true })))
}

/**
 * \brief 注册表接口：供外壳渲染服务商/模型选择器。
 */
async fn list_providers() -> Json<Vec<ProviderDto>> {
    let providers = PROVIDERS
        .iter()
        .map(|info| ProviderDto {
            id: info.id,
            name: info.name,
            supports_vision: info.supports_vision,
            models: info.fallback_models(),
        })
        .collect();
    Json(providers)
}

async fn build_config_state(store: &dyn SettingsStore) -> Result<ConfigState> {
    let mut configured = Vec::new();
    for provider in ProviderId::ALL {
        if store.api_key(provider).await?.is_some() {
            configured.push(provider);
        }
    }
    let last_used = store.last_used().await?;
    Ok(ConfigState {
        theme: store.theme().await?,
        selection_button_enabled: store.selection_button_enabled().await?,
        telemetry_enabled: store.telemetry_enabled().await?,
        configured,
        last_provider: last_used.as_ref().map(|(provider, _)| *provider),
        last_model: last_used.map(|(_, model)| model),
    })
}

/**
 * \brief 读取当前设置。密钥绝不回显，只报告哪些服务商已配置。
 */
async fn get_config(
    State(state): State<AppState>,
) -> Result<Json<ConfigState>, (axum::http::StatusCode, String)> {
    let config = build_config_state(state.store.as_ref())
        .await
        .map_err(internal_err)?;
    Ok(Json(config))
}

/**
 * \brief 局部更新设置；返回更新后的完整状态。
 */
async fn set_config(
    State(state): State<AppState>,
    Json(update): Json<ConfigUpdate>,
) -> Result<Json<ConfigState>, (axum::http::StatusCode, String)> {
    let store = state.store.as_ref();

    if let Some(theme) = update.theme {
        store.set_theme(theme).await.map_err(internal_err)?;
    }
    if let Some(enabled) = update.selection_button_enabled {
        store
            .set_selection_button_enabled(enabled)
            .await
            .map_err(internal_err)?;
    }
    if let Some(enabled) = update.telemetry_enabled {
        store
            .set_telemetry_enabled(enabled)
            .await
            .map_err(internal_err)?;
        telemetry::set_enabled(enabled);
    }
    if let Some(api_keys) = update.api_keys {
        for (raw_provider, api_key) in api_keys {
            let provider: ProviderId = raw_provider.parse().map_err(internal_err)?;
            store
                .set_api_key(provider, Some(api_key.as_str()))
                .await
                .map_err(internal_err)?;
        }
    }
    if let (Some(provider), Some(model)) = (update.last_provider, update.last_model.as_deref()) {
        store
            .set_last_used(provider, model)
            .await
            .map_err(internal_err)?;
    }

    let config = build_config_state(store).await.map_err(internal_err)?;
    Ok(Json(config))
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "ok": true }))
}

fn internal_err<E: std::fmt::Display>(e: E) -> (axum::http::StatusCode, String) {
    (axum::http::StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}
