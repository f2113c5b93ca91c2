use anyhow::{anyhow, bail, Context, Result};
use serde_json::{json, Value};

use crate::models::{parse_image_data_url, ChatRequest, ProviderId, Role};
use crate::registry::{provider_info, ProviderInfo};
use crate::store::SettingsStore;
use crate::transport::{HttpRequest, HttpTransport};

const ANTHROPIC_VERSION: &str = "2023-06-01";

const SYSTEM_INSTRUCTION: &str = "You are a helpful assistant. Provide clear, concise, and accurate responses. Always respond in the same language that the user writes in.";
const OPENAI_SYSTEM_INSTRUCTION: &str = "You are a helpful assistant. Provide clear, concise, and accurate responses. Always respond in the same language that the user writes in. Use web search when needed for up-to-date information.";
const XAI_SYSTEM_INSTRUCTION: &str = "You are a helpful assistant. Provide clear, concise, and accurate responses. Always respond in the same language that the user writes in. Use live search when needed for up-to-date information.";

const NO_RESPONSE_FALLBACK: &str = "No response generated";

/**
 * \brief 服务商适配器接口：纯函数式的请求构造与响应文本抽取。
 * \details 新增服务商只需实现本接口并在 `adapter_for` 登记一条，
 *          调度入口 `send_chat` 不需要改动。
 */
trait ProviderAdapter: Send + Sync {
    fn info(&self) -> &'static ProviderInfo;

    /** \brief 把逻辑请求编码为该服务商的线上协议（不触网）。 */
    fn build_request(&self, api_key: &str, request: &ChatRequest) -> HttpRequest;

    /** \brief 从成功响应的信封中抽取正文文本；抽不到返回 None。 */
    fn extract_text(&self, body: &Value) -> Option<String>;
}

/**
 * \brief 适配器登记表。
 */
fn adapter_for(provider: ProviderId) -> &'static dyn ProviderAdapter {
    match provider {
        ProviderId::OpenAi => &OpenAiAdapter,
        ProviderId::Anthropic => &AnthropicAdapter,
        ProviderId::Google => &GoogleAdapter,
        ProviderId::Xai => &XaiAdapter,
        ProviderId::DeepSeek => &DeepSeekAdapter,
    }
}

/**
 * \brief 向指定服务商发起一次聊天请求，返回归一化的纯文本回复。
 * \details 触网前校验凭据；整个调用恰好一次网络往返。非 2xx 响应转成
 *          带服务商名称的错误，信封缺字段归一化为固定的空回复文案。
 */
pub async fn send_chat(
    store: &dyn SettingsStore,
    transport: &dyn HttpTransport,
    request: &ChatRequest,
) -> Result<String> {
    let api_key = store
        .api_key(request.provider)
        .await?
        .filter(|key| !key.is_empty())
        .ok_or_else(|| {
            anyhow!(
                "API key not configured for {}. Please set it in the extension settings.",
                request.provider
            )
        })?;

    let adapter = adapter_for(request.provider);
    let response = transport
        .execute(adapter.build_request(&api_key, request))
        .await?;

    if !response.is_success() {
        // 错误正文按 JSON 解析，解析失败退化为空对象，绝不掩盖原始 HTTP 错误。
        let error_body: Value = serde_json::from_str(&response.body).unwrap_or_else(|_| json!({}));
        let message = error_body
            .pointer("/error/message")
            .and_then(|m| m.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("{} API error: {}", adapter.info().name, response.status));
        bail!(message);
    }

    let body: Value = serde_json::from_str(&response.body)
        .with_context(|| format!("failed to parse {} response", adapter.info().name))?;
    Ok(adapter
        .extract_text(&body)
        .unwrap_or_else(|| NO_RESPONSE_FALLBACK.to_string()))
}

/**
 * \brief 把选中文本格式化为引用块；空上下文产出空串。
 */
fn format_context(leading_context: Option<&str>) -> String {
    match leading_context {
        Some(text) if !text.is_empty() => {
            format!("Context (selected text):\n\"\"\"{}\"\"\"\n\n", text)
        }
        _ => String::new(),
    }
}

/**
 * \brief 共享的纯文本轮次整理策略。
 * \details 无历史时产出单条 `context + prompt`；有历史时按原顺序重放，
 *          上下文只前置到第一条历史消息，新提问追加为末尾的用户轮。
 */
fn assemble_text_turns(context: &str, request: &ChatRequest) -> Vec<(Role, String)> {
    if request.prior_turns.is_empty() {
        return vec![(Role::User, format!("{}{}", context, request.prompt))];
    }

    let mut turns = Vec::with_capacity(request.prior_turns.len() + 1);
    for (index, turn) in request.prior_turns.iter().enumerate() {
        let content = if index == 0 && !context.is_empty() {
            format!("{}{}", context, turn.content)
        } else {
            turn.content.clone()
        };
        turns.push((turn.role, content));
    }
    turns.push((Role::User, request.prompt.clone()));
    turns
}

/**
 * \brief OpenAI/xAI/DeepSeek 共用的 chat-completions 消息数组：系统指令开头，
 *        其后是整理好的文本轮次。
 */
fn chat_completion_messages(system_instruction: &str, request: &ChatRequest) -> Vec<Value> {
    let context = format_context(request.leading_context.as_deref());
    let mut messages = vec![json!({"role": "system", "content": system_instruction})];
    for (role, content) in assemble_text_turns(&context, request) {
        messages.push(json!({"role": role.as_str(), "content": content}));
    }
    messages
}

struct OpenAiAdapter;

impl ProviderAdapter for OpenAiAdapter {
    fn info(&self) -> &'static ProviderInfo {
        provider_info(ProviderId::OpenAi)
    }

    fn build_request(&self, api_key: &str, request: &ChatRequest) -> HttpRequest {
        let context = format_context(request.leading_context.as_deref());

        let input = if !request.prior_turns.is_empty() {
            Value::Array(
                assemble_text_turns(&context, request)
                    .into_iter()
                    .map(|(role, content)| json!({"role": role.as_str(), "content": content}))
                    .collect(),
            )
        } else if let Some(image_url) = request.image.as_deref() {
            // Responses API 直接接收 data URL；上下文与图像互斥，首条消息只带其一。
            json!([{
                "role": "user",
                "content": [
                    {"type": "input_image", "image_url": image_url},
                    {"type": "input_text", "text": request.prompt}
                ]
            }])
        } else {
            Value::String(format!("{}{}", context, request.prompt))
        };

        let body = json!({
            "model": request.model,
            "input": input,
            "instructions": OPENAI_SYSTEM_INSTRUCTION,
            "tools": [{"type": "web_search_preview"}],
        });
        HttpRequest::post(self.info().chat_endpoint, body)
            .header("Authorization", format!("Bearer {}", api_key))
    }

    fn extract_text(&self, body: &Value) -> Option<String> {
        if let Some(output) = body.get("output").and_then(|o| o.as_array()) {
            let texts: Vec<&str> = output
                .iter()
                .filter(|item| item.get("type").and_then(|t| t.as_str()) == Some("message"))
                .filter_map(|item| item.get("content").and_then(|c| c.as_array()))
                .flatten()
                .filter(|block| block.get("type").and_then(|t| t.as_str()) == Some("output_text"))
                .filter_map(|block| block.get("text").and_then(|t| t.as_str()))
                .collect();
            if !texts.is_empty() {
                return Some(texts.join("\n"));
            }
        }
        body.get("output_text")
            .and_then(|t| t.as_str())
            .map(|s| s.to_string())
    }
}

struct AnthropicAdapter;

impl ProviderAdapter for AnthropicAdapter {
    fn info(&self) -> &'static ProviderInfo {
        provider_info(ProviderId::Anthropic)
    }

    fn build_request(&self, api_key: &str, request: &ChatRequest) -> HttpRequest {
        let context = format_context(request.leading_context.as_deref());
        let fresh_image = if request.prior_turns.is_empty() {
            request.image.as_deref().and_then(parse_image_data_url)
        } else {
            None
        };

        let messages: Value = if !request.prior_turns.is_empty() {
            Value::Array(
                assemble_text_turns(&context, request)
                    .into_iter()
                    .map(|(role, content)| json!({"role": role.as_str(), "content": content}))
                    .collect(),
            )
        } else if let Some(image) = fresh_image {
            json!([{
                "role": "user",
                "content": [
                    {
                        "type": "image",
                        "source": {
                            "type": "base64",
                            "media_type": image.media_type,
                            "data": image.data
                        }
                    },
                    {"type": "text", "text": request.prompt}
                ]
            }])
        } else {
            json!([{"role": "user", "content": format!("{}{}", context, request.prompt)}])
        };

        let body = json!({
            "model": request.model,
            "max_tokens": 4096,
            "messages": messages,
            "system": SYSTEM_INSTRUCTION,
        });
        HttpRequest::post(self.info().chat_endpoint, body)
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
    }

    fn extract_text(&self, body: &Value) -> Option<String> {
        body.pointer("/content/0/text")
            .and_then(|t| t.as_str())
            .map(|s| s.to_string())
    }
}

struct GoogleAdapter;

impl GoogleAdapter {
    fn role_token(role: Role) -> &'static str {
        match role {
            Role::User => "user",
            Role::Assistant => "model",
        }
    }
}

impl ProviderAdapter for GoogleAdapter {
    fn info(&self) -> &'static ProviderInfo {
        provider_info(ProviderId::Google)
    }

    fn build_request(&self, api_key: &str, request: &ChatRequest) -> HttpRequest {
        let context = format_context(request.leading_context.as_deref());
        let fresh_image = if request.prior_turns.is_empty() {
            request.image.as_deref().and_then(parse_image_data_url)
        } else {
            None
        };

        let contents: Value = if !request.prior_turns.is_empty() {
            Value::Array(
                assemble_text_turns(&context, request)
                    .into_iter()
                    .map(|(role, content)| {
                        json!({
                            "role": Self::role_token(role),
                            "parts": [{"text": content}]
                        })
                    })
                    .collect(),
            )
        } else if let Some(image) = fresh_image {
            json!([{
                "role": "user",
                "parts": [
                    {
                        "inline_data": {
                            "mime_type": image.media_type,
                            "data": image.data
                        }
                    },
                    {"text": request.prompt}
                ]
            }])
        } else {
            json!([{
                "role": "user",
                "parts": [{"text": format!("{}{}", context, request.prompt)}]
            }])
        };

        let body = json!({
            "contents": contents,
            "systemInstruction": {
                "parts": [{"text": SYSTEM_INSTRUCTION}]
            },
            "tools": [{"google_search": {}}],
            "generationConfig": {
                "maxOutputTokens": 4096,
                "temperature": 0.7
            }
        });
        let url = format!(
            "{}?key={}",
            self.info().chat_endpoint.replace("{model}", &request.model),
            api_key
        );
        HttpRequest::post(url, body)
    }

    fn extract_text(&self, body: &Value) -> Option<String> {
        body.pointer("/candidates/0/content/parts/0/text")
            .and_then(|t| t.as_str())
            .map(|s| s.to_string())
    }
}

struct XaiAdapter;

impl ProviderAdapter for XaiAdapter {
    fn info(&self) -> &'static ProviderInfo {
        provider_info(ProviderId::Xai)
    }

    fn build_request(&self, api_key: &str, request: &ChatRequest) -> HttpRequest {
        let body = json!({
            "model": request.model,
            "messages": chat_completion_messages(XAI_SYSTEM_INSTRUCTION, request),
            "max_tokens": 4096,
            "temperature": 0.7,
            "stream": false
        });
        HttpRequest::post(self.info().chat_endpoint, body)
            .header("Authorization", format!("Bearer {}", api_key))
    }

    fn extract_text(&self, body: &Value) -> Option<String> {
        body.pointer("/choices/0/message/content")
            .and_then(|t| t.as_str())
            .map(|s| s.to_string())
    }
}

struct DeepSeekAdapter;

impl ProviderAdapter for DeepSeekAdapter {
    fn info(&self) -> &'static ProviderInfo {
        provider_info(ProviderId::DeepSeek)
    }

    fn build_request(&self, api_key: &str, request: &ChatRequest) -> HttpRequest {
        let body = json!({
            "model": request.model,
            "messages": chat_completion_messages(SYSTEM_INSTRUCTION, request),
            "max_tokens": 4096,
            "temperature": 0.7,
            "stream": false
        });
        HttpRequest::post(self.info().chat_endpoint, body)
            .header("Authorization", format!("Bearer {}", api_key))
    }

    fn extract_text(&self, body: &Value) -> Option<String> {
        body.pointer("/choices/0/message/content")
            .and_then(|t| t.as_str())
            .map(|s| s.to_string())
    }
}
