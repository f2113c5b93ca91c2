use anyhow::anyhow;
use serde::{Deserialize, Serialize};

/**
 * \brief 受支持的模型服务商标识（封闭枚举，未知 id 在解析阶段即被拒绝）。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    OpenAi,
    Anthropic,
    Google,
    Xai,
    DeepSeek,
}

impl ProviderId {
    /** \brief 全部服务商，按注册表顺序。 */
    pub const ALL: [ProviderId; 5] = [
        ProviderId::OpenAi,
        ProviderId::Anthropic,
        ProviderId::Google,
        ProviderId::Xai,
        ProviderId::DeepSeek,
    ];

    /** \brief 存储与协议中使用的小写 id。 */
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::OpenAi => "openai",
            ProviderId::Anthropic => "anthropic",
            ProviderId::Google => "google",
            ProviderId::Xai => "xai",
            ProviderId::DeepSeek => "deepseek",
        }
    }
}

impl std::str::FromStr for ProviderId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "openai" => Ok(ProviderId::OpenAi),
            "anthropic" => Ok(ProviderId::Anthropic),
            "google" => Ok(ProviderId::Google),
            "xai" => Ok(ProviderId::Xai),
            "deepseek" => Ok(ProviderId::DeepSeek),
            other => Err(anyhow!("Unknown provider: {}", other)),
        }
    }
}

impl std::fmt::Display for ProviderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/**
 * \brief 对话轮次的角色。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/**
 * \brief 对话中的一条消息。有序的轮次序列构成一次会话，顺序在重放时必须保持。
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    /** \brief 角色：user/assistant */
    pub role: Role,
    /** \brief 内容 */
    pub content: String,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Turn {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Turn {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/**
 * \brief 一次逻辑聊天请求，适配器将其归一化为各服务商的线上协议。
 * \details 不变式：`image` 仅在 `prior_turns` 为空时有意义；`leading_context`
 *          只会前置到会话第一条用户可见消息。
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub provider: ProviderId,
    pub model: String,
    /** \brief 触发会话的选中文本（可选） */
    #[serde(default)]
    pub leading_context: Option<String>,
    /** \brief 截图 data URL（可选，仅首轮生效） */
    #[serde(default)]
    pub image: Option<String>,
    /** \brief 本轮新提问 */
    pub prompt: String,
    /** \brief 已完成的历史轮次，按原始顺序 */
    #[serde(default)]
    pub prior_turns: Vec<Turn>,
}

/**
 * \brief 从 data URL 解析出的图像载荷。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageData {
    pub media_type: String,
    pub data: String,
}

/**
 * \brief 解析 `data:image/<subtype>;base64,<payload>` 形式的 data URL。
 * \details 不匹配的输入一律视为"无图像"（返回 None），而不是错误。
 */
pub fn parse_image_data_url(url: &str) -> Option<ImageData> {
    let rest = url.strip_prefix("data:image/")?;
    let (subtype, payload) = rest.split_once(";base64,")?;
    if subtype.is_empty() || payload.is_empty() {
        return None;
    }
    if !subtype
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return None;
    }
    Some(ImageData {
        media_type: format!("image/{}", subtype),
        data: payload.to_string(),
    })
}

/**
 * \brief 模型目录中的一个条目。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelEntry {
    pub id: String,
    pub name: String,
}

impl ModelEntry {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        ModelEntry {
            id: id.into(),
            name: name.into(),
        }
    }
}

/**
 * \brief 按服务商缓存的模型列表及其抓取时间（Unix 秒）。
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCacheEntry {
    pub models: Vec<ModelEntry>,
    pub fetched_at: i64,
}

/**
 * \brief 界面主题。
 */
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    #[default]
    Light,
    Dark,
}

impl Theme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Theme::Light => "light",
            Theme::Dark => "dark",
        }
    }
}

impl std::str::FromStr for Theme {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "light" => Ok(Theme::Light),
            "dark" => Ok(Theme::Dark),
            other => Err(anyhow!("unknown theme: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_id_round_trips_through_str() {
        for provider in ProviderId::ALL {
            let parsed: ProviderId = provider.as_str().parse().expect("parse provider id");
            assert_eq!(parsed, provider);
        }
        assert!("grok".parse::<ProviderId>().is_err());
    }

    #[test]
    fn test_provider_id_serde_uses_lowercase() {
        let json = serde_json::to_string(&ProviderId::DeepSeek).expect("serialize");
        assert_eq!(json, "\"deepseek\"");
        let back: ProviderId = serde_json::from_str("\"openai\"").expect("deserialize");
        assert_eq!(back, ProviderId::OpenAi);
    }

    #[test]
    fn test_parse_image_data_url_extracts_media_type_and_payload() {
        let image = parse_image_data_url("data:image/png;base64,AAAA").expect("parse data url");
        assert_eq!(image.media_type, "image/png");
        assert_eq!(image.data, "AAAA");
    }

    #[test]
    fn test_parse_image_data_url_rejects_non_matching_input() {
        assert!(parse_image_data_url("data:text/plain;base64,AAAA").is_none());
        assert!(parse_image_data_url("data:image/png;base64,").is_none());
        assert!(parse_image_data_url("data:image/;base64,AAAA").is_none());
        assert!(parse_image_data_url("data:image/svg+xml;base64,AAAA").is_none());
        assert!(parse_image_data_url("http://example.com/a.png").is_none());
    }

    #[test]
    fn test_theme_defaults_to_light() {
        assert_eq!(Theme::default(), Theme::Light);
        assert_eq!("dark".parse::<Theme>().expect("parse theme"), Theme::Dark);
    }
}
