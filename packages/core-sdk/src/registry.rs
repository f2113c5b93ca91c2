use crate::models::{ModelEntry, ProviderId};

/**
 * \brief 单个服务商的静态注册信息：端点、展示名、能力与后备模型目录。
 */
#[derive(Debug)]
pub struct ProviderInfo {
    pub id: ProviderId,
    /** \brief 展示名称，也用于拼接错误消息 */
    pub name: &'static str,
    /** \brief 聊天补全端点；Google 的模板含 {model} 占位符 */
    pub chat_endpoint: &'static str,
    /** \brief 模型列表端点 */
    pub models_endpoint: &'static str,
    /** \brief 是否接受图像输入（截图会话只展示支持视觉的服务商） */
    pub supports_vision: bool,
    /** \brief 实时抓取不可用时的后备模型目录，按新旧/偏好排序 */
    fallback: &'static [(&'static str, &'static str)],
}

impl ProviderInfo {
    pub fn fallback_models(&self) -> Vec<ModelEntry> {
        self.fallback
            .iter()
            .map(|(id, name)| ModelEntry::new(*id, *name))
            .collect()
    }
}

pub static PROVIDERS: [ProviderInfo; 5] = [
    ProviderInfo {
        id: ProviderId::OpenAi,
        name: "OpenAI",
        chat_endpoint: "https://api.openai.com/v1/responses",
        models_endpoint: "https://api.openai.com/v1/models",
        supports_vision: true,
        fallback: &[
            ("gpt-5.2", "GPT-5.2"),
            ("gpt-5", "GPT-5"),
            ("o4-mini", "o4 Mini"),
            ("gpt-4.1", "GPT-4.1"),
            ("gpt-4o", "GPT-4o"),
            ("gpt-4", "GPT-4"),
            ("gpt-3.5-turbo", "GPT-3.5 Turbo"),
            ("gpt-3.5", "GPT-3.5"),
        ],
    },
    ProviderInfo {
        id: ProviderId::Anthropic,
        name: "Anthropic",
        chat_endpoint: "https://api.anthropic.com/v1/messages",
        models_endpoint: "https://api.anthropic.com/v1/models",
        supports_vision: true,
        fallback: &[
            ("claude-sonnet-4-5", "Claude Sonnet 4.5"),
            ("claude-haiku-4-5", "Claude Haiku 4.5"),
            ("claude-opus-4-5", "Claude Opus 4.5"),
            ("claude-opus-4-1", "Claude Opus 4.1"),
            ("claude-sonnet-4-0", "Claude Sonnet 4.0"),
        ],
    },
    ProviderInfo {
        id: ProviderId::Google,
        name: "Google AI",
        chat_endpoint:
            "https://generativelanguage.googleapis.com/v1beta/models/{model}:generateContent",
        models_endpoint: "https://generativelanguage.googleapis.com/v1beta/models",
        supports_vision: true,
        fallback: &[
            ("gemini-3-pro-preview", "Gemini 3 Pro Preview"),
            ("gemini-3-flash-preview", "Gemini 3 Flash Preview"),
            ("gemini-2.5-pro", "Gemini 2.5 Pro"),
            ("gemini-2.5-flash", "Gemini 2.5 Flash"),
            ("gemini-2.5-flash-preview-09-2025", "Gemini 2.5 Flash Preview"),
            ("gemini-2.5-flash-lite", "Gemini 2.5 Flash Lite"),
            ("gemini-2.0-flash", "Gemini 2.0 Flash"),
            ("gemini-2.0-flash-lite", "Gemini 2.0 Flash Lite"),
        ],
    },
    ProviderInfo {
        id: ProviderId::Xai,
        name: "xAI",
        chat_endpoint: "https://api.x.ai/v1/chat/completions",
        models_endpoint: "https://api.x.ai/v1/models",
        supports_vision: false,
        fallback: &[
            ("grok-4-1-fast-reasoning", "Grok 4.1 Fast Reasoning"),
            ("grok-4-1-fast-non-reasoning", "Grok 4.1 Fast Non-Reasoning"),
            ("grok-code-fast-1", "Grok Code Fast 1"),
            ("grok-4-fast-reasoning", "Grok 4 Fast Reasoning"),
            ("grok-4-fast-non-reasoning", "Grok 4 Fast Non-Reasoning"),
            ("grok-3-mini", "Grok 3 Mini"),
            ("grok-3", "Grok 3"),
        ],
    },
    ProviderInfo {
        id: ProviderId::DeepSeek,
        name: "DeepSeek",
        chat_endpoint: "https://api.deepseek.com/v1/chat/completions",
        models_endpoint: "https://api.deepseek.com/v1/models",
        supports_vision: false,
        fallback: &[
            ("deepseek-chat", "DeepSeek Chat"),
            ("deepseek-reasoner", "DeepSeek Reasoner"),
        ],
    },
];

/**
 * \brief 纯查表：按 id 取注册信息。枚举保证查找不会失败。
 */
pub fn provider_info(id: ProviderId) -> &'static ProviderInfo {
    match id {
        ProviderId::OpenAi => &PROVIDERS[0],
        ProviderId::Anthropic => &PROVIDERS[1],
        ProviderId::Google => &PROVIDERS[2],
        ProviderId::Xai => &PROVIDERS[3],
        ProviderId::DeepSeek => &PROVIDERS[4],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_info_table_is_consistent() {
        for provider in ProviderId::ALL {
            let info = provider_info(provider);
            assert_eq!(info.id, provider);
            assert!(!info.fallback_models().is_empty());
            assert!(info.models_endpoint.starts_with("https://"));
        }
    }

    #[test]
    fn test_google_chat_endpoint_carries_model_placeholder() {
        assert!(provider_info(ProviderId::Google)
            .chat_endpoint
            .contains("{model}"));
    }

    #[test]
    fn test_vision_flags_exclude_xai_and_deepseek() {
        assert!(!provider_info(ProviderId::Xai).supports_vision);
        assert!(!provider_info(ProviderId::DeepSeek).supports_vision);
        assert!(provider_info(ProviderId::OpenAi).supports_vision);
        assert!(provider_info(ProviderId::Anthropic).supports_vision);
        assert!(provider_info(ProviderId::Google).supports_vision);
    }
}
