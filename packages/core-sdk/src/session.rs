use anyhow::Result;

use crate::llm;
use crate::models::{ChatRequest, ProviderId, Turn};
use crate::store::SettingsStore;
use crate::transport::HttpTransport;

/**
 * \brief 会话对象：一次选中文本或截图触发的完整对话。
 * \details 由外壳按弹层生命周期构造并持有；历史只存在于内存，
 *          捕获新的选区/截图意味着构造一个全新的会话。
 */
#[derive(Debug, Clone)]
pub struct ConversationSession {
    provider: ProviderId,
    model: String,
    leading_context: Option<String>,
    image: Option<String>,
    turns: Vec<Turn>,
}

impl ConversationSession {
    /** \brief 无上下文的空会话。 */
    pub fn new(provider: ProviderId, model: impl Into<String>) -> Self {
        ConversationSession {
            provider,
            model: model.into(),
            leading_context: None,
            image: None,
            turns: Vec::new(),
        }
    }

    /** \brief 由选中文本触发的会话。 */
    pub fn for_selection(
        provider: ProviderId,
        model: impl Into<String>,
        selected_text: impl Into<String>,
    ) -> Self {
        let mut session = Self::new(provider, model);
        let text = selected_text.into();
        if !text.is_empty() {
            session.leading_context = Some(text);
        }
        session
    }

    /** \brief 由截图触发的会话，data URL 原样保存。 */
    pub fn for_screenshot(
        provider: ProviderId,
        model: impl Into<String>,
        data_url: impl Into<String>,
    ) -> Self {
        let mut session = Self::new(provider, model);
        session.image = Some(data_url.into());
        session
    }

    pub fn provider(&self) -> ProviderId {
        self.provider
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn leading_context(&self) -> Option<&str> {
        self.leading_context.as_deref()
    }

    /** \brief 已回答的轮次，按时间顺序。 */
    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn is_fresh(&self) -> bool {
        self.turns.is_empty()
    }

    /**
     * \brief 提交一条新提问并等待回复。
     * \details 图像只随首轮发送；失败时把刚推入的用户轮回滚掉，
     *          可见历史始终只包含已成功回答的轮次。
     */
    pub async fn ask(
        &mut self,
        store: &dyn SettingsStore,
        transport: &dyn HttpTransport,
        prompt: &str,
    ) -> Result<String> {
        let request = ChatRequest {
            provider: self.provider,
            model: self.model.clone(),
            leading_context: self.leading_context.clone(),
            image: if self.turns.is_empty() {
                self.image.clone()
            } else {
                None
            },
            prompt: prompt.to_string(),
            prior_turns: self.turns.clone(),
        };

        self.turns.push(Turn::user(prompt));
        match llm::send_chat(store, transport, &request).await {
            Ok(answer) => {
                self.turns.push(Turn::assistant(answer.clone()));
                Ok(answer)
            }
            Err(err) => {
                self.turns.pop();
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;
    use crate::store::{MemoryStore, SettingsStore};
    use crate::transport::MockTransport;

    async fn store_with_key(provider: ProviderId) -> MemoryStore {
        let store = MemoryStore::new();
        store
            .set_api_key(provider, Some("sk-test"))
            .await
            .expect("store api key");
        store
    }

    fn deepseek_answer(text: &str) -> String {
        format!(r#"{{"choices":[{{"message":{{"content":"{}"}}}}]}}"#, text)
    }

    #[tokio::test]
    async fn test_session_accumulates_answered_turns_in_order() {
        let store = store_with_key(ProviderId::DeepSeek).await;
        let transport = MockTransport::new();
        transport.queue_response(200, &deepseek_answer("first"));
        transport.queue_response(200, &deepseek_answer("second"));

        let mut session =
            ConversationSession::for_selection(ProviderId::DeepSeek, "deepseek-chat", "sel");
        let first = session
            .ask(&store, &transport, "q1")
            .await
            .expect("first ask");
        let second = session
            .ask(&store, &transport, "q2")
            .await
            .expect("second ask");

        assert_eq!(first, "first");
        assert_eq!(second, "second");
        let roles: Vec<Role> = session.turns().iter().map(|t| t.role).collect();
        assert_eq!(
            roles,
            [Role::User, Role::Assistant, Role::User, Role::Assistant]
        );
        assert_eq!(session.turns()[2].content, "q2");
    }

    #[tokio::test]
    async fn test_failed_ask_rolls_back_the_user_turn() {
        let store = store_with_key(ProviderId::DeepSeek).await;
        let transport = MockTransport::new();
        transport.queue_response(200, &deepseek_answer("ok"));
        transport.queue_response(500, r#"{"error":{"message":"overloaded"}}"#);

        let mut session = ConversationSession::new(ProviderId::DeepSeek, "deepseek-chat");
        session
            .ask(&store, &transport, "q1")
            .await
            .expect("first ask");
        let err = session
            .ask(&store, &transport, "q2")
            .await
            .expect_err("second ask fails");

        assert_eq!(err.to_string(), "overloaded");
        // 失败的提问不留在历史里，重新提交后历史与服务端视角一致。
        assert_eq!(session.turns().len(), 2);
        assert_eq!(session.turns()[1].content, "ok");
    }

    #[tokio::test]
    async fn test_image_is_sent_only_with_the_first_turn() {
        let store = store_with_key(ProviderId::Anthropic).await;
        let transport = MockTransport::new();
        transport.queue_response(200, r#"{"content":[{"text":"see image"}]}"#);
        transport.queue_response(200, r#"{"content":[{"text":"follow up"}]}"#);

        let mut session = ConversationSession::for_screenshot(
            ProviderId::Anthropic,
            "claude-sonnet-4-5",
            "data:image/png;base64,AAAA",
        );
        session
            .ask(&store, &transport, "what is this")
            .await
            .expect("first ask");
        session
            .ask(&store, &transport, "and now")
            .await
            .expect("second ask");

        let requests = transport.requests();
        let first_body = requests[0].body.as_ref().expect("first body");
        let second_body = requests[1].body.as_ref().expect("second body");
        assert!(first_body.pointer("/messages/0/content/0/source").is_some());
        assert!(second_body
            .pointer("/messages/0/content")
            .and_then(|c| c.as_str())
            .is_some());
    }

    #[tokio::test]
    async fn test_context_is_replayed_into_first_turn_on_continuation() {
        let store = store_with_key(ProviderId::DeepSeek).await;
        let transport = MockTransport::new();
        transport.queue_response(200, &deepseek_answer("a1"));
        transport.queue_response(200, &deepseek_answer("a2"));

        let mut session =
            ConversationSession::for_selection(ProviderId::DeepSeek, "deepseek-chat", "sel");
        session.ask(&store, &transport, "q1").await.expect("ask 1");
        session.ask(&store, &transport, "q2").await.expect("ask 2");

        let requests = transport.requests();
        let second_body = requests[1].body.as_ref().expect("second body");
        let first_replayed = second_body
            .pointer("/messages/1/content")
            .and_then(|c| c.as_str())
            .expect("replayed first turn");
        assert!(first_replayed.starts_with("Context (selected text):"));
        assert!(first_replayed.ends_with("q1"));
    }
}
