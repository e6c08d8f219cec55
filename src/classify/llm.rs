//! LLM-backed intent classification.
//!
//! The seam is the `IntentClassifier` trait so the engine and its tests
//! never depend on the OpenAI wire format. The production implementation
//! calls the chat completions API requesting a strict JSON object and
//! validates the reply against the classification schema — invalid output
//! is a distinct, retryable error, never a panic.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::error::TriageError;
use crate::types::{Intent, Priority};

/// Context handed to the classifier for one message.
#[derive(Debug, Clone)]
pub struct ClassifyRequest {
    pub content: String,
    pub sender_name: Option<String>,
    pub sender_username: Option<String>,
    pub follower_count: Option<i64>,
}

/// The schema the LLM must produce. Unknown intent/priority strings fail
/// deserialization and surface as `InvalidLlmOutput`.
#[derive(Debug, Clone, Deserialize)]
pub struct LlmClassification {
    pub intent: Intent,
    pub priority: Priority,
    #[serde(default)]
    pub suggested_reply: Option<String>,
}

#[async_trait]
pub trait IntentClassifier: Send + Sync {
    async fn classify(&self, request: &ClassifyRequest) -> Result<LlmClassification, TriageError>;
}

// ---------------------------------------------------------------------------
// OpenAI implementation
// ---------------------------------------------------------------------------

const OPENAI_URL: &str = "https://api.openai.com/v1/chat/completions";
const MODEL: &str = "gpt-4o-mini";

pub struct OpenAiClassifier {
    http: reqwest::Client,
    api_key: String,
}

impl OpenAiClassifier {
    pub fn new(api_key: String, timeout: std::time::Duration) -> Result<Self, TriageError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http, api_key })
    }
}

#[async_trait]
impl IntentClassifier for OpenAiClassifier {
    async fn classify(&self, request: &ClassifyRequest) -> Result<LlmClassification, TriageError> {
        let body = serde_json::json!({
            "model": MODEL,
            "messages": [
                { "role": "system", "content": system_prompt(request) },
                { "role": "user", "content": format!("Mensagem: \"{}\"", request.content) }
            ],
            "response_format": { "type": "json_object" },
            "temperature": 0.3,
            "max_tokens": 300,
        });

        let response = self
            .http
            .post(OPENAI_URL)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(TriageError::LlmApi {
                status: status.as_u16(),
                message,
            });
        }

        let envelope: ChatResponse = response.json().await?;
        let content = envelope
            .choices
            .first()
            .map(|choice| choice.message.content.as_str())
            .ok_or_else(|| TriageError::InvalidLlmOutput("empty choices".to_string()))?;

        debug!(raw = content, "LLM classification reply");
        parse_classification(content)
    }
}

/// Strict parse of the model's JSON reply.
pub fn parse_classification(raw: &str) -> Result<LlmClassification, TriageError> {
    serde_json::from_str(raw).map_err(|e| TriageError::InvalidLlmOutput(e.to_string()))
}

/// Classification prompt. Follower count and sender name are context
/// signals — a partnership DM from a large account outranks one from a
/// throwaway.
fn system_prompt(request: &ClassifyRequest) -> String {
    let followers = request
        .follower_count
        .map(|n| n.to_string())
        .unwrap_or_else(|| "desconhecido".to_string());
    let name = request
        .sender_name
        .as_deref()
        .or(request.sender_username.as_deref())
        .unwrap_or("desconhecido");

    format!(
        r#"Você é um assistente que classifica mensagens de DM do Instagram para criadores de conteúdo.

Classifique a mensagem em:
- intent: "partnership" (proposta de parceria/publi), "fan" (fã/elogio), "question" (dúvida sobre conteúdo), "hate" (hate/crítica), "spam" (spam/vendas)
- priority: "respond_now" (responder urgente - parcerias, dúvidas importantes), "can_wait" (pode esperar - fãs), "ignore" (pode ignorar - spam, hate)
- suggested_reply: Uma sugestão curta de resposta em português (ou null se for spam/hate)

Considere:
- Quantidade de seguidores do remetente: {followers}
- Nome: {name}

Responda APENAS em JSON válido."#
    )
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_classification() {
        let parsed = parse_classification(
            r#"{"intent":"partnership","priority":"respond_now","suggested_reply":"Oi! Vamos conversar."}"#,
        )
        .unwrap();
        assert_eq!(parsed.intent, Intent::Partnership);
        assert_eq!(parsed.priority, Priority::RespondNow);
        assert_eq!(parsed.suggested_reply.as_deref(), Some("Oi! Vamos conversar."));
    }

    #[test]
    fn test_parse_null_reply_and_missing_reply() {
        let with_null =
            parse_classification(r#"{"intent":"spam","priority":"ignore","suggested_reply":null}"#)
                .unwrap();
        assert!(with_null.suggested_reply.is_none());

        let without =
            parse_classification(r#"{"intent":"hate","priority":"ignore"}"#).unwrap();
        assert!(without.suggested_reply.is_none());
    }

    #[test]
    fn test_parse_rejects_unknown_bucket() {
        let err = parse_classification(r#"{"intent":"friendly","priority":"ignore"}"#).unwrap_err();
        assert!(matches!(err, TriageError::InvalidLlmOutput(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_parse_rejects_non_json() {
        let err = parse_classification("the message looks like spam").unwrap_err();
        assert!(matches!(err, TriageError::InvalidLlmOutput(_)));
    }

    #[test]
    fn test_prompt_embeds_context_signals() {
        let prompt = system_prompt(&ClassifyRequest {
            content: "vamos fechar?".to_string(),
            sender_name: Some("Maria".to_string()),
            sender_username: Some("maria_oficial".to_string()),
            follower_count: Some(125_000),
        });
        assert!(prompt.contains("125000"));
        assert!(prompt.contains("Maria"));
    }
}
