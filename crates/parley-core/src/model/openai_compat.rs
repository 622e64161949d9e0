use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{
    ChunkStream, ModelProvider, ModelRequest, ModelResponse, WireMessage, normalize_messages,
    sse::{WireUsage, completion_stream},
};

const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";

/// Client for any backend speaking the OpenAI chat-completions protocol
/// (OpenRouter, OpenAI, or a compatible gateway).
#[derive(Debug, Clone)]
pub struct OpenAiCompatProvider {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    headers: Vec<(&'static str, String)>,
}

impl OpenAiCompatProvider {
    pub fn new(api_key: String, model: String, base_url: String) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_owned(),
            api_key,
            model,
            headers: Vec::new(),
        }
    }

    pub fn openrouter(
        api_key: String,
        model: String,
        referer: Option<String>,
        title: Option<String>,
    ) -> Self {
        let mut provider = Self::new(api_key, model, OPENROUTER_BASE_URL.to_owned());
        if let Some(referer) = referer {
            provider.headers.push(("HTTP-Referer", referer));
        }
        if let Some(title) = title {
            provider.headers.push(("X-Title", title));
        }
        provider
    }

    pub fn openai(api_key: String, model: String, base_url: String) -> Self {
        Self::new(api_key, model, base_url)
    }

    fn request_builder(&self, payload: &ChatCompletionRequest<'_>) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(payload);

        for (name, value) in &self.headers {
            builder = builder.header(*name, value);
        }
        builder
    }

    fn payload<'a>(
        &'a self,
        request: &'a ModelRequest,
        messages: Vec<WireMessage>,
        stream: bool,
    ) -> ChatCompletionRequest<'a> {
        ChatCompletionRequest {
            model: request.model.as_deref().unwrap_or(&self.model),
            messages,
            temperature: request.temperature,
            top_p: request.top_p,
            max_tokens: request.max_tokens,
            stream,
            stream_options: stream.then_some(StreamOptions {
                include_usage: true,
            }),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Value,
}

#[async_trait]
impl ModelProvider for OpenAiCompatProvider {
    fn default_model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: ModelRequest) -> anyhow::Result<ModelResponse> {
        let messages = normalize_messages(&request.messages);
        let payload = self.payload(&request, messages, false);

        let response = self
            .request_builder(&payload)
            .send()
            .await?
            .error_for_status()?
            .json::<ChatCompletionResponse>()
            .await?;

        let content = response
            .choices
            .first()
            .and_then(|choice| extract_message_content(&choice.message.content))
            .ok_or_else(|| anyhow::anyhow!("model returned no choices"))?;

        Ok(ModelResponse {
            content,
            usage: response.usage.map(Into::into),
        })
    }

    async fn stream(&self, request: ModelRequest) -> anyhow::Result<ChunkStream> {
        let messages = normalize_messages(&request.messages);
        let payload = self.payload(&request, messages, true);

        let response = self
            .request_builder(&payload)
            .send()
            .await?
            .error_for_status()?;

        Ok(completion_stream(response))
    }
}

fn extract_message_content(content: &Value) -> Option<String> {
    if let Some(text) = content.as_str() {
        return Some(text.to_owned());
    }

    let array = content.as_array()?;
    let joined = array
        .iter()
        .filter_map(|item| item.get("text").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join("");

    if joined.is_empty() { None } else { Some(joined) }
}

#[cfg(test)]
mod tests {
    use axum::{Json, Router, http::header, response::IntoResponse, routing::post};
    use futures_util::StreamExt;
    use serde_json::{Value, json};

    use crate::{
        model::{ChatMessage, ModelProvider, ModelRequest},
        types::{MessageRole, Usage},
    };

    use super::OpenAiCompatProvider;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test listener");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            axum::serve(listener, router).await.expect("test server");
        });
        format!("http://{addr}/v1")
    }

    fn request() -> ModelRequest {
        ModelRequest {
            model: None,
            messages: vec![
                ChatMessage::new(MessageRole::System, "be brief"),
                ChatMessage::new(MessageRole::User, "hi"),
            ],
            temperature: Some(0.2),
            top_p: None,
            max_tokens: Some(64),
        }
    }

    #[tokio::test]
    async fn complete_sends_normalized_payload_and_reads_usage() {
        let router = Router::new().route(
            "/v1/chat/completions",
            post(|Json(body): Json<Value>| async move {
                assert_eq!(body["model"], "test-model");
                assert_eq!(body["messages"][0]["role"], "system");
                assert_eq!(body["max_tokens"], 64);
                assert!(body.get("stream").is_none());
                Json(json!({
                    "choices": [{ "message": { "content": "hello there" } }],
                    "usage": { "prompt_tokens": 7, "completion_tokens": 2 }
                }))
            }),
        );
        let base_url = serve(router).await;
        let provider =
            OpenAiCompatProvider::openai("key".to_owned(), "test-model".to_owned(), base_url);

        let response = provider.complete(request()).await.expect("completion");
        assert_eq!(response.content, "hello there");
        assert_eq!(
            response.usage,
            Some(Usage {
                input_tokens: 7,
                output_tokens: 2
            })
        );
    }

    #[tokio::test]
    async fn stream_skips_malformed_lines_and_ends_with_sentinel() {
        let router = Router::new().route(
            "/v1/chat/completions",
            post(|| async {
                let body = concat!(
                    "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
                    "data: {garbage\n\n",
                    "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
                    "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":5,\"completion_tokens\":2}}\n\n",
                    "data: [DONE]\n\n",
                );
                ([(header::CONTENT_TYPE, "text/event-stream")], body).into_response()
            }),
        );
        let base_url = serve(router).await;
        let provider =
            OpenAiCompatProvider::openai("key".to_owned(), "test-model".to_owned(), base_url);

        let chunks = provider
            .stream(request())
            .await
            .expect("stream opens")
            .map(|chunk| chunk.expect("chunk ok"))
            .collect::<Vec<_>>()
            .await;

        let text = chunks
            .iter()
            .filter_map(|chunk| chunk.delta.clone())
            .collect::<String>();
        assert_eq!(text, "Hello");

        let last = chunks.last().expect("sentinel");
        assert!(last.done && last.delta.is_none());
        assert_eq!(
            last.usage,
            Some(Usage {
                input_tokens: 5,
                output_tokens: 2
            })
        );
        assert_eq!(chunks.iter().filter(|chunk| chunk.done).count(), 1);
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let router = Router::new().route(
            "/v1/chat/completions",
            post(|| async { (axum::http::StatusCode::SERVICE_UNAVAILABLE, "down") }),
        );
        let base_url = serve(router).await;
        let provider =
            OpenAiCompatProvider::openai("key".to_owned(), "test-model".to_owned(), base_url);

        assert!(provider.complete(request()).await.is_err());
    }
}
