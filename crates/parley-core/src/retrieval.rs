use std::{sync::Arc, time::Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Passage {
    pub text: String,
    #[serde(default)]
    pub score: f32,
    #[serde(default)]
    pub source: Option<String>,
}

#[async_trait]
pub trait Retriever: Send + Sync {
    /// Ranked passages, best first.
    async fn retrieve(
        &self,
        query: &str,
        namespace: Option<&str>,
        top_k: usize,
    ) -> anyhow::Result<Vec<Passage>>;
}

/// Embedding/search service reached over HTTP.
#[derive(Debug, Clone)]
pub struct HttpRetriever {
    client: Client,
    url: String,
}

impl HttpRetriever {
    pub fn new(url: String) -> Self {
        Self {
            client: Client::new(),
            url,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RetrievalRequest<'a> {
    query: &'a str,
    namespace: Option<&'a str>,
    top_k: usize,
}

#[derive(Debug, Deserialize)]
struct RetrievalResponse {
    #[serde(default)]
    passages: Vec<Passage>,
}

#[async_trait]
impl Retriever for HttpRetriever {
    async fn retrieve(
        &self,
        query: &str,
        namespace: Option<&str>,
        top_k: usize,
    ) -> anyhow::Result<Vec<Passage>> {
        let response = self
            .client
            .post(&self.url)
            .json(&RetrievalRequest {
                query,
                namespace,
                top_k,
            })
            .send()
            .await?
            .error_for_status()?
            .json::<RetrievalResponse>()
            .await?;

        Ok(response.passages)
    }
}

/// Turns retrieval into an optional system-context block. Failures and empty
/// results both mean "no context"; they never fail a turn.
#[derive(Clone)]
pub struct RetrievalAdapter {
    retriever: Option<Arc<dyn Retriever>>,
    top_k: usize,
}

impl RetrievalAdapter {
    pub fn new(retriever: Option<Arc<dyn Retriever>>, top_k: usize) -> Self {
        Self {
            retriever,
            top_k: top_k.max(1),
        }
    }

    pub fn disabled() -> Self {
        Self::new(None, 1)
    }

    pub fn is_enabled(&self) -> bool {
        self.retriever.is_some()
    }

    pub async fn context_block(&self, query: &str, namespace: Option<&str>) -> Option<String> {
        let retriever = self.retriever.as_ref()?;
        let started_at = Instant::now();

        let passages = match retriever.retrieve(query, namespace, self.top_k).await {
            Ok(passages) => passages,
            Err(error) => {
                warn!(
                    namespace = namespace.unwrap_or("-"),
                    ?error,
                    "retrieval failed; continuing without context"
                );
                return None;
            }
        };

        debug!(
            namespace = namespace.unwrap_or("-"),
            passages = passages.len(),
            duration_ms = started_at.elapsed().as_millis() as u64,
            "retrieval finished"
        );

        format_context(&passages, self.top_k)
    }
}

fn format_context(passages: &[Passage], top_k: usize) -> Option<String> {
    let lines = passages
        .iter()
        .filter(|passage| !passage.text.trim().is_empty())
        .take(top_k)
        .enumerate()
        .map(|(index, passage)| match &passage.source {
            Some(source) => format!("[{}] {} (source: {source})", index + 1, passage.text.trim()),
            None => format!("[{}] {}", index + 1, passage.text.trim()),
        })
        .collect::<Vec<_>>();

    if lines.is_empty() {
        return None;
    }

    Some(format!(
        "Relevant context retrieved for this conversation. Use it when it helps answer the user.\n{}",
        lines.join("\n")
    ))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use axum::{Json, Router, routing::post};
    use serde_json::{Value, json};

    use super::{HttpRetriever, Passage, RetrievalAdapter, Retriever};

    struct FailingRetriever;

    #[async_trait]
    impl Retriever for FailingRetriever {
        async fn retrieve(
            &self,
            _query: &str,
            _namespace: Option<&str>,
            _top_k: usize,
        ) -> anyhow::Result<Vec<Passage>> {
            anyhow::bail!("index unavailable")
        }
    }

    #[tokio::test]
    async fn failure_degrades_to_no_context() {
        let adapter = RetrievalAdapter::new(Some(Arc::new(FailingRetriever)), 4);
        assert!(adapter.context_block("refund policy", None).await.is_none());
        assert!(RetrievalAdapter::disabled().context_block("x", None).await.is_none());
    }

    #[tokio::test]
    async fn http_retriever_builds_numbered_context() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test listener");
        let addr = listener.local_addr().expect("local addr");
        let router = Router::new().route(
            "/search",
            post(|Json(body): Json<Value>| async move {
                assert_eq!(body["namespace"], "docs");
                assert_eq!(body["topK"], 2);
                Json(json!({
                    "passages": [
                        { "text": "Refunds take 5 days.", "score": 0.9, "source": "faq.md" },
                        { "text": "   ", "score": 0.5 },
                        { "text": "Contact billing@example.com.", "score": 0.4 }
                    ]
                }))
            }),
        );
        tokio::spawn(async move {
            axum::serve(listener, router).await.expect("test server");
        });

        let adapter = RetrievalAdapter::new(
            Some(Arc::new(HttpRetriever::new(format!("http://{addr}/search")))),
            2,
        );
        let block = adapter
            .context_block("refund policy", Some("docs"))
            .await
            .expect("context block");

        assert!(block.contains("[1] Refunds take 5 days. (source: faq.md)"));
        assert!(block.contains("[2] Contact billing@example.com."));
    }
}
