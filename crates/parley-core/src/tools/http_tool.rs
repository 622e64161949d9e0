use reqwest::{Client, Method};
use serde::Serialize;
use serde_json::Value;

use crate::types::{ExternalToolRecord, ToolContext};

const ERROR_BODY_MAX_CHARS: usize = 300;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ExternalToolPayload<'a> {
    org_id: Option<&'a str>,
    user_id: &'a str,
    conversation_id: Option<&'a str>,
    args: &'a Value,
}

/// Calls org-defined tools over HTTP.
#[derive(Debug, Clone, Default)]
pub struct HttpToolClient {
    client: Client,
}

impl HttpToolClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Sends `{ orgId, userId, conversationId, args }` and returns the 2xx
    /// body as JSON, or as a string when it is not JSON. Non-2xx is an error.
    pub async fn call(
        &self,
        tool: &ExternalToolRecord,
        args: &Value,
        ctx: &ToolContext,
    ) -> anyhow::Result<Value> {
        let method = Method::from_bytes(tool.method.trim().to_ascii_uppercase().as_bytes())
            .unwrap_or(Method::POST);
        let payload = ExternalToolPayload {
            org_id: ctx.org_id.as_deref(),
            user_id: &ctx.user_id,
            conversation_id: ctx.conversation_id.as_deref(),
            args,
        };

        let mut builder = self.client.request(method, &tool.url).json(&payload);
        for (name, value) in &tool.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            anyhow::bail!(
                "external tool returned HTTP {}: {}",
                status.as_u16(),
                truncate(&body, ERROR_BODY_MAX_CHARS)
            );
        }

        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&body).unwrap_or(Value::String(body)))
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    let mut chars = text.chars();
    let mut truncated = chars.by_ref().take(max_chars).collect::<String>();
    if chars.next().is_some() {
        truncated.push_str("...");
    }
    truncated
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use axum::{Json, Router, http::HeaderMap, http::StatusCode, routing::post};
    use serde_json::{Value, json};

    use crate::types::{ExternalToolRecord, ToolContext};

    use super::HttpToolClient;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test listener");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            axum::serve(listener, router).await.expect("test server");
        });
        format!("http://{addr}")
    }

    fn record(url: String) -> ExternalToolRecord {
        ExternalToolRecord {
            id: "tool-1".to_owned(),
            org_id: "org-1".to_owned(),
            name: "crm.lookup".to_owned(),
            description: "Looks up a customer.".to_owned(),
            parameters: json!({}),
            method: "post".to_owned(),
            url,
            headers: BTreeMap::from([("X-Api-Key".to_owned(), "secret".to_owned())]),
            enabled: true,
        }
    }

    fn ctx() -> ToolContext {
        ToolContext {
            user_id: "user-1".to_owned(),
            org_id: Some("org-1".to_owned()),
            conversation_id: Some("conv-1".to_owned()),
        }
    }

    #[tokio::test]
    async fn posts_envelope_with_static_headers() {
        let router = Router::new().route(
            "/lookup",
            post(|headers: HeaderMap, Json(body): Json<Value>| async move {
                Json(json!({
                    "apiKey": headers.get("x-api-key").and_then(|value| value.to_str().ok()),
                    "received": body,
                }))
            }),
        );
        let base = serve(router).await;

        let result = HttpToolClient::default()
            .call(&record(format!("{base}/lookup")), &json!({ "id": 7 }), &ctx())
            .await
            .expect("call succeeds");

        assert_eq!(result["apiKey"], "secret");
        assert_eq!(
            result["received"],
            json!({ "orgId": "org-1", "userId": "user-1", "conversationId": "conv-1", "args": { "id": 7 } })
        );
    }

    #[tokio::test]
    async fn plain_text_body_is_returned_as_string() {
        let router = Router::new().route("/text", post(|| async { "customer is active" }));
        let base = serve(router).await;

        let result = HttpToolClient::default()
            .call(&record(format!("{base}/text")), &json!({}), &ctx())
            .await
            .expect("call succeeds");

        assert_eq!(result, json!("customer is active"));
    }

    #[tokio::test]
    async fn non_success_status_is_a_failure() {
        let router = Router::new().route(
            "/broken",
            post(|| async { (StatusCode::BAD_GATEWAY, "upstream down") }),
        );
        let base = serve(router).await;

        let error = HttpToolClient::default()
            .call(&record(format!("{base}/broken")), &json!({}), &ctx())
            .await
            .expect_err("502 must fail");

        assert!(error.to_string().contains("HTTP 502"));
        assert!(error.to_string().contains("upstream down"));
    }
}
