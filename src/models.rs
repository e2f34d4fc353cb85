use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";
pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    pub mime_type: String,
    pub data: String,
}

impl InlineData {
    pub fn to_data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.data)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Part {
    Text {
        text: String,
    },
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: InlineData,
    },
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text { text: text.into() }
    }

    pub fn image(mime_type: impl Into<String>, data: impl Into<String>) -> Self {
        Part::InlineData { inline_data: InlineData { mime_type: mime_type.into(), data: data.into() } }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: String,
    pub parts: Vec<Part>,
}

impl Turn {
    pub fn user(parts: Vec<Part>) -> Self {
        Self { role: "user".into(), parts }
    }

    pub fn model(parts: Vec<Part>) -> Self {
        Self { role: "model".into(), parts }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub contents: Vec<Turn>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub text: Option<String>,
    pub parts: Vec<Part>,
}

impl GenerateResponse {
    /// The last inline image among the response parts.
    pub fn last_image(&self) -> Option<&InlineData> {
        self.parts.iter().rev().find_map(|p| match p {
            Part::InlineData { inline_data } => Some(inline_data),
            Part::Text { .. } => None,
        })
    }
}

#[async_trait]
pub trait GenerativeModel: Send + Sync {
    async fn generate(&self, req: GenerateRequest) -> anyhow::Result<GenerateResponse>;
}

/// One conversation with the model. Clones share the same turn log, so a
/// request that outlives its owner still records its turns here.
#[derive(Debug, Clone)]
pub struct ChatHandle {
    pub id: Uuid,
    turns: Arc<Mutex<Vec<Turn>>>,
}

impl Default for ChatHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatHandle {
    pub fn new() -> Self {
        Self { id: Uuid::new_v4(), turns: Arc::new(Mutex::new(Vec::new())) }
    }

    pub async fn turn_count(&self) -> usize {
        self.turns.lock().await.len()
    }

    pub async fn send(&self, model: &dyn GenerativeModel, parts: Vec<Part>) -> anyhow::Result<GenerateResponse> {
        let mut contents = self.turns.lock().await.clone();
        contents.push(Turn::user(parts.clone()));
        let resp = model.generate(GenerateRequest { contents }).await?;
        if !resp.parts.is_empty() {
            let mut turns = self.turns.lock().await;
            turns.push(Turn::user(parts));
            turns.push(Turn::model(resp.parts.clone()));
        }
        Ok(resp)
    }
}

#[derive(Clone)]
pub struct GeminiModel {
    client: reqwest::Client,
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
}

impl GeminiModel {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>, model: impl Into<String>) -> Self {
        Self { client: reqwest::Client::new(), base_url: base_url.into(), api_key, model: model.into() }
    }

    fn endpoint(&self) -> anyhow::Result<url::Url> {
        let raw = format!("{}/{}:generateContent", self.base_url.trim_end_matches('/'), self.model);
        Ok(url::Url::parse(&raw)?)
    }
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    candidates: Vec<WireCandidate>,
}

#[derive(Debug, Deserialize)]
struct WireCandidate {
    content: Option<WireContent>,
}

#[derive(Debug, Deserialize)]
struct WireContent {
    #[serde(default)]
    parts: Vec<WirePart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePart {
    text: Option<String>,
    inline_data: Option<InlineData>,
}

#[derive(Debug, Deserialize)]
struct WireErrorWrapper {
    error: WireErrorBody,
}

#[derive(Debug, Deserialize)]
struct WireErrorBody {
    message: Option<String>,
}

fn into_response(wire: WireResponse) -> GenerateResponse {
    let wire_parts = wire
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .map(|c| c.parts)
        .unwrap_or_default();

    let mut text = String::new();
    let mut parts = Vec::new();
    for p in wire_parts {
        if let Some(t) = p.text {
            text.push_str(&t);
            parts.push(Part::Text { text: t });
        }
        if let Some(inline_data) = p.inline_data {
            parts.push(Part::InlineData { inline_data });
        }
    }
    GenerateResponse { text: (!text.is_empty()).then_some(text), parts }
}

fn error_message(status: reqwest::StatusCode, body: &str) -> String {
    serde_json::from_str::<WireErrorWrapper>(body)
        .ok()
        .and_then(|w| w.error.message)
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| format!("model call failed: {status}"))
}

#[async_trait]
impl GenerativeModel for GeminiModel {
    async fn generate(&self, req: GenerateRequest) -> anyhow::Result<GenerateResponse> {
        let mut rb = self.client.post(self.endpoint()?).json(&req);
        if let Some(key) = &self.api_key {
            rb = rb.header("x-goog-api-key", key);
        }
        let resp = rb.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!(error_message(status, &body));
        }
        let wire: WireResponse = resp.json().await?;
        Ok(into_response(wire))
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Notify;

    /// Replays queued outcomes in order and records every request it sees.
    #[derive(Default)]
    pub struct ScriptedModel {
        outcomes: StdMutex<VecDeque<Result<GenerateResponse, String>>>,
        pub requests: StdMutex<Vec<GenerateRequest>>,
        gate: Option<Arc<Notify>>,
    }

    impl ScriptedModel {
        pub fn new(outcomes: Vec<Result<GenerateResponse, String>>) -> Self {
            Self { outcomes: StdMutex::new(outcomes.into()), ..Default::default() }
        }

        /// Holds every call until the returned `Notify` is signalled.
        pub fn gated(outcomes: Vec<Result<GenerateResponse, String>>) -> (Self, Arc<Notify>) {
            let gate = Arc::new(Notify::new());
            let model = Self { gate: Some(gate.clone()), ..Self::new(outcomes) };
            (model, gate)
        }

        pub fn request_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    pub fn image_response(mime: &str, data: &str) -> GenerateResponse {
        GenerateResponse { text: None, parts: vec![Part::image(mime, data)] }
    }

    pub fn text_response(text: &str) -> GenerateResponse {
        GenerateResponse { text: Some(text.into()), parts: vec![Part::text(text)] }
    }

    #[async_trait]
    impl GenerativeModel for ScriptedModel {
        async fn generate(&self, req: GenerateRequest) -> anyhow::Result<GenerateResponse> {
            self.requests.lock().unwrap().push(req);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            let next = self.outcomes.lock().unwrap().pop_front();
            match next {
                Some(Ok(resp)) => Ok(resp),
                Some(Err(msg)) => Err(anyhow::anyhow!(msg)),
                None => Ok(GenerateResponse::default()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use axum::{extract::Path, http::StatusCode, routing::post, Json, Router};

    async fn spawn(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/v1beta/models", addr)
    }

    #[test]
    fn parts_use_gemini_wire_names() {
        let v = serde_json::to_value(vec![Part::image("image/png", "AA"), Part::text("hi")]).unwrap();
        assert_eq!(v[0]["inlineData"]["mimeType"], "image/png");
        assert_eq!(v[1]["text"], "hi");
    }

    #[test]
    fn last_image_wins() {
        let resp = GenerateResponse {
            text: None,
            parts: vec![Part::image("image/png", "first"), Part::text("x"), Part::image("image/jpeg", "second")],
        };
        assert_eq!(resp.last_image().unwrap().to_data_url(), "data:image/jpeg;base64,second");
    }

    #[tokio::test]
    async fn gemini_parses_text_and_inline_images() {
        let app = Router::new().route(
            "/v1beta/models/:call",
            post(|Path(call): Path<String>, Json(body): Json<serde_json::Value>| async move {
                assert_eq!(call, "test-model:generateContent");
                assert_eq!(body["contents"][0]["role"], "user");
                Json(serde_json::json!({
                    "candidates": [{ "content": { "parts": [
                        { "text": "Here you go. " },
                        { "inlineData": { "mimeType": "image/png", "data": "QUJD" } },
                        { "text": "Enjoy!" }
                    ]}}]
                }))
            }),
        );
        let base = spawn(app).await;
        let model = GeminiModel::new(base, Some("k".into()), "test-model");
        let resp = model.generate(GenerateRequest { contents: vec![Turn::user(vec![Part::text("draw")])] }).await.unwrap();
        assert_eq!(resp.text.as_deref(), Some("Here you go. Enjoy!"));
        assert_eq!(resp.last_image().unwrap().data, "QUJD");
    }

    #[tokio::test]
    async fn gemini_surfaces_api_error_message() {
        let app = Router::new().route(
            "/v1beta/models/:call",
            post(|| async {
                (StatusCode::TOO_MANY_REQUESTS, Json(serde_json::json!({ "error": { "code": 429, "message": "rate limited" } })))
            }),
        );
        let base = spawn(app).await;
        let model = GeminiModel::new(base, None, "m");
        let err = model.generate(GenerateRequest::default()).await.unwrap_err();
        assert_eq!(err.to_string(), "rate limited");
    }

    #[tokio::test]
    async fn chat_handle_carries_previous_turns() {
        let model = ScriptedModel::new(vec![Ok(text_response("one")), Err("boom".into()), Ok(text_response("two"))]);
        let chat = ChatHandle::new();
        chat.send(&model, vec![Part::text("a")]).await.unwrap();
        assert!(chat.send(&model, vec![Part::text("b")]).await.is_err());
        chat.send(&model, vec![Part::text("c")]).await.unwrap();

        let requests = model.requests.lock().unwrap();
        assert_eq!(requests[0].contents.len(), 1);
        // failed turn is not recorded
        assert_eq!(requests[2].contents.len(), 3);
        assert_eq!(requests[2].contents[1].role, "model");
        drop(requests);
        assert_eq!(chat.turn_count().await, 4);
    }
}
