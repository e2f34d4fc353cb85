use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::{routing::{delete, get, post}, Json, Router};
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tracing::{info, warn};

use crate::attachment::{guess_mime, AddReport, FileSource, RawFile};
use crate::conversation::SubmitError;
use crate::export::{project_archive, ARCHIVE_NAME};
use crate::preferences::{Preferences, PreferencesPatch, UserProfile, UserProfilePatch};
use crate::prompt::AspectRatio;
use crate::session::{ItemId, Session, SessionId};
use crate::studio::{ComposePatch, Studio, Submitted};

#[derive(Clone)]
pub struct AppState {
    pub studio: Studio,
    pub metrics: Option<PrometheusHandle>,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorBody>);

fn api_error(status: StatusCode, message: impl ToString) -> ApiError {
    (status, Json(ErrorBody { error: message.to_string() }))
}

impl From<SubmitError> for ApiError {
    fn from(e: SubmitError) -> Self {
        api_error(StatusCode::BAD_REQUEST, e)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub history_len: usize,
}

impl From<&Session> for SessionSummary {
    fn from(s: &Session) -> Self {
        Self { id: s.id, title: s.title.clone(), created_at: s.created_at, history_len: s.history.len() }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListSessionsResponse {
    pub sessions: Vec<SessionSummary>,
    pub active_id: Option<SessionId>,
}

async fn list_sessions(State(state): State<AppState>) -> Json<ListSessionsResponse> {
    let store = state.studio.read().await;
    Json(ListSessionsResponse {
        sessions: store.sessions().iter().map(SessionSummary::from).collect(),
        active_id: store.active_id(),
    })
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateSessionResponse {
    pub id: SessionId,
}

async fn create_session(State(state): State<AppState>) -> (StatusCode, Json<CreateSessionResponse>) {
    let id = state.studio.create_session().await;
    (StatusCode::CREATED, Json(CreateSessionResponse { id }))
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Session>, StatusCode> {
    let store = state.studio.read().await;
    store.session(SessionId(id)).cloned().map(Json).ok_or(StatusCode::NOT_FOUND)
}

async fn delete_session(State(state): State<AppState>, Path(id): Path<i64>) -> StatusCode {
    if state.studio.delete_session(SessionId(id)).await {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn select_session(State(state): State<AppState>, Path(id): Path<i64>) -> StatusCode {
    let id = SessionId(id);
    if state.studio.read().await.session(id).is_none() {
        return StatusCode::NOT_FOUND;
    }
    state.studio.select_session(id).await;
    StatusCode::NO_CONTENT
}

async fn delete_item(State(state): State<AppState>, Path((id, item_id)): Path<(i64, i64)>) -> StatusCode {
    if state.studio.delete_item(SessionId(id), ItemId(item_id)).await {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AttachmentView {
    pub file_name: String,
    pub mime_type: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ComposeView {
    pub text: String,
    pub aspect_ratio: AspectRatio,
    pub aspect_menu_open: bool,
    pub attachments: Vec<AttachmentView>,
    pub has_chat: bool,
}

async fn compose_view(studio: &Studio) -> ComposeView {
    let store = studio.read().await;
    let c = store.compose();
    ComposeView {
        text: c.text.clone(),
        aspect_ratio: c.aspect_ratio,
        aspect_menu_open: c.aspect_menu_open,
        attachments: c
            .attachments
            .images()
            .iter()
            .map(|img| AttachmentView { file_name: img.file_name.clone(), mime_type: img.mime_type.clone() })
            .collect(),
        has_chat: c.chat.is_some(),
    }
}

async fn get_compose(State(state): State<AppState>) -> Json<ComposeView> {
    Json(compose_view(&state.studio).await)
}

#[derive(Debug, Default, Deserialize)]
pub struct ComposePatchBody {
    pub text: Option<String>,
    pub aspect_ratio: Option<AspectRatio>,
    pub aspect_menu_open: Option<bool>,
}

async fn patch_compose(State(state): State<AppState>, Json(body): Json<ComposePatchBody>) -> Json<ComposeView> {
    state
        .studio
        .update_compose(ComposePatch { text: body.text, aspect_ratio: body.aspect_ratio, aspect_menu_open: body.aspect_menu_open })
        .await;
    Json(compose_view(&state.studio).await)
}

/// An uploaded file: `data` is either a `data:` URL or bare base64.
#[derive(Debug, Deserialize)]
pub struct UploadFile {
    pub name: String,
    pub mime_type: Option<String>,
    pub data: String,
}

impl From<UploadFile> for RawFile {
    fn from(f: UploadFile) -> Self {
        if let Some(raw) = RawFile::from_data_url(f.name.clone(), &f.data) {
            return raw;
        }
        let mime_type = f.mime_type.unwrap_or_else(|| guess_mime(std::path::Path::new(&f.name)));
        RawFile { name: f.name, mime_type, source: FileSource::Base64(f.data) }
    }
}

#[derive(Debug, Deserialize)]
pub struct AttachBody {
    pub files: Vec<UploadFile>,
}

async fn add_attachments(State(state): State<AppState>, Json(body): Json<AttachBody>) -> Json<AddReport> {
    let files = body.files.into_iter().map(RawFile::from).collect();
    Json(state.studio.attach(files).await)
}

async fn remove_attachment(State(state): State<AppState>, Path(index): Path<usize>) -> StatusCode {
    if state.studio.remove_attachment(index).await {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn submit(State(state): State<AppState>) -> Result<(StatusCode, Json<Submitted>), ApiError> {
    let ids = state.studio.submit().await?;
    Ok((StatusCode::ACCEPTED, Json(ids)))
}

#[derive(Debug, Deserialize)]
pub struct VariationBody {
    pub prompt: String,
    pub image_url: String,
}

async fn create_variation(
    State(state): State<AppState>,
    Json(body): Json<VariationBody>,
) -> Result<(StatusCode, Json<Submitted>), ApiError> {
    let ids = state.studio.create_variation(&body.prompt, &body.image_url).await?;
    Ok((StatusCode::ACCEPTED, Json(ids)))
}

async fn get_preferences(State(state): State<AppState>) -> Json<Preferences> {
    Json(state.studio.preferences().await)
}

async fn patch_preferences(State(state): State<AppState>, Json(patch): Json<PreferencesPatch>) -> Json<Preferences> {
    Json(state.studio.update_preferences(patch).await)
}

async fn get_profile(State(state): State<AppState>) -> Result<Json<UserProfile>, StatusCode> {
    state.studio.profile().await.map(Json).ok_or(StatusCode::NOT_FOUND)
}

async fn put_profile(State(state): State<AppState>, Json(profile): Json<UserProfile>) -> Result<Json<UserProfile>, ApiError> {
    let saved = state
        .studio
        .save_profile(profile)
        .await
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e))?;
    Ok(Json(saved))
}

async fn patch_profile(State(state): State<AppState>, Json(patch): Json<UserProfilePatch>) -> Result<Json<UserProfile>, ApiError> {
    match state.studio.update_profile(patch).await {
        Ok(Some(profile)) => Ok(Json(profile)),
        Ok(None) => Err(api_error(StatusCode::NOT_FOUND, "no user profile")),
        Err(e) => Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, e)),
    }
}

async fn delete_profile(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    state
        .studio
        .clear_profile()
        .await
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn export_project() -> Result<impl IntoResponse, ApiError> {
    let bytes = project_archive().map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e))?;
    let disposition = format!("attachment; filename=\"{ARCHIVE_NAME}\"");
    Ok(([(header::CONTENT_TYPE, "application/zip".to_string()), (header::CONTENT_DISPOSITION, disposition)], bytes))
}

async fn render_metrics(State(state): State<AppState>) -> Result<String, StatusCode> {
    state.metrics.as_ref().map(|h| h.render()).ok_or(StatusCode::NOT_FOUND)
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/sessions", post(create_session).get(list_sessions))
        .route("/v1/sessions/:id", get(get_session).delete(delete_session))
        .route("/v1/sessions/:id/select", post(select_session))
        .route("/v1/sessions/:id/items/:item_id", delete(delete_item))
        .route("/v1/compose", get(get_compose).patch(patch_compose))
        .route("/v1/compose/attachments", post(add_attachments))
        .route("/v1/compose/attachments/:index", delete(remove_attachment))
        .route("/v1/submit", post(submit))
        .route("/v1/variations", post(create_variation))
        .route("/v1/preferences", get(get_preferences).patch(patch_preferences))
        .route("/v1/profile", get(get_profile).put(put_profile).patch(patch_profile).delete(delete_profile))
        .route("/v1/export", get(export_project))
        .route("/metrics", get(render_metrics))
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for shutdown signal");
            }
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::testing::{image_response, ScriptedModel};
    use crate::storage::MemoryKeyValueStore;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration;

    async fn spawn(model: ScriptedModel) -> String {
        let studio = Studio::load(Arc::new(MemoryKeyValueStore::default()), Arc::new(model)).await;
        let app = router(AppState { studio, metrics: None });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn session_lifecycle_over_http() {
        let base = spawn(ScriptedModel::default()).await;
        let client = reqwest::Client::new();

        let list: ListSessionsResponse = client.get(format!("{base}/v1/sessions")).send().await.unwrap().json().await.unwrap();
        assert_eq!(list.sessions.len(), 1);
        let first = list.sessions[0].id;

        let resp = client.post(format!("{base}/v1/sessions")).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let created: CreateSessionResponse = resp.json().await.unwrap();

        let list: ListSessionsResponse = client.get(format!("{base}/v1/sessions")).send().await.unwrap().json().await.unwrap();
        assert_eq!(list.sessions[0].id, created.id);
        assert_eq!(list.active_id, Some(created.id));

        let resp = client.post(format!("{base}/v1/sessions/{first}/select")).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        let resp = client.post(format!("{base}/v1/sessions/42/select")).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = client.delete(format!("{base}/v1/sessions/{first}")).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        let list: ListSessionsResponse = client.get(format!("{base}/v1/sessions")).send().await.unwrap().json().await.unwrap();
        assert_eq!(list.sessions.len(), 1);
        assert_eq!(list.active_id, Some(created.id));

        let resp = client.get(format!("{base}/v1/sessions/{first}")).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn compose_submit_and_poll_reply() {
        let base = spawn(ScriptedModel::new(vec![Ok(image_response("image/png", "QUJD"))])).await;
        let client = reqwest::Client::new();

        let resp = client.post(format!("{base}/v1/submit")).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let view: ComposeView = client
            .patch(format!("{base}/v1/compose"))
            .json(&json!({ "text": "a red bicycle", "aspect_ratio": "landscape", "aspect_menu_open": true }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(view.aspect_ratio, AspectRatio::Landscape);
        assert!(view.aspect_menu_open);

        let resp = client.post(format!("{base}/v1/submit")).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let ids: Value = resp.json().await.unwrap();
        let sid = ids["session_id"].as_i64().unwrap();

        let mut session = Value::Null;
        for _ in 0..100 {
            session = client.get(format!("{base}/v1/sessions/{sid}")).send().await.unwrap().json().await.unwrap();
            if session["history"][1]["reply"]["status"] == "answered" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(session["title"], "a red bicycle");
        assert_eq!(session["history"].as_array().unwrap().len(), 2);
        assert_eq!(session["history"][1]["reply"]["image_url"], "data:image/png;base64,QUJD");

        let view: ComposeView = client.get(format!("{base}/v1/compose")).send().await.unwrap().json().await.unwrap();
        assert!(view.text.is_empty());
        assert!(!view.aspect_menu_open);
        assert_eq!(view.aspect_ratio, AspectRatio::Landscape);
    }

    #[tokio::test]
    async fn attachments_are_capped_and_filtered() {
        let base = spawn(ScriptedModel::default()).await;
        let client = reqwest::Client::new();
        let mut files: Vec<Value> = (0..6)
            .map(|i| json!({ "name": format!("{i}.png"), "data": "data:image/png;base64,QUJD" }))
            .collect();
        files.insert(0, json!({ "name": "notes.txt", "mime_type": "text/plain", "data": "aGVsbG8=" }));

        let report: Value = client
            .post(format!("{base}/v1/compose/attachments"))
            .json(&json!({ "files": files }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(report["accepted"], 4);
        assert_eq!(report["rejected_non_image"], 1);
        assert_eq!(report["dropped_over_quota"], 2);

        let resp = client.delete(format!("{base}/v1/compose/attachments/9")).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let resp = client.delete(format!("{base}/v1/compose/attachments/0")).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        let view: ComposeView = client.get(format!("{base}/v1/compose")).send().await.unwrap().json().await.unwrap();
        assert_eq!(view.attachments.len(), 3);
        assert_eq!(view.attachments[0].file_name, "1.png");
    }

    #[tokio::test]
    async fn variation_with_bad_image_is_rejected() {
        let base = spawn(ScriptedModel::default()).await;
        let client = reqwest::Client::new();
        let resp = client
            .post(format!("{base}/v1/variations"))
            .json(&json!({ "prompt": "x", "image_url": "not a data url" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: Value = resp.json().await.unwrap();
        assert!(body["error"].as_str().unwrap().contains("not a base64 data URL"));
    }

    #[tokio::test]
    async fn preferences_and_profile_endpoints() {
        let base = spawn(ScriptedModel::default()).await;
        let client = reqwest::Client::new();

        let prefs: Preferences = client
            .patch(format!("{base}/v1/preferences"))
            .json(&json!({ "sidebar_open": false, "theme_id": "aurora" }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(!prefs.sidebar_open);
        assert_eq!(prefs.theme_id, "aurora");

        let resp = client.get(format!("{base}/v1/profile")).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let resp = client
            .put(format!("{base}/v1/profile"))
            .json(&json!({ "first_name": "Ada", "last_name": "L", "email": "ada@example.com" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let profile: UserProfile = client
            .patch(format!("{base}/v1/profile"))
            .json(&json!({ "last_name": "Lovelace" }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(profile.last_name, "Lovelace");
        let resp = client.delete(format!("{base}/v1/profile")).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn export_returns_zip() {
        let base = spawn(ScriptedModel::default()).await;
        let resp = reqwest::get(format!("{base}/v1/export")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "application/zip");
        let bytes = resp.bytes().await.unwrap();
        assert_eq!(&bytes[..2], b"PK");
    }
}
