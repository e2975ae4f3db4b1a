//! HTTP route handlers for the conversation API.

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use prompter::RequestError;
use prompter::core::answers::QuestionAnswer;
use prompter::core::response::NormalizedQuestion;
use prompter::core::timeline::TimelineItem;
use prompter::core::types::{Conversation, ConversationSummary};
use prompter::dispatch::StatusReport;
use prompter::provisioning::ProvisioningEntry;
use prompter::service::{PublishOutcome, SendOutcome};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::error;

use crate::state::AppState;

/// Build the API router.
pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route(
            "/conversations",
            get(list_conversations).post(create_conversation),
        )
        .route(
            "/conversations/{id}",
            get(get_conversation).delete(delete_conversation),
        )
        .route("/conversations/{id}/messages", post(send_message))
        .route("/conversations/{id}/status", get(poll_status))
        .route("/conversations/{id}/retry", post(retry_provisioning))
        .route("/conversations/{id}/publish", post(publish))
}

/// Maps [`RequestError`] to 4xx/502; anything else is logged and becomes a 500.
pub struct ApiError(anyhow::Error);

impl<E: Into<anyhow::Error>> From<E> for ApiError {
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self.0.downcast_ref::<RequestError>() {
            Some(err @ RequestError::NotFound(_)) => (StatusCode::NOT_FOUND, err.to_string()),
            Some(err @ RequestError::BadRequest(_)) => (StatusCode::BAD_REQUEST, err.to_string()),
            Some(err @ RequestError::Upstream(_)) => (StatusCode::BAD_GATEWAY, err.to_string()),
            None => {
                error!(err = %format!("{:#}", self.0), "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                )
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

async fn health() -> &'static str {
    "ok"
}

#[derive(Deserialize)]
struct ListQuery {
    repo: Option<String>,
}

/// GET /api/conversations?repo= - non-deleted conversations, newest first.
async fn list_conversations(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<ConversationSummary>>> {
    let repo = query.repo.as_deref().filter(|r| !r.is_empty());
    Ok(Json(state.prompter.list_conversations(repo)?))
}

#[derive(Deserialize)]
struct CreateRequest {
    repo: String,
}

/// POST /api/conversations - start a conversation and provision its repository.
async fn create_conversation(
    State(state): State<AppState>,
    Json(body): Json<CreateRequest>,
) -> ApiResult<(StatusCode, Json<Conversation>)> {
    let conversation = state.prompter.create_conversation(&body.repo)?;
    Ok((StatusCode::CREATED, Json(conversation)))
}

#[derive(Serialize)]
struct ConversationResponse<'a> {
    conversation: &'a Conversation,
    timeline: Vec<TimelineItem<'a>>,
    provisioning: &'a ProvisioningEntry,
    questions: &'a [NormalizedQuestion],
    prompt_ready: bool,
    last_message_id: Option<i64>,
}

/// GET /api/conversations/{id} - conversation with its reconstructed timeline.
async fn get_conversation(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Response> {
    let view = state.prompter.conversation_view(id)?;
    let response = ConversationResponse {
        conversation: &view.conversation,
        timeline: view.timeline(),
        provisioning: &view.provisioning,
        questions: &view.pending.questions,
        prompt_ready: view.pending.prompt_ready,
        last_message_id: view.last_message_id(),
    };
    Ok(Json(response).into_response())
}

/// DELETE /api/conversations/{id} - soft delete.
async fn delete_conversation(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    state.prompter.delete_conversation(id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Either free text or structured answers to the pending questions.
#[derive(Deserialize)]
struct SendRequest {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    answers: Option<Vec<QuestionAnswer>>,
}

/// POST /api/conversations/{id}/messages
async fn send_message(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<SendRequest>,
) -> ApiResult<Json<SendOutcome>> {
    let outcome = match body.answers {
        Some(answers) => state.prompter.send_answers(id, &answers).await?,
        None => {
            let text = body.message.unwrap_or_default();
            state.prompter.send_message(id, &text).await?
        }
    };
    Ok(Json(outcome))
}

/// GET /api/conversations/{id}/status - poll provisioning and auto-dispatch.
async fn poll_status(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<StatusReport>> {
    Ok(Json(state.prompter.poll_status(id).await?))
}

/// POST /api/conversations/{id}/retry
async fn retry_provisioning(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<ProvisioningEntry>> {
    Ok(Json(state.prompter.retry_provisioning(id)?))
}

/// POST /api/conversations/{id}/publish
async fn publish(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<PublishOutcome>> {
    Ok(Json(state.prompter.publish(id).await?))
}
