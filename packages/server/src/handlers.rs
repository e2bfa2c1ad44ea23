//! HTTP handler functions for the chatgraph API.

use actix_web::sse::{Data, Event, Sse};
use actix_web::{web, HttpRequest, HttpResponse, Responder as _};
use chatgraph_orchestrator::{MessageRequest, OrchestratorError};
use chatgraph_server_models::{
    AgentsQuery, ApiAgents, ApiError, ApiModels, ApiSettings, ApiUser, CreateConversationRequest,
    EvaluationRequest, PostMessageRequest,
};
use chatgraph_store_models::{ConversationUpdate, MessageEvaluation};
use futures::StreamExt as _;
use tokio_util::sync::CancellationToken;

use crate::AppState;

const ANONYMOUS_USER: &str = "anonymous";
const USER_HEADER: &str = "x-user-client-id";

/// Resolves the requesting user's client id from the `X-User-Client-Id`
/// header. Parsing the authentication that populates this header is
/// someone else's concern; this just reads the already-authenticated value,
/// falling back to a fixed anonymous id when it's absent.
fn user_client_id(req: &HttpRequest) -> String {
    req.headers()
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .unwrap_or(ANONYMOUS_USER)
        .to_string()
}

/// `GET /api/user`
pub async fn user(req: HttpRequest) -> HttpResponse {
    let user_client_id = user_client_id(&req);
    let is_authenticated = user_client_id != ANONYMOUS_USER;
    HttpResponse::Ok().json(ApiUser {
        user_id: user_client_id.clone(),
        user_name: user_client_id,
        first_name: None,
        principal_name: None,
        is_authenticated,
        mode: if is_authenticated { "authenticated" } else { "anonymous" }.to_string(),
    })
}

/// `GET /api/models`
pub async fn models(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(ApiModels {
        models: state.models.clone(),
    })
}

/// `GET /api/agents?react_mode=`
pub async fn agents(state: web::Data<AppState>, query: web::Query<AgentsQuery>) -> HttpResponse {
    let agents = if query.react_mode {
        state.dynamic_agent_keys.clone()
    } else {
        state.triage_agent_keys.clone()
    };
    HttpResponse::Ok().json(ApiAgents { agents })
}

/// `GET /api/settings`
pub async fn settings(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(ApiSettings {
        show_func_result: state.show_func_result,
    })
}

/// `GET /api/conversations`
pub async fn list_conversations(state: web::Data<AppState>, req: HttpRequest) -> HttpResponse {
    let user_client_id = user_client_id(&req);
    match state.store.list_conversations(&user_client_id).await {
        Ok(conversations) => HttpResponse::Ok().json(conversations),
        Err(e) => {
            log::error!("Failed to list conversations: {e}");
            HttpResponse::InternalServerError().json(ApiError::new("failed to list conversations"))
        }
    }
}

/// `POST /api/conversations`
pub async fn create_conversation(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Json<CreateConversationRequest>,
) -> HttpResponse {
    let user_client_id = user_client_id(&req);
    match state
        .store
        .create_conversation(&user_client_id, &body.model)
        .await
    {
        Ok(meta) => HttpResponse::Ok().json(meta),
        Err(e) => {
            log::error!("Failed to create conversation: {e}");
            HttpResponse::InternalServerError()
                .json(ApiError::new("failed to create conversation"))
        }
    }
}

/// `GET /api/conversations/{id}`
pub async fn get_conversation(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<String>,
) -> HttpResponse {
    let user_client_id = user_client_id(&req);
    let conversation_id = path.into_inner();
    match state
        .store
        .get_conversation(&user_client_id, &conversation_id)
        .await
    {
        Ok(Some(detail)) => HttpResponse::Ok().json(detail),
        Ok(None) => HttpResponse::NotFound().json(ApiError::new("conversation not found")),
        Err(e) => {
            log::error!("Failed to fetch conversation {conversation_id}: {e}");
            HttpResponse::InternalServerError().json(ApiError::new("failed to fetch conversation"))
        }
    }
}

/// `PUT /api/conversations/{id}`
pub async fn update_conversation(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<String>,
    body: web::Json<ConversationUpdate>,
) -> HttpResponse {
    let user_client_id = user_client_id(&req);
    let conversation_id = path.into_inner();
    match state
        .store
        .update_conversation(&user_client_id, &conversation_id, body.into_inner())
        .await
    {
        Ok(Some(meta)) => HttpResponse::Ok().json(meta),
        Ok(None) => HttpResponse::NotFound().json(ApiError::new("conversation not found")),
        Err(e) => {
            log::error!("Failed to update conversation {conversation_id}: {e}");
            HttpResponse::InternalServerError()
                .json(ApiError::new("failed to update conversation"))
        }
    }
}

/// `DELETE /api/conversations/{id}`
pub async fn delete_conversation(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<String>,
) -> HttpResponse {
    let user_client_id = user_client_id(&req);
    let conversation_id = path.into_inner();
    match state
        .store
        .delete_conversation(&user_client_id, &conversation_id)
        .await
    {
        Ok(true) => HttpResponse::NoContent().finish(),
        Ok(false) => HttpResponse::NotFound().json(ApiError::new("conversation not found")),
        Err(e) => {
            log::error!("Failed to delete conversation {conversation_id}: {e}");
            HttpResponse::InternalServerError()
                .json(ApiError::new("failed to delete conversation"))
        }
    }
}

/// A token held by the live SSE stream. Its `Drop` fires when actix drops
/// the response body — client disconnect, slow consumer kicked, or normal
/// completion — cancelling the workflow task per §5's disconnect chain.
struct CancelGuard(CancellationToken);

impl Drop for CancelGuard {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// `POST /api/conversations/{id}/messages`
///
/// Validates eagerly (conversation existence, workflow buildability) before
/// the stream starts, so those failures become HTTP 404/500; once the
/// stream is live, failures become `WireEvent` error records per §7.
pub async fn post_message(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<String>,
    body: web::Json<PostMessageRequest>,
) -> HttpResponse {
    let user_client_id = user_client_id(&req);
    let conversation_id = path.into_inner();
    let body = body.into_inner();

    let request = MessageRequest {
        message: body.message,
        react_mode: body.react_mode,
        workflow_model: body.workflow_model,
        agent_model_mapping: body.agent_model_mapping,
        memory_enabled: body.memory_enabled,
    };

    let cancel = CancellationToken::new();

    let events = match state
        .orchestrator
        .handle_message(user_client_id, conversation_id, request, cancel.clone())
        .await
    {
        Ok(events) => events,
        Err(OrchestratorError::NotFound(_)) => {
            return HttpResponse::NotFound().json(ApiError::new("conversation not found"));
        }
        Err(e) => {
            log::error!("Failed to start message stream: {e}");
            return HttpResponse::InternalServerError()
                .json(ApiError::new("failed to start message stream"));
        }
    };

    let stream = async_stream::stream! {
        let _cancel_guard = CancelGuard(cancel);
        let mut events = events;
        while let Some(event) = events.next().await {
            let data = serde_json::to_string(&event.data).unwrap_or_default();
            yield Ok::<_, std::convert::Infallible>(
                Event::Data(Data::new(data).event(event.event)),
            );
        }
    };

    Sse::from_stream(stream).respond_to(&req)
}

/// `PATCH /api/conversations/{id}/messages/{seq}/evaluation`
pub async fn set_evaluation(
    state: web::Data<AppState>,
    path: web::Path<(String, i64)>,
    body: web::Json<EvaluationRequest>,
) -> HttpResponse {
    let (conversation_id, sequence_number) = path.into_inner();
    let evaluation = MessageEvaluation {
        is_satisfy: body.is_satisfy,
        comment: body.comment.clone(),
    };
    match state
        .store
        .set_evaluation(&conversation_id, sequence_number, Some(evaluation))
        .await
    {
        Ok(true) => HttpResponse::NoContent().finish(),
        Ok(false) => HttpResponse::NotFound().json(ApiError::new("message not found")),
        Err(e) => {
            log::error!("Failed to set evaluation on {conversation_id}#{sequence_number}: {e}");
            HttpResponse::InternalServerError().json(ApiError::new("failed to set evaluation"))
        }
    }
}

/// `PATCH /api/conversations/{id}/messages/{seq}/evaluation/clear`
pub async fn clear_evaluation(
    state: web::Data<AppState>,
    path: web::Path<(String, i64)>,
) -> HttpResponse {
    let (conversation_id, sequence_number) = path.into_inner();
    match state
        .store
        .set_evaluation(&conversation_id, sequence_number, None)
        .await
    {
        Ok(true) => HttpResponse::NoContent().finish(),
        Ok(false) => HttpResponse::NotFound().json(ApiError::new("message not found")),
        Err(e) => {
            log::error!("Failed to clear evaluation on {conversation_id}#{sequence_number}: {e}");
            HttpResponse::InternalServerError().json(ApiError::new("failed to clear evaluation"))
        }
    }
}
