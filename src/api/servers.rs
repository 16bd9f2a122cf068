//! Message-server routes and agent-server association management.

use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use super::AppState;
use crate::bus::Topic;
use crate::error::ApiError;
use crate::validate;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/message-server/current", get(current_server))
        .nest("/message-servers", server_collection_routes())
        .route("/agents/:agent_id/message-servers", get(list_agent_servers))
}

/// The collection router, shared by the canonical prefix and the
/// deprecated `/central-servers` and `/servers` aliases.
pub fn server_collection_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_servers).post(create_server))
        .route(
            "/:server_id/agents",
            get(list_server_agents).post(add_server_agent),
        )
        .route("/:server_id/agents/:agent_id", delete(remove_server_agent))
}

fn data_response(data: Value) -> Json<Value> {
    Json(json!({ "success": true, "data": data }))
}

pub async fn current_server(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let server = state
        .service
        .store()
        .get_server(state.service.current_server_id())?;
    Ok(data_response(json!({ "server": server })))
}

pub async fn list_servers(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let servers = state.service.store().list_servers()?;
    Ok(data_response(json!({ "servers": servers })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateServerBody {
    pub name: String,
    #[serde(default)]
    pub source_type: Option<String>,
    #[serde(default)]
    pub source_id: Option<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

pub async fn create_server(
    State(state): State<AppState>,
    Json(body): Json<CreateServerBody>,
) -> Result<Response, ApiError> {
    if body.name.trim().is_empty() {
        return Err(ApiError::new(
            crate::error::ErrorCode::MissingFields,
            "name is required",
        ));
    }
    validate::validate_metadata(body.metadata.as_ref())?;
    let server = state.service.store().create_server(
        None,
        &body.name,
        body.source_type.as_deref().unwrap_or("api"),
        body.source_id.as_deref(),
        body.metadata.as_ref(),
    )?;
    Ok((
        axum::http::StatusCode::CREATED,
        data_response(json!({ "server": server })),
    )
        .into_response())
}

pub async fn list_server_agents(
    State(state): State<AppState>,
    Path(server_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let server_id = validate::parse_id("serverId", &server_id)?;
    let agents = state.service.store().list_agents_for_server(server_id)?;
    Ok(data_response(json!({ "agents": agents })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentAssociationBody {
    pub agent_id: String,
}

/// Associate an agent with a server. Scoped to the current server; agent
/// connectors hear about it on the bus.
pub async fn add_server_agent(
    State(state): State<AppState>,
    Path(server_id): Path<String>,
    Json(body): Json<AgentAssociationBody>,
) -> Result<Response, ApiError> {
    let server_id = validate::parse_id("serverId", &server_id)?;
    let agent_id = validate::parse_id("agentId", &body.agent_id)?;
    state.service.check_server_scope(server_id)?;

    state.service.store().add_agent_to_server(server_id, agent_id)?;
    state
        .bus
        .publish(
            Topic::ServerAgentUpdate,
            json!({
                "type": "agent_added_to_server",
                "messageServerId": server_id.to_string(),
                "agentId": agent_id.to_string(),
            }),
        )
        .await;

    Ok((
        axum::http::StatusCode::CREATED,
        data_response(json!({ "serverId": server_id, "agentId": agent_id })),
    )
        .into_response())
}

pub async fn remove_server_agent(
    State(state): State<AppState>,
    Path((server_id, agent_id)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let server_id = validate::parse_id("serverId", &server_id)?;
    let agent_id = validate::parse_id("agentId", &agent_id)?;
    state.service.check_server_scope(server_id)?;

    state
        .service
        .store()
        .remove_agent_from_server(server_id, agent_id)?;
    state
        .bus
        .publish(
            Topic::ServerAgentUpdate,
            json!({
                "type": "agent_removed_from_server",
                "messageServerId": server_id.to_string(),
                "agentId": agent_id.to_string(),
            }),
        )
        .await;

    Ok(data_response(json!({ "removed": true })))
}

pub async fn list_agent_servers(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let agent_id = validate::parse_id("agentId", &agent_id)?;
    let servers = state.service.store().list_servers_for_agent(agent_id)?;
    Ok(data_response(json!({ "servers": servers })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::create_router;
    use crate::api::test_support::test_app;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;
    use uuid::Uuid;

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn current_server_round_trip() {
        let app = test_app(None).await;
        let router = create_router(app.state.clone());

        let response = router
            .oneshot(
                Request::builder()
                    .uri("/api/message-server/current")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(
            body["data"]["server"]["id"],
            app.server.id.to_string()
        );
    }

    #[tokio::test]
    async fn add_agent_to_foreign_server_is_forbidden() {
        let app = test_app(None).await;
        let router = create_router(app.state.clone());

        // A second server exists but is not the current one.
        let other = app
            .state
            .service
            .store()
            .create_server(None, "Other", "test", None, None)
            .unwrap();

        let response = router
            .oneshot(post_json(
                &format!("/api/message-servers/{}/agents", other.id),
                json!({ "agentId": Uuid::new_v4().to_string() }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "FORBIDDEN_SERVER_MISMATCH");
    }

    #[tokio::test]
    async fn agent_association_publishes_bus_update() {
        use std::sync::{Arc, Mutex};

        let app = test_app(None).await;
        let router = create_router(app.state.clone());

        let updates = Arc::new(Mutex::new(Vec::new()));
        let updates_clone = updates.clone();
        app.state
            .bus
            .subscribe(Topic::ServerAgentUpdate, move |payload| {
                let updates = updates_clone.clone();
                Box::pin(async move {
                    updates
                        .lock()
                        .unwrap()
                        .push(payload["type"].as_str().unwrap_or_default().to_string());
                    Ok(())
                })
            })
            .await;

        let agent_id = Uuid::new_v4();
        let response = router
            .clone()
            .oneshot(post_json(
                &format!("/api/message-servers/{}/agents", app.server.id),
                json!({ "agentId": agent_id.to_string() }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = router
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!(
                        "/api/message-servers/{}/agents/{agent_id}",
                        app.server.id
                    ))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        assert_eq!(
            *updates.lock().unwrap(),
            vec!["agent_added_to_server", "agent_removed_from_server"]
        );
    }

    #[tokio::test]
    async fn agent_server_listing() {
        let app = test_app(None).await;
        let router = create_router(app.state.clone());

        let response = router
            .oneshot(
                Request::builder()
                    .uri(format!("/api/agents/{}/message-servers", app.agent_id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["data"]["servers"][0], app.server.id.to_string());
    }
}
