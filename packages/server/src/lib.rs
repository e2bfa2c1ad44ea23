#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Actix-Web HTTP API for the chatgraph multi-agent chat service.
//!
//! Serves every route in spec §6: user/model/agent/settings discovery,
//! conversation CRUD, the server-sent-event message stream, and message
//! evaluation. `AppState` holds the conversation store, the memory service,
//! and a [`chatgraph_orchestrator::WorkflowFactory`] that builds a fresh
//! triage or dynamic workflow graph per request, exactly as
//! `crime_map_server::AppState` held the crime data connections — but for
//! conversations instead of crime data.

mod catalog;
mod handlers;
pub mod interactive;

use std::collections::HashMap;
use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpServer};
use chatgraph_agent::Agent;
use chatgraph_llm::LlmProvider;
use chatgraph_memory::{MemoryConfig, MemoryService};
use chatgraph_orchestrator::{MessageOrchestrator, WorkflowFactory};
use chatgraph_store::SqliteConversationStore;
use chatgraph_store::{ConversationStore, DEFAULT_DB_PATH};
use chatgraph_tools::ToolRegistry;

/// Shared application state, built once at startup.
pub struct AppState {
    pub store: Arc<dyn ConversationStore>,
    pub orchestrator: Arc<MessageOrchestrator>,
    /// Model names advertised by `GET /api/models`.
    pub models: Vec<String>,
    /// Sub-agent keys available in triage mode (`react_mode=false`).
    pub triage_agent_keys: Vec<String>,
    /// Sub-agent keys available in dynamic mode (`react_mode=true`).
    pub dynamic_agent_keys: Vec<String>,
    /// `SHOW_FUNC_RESULT` — whether the UI should render `function_end`
    /// tool-result payloads.
    pub show_func_result: bool,
}

/// Builds the [`WorkflowFactory`] that produces a fresh triage or dynamic
/// workflow graph for each request, applying `agent_model_mapping`
/// per-agent overrides (first in the resolution chain, per §4.C) before
/// construction.
fn build_workflow_factory(
    sub_agents: HashMap<String, Agent>,
    summary_agent: Agent,
    provider: Arc<dyn LlmProvider>,
    tools: Arc<ToolRegistry>,
    process_model_default: String,
) -> WorkflowFactory {
    Arc::new(move |request| {
        let mut agents = sub_agents.clone();
        if let Some(overrides) = &request.agent_model_mapping {
            for (key, model) in overrides {
                if let Some(agent) = agents.remove(key) {
                    agents.insert(key.clone(), agent.with_model_override(model.clone()));
                }
            }
        }

        if request.react_mode {
            chatgraph_workflows::build_dynamic(chatgraph_workflows::DynamicConfig {
                sub_agents: agents,
                plan_instructions: catalog::PLAN_INSTRUCTIONS.to_string(),
                replan_instructions: catalog::REPLAN_INSTRUCTIONS.to_string(),
                review_instructions: catalog::REVIEW_INSTRUCTIONS.to_string(),
                summary_instructions: catalog::SUMMARY_INSTRUCTIONS.to_string(),
                provider: Arc::clone(&provider),
                tools: Arc::clone(&tools),
                workflow_model_default: request.workflow_model.clone(),
                process_model_default: process_model_default.clone(),
            })
        } else {
            chatgraph_workflows::build_triage(chatgraph_workflows::TriageConfig {
                sub_agents: agents,
                summary_agent: summary_agent.clone(),
                triage_instructions: catalog::TRIAGE_INSTRUCTIONS.to_string(),
                provider: Arc::clone(&provider),
                tools: Arc::clone(&tools),
                workflow_model_default: request.workflow_model.clone(),
                process_model_default: process_model_default.clone(),
            })
        }
    })
}

/// Resolves the model list advertised by `GET /api/models`: `CHATGRAPH_MODELS`
/// (comma-separated) if set, otherwise the process default plus the memory
/// summarizer model.
fn resolve_models(process_model_default: &str) -> Vec<String> {
    if let Ok(raw) = std::env::var("CHATGRAPH_MODELS") {
        let models: Vec<String> = raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
            .collect();
        if !models.is_empty() {
            return models;
        }
    }
    let mut models = vec![process_model_default.to_string()];
    if chatgraph_memory::DEFAULT_MEMORY_MODEL != process_model_default {
        models.push(chatgraph_memory::DEFAULT_MEMORY_MODEL.to_string());
    }
    models
}

/// Starts the chatgraph API server.
///
/// # Errors
///
/// Returns an `std::io::Result` error if the LLM provider can't be
/// constructed from the environment, the conversations database can't be
/// opened, or the HTTP server fails to bind.
///
/// # Panics
///
/// Panics if the conversations database cannot be opened.
pub async fn run_server() -> std::io::Result<()> {
    pretty_env_logger::init_custom_env("RUST_LOG");

    let provider: Arc<dyn LlmProvider> = Arc::from(
        chatgraph_llm::create_provider_from_env()
            .map_err(|e| std::io::Error::other(e.to_string()))?,
    );
    let process_model_default = provider.default_model().to_string();

    log::info!("Opening conversations database...");
    let store: Arc<dyn ConversationStore> = Arc::new(
        SqliteConversationStore::open(std::path::Path::new(DEFAULT_DB_PATH))
            .await
            .expect("Failed to open conversations database"),
    );

    let catalog = catalog::build_catalog();
    let tools = Arc::new(catalog.tools);
    let agent_keys: Vec<String> = catalog.sub_agents.keys().cloned().collect();

    let workflow_factory = build_workflow_factory(
        catalog.sub_agents,
        catalog::summary_agent(),
        Arc::clone(&provider),
        Arc::clone(&tools),
        process_model_default.clone(),
    );

    let memory = Arc::new(MemoryService::new(
        Arc::clone(&store),
        Arc::clone(&provider),
        MemoryConfig::from_env(),
    ));

    let orchestrator = Arc::new(MessageOrchestrator::new(
        Arc::clone(&store),
        memory,
        workflow_factory,
    ));

    let show_func_result = std::env::var("SHOW_FUNC_RESULT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false);

    let state = web::Data::new(AppState {
        store,
        orchestrator,
        models: resolve_models(&process_model_default),
        triage_agent_keys: agent_keys.clone(),
        dynamic_agent_keys: agent_keys,
        show_func_result,
    });

    let bind_addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080);

    log::info!("Starting server on {bind_addr}:{port}");

    HttpServer::new(move || {
        let cors = Cors::permissive();

        App::new()
            .wrap(cors)
            .wrap(middleware::Logger::default())
            .app_data(state.clone())
            .service(
                web::scope("/api")
                    .route("/user", web::get().to(handlers::user))
                    .route("/models", web::get().to(handlers::models))
                    .route("/agents", web::get().to(handlers::agents))
                    .route("/settings", web::get().to(handlers::settings))
                    .route(
                        "/conversations",
                        web::get().to(handlers::list_conversations),
                    )
                    .route(
                        "/conversations",
                        web::post().to(handlers::create_conversation),
                    )
                    .route(
                        "/conversations/{id}",
                        web::get().to(handlers::get_conversation),
                    )
                    .route(
                        "/conversations/{id}",
                        web::put().to(handlers::update_conversation),
                    )
                    .route(
                        "/conversations/{id}",
                        web::delete().to(handlers::delete_conversation),
                    )
                    .route(
                        "/conversations/{id}/messages",
                        web::post().to(handlers::post_message),
                    )
                    .route(
                        "/conversations/{id}/messages/{seq}/evaluation",
                        web::patch().to(handlers::set_evaluation),
                    )
                    .route(
                        "/conversations/{id}/messages/{seq}/evaluation/clear",
                        web::patch().to(handlers::clear_evaluation),
                    ),
            )
    })
    .bind((bind_addr, port))?
    .run()
    .await
}
