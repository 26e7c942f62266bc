use actix_cors::Cors;
use actix_web::{
    get, post, web, App, HttpResponse, HttpServer, Responder, Result as ActixResult,
};
use actix_ws::Message;
use fluxcore::{DenyReason, Flow, RunError, TenantCtx};
use fluxcore::events::iggy::{IggyBroker, IggyBrokerConfig};
use fluxruntime::{
    AllowAll, CacheStore, Dispatcher, FlowStore, MemoryCache, MemoryFlowStore, NodeRegistry,
    RuntimeConfig, Worker,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Application state shared across handlers
struct AppState {
    dispatcher: Arc<Dispatcher>,
    flows: Arc<MemoryFlowStore>,
}

/// Request body for run submission
#[derive(Debug, Deserialize)]
struct SubmitRequest {
    flow_id: Uuid,
    workspace_id: Option<Uuid>,
    org_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
struct SubmitResponse {
    run_id: Uuid,
}

#[derive(Debug, Serialize)]
struct FlowResponse {
    id: Uuid,
    message: String,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

impl ErrorResponse {
    fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

#[get("/health")]
async fn health_check() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "service": "fluxengine"
    }))
}

#[get("/api/flows")]
async fn list_flows(data: web::Data<AppState>) -> ActixResult<impl Responder> {
    let flows = data.flows.list().await;
    let summaries: Vec<_> = flows
        .iter()
        .map(|f| {
            serde_json::json!({
                "id": f.id,
                "name": f.name,
                "description": f.description,
                "nodes": f.nodes.len(),
                "connections": f.connections.len(),
            })
        })
        .collect();
    Ok(HttpResponse::Ok().json(summaries))
}

#[post("/api/flows")]
async fn create_flow(
    data: web::Data<AppState>,
    flow: web::Json<Flow>,
) -> ActixResult<impl Responder> {
    let flow = flow.into_inner();
    let registry = data.dispatcher.registry().clone();
    if let Err(e) = flow.validate(|node_type| registry.contains(node_type)) {
        return Ok(HttpResponse::BadRequest().json(ErrorResponse::new(e.to_string())));
    }

    info!("creating flow: {} ({})", flow.name, flow.id);
    let id = data.flows.insert(flow).await;
    Ok(HttpResponse::Created().json(FlowResponse {
        id,
        message: "flow created".to_string(),
    }))
}

#[get("/api/flows/{id}")]
async fn get_flow(data: web::Data<AppState>, path: web::Path<Uuid>) -> ActixResult<impl Responder> {
    let flow_id = path.into_inner();
    match data.flows.get(flow_id).await {
        Some(flow) => Ok(HttpResponse::Ok().json(flow)),
        None => Ok(HttpResponse::NotFound()
            .json(ErrorResponse::new(format!("flow {} not found", flow_id)))),
    }
}

#[actix_web::delete("/api/flows/{id}")]
async fn delete_flow(
    data: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ActixResult<impl Responder> {
    let flow_id = path.into_inner();
    match data.flows.remove(flow_id).await {
        Some(_) => {
            info!("deleted flow: {}", flow_id);
            Ok(HttpResponse::Ok().json(serde_json::json!({ "message": "flow deleted" })))
        }
        None => Ok(HttpResponse::NotFound()
            .json(ErrorResponse::new(format!("flow {} not found", flow_id)))),
    }
}

#[get("/api/nodes")]
async fn list_node_types(data: web::Data<AppState>) -> ActixResult<impl Responder> {
    let registry = data.dispatcher.registry();
    let nodes: Vec<_> = registry
        .list_node_types()
        .iter()
        .map(|node_type| {
            let metadata = registry.get_metadata(node_type);
            serde_json::json!({
                "type": node_type,
                "description": metadata.as_ref().map(|m| m.description.clone()).unwrap_or_default(),
                "category": metadata.as_ref().map(|m| m.category.clone()).unwrap_or_default(),
            })
        })
        .collect();
    Ok(HttpResponse::Ok().json(nodes))
}

/// Submit a run. Admission happens here; a denied or invalid request never
/// creates a run.
#[post("/api/runs")]
async fn submit_run(
    data: web::Data<AppState>,
    req: web::Json<SubmitRequest>,
) -> ActixResult<impl Responder> {
    let req = req.into_inner();
    let tenant = TenantCtx::new(
        req.workspace_id.unwrap_or_else(Uuid::new_v4),
        req.org_id.unwrap_or_else(Uuid::new_v4),
    );

    match data.dispatcher.submit(tenant, req.flow_id).await {
        Ok(run_id) => Ok(HttpResponse::Accepted().json(SubmitResponse { run_id })),
        Err(RunError::AdmissionDenied(reason)) => {
            let response = ErrorResponse::new(reason.to_string());
            Ok(match reason {
                DenyReason::Unauthorized(_) => HttpResponse::Forbidden().json(response),
                DenyReason::RateLimited { .. } => HttpResponse::TooManyRequests().json(response),
                DenyReason::QuotaExhausted { .. } => {
                    HttpResponse::PaymentRequired().json(response)
                }
            })
        }
        Err(RunError::Definition(e)) => {
            Ok(HttpResponse::NotFound().json(ErrorResponse::new(e.to_string())))
        }
        Err(e) => {
            error!("run submission failed: {}", e);
            Ok(HttpResponse::InternalServerError().json(ErrorResponse::new(e.to_string())))
        }
    }
}

#[get("/api/runs/{id}")]
async fn get_run(data: web::Data<AppState>, path: web::Path<Uuid>) -> ActixResult<impl Responder> {
    let run_id = path.into_inner();
    match data.dispatcher.get_run(run_id).await {
        Some(run) => Ok(HttpResponse::Ok().json(run)),
        None => Ok(HttpResponse::NotFound()
            .json(ErrorResponse::new(format!("run {} not found", run_id)))),
    }
}

/// Request cancellation; returns immediately, convergence is asynchronous
#[post("/api/runs/{id}/cancel")]
async fn cancel_run(
    data: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ActixResult<impl Responder> {
    let run_id = path.into_inner();
    if data.dispatcher.cancel(run_id).await {
        Ok(HttpResponse::Accepted().json(serde_json::json!({ "message": "cancellation requested" })))
    } else {
        Ok(HttpResponse::NotFound()
            .json(ErrorResponse::new(format!("run {} not found", run_id))))
    }
}

/// WebSocket pushing a run's events in order until the terminal event
#[get("/api/runs/{id}/events")]
async fn stream_run_events(
    req: actix_web::HttpRequest,
    stream: web::Payload,
    data: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ActixResult<HttpResponse> {
    let run_id = path.into_inner();

    // Subscribe before checking state so an event published in between is
    // not lost. A live run's topic already exists, so this attaches to it;
    // for an unknown or finished run the subscription is inert and the
    // lookup below reports the record (or 404) instead.
    let mut events = data.dispatcher.bridge().subscribe(run_id);
    let run = match data.dispatcher.get_run(run_id).await {
        Some(run) => run,
        None => {
            return Ok(HttpResponse::NotFound()
                .json(ErrorResponse::new(format!("run {} not found", run_id))))
        }
    };
    if run.state.is_terminal() {
        return Ok(HttpResponse::Ok().json(run));
    }

    let (res, mut session, mut msg_stream) = actix_ws::handle(&req, stream)?;
    info!(%run_id, "event stream client connected");

    actix_web::rt::spawn(async move {
        loop {
            tokio::select! {
                event = events.next() => {
                    match event {
                        Some(event) => {
                            let terminal = event.is_terminal();
                            if let Ok(json) = serde_json::to_string(&event) {
                                if session.text(json).await.is_err() {
                                    break;
                                }
                            }
                            if terminal {
                                break;
                            }
                        }
                        None => break,
                    }
                }

                Some(Ok(msg)) = msg_stream.recv() => {
                    match msg {
                        Message::Ping(bytes) => {
                            if session.pong(&bytes).await.is_err() {
                                break;
                            }
                        }
                        Message::Close(_) => break,
                        _ => {}
                    }
                }

                else => break,
            }
        }
        info!(%run_id, "event stream client disconnected");
        let _ = session.close(None).await;
    });

    Ok(res)
}

/// Role of this process, from FLUX_ROLE: "server", "worker" or "all"
fn configured_role() -> String {
    std::env::var("FLUX_ROLE").unwrap_or_else(|_| "server".to_string())
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("starting fluxengine server");

    let mut registry = NodeRegistry::new();
    fluxnodes::register_all(&mut registry);
    let registry = Arc::new(registry);
    let flows = Arc::new(MemoryFlowStore::new());
    let cache: Arc<dyn CacheStore> = Arc::new(MemoryCache::new());

    let mut config = RuntimeConfig::default();
    config.force_local = std::env::var("FLUX_FORCE_LOCAL").is_ok();

    // Broker misconfiguration is fatal at startup: a deployment that asks
    // for queued mode must not silently degrade to local-only.
    let broker = match std::env::var("FLUX_BROKER_URL") {
        Ok(url) => {
            let broker_config = IggyBrokerConfig {
                connection_string: url,
                ..IggyBrokerConfig::default()
            };
            let broker = IggyBroker::connect(broker_config)
                .await
                .map_err(|e| anyhow::anyhow!("broker initialization failed: {}", e))?;
            Some(Arc::new(broker))
        }
        Err(_) => None,
    };

    let mut dispatcher = Dispatcher::new(
        config.clone(),
        registry.clone(),
        flows.clone(),
        cache.clone(),
        Arc::new(AllowAll),
    );
    if let Some(broker) = &broker {
        dispatcher = dispatcher.with_broker(broker.clone());
        info!("queued execution enabled via broker");
    } else {
        info!("no broker configured, running in local mode");
    }
    let dispatcher = Arc::new(dispatcher);

    if let Some(broker) = &broker {
        // Relay remote events into local per-run topics for our clients.
        dispatcher.bridge().spawn_relay(broker.clone() as Arc<dyn fluxcore::Broker>);

        let role = configured_role();
        if role == "worker" || role == "all" {
            let worker = Worker::new(
                registry.clone(),
                flows.clone(),
                cache.clone(),
                broker.clone(),
                dispatcher.usage().clone(),
            )
            .with_cancel_poll_interval(config.cancel_poll_interval);
            tokio::spawn(async move {
                loop {
                    if let Err(e) = worker.run().await {
                        warn!("worker loop ended: {}, restarting", e);
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                }
            });
            info!("worker role active");
        }
    }

    let app_state = web::Data::new(AppState {
        dispatcher,
        flows,
    });

    let bind_address =
        std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
    info!("server listening on http://{}", bind_address);

    HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(app_state.clone())
            .wrap(cors)
            .wrap(actix_web::middleware::Logger::default())
            .service(health_check)
            .service(list_flows)
            .service(create_flow)
            .service(get_flow)
            .service(delete_flow)
            .service(list_node_types)
            .service(submit_run)
            .service(get_run)
            .service(cancel_run)
            .service(stream_run_events)
    })
    .bind(&bind_address)?
    .run()
    .await?;

    Ok(())
}
