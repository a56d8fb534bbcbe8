//! HTTP control surface.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};

use enrichd::{BatchReport, ControlReply, ControlRequest, Orchestrator};

/// `POST /` runs a control action; `POST /batches/report` records a worker result.
pub fn create_router(orchestrator: Arc<Orchestrator>) -> Router {
    Router::new()
        .route("/", post(control))
        .route("/batches/report", post(report))
        .with_state(orchestrator)
}

pub async fn serve(orchestrator: Arc<Orchestrator>, bind: SocketAddr) -> anyhow::Result<()> {
    let app = create_router(Arc::clone(&orchestrator));

    let listener = tokio::net::TcpListener::bind(bind).await?;
    log::info!("Control surface listening on http://{}", bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            log::info!("Shutting down");
        })
        .await?;

    orchestrator.stop_all().await;
    Ok(())
}

async fn control(
    State(orchestrator): State<Arc<Orchestrator>>,
    payload: Result<Json<ControlRequest>, JsonRejection>,
) -> Response {
    match payload {
        Ok(Json(request)) => into_response(orchestrator.handle(request).await),
        Err(rejection) => bad_request(rejection),
    }
}

async fn report(
    State(orchestrator): State<Arc<Orchestrator>>,
    payload: Result<Json<BatchReport>, JsonRejection>,
) -> Response {
    match payload {
        Ok(Json(report)) => into_response(orchestrator.handle_report(&report)),
        Err(rejection) => bad_request(rejection),
    }
}

fn into_response(reply: ControlReply) -> Response {
    let status = StatusCode::from_u16(reply.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(reply.body)).into_response()
}

fn bad_request(rejection: JsonRejection) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "success": false, "error": rejection.body_text() })),
    )
        .into_response()
}
