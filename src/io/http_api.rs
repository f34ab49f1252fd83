//! HTTP surface for commands, device status, and the offline queue
//!
//! Small hand-routed hyper server: the whole API is six routes, a
//! framework would be heavier than the handler table. Also exposes
//! /metrics in Prometheus text format.

use crate::domain::types::{Ack, DispatchError, GateId};
use crate::infra::metrics::{Metrics, MetricsSummary};
use crate::services::dispatcher::GateCommandDispatcher;
use crate::services::monitor::ConnectionStatusMonitor;
use crate::services::offline::OfflineQueue;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};
use uuid::Uuid;

pub struct ApiContext {
    pub dispatcher: Arc<GateCommandDispatcher>,
    pub monitor: Arc<ConnectionStatusMonitor>,
    pub offline: Arc<OfflineQueue>,
    pub metrics: Arc<Metrics>,
    pub site_id: String,
}

#[derive(Debug, Deserialize)]
struct CommandRequest {
    gate: String,
    command: String,
    #[serde(default)]
    payload: Option<String>,
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .expect("static response should not fail")
}

fn not_found() -> Response<Full<Bytes>> {
    json_response(StatusCode::NOT_FOUND, json!({"error": "not found"}))
}

fn bad_request(message: impl Into<String>) -> Response<Full<Bytes>> {
    json_response(StatusCode::BAD_REQUEST, json!({"error": message.into()}))
}

async fn handle_command(ctx: &ApiContext, body: Bytes) -> Response<Full<Bytes>> {
    let req: CommandRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(e) => return bad_request(format!("bad request body: {e}")),
    };
    let Ok(gate) = req.gate.parse::<GateId>() else {
        return not_found();
    };

    match ctx.dispatcher.dispatch_str(gate, &req.command, req.payload.as_deref()).await {
        Ok(Ack::Replied(event)) => json_response(
            StatusCode::OK,
            json!({"success": true, "ack": "replied", "reply": event}),
        ),
        Ok(Ack::Sent) => json_response(StatusCode::OK, json!({"success": true, "ack": "sent"})),
        Err(DispatchError::InvalidCommand) => bad_request("invalid command"),
        // Hardware failures are not HTTP failures: the request was valid
        // and was handled, the outcome just wasn't success
        Err(e) => json_response(StatusCode::OK, json!({"success": false, "error": e.to_string()})),
    }
}

fn handle_status(ctx: &ApiContext, gate: &str) -> Response<Full<Bytes>> {
    let Ok(gate) = gate.parse::<GateId>() else {
        return not_found();
    };
    json_response(StatusCode::OK, json!(ctx.monitor.get_status(gate)))
}

fn handle_offline_record(ctx: &ApiContext, body: Bytes) -> Response<Full<Bytes>> {
    let payload: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => return bad_request(format!("bad request body: {e}")),
    };
    match ctx.offline.enqueue(payload) {
        Ok(record) => json_response(
            StatusCode::OK,
            json!({"id": record.id, "seq": record.seq, "pending": ctx.offline.pending_count()}),
        ),
        Err(e) => {
            error!(error = %e, "offline_enqueue_failed");
            json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({"error": "journal write failed"}),
            )
        }
    }
}

fn handle_offline_synced(ctx: &ApiContext, id: &str) -> Response<Full<Bytes>> {
    let Ok(id) = id.parse::<Uuid>() else {
        return bad_request("bad record id");
    };
    match ctx.offline.mark_synced(id) {
        Ok(true) => json_response(StatusCode::OK, json!({"synced": true})),
        Ok(false) => not_found(),
        Err(e) => {
            error!(error = %e, "offline_mark_synced_failed");
            json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({"error": "journal write failed"}),
            )
        }
    }
}

fn write_metric(output: &mut String, name: &str, typ: &str, site: &str, val: u64) {
    let _ = writeln!(output, "# TYPE {name} {typ}");
    let _ = writeln!(output, "{name}{{site=\"{site}\"}} {val}");
}

fn format_prometheus_metrics(summary: &MetricsSummary, pending: usize, site: &str) -> String {
    let mut output = String::with_capacity(2048);
    write_metric(&mut output, "parkgate_events_parsed_total", "counter", site, summary.events_parsed);
    write_metric(&mut output, "parkgate_events_dropped_total", "counter", site, summary.events_dropped);
    write_metric(&mut output, "parkgate_lines_ignored_total", "counter", site, summary.lines_ignored);
    write_metric(&mut output, "parkgate_commands_total", "counter", site, summary.commands_total);
    write_metric(&mut output, "parkgate_command_failures_total", "counter", site, summary.command_failures);
    write_metric(&mut output, "parkgate_dispatch_latency_avg_us", "gauge", site, summary.dispatch_latency_avg_us);
    write_metric(&mut output, "parkgate_dispatch_latency_max_us", "gauge", site, summary.dispatch_latency_max_us);
    write_metric(&mut output, "parkgate_hub_delivered_total", "counter", site, summary.hub_delivered);
    write_metric(&mut output, "parkgate_hub_dropped_total", "counter", site, summary.hub_dropped);
    write_metric(&mut output, "parkgate_offline_pending", "gauge", site, pending as u64);
    output
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    ctx: Arc<ApiContext>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let response = match (&method, path.as_str()) {
        (&Method::GET, "/health") => json_response(
            StatusCode::OK,
            json!({"status": "ok", "site": ctx.site_id, "version": env!("GIT_HASH")}),
        ),
        (&Method::GET, "/metrics") => {
            let body =
                format_prometheus_metrics(&ctx.metrics.report(), ctx.offline.pending_count(), &ctx.site_id);
            Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
                .body(Full::new(Bytes::from(body)))
                .expect("static response should not fail")
        }
        (&Method::POST, "/command") => match req.into_body().collect().await {
            Ok(body) => handle_command(&ctx, body.to_bytes()).await,
            Err(_) => bad_request("failed to read body"),
        },
        (&Method::GET, _) if path.starts_with("/status/") => {
            handle_status(&ctx, &path["/status/".len()..])
        }
        (&Method::GET, "/offline/pending") => {
            json_response(StatusCode::OK, json!(ctx.offline.pending()))
        }
        (&Method::POST, "/offline/record") => match req.into_body().collect().await {
            Ok(body) => handle_offline_record(&ctx, body.to_bytes()),
            Err(_) => bad_request("failed to read body"),
        },
        (&Method::POST, _) if path.starts_with("/offline/synced/") => {
            handle_offline_synced(&ctx, &path["/offline/synced/".len()..])
        }
        _ => not_found(),
    };
    Ok(response)
}

/// Start the HTTP API server
pub async fn start_api_server(
    port: u16,
    ctx: Arc<ApiContext>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(port = %port, site = %ctx.site_id, "http_api_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let ctx = ctx.clone();
                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let ctx = ctx.clone();
                                async move { handle_request(req, ctx).await }
                            });
                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "http_api_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "http_api_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("http_api_shutdown");
                    return Ok(());
                }
            }
        }
    }
}
