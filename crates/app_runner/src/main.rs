use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use arbitration::{ActuatorBinding, ArbitrationEngine, EngineStatus, SharedBindings};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use core_types::GazeDriver;
use feed_udp::PerceptionListener;
use observability::init_telemetry;
use serde::Serialize;

use crate::config_loader::{build_wiring, load_config, Wiring};
use crate::gaze_runtime::{run_gaze_controller, LogGazeDriver, UdpGazeDriver};

mod config_loader;
mod gaze_runtime;

#[derive(Clone)]
struct AppState {
    paused: Arc<AtomicBool>,
    status: Arc<EngineStatus>,
    names: Arc<Vec<String>>,
    prometheus: metrics_exporter_prometheus::PrometheusHandle,
}

#[derive(Serialize)]
struct HealthResp {
    status: &'static str,
    paused: bool,
}

#[derive(Serialize)]
struct ArbiterResp {
    paused: bool,
    winner: Option<String>,
    winner_index: Option<usize>,
    override_active: bool,
    tick_rate: f64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = init_telemetry("app_runner");

    let cfg = load_config()?;
    // A bad configuration must never reach the loop.
    let wiring = build_wiring(&cfg)?;

    let Wiring {
        engine_cfg,
        sources,
    } = wiring;
    let names: Arc<Vec<String>> = Arc::new(sources.iter().map(|s| s.state.name.clone()).collect());
    let shared = Arc::new(SharedBindings::new(
        sources.iter().map(|s| s.state.clone()).collect(),
    ));
    let actuators: Vec<Arc<ActuatorBinding>> = (0..names.len())
        .map(|_| Arc::new(ActuatorBinding::default()))
        .collect();
    let paused = Arc::new(AtomicBool::new(false));

    let mut engine = ArbitrationEngine::new(
        Arc::clone(&shared),
        actuators.clone(),
        Arc::clone(&paused),
        engine_cfg.clone(),
    )?;
    let status = engine.status();
    let stop = engine.stop_handle();

    let driver: Arc<dyn GazeDriver> = match cfg.driver.udp_target.as_deref() {
        Some(target) => Arc::new(UdpGazeDriver::connect(target)?),
        None => Arc::new(LogGazeDriver),
    };

    for (index, source) in sources.into_iter().enumerate() {
        let name = source.state.name.clone();
        let listener = PerceptionListener::new(
            name.clone(),
            index,
            source.port,
            source.mode,
            source.mapper,
            Arc::clone(&shared),
        );
        tokio::spawn(async move {
            if let Err(err) = listener.run().await {
                tracing::error!(?err, "perception listener exited");
            }
        });
        tokio::spawn(run_gaze_controller(
            name,
            index,
            Arc::clone(&shared),
            Arc::clone(&actuators[index]),
            Arc::clone(&driver),
            engine_cfg.tick_period,
        ));
    }

    let engine_thread = std::thread::Builder::new()
        .name("arbitration".to_string())
        .spawn(move || engine.run())
        .context("spawn arbitration thread")?;

    let state = AppState {
        paused: Arc::clone(&paused),
        status,
        names,
        prometheus: telemetry.prometheus.clone(),
    };
    let app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/state/arbiter", get(arbiter_state))
        .route("/control/pause", post(pause))
        .route("/control/resume", post(resume))
        .with_state(state);

    let addr: SocketAddr = cfg.control_listen.parse().context("parse control_listen")?;
    tracing::info!(%addr, "control api started");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    stop.request_stop();
    if engine_thread.join().is_err() {
        tracing::error!("arbitration thread panicked");
    }
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown requested");
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResp {
        status: "ok",
        paused: state.paused.load(Ordering::Relaxed),
    })
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.prometheus.render()
}

async fn arbiter_state(State(state): State<AppState>) -> impl IntoResponse {
    let winner_index = state.status.winner();
    Json(ArbiterResp {
        paused: state.paused.load(Ordering::Relaxed),
        winner: winner_index.and_then(|i| state.names.get(i).cloned()),
        winner_index,
        override_active: state.status.override_active(),
        tick_rate: state.status.tick_rate(),
    })
}

async fn pause(State(state): State<AppState>) -> impl IntoResponse {
    state.paused.store(true, Ordering::Relaxed);
    tracing::info!("auto arbitration paused");
    Json(serde_json::json!({"ok": true, "paused": true}))
}

async fn resume(State(state): State<AppState>) -> impl IntoResponse {
    state.paused.store(false, Ordering::Relaxed);
    tracing::info!("auto arbitration resumed");
    Json(serde_json::json!({"ok": true, "paused": false}))
}
