use std::net::UdpSocket;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use arbitration::{ActuatorBinding, SharedBindings};
use core_types::{GazeDriver, GazeTarget};
use tracing::{info, warn};

/// Fallback driver: winning targets go to the log only.
pub struct LogGazeDriver;

impl GazeDriver for LogGazeDriver {
    fn drive(&self, source: &str, target: &GazeTarget) {
        info!(
            source,
            pan_deg = target.pan_deg,
            tilt_deg = target.tilt_deg,
            "gaze target"
        );
    }
}

/// Forwards winning targets to a downstream robot bridge as JSON datagrams.
pub struct UdpGazeDriver {
    socket: UdpSocket,
}

impl UdpGazeDriver {
    pub fn connect(target: &str) -> Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0").context("bind driver socket")?;
        socket
            .connect(target)
            .with_context(|| format!("connect gaze driver to {target}"))?;
        Ok(Self { socket })
    }
}

impl GazeDriver for UdpGazeDriver {
    fn drive(&self, source: &str, target: &GazeTarget) {
        let payload = serde_json::json!({ "source": source, "target": target });
        match serde_json::to_vec(&payload) {
            Ok(bytes) => {
                if let Err(err) = self.socket.send(&bytes) {
                    warn!(source, ?err, "gaze driver send failed");
                }
            }
            Err(err) => warn!(source, ?err, "gaze target encode failed"),
        }
    }
}

/// One controller per binding. While its actuator holds control it forwards
/// the source's newest mapped target to the driver; duplicate targets are
/// not re-sent. Translating "has control" into motion stays entirely on the
/// driver side.
pub async fn run_gaze_controller(
    name: String,
    index: usize,
    shared: Arc<SharedBindings>,
    actuator: Arc<ActuatorBinding>,
    driver: Arc<dyn GazeDriver>,
    period: Duration,
) {
    let mut interval = tokio::time::interval(period);
    let mut last_sent: Option<GazeTarget> = None;
    loop {
        interval.tick().await;
        if !actuator.has_control() {
            continue;
        }
        let target = shared.with_source(index, |s| s.target.clone()).flatten();
        let Some(target) = target else {
            continue;
        };
        if last_sent.as_ref() == Some(&target) {
            continue;
        }
        driver.drive(&name, &target);
        last_sent = Some(target);
    }
}
