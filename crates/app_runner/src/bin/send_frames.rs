//! Synthetic perception sender for bench and demo runs. Sweeps a person (or
//! a pointed target) across the frame and emits one datagram per interval.
//!
//! Env: `TARGET` (default 127.0.0.1:4501), `KIND` (people|point),
//! `INTERVAL_MS` (default 100), `DEPTH` (default 30).

use std::net::UdpSocket;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use core_types::{PeopleFrame, PerceptionFrame, PersonObs, PointFrame};

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn main() -> Result<()> {
    let target = env_or("TARGET", "127.0.0.1:4501");
    let kind = env_or("KIND", "people");
    let interval = Duration::from_millis(
        env_or("INTERVAL_MS", "100")
            .parse()
            .context("parse INTERVAL_MS")?,
    );
    let depth: f64 = env_or("DEPTH", "30").parse().context("parse DEPTH")?;

    let socket = UdpSocket::bind("0.0.0.0:0").context("bind sender socket")?;
    socket
        .connect(&target)
        .with_context(|| format!("connect to {target}"))?;
    eprintln!("send_frames: target={target} kind={kind} interval={interval:?}");

    let mut step = 0u64;
    loop {
        let x = 320.0 + 300.0 * ((step as f64) * 0.05).sin();
        let y = 240.0 + 100.0 * ((step as f64) * 0.03).cos();
        let frame = match kind.as_str() {
            "point" => PerceptionFrame::Point(PointFrame {
                ts_ms: now_ms(),
                x,
                y,
                z: depth,
            }),
            _ => PerceptionFrame::People(PeopleFrame {
                ts_ms: now_ms(),
                people: vec![
                    PersonObs { x, y, z: depth },
                    PersonObs {
                        x: 100.0,
                        y: 100.0,
                        z: depth / 2.0,
                    },
                ],
            }),
        };
        let bytes = serde_json::to_vec(&frame).context("encode frame")?;
        socket.send(&bytes).context("send frame")?;
        step += 1;
        std::thread::sleep(interval);
    }
}
