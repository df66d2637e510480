use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use arbitration::SharedBindings;
use coord_map::AffineGazeMapper;
use core_types::{GazeMode, GazeTarget, PerceptionFrame, PersonObs};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

const RECV_RETRY_DELAY: Duration = Duration::from_millis(200);

/// One UDP listener per configured input source. Decodes perception frames,
/// maps them into actuator angles and writes the result into the source's
/// binding under the shared lock. Arrival is push-driven and unbounded
/// relative to the engine's tick rate; each write holds the lock for a
/// single field update only.
pub struct PerceptionListener {
    name: String,
    index: usize,
    port: u16,
    mode: GazeMode,
    mapper: AffineGazeMapper,
    shared: Arc<SharedBindings>,
}

impl PerceptionListener {
    pub fn new(
        name: impl Into<String>,
        index: usize,
        port: u16,
        mode: GazeMode,
        mapper: AffineGazeMapper,
        shared: Arc<SharedBindings>,
    ) -> Self {
        Self {
            name: name.into(),
            index,
            port,
            mode,
            mapper,
            shared,
        }
    }

    pub async fn run(self) -> Result<()> {
        let socket = bind_ingest_socket(self.port)?;
        info!(source = %self.name, port = self.port, "perception listener started");
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            // A recv failure must not kill the listener; the source would go
            // stale forever while the engine keeps arbitrating.
            let (len, _peer) = match socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(err) => {
                    metrics::counter!("feed.recv_error").increment(1);
                    warn!(source = %self.name, ?err, "perception socket recv failed; retrying");
                    tokio::time::sleep(RECV_RETRY_DELAY).await;
                    continue;
                }
            };
            match ingest_datagram(
                &self.shared,
                self.index,
                &self.mapper,
                self.mode,
                &buf[..len],
                Instant::now(),
            ) {
                IngestOutcome::Applied => {}
                IngestOutcome::Unmappable => {
                    metrics::counter!("feed.unmappable").increment(1);
                }
                IngestOutcome::DecodeError => {
                    metrics::counter!("feed.decode_error").increment(1);
                    debug!(source = %self.name, "dropping undecodable datagram");
                }
            }
        }
    }
}

/// What one datagram did to the bound source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Applied,
    /// Decoded fine but produced no target (empty people list, out-of-frame
    /// coordinates or an unknown binding index).
    Unmappable,
    /// Not a perception frame; dropped without touching the binding.
    DecodeError,
}

/// Decodes one datagram payload and applies it to the bound source. Split
/// from the socket loop so the decode-and-skip path is testable.
pub fn ingest_datagram(
    shared: &SharedBindings,
    index: usize,
    mapper: &AffineGazeMapper,
    mode: GazeMode,
    payload: &[u8],
    now: Instant,
) -> IngestOutcome {
    let frame: PerceptionFrame = match serde_json::from_slice(payload) {
        Ok(frame) => frame,
        Err(_) => return IngestOutcome::DecodeError,
    };
    if apply_frame(shared, index, mapper, mode, &frame, now) {
        IngestOutcome::Applied
    } else {
        IngestOutcome::Unmappable
    }
}

fn bind_ingest_socket(port: u16) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    // Large enough to ride out perception bursts between ticks.
    socket.set_recv_buffer_size(4 * 1024 * 1024)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    let addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into()).context("register udp socket with tokio")
}

/// Picks the person to gaze at. The depth value grows as a subject closes
/// in, so the nearest person is the one with the largest depth.
pub fn nearest_person(people: &[PersonObs]) -> Option<&PersonObs> {
    people.iter().max_by(|a, b| a.z.total_cmp(&b.z))
}

/// Applies one decoded frame to the bound source. Returns `false` when the
/// frame produced no target (empty people list, out-of-frame coordinates or
/// an unknown binding index); the binding stays untouched in that case.
pub fn apply_frame(
    shared: &SharedBindings,
    index: usize,
    mapper: &AffineGazeMapper,
    mode: GazeMode,
    frame: &PerceptionFrame,
    now: Instant,
) -> bool {
    let (x, y, measurement, ts_ms) = match frame {
        PerceptionFrame::People(people_frame) => {
            let Some(person) = nearest_person(&people_frame.people) else {
                return false;
            };
            (person.x, person.y, person.z, people_frame.ts_ms)
        }
        PerceptionFrame::Point(point) => (point.x, point.y, point.z, point.ts_ms),
    };
    let Some((pan_deg, tilt_deg)) = mapper.map(x, y) else {
        return false;
    };
    let target = GazeTarget {
        pan_deg,
        tilt_deg,
        mode,
        ts_ms,
    };
    shared
        .with_source(index, |s| s.record(measurement, target, now))
        .is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbitration::SourceState;
    use core_types::{PeopleFrame, PointFrame, SourceCategory};
    use std::time::Duration;

    fn fixture() -> (Arc<SharedBindings>, AffineGazeMapper) {
        let shared = Arc::new(SharedBindings::new(vec![SourceState::new(
            "nearest_person",
            SourceCategory::Proximity,
            Duration::from_secs(1),
        )]));
        let mapper = AffineGazeMapper::new("cam0", (640.0, 480.0), (60.0, 40.0)).expect("geometry");
        (shared, mapper)
    }

    #[test]
    fn nearest_person_is_the_deepest_observation() {
        let people = vec![
            PersonObs {
                x: 10.0,
                y: 10.0,
                z: 20.0,
            },
            PersonObs {
                x: 400.0,
                y: 200.0,
                z: 55.0,
            },
            PersonObs {
                x: 90.0,
                y: 90.0,
                z: 31.0,
            },
        ];
        let nearest = nearest_person(&people).expect("non-empty");
        assert_eq!(nearest.z, 55.0);
    }

    #[test]
    fn people_frame_updates_the_binding() {
        let (shared, mapper) = fixture();
        let now = Instant::now();
        let frame = PerceptionFrame::People(PeopleFrame {
            ts_ms: 42,
            people: vec![PersonObs {
                x: 320.0,
                y: 240.0,
                z: 50.0,
            }],
        });

        let applied = apply_frame(&shared, 0, &mapper, GazeMode::Absolute, &frame, now);

        assert!(applied);
        let state = shared.lock()[0].clone();
        assert!(state.has_update);
        assert_eq!(state.last_update, Some(now));
        assert_eq!(state.measurement, 50.0);
        let target = state.target.expect("target recorded");
        assert!(target.pan_deg.abs() < 1e-9);
        assert_eq!(target.ts_ms, 42);
    }

    #[test]
    fn empty_people_frame_leaves_binding_untouched() {
        let (shared, mapper) = fixture();
        let frame = PerceptionFrame::People(PeopleFrame {
            ts_ms: 42,
            people: Vec::new(),
        });

        let applied = apply_frame(
            &shared,
            0,
            &mapper,
            GazeMode::Absolute,
            &frame,
            Instant::now(),
        );

        assert!(!applied);
        assert!(!shared.lock()[0].has_update);
    }

    #[test]
    fn out_of_frame_point_is_skipped() {
        let (shared, mapper) = fixture();
        let frame = PerceptionFrame::Point(PointFrame {
            ts_ms: 7,
            x: 900.0,
            y: 240.0,
            z: 0.4,
        });

        let applied = apply_frame(
            &shared,
            0,
            &mapper,
            GazeMode::Relative,
            &frame,
            Instant::now(),
        );

        assert!(!applied);
        assert!(!shared.lock()[0].has_update);
    }

    #[test]
    fn undecodable_datagram_is_counted_and_skipped() {
        let (shared, mapper) = fixture();
        let outcome = ingest_datagram(
            &shared,
            0,
            &mapper,
            GazeMode::Absolute,
            b"not a perception frame",
            Instant::now(),
        );
        assert_eq!(outcome, IngestOutcome::DecodeError);
        assert!(!shared.lock()[0].has_update);

        // The source keeps ingesting after garbage.
        let frame = PerceptionFrame::Point(PointFrame {
            ts_ms: 9,
            x: 320.0,
            y: 240.0,
            z: 0.4,
        });
        let bytes = serde_json::to_vec(&frame).expect("encode");
        let outcome = ingest_datagram(
            &shared,
            0,
            &mapper,
            GazeMode::Absolute,
            &bytes,
            Instant::now(),
        );
        assert_eq!(outcome, IngestOutcome::Applied);
        assert!(shared.lock()[0].has_update);
    }

    #[test]
    fn unknown_binding_index_is_rejected() {
        let (shared, mapper) = fixture();
        let frame = PerceptionFrame::Point(PointFrame {
            ts_ms: 7,
            x: 320.0,
            y: 240.0,
            z: 0.4,
        });
        let applied = apply_frame(
            &shared,
            5,
            &mapper,
            GazeMode::Relative,
            &frame,
            Instant::now(),
        );
        assert!(!applied);
    }
}
