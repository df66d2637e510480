use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use arbitration::{EngineConfig, SourceState, StaleFallback};
use coord_map::AffineGazeMapper;
use core_types::{ConfigError, GazeMode, SourceCategory};
use serde::{Deserialize, Serialize};

fn config_path() -> PathBuf {
    std::env::var("GAZE_ARBITER_CONFIG")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("configs/arbiter.toml"))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub control_listen: String,
    pub engine: EngineSection,
    pub driver: DriverSection,
    pub sources: Vec<SourceSection>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            control_listen: "0.0.0.0:8080".to_string(),
            engine: EngineSection::default(),
            driver: DriverSection::default(),
            sources: vec![
                SourceSection {
                    name: "nearest_person".to_string(),
                    category: SourceCategory::Proximity,
                    freshness_budget_sec: 1.0,
                    resolution: [640.0, 480.0],
                    fov: [60.0, 40.0],
                    mode: GazeMode::Absolute,
                    listen_port: 4501,
                    override_threshold: Some(40.0),
                },
                SourceSection {
                    name: "pointing".to_string(),
                    category: SourceCategory::PointedTarget,
                    freshness_budget_sec: 1.0,
                    resolution: [640.0, 480.0],
                    fov: [60.0, 40.0],
                    mode: GazeMode::Relative,
                    listen_port: 4502,
                    override_threshold: Some(0.5),
                },
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    pub overrides_enabled: bool,
    pub stale_grace_sec: f64,
    pub tick_period_ms: u64,
    pub stale_fallback: StaleFallback,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            overrides_enabled: false,
            stale_grace_sec: 0.2,
            tick_period_ms: 20,
            stale_fallback: StaleFallback::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverSection {
    /// Where winning gaze targets are forwarded. Log-only when unset.
    pub udp_target: Option<String>,
}

/// One entry per input source; list position is the priority rank, 0 first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSection {
    pub name: String,
    pub category: SourceCategory,
    pub freshness_budget_sec: f64,
    pub resolution: [f64; 2],
    pub fov: [f64; 2],
    pub mode: GazeMode,
    pub listen_port: u16,
    pub override_threshold: Option<f64>,
}

pub fn load_config() -> Result<AppConfig> {
    let path = config_path();
    if !path.exists() {
        tracing::warn!(path = %path.display(), "config file missing, using built-in defaults");
        return Ok(AppConfig::default());
    }
    let raw =
        fs::read_to_string(&path).with_context(|| format!("read config {}", path.display()))?;
    let cfg = toml::from_str(&raw).with_context(|| format!("parse config {}", path.display()))?;
    Ok(cfg)
}

/// Everything one input source needs at startup, in priority order.
#[derive(Debug, Clone)]
pub struct SourceWiring {
    pub state: SourceState,
    pub mapper: AffineGazeMapper,
    pub mode: GazeMode,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct Wiring {
    pub engine_cfg: EngineConfig,
    pub sources: Vec<SourceWiring>,
}

/// Validates the parsed config and converts it into startup material.
/// Any error here is fatal; the loop must not start on a bad configuration.
pub fn build_wiring(cfg: &AppConfig) -> Result<Wiring, ConfigError> {
    if cfg.sources.is_empty() {
        return Err(ConfigError::Invalid {
            field: "sources",
            reason: "at least one input source is required".to_string(),
        });
    }
    if cfg.engine.stale_grace_sec < 0.0 {
        return Err(ConfigError::Invalid {
            field: "engine.stale_grace_sec",
            reason: "must be non-negative".to_string(),
        });
    }
    if cfg.engine.tick_period_ms == 0 {
        return Err(ConfigError::Invalid {
            field: "engine.tick_period_ms",
            reason: "must be at least 1".to_string(),
        });
    }

    let mut override_thresholds = Vec::new();
    if cfg.engine.overrides_enabled {
        let provided: Vec<f64> = cfg
            .sources
            .iter()
            .filter_map(|s| s.override_threshold)
            .collect();
        if provided.len() != cfg.sources.len() {
            return Err(ConfigError::ThresholdCount {
                want: cfg.sources.len(),
                got: provided.len(),
            });
        }
        override_thresholds = provided;
    }

    let mut sources = Vec::with_capacity(cfg.sources.len());
    for section in &cfg.sources {
        if section.freshness_budget_sec <= 0.0 {
            return Err(ConfigError::Invalid {
                field: "sources.freshness_budget_sec",
                reason: format!("source {}: must be positive", section.name),
            });
        }
        let mapper = AffineGazeMapper::new(
            section.name.clone(),
            (section.resolution[0], section.resolution[1]),
            (section.fov[0], section.fov[1]),
        )?;
        sources.push(SourceWiring {
            state: SourceState::new(
                section.name.clone(),
                section.category,
                Duration::from_secs_f64(section.freshness_budget_sec),
            ),
            mapper,
            mode: section.mode,
            port: section.listen_port,
        });
    }

    Ok(Wiring {
        engine_cfg: EngineConfig {
            overrides_enabled: cfg.engine.overrides_enabled,
            override_thresholds,
            stale_grace: Duration::from_secs_f64(cfg.engine.stale_grace_sec),
            tick_period: Duration::from_millis(cfg.engine.tick_period_ms),
            stale_fallback: cfg.engine.stale_fallback,
        },
        sources,
    })
}
