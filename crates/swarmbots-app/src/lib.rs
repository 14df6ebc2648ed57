//! Run driver shared by the `swarmbots` binary and its tests.

use anyhow::{Context, Result};
use serde::Serialize;
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};
use swarmbots_core::{SwarmConfig, SwarmMetrics, SwarmWorld};
use swarmbots_storage::{Storage, StoragePipeline};
use tracing::{debug, info, warn};

/// Storage handle shared between the world's persistence sink and the report builder.
pub type SharedStorage = Arc<Mutex<Storage>>;

const REPORTED_PERFORMERS: usize = 3;

/// Inputs for a single headless run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Optional JSON document with a (partial) `SwarmConfig`.
    pub config_path: Option<PathBuf>,
    pub robots: Option<usize>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub tasks: Option<usize>,
    pub seed: Option<u64>,
    /// Number of ticks to execute.
    pub steps: u64,
    /// DuckDB file to record tick history into.
    pub db_path: Option<PathBuf>,
}

impl RunOptions {
    /// Load the base configuration and layer the explicit overrides on top.
    pub fn resolve_config(&self) -> Result<SwarmConfig> {
        let mut config = match &self.config_path {
            Some(path) => load_config(path)?,
            None => SwarmConfig::default(),
        };
        if let Some(robots) = self.robots {
            config.robot_count = robots;
        }
        if let Some(width) = self.width {
            config.grid_width = width;
        }
        if let Some(height) = self.height {
            config.grid_height = height;
        }
        if let Some(tasks) = self.tasks {
            config.initial_tasks = tasks;
        }
        if self.seed.is_some() {
            config.rng_seed = self.seed;
        }
        config
            .validate()
            .context("configuration rejected after applying overrides")?;
        Ok(config)
    }
}

/// Read a JSON configuration file. Missing fields take their defaults.
pub fn load_config(path: &Path) -> Result<SwarmConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: SwarmConfig = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    Ok(config)
}

/// Per-robot line in the run report, sourced from persisted history.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PerformerReport {
    pub agent_id: u32,
    pub completed_tasks: i64,
    pub steps_taken: i64,
    pub avg_battery: f64,
}

/// Outcome of a headless run.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RunReport {
    pub steps: u64,
    pub final_tick: u64,
    pub robot_count: usize,
    pub grid_width: u32,
    pub grid_height: u32,
    pub seed: Option<u64>,
    /// Deliveries as of the last collector sample (taken before the final tick's activations).
    pub total_tasks_completed: u64,
    /// Metrics for the world as it stands after the last tick.
    pub final_metrics: SwarmMetrics,
    pub pending_tasks: usize,
    pub charging_robots: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub top_performers: Vec<PerformerReport>,
}

/// Build a world from `options`, run it for `options.steps` ticks, and summarize the result.
pub fn run_headless(options: &RunOptions) -> Result<RunReport> {
    let config = options.resolve_config()?;
    let seed = config.rng_seed;

    let (mut world, storage) = match &options.db_path {
        Some(path) => {
            let path_str = path
                .to_str()
                .with_context(|| format!("database path {} is not UTF-8", path.display()))?;
            let pipeline = StoragePipeline::new(path_str)
                .with_context(|| format!("failed to open database {}", path.display()))?;
            let storage = pipeline.storage();
            let world = SwarmWorld::with_persistence(config, Box::new(pipeline))
                .context("failed to build swarm world")?;
            (world, Some(storage))
        }
        None => (
            SwarmWorld::new(config).context("failed to build swarm world")?,
            None,
        ),
    };

    info!(
        robots = world.agent_count(),
        tasks = world.tasks().len(),
        steps = options.steps,
        "starting headless run"
    );
    for _ in 0..options.steps {
        let events = world.step();
        debug!(
            tick = events.tick.0,
            completed = events.completed,
            claimed = events.claimed,
            charging = events.started_charging,
            "tick processed"
        );
    }

    let total_tasks_completed = world
        .latest_summary()
        .map_or(0, |summary| summary.metrics.completed_tasks);
    let mut report = RunReport {
        steps: options.steps,
        final_tick: world.tick().0,
        robot_count: world.agent_count(),
        grid_width: world.grid().width(),
        grid_height: world.grid().height(),
        seed,
        total_tasks_completed,
        final_metrics: world.metrics(),
        pending_tasks: world.tasks().len(),
        charging_robots: world.robots().iter().filter(|robot| robot.charging).count(),
        top_performers: Vec::new(),
    };

    // Dropping the world shuts the storage worker down after its last write.
    drop(world);
    if let Some(storage) = storage {
        report.top_performers = collect_performers(&storage)?;
    }

    info!(
        tick = report.final_tick,
        completed = report.total_tasks_completed,
        "headless run finished"
    );
    Ok(report)
}

fn collect_performers(storage: &SharedStorage) -> Result<Vec<PerformerReport>> {
    let mut guard = match storage.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!("storage mutex poisoned; reading best-effort history");
            poisoned.into_inner()
        }
    };
    let stats = guard
        .top_performers(REPORTED_PERFORMERS)
        .context("failed to query top performers")?;
    Ok(stats
        .into_iter()
        .map(|stats| PerformerReport {
            agent_id: stats.agent_id,
            completed_tasks: stats.completed_tasks,
            steps_taken: stats.steps_taken,
            avg_battery: stats.avg_battery,
        })
        .collect())
}
