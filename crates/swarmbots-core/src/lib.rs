//! Core types shared across the SwarmBots workspace.

use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::VecDeque;
use std::fmt;
use swarmbots_index::{IndexError, MIN_GRID_EDGE, TorusGrid};
use thiserror::Error;
use tracing::{debug, trace, warn};

pub mod robot;

pub use robot::{AgentId, Robot, RobotAction, RobotPhase, TaskPool, best_step, step_robot};
pub use swarmbots_index::{GridPos, NeighborhoodIndex};

/// High level simulation clock (ticks processed since the world was built).
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
pub struct Tick(pub u64);

impl Tick {
    /// Returns the next sequential tick.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }
}

/// Errors that can occur when constructing world state.
#[derive(Debug, Error)]
pub enum WorldStateError {
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    #[error(transparent)]
    Index(#[from] IndexError),
}

/// Battery and charging thresholds shared by every robot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BatterySettings {
    /// Maximum charge.
    pub capacity: u32,
    /// Charge at or below which a robot is forced onto the charger.
    pub charge_threshold: u32,
    /// Charge gained per tick while charging.
    pub charge_rate: u32,
    /// Charge at which a charging robot resumes work.
    pub resume_level: u32,
    /// Charge spent per idle wandering move. A move never takes the battery below
    /// `charge_threshold`; the remainder of a larger cost is waived.
    pub move_cost: u32,
    /// Charge assigned to every robot at start-up.
    pub initial: u32,
}

impl Default for BatterySettings {
    fn default() -> Self {
        Self {
            capacity: 100,
            charge_threshold: 20,
            charge_rate: 10,
            resume_level: 90,
            move_cost: 1,
            initial: 100,
        }
    }
}

/// Static configuration for a SwarmBots world.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SwarmConfig {
    /// Width of the torus in cells.
    pub grid_width: u32,
    /// Height of the torus in cells.
    pub grid_height: u32,
    /// Number of robots placed at start-up.
    pub robot_count: usize,
    /// Distinct task locations seeded at start-up (clamped to the cell count).
    pub initial_tasks: usize,
    /// Optional RNG seed for reproducible worlds.
    pub rng_seed: Option<u64>,
    /// Per-tick probability of adding one new task.
    pub task_spawn_chance: f64,
    /// Drop a task from the pool once a robot completes it.
    pub remove_completed_tasks: bool,
    pub battery: BatterySettings,
    /// Maximum number of recent tick summaries retained in-memory.
    pub history_capacity: usize,
    /// Interval (ticks) between persistence batches. 0 disables persistence.
    pub persistence_interval: u32,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            grid_width: 20,
            grid_height: 20,
            robot_count: 10,
            initial_tasks: 15,
            rng_seed: None,
            task_spawn_chance: 0.1,
            remove_completed_tasks: true,
            battery: BatterySettings::default(),
            history_capacity: 256,
            persistence_interval: 1,
        }
    }
}

impl SwarmConfig {
    /// Checks every field that would otherwise break the simulation loop.
    pub fn validate(&self) -> Result<(), WorldStateError> {
        if self.grid_width < MIN_GRID_EDGE || self.grid_height < MIN_GRID_EDGE {
            return Err(WorldStateError::InvalidConfig(
                "grid_width and grid_height must be at least 3",
            ));
        }
        if u32::try_from(self.robot_count).is_err() {
            return Err(WorldStateError::InvalidConfig("robot_count is too large"));
        }
        if !(0.0..=1.0).contains(&self.task_spawn_chance) {
            return Err(WorldStateError::InvalidConfig(
                "task_spawn_chance must lie in [0, 1]",
            ));
        }
        if self.history_capacity == 0 {
            return Err(WorldStateError::InvalidConfig(
                "history_capacity must be non-zero",
            ));
        }
        let battery = &self.battery;
        if battery.capacity == 0 || battery.charge_rate == 0 {
            return Err(WorldStateError::InvalidConfig(
                "battery capacity and charge_rate must be positive",
            ));
        }
        if battery.charge_threshold >= battery.resume_level {
            return Err(WorldStateError::InvalidConfig(
                "battery charge_threshold must be below resume_level",
            ));
        }
        if battery.resume_level > battery.capacity || battery.initial > battery.capacity {
            return Err(WorldStateError::InvalidConfig(
                "battery resume_level and initial charge cannot exceed capacity",
            ));
        }
        Ok(())
    }

    /// Number of cells on the grid; also the task pool ceiling.
    #[must_use]
    pub fn cell_count(&self) -> usize {
        (self.grid_width as usize) * (self.grid_height as usize)
    }

    /// Returns the configured RNG seed, generating one from entropy if absent.
    fn seeded_rng(&self) -> SmallRng {
        match self.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => {
                let seed: u64 = rand::random();
                SmallRng::seed_from_u64(seed)
            }
        }
    }
}

/// Aggregate metrics over the whole roster.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct SwarmMetrics {
    /// Cumulative deliveries across all robots.
    pub completed_tasks: u64,
    /// Cumulative idle moves across all robots.
    pub steps_taken: u64,
    pub average_battery: f64,
    /// `completed_tasks / (steps_taken + 1)`.
    pub efficiency: f64,
}

impl SwarmMetrics {
    /// Aggregate metrics for a set of robots.
    pub fn from_robots<'a>(robots: impl IntoIterator<Item = &'a Robot>) -> Self {
        let mut completed_tasks = 0_u64;
        let mut steps_taken = 0_u64;
        let mut total_battery = 0_u64;
        let mut count = 0_u64;
        for robot in robots {
            completed_tasks += robot.completed_tasks;
            steps_taken += robot.steps_taken;
            total_battery += u64::from(robot.battery);
            count += 1;
        }
        let average_battery = if count > 0 {
            total_battery as f64 / count as f64
        } else {
            0.0
        };
        Self {
            completed_tasks,
            steps_taken,
            average_battery,
            efficiency: completed_tasks as f64 / (steps_taken as f64 + 1.0),
        }
    }
}

/// Summary recorded at the start of every tick, before robots act.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct TickSummary {
    /// Ticks fully processed when the sample was taken.
    pub tick: Tick,
    pub agent_count: usize,
    pub task_pool: usize,
    pub charging_agents: usize,
    pub metrics: SwarmMetrics,
}

/// Scalar metric sampled during persistence.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    pub name: Cow<'static, str>,
    pub value: f64,
}

impl MetricSample {
    /// Creates a new metric sample.
    #[must_use]
    pub fn new(name: impl Into<Cow<'static, str>>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }

    /// Helper for counter values.
    #[must_use]
    pub fn from_count(name: &'static str, value: u64) -> Self {
        Self::new(name, value as f64)
    }
}

/// Read-only view of a robot for reporting layers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct AgentSnapshot {
    pub id: AgentId,
    pub position: GridPos,
    pub has_task: bool,
    pub task_location: Option<GridPos>,
    pub charging: bool,
    pub battery: u32,
    pub completed_tasks: u64,
    pub steps_taken: u64,
    pub phase: RobotPhase,
}

impl AgentSnapshot {
    #[must_use]
    pub fn capture(id: AgentId, robot: &Robot) -> Self {
        Self {
            id,
            position: robot.position,
            has_task: robot.has_task(),
            task_location: robot.task_location,
            charging: robot.charging,
            battery: robot.battery,
            completed_tasks: robot.completed_tasks,
            steps_taken: robot.steps_taken,
            phase: robot.phase(),
        }
    }
}

/// Read-only view of the whole world for visualization layers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorldSnapshot {
    pub tick: Tick,
    pub width: u32,
    pub height: u32,
    pub metrics: SwarmMetrics,
    pub tasks: Vec<GridPos>,
    pub agents: Vec<AgentSnapshot>,
}

/// Aggregate payload forwarded to persistence sinks.
#[derive(Debug, Clone)]
pub struct PersistenceBatch {
    pub summary: TickSummary,
    pub metrics: Vec<MetricSample>,
    pub agents: Vec<AgentSnapshot>,
}

/// Persistence sink invoked whenever the collector samples the world.
pub trait WorldPersistence: Send {
    fn on_tick(&mut self, payload: &PersistenceBatch);
}

/// No-op persistence sink.
#[derive(Debug, Default)]
pub struct NullPersistence;

impl WorldPersistence for NullPersistence {
    fn on_tick(&mut self, _payload: &PersistenceBatch) {}
}

/// Events emitted after processing a world tick.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct TickEvents {
    pub tick: Tick,
    pub completed: usize,
    pub claimed: usize,
    /// Robots that reached the charge threshold this tick.
    pub started_charging: usize,
    /// Tasks dropped by robots that had to start charging.
    pub abandoned: usize,
    pub blocked: usize,
    pub task_spawned: Option<GridPos>,
}

/// Aggregate world state: grid, robots, task pool, and collector.
pub struct SwarmWorld {
    config: SwarmConfig,
    tick: Tick,
    rng: SmallRng,
    grid: TorusGrid<AgentId>,
    robots: Vec<Robot>,
    tasks: TaskPool,
    schedule: Vec<AgentId>,
    persistence: Box<dyn WorldPersistence>,
    history: VecDeque<TickSummary>,
}

impl fmt::Debug for SwarmWorld {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SwarmWorld")
            .field("config", &self.config)
            .field("tick", &self.tick)
            .field("agent_count", &self.robots.len())
            .field("task_pool", &self.tasks.len())
            .finish()
    }
}

impl SwarmWorld {
    /// Instantiate a new world using the supplied configuration.
    pub fn new(config: SwarmConfig) -> Result<Self, WorldStateError> {
        Self::with_persistence(config, Box::new(NullPersistence))
    }

    /// Instantiate a new world using the supplied configuration and persistence sink.
    pub fn with_persistence(
        config: SwarmConfig,
        persistence: Box<dyn WorldPersistence>,
    ) -> Result<Self, WorldStateError> {
        config.validate()?;
        let rng = config.seeded_rng();
        Self::populate(config, rng, persistence)
    }

    /// Instantiate a world that draws every random decision from `rng`.
    pub fn with_rng(config: SwarmConfig, rng: SmallRng) -> Result<Self, WorldStateError> {
        config.validate()?;
        Self::populate(config, rng, Box::new(NullPersistence))
    }

    /// Build a world from an explicit roster and task list instead of random placement.
    ///
    /// `config.robot_count` and `config.initial_tasks` are overwritten to match. Robots
    /// charged above capacity or committed to an off-grid target are rejected.
    pub fn with_layout(
        mut config: SwarmConfig,
        rng: SmallRng,
        robots: Vec<Robot>,
        tasks: impl IntoIterator<Item = GridPos>,
    ) -> Result<Self, WorldStateError> {
        config.robot_count = robots.len();
        config.validate()?;
        let mut world = Self::empty(config, rng, Box::new(NullPersistence))?;
        for (idx, robot) in robots.into_iter().enumerate() {
            if robot.battery > world.config.battery.capacity {
                return Err(WorldStateError::InvalidConfig(
                    "robot battery exceeds battery capacity",
                ));
            }
            if let Some(task) = robot.task_location {
                if !world.grid.contains(task) {
                    return Err(IndexError::OutOfBounds {
                        pos: task,
                        width: world.grid.width(),
                        height: world.grid.height(),
                    }
                    .into());
                }
            }
            let id = AgentId(idx as u32);
            world.grid.place(id, robot.position)?;
            world.robots.push(robot);
        }
        for location in tasks {
            world.insert_task(location)?;
        }
        world.config.initial_tasks = world.tasks.len();
        Ok(world)
    }

    fn empty(
        config: SwarmConfig,
        rng: SmallRng,
        persistence: Box<dyn WorldPersistence>,
    ) -> Result<Self, WorldStateError> {
        let grid = TorusGrid::new(config.grid_width, config.grid_height)?;
        let history_capacity = config.history_capacity;
        Ok(Self {
            grid,
            robots: Vec::with_capacity(config.robot_count),
            schedule: Vec::with_capacity(config.robot_count),
            config,
            tick: Tick::zero(),
            rng,
            tasks: TaskPool::new(),
            persistence,
            history: VecDeque::with_capacity(history_capacity),
        })
    }

    fn populate(
        config: SwarmConfig,
        rng: SmallRng,
        persistence: Box<dyn WorldPersistence>,
    ) -> Result<Self, WorldStateError> {
        let mut world = Self::empty(config, rng, persistence)?;
        let (width, height) = (world.config.grid_width, world.config.grid_height);
        for idx in 0..world.config.robot_count {
            let x = world.rng.random_range(0..width);
            let y = world.rng.random_range(0..height);
            let position = GridPos::new(x, y);
            let id = AgentId(idx as u32);
            world.grid.place(id, position)?;
            world
                .robots
                .push(Robot::new(position, world.config.battery.initial));
        }

        let cells = world.config.cell_count();
        let requested = world.config.initial_tasks;
        if requested > cells {
            warn!(
                requested,
                cells, "initial task count exceeds grid cells; clamping"
            );
        }
        for _ in 0..requested.min(cells) {
            world.add_task();
        }
        debug!(
            robots = world.robots.len(),
            tasks = world.tasks.len(),
            width,
            height,
            "swarm world initialised"
        );
        Ok(world)
    }

    /// Add one task at a fresh random location; a no-op once every cell holds a task.
    pub fn add_task(&mut self) -> Option<GridPos> {
        if self.tasks.len() >= self.grid.cell_count() {
            return None;
        }
        let (width, height) = (self.grid.width(), self.grid.height());
        loop {
            let x = self.rng.random_range(0..width);
            let y = self.rng.random_range(0..height);
            let location = GridPos::new(x, y);
            if self.tasks.insert(location) {
                return Some(location);
            }
        }
    }

    /// Insert a task at a specific location. Returns `false` if it was already pending.
    pub fn insert_task(&mut self, location: GridPos) -> Result<bool, WorldStateError> {
        if !self.grid.contains(location) {
            return Err(IndexError::OutOfBounds {
                pos: location,
                width: self.grid.width(),
                height: self.grid.height(),
            }
            .into());
        }
        Ok(self.tasks.insert(location))
    }

    fn stage_collect(&mut self) {
        let summary = self.summarize();
        if self.history.len() >= self.config.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(summary);

        let interval = u64::from(self.config.persistence_interval);
        if interval == 0 || summary.tick.0 % interval != 0 {
            return;
        }
        let metrics = vec![
            MetricSample::from_count("completed_tasks", summary.metrics.completed_tasks),
            MetricSample::from_count("steps_taken", summary.metrics.steps_taken),
            MetricSample::new("efficiency", summary.metrics.efficiency),
            MetricSample::new("average_battery", summary.metrics.average_battery),
            MetricSample::from_count("task_pool", summary.task_pool as u64),
        ];
        let batch = PersistenceBatch {
            summary,
            metrics,
            agents: self.agent_snapshots(),
        };
        self.persistence.on_tick(&batch);
    }

    fn stage_activation(&mut self, events: &mut TickEvents) {
        let mut schedule = std::mem::take(&mut self.schedule);
        schedule.clear();
        schedule.extend((0..self.robots.len() as u32).map(AgentId));
        schedule.shuffle(&mut self.rng);

        for &id in &schedule {
            let Some(robot) = self.robots.get_mut(id.index()) else {
                continue;
            };
            let outcome = step_robot(
                id,
                robot,
                &mut self.grid,
                &self.tasks,
                &self.config.battery,
                &mut self.rng,
            );
            match outcome {
                Ok(action) => self.apply_action(id, action, events),
                Err(err) => warn!(agent = %id, %err, "robot activation failed; robot stays put"),
            }
        }
        self.schedule = schedule;
    }

    fn apply_action(&mut self, id: AgentId, action: RobotAction, events: &mut TickEvents) {
        trace!(agent = %id, ?action, "robot activated");
        match action {
            RobotAction::Completed { location } => {
                events.completed += 1;
                if self.config.remove_completed_tasks {
                    self.tasks.remove(location);
                }
            }
            RobotAction::Claimed { .. } => events.claimed += 1,
            RobotAction::StartedCharging { abandoned } => {
                events.started_charging += 1;
                if let Some(location) = abandoned {
                    events.abandoned += 1;
                    debug!(agent = %id, %location, "task abandoned for charging");
                }
            }
            RobotAction::Blocked { .. } => events.blocked += 1,
            RobotAction::Charged { .. }
            | RobotAction::Advanced { .. }
            | RobotAction::Wandered { .. }
            | RobotAction::Stranded => {}
        }
    }

    fn stage_task_spawn(&mut self) -> Option<GridPos> {
        if self.rng.random::<f64>() >= self.config.task_spawn_chance {
            return None;
        }
        let spawned = self.add_task();
        match spawned {
            Some(location) => debug!(%location, pool = self.tasks.len(), "task spawned"),
            None => trace!("task pool saturated; spawn skipped"),
        }
        spawned
    }

    /// Execute one simulation tick: collect, activate every robot once, maybe spawn a task.
    pub fn step(&mut self) -> TickEvents {
        let mut events = TickEvents::default();
        self.stage_collect();
        self.stage_activation(&mut events);
        events.task_spawned = self.stage_task_spawn();
        self.advance_tick();
        events.tick = self.tick;
        events
    }

    /// Returns an immutable reference to configuration.
    #[must_use]
    pub fn config(&self) -> &SwarmConfig {
        &self.config
    }

    /// Current simulation tick.
    #[must_use]
    pub const fn tick(&self) -> Tick {
        self.tick
    }

    /// Iterate over retained tick summaries, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &TickSummary> {
        self.history.iter()
    }

    /// Most recent collector sample.
    #[must_use]
    pub fn latest_summary(&self) -> Option<&TickSummary> {
        self.history.back()
    }

    fn advance_tick(&mut self) {
        self.tick = self.tick.next();
    }

    #[must_use]
    pub fn grid(&self) -> &TorusGrid<AgentId> {
        &self.grid
    }

    #[must_use]
    pub fn tasks(&self) -> &TaskPool {
        &self.tasks
    }

    /// Robots in id order.
    #[must_use]
    pub fn robots(&self) -> &[Robot] {
        &self.robots
    }

    #[must_use]
    pub fn robot(&self, id: AgentId) -> Option<&Robot> {
        self.robots.get(id.index())
    }

    #[must_use]
    pub fn agent_count(&self) -> usize {
        self.robots.len()
    }

    /// Live metrics for the current state.
    #[must_use]
    pub fn metrics(&self) -> SwarmMetrics {
        SwarmMetrics::from_robots(&self.robots)
    }

    fn summarize(&self) -> TickSummary {
        TickSummary {
            tick: self.tick,
            agent_count: self.robots.len(),
            task_pool: self.tasks.len(),
            charging_agents: self.robots.iter().filter(|robot| robot.charging).count(),
            metrics: self.metrics(),
        }
    }

    fn agent_snapshots(&self) -> Vec<AgentSnapshot> {
        self.robots
            .iter()
            .enumerate()
            .map(|(idx, robot)| AgentSnapshot::capture(AgentId(idx as u32), robot))
            .collect()
    }

    /// Produce a read-only view of the world for rendering or export.
    #[must_use]
    pub fn snapshot(&self) -> WorldSnapshot {
        WorldSnapshot {
            tick: self.tick,
            width: self.grid.width(),
            height: self.grid.height(),
            metrics: self.metrics(),
            tasks: self.tasks.iter().collect(),
            agents: self.agent_snapshots(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn seeded(seed: u64) -> SmallRng {
        SmallRng::seed_from_u64(seed)
    }

    fn quiet_config(width: u32, height: u32) -> SwarmConfig {
        SwarmConfig {
            grid_width: width,
            grid_height: height,
            task_spawn_chance: 0.0,
            ..SwarmConfig::default()
        }
    }

    #[test]
    fn world_initialises_from_config() {
        let config = SwarmConfig {
            rng_seed: Some(42),
            ..SwarmConfig::default()
        };
        let world = SwarmWorld::new(config).expect("world");
        assert_eq!(world.agent_count(), 10);
        assert_eq!(world.tasks().len(), 15);
        assert_eq!(world.grid().agent_count(), 10);
        assert_eq!(world.tick(), Tick(0));
        for (idx, robot) in world.robots().iter().enumerate() {
            assert_eq!(robot.battery, 100);
            assert!(!robot.has_task());
            assert_eq!(
                world.grid().position_of(AgentId(idx as u32)),
                Some(robot.position)
            );
        }
    }

    #[test]
    fn config_validation_rejects_bad_values() {
        let cases = [
            SwarmConfig {
                grid_width: 2,
                ..SwarmConfig::default()
            },
            SwarmConfig {
                task_spawn_chance: 1.5,
                ..SwarmConfig::default()
            },
            SwarmConfig {
                history_capacity: 0,
                ..SwarmConfig::default()
            },
            SwarmConfig {
                battery: BatterySettings {
                    charge_threshold: 90,
                    ..BatterySettings::default()
                },
                ..SwarmConfig::default()
            },
            SwarmConfig {
                battery: BatterySettings {
                    initial: 150,
                    ..BatterySettings::default()
                },
                ..SwarmConfig::default()
            },
        ];
        for config in cases {
            assert!(matches!(
                SwarmWorld::new(config),
                Err(WorldStateError::InvalidConfig(_))
            ));
        }
    }

    #[test]
    fn initial_tasks_clamp_to_cell_count() {
        let config = SwarmConfig {
            grid_width: 3,
            grid_height: 3,
            robot_count: 1,
            initial_tasks: 50,
            rng_seed: Some(5),
            ..SwarmConfig::default()
        };
        let mut world = SwarmWorld::new(config).expect("world");
        assert_eq!(world.tasks().len(), 9);
        assert_eq!(world.add_task(), None);
    }

    #[test]
    fn task_on_own_cell_is_completed_in_place() {
        let origin = GridPos::new(0, 0);
        let mut world = SwarmWorld::with_layout(
            quiet_config(5, 5),
            seeded(1),
            vec![Robot::new(origin, 100)],
            [origin],
        )
        .expect("world");

        // First activation claims the only task, second delivers it.
        let events = world.step();
        assert_eq!(events.claimed, 1);
        let events = world.step();
        assert_eq!(events.completed, 1);

        let robot = world.robot(AgentId(0)).expect("robot");
        assert_eq!(robot.completed_tasks, 1);
        assert!(!robot.has_task());
        assert_eq!(robot.position, origin);
        assert!(world.tasks().is_empty());
    }

    #[test]
    fn committed_robot_on_target_completes_after_one_tick() {
        let origin = GridPos::new(0, 0);
        let mut world = SwarmWorld::with_layout(
            quiet_config(5, 5),
            seeded(2),
            vec![Robot::with_task(origin, 100, origin)],
            [origin],
        )
        .expect("world");
        world.step();
        let robot = world.robot(AgentId(0)).expect("robot");
        assert_eq!(robot.completed_tasks, 1);
        assert!(!robot.has_task());
        assert_eq!(robot.position, origin);
    }

    #[test]
    fn retained_tasks_stay_in_pool_when_removal_disabled() {
        let origin = GridPos::new(0, 0);
        let config = SwarmConfig {
            remove_completed_tasks: false,
            ..quiet_config(5, 5)
        };
        let mut world = SwarmWorld::with_layout(
            config,
            seeded(3),
            vec![Robot::with_task(origin, 100, origin)],
            [origin],
        )
        .expect("world");
        world.step();
        assert!(world.tasks().contains(origin));
    }

    #[test]
    fn low_battery_robot_starts_charging_without_moving() {
        let start = GridPos::new(2, 2);
        let mut world = SwarmWorld::with_layout(
            quiet_config(5, 5),
            seeded(4),
            vec![Robot::new(start, 20)],
            [GridPos::new(4, 4)],
        )
        .expect("world");
        let events = world.step();
        assert_eq!(events.started_charging, 1);
        let robot = world.robot(AgentId(0)).expect("robot");
        assert!(robot.charging);
        assert!(!robot.has_task());
        assert_eq!(robot.position, start);
        assert_eq!(robot.battery, 20);
    }

    #[test]
    fn boxed_in_idle_robots_hold_still() {
        let mut robots = Vec::new();
        for y in 0..3 {
            for x in 0..3 {
                robots.push(Robot::new(GridPos::new(x, y), 100));
            }
        }
        let mut world = SwarmWorld::with_layout(
            quiet_config(3, 3),
            seeded(5),
            robots.clone(),
            std::iter::empty(),
        )
        .expect("world");
        let events = world.step();
        assert_eq!(
            events,
            TickEvents {
                tick: Tick(1),
                ..TickEvents::default()
            }
        );
        assert_eq!(world.robots(), robots.as_slice());
    }

    #[test]
    fn collector_samples_before_activation() {
        let origin = GridPos::new(0, 0);
        let mut world = SwarmWorld::with_layout(
            quiet_config(5, 5),
            seeded(6),
            vec![Robot::with_task(origin, 100, origin)],
            [origin],
        )
        .expect("world");
        world.step();
        let first = *world.latest_summary().expect("summary");
        assert_eq!(first.tick, Tick(0));
        assert_eq!(first.metrics.completed_tasks, 0);
        assert_eq!(world.metrics().completed_tasks, 1);

        world.step();
        let second = world.latest_summary().expect("summary");
        assert_eq!(second.tick, Tick(1));
        assert_eq!(second.metrics.completed_tasks, 1);
        assert!((second.metrics.efficiency - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn history_is_bounded() {
        let config = SwarmConfig {
            rng_seed: Some(7),
            history_capacity: 4,
            ..SwarmConfig::default()
        };
        let mut world = SwarmWorld::new(config).expect("world");
        for _ in 0..10 {
            world.step();
        }
        let ticks: Vec<u64> = world.history().map(|summary| summary.tick.0).collect();
        assert_eq!(ticks, vec![6, 7, 8, 9]);
    }

    #[test]
    fn task_spawn_fills_pool_to_capacity() {
        let config = SwarmConfig {
            grid_width: 3,
            grid_height: 3,
            robot_count: 0,
            initial_tasks: 0,
            task_spawn_chance: 1.0,
            rng_seed: Some(8),
            ..SwarmConfig::default()
        };
        let mut world = SwarmWorld::new(config).expect("world");
        for tick in 0..20 {
            let events = world.step();
            assert!(world.tasks().len() <= 9);
            if tick < 9 {
                assert!(events.task_spawned.is_some());
            } else {
                assert_eq!(events.task_spawned, None);
            }
        }
        assert_eq!(world.tasks().len(), 9);
    }

    #[test]
    fn insert_task_rejects_out_of_bounds() {
        let mut world = SwarmWorld::with_layout(
            quiet_config(4, 4),
            seeded(9),
            Vec::new(),
            std::iter::empty(),
        )
        .expect("world");
        assert!(world.insert_task(GridPos::new(3, 3)).expect("insert"));
        assert!(!world.insert_task(GridPos::new(3, 3)).expect("insert"));
        assert!(matches!(
            world.insert_task(GridPos::new(4, 0)),
            Err(WorldStateError::Index(IndexError::OutOfBounds { .. }))
        ));
    }

    #[test]
    fn layout_rejects_robots_outside_config_limits() {
        let overcharged = SwarmWorld::with_layout(
            quiet_config(4, 4),
            seeded(12),
            vec![Robot::new(GridPos::new(0, 0), 150)],
            std::iter::empty(),
        );
        assert!(matches!(
            overcharged,
            Err(WorldStateError::InvalidConfig(_))
        ));

        let unreachable = SwarmWorld::with_layout(
            quiet_config(4, 4),
            seeded(13),
            vec![Robot::with_task(GridPos::new(0, 0), 100, GridPos::new(9, 1))],
            std::iter::empty(),
        );
        assert!(matches!(
            unreachable,
            Err(WorldStateError::Index(IndexError::OutOfBounds { .. }))
        ));

        let off_grid = SwarmWorld::with_layout(
            quiet_config(4, 4),
            seeded(14),
            vec![Robot::new(GridPos::new(4, 4), 100)],
            std::iter::empty(),
        );
        assert!(matches!(
            off_grid,
            Err(WorldStateError::Index(IndexError::OutOfBounds { .. }))
        ));

        let full = SwarmWorld::with_layout(
            quiet_config(4, 4),
            seeded(15),
            vec![Robot::with_task(GridPos::new(0, 0), 100, GridPos::new(3, 3))],
            [GridPos::new(3, 3)],
        );
        assert!(full.is_ok());
    }

    #[test]
    fn snapshot_reflects_robots_and_tasks() {
        let world = SwarmWorld::with_layout(
            quiet_config(5, 5),
            seeded(10),
            vec![
                Robot::new(GridPos::new(1, 1), 100),
                Robot::with_task(GridPos::new(2, 2), 50, GridPos::new(4, 4)),
            ],
            [GridPos::new(4, 4), GridPos::new(0, 3)],
        )
        .expect("world");
        let snapshot = world.snapshot();
        assert_eq!((snapshot.width, snapshot.height), (5, 5));
        assert_eq!(snapshot.tasks, vec![GridPos::new(0, 3), GridPos::new(4, 4)]);
        assert_eq!(snapshot.agents.len(), 2);
        assert_eq!(snapshot.agents[1].phase, RobotPhase::EnRoute);
        assert!(snapshot.agents[1].has_task);
        assert!((snapshot.metrics.average_battery - 75.0).abs() < f64::EPSILON);
    }

    #[derive(Clone, Default)]
    struct SpyPersistence {
        batches: Arc<Mutex<Vec<PersistenceBatch>>>,
    }

    impl WorldPersistence for SpyPersistence {
        fn on_tick(&mut self, payload: &PersistenceBatch) {
            self.batches.lock().expect("lock").push(payload.clone());
        }
    }

    #[test]
    fn persistence_receives_batches_on_interval() {
        let spy = SpyPersistence::default();
        let config = SwarmConfig {
            rng_seed: Some(11),
            persistence_interval: 2,
            ..SwarmConfig::default()
        };
        let mut world = SwarmWorld::with_persistence(config, Box::new(spy.clone())).expect("world");
        for _ in 0..5 {
            world.step();
        }
        let batches = spy.batches.lock().expect("lock");
        let ticks: Vec<u64> = batches.iter().map(|batch| batch.summary.tick.0).collect();
        assert_eq!(ticks, vec![0, 2, 4]);
        let first = &batches[0];
        assert_eq!(first.agents.len(), 10);
        assert!(
            first
                .metrics
                .iter()
                .any(|metric| metric.name == "completed_tasks")
        );
    }
}
