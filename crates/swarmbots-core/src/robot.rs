//! Robot records, the shared task pool, and the per-tick decision state machine.

use rand::seq::IndexedRandom;
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::BTreeSet;
use std::fmt;
use swarmbots_index::{GridPos, IndexError, NeighborhoodIndex};

use crate::BatterySettings;

/// Stable robot identifier, assigned sequentially when the world is built.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
pub struct AgentId(pub u32);

impl AgentId {
    /// Position of the robot inside the world's roster.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "robot-{}", self.0)
    }
}

/// Behavioural phase derived from a robot's fields.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum RobotPhase {
    Charging,
    SeekingTask,
    EnRoute,
    /// Standing on the target; resolved during the robot's next activation.
    Delivering,
}

/// Plain data record for a single robot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Robot {
    pub position: GridPos,
    /// Committed target. `Some` exactly when the robot has a task.
    pub task_location: Option<GridPos>,
    /// Lifetime number of deliveries.
    pub completed_tasks: u64,
    pub battery: u32,
    /// Lifetime number of idle wandering moves.
    pub steps_taken: u64,
    pub charging: bool,
}

impl Robot {
    /// A fresh robot with no task.
    #[must_use]
    pub const fn new(position: GridPos, battery: u32) -> Self {
        Self {
            position,
            task_location: None,
            completed_tasks: 0,
            battery,
            steps_taken: 0,
            charging: false,
        }
    }

    /// A fresh robot already committed to `task`.
    #[must_use]
    pub fn with_task(position: GridPos, battery: u32, task: GridPos) -> Self {
        let mut robot = Self::new(position, battery);
        robot.task_location = Some(task);
        robot
    }

    #[must_use]
    pub const fn has_task(&self) -> bool {
        self.task_location.is_some()
    }

    #[must_use]
    pub fn phase(&self) -> RobotPhase {
        if self.charging {
            return RobotPhase::Charging;
        }
        match self.task_location {
            None => RobotPhase::SeekingTask,
            Some(target) if target == self.position => RobotPhase::Delivering,
            Some(_) => RobotPhase::EnRoute,
        }
    }
}

/// Unclaimed-in-data-structure task locations.
///
/// Claiming a task does not remove it; several robots may chase the same cell.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskPool {
    locations: BTreeSet<GridPos>,
}

impl TaskPool {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.locations.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }

    #[must_use]
    pub fn contains(&self, location: GridPos) -> bool {
        self.locations.contains(&location)
    }

    /// Returns `false` if the location was already pending.
    pub fn insert(&mut self, location: GridPos) -> bool {
        self.locations.insert(location)
    }

    pub fn remove(&mut self, location: GridPos) -> bool {
        self.locations.remove(&location)
    }

    /// Locations in ascending `(x, y)` order.
    pub fn iter(&self) -> impl Iterator<Item = GridPos> + '_ {
        self.locations.iter().copied()
    }

    /// Pick one pending location uniformly at random.
    pub fn choose(&self, rng: &mut dyn RngCore) -> Option<GridPos> {
        if self.locations.is_empty() {
            return None;
        }
        let idx = rng.random_range(0..self.locations.len());
        self.locations.iter().nth(idx).copied()
    }
}

impl FromIterator<GridPos> for TaskPool {
    fn from_iter<I: IntoIterator<Item = GridPos>>(iter: I) -> Self {
        Self {
            locations: iter.into_iter().collect(),
        }
    }
}

/// Outcome of one robot activation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RobotAction {
    /// Gained charge; `finished` when charging ended this tick.
    Charged { battery: u32, finished: bool },
    /// Hit the charge threshold, dropping whatever task it held.
    StartedCharging { abandoned: Option<GridPos> },
    Completed { location: GridPos },
    Advanced { from: GridPos, to: GridPos },
    /// The greedy step toward the target was occupied.
    Blocked { toward: GridPos },
    Claimed { location: GridPos },
    Wandered { from: GridPos, to: GridPos },
    /// Idle with every neighbor occupied.
    Stranded,
}

/// Run one activation of `robot` against the shared grid and task pool.
///
/// Evaluation order: an active charge cycle, the low-battery guard, delivery,
/// greedy stepping toward the target, claiming a task, idle wandering.
pub fn step_robot<G>(
    id: AgentId,
    robot: &mut Robot,
    grid: &mut G,
    tasks: &TaskPool,
    battery: &BatterySettings,
    rng: &mut dyn RngCore,
) -> Result<RobotAction, IndexError>
where
    G: NeighborhoodIndex<Key = AgentId> + ?Sized,
{
    if robot.charging {
        robot.battery = robot
            .battery
            .saturating_add(battery.charge_rate)
            .min(battery.capacity);
        let finished = robot.battery >= battery.resume_level;
        if finished {
            robot.charging = false;
        }
        return Ok(RobotAction::Charged {
            battery: robot.battery,
            finished,
        });
    }

    if robot.battery <= battery.charge_threshold {
        robot.charging = true;
        let abandoned = robot.task_location.take();
        return Ok(RobotAction::StartedCharging { abandoned });
    }

    if let Some(target) = robot.task_location {
        if robot.position == target {
            robot.completed_tasks += 1;
            robot.task_location = None;
            return Ok(RobotAction::Completed { location: target });
        }
        return advance_toward(id, robot, grid, target);
    }

    if let Some(location) = tasks.choose(rng) {
        robot.task_location = Some(location);
        return Ok(RobotAction::Claimed { location });
    }

    wander(id, robot, grid, battery, rng)
}

/// Neighbor closest to `target`; ties go to the earliest neighbor in enumeration order.
#[must_use]
pub fn best_step(neighbors: &[GridPos; 8], target: GridPos) -> GridPos {
    let mut best = neighbors[0];
    let mut best_distance = best.distance_sq(target);
    for &candidate in &neighbors[1..] {
        let distance = candidate.distance_sq(target);
        if distance < best_distance {
            best = candidate;
            best_distance = distance;
        }
    }
    best
}

fn advance_toward<G>(
    id: AgentId,
    robot: &mut Robot,
    grid: &mut G,
    target: GridPos,
) -> Result<RobotAction, IndexError>
where
    G: NeighborhoodIndex<Key = AgentId> + ?Sized,
{
    let step = best_step(&grid.moore_neighborhood(robot.position), target);
    if !grid.is_cell_empty(step) {
        return Ok(RobotAction::Blocked { toward: step });
    }
    let from = grid.move_agent(id, step)?;
    robot.position = step;
    Ok(RobotAction::Advanced { from, to: step })
}

fn wander<G>(
    id: AgentId,
    robot: &mut Robot,
    grid: &mut G,
    battery: &BatterySettings,
    rng: &mut dyn RngCore,
) -> Result<RobotAction, IndexError>
where
    G: NeighborhoodIndex<Key = AgentId> + ?Sized,
{
    let free: SmallVec<[GridPos; 8]> = grid
        .moore_neighborhood(robot.position)
        .into_iter()
        .filter(|cell| grid.is_cell_empty(*cell))
        .collect();
    let Some(&to) = free.as_slice().choose(rng) else {
        return Ok(RobotAction::Stranded);
    };
    let from = grid.move_agent(id, to)?;
    robot.position = to;
    robot.battery = robot
        .battery
        .saturating_sub(battery.move_cost)
        .max(battery.charge_threshold);
    robot.steps_taken += 1;
    Ok(RobotAction::Wandered { from, to })
}
