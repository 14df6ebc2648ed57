//! DuckDB-backed persistence layer for SwarmBots.

use duckdb::{Connection, Transaction, params};
use std::{
    sync::{Arc, Mutex, MutexGuard, mpsc},
    thread,
};
use swarmbots_core::{AgentSnapshot, PersistenceBatch, WorldPersistence};
use thiserror::Error;
use tracing::{error, warn};

const DEFAULT_TICK_BUFFER: usize = 32;
const DEFAULT_AGENT_BUFFER: usize = 1024;
const DEFAULT_METRIC_BUFFER: usize = 256;

/// Storage error wrapper.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("duckdb error: {0}")]
    DuckDb(#[from] duckdb::Error),
    #[error("storage worker error: {0}")]
    Worker(String),
}

/// Summary row written to the `ticks` table.
#[derive(Debug, Clone)]
struct TickRow {
    tick: i64,
    agent_count: i64,
    task_pool: i64,
    charging_agents: i64,
    completed_tasks: i64,
    steps_taken: i64,
    efficiency: f64,
    average_battery: f64,
}

/// Metric row written to the `metrics` table.
#[derive(Debug, Clone)]
struct MetricRow {
    tick: i64,
    name: String,
    value: f64,
}

/// Agent snapshot row.
#[derive(Debug, Clone)]
struct AgentRow {
    tick: i64,
    agent_id: i64,
    position_x: i64,
    position_y: i64,
    task_x: Option<i64>,
    task_y: Option<i64>,
    charging: bool,
    battery: i64,
    completed_tasks: i64,
    steps_taken: i64,
    phase: String,
}

/// Latest metric reading fetched for analytics displays.
#[derive(Debug, Clone)]
pub struct MetricReading {
    pub tick: i64,
    pub name: String,
    pub value: f64,
}

/// Per-robot totals aggregated across recorded ticks.
#[derive(Debug, Clone)]
pub struct PerformerStats {
    pub agent_id: u32,
    pub completed_tasks: i64,
    pub steps_taken: i64,
    pub avg_battery: f64,
    pub last_tick: i64,
}

#[derive(Default)]
struct StorageBuffer {
    ticks: Vec<TickRow>,
    metrics: Vec<MetricRow>,
    agents: Vec<AgentRow>,
}

impl StorageBuffer {
    fn is_empty(&self) -> bool {
        self.ticks.is_empty() && self.metrics.is_empty() && self.agents.is_empty()
    }

    fn clear(&mut self) {
        self.ticks.clear();
        self.metrics.clear();
        self.agents.clear();
    }
}

/// DuckDB-backed persistence sink with buffered writes.
pub struct Storage {
    conn: Connection,
    buffer: StorageBuffer,
    tick_flush_threshold: usize,
    agent_flush_threshold: usize,
    metric_flush_threshold: usize,
}

impl Storage {
    /// Open or create a DuckDB database at the provided path with default buffering thresholds.
    pub fn open(path: &str) -> Result<Self, StorageError> {
        Self::with_thresholds(
            path,
            DEFAULT_TICK_BUFFER,
            DEFAULT_AGENT_BUFFER,
            DEFAULT_METRIC_BUFFER,
        )
    }

    /// Open a throwaway in-memory database.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::from_connection(
            Connection::open_in_memory()?,
            DEFAULT_TICK_BUFFER,
            DEFAULT_AGENT_BUFFER,
            DEFAULT_METRIC_BUFFER,
        )
    }

    /// Override flush thresholds for ticks, agents, and metrics respectively.
    pub fn with_thresholds(
        path: &str,
        tick: usize,
        agent: usize,
        metric: usize,
    ) -> Result<Self, StorageError> {
        Self::from_connection(Connection::open(path)?, tick, agent, metric)
    }

    fn from_connection(
        conn: Connection,
        tick: usize,
        agent: usize,
        metric: usize,
    ) -> Result<Self, StorageError> {
        let mut storage = Self {
            conn,
            buffer: StorageBuffer::default(),
            tick_flush_threshold: tick.max(1),
            agent_flush_threshold: agent.max(1),
            metric_flush_threshold: metric.max(1),
        };
        storage.initialize_schema()?;
        Ok(storage)
    }

    fn initialize_schema(&mut self) -> Result<(), StorageError> {
        self.conn.execute(
            "create table if not exists ticks (
                tick bigint primary key,
                agent_count integer,
                task_pool integer,
                charging_agents integer,
                completed_tasks bigint,
                steps_taken bigint,
                efficiency double,
                average_battery double
            )",
            [],
        )?;
        self.conn.execute(
            "create table if not exists metrics (
                tick bigint,
                name text,
                value double,
                primary key (tick, name)
            )",
            [],
        )?;
        self.conn.execute(
            "create table if not exists agents (
                tick bigint,
                agent_id bigint,
                position_x integer,
                position_y integer,
                task_x integer,
                task_y integer,
                charging boolean,
                battery integer,
                completed_tasks bigint,
                steps_taken bigint,
                phase text,
                primary key (tick, agent_id)
            )",
            [],
        )?;
        Ok(())
    }

    fn enqueue(&mut self, payload: &PersistenceBatch) -> Result<(), StorageError> {
        let summary = &payload.summary;
        let tick = summary.tick.0 as i64;

        self.buffer.ticks.push(TickRow {
            tick,
            agent_count: summary.agent_count as i64,
            task_pool: summary.task_pool as i64,
            charging_agents: summary.charging_agents as i64,
            completed_tasks: summary.metrics.completed_tasks as i64,
            steps_taken: summary.metrics.steps_taken as i64,
            efficiency: summary.metrics.efficiency,
            average_battery: summary.metrics.average_battery,
        });

        for metric in &payload.metrics {
            self.buffer.metrics.push(MetricRow {
                tick,
                name: metric.name.to_string(),
                value: metric.value,
            });
        }

        for agent in &payload.agents {
            self.buffer
                .agents
                .push(agent_row_from_snapshot(tick, agent));
        }

        self.maybe_flush()
    }

    /// Persist a simulation payload, buffering until thresholds are met.
    pub fn persist(&mut self, payload: &PersistenceBatch) -> Result<(), StorageError> {
        self.enqueue(payload)
    }

    fn maybe_flush(&mut self) -> Result<(), StorageError> {
        if self.buffer.ticks.len() >= self.tick_flush_threshold
            || self.buffer.metrics.len() >= self.metric_flush_threshold
            || self.buffer.agents.len() >= self.agent_flush_threshold
        {
            self.flush()?;
        }
        Ok(())
    }

    fn insert_ticks(tx: &Transaction<'_>, rows: &[TickRow]) -> Result<(), duckdb::Error> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut stmt = tx.prepare(
            "insert or replace into ticks (
                tick, agent_count, task_pool, charging_agents,
                completed_tasks, steps_taken, efficiency, average_battery
            ) values (?, ?, ?, ?, ?, ?, ?, ?)",
        )?;
        for row in rows {
            stmt.execute(params![
                row.tick,
                row.agent_count,
                row.task_pool,
                row.charging_agents,
                row.completed_tasks,
                row.steps_taken,
                row.efficiency,
                row.average_battery,
            ])?;
        }
        Ok(())
    }

    fn insert_metrics(tx: &Transaction<'_>, rows: &[MetricRow]) -> Result<(), duckdb::Error> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut stmt =
            tx.prepare("insert or replace into metrics (tick, name, value) values (?, ?, ?)")?;
        for row in rows {
            stmt.execute(params![row.tick, row.name, row.value])?;
        }
        Ok(())
    }

    fn insert_agents(tx: &Transaction<'_>, rows: &[AgentRow]) -> Result<(), duckdb::Error> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut stmt = tx.prepare(
            "insert or replace into agents (
                tick, agent_id, position_x, position_y, task_x, task_y,
                charging, battery, completed_tasks, steps_taken, phase
            ) values (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )?;
        for row in rows {
            stmt.execute(params![
                row.tick,
                row.agent_id,
                row.position_x,
                row.position_y,
                row.task_x,
                row.task_y,
                row.charging,
                row.battery,
                row.completed_tasks,
                row.steps_taken,
                row.phase,
            ])?;
        }
        Ok(())
    }

    /// Force flush buffered records to disk.
    pub fn flush(&mut self) -> Result<(), StorageError> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        let tx = self.conn.transaction()?;
        Self::insert_ticks(&tx, &self.buffer.ticks)?;
        Self::insert_metrics(&tx, &self.buffer.metrics)?;
        Self::insert_agents(&tx, &self.buffer.agents)?;
        tx.commit()?;
        self.buffer.clear();
        Ok(())
    }

    /// Number of tick summaries written so far.
    pub fn tick_count(&mut self) -> Result<i64, StorageError> {
        self.flush()?;
        let count = self
            .conn
            .query_row("select count(*) from ticks", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Cumulative completed tasks per recorded tick, oldest first.
    pub fn completion_curve(&mut self) -> Result<Vec<(i64, i64)>, StorageError> {
        self.flush()?;
        let mut stmt = self
            .conn
            .prepare("select tick, completed_tasks from ticks order by tick asc")?;
        let mut rows = stmt.query([])?;
        let mut curve = Vec::new();
        while let Some(row) = rows.next()? {
            curve.push((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?));
        }
        Ok(curve)
    }

    /// Return robots ranked by deliveries across all recorded ticks.
    pub fn top_performers(&mut self, limit: usize) -> Result<Vec<PerformerStats>, StorageError> {
        self.flush()?;
        let mut stmt = self.conn.prepare(
            "select agent_id,
                    max(completed_tasks) as completed,
                    max(steps_taken) as steps,
                    avg(battery) as avg_battery,
                    max(tick) as last_tick
             from agents
             group by agent_id
             order by completed desc, agent_id asc
             limit ?",
        )?;
        let mut rows = stmt.query(params![limit as i64])?;
        let mut stats = Vec::with_capacity(limit.min(16));
        while let Some(row) = rows.next()? {
            stats.push(PerformerStats {
                agent_id: row.get::<_, i64>(0)? as u32,
                completed_tasks: row.get::<_, i64>(1)?,
                steps_taken: row.get::<_, i64>(2)?,
                avg_battery: row.get::<_, f64>(3)?,
                last_tick: row.get::<_, i64>(4)?,
            });
        }
        Ok(stats)
    }

    /// Metrics from the most recent persisted tick, ordered by name, at most `limit` rows.
    pub fn latest_metrics(&mut self, limit: usize) -> Result<Vec<MetricReading>, StorageError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.flush()?;
        let mut stmt = self.conn.prepare(
            "select tick, name, value
             from metrics
             where tick = (select max(tick) from metrics)
             order by name asc
             limit ?",
        )?;
        let mut rows = stmt.query(params![limit as i64])?;
        let mut readings = Vec::new();
        while let Some(row) = rows.next()? {
            readings.push(MetricReading {
                tick: row.get(0)?,
                name: row.get(1)?,
                value: row.get(2)?,
            });
        }
        Ok(readings)
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        if let Err(err) = self.flush() {
            error!(%err, "failed to flush persistence buffer on drop");
        }
    }
}

impl WorldPersistence for Storage {
    fn on_tick(&mut self, payload: &PersistenceBatch) {
        if let Err(err) = self.persist(payload) {
            warn!(
                tick = payload.summary.tick.0,
                %err,
                "failed to enqueue persistence data"
            );
        }
    }
}

#[derive(Debug)]
enum StorageCommand {
    Persist(PersistenceBatch),
    Flush,
    Shutdown,
}

/// Moves DuckDB writes onto a dedicated worker thread.
pub struct StoragePipeline {
    tx: mpsc::Sender<StorageCommand>,
    storage: Arc<Mutex<Storage>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl StoragePipeline {
    /// Create an asynchronous pipeline using default buffering thresholds.
    pub fn new(path: &str) -> Result<Self, StorageError> {
        Self::from_storage(Storage::open(path)?)
    }

    /// Create an asynchronous pipeline with explicit thresholds.
    pub fn with_thresholds(
        path: &str,
        tick: usize,
        agent: usize,
        metric: usize,
    ) -> Result<Self, StorageError> {
        let storage = Storage::with_thresholds(path, tick, agent, metric)?;
        Self::from_storage(storage)
    }

    fn from_storage(storage: Storage) -> Result<Self, StorageError> {
        let shared = Arc::new(Mutex::new(storage));
        let (tx, rx) = mpsc::channel::<StorageCommand>();
        let worker_storage = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("swarmbots-storage-worker".into())
            .spawn(move || {
                while let Ok(command) = rx.recv() {
                    let mut storage = lock_storage(&worker_storage);
                    match command {
                        StorageCommand::Persist(batch) => {
                            if let Err(err) = storage.persist(&batch) {
                                error!(
                                    tick = batch.summary.tick.0,
                                    %err,
                                    "failed to persist tick asynchronously"
                                );
                            }
                        }
                        StorageCommand::Flush => {
                            if let Err(err) = storage.flush() {
                                error!(%err, "failed to flush storage");
                            }
                        }
                        StorageCommand::Shutdown => {
                            if let Err(err) = storage.flush() {
                                error!(%err, "failed to flush storage on shutdown");
                            }
                            break;
                        }
                    }
                }
            })
            .map_err(|err| {
                StorageError::Worker(format!("failed to spawn storage worker thread: {err}"))
            })?;

        Ok(Self {
            tx,
            storage: shared,
            handle: Some(handle),
        })
    }

    /// Exposes shared access to the underlying storage for analytics queries.
    #[must_use]
    pub fn storage(&self) -> Arc<Mutex<Storage>> {
        Arc::clone(&self.storage)
    }

    /// Request an immediate flush of buffered records.
    pub fn flush(&self) {
        let _ = self.tx.send(StorageCommand::Flush);
    }
}

impl WorldPersistence for StoragePipeline {
    fn on_tick(&mut self, payload: &PersistenceBatch) {
        if self
            .tx
            .send(StorageCommand::Persist(payload.clone()))
            .is_err()
        {
            warn!(
                tick = payload.summary.tick.0,
                "storage worker channel closed; tick dropped"
            );
        }
    }
}

impl Drop for StoragePipeline {
    fn drop(&mut self) {
        let _ = self.tx.send(StorageCommand::Shutdown);
        if let Some(handle) = self.handle.take() {
            if let Err(err) = handle.join() {
                error!(?err, "storage worker thread panicked");
            }
        }
    }
}

/// Lock shared storage, recovering the guard if a previous holder panicked.
fn lock_storage(storage: &Mutex<Storage>) -> MutexGuard<'_, Storage> {
    storage.lock().unwrap_or_else(|poisoned| {
        warn!("storage mutex poisoned; continuing with recovered state");
        poisoned.into_inner()
    })
}

fn agent_row_from_snapshot(tick: i64, agent: &AgentSnapshot) -> AgentRow {
    AgentRow {
        tick,
        agent_id: i64::from(agent.id.0),
        position_x: i64::from(agent.position.x),
        position_y: i64::from(agent.position.y),
        task_x: agent.task_location.map(|task| i64::from(task.x)),
        task_y: agent.task_location.map(|task| i64::from(task.y)),
        charging: agent.charging,
        battery: i64::from(agent.battery),
        completed_tasks: agent.completed_tasks as i64,
        steps_taken: agent.steps_taken as i64,
        phase: format!("{:?}", agent.phase),
    }
}
