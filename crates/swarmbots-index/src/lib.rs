//! Spatial indexing for agents living on a wrapping (toroidal) integer grid.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use thiserror::Error;

/// Smallest edge length that still yields eight distinct Moore neighbors.
pub const MIN_GRID_EDGE: u32 = 3;

/// Relative offsets visited by [`NeighborhoodIndex::moore_neighborhood`], rows outermost.
const MOORE_OFFSETS: [(i64, i64); 8] = [
    (-1, -1),
    (0, -1),
    (1, -1),
    (-1, 0),
    (1, 0),
    (-1, 1),
    (0, 1),
    (1, 1),
];

/// Errors emitted by spatial index implementations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IndexError {
    /// Indicates configuration values that cannot be used (e.g., a grid edge below three cells).
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// A coordinate outside `0..width` x `0..height` was supplied.
    #[error("position {pos} lies outside a {width}x{height} grid")]
    OutOfBounds { pos: GridPos, width: u32, height: u32 },
    /// The agent handle was never placed on the grid.
    #[error("agent is not placed on the grid")]
    UnknownAgent,
}

/// Integer cell coordinate.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
pub struct GridPos {
    pub x: u32,
    pub y: u32,
}

impl GridPos {
    /// Construct a new cell coordinate.
    #[must_use]
    pub const fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }

    /// Squared Euclidean distance on raw coordinates (no wrap-around shortcut).
    #[must_use]
    pub fn distance_sq(self, other: GridPos) -> u64 {
        let dx = i64::from(self.x) - i64::from(other.x);
        let dy = i64::from(self.y) - i64::from(other.y);
        (dx * dx + dy * dy) as u64
    }
}

impl fmt::Display for GridPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// Common behaviour exposed by neighborhood indices.
pub trait NeighborhoodIndex {
    /// Handle type stored in grid cells.
    type Key: Copy + Eq;

    /// The eight wrapped neighbors of `pos` in enumeration order.
    ///
    /// The order is row-major starting at the upper-left neighbor; callers
    /// picking the "first best" neighbor rely on it being stable.
    fn moore_neighborhood(&self, pos: GridPos) -> [GridPos; 8];

    /// Agents currently standing on `pos`; empty when the cell is free or out of bounds.
    fn occupants(&self, pos: GridPos) -> &[Self::Key];

    /// Returns `true` when nobody stands on `pos`.
    fn is_cell_empty(&self, pos: GridPos) -> bool {
        self.occupants(pos).is_empty()
    }

    /// Relocate `key` to `to`, returning the cell it left. No capacity check is applied.
    fn move_agent(&mut self, key: Self::Key, to: GridPos) -> Result<GridPos, IndexError>;
}

/// Multi-occupancy grid that wraps at both edges.
#[derive(Debug, Clone)]
pub struct TorusGrid<K> {
    width: u32,
    height: u32,
    cells: Vec<SmallVec<[K; 2]>>,
    locations: HashMap<K, GridPos>,
}

impl<K: Copy + Eq + Hash> TorusGrid<K> {
    /// Create an empty grid. Both edges must be at least [`MIN_GRID_EDGE`] cells.
    pub fn new(width: u32, height: u32) -> Result<Self, IndexError> {
        if width < MIN_GRID_EDGE || height < MIN_GRID_EDGE {
            return Err(IndexError::InvalidConfig(
                "grid width and height must be at least 3",
            ));
        }
        let len = (width as usize) * (height as usize);
        Ok(Self {
            width,
            height,
            cells: vec![SmallVec::new(); len],
            locations: HashMap::new(),
        })
    }

    #[must_use]
    pub const fn width(&self) -> u32 {
        self.width
    }

    #[must_use]
    pub const fn height(&self) -> u32 {
        self.height
    }

    /// Total number of cells.
    #[must_use]
    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    /// Number of agents placed on the grid.
    #[must_use]
    pub fn agent_count(&self) -> usize {
        self.locations.len()
    }

    /// Returns `true` if `pos` lies inside the grid.
    #[must_use]
    pub fn contains(&self, pos: GridPos) -> bool {
        pos.x < self.width && pos.y < self.height
    }

    #[inline]
    fn offset(&self, pos: GridPos) -> usize {
        (pos.y as usize) * (self.width as usize) + (pos.x as usize)
    }

    fn check_bounds(&self, pos: GridPos) -> Result<(), IndexError> {
        if self.contains(pos) {
            Ok(())
        } else {
            Err(IndexError::OutOfBounds {
                pos,
                width: self.width,
                height: self.height,
            })
        }
    }

    /// Wrap an arbitrary signed coordinate onto the torus.
    #[must_use]
    pub fn wrap(&self, x: i64, y: i64) -> GridPos {
        GridPos::new(
            x.rem_euclid(i64::from(self.width)) as u32,
            y.rem_euclid(i64::from(self.height)) as u32,
        )
    }

    /// Put `key` on `pos`. A key that is already placed is moved instead.
    pub fn place(&mut self, key: K, pos: GridPos) -> Result<(), IndexError> {
        self.check_bounds(pos)?;
        if self.locations.contains_key(&key) {
            self.move_agent(key, pos)?;
            return Ok(());
        }
        let idx = self.offset(pos);
        self.cells[idx].push(key);
        self.locations.insert(key, pos);
        Ok(())
    }

    /// Take `key` off the grid, returning its last cell.
    pub fn remove(&mut self, key: K) -> Option<GridPos> {
        let pos = self.locations.remove(&key)?;
        let idx = self.offset(pos);
        self.cells[idx].retain(|occupant| *occupant != key);
        Some(pos)
    }

    /// Cell currently occupied by `key`.
    #[must_use]
    pub fn position_of(&self, key: K) -> Option<GridPos> {
        self.locations.get(&key).copied()
    }

    /// Iterate over the cells that hold at least one agent.
    pub fn occupied_cells(&self) -> impl Iterator<Item = (GridPos, &[K])> + '_ {
        let width = self.width as usize;
        self.cells
            .iter()
            .enumerate()
            .filter(|(_, cell)| !cell.is_empty())
            .map(move |(idx, cell)| {
                let pos = GridPos::new((idx % width) as u32, (idx / width) as u32);
                (pos, cell.as_slice())
            })
    }
}

impl<K: Copy + Eq + Hash> NeighborhoodIndex for TorusGrid<K> {
    type Key = K;

    fn moore_neighborhood(&self, pos: GridPos) -> [GridPos; 8] {
        let x = i64::from(pos.x);
        let y = i64::from(pos.y);
        MOORE_OFFSETS.map(|(dx, dy)| self.wrap(x + dx, y + dy))
    }

    fn occupants(&self, pos: GridPos) -> &[K] {
        if !self.contains(pos) {
            return &[];
        }
        &self.cells[self.offset(pos)]
    }

    fn move_agent(&mut self, key: K, to: GridPos) -> Result<GridPos, IndexError> {
        self.check_bounds(to)?;
        let from = self
            .locations
            .get(&key)
            .copied()
            .ok_or(IndexError::UnknownAgent)?;
        if from == to {
            return Ok(from);
        }
        let from_idx = self.offset(from);
        self.cells[from_idx].retain(|occupant| *occupant != key);
        let to_idx = self.offset(to);
        self.cells[to_idx].push(key);
        self.locations.insert(key, to);
        Ok(from)
    }
}
