//! Shared maze grid: placement, movement, line of sight, and view extraction
//!
//! The maze is a fixed rectangular grid of byte cells behind a single mutex.
//! Every primitive takes the lock for its whole duration so callers always
//! observe a consistent grid snapshot; none of them acquires any other lock.

use std::fmt;
use std::sync::Mutex;

use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;

/// Number of corridor steps in a first-person view.
pub const VIEW_DEPTH: usize = 8;
/// Cells per view row: left wall, corridor, right wall.
pub const VIEW_WIDTH: usize = 3;

/// Column indices within a view row.
pub const LEFT_WALL: usize = 0;
pub const CORRIDOR: usize = 1;
pub const RIGHT_WALL: usize = 2;

/// A first-person view strip, one row per corridor step.
pub type View = [[u8; VIEW_WIDTH]; VIEW_DEPTH];

/// The byte occupying an unoccupied cell.
pub const EMPTY: u8 = b' ';

/// Wall byte painted for view cells that fall outside the grid.
const BORDER: u8 = b'*';

const MAX_PLACEMENT_ATTEMPTS: usize = 1000;

/// An empty cell holds a space; anything else is a wall or an avatar.
pub fn is_empty(cell: u8) -> bool {
    cell == EMPTY
}

/// Avatars are the uppercase ASCII letters; they double as player identity.
pub fn is_avatar(cell: u8) -> bool {
    cell.is_ascii_uppercase()
}

/// A cardinal gaze direction.
///
/// The encoding (N=0, W=1, S=2, E=3) is load-bearing: rotation is modular
/// arithmetic on it and the view extractor indexes the offset tables with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Direction {
    North = 0,
    West = 1,
    South = 2,
    East = 3,
}

/// Per-direction forward steps as (row, col) deltas.
const FORWARD: [(i64, i64); 4] = [(-1, 0), (0, -1), (1, 0), (0, 1)];
/// Perpendicular-left steps; perpendicular-right is the negation.
const LEFT: [(i64, i64); 4] = [(0, -1), (1, 0), (0, 1), (-1, 0)];

impl Direction {
    fn from_index(index: u8) -> Direction {
        match index & 3 {
            0 => Direction::North,
            1 => Direction::West,
            2 => Direction::South,
            _ => Direction::East,
        }
    }

    pub fn reverse(self) -> Direction {
        Direction::from_index(self as u8 + 2)
    }

    pub fn turn_left(self) -> Direction {
        Direction::from_index(self as u8 + 1)
    }

    pub fn turn_right(self) -> Direction {
        Direction::from_index(self as u8 + 3)
    }

    /// The (row, col) delta of one forward step.
    pub fn offset(self) -> (i64, i64) {
        FORWARD[self as usize]
    }

    fn left_offset(self) -> (i64, i64) {
        LEFT[self as usize]
    }
}

/// Rejected maze template shapes.
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("maze template has no rows")]
    Empty,
    #[error("maze template row {row} is {len} cells wide, expected {expected}")]
    RaggedRow {
        row: usize,
        len: usize,
        expected: usize,
    },
}

#[derive(Debug)]
struct Grid {
    cells: Vec<Vec<u8>>,
    rng: StdRng,
}

impl Grid {
    fn rows(&self) -> usize {
        self.cells.len()
    }

    fn cols(&self) -> usize {
        self.cells[0].len()
    }

    /// The cell at signed coordinates, or `None` outside the grid.
    fn at(&self, row: i64, col: i64) -> Option<u8> {
        if row < 0 || col < 0 {
            return None;
        }
        self.cells
            .get(row as usize)
            .and_then(|r| r.get(col as usize))
            .copied()
    }

    fn place(&mut self, avatar: u8, row: usize, col: usize) -> bool {
        if row >= self.rows() || col >= self.cols() {
            debug!(
                "maze: out of bounds placement [{}, {}] for {}",
                row, col, avatar as char
            );
            return false;
        }
        if !is_empty(self.cells[row][col]) {
            return false;
        }
        self.cells[row][col] = avatar;
        debug!("maze: placed {} at [{}, {}]", avatar as char, row, col);
        true
    }
}

/// The process-wide maze grid. Dimensions are established at construction
/// and immutable thereafter; at most one cell ever holds a given avatar.
#[derive(Debug)]
pub struct Maze {
    grid: Mutex<Grid>,
}

impl Maze {
    /// Builds the grid from template rows and seeds the placement RNG.
    /// All rows must be the same non-zero width.
    pub fn new<S: AsRef<str>>(template: &[S]) -> Result<Maze, TemplateError> {
        if template.is_empty() || template[0].as_ref().is_empty() {
            return Err(TemplateError::Empty);
        }
        let expected = template[0].as_ref().len();
        let mut cells = Vec::with_capacity(template.len());
        for (row, line) in template.iter().enumerate() {
            let line = line.as_ref();
            if line.len() != expected {
                return Err(TemplateError::RaggedRow {
                    row,
                    len: line.len(),
                    expected,
                });
            }
            cells.push(line.as_bytes().to_vec());
        }

        let maze = Maze {
            grid: Mutex::new(Grid {
                cells,
                rng: StdRng::from_entropy(),
            }),
        };
        debug!(
            "maze: initialized {} x {} grid",
            maze.rows(),
            maze.cols()
        );
        Ok(maze)
    }

    pub fn rows(&self) -> usize {
        self.grid.lock().unwrap().rows()
    }

    pub fn cols(&self) -> usize {
        self.grid.lock().unwrap().cols()
    }

    /// Places an avatar at a specific cell. Succeeds only when the cell is
    /// in bounds and currently empty.
    pub fn set_player(&self, avatar: u8, row: usize, col: usize) -> bool {
        self.grid.lock().unwrap().place(avatar, row, col)
    }

    /// Places an avatar at a random empty cell, trying up to 1000 uniform
    /// positions. Returns the chosen coordinates, or `None` when no attempt
    /// landed (the maze is effectively full).
    pub fn set_player_random(&self, avatar: u8) -> Option<(usize, usize)> {
        let mut grid = self.grid.lock().unwrap();
        let (rows, cols) = (grid.rows(), grid.cols());
        for _ in 0..MAX_PLACEMENT_ATTEMPTS {
            let row = grid.rng.gen_range(0..rows);
            let col = grid.rng.gen_range(0..cols);
            if grid.place(avatar, row, col) {
                return Some((row, col));
            }
        }
        debug!(
            "maze: no empty cell found for {} after {} attempts",
            avatar as char, MAX_PLACEMENT_ATTEMPTS
        );
        None
    }

    /// Clears a cell, but only if it still holds the given avatar.
    /// Idempotent otherwise.
    pub fn remove(&self, avatar: u8, row: usize, col: usize) {
        let mut grid = self.grid.lock().unwrap();
        if grid.at(row as i64, col as i64) == Some(avatar) {
            grid.cells[row][col] = EMPTY;
            debug!("maze: removed {} from [{}, {}]", avatar as char, row, col);
        }
    }

    /// Moves the avatar at (row, col) one step in `dir`. Succeeds only when
    /// the source holds an avatar and the destination is in bounds and
    /// empty; on failure the grid is untouched.
    pub fn try_move(&self, row: usize, col: usize, dir: Direction) -> bool {
        let mut grid = self.grid.lock().unwrap();

        let source = grid.at(row as i64, col as i64);
        if !source.is_some_and(is_avatar) {
            return false;
        }

        let (dr, dc) = dir.offset();
        let (new_row, new_col) = (row as i64 + dr, col as i64 + dc);
        if !grid.at(new_row, new_col).is_some_and(is_empty) {
            return false;
        }

        grid.cells[new_row as usize][new_col as usize] = grid.cells[row][col];
        grid.cells[row][col] = EMPTY;
        true
    }

    /// Scans from (row, col) in `dir`, stopping at the first non-empty cell
    /// or the grid edge. Returns that cell if it is an avatar, else EMPTY.
    /// Does not mutate the grid.
    pub fn find_target(&self, row: usize, col: usize, dir: Direction) -> u8 {
        let grid = self.grid.lock().unwrap();
        let (dr, dc) = dir.offset();
        let (mut row, mut col) = (row as i64, col as i64);

        loop {
            row += dr;
            col += dc;
            match grid.at(row, col) {
                None => return EMPTY,
                Some(cell) if is_empty(cell) => continue,
                Some(cell) => return if is_avatar(cell) { cell } else { EMPTY },
            }
        }
    }

    /// Extracts the first-person view from (row, col) looking along `gaze`.
    ///
    /// Step `d` of the view is the corridor cell `d` forward steps away
    /// (step 0 is the viewer's own cell) flanked by the cells one unit
    /// perpendicular left and right of it; flanking cells outside the grid
    /// render as `*`. Extraction stops at the first corridor step that
    /// leaves the grid; the number of steps written is returned.
    pub fn get_view(
        &self,
        view: &mut View,
        row: usize,
        col: usize,
        gaze: Direction,
        depth: usize,
    ) -> usize {
        let grid = self.grid.lock().unwrap();
        let (dr, dc) = gaze.offset();
        let (lr, lc) = gaze.left_offset();

        let mut actual_depth = 0;
        for d in 0..depth.min(VIEW_DEPTH) {
            let r = row as i64 + d as i64 * dr;
            let c = col as i64 + d as i64 * dc;
            let Some(corridor) = grid.at(r, c) else {
                break;
            };
            view[d][CORRIDOR] = corridor;
            view[d][LEFT_WALL] = grid.at(r + lr, c + lc).unwrap_or(BORDER);
            view[d][RIGHT_WALL] = grid.at(r - lr, c - lc).unwrap_or(BORDER);
            actual_depth += 1;
        }
        actual_depth
    }
}

impl fmt::Display for Maze {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let grid = self.grid.lock().unwrap();
        for row in &grid.cells {
            writeln!(f, "{}", String::from_utf8_lossy(row))?;
        }
        Ok(())
    }
}
