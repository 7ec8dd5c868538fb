//! Forwarding directions within a session.

use std::fmt;
use std::ops::{Index, IndexMut};

/// One of the two forwarding directions of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Client to target.
    Read,
    /// Target to client.
    Write,
}

impl Direction {
    /// Both directions, read first.
    pub const ALL: [Direction; 2] = [Direction::Read, Direction::Write];

    /// Short lowercase name used in log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Read => "read",
            Direction::Write => "write",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A value held once per direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PerDirection<T> {
    pub read: T,
    pub write: T,
}

impl<T> PerDirection<T> {
    pub fn new(read: T, write: T) -> Self {
        Self { read, write }
    }

    pub fn map<U>(self, mut f: impl FnMut(T) -> U) -> PerDirection<U> {
        PerDirection {
            read: f(self.read),
            write: f(self.write),
        }
    }
}

impl<T> Index<Direction> for PerDirection<T> {
    type Output = T;

    fn index(&self, direction: Direction) -> &T {
        match direction {
            Direction::Read => &self.read,
            Direction::Write => &self.write,
        }
    }
}

impl<T> IndexMut<Direction> for PerDirection<T> {
    fn index_mut(&mut self, direction: Direction) -> &mut T {
        match direction {
            Direction::Read => &mut self.read,
            Direction::Write => &mut self.write,
        }
    }
}
