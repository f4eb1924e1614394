//! Per-peer bitrate envelope

use crate::config::BitrateBounds;
use serde::Serialize;

/// Allowed bitrate range and current value for one peer
///
/// `floor <= current <= ceiling` holds after every operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BitrateEnvelope {
    floor: u64,
    ceiling: u64,
    current: u64,
}

impl BitrateEnvelope {
    /// Envelope starting at `bounds.start`, clamped into range
    pub fn new(bounds: BitrateBounds) -> Self {
        let (floor, ceiling) = ordered(bounds.floor, bounds.ceiling);
        Self {
            floor,
            ceiling,
            current: bounds.start.clamp(floor, ceiling),
        }
    }

    pub fn floor(&self) -> u64 {
        self.floor
    }

    pub fn ceiling(&self) -> u64 {
        self.ceiling
    }

    pub fn current(&self) -> u64 {
        self.current
    }

    /// Clamp an arbitrary target (possibly negative) into `[floor, ceiling]`
    pub fn clamp(&self, target: i64) -> u64 {
        if target <= 0 {
            return self.floor;
        }
        (target as u64).clamp(self.floor, self.ceiling)
    }

    /// Move `current` to the clamped target
    ///
    /// Returns the new value, or `None` when it equals the current one.
    pub fn set(&mut self, target: i64) -> Option<u64> {
        let next = self.clamp(target);
        if next == self.current {
            return None;
        }
        self.current = next;
        Some(next)
    }

    /// Replace the range, keeping `current` inside it
    pub fn rebound(&mut self, floor: u64, ceiling: u64) {
        let (floor, ceiling) = ordered(floor, ceiling);
        self.floor = floor;
        self.ceiling = ceiling;
        self.current = self.current.clamp(floor, ceiling);
    }
}

fn ordered(a: u64, b: u64) -> (u64, u64) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}
