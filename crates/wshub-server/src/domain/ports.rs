//! Contiguous port ranges for the worker processes.

use std::ops::Range;

use rand::Rng;
use thiserror::Error;

/// Lowest port handed to a worker; everything below is privileged.
pub const MIN_PORT: u16 = 1024;

/// Errors building a [`PortAssignment`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PortError {
    #[error("server count must be at least 1")]
    Empty,

    #[error("{count} servers do not fit in ports 1024..=65535")]
    TooMany { count: u16 },

    #[error("ports {base}..{base}+{count} fall outside 1024..=65535")]
    OutOfRange { base: u16, count: u16 },
}

/// An immutable range of `count` consecutive ports starting at `base`.
///
/// Chosen once by the supervisor at startup; worker `i` listens on
/// `base + i`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortAssignment {
    base: u16,
    count: u16,
}

impl PortAssignment {
    /// Picks `base` uniformly from `[1024, 65535 - count]`.
    ///
    /// # Errors
    ///
    /// Returns [`PortError`] if `count` is zero or too large for the range.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use wshub_server::domain::PortAssignment;
    ///
    /// let ports = PortAssignment::random(3).unwrap();
    /// let all: Vec<u16> = ports.ports().collect();
    /// assert_eq!(all.len(), 3);
    /// assert_eq!(all[1], all[0] + 1);
    /// ```
    pub fn random(count: u16) -> Result<Self, PortError> {
        Self::random_with(&mut rand::thread_rng(), count)
    }

    /// Same as [`random`](Self::random) with an explicit RNG.
    pub fn random_with<R: Rng + ?Sized>(rng: &mut R, count: u16) -> Result<Self, PortError> {
        if count == 0 {
            return Err(PortError::Empty);
        }
        let highest_base = u16::MAX
            .checked_sub(count)
            .filter(|high| *high >= MIN_PORT)
            .ok_or(PortError::TooMany { count })?;
        let base = rng.gen_range(MIN_PORT..=highest_base);
        Ok(Self { base, count })
    }

    /// A fixed range, validated against `[1024, 65535]`.
    ///
    /// # Errors
    ///
    /// Returns [`PortError`] if the range is empty or leaves the valid span.
    pub fn new(base: u16, count: u16) -> Result<Self, PortError> {
        if count == 0 {
            return Err(PortError::Empty);
        }
        let last = u32::from(base) + u32::from(count) - 1;
        if base < MIN_PORT || last > u32::from(u16::MAX) {
            return Err(PortError::OutOfRange { base, count });
        }
        Ok(Self { base, count })
    }

    pub fn base(&self) -> u16 {
        self.base
    }

    pub fn count(&self) -> u16 {
        self.count
    }

    /// The assigned ports in ascending order.
    pub fn ports(&self) -> impl Iterator<Item = u16> {
        self.range().map(|port| port as u16)
    }

    fn range(&self) -> Range<u32> {
        let start = u32::from(self.base);
        start..start + u32::from(self.count)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
