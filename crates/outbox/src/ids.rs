//! Entity identifier generation
//!
//! Domain entities get 63-bit integer ids that sort roughly by creation time.
//! The layout follows the Sonyflake scheme:
//!
//! ```text
//! | 39 bits: time in 10ms units since epoch | 8 bits: sequence | 16 bits: machine |
//! ```

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use thiserror::Error;

use crate::record::Clock;

const TIME_BITS: u32 = 39;
const SEQUENCE_BITS: u32 = 8;
const MACHINE_BITS: u32 = 16;
const SEQUENCE_MASK: u16 = (1 << SEQUENCE_BITS) - 1;
/// 10ms
const TIME_UNIT_MILLIS: i64 = 10;

/// Identifier generation errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdError {
    /// Wall clock went backwards past the last issued id
    #[error("clock moved backwards by {0}ms")]
    ClockMovedBackwards(i64),

    /// The 39-bit time space is used up
    #[error("identifier time space exhausted")]
    Exhausted,

    /// Current time precedes the generator epoch
    #[error("current time is before the generator epoch")]
    BeforeEpoch,
}

/// Supplies unique, roughly time-ordered identifiers
pub trait IdGenerator: Send + Sync + 'static {
    fn next_id(&self) -> Result<i64, IdError>;
}

struct SnowflakeState {
    /// Last clock reading, in time units
    observed: i64,
    /// Time slot of the last issued id (may run ahead of `observed`)
    elapsed: i64,
    sequence: u16,
}

/// Sonyflake-style generator
///
/// Up to 256 ids per 10ms slot per machine. When a slot is exhausted the
/// generator borrows from the next slot instead of sleeping, so ids stay
/// unique and increasing while drifting slightly ahead of the clock.
pub struct Snowflake<C> {
    clock: C,
    epoch: DateTime<Utc>,
    machine_id: u16,
    state: Mutex<SnowflakeState>,
}

impl<C: Clock> Snowflake<C> {
    /// Create a generator with the default epoch (2024-01-01T00:00:00Z)
    pub fn new(clock: C, machine_id: u16) -> Self {
        let epoch = Utc
            .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
            .single()
            .unwrap_or_default();
        Self::with_epoch(clock, machine_id, epoch)
    }

    pub fn with_epoch(clock: C, machine_id: u16, epoch: DateTime<Utc>) -> Self {
        Self {
            clock,
            epoch,
            machine_id,
            state: Mutex::new(SnowflakeState {
                observed: -1,
                elapsed: -1,
                sequence: SEQUENCE_MASK,
            }),
        }
    }

    pub fn machine_id(&self) -> u16 {
        self.machine_id
    }

    fn current_elapsed(&self) -> Result<i64, IdError> {
        let millis = (self.clock.now() - self.epoch).num_milliseconds();
        if millis < 0 {
            return Err(IdError::BeforeEpoch);
        }
        Ok(millis / TIME_UNIT_MILLIS)
    }

    fn compose(&self, elapsed: i64, sequence: u16) -> Result<i64, IdError> {
        if elapsed >= 1 << TIME_BITS {
            return Err(IdError::Exhausted);
        }
        Ok((elapsed << (SEQUENCE_BITS + MACHINE_BITS))
            | ((sequence as i64) << MACHINE_BITS)
            | self.machine_id as i64)
    }
}

impl<C: Clock> IdGenerator for Snowflake<C> {
    fn next_id(&self) -> Result<i64, IdError> {
        let now = self.current_elapsed()?;
        let mut state = self.state.lock();

        if now < state.observed {
            return Err(IdError::ClockMovedBackwards(
                (state.observed - now) * TIME_UNIT_MILLIS,
            ));
        }
        state.observed = now;

        if now > state.elapsed {
            state.elapsed = now;
            state.sequence = 0;
        } else {
            state.sequence = (state.sequence + 1) & SEQUENCE_MASK;
            if state.sequence == 0 {
                state.elapsed += 1;
            }
        }

        self.compose(state.elapsed, state.sequence)
    }
}
