//! Generates globally unique, time-ordered 64 bit ids.
//!
//! An id packs four fields: `(millis - EPOCH) << 22 | datacenter << 17 | machine << 12 |
//! sequence`. This yields 41 effective timestamp bits (roughly 69 years past the epoch),
//! 5 bits each for the datacenter and machine and a 12 bit sequence which permits 4096
//! ids per millisecond and generator.
//!
//! Ids from a single generator are strictly increasing as long as the system clock does
//! not move backwards. If it does, [next_id](IdGenerator::next_id) fails fast with
//! [IdError::ClockRegression] rather than silently handing out an id which might collide
//! with one given out earlier. Generators with distinct (datacenter, machine) pairs can
//! never produce equal ids, even within the same millisecond.
//!
//! # Example
//!
//! ```
//! # use palisade::snowflake::IdGenerator;
//! let generator = IdGenerator::new(1, 1).unwrap();
//!
//! let first = generator.next_id().unwrap();
//! let second = generator.next_id().unwrap();
//! assert!(second > first);
//!
//! // Out of range identities are rejected at construction...
//! assert_eq!(IdGenerator::new(0, 32).is_err(), true);
//! ```
use crate::clock;
use crate::config::Config;
use crate::platform::Platform;
use std::sync::{Arc, Mutex};

/// The fixed epoch (in unix millis) from which the timestamp bits are counted.
///
/// This value must never change once ids have been handed out, as all ordering guarantees
/// are relative to it.
const EPOCH: u64 = 1_744_383_328_694;

/// Number of bits occupied by the per-millisecond sequence.
const SEQUENCE_BITS: u64 = 12;

/// Number of bits occupied by the machine id.
const MACHINE_BITS: u64 = 5;

/// Number of bits occupied by the datacenter id.
const DATACENTER_BITS: u64 = 5;

/// Largest permitted sequence value (4095).
const MAX_SEQUENCE: u64 = (1 << SEQUENCE_BITS) - 1;

/// Largest permitted machine id (31).
pub const MAX_MACHINE_ID: u64 = (1 << MACHINE_BITS) - 1;

/// Largest permitted datacenter id (31).
pub const MAX_DATACENTER_ID: u64 = (1 << DATACENTER_BITS) - 1;

const MACHINE_SHIFT: u64 = SEQUENCE_BITS;
const DATACENTER_SHIFT: u64 = SEQUENCE_BITS + MACHINE_BITS;
const TIMESTAMP_SHIFT: u64 = SEQUENCE_BITS + MACHINE_BITS + DATACENTER_BITS;

/// Enumerates the ways id generation can fail.
///
/// Both kinds are deliberate refusals: an invalid identity would silently produce
/// colliding ids across machines, and a backwards running clock would re-issue timestamp
/// bits which have already been handed out.
#[derive(Debug, thiserror::Error)]
pub enum IdError {
    /// The datacenter or machine id passed to the constructor is out of range.
    #[error("The {field} id {value} is out of range - permitted values are 0 to {max}.")]
    InvalidIdentity {
        /// Names the offending field ("datacenter" or "machine").
        field: &'static str,
        /// The rejected value.
        value: u64,
        /// The largest permitted value.
        max: u64,
    },

    /// The system clock reports an earlier millisecond than one we already used.
    #[error(
        "The system clock moved backwards ({observed} < {last_seen}). Refusing to generate an id."
    )]
    ClockRegression {
        /// The millisecond reported by the clock.
        observed: u64,
        /// The last millisecond an id was generated in.
        last_seen: u64,
    },
}

/// Tracks the per-generator state guarded by the internal mutex.
struct GeneratorState {
    last_millis: u64,
    sequence: u64,
}

/// Produces unique, time-ordered 64 bit ids for one (datacenter, machine) identity.
///
/// The generator is cheap to share: [next_id](IdGenerator::next_id) serializes all
/// callers on an internal mutex, which also provides the strict ordering guarantee.
pub struct IdGenerator {
    datacenter_id: u64,
    machine_id: u64,
    state: Mutex<GeneratorState>,
}

impl IdGenerator {
    /// Creates a generator for the given datacenter and machine identity.
    ///
    /// # Errors
    /// Fails with [IdError::InvalidIdentity] if either id exceeds its 5 bit range.
    pub fn new(datacenter_id: u64, machine_id: u64) -> Result<Self, IdError> {
        if datacenter_id > MAX_DATACENTER_ID {
            return Err(IdError::InvalidIdentity {
                field: "datacenter",
                value: datacenter_id,
                max: MAX_DATACENTER_ID,
            });
        }
        if machine_id > MAX_MACHINE_ID {
            return Err(IdError::InvalidIdentity {
                field: "machine",
                value: machine_id,
                max: MAX_MACHINE_ID,
            });
        }

        Ok(IdGenerator {
            datacenter_id,
            machine_id,
            state: Mutex::new(GeneratorState {
                last_millis: 0,
                sequence: 0,
            }),
        })
    }

    /// Generates the next id.
    ///
    /// Within a single millisecond up to 4096 ids are handed out. Once the sequence is
    /// exhausted, we busy-poll the clock until the next millisecond starts - this bounds
    /// the only wait in here to under a millisecond.
    ///
    /// # Errors
    /// Fails with [IdError::ClockRegression] if the clock runs behind the last observed
    /// millisecond. This is never resolved silently: the caller has to decide whether to
    /// retry once the clock caught up.
    pub fn next_id(&self) -> Result<u64, IdError> {
        let mut state = self.state.lock().unwrap();

        let mut now = clock::unix_millis();
        if now < state.last_millis {
            return Err(IdError::ClockRegression {
                observed: now,
                last_seen: state.last_millis,
            });
        }

        if now == state.last_millis {
            state.sequence = (state.sequence + 1) & MAX_SEQUENCE;
            if state.sequence == 0 {
                // Sequence exhausted for this millisecond - wait for the next tick.
                now = Self::await_next_millis(state.last_millis);
            }
        } else {
            state.sequence = 0;
        }

        state.last_millis = now;

        Ok((now - EPOCH) << TIMESTAMP_SHIFT
            | self.datacenter_id << DATACENTER_SHIFT
            | self.machine_id << MACHINE_SHIFT
            | state.sequence)
    }

    /// Busy-polls the clock until it has advanced past the given millisecond.
    fn await_next_millis(last_millis: u64) -> u64 {
        let mut now = clock::unix_millis();
        while now <= last_millis {
            std::hint::spin_loop();
            now = clock::unix_millis();
        }
        now
    }
}

/// Creates an id generator from the system config and registers it in the platform.
///
/// The identity is read from `id_generator.datacenter` and `id_generator.machine`. An out
/// of range identity aborts the startup, as silently falling back to a default would risk
/// id collisions across the deployment.
pub fn install(platform: Arc<Platform>) -> anyhow::Result<()> {
    let settings = platform.require::<Config>().current().id_generator.clone();
    let generator = IdGenerator::new(settings.datacenter, settings.machine)?;

    log::info!(
        "Id generator ready (datacenter: {}, machine: {}).",
        settings.datacenter,
        settings.machine
    );
    platform.register::<IdGenerator>(Arc::new(generator));

    Ok(())
}
