//! Test doubles.
//!
//! In-memory stand-ins for the engine's collaborators, for unit and
//! integration tests. Compiled with the `test-utils` feature (on by default).

pub mod clock;
pub mod services;
pub mod storage;

pub use clock::{FixedClock, ManualClock};
pub use services::MockServiceResolver;
pub use storage::{FaultyStorage, SlowStorage, UnavailableStorage};
