//! Shared fixtures for unit tests: simulated hardware, a manual clock,
//! record builders and temporary files.

mod fixtures;
mod simulated;
mod temp;

pub use fixtures::{hex_record, ConfigBuilder, HexFileBuilder, PoolBuilder};
pub use simulated::{ManualClock, SimulatedCard, SimulatedHpi};
pub use temp::TestContext;
