pub mod clock;
pub mod register;

pub use clock::{Clock, SystemClock};
pub use register::RegisterAccess;

#[cfg(test)]
pub use clock::MockClock;
#[cfg(test)]
pub use register::MockRegisterAccess;
