//! Command/response engine for the DSP command buffer.
//!
//! One command is in flight at a time:
//! 1. Submit - write a CRC-protected command buffer with `NEW_COMMAND` set
//! 2. Poll - read the control/status word until the busy bits clear
//! 3. Decide - accept, reject, or go around again (bounded attempts)

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::config::{
    status, DspCommand, BUSY_TEST_TRIES, COMMAND_BUFFER_ADDR, COMMAND_STATUS_ADDR,
    MEMORY_MAP_ADDR, SEND_COMMAND_MAX_TRIES,
};
use super::error::{Upc2Error, Upc2Result};
use super::layout::{CommandBuffer, MemoryMapSnapshot};
use super::transport::LocalBus;
use crate::traits::Clock;

/// Groups of commands sharing a poll budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandClass {
    /// Quick reads of device information.
    Query,
    /// Ordinary commands such as stop or load from flash.
    Standard,
    CalibrationSave,
    ConfigSave,
    CollectionStart,
    SerialNumber,
    /// Flash programming, by far the slowest.
    Firmware,
}

/// Poll budgets per command class.
///
/// A class allows `busy_test_tries * multiplier` status reads per attempt.
/// `poll_interval_us` inserts a sleep between reads and `timeout_ms` caps
/// the wall-clock time of one attempt; both are off by default, which
/// gives a tight loop bounded only by the iteration count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PollPolicy {
    pub busy_test_tries: u32,
    pub query: u32,
    pub standard: u32,
    pub calibration_save: u32,
    pub config_save: u32,
    pub collection_start: u32,
    pub serial_number: u32,
    pub firmware: u32,
    pub poll_interval_us: u64,
    pub timeout_ms: Option<u64>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            busy_test_tries: BUSY_TEST_TRIES,
            query: 1,
            standard: 100,
            calibration_save: 1000,
            config_save: 2000,
            collection_start: 1000,
            serial_number: 1000,
            firmware: 40_000,
            poll_interval_us: 0,
            timeout_ms: None,
        }
    }
}

impl PollPolicy {
    pub fn multiplier(&self, class: CommandClass) -> u32 {
        match class {
            CommandClass::Query => self.query,
            CommandClass::Standard => self.standard,
            CommandClass::CalibrationSave => self.calibration_save,
            CommandClass::ConfigSave => self.config_save,
            CommandClass::CollectionStart => self.collection_start,
            CommandClass::SerialNumber => self.serial_number,
            CommandClass::Firmware => self.firmware,
        }
    }

    /// Status reads allowed per attempt for `class`.
    pub fn iterations(&self, class: CommandClass) -> u64 {
        self.multiplier(class) as u64 * self.busy_test_tries as u64
    }
}

/// What the device must show before a command counts as accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acceptance {
    /// Busy bits clear and `COMPLETED_OK` set.
    Completion,
    /// Command picked up and the device reports `COLLECTING_DATA`.
    Collecting,
}

/// A command ready for submission.
#[derive(Debug, Clone, Copy)]
pub struct CommandRequest {
    pub command: DspCommand,
    pub params: [i32; 2],
    pub class: CommandClass,
    pub acceptance: Acceptance,
}

impl CommandRequest {
    pub fn new(command: DspCommand, class: CommandClass) -> Self {
        Self {
            command,
            params: [0, 0],
            class,
            acceptance: Acceptance::Completion,
        }
    }

    pub fn params(mut self, params: [i32; 2]) -> Self {
        self.params = params;
        self
    }

    /// Start of data collection: the device never reports completion, it
    /// moves into the collecting state.
    pub fn start_collection() -> Self {
        Self {
            command: DspCommand::StartDataCollection,
            params: [0, 0],
            class: CommandClass::CollectionStart,
            acceptance: Acceptance::Collecting,
        }
    }
}

/// Outcome of one poll pass.
enum PollOutcome {
    /// A status word satisfying the predicate.
    Settled(u32),
    /// Budget ran out; carries the last status seen, if any.
    Exhausted(Option<u32>),
}

/// Read the memory map header and command buffer in one transfer.
pub fn fetch_snapshot(bus: &mut dyn LocalBus) -> Upc2Result<MemoryMapSnapshot> {
    let mut raw = [0u8; MemoryMapSnapshot::SIZE];
    bus.read(MEMORY_MAP_ADDR, &mut raw)?;
    MemoryMapSnapshot::parse(&raw)
}

/// Drives submit/poll/retry for one card.
pub struct CommandEngine<'a> {
    policy: &'a PollPolicy,
    attempts: u32,
    clock: &'a dyn Clock,
}

impl<'a> CommandEngine<'a> {
    pub fn new(policy: &'a PollPolicy, clock: &'a dyn Clock) -> Self {
        Self {
            policy,
            attempts: SEND_COMMAND_MAX_TRIES,
            clock,
        }
    }

    /// Override the number of submit+poll cycles.
    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    /// Write a fresh command buffer.
    pub fn submit(
        &self,
        bus: &mut dyn LocalBus,
        command: DspCommand,
        params: [i32; 2],
    ) -> Upc2Result<()> {
        let buffer = CommandBuffer::new(command, params);
        debug!(
            "Submitting {} (0x{:08X}) params={:?}",
            command.description(),
            command.code(),
            params
        );
        bus.write(COMMAND_BUFFER_ADDR, &buffer.to_bytes())
    }

    fn read_status(bus: &mut dyn LocalBus) -> Upc2Result<u32> {
        let mut raw = [0u8; 4];
        bus.read(COMMAND_STATUS_ADDR, &mut raw)?;
        Ok(u32::from_le_bytes(raw))
    }

    /// Poll the status word until `done` holds or the budget is spent.
    ///
    /// Failed status reads count against the budget but don't end the loop.
    fn poll_until(
        &self,
        bus: &mut dyn LocalBus,
        class: CommandClass,
        done: impl Fn(u32) -> bool,
    ) -> PollOutcome {
        let iterations = self.policy.iterations(class);
        let started = self.clock.now_ms();
        let mut last = None;

        for _ in 0..iterations {
            if let Ok(status) = Self::read_status(bus) {
                last = Some(status);
                if done(status) {
                    return PollOutcome::Settled(status);
                }
            }
            if let Some(timeout) = self.policy.timeout_ms {
                if self.clock.now_ms().saturating_sub(started) >= timeout {
                    break;
                }
            }
            if self.policy.poll_interval_us > 0 {
                std::thread::sleep(Duration::from_micros(self.policy.poll_interval_us));
            }
        }
        PollOutcome::Exhausted(last)
    }

    /// Wait for the busy bits to clear.
    pub fn poll(&self, bus: &mut dyn LocalBus, class: CommandClass) -> Option<u32> {
        match self.poll_until(bus, class, |s| !status::is_busy(s)) {
            PollOutcome::Settled(status) => Some(status),
            PollOutcome::Exhausted(_) => None,
        }
    }

    /// One submit+poll cycle. `Ok(true)` accepts, `Ok(false)` asks for
    /// another attempt.
    fn attempt(&self, bus: &mut dyn LocalBus, request: &CommandRequest) -> Upc2Result<bool> {
        self.submit(bus, request.command, request.params)?;
        let code = request.command.code() as u32;

        // Collecting data is itself a busy state, so a start command only
        // waits for the device to pick it up.
        let picked_up = match request.acceptance {
            Acceptance::Completion => self.poll_until(bus, request.class, |s| !status::is_busy(s)),
            Acceptance::Collecting => {
                self.poll_until(bus, request.class, |s| s & status::NEW_COMMAND == 0)
            }
        };
        let settled = match picked_up {
            PollOutcome::Settled(status) => status,
            PollOutcome::Exhausted(last) => {
                debug!(
                    "{} not settled after poll budget, last status {:?}",
                    request.command.description(),
                    last
                );
                return Ok(false);
            }
        };

        if settled & status::BAD_CRC != 0 {
            warn!("Device reported bad CRC for {}", request.command.description());
            return Ok(false);
        }
        if settled & status::COMPLETED_NG != 0 {
            return Err(Upc2Error::CommandRejected { command: code });
        }

        match request.acceptance {
            Acceptance::Completion => Ok(settled & status::COMPLETED_OK != 0),
            Acceptance::Collecting if settled & status::COLLECTING_DATA != 0 => Ok(true),
            Acceptance::Collecting => {
                let collecting =
                    self.poll_until(bus, request.class, |s| s & status::COLLECTING_DATA != 0);
                Ok(matches!(collecting, PollOutcome::Settled(_)))
            }
        }
    }

    /// Run a command to completion, retrying bad CRCs and poll timeouts.
    pub fn execute(&self, bus: &mut dyn LocalBus, request: CommandRequest) -> Upc2Result<()> {
        for attempt in 1..=self.attempts {
            if self.attempt(bus, &request)? {
                debug!(
                    "{} accepted on attempt {}",
                    request.command.description(),
                    attempt
                );
                return Ok(());
            }
        }
        warn!(
            "{} failed after {} attempts",
            request.command.description(),
            self.attempts
        );
        Err(Upc2Error::RetryLimitExceeded {
            command: request.command.code() as u32,
            attempts: self.attempts,
        })
    }

    /// Check the device is idle before running the command.
    ///
    /// The check reads a fresh snapshot and does not use up an attempt.
    pub fn execute_when_idle(
        &self,
        bus: &mut dyn LocalBus,
        request: CommandRequest,
    ) -> Upc2Result<()> {
        if fetch_snapshot(bus)?.is_busy() {
            return Err(Upc2Error::Busy);
        }
        self.execute(bus, request)
    }
}
