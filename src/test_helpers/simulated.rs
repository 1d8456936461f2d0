use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::pci::config::{
    status, COMMAND_BUFFER_ADDR, COMMAND_BUFFER_SIZE, COMMAND_STATUS_ADDR, HPI_ADDRESS_REG,
    HPI_CONTROL_REG, HPI_DATA_AUTOINC_REG, HPI_DATA_FIXED_REG, POOL_HEADER_ADDR,
    POOL_HEADER_SIZE,
};
use crate::pci::layout::CommandBuffer;
use crate::pci::ring::FramePoolHeader;
use crate::pci::transport::validate_access;
use crate::pci::{LocalBus, Upc2Error, Upc2Result};
use crate::traits::{Clock, RegisterAccess};

/// Card register file backed by a word map, with a working address
/// register and both data ports.
pub struct SimulatedHpi {
    memory: HashMap<u32, u32>,
    address: u32,
    control: u32,
    spacing: u32,
}

impl SimulatedHpi {
    pub fn new() -> Self {
        Self::with_spacing(1)
    }

    /// Registers `spacing` apart. Wide spacing also mirrors HPIC every
    /// 0x10 bytes, as DMA-modified cards do.
    pub fn with_spacing(spacing: u32) -> Self {
        Self {
            memory: HashMap::new(),
            address: 0,
            control: 0,
            spacing,
        }
    }

    pub fn poke_words(&mut self, addr: u32, words: &[u32]) {
        for (i, &word) in words.iter().enumerate() {
            self.memory.insert(addr + i as u32 * 4, word);
        }
    }

    fn decode(&self, offset: u32) -> Option<u32> {
        if self.spacing > 1 && offset < self.spacing && offset % 0x10 == 0 {
            return Some(HPI_CONTROL_REG);
        }
        if offset % self.spacing != 0 {
            return None;
        }
        Some(offset / self.spacing)
    }
}

impl RegisterAccess for SimulatedHpi {
    fn read_register(&mut self, offset: u32) -> u32 {
        match self.decode(offset) {
            Some(HPI_CONTROL_REG) => self.control,
            Some(HPI_ADDRESS_REG) => self.address,
            Some(HPI_DATA_AUTOINC_REG) => {
                let word = self.memory.get(&self.address).copied().unwrap_or(0);
                self.address = self.address.wrapping_add(4);
                word
            }
            Some(HPI_DATA_FIXED_REG) => self.memory.get(&self.address).copied().unwrap_or(0),
            _ => 0,
        }
    }

    fn write_register(&mut self, offset: u32, value: u32) {
        match self.decode(offset) {
            Some(HPI_CONTROL_REG) => self.control = value,
            Some(HPI_ADDRESS_REG) => self.address = value,
            Some(HPI_DATA_AUTOINC_REG) => {
                self.memory.insert(self.address, value);
                self.address = self.address.wrapping_add(4);
            }
            Some(HPI_DATA_FIXED_REG) => {
                self.memory.insert(self.address, value);
            }
            _ => {}
        }
    }
}

#[derive(Default)]
struct CardState {
    memory: HashMap<u32, u32>,
    responses: VecDeque<u32>,
    fallback: Option<u32>,
    busy_polls: u32,
    busy_remaining: u32,
    failing_reads: u32,
    submits: usize,
    status_reads: usize,
    last_command: Option<CommandBuffer>,
}

/// Card memory plus a scripted command processor.
///
/// Clones share state, so a test can keep a handle after boxing one into a
/// card context. Every submitted command sets the status word to the next
/// scripted response (default `COMPLETED_OK`).
#[derive(Clone, Default)]
pub struct SimulatedCard {
    state: Arc<Mutex<CardState>>,
}

impl SimulatedCard {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, CardState> {
        self.state.lock().unwrap()
    }

    /// Answer successive commands with `responses`, then fall back.
    pub fn respond_in_order(self, responses: Vec<u32>) -> Self {
        self.state().responses = responses.into();
        self
    }

    /// Answer every command not covered by `respond_in_order` with `status`.
    pub fn respond_always(self, status: u32) -> Self {
        self.state().fallback = Some(status);
        self
    }

    /// Report `PROCESSING_COMMAND` for the first `polls` status reads after
    /// each submit.
    pub fn busy_polls(self, polls: u32) -> Self {
        self.state().busy_polls = polls;
        self
    }

    /// Fail the next `reads` status reads with a communication error.
    pub fn failing_status_reads(self, reads: u32) -> Self {
        self.state().failing_reads = reads;
        self
    }

    pub fn set_status(&self, value: u32) {
        self.state().memory.insert(COMMAND_STATUS_ADDR, value);
    }

    pub fn poke_words(&self, addr: u32, words: &[u32]) {
        let mut state = self.state();
        for (i, &word) in words.iter().enumerate() {
            state.memory.insert(addr + i as u32 * 4, word);
        }
    }

    /// Store bytes, zero padding the final word.
    pub fn poke_bytes(&self, addr: u32, bytes: &[u8]) {
        let words: Vec<u32> = bytes
            .chunks(4)
            .map(|c| {
                let mut w = [0u8; 4];
                w[..c.len()].copy_from_slice(c);
                u32::from_le_bytes(w)
            })
            .collect();
        self.poke_words(addr, &words);
    }

    pub fn peek(&self, addr: u32) -> u32 {
        self.state().memory.get(&addr).copied().unwrap_or(0)
    }

    pub fn submit_count(&self) -> usize {
        self.state().submits
    }

    pub fn status_reads(&self) -> usize {
        self.state().status_reads
    }

    pub fn last_command(&self) -> Option<CommandBuffer> {
        self.state().last_command
    }

    pub fn pool_header(&self) -> FramePoolHeader {
        let state = self.state();
        let raw: Vec<u8> = (0..POOL_HEADER_SIZE as u32 / 4)
            .flat_map(|i| {
                let word = state.memory.get(&(POOL_HEADER_ADDR + i * 4));
                word.copied().unwrap_or(0).to_le_bytes()
            })
            .collect();
        FramePoolHeader::parse(&raw).unwrap()
    }
}

impl LocalBus for SimulatedCard {
    fn read(&mut self, addr: u32, dest: &mut [u8]) -> Upc2Result<()> {
        validate_access(addr, dest.len())?;
        let mut state = self.state();

        if addr == COMMAND_STATUS_ADDR && dest.len() == 4 {
            state.status_reads += 1;
            if state.failing_reads > 0 {
                state.failing_reads -= 1;
                return Err(Upc2Error::comm("simulated status read failure"));
            }
            if state.busy_remaining > 0 {
                state.busy_remaining -= 1;
                dest.copy_from_slice(&status::PROCESSING_COMMAND.to_le_bytes());
                return Ok(());
            }
        }

        for (i, chunk) in dest.chunks_exact_mut(4).enumerate() {
            let word = state.memory.get(&(addr + i as u32 * 4)).copied().unwrap_or(0);
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        Ok(())
    }

    fn write(&mut self, addr: u32, src: &[u8]) -> Upc2Result<()> {
        validate_access(addr, src.len())?;
        let mut state = self.state();
        for (i, chunk) in src.chunks_exact(4).enumerate() {
            let word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            state.memory.insert(addr + i as u32 * 4, word);
        }

        if addr == COMMAND_BUFFER_ADDR && src.len() == COMMAND_BUFFER_SIZE {
            state.submits += 1;
            state.last_command = Some(CommandBuffer::parse(src)?);
            state.busy_remaining = state.busy_polls;
            let response = state
                .responses
                .pop_front()
                .or(state.fallback)
                .unwrap_or(status::COMPLETED_OK);
            state.memory.insert(COMMAND_STATUS_ADDR, response);
        }
        Ok(())
    }
}

/// Clock that only moves when told to, optionally stepping on every read.
pub struct ManualClock {
    now: AtomicU64,
    step: u64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: AtomicU64::new(start_ms),
            step: 0,
        }
    }

    /// Advance by `step_ms` after every `now_ms` call.
    pub fn auto_advance(mut self, step_ms: u64) -> Self {
        self.step = step_ms;
        self
    }

    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.fetch_add(self.step, Ordering::SeqCst)
    }
}
