//! Word-granular transport into the card's local address space.
//!
//! The card exposes its memory through the TI host port interface: an
//! address register plus a data register that either auto-increments the
//! address or keeps it fixed. Everything above this module talks to the
//! card only through the [`LocalBus`] trait.

use tracing::{debug, warn};

use super::config::{
    ADDRESS_CONFIRM_ATTEMPTS, FORBIDDEN_RANGE_END, FORBIDDEN_RANGE_START, HPI_ADDRESS_REG,
    HPI_CONTROL_REG, HPI_DATA_AUTOINC_REG, HPI_DATA_FIXED_REG, SDRAM_BASE,
};
use super::crc::verify_trailing_checksum;
use super::error::{Upc2Error, Upc2Result};
use crate::traits::RegisterAccess;

/// HPIC value selecting "first halfword is least significant".
const HPIC_HWOB: u32 = 0x0001_0001;

/// Register spacing used by cards wired for DMA.
const WIDE_REGISTER_SPACING: u32 = 0x200;

/// Internal RAM region probed by the self test (last 512 bytes).
const INTERNAL_RAM_TEST_ADDR: u32 = 0x40000 - 512;

const SELF_TEST_BYTES: u32 = 512;

/// Byte-exact access to the card's local address space.
///
/// Sizes are `buf.len()` and must be a positive multiple of 4.
pub trait LocalBus: Send {
    /// Read `dest.len()` bytes starting at `addr`.
    fn read(&mut self, addr: u32, dest: &mut [u8]) -> Upc2Result<()>;

    /// Write all of `src` starting at `addr`.
    fn write(&mut self, addr: u32, src: &[u8]) -> Upc2Result<()>;

    /// Read a region whose final word is the additive checksum of the rest.
    ///
    /// `dest` receives the whole region including the check word. On
    /// mismatch it still holds the transferred bytes, which must be treated
    /// as untrusted.
    fn read_with_check(&mut self, addr: u32, dest: &mut [u8]) -> Upc2Result<()> {
        self.read(addr, dest)?;
        check_region(addr, dest)
    }
}

/// Reject transfers the card cannot serve.
///
/// A transfer is refused if any byte of it overlaps the forbidden window,
/// which is stricter than checking the start address alone: a transfer
/// starting below `FORBIDDEN_RANGE_START` that runs into it fails too.
pub fn validate_access(addr: u32, size: usize) -> Upc2Result<()> {
    if size == 0 || size % 4 != 0 {
        return Err(Upc2Error::comm(format!(
            "transfer size {} is not a positive multiple of 4",
            size
        )));
    }
    if addr % 4 != 0 {
        return Err(Upc2Error::comm(format!(
            "local address 0x{:08X} is not word aligned",
            addr
        )));
    }
    let last = addr as u64 + size as u64 - 1;
    if addr <= FORBIDDEN_RANGE_END && last >= FORBIDDEN_RANGE_START as u64 {
        return Err(Upc2Error::ForbiddenAddress { addr });
    }
    Ok(())
}

fn check_region(addr: u32, region: &[u8]) -> Upc2Result<()> {
    verify_trailing_checksum(region).map_err(|(expected, actual)| {
        warn!(
            "Checksum mismatch at 0x{:08X}: expected 0x{:08X}, got 0x{:08X}",
            addr, expected, actual
        );
        Upc2Error::ChecksumMismatch { expected, actual }
    })
}

/// [`LocalBus`] over the HPI registers of one card.
pub struct MemoryTransport<R: RegisterAccess> {
    regs: R,
    spacing: u32,
    confirm_attempts: u32,
}

impl<R: RegisterAccess> MemoryTransport<R> {
    /// Wrap a register window with unit spacing.
    pub fn new(regs: R) -> Self {
        Self::with_spacing(regs, 1)
    }

    pub fn with_spacing(regs: R, spacing: u32) -> Self {
        Self {
            regs,
            spacing: spacing.max(1),
            confirm_attempts: ADDRESS_CONFIRM_ATTEMPTS,
        }
    }

    /// Override the address confirmation budget.
    pub fn confirm_attempts(mut self, attempts: u32) -> Self {
        self.confirm_attempts = attempts.max(1);
        self
    }

    /// Initialise the host port and detect the register spacing.
    ///
    /// Cards modified for DMA mirror HPIC every `0x10` bytes; unmodified
    /// cards don't, and use unit spacing.
    pub fn attach(mut regs: R) -> Self {
        regs.write_register(HPI_CONTROL_REG, HPIC_HWOB);
        let hpic = regs.read_register(HPI_CONTROL_REG);
        let mirror = regs.read_register(0x10);
        let spacing = if hpic == mirror {
            WIDE_REGISTER_SPACING
        } else {
            1
        };
        debug!("HPI register spacing detected: 0x{:X}", spacing);
        Self::with_spacing(regs, spacing)
    }

    pub fn spacing(&self) -> u32 {
        self.spacing
    }

    fn reg(&self, base: u32) -> u32 {
        base * self.spacing
    }

    /// Load the address register, retrying until it echoes `addr`.
    ///
    /// Running out of attempts is logged and ignored; the transfer goes
    /// ahead with whatever address the register holds.
    fn set_address_confirmed(&mut self, addr: u32) {
        let reg = self.reg(HPI_ADDRESS_REG);
        for _ in 0..self.confirm_attempts {
            self.regs.write_register(reg, addr);
            if self.regs.read_register(reg) == addr {
                return;
            }
        }
        warn!(
            "HPI address 0x{:08X} not confirmed after {} attempts",
            addr, self.confirm_attempts
        );
    }

    fn stream_in(&mut self, dest: &mut [u8]) {
        let reg = self.reg(HPI_DATA_AUTOINC_REG);
        for chunk in dest.chunks_exact_mut(4) {
            chunk.copy_from_slice(&self.regs.read_register(reg).to_le_bytes());
        }
    }

    /// Write a pattern and read it back at `addr`.
    fn probe(&mut self, addr: u32) -> Upc2Result<()> {
        let pattern: Vec<u8> = (0..SELF_TEST_BYTES)
            .step_by(4)
            .flat_map(|i| i.to_le_bytes())
            .collect();
        self.write(addr, &pattern)?;
        let mut readback = vec![0u8; pattern.len()];
        self.read(addr, &mut readback)?;
        if readback != pattern {
            return Err(Upc2Error::comm(format!(
                "memory self test failed at 0x{:08X}",
                addr
            )));
        }
        Ok(())
    }

    /// Pattern test of SDRAM and internal RAM through the host port.
    pub fn self_test(&mut self) -> Upc2Result<()> {
        self.probe(SDRAM_BASE)?;
        self.probe(INTERNAL_RAM_TEST_ADDR)
    }
}

impl<R: RegisterAccess> LocalBus for MemoryTransport<R> {
    fn read(&mut self, addr: u32, dest: &mut [u8]) -> Upc2Result<()> {
        validate_access(addr, dest.len())?;
        let reg = self.reg(HPI_ADDRESS_REG);
        self.regs.write_register(reg, addr);
        self.stream_in(dest);
        Ok(())
    }

    fn write(&mut self, addr: u32, src: &[u8]) -> Upc2Result<()> {
        validate_access(addr, src.len())?;
        self.set_address_confirmed(addr);

        let data = self.reg(HPI_DATA_AUTOINC_REG);
        for chunk in src.chunks_exact(4) {
            let word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            self.regs.write_register(data, word);
        }

        // Reloading HPIA flushes the HPI write buffer.
        let reg = self.reg(HPI_ADDRESS_REG);
        self.regs.write_register(reg, addr);
        Ok(())
    }

    fn read_with_check(&mut self, addr: u32, dest: &mut [u8]) -> Upc2Result<()> {
        validate_access(addr, dest.len())?;
        let reg = self.reg(HPI_ADDRESS_REG);
        self.regs.write_register(reg, addr);

        let payload_len = dest.len() - 4;
        self.stream_in(&mut dest[..payload_len]);
        let fixed = self.reg(HPI_DATA_FIXED_REG);
        let check = self.regs.read_register(fixed);
        dest[payload_len..].copy_from_slice(&check.to_le_bytes());

        check_region(addr, dest)
    }
}
