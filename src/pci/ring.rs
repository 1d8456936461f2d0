//! Reader for the converted-data frame ring buffer.
//!
//! The device produces frames into a circular pool of equal slots and
//! advances `load`/`newest`. The host consumes from `start` and writes the
//! cursor back once a batch has been read and verified. All cursor math is
//! done on slot indices; addresses only appear at the transport boundary.

use tracing::debug;

use super::config::{AccessType, POOL_HEADER_ADDR, POOL_HEADER_SIZE, POOL_START_OFFSET};
use super::error::{Upc2Error, Upc2Result};
use super::transport::LocalBus;

/// Smallest usable frame: frame number, timestamp and the check word.
const MIN_FRAME_SIZE: u32 = 12;

/// Frame pool header as published by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramePoolHeader {
    pub frame1: u32,
    pub load: u32,
    pub newest: u32,
    pub start: u32,
    pub last: u32,
    /// Bytes per slot, including the trailing check word.
    pub frame_size: u32,
    pub max_frames: u32,
}

impl FramePoolHeader {
    /// Header for a pool of `max_frames` slots at `frame1` with every
    /// cursor on the first slot.
    pub fn new(frame1: u32, frame_size: u32, max_frames: u32) -> Self {
        let last = frame1 + frame_size * max_frames.saturating_sub(1);
        Self {
            frame1,
            load: frame1,
            newest: frame1,
            start: frame1,
            last,
            frame_size,
            max_frames,
        }
    }

    pub fn parse(data: &[u8]) -> Upc2Result<Self> {
        if data.len() < POOL_HEADER_SIZE {
            return Err(Upc2Error::comm("frame pool header truncated"));
        }
        let word = |i: usize| {
            u32::from_le_bytes([data[i * 4], data[i * 4 + 1], data[i * 4 + 2], data[i * 4 + 3]])
        };
        Ok(Self {
            frame1: word(0),
            load: word(1),
            newest: word(2),
            start: word(3),
            last: word(4),
            frame_size: word(5),
            max_frames: word(6),
        })
    }

    pub fn to_bytes(&self) -> [u8; POOL_HEADER_SIZE] {
        let mut out = [0u8; POOL_HEADER_SIZE];
        let fields = [
            self.frame1,
            self.load,
            self.newest,
            self.start,
            self.last,
            self.frame_size,
            self.max_frames,
        ];
        for (chunk, value) in out.chunks_exact_mut(4).zip(fields) {
            chunk.copy_from_slice(&value.to_le_bytes());
        }
        out
    }

    /// Slot index of a cursor address.
    pub fn slot_of(&self, addr: u32) -> Upc2Result<u32> {
        if self.frame_size == 0 || self.max_frames == 0 {
            return Err(Upc2Error::InvalidFramePool {
                reason: format!(
                    "frame size {} / max frames {}",
                    self.frame_size, self.max_frames
                ),
            });
        }
        let offset = addr.checked_sub(self.frame1).ok_or_else(|| Upc2Error::InvalidFramePool {
            reason: format!("cursor 0x{:08X} below first frame 0x{:08X}", addr, self.frame1),
        })?;
        let slot = offset / self.frame_size;
        if offset % self.frame_size != 0 || slot >= self.max_frames {
            return Err(Upc2Error::InvalidFramePool {
                reason: format!("cursor 0x{:08X} is not a slot boundary", addr),
            });
        }
        Ok(slot)
    }

    /// Local address of slot `slot`.
    pub fn slot_addr(&self, slot: u32) -> u32 {
        self.frame1 + slot * self.frame_size
    }

    /// Frames produced but not yet consumed.
    pub fn unread_count(&self) -> Upc2Result<u32> {
        let start = self.slot_of(self.start)?;
        let newest = self.slot_of(self.newest)?;
        Ok(if newest < start {
            self.max_frames - (start - newest)
        } else {
            newest - start
        })
    }

    /// Payload bytes per frame once the check word is stripped.
    pub fn payload_len(&self) -> usize {
        self.frame_size.saturating_sub(4) as usize
    }

    fn check_frame_size(&self) -> Upc2Result<()> {
        if self.frame_size < MIN_FRAME_SIZE || self.frame_size % 4 != 0 {
            return Err(Upc2Error::InvalidFramePool {
                reason: format!("unusable frame size {}", self.frame_size),
            });
        }
        Ok(())
    }
}

/// Ring buffer access for one card.
pub struct FrameReader<'a> {
    bus: &'a mut dyn LocalBus,
}

impl<'a> FrameReader<'a> {
    pub fn new(bus: &'a mut dyn LocalBus) -> Self {
        Self { bus }
    }

    /// Read the pool header from the device.
    pub fn fetch_header(&mut self) -> Upc2Result<FramePoolHeader> {
        let mut raw = [0u8; POOL_HEADER_SIZE];
        self.bus.read(POOL_HEADER_ADDR, &mut raw)?;
        FramePoolHeader::parse(&raw)
    }

    pub fn unread_count(&mut self) -> Upc2Result<u32> {
        self.fetch_header()?.unread_count()
    }

    fn write_start(&mut self, start: u32) -> Upc2Result<()> {
        self.bus
            .write(POOL_HEADER_ADDR + POOL_START_OFFSET, &start.to_le_bytes())
    }

    /// Drop the backlog: the next drain starts at the newest frame.
    pub fn set_start_frame(&mut self) -> Upc2Result<()> {
        let header = self.fetch_header()?;
        self.write_start(header.newest)
    }

    /// Copy frames into `dest`, returning how many were delivered.
    ///
    /// `NewestData` and `FromLoadPtr` copy one raw slot (check word
    /// included) and leave the cursor alone. The draining modes verify
    /// every frame and only move the cursor if all of them pass.
    pub fn get_data(
        &mut self,
        access: AccessType,
        requested: usize,
        dest: &mut [u8],
    ) -> Upc2Result<usize> {
        let header = self.fetch_header()?;
        header.check_frame_size()?;

        match access {
            AccessType::NewestData | AccessType::FromLoadPtr => {
                let addr = if access == AccessType::NewestData {
                    header.newest
                } else {
                    header.load
                };
                header.slot_of(addr)?;
                let size = header.frame_size as usize;
                let available = dest.len();
                let slot = dest.get_mut(..size).ok_or(Upc2Error::BufferTooSmall {
                    needed: size,
                    available,
                })?;
                self.bus.read(addr, slot)?;
                Ok(1)
            }
            AccessType::NoGaps | AccessType::FromStartFrame => {
                self.drain(&header, access, requested, dest)
            }
        }
    }

    fn drain(
        &mut self,
        header: &FramePoolHeader,
        access: AccessType,
        requested: usize,
        dest: &mut [u8],
    ) -> Upc2Result<usize> {
        let unread = header.unread_count()? as usize;
        if unread == 0 {
            return Ok(0);
        }
        // The newest unread frame is always held back.
        let count = requested.min(unread - 1);
        if count == 0 {
            return Ok(0);
        }

        let payload = header.payload_len();
        let stride = access.dest_stride(payload);
        let needed = count * stride;
        if dest.len() < needed {
            return Err(Upc2Error::BufferTooSmall {
                needed,
                available: dest.len(),
            });
        }

        let last_slot = header.slot_of(header.last)?;
        let mut slot = header.slot_of(header.start)?;
        if slot > last_slot {
            return Err(Upc2Error::InvalidFramePool {
                reason: "start cursor beyond last frame".into(),
            });
        }

        let copy = payload.min(stride);
        let mut scratch = vec![0u8; header.frame_size as usize];
        for out in dest.chunks_mut(stride).take(count) {
            self.bus.read_with_check(header.slot_addr(slot), &mut scratch)?;
            out[..copy].copy_from_slice(&scratch[..copy]);
            slot = if slot == last_slot { 0 } else { slot + 1 };
        }

        let new_start = header.slot_addr(slot);
        self.write_start(new_start)?;
        debug!(
            "Drained {} of {} unread frames, start now 0x{:08X}",
            count, unread, new_start
        );
        Ok(count)
    }
}
