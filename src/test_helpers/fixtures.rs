use std::collections::BTreeMap;
use std::ops::Range;

use crate::pci::config::{POOL_HEADER_ADDR, RAW_DATA_OP_FLAG};
use crate::pci::layout::{DeviceConfig, ItemConfig};
use crate::pci::ring::FramePoolHeader;

use super::SimulatedCard;

/// Builder for test DeviceConfig instances.
///
/// Items default to unit scale and zero offset.
pub struct ConfigBuilder {
    n_items: i32,
    n_sbits: i32,
    scan_interval: i32,
    op_flags: i32,
    overrides: BTreeMap<usize, ItemConfig>,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            n_items: 0,
            n_sbits: 0,
            scan_interval: 0,
            op_flags: 0,
            overrides: BTreeMap::new(),
        }
    }

    pub fn items(mut self, n: i32) -> Self {
        self.n_items = n;
        self
    }

    pub fn sbits(mut self, n: i32) -> Self {
        self.n_sbits = n;
        self
    }

    pub fn scan_interval(mut self, interval: i32) -> Self {
        self.scan_interval = interval;
        self
    }

    pub fn raw_data(mut self) -> Self {
        self.op_flags = RAW_DATA_OP_FLAG;
        self
    }

    pub fn item(mut self, index: usize, item: ItemConfig) -> Self {
        self.overrides.insert(index, item);
        self
    }

    pub fn build(mut self) -> DeviceConfig {
        let items = (0..self.n_items.max(0) as usize)
            .map(|i| {
                self.overrides.remove(&i).unwrap_or(ItemConfig {
                    item_number: i as i32,
                    scale_factor: 1.0,
                    ..ItemConfig::default()
                })
            })
            .collect();
        DeviceConfig {
            description: "test configuration".to_string(),
            n_items: self.n_items,
            n_sbits: self.n_sbits,
            scan_interval: self.scan_interval,
            op_flags: self.op_flags,
            sbits: (0..self.n_sbits.max(0)).collect(),
            items,
            ..DeviceConfig::default()
        }
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for a frame pool laid out in simulated card memory.
///
/// Generated frames carry `frame_no = slot`, `timestamp = slot * 10`, item
/// `i` equal to `slot + i` and a valid check word.
pub struct PoolBuilder {
    header: FramePoolHeader,
    slots: BTreeMap<u32, Vec<u32>>,
}

impl PoolBuilder {
    pub fn new(frame1: u32, frame_size: u32, max_frames: u32) -> Self {
        Self {
            header: FramePoolHeader::new(frame1, frame_size, max_frames),
            slots: BTreeMap::new(),
        }
    }

    /// Store `words` verbatim in `slot`, check word included.
    pub fn raw_frame(mut self, slot: u32, words: &[u32]) -> Self {
        self.slots.insert(slot, words.to_vec());
        self
    }

    pub fn frames(mut self, slots: Range<u32>) -> Self {
        let n_items = (self.header.frame_size.saturating_sub(12) / 4) as usize;
        for slot in slots {
            let mut words = vec![slot, slot * 10];
            words.extend((0..n_items).map(|i| (slot as f32 + i as f32).to_bits()));
            let sum = words.iter().fold(0u32, |acc, &w| acc.wrapping_add(w));
            words.push(sum);
            self.slots.insert(slot, words);
        }
        self
    }

    pub fn start(mut self, slot: u32) -> Self {
        self.header.start = self.header.slot_addr(slot);
        self
    }

    pub fn newest(mut self, slot: u32) -> Self {
        self.header.newest = self.header.slot_addr(slot);
        self
    }

    pub fn load(mut self, slot: u32) -> Self {
        self.header.load = self.header.slot_addr(slot);
        self
    }

    pub fn install(self, card: &SimulatedCard) {
        card.poke_bytes(POOL_HEADER_ADDR, &self.header.to_bytes());
        for (slot, words) in &self.slots {
            card.poke_words(self.header.slot_addr(*slot), words);
        }
    }
}

/// Encode one Intel HEX record with a correct checksum.
pub fn hex_record(kind: u8, address: u16, data: &[u8]) -> String {
    let mut bytes = vec![data.len() as u8];
    bytes.extend_from_slice(&address.to_be_bytes());
    bytes.push(kind);
    bytes.extend_from_slice(data);
    let sum = bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    bytes.push(0u8.wrapping_sub(sum));

    let body: String = bytes.iter().map(|b| format!("{:02X}", b)).collect();
    format!(":{}", body)
}

/// Builder for Intel HEX file text.
pub struct HexFileBuilder {
    lines: Vec<String>,
}

impl HexFileBuilder {
    pub fn new() -> Self {
        Self { lines: Vec::new() }
    }

    pub fn data(self, address: u16, data: &[u8]) -> Self {
        self.record(0x00, address, data)
    }

    pub fn extended_linear(self, upper: u16) -> Self {
        self.record(0x04, 0, &upper.to_be_bytes())
    }

    pub fn record(mut self, kind: u8, address: u16, data: &[u8]) -> Self {
        self.lines.push(hex_record(kind, address, data));
        self
    }

    pub fn eof(self) -> Self {
        self.record(0x01, 0, &[])
    }

    pub fn build(self) -> String {
        let mut text = self.lines.join("\n");
        text.push('\n');
        text
    }
}

impl Default for HexFileBuilder {
    fn default() -> Self {
        Self::new()
    }
}
