//! Bit-exact encoders and decoders for the records shared with the DSP.
//!
//! All records are little-endian and word aligned. Fixed-width text fields
//! are NUL padded on the way out and cut at the first NUL on the way in.

use serde::Serialize;

use super::config::{
    status, DspCommand, CALIBRATION_SIZE, COMMAND_BUFFER_SIZE, CONFIG_HEADER_SIZE, CONFIG_SIZE,
    FRAME_HEADER_SIZE, ITEM_SIZE, MAX_ITEMS, MAX_SBITS, MEMORY_MAP_SIZE, OP_INFO_SIZE,
    SW_INFO_SIZE,
};
use super::crc::crc32;
use super::error::{Upc2Error, Upc2Result};

// ============================================================================
// Byte Cursors
// ============================================================================

struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    fn i32(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn f32(&mut self, value: f32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn text(&mut self, value: &str, width: usize) {
        let bytes = value.as_bytes();
        let n = bytes.len().min(width);
        self.buf.extend_from_slice(&bytes[..n]);
        self.buf.resize(self.buf.len() + (width - n), 0);
    }

    fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

/// Sequential reader over a slice already checked to be long enough.
struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(data: &'a [u8], needed: usize, what: &str) -> Upc2Result<Self> {
        if data.len() < needed {
            return Err(Upc2Error::comm(format!(
                "{} needs {} bytes, got {}",
                what,
                needed,
                data.len()
            )));
        }
        Ok(Self { data, pos: 0 })
    }

    fn word(&mut self) -> [u8; 4] {
        let w = [
            self.data[self.pos],
            self.data[self.pos + 1],
            self.data[self.pos + 2],
            self.data[self.pos + 3],
        ];
        self.pos += 4;
        w
    }

    fn u32(&mut self) -> u32 {
        u32::from_le_bytes(self.word())
    }

    fn i32(&mut self) -> i32 {
        i32::from_le_bytes(self.word())
    }

    fn f32(&mut self) -> f32 {
        f32::from_le_bytes(self.word())
    }

    fn text(&mut self, width: usize) -> String {
        let field = &self.data[self.pos..self.pos + width];
        self.pos += width;
        let end = field.iter().position(|&b| b == 0).unwrap_or(width);
        String::from_utf8_lossy(&field[..end]).into_owned()
    }
}

/// Read a little-endian word at `offset`, if present.
pub fn word_at(data: &[u8], offset: usize) -> Option<u32> {
    let w = data.get(offset..offset + 4)?;
    Some(u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
}

// ============================================================================
// Command Buffer
// ============================================================================

/// The single in-flight command slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandBuffer {
    pub crc: u32,
    pub command: i32,
    pub params: [i32; 2],
    pub control_status: u32,
}

impl CommandBuffer {
    /// Build a fresh command with `NEW_COMMAND` status and a valid CRC.
    pub fn new(command: DspCommand, params: [i32; 2]) -> Self {
        let mut buffer = Self {
            crc: 0,
            command: command.code(),
            params,
            control_status: status::NEW_COMMAND,
        };
        buffer.crc = buffer.compute_crc();
        buffer
    }

    /// CRC over every field except the CRC itself.
    pub fn compute_crc(&self) -> u32 {
        crc32(&self.to_bytes()[4..])
    }

    pub fn crc_valid(&self) -> bool {
        self.crc == self.compute_crc()
    }

    pub fn to_bytes(&self) -> [u8; COMMAND_BUFFER_SIZE] {
        let mut out = [0u8; COMMAND_BUFFER_SIZE];
        out[0..4].copy_from_slice(&self.crc.to_le_bytes());
        out[4..8].copy_from_slice(&self.command.to_le_bytes());
        out[8..12].copy_from_slice(&self.params[0].to_le_bytes());
        out[12..16].copy_from_slice(&self.params[1].to_le_bytes());
        out[16..20].copy_from_slice(&self.control_status.to_le_bytes());
        out
    }

    pub fn parse(data: &[u8]) -> Upc2Result<Self> {
        let mut r = ByteReader::new(data, COMMAND_BUFFER_SIZE, "command buffer")?;
        Ok(Self {
            crc: r.u32(),
            command: r.i32(),
            params: [r.i32(), r.i32()],
            control_status: r.u32(),
        })
    }
}

// ============================================================================
// Memory Map
// ============================================================================

/// Region pointers published by the DSP. Zero means "not present".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryMap {
    pub command_buffer: u32,
    pub calibration: u32,
    pub config: u32,
    pub pool_header: u32,
    pub moving_average: u32,
    pub frames: u32,
}

impl MemoryMap {
    pub fn parse(data: &[u8]) -> Upc2Result<Self> {
        let mut r = ByteReader::new(data, MEMORY_MAP_SIZE, "memory map")?;
        Ok(Self {
            command_buffer: r.u32(),
            calibration: r.u32(),
            config: r.u32(),
            pool_header: r.u32(),
            moving_average: r.u32(),
            frames: r.u32(),
        })
    }

    pub fn has_config(&self) -> bool {
        self.config != 0
    }

    pub fn has_calibration(&self) -> bool {
        self.calibration != 0
    }
}

/// Memory map header together with the command buffer that follows it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryMapSnapshot {
    pub map: MemoryMap,
    pub command: CommandBuffer,
}

impl MemoryMapSnapshot {
    pub const SIZE: usize = MEMORY_MAP_SIZE + COMMAND_BUFFER_SIZE;

    pub fn parse(data: &[u8]) -> Upc2Result<Self> {
        if data.len() < Self::SIZE {
            return Err(Upc2Error::comm("memory map snapshot truncated"));
        }
        Ok(Self {
            map: MemoryMap::parse(&data[..MEMORY_MAP_SIZE])?,
            command: CommandBuffer::parse(&data[MEMORY_MAP_SIZE..])?,
        })
    }

    pub fn is_busy(&self) -> bool {
        status::is_busy(self.command.control_status)
    }
}

// ============================================================================
// Device Configuration
// ============================================================================

/// One measured item inside the configuration record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemConfig {
    pub item_number: i32,
    pub terminal_block_number: i32,
    pub gui_index1: i32,
    pub gui_index2: i32,
    pub scale_factor: f32,
    pub offset: f32,
    pub avg_count: i32,
    pub tag: String,
    pub engineering_units: String,
    pub reserved: [i32; 3],
    pub value: f32,
    pub recipe_code: i32,
    pub related_item_flag: i32,
    pub related_item_number: i32,
    pub related_item_value: f32,
    pub number_of_conversions_used: i32,
    pub index_of_conversion_used: [i32; 4],
    pub index_of_gain_used: [i32; 4],
}

impl ItemConfig {
    fn write(&self, w: &mut ByteWriter) {
        w.i32(self.item_number);
        w.i32(self.terminal_block_number);
        w.i32(self.gui_index1);
        w.i32(self.gui_index2);
        w.f32(self.scale_factor);
        w.f32(self.offset);
        w.i32(self.avg_count);
        w.text(&self.tag, 64);
        w.text(&self.engineering_units, 8);
        self.reserved.iter().for_each(|&v| w.i32(v));
        w.f32(self.value);
        w.i32(self.recipe_code);
        w.i32(self.related_item_flag);
        w.i32(self.related_item_number);
        w.f32(self.related_item_value);
        w.i32(self.number_of_conversions_used);
        self.index_of_conversion_used.iter().for_each(|&v| w.i32(v));
        self.index_of_gain_used.iter().for_each(|&v| w.i32(v));
    }

    fn read(r: &mut ByteReader<'_>) -> Self {
        Self {
            item_number: r.i32(),
            terminal_block_number: r.i32(),
            gui_index1: r.i32(),
            gui_index2: r.i32(),
            scale_factor: r.f32(),
            offset: r.f32(),
            avg_count: r.i32(),
            tag: r.text(64),
            engineering_units: r.text(8),
            reserved: [r.i32(), r.i32(), r.i32()],
            value: r.f32(),
            recipe_code: r.i32(),
            related_item_flag: r.i32(),
            related_item_number: r.i32(),
            related_item_value: r.f32(),
            number_of_conversions_used: r.i32(),
            index_of_conversion_used: [r.i32(), r.i32(), r.i32(), r.i32()],
            index_of_gain_used: [r.i32(), r.i32(), r.i32(), r.i32()],
        }
    }
}

/// Acquisition configuration as stored on the card.
///
/// `sbits` and `items` may be shorter than their on-card capacity; they are
/// zero padded when encoded and always decoded at full capacity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceConfig {
    pub description: String,
    pub creation_date: String,
    pub n_items: i32,
    pub n_sbits: i32,
    pub sine_wave_frequency: i32,
    pub v_out: i32,
    pub filter_divisor: i32,
    pub mcbsp0_clk_div: i32,
    pub scans_remaining: i32,
    pub scan_interval: i32,
    pub starting_row: i32,
    pub sel_boxes: i32,
    pub op_flags: i32,
    pub reserved: [i32; 2],
    pub sbits: Vec<i32>,
    pub items: Vec<ItemConfig>,
}

impl DeviceConfig {
    /// Raw-data acquisition is selected by `'R'` in the low op flag byte.
    pub fn is_raw_data_mode(&self) -> bool {
        self.op_flags & 0xFF == super::config::RAW_DATA_OP_FLAG
    }

    /// Item count clamped to what the card can hold.
    pub fn item_count(&self) -> usize {
        self.n_items.clamp(0, MAX_ITEMS as i32) as usize
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = ByteWriter::with_capacity(CONFIG_SIZE);
        w.text(&self.description, 64);
        w.text(&self.creation_date, 12);
        for v in [
            self.n_items,
            self.n_sbits,
            self.sine_wave_frequency,
            self.v_out,
            self.filter_divisor,
            self.mcbsp0_clk_div,
            self.scans_remaining,
            self.scan_interval,
            self.starting_row,
            self.sel_boxes,
            self.op_flags,
        ] {
            w.i32(v);
        }
        self.reserved.iter().for_each(|&v| w.i32(v));
        for i in 0..MAX_SBITS {
            w.i32(self.sbits.get(i).copied().unwrap_or(0));
        }
        let blank = ItemConfig::default();
        for i in 0..MAX_ITEMS {
            self.items.get(i).unwrap_or(&blank).write(&mut w);
        }
        w.into_inner()
    }

    pub fn parse(data: &[u8]) -> Upc2Result<Self> {
        let mut r = ByteReader::new(data, CONFIG_SIZE, "configuration")?;
        let description = r.text(64);
        let creation_date = r.text(12);
        let mut config = Self {
            description,
            creation_date,
            n_items: r.i32(),
            n_sbits: r.i32(),
            sine_wave_frequency: r.i32(),
            v_out: r.i32(),
            filter_divisor: r.i32(),
            mcbsp0_clk_div: r.i32(),
            scans_remaining: r.i32(),
            scan_interval: r.i32(),
            starting_row: r.i32(),
            sel_boxes: r.i32(),
            op_flags: r.i32(),
            reserved: [r.i32(), r.i32()],
            sbits: Vec::with_capacity(MAX_SBITS),
            items: Vec::with_capacity(MAX_ITEMS),
        };
        debug_assert_eq!(r.pos, CONFIG_HEADER_SIZE);
        for _ in 0..MAX_SBITS {
            config.sbits.push(r.i32());
        }
        for _ in 0..MAX_ITEMS {
            config.items.push(ItemConfig::read(&mut r));
        }
        Ok(config)
    }

    /// Local address of item `index` inside a configuration at `base`.
    pub fn item_addr(base: u32, index: usize) -> u32 {
        base + (CONFIG_HEADER_SIZE + MAX_SBITS * 4 + index * ITEM_SIZE) as u32
    }
}

// ============================================================================
// Calibration
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CalibrationData {
    pub internal_5k_res_value: [f32; 8],
    pub conversion_factor: [f32; 10],
    pub conversion_offset: [i32; 10],
    pub calibration_date: String,
}

impl CalibrationData {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = ByteWriter::with_capacity(CALIBRATION_SIZE);
        self.internal_5k_res_value.iter().for_each(|&v| w.f32(v));
        self.conversion_factor.iter().for_each(|&v| w.f32(v));
        self.conversion_offset.iter().for_each(|&v| w.i32(v));
        w.text(&self.calibration_date, 12);
        w.into_inner()
    }

    pub fn parse(data: &[u8]) -> Upc2Result<Self> {
        let mut r = ByteReader::new(data, CALIBRATION_SIZE, "calibration")?;
        let mut cal = Self::default();
        cal.internal_5k_res_value.iter_mut().for_each(|v| *v = r.f32());
        cal.conversion_factor.iter_mut().for_each(|v| *v = r.f32());
        cal.conversion_offset.iter_mut().for_each(|v| *v = r.i32());
        cal.calibration_date = r.text(12);
        Ok(cal)
    }
}

// ============================================================================
// System Information
// ============================================================================

/// Software identification block.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SwInfo {
    pub version: String,
    pub creation_date: String,
    pub creation_time: String,
    pub code_size: i32,
}

impl SwInfo {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = ByteWriter::with_capacity(SW_INFO_SIZE);
        w.text(&self.version, 32);
        w.text(&self.creation_date, 12);
        w.text(&self.creation_time, 12);
        w.i32(self.code_size);
        w.into_inner()
    }

    pub fn parse(data: &[u8]) -> Upc2Result<Self> {
        let mut r = ByteReader::new(data, SW_INFO_SIZE, "software info")?;
        Ok(Self {
            version: r.text(32),
            creation_date: r.text(12),
            creation_time: r.text(12),
            code_size: r.i32(),
        })
    }

    /// Version as `major * 10 + minor` from a `"Production vX.Y"` string.
    pub fn code_version(&self) -> Option<i32> {
        const MARKER: &str = "Production v";
        let start = self.version.find(MARKER)? + MARKER.len();
        let mut chars = self.version[start..].chars();
        let major = chars.next()?.to_digit(10)?;
        if chars.next()? != '.' {
            return None;
        }
        let minor = chars.next()?.to_digit(10)?;
        Some((major * 10 + minor) as i32)
    }
}

/// Operational counters reported by the DSP.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OpInfo {
    pub words: [i32; 5],
}

impl OpInfo {
    pub fn parse(data: &[u8]) -> Upc2Result<Self> {
        let mut r = ByteReader::new(data, OP_INFO_SIZE, "op info")?;
        let mut info = Self::default();
        info.words.iter_mut().for_each(|v| *v = r.i32());
        Ok(info)
    }
}

// ============================================================================
// Converted Data Frames
// ============================================================================

/// One acquisition frame as delivered to the caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConvertedDataFrame {
    pub frame_no: i32,
    pub timestamp: i32,
    pub values: Vec<f32>,
}

impl ConvertedDataFrame {
    /// Decode a frame with `item_count` values from the start of `data`.
    pub fn parse(data: &[u8], item_count: usize) -> Upc2Result<Self> {
        let item_count = item_count.min(MAX_ITEMS);
        let mut r = ByteReader::new(data, FRAME_HEADER_SIZE + item_count * 4, "frame")?;
        let frame_no = r.i32();
        let timestamp = r.i32();
        let values = (0..item_count).map(|_| r.f32()).collect();
        Ok(Self {
            frame_no,
            timestamp,
            values,
        })
    }

    /// Encode into `dest`, truncating values that don't fit.
    pub fn write_into(&self, dest: &mut [u8]) {
        let mut w = ByteWriter::with_capacity(FRAME_HEADER_SIZE + self.values.len() * 4);
        w.i32(self.frame_no);
        w.i32(self.timestamp);
        self.values.iter().for_each(|&v| w.f32(v));
        let bytes = w.into_inner();
        let n = bytes.len().min(dest.len());
        dest[..n].copy_from_slice(&bytes[..n]);
    }

    /// Split a `get_data` destination buffer back into frames.
    pub fn parse_many(
        data: &[u8],
        stride: usize,
        count: usize,
        item_count: usize,
    ) -> Upc2Result<Vec<Self>> {
        (0..count)
            .map(|i| {
                let start = i * stride;
                let frame = data
                    .get(start..)
                    .ok_or_else(|| Upc2Error::comm("frame buffer truncated"))?;
                Self::parse(frame, item_count)
            })
            .collect()
    }
}
