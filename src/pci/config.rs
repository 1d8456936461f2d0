//! Protocol constants and the fixed memory layout of the UPC2 card.
//!
//! Every address below is a local-address-space byte offset as seen by the
//! DSP. Structure addresses are chained: each region starts right after the
//! previous one, so the sizes here must stay bit-exact with the firmware.

// ============================================================================
// Card Limits
// ============================================================================

/// Maximum number of cards a single process can address.
pub const MAX_PCI_CARDS: usize = 10;

/// Maximum number of measurement items per configuration.
pub const MAX_ITEMS: usize = 24;

/// Maximum number of scan bits per configuration.
pub const MAX_SBITS: usize = 400;

// ============================================================================
// HPI Register Interface
// ============================================================================

/// HPI control register.
pub const HPI_CONTROL_REG: u32 = 0x0;

/// HPI address register.
pub const HPI_ADDRESS_REG: u32 = 0x4;

/// HPI data register, address auto-increments after each access.
pub const HPI_DATA_AUTOINC_REG: u32 = 0x8;

/// HPI data register, address stays fixed.
pub const HPI_DATA_FIXED_REG: u32 = 0xC;

/// Attempts to get the address register to echo the requested address.
pub const ADDRESS_CONFIRM_ATTEMPTS: u32 = 10_000;

/// Start of the local address range the transport must never touch.
pub const FORBIDDEN_RANGE_START: u32 = 0x6000_0000;

/// End (inclusive) of the forbidden local address range.
pub const FORBIDDEN_RANGE_END: u32 = 0x7FFF_FFFF;

// ============================================================================
// Structure Sizes
// ============================================================================

/// Timestamp block: two copies of the timestamp plus a marker word.
pub const TIMESTAMP_SIZE: usize = 12;

/// Memory map header: six region pointers plus three reserved words.
pub const MEMORY_MAP_SIZE: usize = 36;

/// Command buffer: crc, command, two parameters, control/status.
pub const COMMAND_BUFFER_SIZE: usize = 20;

/// Calibration table record.
pub const CALIBRATION_SIZE: usize = 124;

/// One item entry inside the configuration record.
pub const ITEM_SIZE: usize = 168;

/// Fixed configuration header before the sbit and item arrays.
pub const CONFIG_HEADER_SIZE: usize = 128;

/// Full configuration record.
pub const CONFIG_SIZE: usize = CONFIG_HEADER_SIZE + MAX_SBITS * 4 + MAX_ITEMS * ITEM_SIZE;

/// Frame pool header: five pointers, frame size and frame count.
pub const POOL_HEADER_SIZE: usize = 28;

/// Software information record returned by the DSP.
pub const SW_INFO_SIZE: usize = 60;

/// Operational information record returned by the DSP.
pub const OP_INFO_SIZE: usize = 20;

/// Bytes before the item values in a converted data frame.
pub const FRAME_HEADER_SIZE: usize = 8;

/// Padded logical frame: frame number, timestamp and `MAX_ITEMS` values.
pub const LOGICAL_FRAME_SIZE: usize = FRAME_HEADER_SIZE + MAX_ITEMS * 4;

// ============================================================================
// Memory Layout
// ============================================================================

/// Host-written timestamp block.
pub const TIMESTAMP_ADDR: u32 = 0;

/// Memory map header.
pub const MEMORY_MAP_ADDR: u32 = 32;

/// Calibration pointer slot inside the memory map.
pub const CALIBRATION_MM_ADDR: u32 = MEMORY_MAP_ADDR + 4;

/// Configuration pointer slot inside the memory map.
pub const CONFIG_MM_ADDR: u32 = MEMORY_MAP_ADDR + 8;

pub const COMMAND_BUFFER_ADDR: u32 = MEMORY_MAP_ADDR + MEMORY_MAP_SIZE as u32;

/// Control/status word of the command buffer.
pub const COMMAND_STATUS_ADDR: u32 = COMMAND_BUFFER_ADDR + 16;

pub const CALIBRATION_ADDR: u32 = COMMAND_BUFFER_ADDR + COMMAND_BUFFER_SIZE as u32;

pub const CONFIG_ADDR: u32 = CALIBRATION_ADDR + CALIBRATION_SIZE as u32;

pub const POOL_HEADER_ADDR: u32 = CONFIG_ADDR + CONFIG_SIZE as u32;

/// Offset of the consumer cursor (`start`) inside the frame pool header.
pub const POOL_START_OFFSET: u32 = 12;

/// Offset of `scale_factor` inside an item entry.
pub const ITEM_SCALE_OFFSET: u32 = 16;

/// Offset of `offset` inside an item entry.
pub const ITEM_OFFSET_OFFSET: u32 = 20;

/// Base of the card's SDRAM.
pub const SDRAM_BASE: u32 = 0xA000_0000;

/// One past the last SDRAM byte.
pub const SDRAM_END: u32 = 0xA200_0000;

/// Start of the SDRAM buffer area.
pub const SDRAM_BUFFER_BASE: u32 = SDRAM_BASE + 0x85000;

/// Scratch area used as the data payload of commands.
pub const COMMAND_DATA_BUFFER_ADDR: u32 = SDRAM_BUFFER_BASE + 1_200_028;

/// Capacity of the firmware image buffer.
pub const PROGRAM_BUFFER_SIZE: usize = 200_000;

// ============================================================================
// Command Protocol
// ============================================================================

/// Submit+poll cycles attempted per command.
pub const SEND_COMMAND_MAX_TRIES: u32 = 3;

/// Base poll iterations, scaled by the per-command multiplier.
pub const BUSY_TEST_TRIES: u32 = 100;

/// Op flag low byte selecting raw-data acquisition.
pub const RAW_DATA_OP_FLAG: i32 = 0x52;

/// Commands understood by the DSP command processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DspCommand {
    StartDataCollection = 0x1000_0000,
    StopDataCollection = 0x1100_0000,
    LoadConfigFromFlash = 0x2000_0000,
    SaveConfigToFlash = 0x2100_0000,
    InCircuitProgram = 0x3000_0000,
    DownloadProgram = 0x3100_0000,
    LoadCalibrationFromFlash = 0x5000_0000,
    SaveCalibrationToFlash = 0x5100_0000,
    GetSystemInfo = 0x7000_0000,
    GetSystemOpInfo = 0x7100_0000,
    GetSerialNumber = 0x8000_0000,
    SetSerialNumber = 0x8100_0000,
}

impl DspCommand {
    /// Command word as stored in the command buffer.
    pub fn code(self) -> i32 {
        self as u32 as i32
    }

    /// Decode a command word read back from the device.
    pub fn from_code(code: i32) -> Option<Self> {
        use DspCommand::*;
        let all = [
            StartDataCollection,
            StopDataCollection,
            LoadConfigFromFlash,
            SaveConfigToFlash,
            InCircuitProgram,
            DownloadProgram,
            LoadCalibrationFromFlash,
            SaveCalibrationToFlash,
            GetSystemInfo,
            GetSystemOpInfo,
            GetSerialNumber,
            SetSerialNumber,
        ];
        all.into_iter().find(|c| c.code() == code)
    }

    pub fn description(self) -> &'static str {
        match self {
            DspCommand::StartDataCollection => "start data collection",
            DspCommand::StopDataCollection => "stop data collection",
            DspCommand::LoadConfigFromFlash => "load configuration from flash",
            DspCommand::SaveConfigToFlash => "save configuration to flash",
            DspCommand::InCircuitProgram => "in-circuit program",
            DspCommand::DownloadProgram => "download program",
            DspCommand::LoadCalibrationFromFlash => "load calibration from flash",
            DspCommand::SaveCalibrationToFlash => "save calibration to flash",
            DspCommand::GetSystemInfo => "get system info",
            DspCommand::GetSystemOpInfo => "get system op info",
            DspCommand::GetSerialNumber => "get serial number",
            DspCommand::SetSerialNumber => "set serial number",
        }
    }
}

/// Flash region targeted by in-circuit programming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ProgramDestination {
    /// Bootloader sector ("BOOT").
    Boot = 0x424F_4F54,
    /// Application sector ("PGM").
    Program = 0x0050_474D,
}

impl ProgramDestination {
    pub fn code(self) -> i32 {
        self as u32 as i32
    }
}

// ============================================================================
// Command Status Bits
// ============================================================================

/// Status flags in the command buffer's control/status word.
///
/// The flags are independent; several can be set while the device
/// transitions between states.
pub mod status {
    pub const NEW_COMMAND: u32 = 0x100;
    pub const COLLECTING_DATA: u32 = 0x10;
    pub const PROCESSING_COMMAND: u32 = 0x08;
    pub const BAD_CRC: u32 = 0x04;
    pub const COMPLETED_OK: u32 = 0x02;
    pub const COMPLETED_NG: u32 = 0x01;

    /// Any of these set means the device has not finished the last command.
    pub const BUSY: u32 = NEW_COMMAND | COLLECTING_DATA | PROCESSING_COMMAND;

    pub fn is_busy(status: u32) -> bool {
        status & BUSY != 0
    }
}

// ============================================================================
// Frame Access Types
// ============================================================================

/// How `get_data` selects frames from the ring buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AccessType {
    /// Drain from the consumer cursor, frames packed without padding.
    NoGaps = 2,
    /// Drain from the consumer cursor into padded logical frames.
    FromStartFrame = 3,
    /// Copy the most recently completed frame.
    NewestData = 4,
    /// Copy the slot the device is currently writing. Diagnostic only.
    FromLoadPtr = 5,
}

impl AccessType {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            2 => Some(AccessType::NoGaps),
            3 => Some(AccessType::FromStartFrame),
            4 => Some(AccessType::NewestData),
            5 => Some(AccessType::FromLoadPtr),
            _ => None,
        }
    }

    /// True for the modes that consume frames and move the cursor.
    pub fn drains(self) -> bool {
        matches!(self, AccessType::NoGaps | AccessType::FromStartFrame)
    }

    /// Destination stride for a frame whose payload (without check word)
    /// is `payload_len` bytes.
    pub fn dest_stride(self, payload_len: usize) -> usize {
        match self {
            AccessType::NoGaps => payload_len,
            _ => LOGICAL_FRAME_SIZE,
        }
    }
}

// ============================================================================
// Legacy Result Codes
// ============================================================================

/// Flat integer result codes reported at the compatibility boundary.
pub mod codes {
    pub const NORMAL_RETURN: i32 = 1;
    pub const COMM_ERR: i32 = -1;
    pub const NULL_PARAM: i32 = -2;
    pub const INVALID_INDEX: i32 = -6;
    pub const NO_CONNECTION: i32 = -7;
    pub const BUSY: i32 = -10;
    pub const NO_CONFIG: i32 = -11;
    pub const DATA_COLLECTION_NOT_STARTED: i32 = -12;
    pub const PROGRAM_ERR: i32 = -13;
    pub const NO_CALIB_DATA: i32 = -14;
    pub const NO_SYS_INFO: i32 = -15;
    pub const DSP_COMMAND_NG: i32 = -16;
    pub const BAD_CRC: i32 = -17;
    pub const EXCEEDED_CMD_RETRY_LIMIT: i32 = -18;
    pub const FILE_OPEN_ERR: i32 = -19;
    pub const PGM_CRC_ERR: i32 = -20;
    pub const HEX_FILE_ERR: i32 = -21;
    pub const CKSUM_ERR: i32 = -22;
    pub const CONFIG_NOT_FOUND: i32 = -23;
    pub const ODD_NUMBER_OF_SBITS: i32 = -24;
    pub const DSP_VER_LT_1_7: i32 = -26;
    pub const INVALID_ITEM: i32 = -40;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_layout_chain() {
        assert_eq!(COMMAND_BUFFER_ADDR, 68);
        assert_eq!(CALIBRATION_ADDR, 88);
        assert_eq!(CONFIG_ADDR, 212);
        assert_eq!(CONFIG_SIZE, 5760);
        assert_eq!(POOL_HEADER_ADDR, 5972);
        assert_eq!(COMMAND_DATA_BUFFER_ADDR, 0xA01A_9F9C);
        assert!(COMMAND_DATA_BUFFER_ADDR < SDRAM_END);
    }

    #[test]
    fn test_busy_mask() {
        assert!(status::is_busy(status::NEW_COMMAND));
        assert!(status::is_busy(status::COLLECTING_DATA | status::COMPLETED_OK));
        assert!(!status::is_busy(status::COMPLETED_OK));
        assert!(!status::is_busy(status::BAD_CRC));
    }

    #[test]
    fn test_command_round_trip() {
        let cmd = DspCommand::SaveCalibrationToFlash;
        assert_eq!(DspCommand::from_code(cmd.code()), Some(cmd));
        assert_eq!(DspCommand::from_code(0x1234), None);
        assert_eq!(DspCommand::GetSerialNumber.code(), 0x8000_0000u32 as i32);
    }

    #[test]
    fn test_access_type_strides() {
        assert_eq!(LOGICAL_FRAME_SIZE, 104);
        assert_eq!(AccessType::NoGaps.dest_stride(20), 20);
        assert_eq!(AccessType::FromStartFrame.dest_stride(20), 104);
        assert_eq!(AccessType::from_byte(4), Some(AccessType::NewestData));
        assert_eq!(AccessType::from_byte(9), None);
        assert!(AccessType::NoGaps.drains());
        assert!(!AccessType::FromLoadPtr.drains());
    }
}
