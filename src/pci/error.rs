//! Error types for the UPC2 card driver.

use std::path::PathBuf;

use thiserror::Error;

use super::config::codes;

/// Result type alias for driver operations.
pub type Upc2Result<T> = Result<T, Upc2Error>;

/// Errors that can occur while talking to a UPC2 card.
#[derive(Debug, Error)]
pub enum Upc2Error {
    /// No bus is attached for this card index.
    #[error("Card is not connected")]
    NotConnected,

    /// Card index outside the supported range.
    #[error("Invalid card index {index}")]
    InvalidIndex { index: usize },

    /// The device is still processing a previous command.
    #[error("Device is busy")]
    Busy,

    /// Transport level failure.
    #[error("Communication error: {reason}")]
    Comm { reason: String },

    /// Access to the reserved local address range.
    #[error("Local address 0x{addr:08X} is in the forbidden range")]
    ForbiddenAddress { addr: u32 },

    /// The device rejected the command buffer CRC.
    #[error("Device reported bad command CRC")]
    BadCrc,

    /// The device completed the command with a failure status.
    #[error("Device rejected command 0x{command:08X}")]
    CommandRejected { command: u32 },

    /// All submit+poll cycles ran out.
    #[error("Command 0x{command:08X} exceeded {attempts} attempts")]
    RetryLimitExceeded { command: u32, attempts: u32 },

    /// Additive check word did not match the received payload.
    #[error("Checksum mismatch: expected 0x{expected:08X}, got 0x{actual:08X}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// No configuration has been published to the device.
    #[error("No configuration uploaded")]
    NoConfig,

    /// No calibration table has been published to the device.
    #[error("No calibration data on device")]
    NoCalibData,

    /// Raw-data acquisition needs an even number of scan bits.
    #[error("Raw data mode requires an even sbit count, got {count}")]
    OddSbitCount { count: i32 },

    /// A file could not be opened.
    #[error("Failed to open {path}: {source}")]
    FileOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Malformed Intel HEX content.
    #[error("HEX file error at line {line}: {reason}")]
    HexFile { line: usize, reason: String },

    /// Intel HEX record checksum mismatch.
    #[error("HEX checksum error at line {line}")]
    HexChecksum { line: usize },

    /// Configuration file shorter than a configuration record.
    #[error("Configuration not found in {path}")]
    ConfigNotFound { path: PathBuf },

    /// Item index outside the configured item count.
    #[error("Invalid item {item}")]
    InvalidItem { item: usize },

    /// Frames were requested before collection started.
    #[error("Data collection not started")]
    DataCollectionNotStarted,

    /// Destination buffer cannot hold the requested frames.
    #[error("Buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },

    /// Frame pool header read from the device is inconsistent.
    #[error("Invalid frame pool header: {reason}")]
    InvalidFramePool { reason: String },

    /// Program image problem (empty, too large, wrong layout).
    #[error("Program error: {reason}")]
    Program { reason: String },

    /// Firmware older than 1.7 keeps the serial number in EEPROM.
    #[error("DSP code version {version} does not support this operation")]
    DspVersionTooOld { version: i32 },

    /// No system information available from the device.
    #[error("No system information")]
    NoSysInfo,

    /// Standard I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Settings JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Upc2Error {
    /// Shorthand for a transport failure.
    pub fn comm(reason: impl Into<String>) -> Self {
        Upc2Error::Comm {
            reason: reason.into(),
        }
    }

    pub fn program(reason: impl Into<String>) -> Self {
        Upc2Error::Program {
            reason: reason.into(),
        }
    }

    /// Check if this error is transient and the operation may succeed on retry.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Upc2Error::Busy
                | Upc2Error::BadCrc
                | Upc2Error::Comm { .. }
                | Upc2Error::ChecksumMismatch { .. }
                | Upc2Error::RetryLimitExceeded { .. }
        )
    }

    /// Legacy flat result code for this error.
    pub fn code(&self) -> i32 {
        match self {
            Upc2Error::NotConnected => codes::NO_CONNECTION,
            Upc2Error::InvalidIndex { .. } => codes::INVALID_INDEX,
            Upc2Error::Busy => codes::BUSY,
            Upc2Error::Comm { .. } => codes::COMM_ERR,
            Upc2Error::ForbiddenAddress { .. } => codes::COMM_ERR,
            Upc2Error::BadCrc => codes::BAD_CRC,
            Upc2Error::CommandRejected { .. } => codes::DSP_COMMAND_NG,
            Upc2Error::RetryLimitExceeded { .. } => codes::EXCEEDED_CMD_RETRY_LIMIT,
            Upc2Error::ChecksumMismatch { .. } => codes::CKSUM_ERR,
            Upc2Error::NoConfig => codes::NO_CONFIG,
            Upc2Error::NoCalibData => codes::NO_CALIB_DATA,
            Upc2Error::OddSbitCount { .. } => codes::ODD_NUMBER_OF_SBITS,
            Upc2Error::FileOpen { .. } => codes::FILE_OPEN_ERR,
            Upc2Error::HexFile { .. } => codes::HEX_FILE_ERR,
            Upc2Error::HexChecksum { .. } => codes::PGM_CRC_ERR,
            Upc2Error::ConfigNotFound { .. } => codes::CONFIG_NOT_FOUND,
            Upc2Error::InvalidItem { .. } => codes::INVALID_ITEM,
            Upc2Error::DataCollectionNotStarted => codes::DATA_COLLECTION_NOT_STARTED,
            Upc2Error::BufferTooSmall { .. } => codes::NULL_PARAM,
            Upc2Error::InvalidFramePool { .. } => codes::COMM_ERR,
            Upc2Error::Program { .. } => codes::PROGRAM_ERR,
            Upc2Error::DspVersionTooOld { .. } => codes::DSP_VER_LT_1_7,
            Upc2Error::NoSysInfo => codes::NO_SYS_INFO,
            Upc2Error::Io(_) => codes::FILE_OPEN_ERR,
            Upc2Error::Json(_) => codes::COMM_ERR,
        }
    }
}
