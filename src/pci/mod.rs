//! Host-side driver for the UPC2 PCI DSP acquisition card.
//!
//! The card shares a block of its local memory with the host through the
//! HPI port. Everything the driver does is a read or write of that memory.
//!
//! # Layers
//!
//! 1. **Transport** - word transfers through the HPI registers ([`LocalBus`])
//! 2. **Command protocol** - CRC-protected command buffer plus status polling
//! 3. **Frame reader** - ring-buffer cursor arithmetic over acquired frames
//! 4. **Firmware loader** - Intel HEX decoding for in-circuit programming
//! 5. **Demo simulator** - synthetic frames when no card is attached
//! 6. **Card context** - per-index operations tying the layers together
//!
//! # Example
//!
//! ```ignore
//! use upc2_driver::pci::{AccessType, CardRegistry};
//! use upc2_driver::settings::DriverSettings;
//!
//! let registry = CardRegistry::init(DriverSettings::default());
//! let mut card = registry.card(0)?;
//! card.connect_registers(my_bar_mapping)?;
//! card.upload_config_from_path("scan.cfg")?;
//! card.start_data_collection()?;
//!
//! let mut frames = vec![0u8; 104 * 32];
//! let n = card.get_data(AccessType::FromStartFrame, 32, &mut frames)?;
//! ```

pub mod config;
pub mod crc;
pub mod demo;
pub mod device;
pub mod error;
pub mod firmware_reader;
pub mod layout;
pub mod legacy;
pub mod protocol;
pub mod ring;
pub mod transport;

// Card contexts
pub use device::{driver_info, Card, CardRegistry, Mode, ProgramDownload, ProgramStage};

// Errors
pub use error::{Upc2Error, Upc2Result};

// Transport and protocol
pub use protocol::{CommandClass, PollPolicy};
pub use transport::{LocalBus, MemoryTransport};

// Frame access
pub use config::{AccessType, ProgramDestination};
pub use layout::{CalibrationData, ConvertedDataFrame, DeviceConfig, ItemConfig, SwInfo};

// Flat result codes
pub use legacy::LegacyDriver;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_exports() {
        // Verify key types are accessible
        let _ = std::any::type_name::<CardRegistry>();
        let _ = std::any::type_name::<LegacyDriver>();
        let _ = std::any::type_name::<MemoryTransport<crate::traits::MockRegisterAccess>>();
        assert_eq!(Upc2Error::NotConnected.code(), config::codes::NO_CONNECTION);
    }
}
