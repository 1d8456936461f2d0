//! Flat integer result codes for callers of the C-style driver API.
//!
//! Every entry point here takes a card index, runs the typed operation and
//! folds the outcome into one `i32`: `NORMAL_RETURN` (or a count) on
//! success, the error's legacy code on failure. Values come back through
//! out-parameters.

use std::path::Path;

use tracing::debug;

use super::config::{codes, AccessType, ProgramDestination};
use super::device::{driver_info, CardRegistry, Mode, ProgramStage};
use super::error::Upc2Result;
use super::layout::{CalibrationData, DeviceConfig, OpInfo, SwInfo};
use super::transport::LocalBus;

/// Success values that have a legacy integer form.
pub trait LegacyReturn {
    fn legacy_code(&self) -> i32;
}

impl LegacyReturn for () {
    fn legacy_code(&self) -> i32 {
        codes::NORMAL_RETURN
    }
}

/// Demo-path acknowledgements were reported as "no connection".
impl LegacyReturn for Mode {
    fn legacy_code(&self) -> i32 {
        match self {
            Mode::Hardware => codes::NORMAL_RETURN,
            Mode::Demo => codes::NO_CONNECTION,
        }
    }
}

impl LegacyReturn for usize {
    fn legacy_code(&self) -> i32 {
        (*self).min(i32::MAX as usize) as i32
    }
}

impl LegacyReturn for u32 {
    fn legacy_code(&self) -> i32 {
        (*self).min(i32::MAX as u32) as i32
    }
}

/// Collapse a typed result into the flat code space.
pub fn to_code<T: LegacyReturn>(result: &Upc2Result<T>) -> i32 {
    match result {
        Ok(value) => value.legacy_code(),
        Err(e) => {
            debug!("Legacy call failed: {} (code {})", e, e.code());
            e.code()
        }
    }
}

/// Store the value through `out` on success and return the legacy code.
fn with_out<T>(result: Upc2Result<T>, out: &mut T) -> i32 {
    match result {
        Ok(value) => {
            *out = value;
            codes::NORMAL_RETURN
        }
        Err(e) => to_code::<()>(&Err(e)),
    }
}

/// The C-style driver entry points over a [`CardRegistry`].
pub struct LegacyDriver {
    registry: CardRegistry,
}

impl LegacyDriver {
    pub fn new(registry: CardRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &CardRegistry {
        &self.registry
    }

    pub fn connect(&self, index: usize, bus: Box<dyn LocalBus>) -> i32 {
        to_code(&self.registry.connect(index, bus))
    }

    pub fn disconnect(&self, index: usize) -> i32 {
        to_code(&self.registry.disconnect(index))
    }

    /// Cards whose write fails are skipped; the call still succeeds.
    pub fn set_timestamp(&self, timestamp: i32) -> i32 {
        to_code(&self.registry.set_timestamp(timestamp).map(|_| ()))
    }

    pub fn upload_config(&self, index: usize, config: &DeviceConfig) -> i32 {
        to_code(&self.registry.card(index).and_then(|mut c| c.upload_config(config)))
    }

    pub fn upload_config_from_path<P: AsRef<Path>>(&self, index: usize, path: P) -> i32 {
        to_code(
            &self
                .registry
                .card(index)
                .and_then(|mut c| c.upload_config_from_path(path)),
        )
    }

    pub fn download_config(&self, index: usize, out: &mut DeviceConfig) -> i32 {
        with_out(self.registry.card(index).and_then(|mut c| c.download_config()), out)
    }

    pub fn get_number_of_items(&self, index: usize, out: &mut i32) -> i32 {
        with_out(self.registry.card(index).and_then(|mut c| c.number_of_items()), out)
    }

    pub fn set_scale_and_offset(&self, index: usize, item: usize, scale: f32, offset: f32) -> i32 {
        to_code(
            &self
                .registry
                .card(index)
                .and_then(|mut c| c.set_scale_and_offset(item, scale, offset)),
        )
    }

    pub fn start_data_collection(&self, index: usize) -> i32 {
        to_code(&self.registry.card(index).and_then(|mut c| c.start_data_collection()))
    }

    pub fn stop_data_collection(&self, index: usize) -> i32 {
        to_code(&self.registry.card(index).and_then(|mut c| c.stop_data_collection()))
    }

    /// Returns the number of frames copied into `dest`.
    /// `access` is the raw access type code (2 to 5).
    pub fn get_data(&self, index: usize, access: u8, requested: usize, dest: &mut [u8]) -> i32 {
        let Some(access) = AccessType::from_byte(access) else {
            return codes::NULL_PARAM;
        };
        to_code(
            &self
                .registry
                .card(index)
                .and_then(|mut c| c.get_data(access, requested, dest)),
        )
    }

    /// Returns the number of unread frames.
    pub fn get_unread_frame_count(&self, index: usize) -> i32 {
        to_code(&self.registry.card(index).and_then(|mut c| c.unread_frame_count()))
    }

    pub fn set_start_frame(&self, index: usize) -> i32 {
        to_code(&self.registry.card(index).and_then(|mut c| c.set_start_frame()))
    }

    pub fn save_config_to_flash(&self, index: usize) -> i32 {
        to_code(&self.registry.card(index).and_then(|mut c| c.save_config_to_flash()))
    }

    pub fn load_config_from_flash(&self, index: usize) -> i32 {
        to_code(&self.registry.card(index).and_then(|mut c| c.load_config_from_flash()))
    }

    pub fn save_calibration_to_flash(&self, index: usize) -> i32 {
        to_code(&self.registry.card(index).and_then(|mut c| c.save_calibration_to_flash()))
    }

    pub fn load_calibration_from_flash(&self, index: usize) -> i32 {
        to_code(&self.registry.card(index).and_then(|mut c| c.load_calibration_from_flash()))
    }

    pub fn upload_calibration(&self, index: usize, calibration: &CalibrationData) -> i32 {
        to_code(
            &self
                .registry
                .card(index)
                .and_then(|mut c| c.upload_calibration(calibration)),
        )
    }

    pub fn download_calibration(&self, index: usize, out: &mut CalibrationData) -> i32 {
        with_out(
            self.registry.card(index).and_then(|mut c| c.download_calibration()),
            out,
        )
    }

    /// Progress is reported as percentages.
    pub fn in_circuit_program<P, F>(
        &self,
        index: usize,
        destination: ProgramDestination,
        hex_path: P,
        mut progress: F,
    ) -> i32
    where
        P: AsRef<Path>,
        F: FnMut(f32),
    {
        let result = self.registry.card(index).and_then(|mut c| {
            c.in_circuit_program(destination, hex_path, |stage: ProgramStage| {
                progress(stage.percent())
            })
        });
        to_code(&result.map(|_| ()))
    }

    /// Read back a program image. `info` and `image` are only written when
    /// the image passes its CRC check.
    pub fn download_program(
        &self,
        index: usize,
        source: ProgramDestination,
        info: &mut SwInfo,
        image: &mut Vec<u8>,
    ) -> i32 {
        match self.registry.card(index).and_then(|mut c| c.download_program(source)) {
            Ok(download) => {
                *info = download.info;
                *image = download.image;
                codes::NORMAL_RETURN
            }
            Err(e) => to_code::<()>(&Err(e)),
        }
    }

    pub fn get_system_info(&self, index: usize, out: &mut SwInfo) -> i32 {
        with_out(self.registry.card(index).and_then(|mut c| c.system_info()), out)
    }

    pub fn get_system_op_info(&self, index: usize, out: &mut OpInfo) -> i32 {
        with_out(self.registry.card(index).and_then(|mut c| c.system_op_info()), out)
    }

    pub fn get_driver_info(&self, out: &mut SwInfo) -> i32 {
        with_out(Ok(driver_info()), out)
    }

    pub fn get_dsp_code_version(&self, index: usize, out: &mut i32) -> i32 {
        with_out(self.registry.card(index).and_then(|mut c| c.dsp_code_version()), out)
    }

    pub fn get_serial_number(&self, index: usize, out: &mut u32) -> i32 {
        with_out(self.registry.card(index).and_then(|mut c| c.serial_number()), out)
    }

    pub fn set_serial_number(&self, index: usize, serial: u32) -> i32 {
        to_code(&self.registry.card(index).and_then(|mut c| c.set_serial_number(serial)))
    }

    pub fn shutdown(&self) -> i32 {
        self.registry.shutdown();
        codes::NORMAL_RETURN
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pci::config::{status, COMMAND_DATA_BUFFER_ADDR, LOGICAL_FRAME_SIZE};
    use crate::pci::crc::crc32;
    use crate::pci::Upc2Error;
    use crate::settings::DriverSettings;
    use crate::test_helpers::{ConfigBuilder, ManualClock, SimulatedCard};
    use std::sync::Arc;

    fn driver(clock: Arc<ManualClock>) -> LegacyDriver {
        LegacyDriver::new(CardRegistry::with_clock(DriverSettings::default(), clock))
    }

    #[test]
    fn test_to_code_success_values() {
        assert_eq!(to_code(&Ok(())), 1);
        assert_eq!(to_code(&Ok(Mode::Hardware)), 1);
        assert_eq!(to_code(&Ok(Mode::Demo)), -7);
        assert_eq!(to_code(&Ok(12usize)), 12);
        assert_eq!(to_code::<()>(&Err(Upc2Error::NoConfig)), -11);
    }

    #[test]
    fn test_codes_are_distinct_per_kind() {
        let errors = [
            Upc2Error::NotConnected,
            Upc2Error::InvalidIndex { index: 10 },
            Upc2Error::Busy,
            Upc2Error::comm("x"),
            Upc2Error::BadCrc,
            Upc2Error::CommandRejected { command: 0 },
            Upc2Error::RetryLimitExceeded { command: 0, attempts: 3 },
            Upc2Error::ChecksumMismatch { expected: 0, actual: 1 },
            Upc2Error::NoConfig,
            Upc2Error::NoCalibData,
            Upc2Error::OddSbitCount { count: 3 },
            Upc2Error::HexFile { line: 1, reason: "x".into() },
            Upc2Error::HexChecksum { line: 1 },
            Upc2Error::ConfigNotFound { path: "a".into() },
            Upc2Error::InvalidItem { item: 0 },
        ];
        let mut seen: Vec<i32> = errors.iter().map(|e| e.code()).collect();
        assert!(seen.iter().all(|&c| c < 0));
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), errors.len());
    }

    #[test]
    fn test_demo_acknowledgements_report_no_connection() {
        let clock = Arc::new(ManualClock::new(0));
        let driver = driver(clock.clone());
        let config = ConfigBuilder::new().items(1).sbits(24).scan_interval(40).build();

        assert_eq!(driver.upload_config(0, &config), codes::NO_CONNECTION);
        assert_eq!(driver.start_data_collection(0), codes::NO_CONNECTION);

        clock.advance(96);
        let mut dest = vec![0u8; LOGICAL_FRAME_SIZE * 20];
        assert_eq!(driver.get_data(0, AccessType::FromStartFrame as u8, 20, &mut dest), 10);
        assert_eq!(driver.stop_data_collection(0), codes::NO_CONNECTION);
        assert_eq!(
            driver.get_data(0, AccessType::FromStartFrame as u8, 1, &mut dest),
            codes::DATA_COLLECTION_NOT_STARTED
        );
    }

    #[test]
    fn test_hardware_path_returns_normal() {
        let driver = driver(Arc::new(ManualClock::new(0)));
        let sim = SimulatedCard::new().respond_always(status::COLLECTING_DATA);
        assert_eq!(driver.connect(4, Box::new(sim)), 1);

        let config = ConfigBuilder::new().items(3).build();
        assert_eq!(driver.upload_config(4, &config), 1);
        let mut items = 0;
        assert_eq!(driver.get_number_of_items(4, &mut items), 1);
        assert_eq!(items, 3);
        assert_eq!(driver.start_data_collection(4), 1);
        assert_eq!(driver.shutdown(), 1);
        assert_eq!(driver.get_unread_frame_count(4), codes::NO_CONNECTION);
    }

    #[test]
    fn test_out_parameter_untouched_on_error() {
        let driver = driver(Arc::new(ManualClock::new(0)));
        let mut version = -99;
        assert_eq!(driver.get_dsp_code_version(0, &mut version), codes::NO_CONNECTION);
        assert_eq!(version, -99);
        assert_eq!(driver.get_dsp_code_version(10, &mut version), codes::INVALID_INDEX);
    }

    #[test]
    fn test_unknown_access_type() {
        let driver = driver(Arc::new(ManualClock::new(0)));
        let mut dest = vec![0u8; LOGICAL_FRAME_SIZE];
        assert_eq!(driver.get_data(0, 9, 1, &mut dest), codes::NULL_PARAM);
    }

    #[test]
    fn test_set_timestamp_without_cards() {
        let driver = driver(Arc::new(ManualClock::new(0)));
        assert_eq!(driver.set_timestamp(5), codes::NO_CONNECTION);
        driver.connect(1, Box::new(SimulatedCard::new()));
        driver.connect(2, Box::new(SimulatedCard::new()));
        assert_eq!(driver.set_timestamp(5), codes::NORMAL_RETURN);
    }

    #[test]
    fn test_info_entry_points() {
        let driver = driver(Arc::new(ManualClock::new(0)));
        let mut info = SwInfo::default();
        assert_eq!(driver.get_driver_info(&mut info), codes::NORMAL_RETURN);
        assert!(info.version.ends_with(env!("CARGO_PKG_VERSION")));

        let mut op = OpInfo::default();
        assert_eq!(driver.get_system_op_info(0, &mut op), codes::NO_CONNECTION);

        let sim = SimulatedCard::new();
        driver.connect(0, Box::new(sim.clone()));
        sim.poke_words(COMMAND_DATA_BUFFER_ADDR, &[1, 2, 3, 4, 5]);
        assert_eq!(driver.get_system_op_info(0, &mut op), codes::NORMAL_RETURN);
        assert_eq!(op.words, [1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_download_program_fills_out_parameters() {
        let driver = driver(Arc::new(ManualClock::new(0)));
        let sim = SimulatedCard::new();
        driver.connect(0, Box::new(sim.clone()));

        let image = vec![4u8, 3, 2, 1];
        let staged = SwInfo {
            version: "Production v1.8".into(),
            code_size: image.len() as i32,
            ..SwInfo::default()
        };
        let mut payload = staged.to_bytes();
        payload.extend_from_slice(&image);
        let crc = crc32(&payload);
        payload.extend_from_slice(&crc.to_le_bytes());
        sim.poke_bytes(COMMAND_DATA_BUFFER_ADDR, &payload);

        let mut info = SwInfo::default();
        let mut out = Vec::new();
        let code = driver.download_program(0, ProgramDestination::Program, &mut info, &mut out);
        assert_eq!(code, codes::NORMAL_RETURN);
        assert_eq!(out, image);
        assert_eq!(info.version, "Production v1.8");

        let mut untouched = vec![9u8];
        let code = driver.download_program(1, ProgramDestination::Boot, &mut info, &mut untouched);
        assert_eq!(code, codes::NO_CONNECTION);
        assert_eq!(untouched, vec![9]);
    }
}
