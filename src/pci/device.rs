//! Per-card driver context and the card registry.
//!
//! Each card index owns a [`Card`]: its bus (when connected), demo state,
//! collection flag and cached memory-map snapshot. The registry hands out
//! one card at a time per index behind a mutex, so different indices can be
//! driven from different threads while calls on one index are serialized.

use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::config::{
    AccessType, DspCommand, ProgramDestination, CALIBRATION_ADDR, CALIBRATION_MM_ADDR,
    CALIBRATION_SIZE, COMMAND_DATA_BUFFER_ADDR, CONFIG_ADDR, CONFIG_MM_ADDR, CONFIG_SIZE,
    ITEM_OFFSET_OFFSET, ITEM_SCALE_OFFSET, MAX_PCI_CARDS, OP_INFO_SIZE, SDRAM_END, SW_INFO_SIZE,
    TIMESTAMP_ADDR, TIMESTAMP_SIZE,
};
use super::crc::crc32;
use super::demo::DemoState;
use super::error::{Upc2Error, Upc2Result};
use super::firmware_reader::read_hex_file;
use super::layout::{CalibrationData, DeviceConfig, MemoryMapSnapshot, OpInfo, SwInfo};
use super::protocol::{fetch_snapshot, CommandClass, CommandEngine, CommandRequest};
use super::ring::FrameReader;
use super::transport::LocalBus;
use crate::settings::DriverSettings;
use crate::traits::{Clock, RegisterAccess, SystemClock};

/// Lowest DSP code version that keeps the serial number in flash.
const SERIAL_IN_FLASH_VERSION: i32 = 17;

/// Which path served a call that works with or without hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Mode {
    Hardware,
    Demo,
}

/// In-circuit programming progress stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "stage", content = "data")]
pub enum ProgramStage {
    /// Decoding the HEX file.
    ReadingImage,
    /// Image decoded; copying it into the card's scratch buffer.
    Transferring { bytes: usize },
    /// Waiting for the DSP to burn flash.
    Programming,
    /// Flash written and acknowledged.
    Complete,
}

impl ProgramStage {
    /// Get a percentage estimate for this stage.
    pub fn percent(&self) -> f32 {
        match self {
            ProgramStage::ReadingImage => 0.0,
            ProgramStage::Transferring { .. } => 10.0,
            ProgramStage::Programming => 30.0,
            ProgramStage::Complete => 100.0,
        }
    }

    /// Get a human-readable message for this stage.
    pub fn message(&self) -> String {
        match self {
            ProgramStage::ReadingImage => "Reading firmware image...".into(),
            ProgramStage::Transferring { bytes } => {
                format!("Transferring {} bytes to card...", bytes)
            }
            ProgramStage::Programming => "Programming flash...".into(),
            ProgramStage::Complete => "Programming complete".into(),
        }
    }
}

/// Program image read back from the card.
#[derive(Debug, Clone)]
pub struct ProgramDownload {
    pub info: SwInfo,
    pub image: Vec<u8>,
}

/// Identification of this driver, in the card's software info layout.
pub fn driver_info() -> SwInfo {
    SwInfo {
        version: format!("Prod {}", env!("CARGO_PKG_VERSION")),
        creation_date: String::new(),
        creation_time: String::new(),
        code_size: 0,
    }
}

fn read_u32(bus: &mut dyn LocalBus, addr: u32) -> Upc2Result<u32> {
    let mut raw = [0u8; 4];
    bus.read(addr, &mut raw)?;
    Ok(u32::from_le_bytes(raw))
}

/// Driver context for one card index.
pub struct Card {
    index: usize,
    bus: Option<Box<dyn LocalBus>>,
    settings: DriverSettings,
    clock: Arc<dyn Clock>,
    collection_started: bool,
    demo: DemoState,
    last_snapshot: Option<MemoryMapSnapshot>,
}

impl Card {
    pub fn new(index: usize, settings: DriverSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            index,
            bus: None,
            settings,
            clock,
            collection_started: false,
            demo: DemoState::new(),
            last_snapshot: None,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn is_connected(&self) -> bool {
        self.bus.is_some()
    }

    pub fn mode(&self) -> Mode {
        if self.is_connected() {
            Mode::Hardware
        } else {
            Mode::Demo
        }
    }

    pub fn is_collecting(&self) -> bool {
        self.collection_started
    }

    pub fn demo(&self) -> &DemoState {
        &self.demo
    }

    /// Memory map and command buffer as of the last precondition check.
    pub fn last_snapshot(&self) -> Option<&MemoryMapSnapshot> {
        self.last_snapshot.as_ref()
    }

    /// Attach a bus. The memory map is read once to prove the link works.
    pub fn connect(&mut self, mut bus: Box<dyn LocalBus>) -> Upc2Result<()> {
        let snapshot = fetch_snapshot(bus.as_mut())?;
        self.last_snapshot = Some(snapshot);
        self.bus = Some(bus);
        info!("Card {} connected", self.index);
        Ok(())
    }

    /// Attach raw HPI registers through a memory transport. The card's RAM
    /// must pass a pattern test first.
    pub fn connect_registers<R: RegisterAccess + 'static>(&mut self, regs: R) -> Upc2Result<()> {
        let mut transport = self.settings.transport(regs);
        transport.self_test()?;
        self.connect(Box::new(transport))
    }

    pub fn disconnect(&mut self) {
        if self.bus.take().is_some() {
            info!("Card {} disconnected", self.index);
        }
        self.collection_started = false;
        self.last_snapshot = None;
    }

    fn bus(&mut self) -> Upc2Result<&mut (dyn LocalBus + 'static)> {
        self.bus.as_deref_mut().ok_or(Upc2Error::NotConnected)
    }

    /// Fresh memory map, cached for later inspection.
    fn snapshot(&mut self) -> Upc2Result<MemoryMapSnapshot> {
        let snapshot = fetch_snapshot(self.bus()?)?;
        self.last_snapshot = Some(snapshot);
        Ok(snapshot)
    }

    /// Fresh memory map, failing with `Busy` if a command is in progress.
    fn await_idle(&mut self) -> Upc2Result<MemoryMapSnapshot> {
        let snapshot = self.snapshot()?;
        if snapshot.is_busy() {
            return Err(Upc2Error::Busy);
        }
        Ok(snapshot)
    }

    fn run(&mut self, request: CommandRequest) -> Upc2Result<()> {
        let bus = self.bus.as_deref_mut().ok_or(Upc2Error::NotConnected)?;
        CommandEngine::new(&self.settings.poll, self.clock.as_ref())
            .attempts(self.settings.command_attempts)
            .execute(bus, request)
    }

    fn run_when_idle(&mut self, request: CommandRequest) -> Upc2Result<()> {
        let bus = self.bus.as_deref_mut().ok_or(Upc2Error::NotConnected)?;
        CommandEngine::new(&self.settings.poll, self.clock.as_ref())
            .attempts(self.settings.command_attempts)
            .execute_when_idle(bus, request)
    }

    fn read_scratch(&mut self, len: usize) -> Upc2Result<Vec<u8>> {
        let mut data = vec![0u8; (len + 3) & !3];
        self.bus()?.read(COMMAND_DATA_BUFFER_ADDR, &mut data)?;
        data.truncate(len);
        Ok(data)
    }

    // ------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------

    /// Publish a configuration. Without hardware only the demo state
    /// changes.
    pub fn upload_config(&mut self, config: &DeviceConfig) -> Upc2Result<Mode> {
        if !self.is_connected() {
            self.demo.apply_config(config);
            return Ok(Mode::Demo);
        }

        self.await_idle()?;
        if config.is_raw_data_mode() && config.n_sbits % 2 != 0 {
            return Err(Upc2Error::OddSbitCount {
                count: config.n_sbits,
            });
        }

        let bus = self.bus()?;
        bus.write(CONFIG_ADDR, &config.to_bytes())?;
        bus.write(CONFIG_MM_ADDR, &CONFIG_ADDR.to_le_bytes())?;
        info!(
            "Card {}: configuration uploaded ({} items, {} sbits)",
            self.index, config.n_items, config.n_sbits
        );
        Ok(Mode::Hardware)
    }

    /// Upload a binary `.cfg` file.
    pub fn upload_config_from_path<P: AsRef<Path>>(&mut self, path: P) -> Upc2Result<Mode> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(|source| Upc2Error::FileOpen {
            path: path.to_path_buf(),
            source,
        })?;
        if bytes.len() < CONFIG_SIZE {
            return Err(Upc2Error::ConfigNotFound {
                path: path.to_path_buf(),
            });
        }
        let config = DeviceConfig::parse(&bytes[..CONFIG_SIZE])?;
        self.upload_config(&config)
    }

    pub fn download_config(&mut self) -> Upc2Result<DeviceConfig> {
        if !self.snapshot()?.map.has_config() {
            return Err(Upc2Error::NoConfig);
        }
        let mut raw = vec![0u8; CONFIG_SIZE];
        self.bus()?.read(CONFIG_ADDR, &mut raw)?;
        DeviceConfig::parse(&raw)
    }

    pub fn number_of_items(&mut self) -> Upc2Result<i32> {
        Ok(self.download_config()?.n_items)
    }

    /// Change one item's scale factor and offset in place.
    pub fn set_scale_and_offset(&mut self, item: usize, scale: f32, offset: f32) -> Upc2Result<Mode> {
        if !self.is_connected() {
            self.demo.set_scale_and_offset(item, scale, offset)?;
            return Ok(Mode::Demo);
        }

        let config = self.download_config()?;
        if item >= config.item_count() {
            return Err(Upc2Error::InvalidItem { item });
        }
        let base = DeviceConfig::item_addr(CONFIG_ADDR, item);
        let bus = self.bus()?;
        bus.write(base + ITEM_OFFSET_OFFSET, &offset.to_le_bytes())?;
        bus.write(base + ITEM_SCALE_OFFSET, &scale.to_le_bytes())?;
        debug!("Card {}: item {} scale={} offset={}", self.index, item, scale, offset);
        Ok(Mode::Hardware)
    }

    // ------------------------------------------------------------------
    // Data collection
    // ------------------------------------------------------------------

    pub fn start_data_collection(&mut self) -> Upc2Result<Mode> {
        if !self.is_connected() {
            self.demo.start(self.clock.now_ms());
            self.collection_started = true;
            return Ok(Mode::Demo);
        }

        let snapshot = self.snapshot()?;
        if snapshot.is_busy() {
            debug!("Card {} already busy, treating as collecting", self.index);
            self.collection_started = true;
            return Ok(Mode::Hardware);
        }
        if !snapshot.map.has_config() {
            return Err(Upc2Error::NoConfig);
        }

        self.run(CommandRequest::start_collection())?;
        self.collection_started = true;
        info!("Card {}: data collection started", self.index);
        Ok(Mode::Hardware)
    }

    pub fn stop_data_collection(&mut self) -> Upc2Result<Mode> {
        if !self.is_connected() {
            self.collection_started = false;
            return Ok(Mode::Demo);
        }

        self.run(CommandRequest::new(
            DspCommand::StopDataCollection,
            CommandClass::Standard,
        ))?;
        self.collection_started = false;
        info!("Card {}: data collection stopped", self.index);
        Ok(Mode::Hardware)
    }

    /// Copy frames into `dest`; see [`FrameReader::get_data`].
    pub fn get_data(
        &mut self,
        access: AccessType,
        requested: usize,
        dest: &mut [u8],
    ) -> Upc2Result<usize> {
        if !self.collection_started {
            return Err(Upc2Error::DataCollectionNotStarted);
        }
        match self.bus.as_deref_mut() {
            Some(bus) => FrameReader::new(bus).get_data(access, requested, dest),
            None => {
                let now = self.clock.now_ms();
                self.demo.get_data(access, requested, dest, now)
            }
        }
    }

    pub fn unread_frame_count(&mut self) -> Upc2Result<u32> {
        FrameReader::new(self.bus()?).unread_count()
    }

    pub fn set_start_frame(&mut self) -> Upc2Result<()> {
        FrameReader::new(self.bus()?).set_start_frame()
    }

    // ------------------------------------------------------------------
    // Flash persistence
    // ------------------------------------------------------------------

    pub fn save_config_to_flash(&mut self) -> Upc2Result<()> {
        if !self.await_idle()?.map.has_config() {
            return Err(Upc2Error::NoConfig);
        }
        self.run(CommandRequest::new(
            DspCommand::SaveConfigToFlash,
            CommandClass::ConfigSave,
        ))
    }

    pub fn load_config_from_flash(&mut self) -> Upc2Result<()> {
        self.run_when_idle(CommandRequest::new(
            DspCommand::LoadConfigFromFlash,
            CommandClass::Standard,
        ))
    }

    pub fn save_calibration_to_flash(&mut self) -> Upc2Result<()> {
        if !self.await_idle()?.map.has_calibration() {
            return Err(Upc2Error::NoCalibData);
        }
        self.run(CommandRequest::new(
            DspCommand::SaveCalibrationToFlash,
            CommandClass::CalibrationSave,
        ))
    }

    pub fn load_calibration_from_flash(&mut self) -> Upc2Result<()> {
        self.run_when_idle(CommandRequest::new(
            DspCommand::LoadCalibrationFromFlash,
            CommandClass::Standard,
        ))
    }

    // ------------------------------------------------------------------
    // Calibration
    // ------------------------------------------------------------------

    /// Write the channel adjustment table. A configuration must be present.
    pub fn upload_calibration(&mut self, calibration: &CalibrationData) -> Upc2Result<()> {
        if !self.await_idle()?.map.has_config() {
            return Err(Upc2Error::NoConfig);
        }
        let bus = self.bus()?;
        bus.write(CALIBRATION_ADDR, &calibration.to_bytes())?;
        bus.write(CALIBRATION_MM_ADDR, &CALIBRATION_ADDR.to_le_bytes())?;
        info!("Card {}: calibration uploaded", self.index);
        Ok(())
    }

    pub fn download_calibration(&mut self) -> Upc2Result<CalibrationData> {
        if !self.snapshot()?.map.has_calibration() {
            return Err(Upc2Error::NoCalibData);
        }
        let mut raw = vec![0u8; CALIBRATION_SIZE];
        self.bus()?.read(CALIBRATION_ADDR, &mut raw)?;
        CalibrationData::parse(&raw)
    }

    // ------------------------------------------------------------------
    // Firmware
    // ------------------------------------------------------------------

    /// Burn an Intel HEX image into the card's flash.
    ///
    /// The image goes into the command scratch buffer behind its CRC-32;
    /// the command parameters carry the destination and image size.
    ///
    /// # Returns
    /// The number of image bytes programmed.
    pub fn in_circuit_program<P, F>(
        &mut self,
        destination: ProgramDestination,
        hex_path: P,
        mut progress: F,
    ) -> Upc2Result<usize>
    where
        P: AsRef<Path>,
        F: FnMut(ProgramStage),
    {
        self.await_idle()?;

        progress(ProgramStage::ReadingImage);
        let image = read_hex_file(hex_path)?;
        if image.is_empty() {
            return Err(Upc2Error::program("HEX file contains no data"));
        }

        let size = image.len();
        progress(ProgramStage::Transferring { bytes: size });
        let bus = self.bus()?;
        bus.write(COMMAND_DATA_BUFFER_ADDR, &image.crc().to_le_bytes())?;
        bus.write(COMMAND_DATA_BUFFER_ADDR + 4, &image.word_padded())?;

        progress(ProgramStage::Programming);
        info!(
            "Card {}: programming {:?} with {} bytes (CRC 0x{:08X})",
            self.index,
            destination,
            size,
            image.crc()
        );
        self.run(
            CommandRequest::new(DspCommand::InCircuitProgram, CommandClass::Firmware)
                .params([destination.code(), size as i32]),
        )?;

        progress(ProgramStage::Complete);
        info!("Card {}: programming complete", self.index);
        Ok(size)
    }

    /// Read back a program image and verify its trailing CRC-32.
    pub fn download_program(&mut self, source: ProgramDestination) -> Upc2Result<ProgramDownload> {
        self.await_idle()?;
        self.run(
            CommandRequest::new(DspCommand::DownloadProgram, CommandClass::Standard)
                .params([source.code(), 0]),
        )?;

        let info = SwInfo::parse(&self.read_scratch(SW_INFO_SIZE)?)?;
        let code_size = usize::try_from(info.code_size)
            .map_err(|_| Upc2Error::program(format!("invalid code size {}", info.code_size)))?;
        let capacity = (SDRAM_END - COMMAND_DATA_BUFFER_ADDR) as usize;
        let covered = SW_INFO_SIZE
            .checked_add(code_size)
            .filter(|&covered| covered.saturating_add(4) <= capacity)
            .ok_or_else(|| {
                Upc2Error::program(format!(
                    "code size {} does not fit the scratch buffer",
                    info.code_size
                ))
            })?;
        let data = self.read_scratch(covered + 4)?;

        let stored = u32::from_le_bytes([
            data[covered],
            data[covered + 1],
            data[covered + 2],
            data[covered + 3],
        ]);
        if crc32(&data[..covered]) != stored {
            warn!("Card {}: downloaded program failed CRC check", self.index);
            return Err(Upc2Error::BadCrc);
        }
        Ok(ProgramDownload {
            info,
            image: data[SW_INFO_SIZE..covered].to_vec(),
        })
    }

    // ------------------------------------------------------------------
    // System information
    // ------------------------------------------------------------------

    pub fn system_info(&mut self) -> Upc2Result<SwInfo> {
        self.run_when_idle(CommandRequest::new(
            DspCommand::GetSystemInfo,
            CommandClass::Query,
        ))?;
        SwInfo::parse(&self.read_scratch(SW_INFO_SIZE)?)
    }

    pub fn system_op_info(&mut self) -> Upc2Result<OpInfo> {
        self.run_when_idle(CommandRequest::new(
            DspCommand::GetSystemOpInfo,
            CommandClass::Query,
        ))?;
        OpInfo::parse(&self.read_scratch(OP_INFO_SIZE)?)
    }

    /// DSP code version as `major * 10 + minor`.
    pub fn dsp_code_version(&mut self) -> Upc2Result<i32> {
        self.system_info()?.code_version().ok_or(Upc2Error::NoSysInfo)
    }

    fn require_serial_in_flash(&mut self) -> Upc2Result<()> {
        let version = self.dsp_code_version()?;
        if version < SERIAL_IN_FLASH_VERSION {
            return Err(Upc2Error::DspVersionTooOld { version });
        }
        Ok(())
    }

    pub fn serial_number(&mut self) -> Upc2Result<u32> {
        self.require_serial_in_flash()?;
        self.run_when_idle(CommandRequest::new(
            DspCommand::GetSerialNumber,
            CommandClass::Query,
        ))?;
        read_u32(self.bus()?, COMMAND_DATA_BUFFER_ADDR)
    }

    pub fn set_serial_number(&mut self, serial: u32) -> Upc2Result<()> {
        self.require_serial_in_flash()?;
        self.run_when_idle(
            CommandRequest::new(DspCommand::SetSerialNumber, CommandClass::SerialNumber)
                .params([serial as i32, 0]),
        )?;
        info!("Card {}: serial number set to {}", self.index, serial);
        Ok(())
    }

    fn write_timestamp(&mut self, timestamp: i32) -> Upc2Result<()> {
        let mut bytes = Vec::with_capacity(TIMESTAMP_SIZE);
        for word in [timestamp, timestamp, -1] {
            bytes.extend_from_slice(&word.to_le_bytes());
        }
        self.bus()?.write(TIMESTAMP_ADDR, &bytes)
    }
}

/// Every card context the driver knows about, one per index.
pub struct CardRegistry {
    cards: Vec<Mutex<Card>>,
}

impl CardRegistry {
    /// Create contexts for all card indices, none of them connected.
    pub fn init(settings: DriverSettings) -> Self {
        Self::with_clock(settings, Arc::new(SystemClock))
    }

    pub fn with_clock(settings: DriverSettings, clock: Arc<dyn Clock>) -> Self {
        let cards = (0..MAX_PCI_CARDS)
            .map(|index| Mutex::new(Card::new(index, settings.clone(), Arc::clone(&clock))))
            .collect();
        debug!("Card registry initialised for {} cards", MAX_PCI_CARDS);
        Self { cards }
    }

    /// Exclusive access to the card at `index`.
    pub fn card(&self, index: usize) -> Upc2Result<MutexGuard<'_, Card>> {
        let slot = self
            .cards
            .get(index)
            .ok_or(Upc2Error::InvalidIndex { index })?;
        Ok(slot.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn connect(&self, index: usize, bus: Box<dyn LocalBus>) -> Upc2Result<()> {
        self.card(index)?.connect(bus)
    }

    pub fn disconnect(&self, index: usize) -> Upc2Result<()> {
        self.card(index)?.disconnect();
        Ok(())
    }

    /// Write `timestamp` to every connected card.
    ///
    /// Each card gets the value advanced by the microseconds spent writing
    /// to the cards before it. A card whose write fails is logged and
    /// skipped. Returns the number of cards written.
    pub fn set_timestamp(&self, timestamp: i32) -> Upc2Result<usize> {
        let mut current = timestamp;
        let mut connected = 0;
        let mut written = 0;
        for slot in &self.cards {
            let started = Instant::now();
            let mut card = slot.lock().unwrap_or_else(PoisonError::into_inner);
            if !card.is_connected() {
                continue;
            }
            connected += 1;
            match card.write_timestamp(current) {
                Ok(()) => written += 1,
                Err(e) => warn!("Card {}: timestamp not written: {}", card.index(), e),
            }
            let elapsed_us = started.elapsed().as_micros().min(i32::MAX as u128) as i32;
            current = current.wrapping_add(elapsed_us);
        }
        if connected == 0 {
            return Err(Upc2Error::NotConnected);
        }
        Ok(written)
    }

    /// Disconnect every card.
    pub fn shutdown(&self) {
        for slot in &self.cards {
            slot.lock().unwrap_or_else(PoisonError::into_inner).disconnect();
        }
        info!("Card registry shut down");
    }
}
