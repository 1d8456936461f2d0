//! Synthetic data source used when a card is not connected.
//!
//! Mirrors the frame reader's call contract so callers never need to know
//! whether a card is real. Frames follow a repeating ramp so the output is
//! reproducible.

use tracing::debug;

use super::config::{AccessType, FRAME_HEADER_SIZE, MAX_ITEMS};
use super::error::{Upc2Error, Upc2Result};
use super::layout::{ConvertedDataFrame, DeviceConfig};

/// Per-card simulator state. Follows the last uploaded configuration.
#[derive(Debug, Clone)]
pub struct DemoState {
    n_items: usize,
    n_sbits: i32,
    scan_interval: i32,
    scale: [f32; MAX_ITEMS],
    offset: [f32; MAX_ITEMS],
    frame_no: i32,
    last_tick_ms: u64,
}

impl Default for DemoState {
    fn default() -> Self {
        Self {
            n_items: 0,
            n_sbits: 0,
            scan_interval: 0,
            scale: [1.0; MAX_ITEMS],
            offset: [0.0; MAX_ITEMS],
            frame_no: 0,
            last_tick_ms: 0,
        }
    }
}

impl DemoState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take over item count, timing and per-item scaling from `config`.
    /// Restarts frame numbering.
    pub fn apply_config(&mut self, config: &DeviceConfig) {
        self.n_items = config.item_count();
        self.n_sbits = config.n_sbits;
        self.scan_interval = config.scan_interval;
        self.frame_no = 0;
        for i in 0..self.n_items {
            let item = config.items.get(i);
            self.scale[i] = item.map_or(1.0, |it| it.scale_factor);
            self.offset[i] = item.map_or(0.0, |it| it.offset);
        }
        debug!(
            "Demo configured: {} items, {} sbits, scan interval {}",
            self.n_items, self.n_sbits, self.scan_interval
        );
    }

    pub fn set_scale_and_offset(&mut self, item: usize, scale: f32, offset: f32) -> Upc2Result<()> {
        if item >= self.n_items {
            return Err(Upc2Error::InvalidItem { item });
        }
        self.scale[item] = scale;
        self.offset[item] = offset;
        Ok(())
    }

    pub fn item_count(&self) -> usize {
        self.n_items
    }

    pub fn next_frame_no(&self) -> i32 {
        self.frame_no
    }

    /// Mark the start of collection; elapsed time is measured from here.
    pub fn start(&mut self, now_ms: u64) {
        self.last_tick_ms = now_ms;
    }

    /// Frame period in units of 10 µs (the scan interval unit).
    fn frame_period(&self) -> i64 {
        self.scan_interval as i64 * self.n_sbits as i64
    }

    /// Frames the card would have produced since the previous drain.
    fn elapsed_frames(&mut self, now_ms: u64) -> usize {
        let elapsed = now_ms.saturating_sub(self.last_tick_ms);
        self.last_tick_ms = now_ms;
        let period = self.frame_period();
        if period <= 0 {
            return 0;
        }
        (100 * elapsed as i64 / period) as usize
    }

    fn synthesize(&mut self) -> ConvertedDataFrame {
        let frame_no = self.frame_no;
        self.frame_no = self.frame_no.wrapping_add(1);
        let ramp = frame_no.rem_euclid(10) as f32 * 0.1;
        let values = (0..self.n_items)
            .map(|i| (i as f32 + 1.0 + ramp) * self.scale[i] + self.offset[i])
            .collect();
        ConvertedDataFrame {
            frame_no,
            timestamp: frame_no.wrapping_mul(self.frame_period() as i32),
            values,
        }
    }

    /// Fill `dest` with synthetic frames, returning how many were written.
    ///
    /// Draining modes produce as many frames as wall-clock time allows, up
    /// to `requested`; the single-frame modes always produce one.
    pub fn get_data(
        &mut self,
        access: AccessType,
        requested: usize,
        dest: &mut [u8],
        now_ms: u64,
    ) -> Upc2Result<usize> {
        let count = if access.drains() {
            requested.min(self.elapsed_frames(now_ms))
        } else {
            1
        };
        let stride = access.dest_stride(FRAME_HEADER_SIZE + self.n_items * 4);
        let needed = count * stride;
        if dest.len() < needed {
            return Err(Upc2Error::BufferTooSmall {
                needed,
                available: dest.len(),
            });
        }

        for out in dest.chunks_mut(stride).take(count) {
            self.synthesize().write_into(out);
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pci::config::LOGICAL_FRAME_SIZE;
    use crate::pci::layout::ItemConfig;

    fn config(n_items: i32, n_sbits: i32, scan_interval: i32) -> DeviceConfig {
        DeviceConfig {
            n_items,
            n_sbits,
            scan_interval,
            items: (0..n_items)
                .map(|_| ItemConfig {
                    scale_factor: 1.0,
                    ..ItemConfig::default()
                })
                .collect(),
            ..DeviceConfig::default()
        }
    }

    #[test]
    fn test_ramp_values_follow_frame_number() {
        let mut demo = DemoState::new();
        demo.apply_config(&config(1, 24, 40));
        demo.start(0);

        // 960 per frame unit: 96 ms is ten frames.
        let mut seen = Vec::new();
        let mut now = 0;
        for _ in 0..3 {
            now += 96 * 2;
            let mut dest = vec![0u8; LOGICAL_FRAME_SIZE * 20];
            let n = demo
                .get_data(AccessType::FromStartFrame, 20, &mut dest, now)
                .unwrap();
            assert_eq!(n, 20);
            seen.extend(ConvertedDataFrame::parse_many(&dest, LOGICAL_FRAME_SIZE, n, 1).unwrap());
        }

        assert!(seen.windows(2).all(|w| w[1].frame_no > w[0].frame_no));
        for frame in &seen {
            let k = frame.frame_no % 10;
            assert!((frame.values[0] - (1.0 + k as f32 * 0.1)).abs() < 1e-5);
            assert_eq!(frame.timestamp, frame.frame_no * 40 * 24);
        }
    }

    #[test]
    fn test_elapsed_time_limits_frame_count() {
        let mut demo = DemoState::new();
        demo.apply_config(&config(2, 24, 40));
        demo.start(1000);

        let mut dest = vec![0u8; LOGICAL_FRAME_SIZE * 50];
        let n = demo
            .get_data(AccessType::FromStartFrame, 50, &mut dest, 1000 + 96 * 3)
            .unwrap();
        assert_eq!(n, 30);

        let n = demo
            .get_data(AccessType::FromStartFrame, 50, &mut dest, 1000 + 96 * 3)
            .unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn test_scale_and_offset_applied() {
        let mut demo = DemoState::new();
        demo.apply_config(&config(2, 24, 40));
        demo.set_scale_and_offset(1, 2.0, 0.5).unwrap();

        let mut dest = vec![0u8; LOGICAL_FRAME_SIZE];
        demo.get_data(AccessType::NewestData, 1, &mut dest, 0).unwrap();
        let frame = ConvertedDataFrame::parse(&dest, 2).unwrap();
        assert_eq!(frame.frame_no, 0);
        assert_eq!(frame.values, vec![1.0, 4.5]);
    }

    #[test]
    fn test_scale_for_missing_item_rejected() {
        let mut demo = DemoState::new();
        demo.apply_config(&config(2, 24, 40));
        assert!(matches!(
            demo.set_scale_and_offset(2, 1.0, 0.0),
            Err(Upc2Error::InvalidItem { item: 2 })
        ));
    }

    #[test]
    fn test_single_frame_modes_ignore_elapsed_time() {
        let mut demo = DemoState::new();
        demo.apply_config(&config(1, 24, 40));
        let mut dest = vec![0u8; LOGICAL_FRAME_SIZE];
        assert_eq!(demo.get_data(AccessType::FromLoadPtr, 9, &mut dest, 0).unwrap(), 1);
        assert_eq!(demo.next_frame_no(), 1);
    }

    #[test]
    fn test_unconfigured_demo_produces_no_bulk_frames() {
        let mut demo = DemoState::new();
        let mut dest = vec![0u8; LOGICAL_FRAME_SIZE];
        assert_eq!(
            demo.get_data(AccessType::FromStartFrame, 1, &mut dest, 10_000).unwrap(),
            0
        );
    }

    #[test]
    fn test_gapless_stride_follows_item_count() {
        let mut demo = DemoState::new();
        demo.apply_config(&config(2, 24, 40));
        demo.start(0);

        let mut dest = vec![0u8; 16 * 3];
        let n = demo.get_data(AccessType::NoGaps, 3, &mut dest, 960).unwrap();
        assert_eq!(n, 3);
        let frames = ConvertedDataFrame::parse_many(&dest, 16, n, 2).unwrap();
        assert_eq!(frames[2].frame_no, 2);
    }

    #[test]
    fn test_reconfigure_restarts_numbering() {
        let mut demo = DemoState::new();
        demo.apply_config(&config(1, 24, 40));
        let mut dest = vec![0u8; LOGICAL_FRAME_SIZE];
        demo.get_data(AccessType::NewestData, 1, &mut dest, 0).unwrap();
        demo.apply_config(&config(1, 24, 40));
        assert_eq!(demo.next_frame_no(), 0);
    }

    #[test]
    fn test_small_buffer_rejected() {
        let mut demo = DemoState::new();
        demo.apply_config(&config(1, 24, 40));
        demo.start(0);
        let mut dest = vec![0u8; LOGICAL_FRAME_SIZE];
        assert!(matches!(
            demo.get_data(AccessType::FromStartFrame, 5, &mut dest, 9600),
            Err(Upc2Error::BufferTooSmall { .. })
        ));
    }
}
