//! Host mirror of the rolling history ring.
//!
//! The ring holds the most recent `time_size - 1` input frames in the flat
//! `(bin, slot)` layout the kernel reads (`past[bin + slot * bin_size]`).
//! [`HistoryRing::push`] advances the write position first and then stores the
//! frame, so immediately after a push `time = 0` addresses that frame.
//!
//! All memory is allocated in [`HistoryRing::new`] and [`HistoryRing::resize`];
//! pushing a frame never allocates.

use crate::index::{history_index, history_slots, ring_slot};

// ─────────────────────────── HistoryRing ───────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct HistoryRing {
    /// `bin_size * slots` values, bin axis fastest.
    data: Vec<f64>,
    bin_size: usize,
    slots: usize,
    /// Slot written by the most recent push.
    offset: usize,
}

impl HistoryRing {
    /// Zeroed ring for `time_size` taps (one of which is the current block).
    pub fn new(bin_size: usize, time_size: usize) -> Self {
        let slots = history_slots(time_size);
        Self {
            data: vec![0.0; bin_size * slots],
            bin_size,
            slots,
            offset: 0,
        }
    }

    pub fn bin_size(&self) -> usize {
        self.bin_size
    }

    /// Number of stored frames (`time_size - 1`).
    pub fn slots(&self) -> usize {
        self.slots
    }

    /// Current write position; this is the kernel's `time_offset` argument.
    /// Always 0 for a ring without slots.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Advance the write position and store `frame` in the new slot.
    ///
    /// Returns the slot written, or `None` when the ring has no slots.
    /// A short frame is zero-padded, a long one truncated to `bin_size`.
    pub fn push(&mut self, frame: &[f64]) -> Option<usize> {
        if self.slots == 0 {
            return None;
        }
        self.offset = (self.offset + 1) % self.slots;
        let n = frame.len().min(self.bin_size);
        let dst = self.slot_mut(self.offset);
        dst[..n].copy_from_slice(&frame[..n]);
        dst[n..].fill(0.0);
        Some(self.offset)
    }

    /// Frame `time` blocks before the most recent push (`time = 0` is the
    /// most recent). `None` when `time` is not retained.
    pub fn frame(&self, time: usize) -> Option<&[f64]> {
        if time >= self.slots {
            return None;
        }
        Some(self.slot(ring_slot(self.offset, time, self.slots)))
    }

    /// Raw contents of one slot.
    pub fn slot(&self, slot: usize) -> &[f64] {
        let start = history_index(0, slot, self.bin_size);
        &self.data[start..start + self.bin_size]
    }

    fn slot_mut(&mut self, slot: usize) -> &mut [f64] {
        let start = history_index(0, slot, self.bin_size);
        &mut self.data[start..start + self.bin_size]
    }

    /// Whole ring in device layout.
    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    /// Zero every frame and rewind the write position.
    pub fn reset(&mut self) {
        self.data.fill(0.0);
        self.offset = 0;
    }

    /// Change the bin count. Old frames are discarded: they do not describe
    /// the new bin layout.
    pub fn resize(&mut self, bin_size: usize) {
        self.bin_size = bin_size;
        self.data.clear();
        self.data.resize(bin_size * self.slots, 0.0);
        self.offset = 0;
    }
}

// ─────────────────────────── Tests ──────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_then_frame_zero_is_latest() {
        let mut ring = HistoryRing::new(2, 4);
        assert_eq!(ring.slots(), 3);
        assert_eq!(ring.push(&[1.0, 1.0]), Some(1));
        assert_eq!(ring.push(&[2.0, 2.0]), Some(2));
        assert_eq!(ring.push(&[3.0, 3.0]), Some(0));
        assert_eq!(ring.frame(0), Some(&[3.0, 3.0][..]));
        assert_eq!(ring.frame(1), Some(&[2.0, 2.0][..]));
        assert_eq!(ring.frame(2), Some(&[1.0, 1.0][..]));
        assert_eq!(ring.frame(3), None);

        // oldest entry is overwritten
        ring.push(&[4.0, 4.0]);
        assert_eq!(ring.frame(0), Some(&[4.0, 4.0][..]));
        assert_eq!(ring.frame(2), Some(&[2.0, 2.0][..]));
    }

    #[test]
    fn test_device_layout() {
        let mut ring = HistoryRing::new(3, 3);
        ring.push(&[1.0, 2.0, 3.0]);
        ring.push(&[4.0, 5.0, 6.0]);
        // slot 1 then slot 0
        assert_eq!(ring.as_slice(), &[4.0, 5.0, 6.0, 1.0, 2.0, 3.0]);
        assert_eq!(ring.offset(), 0);
    }

    #[test]
    fn test_single_tap_has_no_history() {
        let mut ring = HistoryRing::new(8, 1);
        assert!(ring.is_empty());
        assert_eq!(ring.push(&[1.0; 8]), None);
        assert_eq!(ring.offset(), 0);
        assert_eq!(ring.frame(0), None);
    }

    #[test]
    fn test_short_frame_is_padded() {
        let mut ring = HistoryRing::new(4, 2);
        ring.push(&[9.0; 4]);
        ring.push(&[1.0, 2.0]);
        assert_eq!(ring.frame(0), Some(&[1.0, 2.0, 0.0, 0.0][..]));
    }

    #[test]
    fn test_reset_and_resize() {
        let mut ring = HistoryRing::new(2, 3);
        ring.push(&[1.0, 2.0]);
        ring.reset();
        assert_eq!(ring.offset(), 0);
        assert!(ring.as_slice().iter().all(|&v| v == 0.0));

        ring.push(&[1.0, 2.0]);
        ring.resize(5);
        assert_eq!(ring.bin_size(), 5);
        assert_eq!(ring.as_slice().len(), 10);
        assert!(ring.as_slice().iter().all(|&v| v == 0.0));
    }
}
