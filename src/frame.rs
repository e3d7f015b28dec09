//! Frame ingestion boundary.
//!
//! - `Frame`: raw RGB pixels exactly as delivered by the vehicle's video link.
//! - `FrameBuffer`: single-slot holder between the video link and the video tick.
//!
//! The buffer keeps at most one pending frame. A frame that arrives before the
//! previous one was consumed replaces it, so memory and latency stay bounded
//! when the link outpaces detection. Dropped frames are acceptable here; this
//! is a controller, not a recorder.

use anyhow::{anyhow, Result};
use image::RgbImage;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::mailbox::Mailbox;

/// Bytes per pixel of an incoming frame (packed RGB).
pub const CHANNELS: usize = 3;

// ----------------------------------------------------------------------------
// Frame: raw media container
// ----------------------------------------------------------------------------

/// Immutable packed-RGB frame.
///
/// The byte length is NOT validated on construction: a malformed frame from
/// the link is only detected when the pipeline converts it, where it is
/// dropped without disturbing the previous detection.
pub struct Frame {
    data: Vec<u8>,

    pub width: u32,
    pub height: u32,

    /// Arrival order, assigned by `FrameBuffer::publish` (1-based).
    sequence: u64,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            data,
            width,
            height,
            sequence: 0,
        }
    }

    pub fn from_image(image: RgbImage) -> Self {
        let (width, height) = image.dimensions();
        Self::new(image.into_raw(), width, height)
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    /// Private copy of the pixels as an image the detectors can work on.
    pub fn to_rgb_image(&self) -> Result<RgbImage> {
        if self.width == 0 || self.height == 0 {
            return Err(anyhow!(
                "frame has empty dimensions {}x{}",
                self.width,
                self.height
            ));
        }
        let expected_len = (self.width as usize)
            .checked_mul(self.height as usize)
            .and_then(|v| v.checked_mul(CHANNELS))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        if self.data.len() != expected_len {
            return Err(anyhow!(
                "expected {} RGB bytes for {}x{}, received {}",
                expected_len,
                self.width,
                self.height,
                self.data.len()
            ));
        }
        RgbImage::from_raw(self.width, self.height, self.data.clone())
            .ok_or_else(|| anyhow!("frame buffer does not match {}x{}", self.width, self.height))
    }
}

// ----------------------------------------------------------------------------
// FrameBuffer: latest-frame slot
// ----------------------------------------------------------------------------

/// Newest-wins frame slot shared by the video link (producer) and the video
/// tick (consumer).
///
/// `publish` never waits for the consumer and `take_snapshot` never waits for
/// the producer. A snapshot is an `Arc` to an immutable frame, so the tick can
/// never observe a frame while it is being overwritten.
pub struct FrameBuffer {
    slot: Mailbox<Frame>,
    published: AtomicU64,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self {
            slot: Mailbox::new(),
            published: AtomicU64::new(0),
        }
    }

    /// Store a frame, replacing whatever was pending.
    pub fn publish(&self, mut frame: Frame) -> Result<()> {
        frame.sequence = self.published.fetch_add(1, Ordering::Relaxed) + 1;
        self.slot.publish(Arc::new(frame))
    }

    /// Most recently published frame, or `None` if none has arrived yet.
    ///
    /// Non-consuming: a slow link means the same frame is seen again on the
    /// next tick.
    pub fn take_snapshot(&self) -> Result<Option<Arc<Frame>>> {
        self.slot.latest()
    }

    /// Total number of frames ever published (including overwritten ones).
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> Result<bool> {
        self.slot.is_empty()
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn make_test_frame(fill: u8) -> Frame {
        Frame::new(vec![fill; 4 * 2 * CHANNELS], 4, 2)
    }

    #[test]
    fn snapshot_is_empty_before_first_frame() {
        let buf = FrameBuffer::new();
        assert!(buf.is_empty().unwrap());
        assert!(buf.take_snapshot().unwrap().is_none());
        assert_eq!(buf.published(), 0);
    }

    #[test]
    fn newest_frame_wins() {
        let buf = FrameBuffer::new();
        buf.publish(make_test_frame(1)).unwrap();
        buf.publish(make_test_frame(2)).unwrap();
        buf.publish(make_test_frame(3)).unwrap();

        let snapshot = buf.take_snapshot().unwrap().expect("frame");
        assert_eq!(snapshot.sequence(), 3);
        assert_eq!(snapshot.to_rgb_image().unwrap().get_pixel(0, 0)[0], 3);
        assert_eq!(buf.published(), 3);
    }

    #[test]
    fn snapshot_is_not_consumed() {
        let buf = FrameBuffer::new();
        buf.publish(make_test_frame(9)).unwrap();
        let a = buf.take_snapshot().unwrap().unwrap();
        let b = buf.take_snapshot().unwrap().unwrap();
        assert_eq!(a.sequence(), b.sequence());
    }

    #[test]
    fn malformed_frame_fails_conversion() {
        let short = Frame::new(vec![0u8; 10], 4, 2);
        assert!(short.to_rgb_image().is_err());

        let empty = Frame::new(Vec::new(), 0, 0);
        assert!(empty.to_rgb_image().is_err());
    }

    #[test]
    fn from_image_round_trips_dimensions() {
        let frame = Frame::from_image(RgbImage::new(8, 6));
        assert_eq!((frame.width, frame.height), (8, 6));
        assert_eq!(frame.byte_len(), 8 * 6 * CHANNELS);
    }
}
