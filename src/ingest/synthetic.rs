//! Synthetic frame source.
//!
//! Renders a solid square drifting around the frame centre on a dark
//! background, with a little random jitter so consecutive frames differ.

use anyhow::{anyhow, Result};
use image::{Rgb, RgbImage};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

use crate::frame::{Frame, FrameBuffer};
use crate::scheduler::PeriodicTask;

/// Configuration for a synthetic source.
#[derive(Clone, Debug)]
pub struct SyntheticConfig {
    pub width: u32,
    pub height: u32,
    /// Frames per second when spawned.
    pub fps: u32,
    /// Edge length of the target square.
    pub target_size: u32,
    pub target_rgb: [u8; 3],
    pub background_rgb: [u8; 3],
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 360,
            fps: 15,
            target_size: 60,
            target_rgb: [220, 20, 20],
            background_rgb: [20, 20, 30],
        }
    }
}

pub struct SyntheticSource {
    config: SyntheticConfig,
    frame_count: u64,
}

impl SyntheticSource {
    pub fn new(config: SyntheticConfig) -> Result<Self> {
        if config.width == 0 || config.height == 0 || config.fps == 0 {
            return Err(anyhow!("synthetic source needs non-zero size and fps"));
        }
        if config.target_size == 0
            || config.target_size >= config.width
            || config.target_size >= config.height
        {
            return Err(anyhow!(
                "target size {} does not fit a {}x{} frame",
                config.target_size,
                config.width,
                config.height
            ));
        }
        Ok(Self {
            config,
            frame_count: 0,
        })
    }

    pub fn frames_generated(&self) -> u64 {
        self.frame_count
    }

    /// Top-left corner of the target for frame `n`.
    fn target_origin(&self, n: u64) -> (u32, u32) {
        let cfg = &self.config;
        let free_x = f64::from(cfg.width - cfg.target_size);
        let free_y = f64::from(cfg.height - cfg.target_size);
        let t = n as f64 / f64::from(cfg.fps);
        let x = free_x * (0.5 + 0.35 * (t * 0.7).sin());
        let y = free_y * (0.5 + 0.35 * (t * 0.4).cos());
        let mut rng = rand::thread_rng();
        let jitter_x: f64 = rng.gen_range(-2.0..=2.0);
        let jitter_y: f64 = rng.gen_range(-2.0..=2.0);
        (
            (x + jitter_x).clamp(0.0, free_x) as u32,
            (y + jitter_y).clamp(0.0, free_y) as u32,
        )
    }

    pub fn next_frame(&mut self) -> Frame {
        let (x0, y0) = self.target_origin(self.frame_count);
        self.frame_count += 1;
        let cfg = &self.config;
        let image = RgbImage::from_fn(cfg.width, cfg.height, |x, y| {
            let inside = x >= x0 && x < x0 + cfg.target_size && y >= y0 && y < y0 + cfg.target_size;
            Rgb(if inside {
                cfg.target_rgb
            } else {
                cfg.background_rgb
            })
        });
        Frame::from_image(image)
    }

    /// Publish frames into `buffer` at the configured rate until the
    /// returned task is stopped.
    pub fn spawn(mut self, buffer: Arc<FrameBuffer>) -> Result<PeriodicTask> {
        let period = Duration::from_secs_f64(1.0 / f64::from(self.config.fps));
        log::info!(
            "synthetic source: {}x{} at {} fps",
            self.config.width,
            self.config.height,
            self.config.fps
        );
        PeriodicTask::spawn("synthetic-source", period, move || {
            if let Err(err) = buffer.publish(self.next_frame()) {
                log::error!("synthetic source: {:#}", err);
            }
        })
    }
}
