//! Detection pipeline: operator inputs, mode dispatch and result fan-out.
//!
//! The pipeline is owned by the video task. Operator inputs live in
//! [`OperatorControls`], which the presentation layer mutates from any thread;
//! the pipeline captures them once per tick so a mode switch never applies
//! half of the old mode's parameters. The newest result goes into a
//! [`ResultSlot`] that the control task reads.

use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::color::{ColorRange, ColorSpace, TrackedObjectPreset};
use crate::config::TrackerConfig;
use crate::detect::{
    ColorThresholdBackend, DetectContext, DetectionMode, DetectionResult, DetectorBackend,
    FaceBackend, PresetBackend, QrBackend, SamplePoint,
};
use crate::frame::{Frame, FrameBuffer};
use crate::mailbox::Mailbox;

/// Called with every published result, diagnostics included.
pub type ResultListener = Box<dyn Fn(&DetectionResult) + Send + Sync>;
/// Called whenever click-to-sample replaces the colour range.
pub type RangeListener = Box<dyn Fn(&ColorRange) + Send + Sync>;

// ----------------------------------------------------------------------------
// Operator controls
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug)]
struct OperatorState {
    mode: DetectionMode,
    range: ColorRange,
    preset: TrackedObjectPreset,
    pending_sample: Option<SamplePoint>,
}

/// Operator-mutated detection inputs.
///
/// Writes are eventually visible: they land on whichever video tick captures
/// them next.
pub struct OperatorControls {
    state: Mutex<OperatorState>,
}

impl OperatorControls {
    pub fn new(mode: DetectionMode, range: ColorRange, preset: TrackedObjectPreset) -> Self {
        Self {
            state: Mutex::new(OperatorState {
                mode,
                range,
                preset,
                pending_sample: None,
            }),
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut OperatorState) -> T) -> Result<T> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| anyhow!("operator controls lock poisoned"))?;
        Ok(f(&mut state))
    }

    pub fn set_mode(&self, mode: DetectionMode) -> Result<()> {
        self.with_state(|s| s.mode = mode)
    }

    pub fn mode(&self) -> Result<DetectionMode> {
        self.with_state(|s| s.mode)
    }

    pub fn set_color_range(&self, range: ColorRange) -> Result<()> {
        self.with_state(|s| s.range = range)
    }

    pub fn color_range(&self) -> Result<ColorRange> {
        self.with_state(|s| s.range)
    }

    /// Replace the preset wholesale.
    pub fn set_preset(&self, preset: TrackedObjectPreset) -> Result<()> {
        self.with_state(|s| s.preset = preset)
    }

    pub fn preset(&self) -> Result<TrackedObjectPreset> {
        self.with_state(|s| s.preset)
    }

    /// Queue a click-to-sample at frame pixel `(x, y)`. A newer click
    /// replaces one that has not been consumed yet.
    pub fn request_sample(&self, x: u32, y: u32) -> Result<()> {
        self.with_state(|s| s.pending_sample = Some(SamplePoint { x, y }))
    }

    pub fn pending_sample(&self) -> Result<Option<SamplePoint>> {
        self.with_state(|s| s.pending_sample)
    }

    /// Snapshot the inputs for one tick. A pending sample is handed out (and
    /// cleared) only when the active mode can use it.
    fn capture(&self) -> Result<(DetectionMode, DetectContext)> {
        self.with_state(|s| {
            let sample = if s.mode.is_interactive() {
                s.pending_sample.take()
            } else {
                None
            };
            (
                s.mode,
                DetectContext {
                    range: s.range,
                    preset: s.preset,
                    sample,
                },
            )
        })
    }
}

impl Default for OperatorControls {
    fn default() -> Self {
        Self::new(
            DetectionMode::default(),
            ColorRange::default(),
            TrackedObjectPreset::default(),
        )
    }
}

// ----------------------------------------------------------------------------
// Result slot
// ----------------------------------------------------------------------------

/// Latest detection result. Written by the video task, read by the control
/// task; a reader may see a result up to one video tick old.
#[derive(Default)]
pub struct ResultSlot {
    slot: Mailbox<DetectionResult>,
}

impl ResultSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, result: Arc<DetectionResult>) -> Result<()> {
        self.slot.publish(result)
    }

    pub fn latest(&self) -> Result<Option<Arc<DetectionResult>>> {
        self.slot.latest()
    }
}

// ----------------------------------------------------------------------------
// Pipeline
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct PipelineStats {
    processed: AtomicU64,
    dropped: AtomicU64,
    detected: AtomicU64,
}

impl PipelineStats {
    /// Frames that produced a result.
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// Frames dropped because they could not be processed.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Results with `detected == true`.
    pub fn detected(&self) -> u64 {
        self.detected.load(Ordering::Relaxed)
    }
}

pub struct DetectionPipeline {
    controls: Arc<OperatorControls>,
    results: Arc<ResultSlot>,
    stats: Arc<PipelineStats>,

    color_rgb: ColorThresholdBackend,
    color_hsv: ColorThresholdBackend,
    preset: PresetBackend,
    face: Option<FaceBackend>,
    qr: QrBackend,

    active_mode: Option<DetectionMode>,
    result_listeners: Vec<ResultListener>,
    range_listeners: Vec<RangeListener>,
}

impl DetectionPipeline {
    pub fn new(controls: Arc<OperatorControls>, results: Arc<ResultSlot>) -> Self {
        Self {
            controls,
            results,
            stats: Arc::new(PipelineStats::default()),
            color_rgb: ColorThresholdBackend::rgb(),
            color_hsv: ColorThresholdBackend::hsv(),
            preset: PresetBackend::new(),
            face: None,
            qr: QrBackend::new(),
            active_mode: None,
            result_listeners: Vec::new(),
            range_listeners: Vec::new(),
        }
    }

    /// Build from configuration. A configured cascade that cannot be loaded
    /// is an error.
    pub fn from_config(config: &TrackerConfig) -> Result<Self> {
        let detection = &config.detection;
        let controls = Arc::new(OperatorControls::new(
            detection.mode,
            detection.color_range,
            detection.preset,
        ));
        let mut pipeline = Self::new(controls, Arc::new(ResultSlot::new()))
            .with_sample_radius(detection.sample_radius);
        if let Some(path) = &detection.face_cascade {
            let face = FaceBackend::load(path, detection.face_min_size_fraction)?;
            log::info!("face cascade loaded from {}", path.display());
            pipeline = pipeline.with_face_backend(face);
        }
        Ok(pipeline)
    }

    /// Enable face detection. Without a face backend that mode drops every
    /// frame.
    pub fn with_face_backend(mut self, face: FaceBackend) -> Self {
        self.face = Some(face);
        self
    }

    pub fn with_sample_radius(mut self, radius: u32) -> Self {
        self.color_rgb = ColorThresholdBackend::new(ColorSpace::Rgb, radius);
        self.color_hsv = ColorThresholdBackend::new(ColorSpace::Hsv, radius);
        self
    }

    pub fn controls(&self) -> Arc<OperatorControls> {
        Arc::clone(&self.controls)
    }

    pub fn results(&self) -> Arc<ResultSlot> {
        Arc::clone(&self.results)
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        Arc::clone(&self.stats)
    }

    pub fn has_face_backend(&self) -> bool {
        self.face.is_some()
    }

    /// Listeners run on the video task, in registration order.
    pub fn add_result_listener(&mut self, listener: ResultListener) {
        self.result_listeners.push(listener);
    }

    pub fn add_range_listener(&mut self, listener: RangeListener) {
        self.range_listeners.push(listener);
    }

    /// One video tick: snapshot the buffer and process it.
    pub fn tick(&mut self, buffer: &FrameBuffer) -> Option<Arc<DetectionResult>> {
        match buffer.take_snapshot() {
            Ok(snapshot) => self.process_frame(snapshot.as_deref()),
            Err(err) => {
                log::error!("video tick: {:#}", err);
                None
            }
        }
    }

    /// Run the active detector over `frame` and publish the result.
    ///
    /// `None` (no frame yet) does nothing. A frame that cannot be processed
    /// is logged and dropped; the previously published result stays in place.
    pub fn process_frame(&mut self, frame: Option<&Frame>) -> Option<Arc<DetectionResult>> {
        let frame = frame?;
        let published = self.run(frame).and_then(|result| {
            let result = Arc::new(result);
            self.results.publish(Arc::clone(&result))?;
            Ok(result)
        });
        match published {
            Ok(result) => {
                self.stats.processed.fetch_add(1, Ordering::Relaxed);
                if result.detected {
                    self.stats.detected.fetch_add(1, Ordering::Relaxed);
                    log::debug!(
                        "frame #{}: target at ({:.0}, {:.0})",
                        result.frame_sequence,
                        result.x,
                        result.y
                    );
                }
                for listener in &self.result_listeners {
                    listener(&result);
                }
                Some(result)
            }
            Err(err) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("dropping frame #{}: {:#}", frame.sequence(), err);
                None
            }
        }
    }

    fn run(&mut self, frame: &Frame) -> Result<DetectionResult> {
        let image = frame.to_rgb_image()?;
        let (mode, ctx) = self.controls.capture()?;
        if self.active_mode != Some(mode) {
            match self.active_mode {
                Some(previous) => log::info!("detection mode {} -> {}", previous, mode),
                None => log::info!("detection mode {}", mode),
            }
            self.active_mode = Some(mode);
        }

        let backend = self.backend_for(mode)?;
        let mut result = backend.detect(&image, &ctx)?;
        result.mode = mode;
        result.frame_sequence = frame.sequence();

        if let Some(range) = result.sampled_range {
            self.controls.set_color_range(range)?;
            for listener in &self.range_listeners {
                listener(&range);
            }
        }
        Ok(result)
    }

    fn backend_for(&mut self, mode: DetectionMode) -> Result<&mut dyn DetectorBackend> {
        let backend: &mut dyn DetectorBackend = match mode {
            DetectionMode::ColorRgb => &mut self.color_rgb,
            DetectionMode::ColorHsv => &mut self.color_hsv,
            DetectionMode::PreconfiguredHsv => &mut self.preset,
            DetectionMode::FaceDetection => match self.face.as_mut() {
                Some(face) => face,
                None => return Err(anyhow!("face detection selected but no cascade is loaded")),
            },
            DetectionMode::QrDetection => &mut self.qr,
        };
        Ok(backend)
    }
}

impl Default for DetectionPipeline {
    fn default() -> Self {
        Self::new(
            Arc::new(OperatorControls::default()),
            Arc::new(ResultSlot::new()),
        )
    }
}
