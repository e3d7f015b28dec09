mod backend;
mod backends;
pub mod cascade;
pub mod mask;
mod result;

pub use backend::{DetectContext, DetectorBackend, SamplePoint};
pub use backends::color::DEFAULT_SAMPLE_RADIUS;
pub use backends::face::DEFAULT_MIN_SIZE_FRACTION;
pub use backends::qr::{finder_centers, marker_center};
pub use backends::{ColorThresholdBackend, FaceBackend, PresetBackend, QrBackend};
pub use cascade::CascadeModel;
pub use result::{
    DetectionMode, DetectionResult, DiagnosticImage, DiagnosticKind, DiagnosticPixels,
};
