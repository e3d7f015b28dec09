pub mod color;
pub mod face;
pub mod preset;
pub mod qr;

pub use color::ColorThresholdBackend;
pub use face::FaceBackend;
pub use preset::PresetBackend;
pub use qr::QrBackend;
