//! Segmentation model components

pub mod device;
pub mod inference;
pub mod loader;
pub mod processor;

pub use device::Device;
pub use inference::{OnnxSegmentationModel, SegmentationModel};
pub use loader::{LoadedModel, ModelLoader, ModelSlot};
pub use processor::{ProcessorConfig, SamProcessor};
