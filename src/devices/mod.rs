//! Bus member discovery and bookkeeping

mod device;
mod registry;

pub use device::{describe_device_type, Channel, Device, FEEDBACK_ARTICLE, MAIN_ARTICLES};
pub use registry::DeviceRegistry;
