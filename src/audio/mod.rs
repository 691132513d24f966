//! cpal-backed device adapters (feature `devices`)

pub mod capture;
pub mod device;
pub mod playback;

pub use capture::CpalMicrophone;
pub use device::{list_devices, DeviceInfo};
pub use playback::{CpalLine, CpalSpeakers};
