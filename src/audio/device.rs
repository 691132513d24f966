//! Audio device enumeration and lookup

use cpal::traits::{DeviceTrait, HostTrait};

use crate::error::MediaError;

/// Summary of one host audio device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: String,
    pub is_input: bool,
    pub is_output: bool,
    pub is_default: bool,
}

/// List every input and output device of the default host. A device that
/// is both input and output appears once.
pub fn list_devices() -> Vec<DeviceInfo> {
    let host = cpal::default_host();
    let mut devices: Vec<DeviceInfo> = Vec::new();

    let default_input = host.default_input_device().and_then(|d| d.name().ok());
    let default_output = host.default_output_device().and_then(|d| d.name().ok());

    if let Ok(inputs) = host.input_devices() {
        for name in inputs.filter_map(|d| d.name().ok()) {
            let is_default = default_input.as_ref() == Some(&name);
            devices.push(DeviceInfo {
                name,
                is_input: true,
                is_output: false,
                is_default,
            });
        }
    }

    if let Ok(outputs) = host.output_devices() {
        for name in outputs.filter_map(|d| d.name().ok()) {
            let is_default = default_output.as_ref() == Some(&name);
            match devices.iter_mut().find(|d| d.name == name) {
                Some(existing) => {
                    existing.is_output = true;
                    existing.is_default |= is_default;
                }
                None => devices.push(DeviceInfo {
                    name,
                    is_input: false,
                    is_output: true,
                    is_default,
                }),
            }
        }
    }

    devices
}

/// Input device by name, or the host default
pub fn input_device(name: Option<&str>) -> Result<cpal::Device, MediaError> {
    let host = cpal::default_host();
    match name {
        None => host
            .default_input_device()
            .ok_or_else(|| MediaError::DeviceNotFound("No default input device".to_string())),
        Some(name) => host
            .input_devices()
            .map_err(|e| MediaError::DeviceNotFound(e.to_string()))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| MediaError::DeviceNotFound(name.to_string())),
    }
}

/// Output device by name, or the host default
pub fn output_device(name: Option<&str>) -> Result<cpal::Device, MediaError> {
    let host = cpal::default_host();
    match name {
        None => host
            .default_output_device()
            .ok_or_else(|| MediaError::DeviceNotFound("No default output device".to_string())),
        Some(name) => host
            .output_devices()
            .map_err(|e| MediaError::DeviceNotFound(e.to_string()))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| MediaError::DeviceNotFound(name.to_string())),
    }
}

/// Stream settings for 16-bit PCM at the configured rate and channel count
pub fn stream_config(sample_rate: u32, channels: u16) -> cpal::StreamConfig {
    cpal::StreamConfig {
        channels,
        sample_rate: cpal::SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_device_is_not_found() {
        let result = input_device(Some("no such device, surely"));
        assert!(matches!(result, Err(MediaError::DeviceNotFound(_))));
    }

    #[test]
    fn test_listed_devices_are_unique() {
        // Machines without audio hardware simply list nothing
        let devices = list_devices();
        for (i, device) in devices.iter().enumerate() {
            assert!(device.is_input || device.is_output);
            assert!(devices[i + 1..].iter().all(|other| other.name != device.name));
        }
    }
}
