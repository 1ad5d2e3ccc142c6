//! Audio device discovery and selection.
//!
//! The station needs exactly one speaker and one microphone. Each is picked
//! either as the host default or by a user-supplied hint matched against
//! device descriptions, and its stream config is chosen to sit as close to
//! the call sample rate as the hardware allows.

use cpal::traits::{DeviceTrait, HostTrait};

use crate::AudioError;

/// Pick the station speaker: the first output device whose description
/// contains `hint`, or the host default when no hint is given.
pub fn pick_output_device(
    host: &cpal::Host,
    hint: Option<&str>,
) -> Result<cpal::Device, AudioError> {
    match hint {
        Some(hint) => {
            let devices = host
                .output_devices()
                .map_err(|e| AudioError::DeviceUnavailable(e.to_string()))?;
            find_by_hint(devices, hint).ok_or_else(|| {
                AudioError::DeviceUnavailable(format!("no output device matched: {hint}"))
            })
        }
        None => host
            .default_output_device()
            .ok_or_else(|| AudioError::DeviceUnavailable("no default output device".into())),
    }
}

/// Pick the station microphone: the first input device whose description
/// contains `hint`, or the host default when no hint is given.
pub fn pick_input_device(
    host: &cpal::Host,
    hint: Option<&str>,
) -> Result<cpal::Device, AudioError> {
    match hint {
        Some(hint) => {
            let devices = host
                .input_devices()
                .map_err(|e| AudioError::DeviceUnavailable(e.to_string()))?;
            find_by_hint(devices, hint).ok_or_else(|| {
                AudioError::DeviceUnavailable(format!("no input device matched: {hint}"))
            })
        }
        None => host
            .default_input_device()
            .ok_or_else(|| AudioError::DeviceUnavailable("no default input device".into())),
    }
}

fn find_by_hint(
    devices: impl Iterator<Item = cpal::Device>,
    hint: &str,
) -> Option<cpal::Device> {
    for device in devices {
        if let Ok(desc) = device.description() {
            if hint_matches(hint, &desc.name()) {
                return Some(device);
            }
        }
    }
    None
}

/// Case-insensitive substring match of a user-supplied device hint against
/// a device description. A blank hint matches nothing.
fn hint_matches(hint: &str, description: &str) -> bool {
    let hint = hint.trim().to_ascii_lowercase();
    !hint.is_empty() && description.to_ascii_lowercase().contains(&hint)
}

/// Choose the best output config for the target sample rate.
pub fn pick_output_config(
    device: &cpal::Device,
    target_rate: u32,
) -> Result<cpal::SupportedStreamConfig, AudioError> {
    let ranges: Vec<cpal::SupportedStreamConfigRange> = device
        .supported_output_configs()
        .map_err(|e| AudioError::DeviceUnavailable(e.to_string()))?
        .collect();
    best_config(ranges, target_rate)
}

/// Choose the best input config for the target sample rate.
pub fn pick_input_config(
    device: &cpal::Device,
    target_rate: u32,
) -> Result<cpal::SupportedStreamConfig, AudioError> {
    let ranges: Vec<cpal::SupportedStreamConfigRange> = device
        .supported_input_configs()
        .map_err(|e| AudioError::DeviceUnavailable(e.to_string()))?
        .collect();
    best_config(ranges, target_rate)
}

/// Prefer an exact rate match, then the nearest rate, then the cheapest
/// sample format to convert the call's f32 audio to.
fn best_config(
    ranges: Vec<cpal::SupportedStreamConfigRange>,
    target_rate: u32,
) -> Result<cpal::SupportedStreamConfig, AudioError> {
    let mut best: Option<(u32, usize, cpal::SupportedStreamConfig)> = None;
    for range in ranges {
        let rate = pick_rate_for_range(range.min_sample_rate(), range.max_sample_rate(), target_rate);
        let distance = rate.abs_diff(target_rate);
        let cost = conversion_cost(range.sample_format());
        let replace = match &best {
            None => true,
            Some((b_distance, b_cost, _)) => {
                distance < *b_distance || (distance == *b_distance && cost < *b_cost)
            }
        };
        if replace {
            best = Some((distance, cost, range.with_sample_rate(rate)));
        }
    }
    best.map(|(_, _, cfg)| cfg)
        .ok_or_else(|| AudioError::DeviceUnavailable("no supported stream configs".into()))
}

fn pick_rate_for_range(min: u32, max: u32, target: u32) -> u32 {
    if target >= min && target <= max {
        target
    } else if target < min {
        min
    } else {
        max
    }
}

/// Sample formats by how cheaply the call's f32 frames convert to them,
/// best first. Anything off the list sorts last.
const FORMAT_PREFERENCE: [cpal::SampleFormat; 4] = [
    cpal::SampleFormat::F32,
    cpal::SampleFormat::I32,
    cpal::SampleFormat::I16,
    cpal::SampleFormat::U16,
];

fn conversion_cost(format: cpal::SampleFormat) -> usize {
    FORMAT_PREFERENCE
        .iter()
        .position(|preferred| *preferred == format)
        .unwrap_or(FORMAT_PREFERENCE.len())
}

/// Print the default host's devices to stdout (CLI UX).
pub fn list_host_devices() -> Result<(), AudioError> {
    list_devices(&cpal::default_host())
}

/// Print available input and output devices to stdout (CLI UX).
pub fn list_devices(host: &cpal::Host) -> Result<(), AudioError> {
    let outputs = host
        .output_devices()
        .map_err(|e| AudioError::DeviceUnavailable(e.to_string()))?;
    println!("output devices:");
    for (i, d) in outputs.enumerate() {
        if let Ok(desc) = d.description() {
            println!("  #{i}: {desc}");
        }
    }
    let inputs = host
        .input_devices()
        .map_err(|e| AudioError::DeviceUnavailable(e.to_string()))?;
    println!("input devices:");
    for (i, d) in inputs.enumerate() {
        if let Ok(desc) = d.description() {
            println!("  #{i}: {desc}");
        }
    }
    Ok(())
}
