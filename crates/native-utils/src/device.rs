use anyhow::Context;
use cpal::Device;
use cpal::traits::{DeviceTrait, HostTrait};

fn get_host() -> cpal::Host {
    cpal::default_host()
}

/// Finds the named input device, or the host default when no name is given.
pub fn get_or_default_input(device_name: Option<&str>) -> anyhow::Result<Device> {
    let host = get_host();
    tracing::debug!("Host: {:?}", host.id());
    match device_name {
        None => host.default_input_device().context("no default input device"),
        Some(target) => host
            .input_devices()?
            .find(|d| d.name().is_ok_and(|name| name == target))
            .with_context(|| format!("no input device named {target}")),
    }
}

/// Finds the named output device, or the host default when no name is given.
pub fn get_or_default_output(device_name: Option<&str>) -> anyhow::Result<Device> {
    let host = get_host();
    match device_name {
        None => host.default_output_device().context("no default output device"),
        Some(target) => host
            .output_devices()?
            .find(|d| d.name().is_ok_and(|name| name == target))
            .with_context(|| format!("no output device named {target}")),
    }
}

fn describe(devices: impl Iterator<Item = Device>, default: Option<String>, input: bool) -> String {
    let mut lines = Vec::new();
    for device in devices {
        let Ok(name) = device.name() else { continue };
        let config = if input {
            device.default_input_config()
        } else {
            device.default_output_config()
        };
        let mut line = match config {
            Ok(cfg) => format!(" * {}({}ch, {}hz)", name, cfg.channels(), cfg.sample_rate().0),
            Err(_) => format!(" * {} (no default config)", name),
        };
        if default.as_deref() == Some(name.as_str()) {
            line.push_str(" [default]");
        }
        lines.push(line);
    }
    lines.join("\n")
}

pub fn get_available_inputs() -> anyhow::Result<String> {
    let host = get_host();
    let default = host.default_input_device().and_then(|d| d.name().ok());
    Ok(describe(host.input_devices()?, default, true))
}

pub fn get_available_outputs() -> anyhow::Result<String> {
    let host = get_host();
    let default = host.default_output_device().and_then(|d| d.name().ok());
    Ok(describe(host.output_devices()?, default, false))
}
