//! Default-input capture through cpal, feeding the show's capture handle.

use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    Device, SampleFormat, StreamConfig,
};
use lightshow_core::{CaptureHandle, LightshowError, Result};

/// Sample rate and channel count the default input device runs at.
#[derive(Debug, Clone, Copy)]
pub struct InputFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

/// Opened default input device, not yet streaming.
pub struct InputDevice {
    device: Device,
    config: cpal::SupportedStreamConfig,
}

impl InputDevice {
    pub fn open_default() -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| LightshowError::msg("no default input device"))?;
        let config = device
            .default_input_config()
            .map_err(|err| LightshowError::msg(format!("input device config: {err}")))?;

        tracing::info!(
            device = %device.name().unwrap_or_else(|_| "unknown".to_string()),
            sample_rate = config.sample_rate().0,
            channels = config.channels(),
            format = ?config.sample_format(),
            "opened default input device"
        );
        Ok(Self { device, config })
    }

    pub fn format(&self) -> InputFormat {
        InputFormat {
            sample_rate: self.config.sample_rate().0,
            channels: self.config.channels(),
        }
    }

    /// Starts streaming into `capture`. Dropping the stream stops capture.
    pub fn start(self, capture: CaptureHandle) -> Result<cpal::Stream> {
        let config: StreamConfig = self.config.clone().into();
        let stream = match self.config.sample_format() {
            SampleFormat::F32 => build_stream::<f32>(&self.device, &config, capture),
            SampleFormat::I16 => build_stream::<i16>(&self.device, &config, capture),
            SampleFormat::U16 => build_stream::<u16>(&self.device, &config, capture),
            other => {
                return Err(LightshowError::msg(format!(
                    "unsupported sample format {other:?}"
                )))
            }
        }
        .map_err(|err| LightshowError::msg(format!("build input stream: {err}")))?;

        stream
            .play()
            .map_err(|err| LightshowError::msg(format!("start input stream: {err}")))?;
        Ok(stream)
    }
}

fn build_stream<T>(
    device: &Device,
    config: &StreamConfig,
    capture: CaptureHandle,
) -> std::result::Result<cpal::Stream, cpal::BuildStreamError>
where
    T: cpal::Sample + cpal::SizedSample,
    f32: cpal::FromSample<T>,
{
    // Grows to the largest callback once, then reused.
    let mut converted: Vec<f32> = Vec::new();

    device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            converted.clear();
            converted.extend(data.iter().map(|sample| <f32 as cpal::Sample>::from_sample(*sample)));
            capture.push_samples(&converted);
        },
        |err| tracing::error!(%err, "audio stream error"),
        None,
    )
}
