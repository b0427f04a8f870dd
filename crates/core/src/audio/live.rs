//! Input capture from a sound card via CPAL.
//!
//! The device callback is the producer context: it regroups whatever buffers
//! the driver delivers into fixed-length blocks and pushes each one straight
//! into the pipeline's bounded queue.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, Device, SampleFormat, SampleRate, StreamConfig};

use super::BlockAssembler;
use crate::{AudioConfig, BlockProducer, LightsError, Result};

/// Running capture stream. Dropping it stops the device.
pub struct LiveCapture {
    _stream: cpal::Stream,
    device_name: String,
}

impl LiveCapture {
    /// Opens the named input device (or the host default) and starts pushing
    /// blocks into `producer`.
    pub fn start(device: Option<&str>, audio: &AudioConfig, producer: BlockProducer) -> Result<Self> {
        let host = cpal::default_host();
        let device = match device {
            Some(name) => find_device(&host, name)?,
            None => host
                .default_input_device()
                .ok_or_else(|| LightsError::Device("no default input device found".into()))?,
        };
        let device_name = device.name().unwrap_or_else(|_| "unknown".to_string());

        let supported = device.default_input_config().map_err(device_error)?;
        let config = StreamConfig {
            channels: supported.channels(),
            sample_rate: SampleRate(audio.sample_rate),
            buffer_size: BufferSize::Default,
        };
        let assembler = BlockAssembler::new(usize::from(config.channels), audio.block_len);

        let stream = match supported.sample_format() {
            SampleFormat::F32 => build_stream::<f32>(&device, &config, assembler, producer)?,
            SampleFormat::I16 => build_stream::<i16>(&device, &config, assembler, producer)?,
            SampleFormat::U16 => build_stream::<u16>(&device, &config, assembler, producer)?,
            other => {
                return Err(LightsError::Device(format!(
                    "unsupported sample format {other:?}"
                )))
            }
        };
        stream.play().map_err(device_error)?;

        tracing::info!(
            device = %device_name,
            sample_rate = audio.sample_rate,
            channels = config.channels,
            "live capture started"
        );

        Ok(Self {
            _stream: stream,
            device_name,
        })
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }
}

/// Names of every input device the default host exposes.
pub fn input_device_names() -> Result<Vec<String>> {
    let host = cpal::default_host();
    let devices = host.input_devices().map_err(device_error)?;
    Ok(devices.filter_map(|device| device.name().ok()).collect())
}

fn find_device(host: &cpal::Host, name: &str) -> Result<Device> {
    host.input_devices()
        .map_err(device_error)?
        .find(|device| device.name().map(|n| n == name).unwrap_or(false))
        .ok_or_else(|| LightsError::Device(format!("input device {name:?} not found")))
}

fn build_stream<T>(
    device: &Device,
    config: &StreamConfig,
    mut assembler: BlockAssembler,
    producer: BlockProducer,
) -> Result<cpal::Stream>
where
    T: cpal::SizedSample + Send + 'static,
    f32: cpal::FromSample<T>,
{
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                for &sample in data {
                    let value: f32 = cpal::Sample::from_sample(sample);
                    if let Some(block) = assembler.push_sample(value) {
                        producer.push(block);
                    }
                }
            },
            |err| tracing::error!(%err, "input stream error"),
            None,
        )
        .map_err(device_error)
}

fn device_error(err: impl std::fmt::Display) -> LightsError {
    LightsError::Device(err.to_string())
}
