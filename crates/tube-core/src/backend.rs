use std::sync::{Arc, Mutex};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, Device, FromSample, Sample, SampleFormat, SizedSample, StreamConfig};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::constants::{BLOCK_SIZE, SAMPLE_RATE};
use crate::mic::MicCapture;
use crate::render::AudioRender;
use crate::state::lock;
use crate::TubeError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    /// Frames per callback.
    pub block_size: usize,
    /// Output device name; `None` picks the host default.
    pub output_device: Option<String>,
    pub input_device: Option<String>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
            block_size: BLOCK_SIZE,
            output_device: None,
            input_device: None,
        }
    }
}

/// Receives mono input blocks on the capture thread.
pub trait AudioCapture: Send {
    fn capture(&mut self, samples: &[f32]);
}

impl AudioCapture for MicCapture {
    fn capture(&mut self, samples: &[f32]) {
        self.push(samples);
    }
}

/// An opened stream. Dropping the handle closes it.
pub trait StreamHandle {
    fn start(&mut self) -> Result<(), TubeError>;
    fn stop(&mut self) -> Result<(), TubeError>;
    fn is_active(&self) -> bool;
}

pub trait AudioBackend {
    fn open_output(
        &mut self,
        config: &AudioConfig,
        render: Box<dyn AudioRender>,
    ) -> Result<Box<dyn StreamHandle>, TubeError>;

    fn open_input(
        &mut self,
        config: &AudioConfig,
        capture: Box<dyn AudioCapture>,
    ) -> Result<Box<dyn StreamHandle>, TubeError>;
}

// ---------------------------------------------------------------------------
// cpal
// ---------------------------------------------------------------------------

pub struct CpalBackend {
    host: cpal::Host,
}

impl Default for CpalBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CpalBackend {
    pub fn new() -> Self {
        Self {
            host: cpal::default_host(),
        }
    }

    fn output_device(&self, name: Option<&str>) -> Result<Device, TubeError> {
        match name {
            Some(name) => self
                .host
                .output_devices()?
                .find(|d| d.name().ok().as_deref() == Some(name))
                .ok_or_else(|| TubeError::Device(format!("output device not found: {name}"))),
            None => self
                .host
                .default_output_device()
                .ok_or_else(|| TubeError::Device("no default output device".into())),
        }
    }

    fn input_device(&self, name: Option<&str>) -> Result<Device, TubeError> {
        match name {
            Some(name) => self
                .host
                .input_devices()?
                .find(|d| d.name().ok().as_deref() == Some(name))
                .ok_or_else(|| TubeError::Device(format!("input device not found: {name}"))),
            None => self
                .host
                .default_input_device()
                .ok_or_else(|| TubeError::Device("no default input device".into())),
        }
    }
}

fn stream_config(default: cpal::SupportedStreamConfig, config: &AudioConfig) -> StreamConfig {
    let mut stream: StreamConfig = default.into();
    stream.sample_rate = cpal::SampleRate(config.sample_rate);
    stream.buffer_size = BufferSize::Fixed(config.block_size as u32);
    stream
}

impl AudioBackend for CpalBackend {
    fn open_output(
        &mut self,
        config: &AudioConfig,
        render: Box<dyn AudioRender>,
    ) -> Result<Box<dyn StreamHandle>, TubeError> {
        let device = self.output_device(config.output_device.as_deref())?;
        let default = device.default_output_config()?;
        let format = default.sample_format();
        let stream_config = stream_config(default, config);
        info!(
            device = %device.name()?,
            sample_rate = stream_config.sample_rate.0,
            channels = stream_config.channels,
            format = %format,
            "opening output stream"
        );

        let stream = match format {
            SampleFormat::F32 => build_output::<f32>(&device, &stream_config, config.block_size, render)?,
            SampleFormat::I16 => build_output::<i16>(&device, &stream_config, config.block_size, render)?,
            SampleFormat::U16 => build_output::<u16>(&device, &stream_config, config.block_size, render)?,
            other => return Err(TubeError::UnsupportedSampleFormat(other.to_string())),
        };
        Ok(Box::new(CpalStream {
            stream,
            active: false,
        }))
    }

    fn open_input(
        &mut self,
        config: &AudioConfig,
        capture: Box<dyn AudioCapture>,
    ) -> Result<Box<dyn StreamHandle>, TubeError> {
        let device = self.input_device(config.input_device.as_deref())?;
        let default = device.default_input_config()?;
        let format = default.sample_format();
        let stream_config = stream_config(default, config);
        info!(
            device = %device.name()?,
            sample_rate = stream_config.sample_rate.0,
            channels = stream_config.channels,
            format = %format,
            "opening input stream"
        );

        let stream = match format {
            SampleFormat::F32 => build_input::<f32>(&device, &stream_config, config.block_size, capture)?,
            SampleFormat::I16 => build_input::<i16>(&device, &stream_config, config.block_size, capture)?,
            SampleFormat::U16 => build_input::<u16>(&device, &stream_config, config.block_size, capture)?,
            other => return Err(TubeError::UnsupportedSampleFormat(other.to_string())),
        };
        Ok(Box::new(CpalStream {
            stream,
            active: false,
        }))
    }
}

/// Render mono and copy it to every device channel. The mono scratch is
/// sized once; larger device buffers are rendered in several passes.
fn build_output<T>(
    device: &Device,
    config: &StreamConfig,
    block_size: usize,
    mut render: Box<dyn AudioRender>,
) -> Result<cpal::Stream, TubeError>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = config.channels.max(1) as usize;
    let mut mono = vec![0.0f32; block_size.max(1)];
    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            for chunk in data.chunks_mut(mono.len() * channels) {
                let mono = &mut mono[..chunk.len() / channels];
                if render.render(mono).is_err() {
                    mono.fill(0.0);
                }
                for (frame, &value) in chunk.chunks_mut(channels).zip(mono.iter()) {
                    let sample = T::from_sample(value);
                    frame.iter_mut().for_each(|s| *s = sample);
                }
            }
        },
        |err| error!(error = %err, "output stream error"),
        None,
    )?;
    Ok(stream)
}

/// Mix every device channel down to mono before handing it on.
fn build_input<T>(
    device: &Device,
    config: &StreamConfig,
    block_size: usize,
    mut capture: Box<dyn AudioCapture>,
) -> Result<cpal::Stream, TubeError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = config.channels.max(1) as usize;
    let mut mono = vec![0.0f32; block_size.max(1)];
    let stream = device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            for chunk in data.chunks(mono.len() * channels) {
                let mono = &mut mono[..chunk.len() / channels];
                for (out, frame) in mono.iter_mut().zip(chunk.chunks(channels)) {
                    *out = frame.iter().map(|s| f32::from_sample(*s)).sum::<f32>() / channels as f32;
                }
                capture.capture(mono);
            }
        },
        |err| error!(error = %err, "input stream error"),
        None,
    )?;
    Ok(stream)
}

struct CpalStream {
    stream: cpal::Stream,
    active: bool,
}

impl StreamHandle for CpalStream {
    fn start(&mut self) -> Result<(), TubeError> {
        self.stream.play()?;
        self.active = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), TubeError> {
        self.stream.pause()?;
        self.active = false;
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.active
    }
}

// ---------------------------------------------------------------------------
// Offline
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Output,
    Input,
}

/// Lifecycle record kept by [`OfflineBackend`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEvent {
    Opened(StreamKind, usize),
    Started(usize),
    Stopped(usize),
    Closed(usize),
}

struct OfflineSlot {
    id: usize,
    active: bool,
    render: Option<Box<dyn AudioRender>>,
    capture: Option<Box<dyn AudioCapture>>,
}

#[derive(Default)]
struct OfflineShared {
    next_id: usize,
    slots: Vec<OfflineSlot>,
    events: Vec<StreamEvent>,
    peak_active_outputs: usize,
}

impl OfflineShared {
    fn active_outputs(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.active && s.render.is_some())
            .count()
    }
}

/// Device-free backend: output is pulled on demand, input is pushed.
///
/// Clones share the same streams, so a caller can keep one to drive the
/// streams a router opened.
#[derive(Clone)]
pub struct OfflineBackend {
    block_size: usize,
    shared: Arc<Mutex<OfflineShared>>,
}

impl OfflineBackend {
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size: block_size.max(1),
            shared: Arc::new(Mutex::new(OfflineShared::default())),
        }
    }

    fn open(
        &self,
        render: Option<Box<dyn AudioRender>>,
        capture: Option<Box<dyn AudioCapture>>,
    ) -> Box<dyn StreamHandle> {
        let kind = if render.is_some() {
            StreamKind::Output
        } else {
            StreamKind::Input
        };
        let mut shared = lock(&self.shared);
        let id = shared.next_id;
        shared.next_id += 1;
        shared.slots.push(OfflineSlot {
            id,
            active: false,
            render,
            capture,
        });
        shared.events.push(StreamEvent::Opened(kind, id));
        debug!(id, ?kind, "offline stream opened");
        Box::new(OfflineStream {
            id,
            active: false,
            shared: Arc::clone(&self.shared),
        })
    }

    /// Render `frames` samples from the active output stream, in blocks.
    /// Silence when no output is running.
    pub fn pull(&self, frames: usize) -> Vec<f32> {
        let mut out = vec![0.0f32; frames];
        let mut shared = lock(&self.shared);
        let Some(render) = shared
            .slots
            .iter_mut()
            .filter(|s| s.active)
            .find_map(|s| s.render.as_mut())
        else {
            return out;
        };
        for block in out.chunks_mut(self.block_size) {
            if render.render(block).is_err() {
                block.fill(0.0);
            }
        }
        out
    }

    /// Deliver samples to every active input stream.
    pub fn push_input(&self, samples: &[f32]) {
        let mut shared = lock(&self.shared);
        for slot in shared.slots.iter_mut().filter(|s| s.active) {
            if let Some(capture) = slot.capture.as_mut() {
                capture.capture(samples);
            }
        }
    }

    pub fn events(&self) -> Vec<StreamEvent> {
        lock(&self.shared).events.clone()
    }

    pub fn open_streams(&self) -> usize {
        lock(&self.shared).slots.len()
    }

    /// Most output streams ever running at once.
    pub fn peak_active_outputs(&self) -> usize {
        lock(&self.shared).peak_active_outputs
    }
}

impl AudioBackend for OfflineBackend {
    fn open_output(
        &mut self,
        _config: &AudioConfig,
        render: Box<dyn AudioRender>,
    ) -> Result<Box<dyn StreamHandle>, TubeError> {
        Ok(self.open(Some(render), None))
    }

    fn open_input(
        &mut self,
        _config: &AudioConfig,
        capture: Box<dyn AudioCapture>,
    ) -> Result<Box<dyn StreamHandle>, TubeError> {
        Ok(self.open(None, Some(capture)))
    }
}

struct OfflineStream {
    id: usize,
    active: bool,
    shared: Arc<Mutex<OfflineShared>>,
}

impl OfflineStream {
    fn set_active(&mut self, active: bool) {
        let mut shared = lock(&self.shared);
        if let Some(slot) = shared.slots.iter_mut().find(|s| s.id == self.id) {
            slot.active = active;
        }
        let event = if active {
            StreamEvent::Started(self.id)
        } else {
            StreamEvent::Stopped(self.id)
        };
        shared.events.push(event);
        let running = shared.active_outputs();
        shared.peak_active_outputs = shared.peak_active_outputs.max(running);
        self.active = active;
    }
}

impl StreamHandle for OfflineStream {
    fn start(&mut self) -> Result<(), TubeError> {
        self.set_active(true);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), TubeError> {
        self.set_active(false);
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.active
    }
}

impl Drop for OfflineStream {
    fn drop(&mut self) {
        let mut shared = lock(&self.shared);
        shared.slots.retain(|s| s.id != self.id);
        shared.events.push(StreamEvent::Closed(self.id));
    }
}
