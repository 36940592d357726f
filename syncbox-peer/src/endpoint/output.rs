//! Audio output using cpal
//!
//! cpal streams are not `Send`, so each device owns a dedicated thread
//! that opens the output, keeps the stream alive and drops it on
//! shutdown. The audio callback reads the current voice from shared
//! state; it never blocks on it.

use crate::endpoint::device::{AtomicVolume, PlaybackDevice};
use crate::error::{Error, Result};
use crate::lock_unpoisoned;
use crate::pipeline::DecodedAudio;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

/// One buffer being played
struct Voice {
    audio: Arc<DecodedAudio>,
    /// Position in source frames
    position: f64,
    /// Source frames advanced per output frame
    step: f64,
}

struct Shared {
    voice: Mutex<Option<Voice>>,
    volume: AtomicVolume,
    output_rate: u32,
}

/// Real audio output on a cpal device
pub struct CpalDevice {
    shared: Arc<Shared>,
    shutdown: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl CpalDevice {
    /// Open `device_name` (None = default device) and start a silent stream
    pub fn open(device_name: Option<String>) -> Result<Self> {
        let (ready_tx, ready_rx) = mpsc::channel::<Result<Arc<Shared>>>();
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let thread = std::thread::Builder::new()
            .name("syncbox-audio".to_string())
            .spawn(move || {
                let opened = open_stream(device_name.as_deref());
                let stream = match opened {
                    Ok((stream, shared)) => {
                        let _ = ready_tx.send(Ok(shared));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                // Hold the stream until the device is dropped
                let _ = shutdown_rx.recv();
                drop(stream);
                debug!("Audio stream closed");
            })
            .map_err(|e| Error::AudioOutput(format!("Failed to spawn audio thread: {}", e)))?;

        let shared = ready_rx
            .recv()
            .map_err(|_| Error::AudioOutput("Audio thread exited during setup".to_string()))??;

        Ok(Self {
            shared,
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        })
    }
}

impl Drop for CpalDevice {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Audio thread panicked");
            }
        }
    }
}

impl PlaybackDevice for CpalDevice {
    fn start(&self, audio: Arc<DecodedAudio>) -> Result<()> {
        if audio.sample_rate() == 0 {
            return Err(Error::AudioOutput("Buffer has no sample rate".to_string()));
        }
        let step = audio.sample_rate() as f64 / self.shared.output_rate as f64;
        *lock_unpoisoned(&self.shared.voice) = Some(Voice {
            audio,
            position: 0.0,
            step,
        });
        Ok(())
    }

    fn stop(&self) {
        *lock_unpoisoned(&self.shared.voice) = None;
    }

    fn is_playing(&self) -> bool {
        lock_unpoisoned(&self.shared.voice).is_some()
    }

    fn set_volume(&self, volume: f32) {
        self.shared.volume.set(volume);
    }

    fn volume(&self) -> f32 {
        self.shared.volume.get()
    }
}

fn find_device(name: Option<&str>) -> Result<Device> {
    let host = cpal::default_host();

    if let Some(name) = name {
        let mut devices = host
            .output_devices()
            .map_err(|e| Error::AudioOutput(format!("Failed to enumerate devices: {}", e)))?;

        if let Some(device) = devices.find(|d| d.name().ok().as_deref() == Some(name)) {
            info!("Found requested audio device: {}", name);
            return Ok(device);
        }
        warn!("Requested device '{}' not found, falling back to default device", name);
    }

    let device = host
        .default_output_device()
        .ok_or_else(|| Error::AudioOutput("No default output device found".to_string()))?;
    info!(
        "Using audio device: {}",
        device.name().unwrap_or_else(|_| "Unknown".to_string())
    );
    Ok(device)
}

fn open_stream(name: Option<&str>) -> Result<(Stream, Arc<Shared>)> {
    let device = find_device(name)?;

    let supported = device
        .default_output_config()
        .map_err(|e| Error::AudioOutput(format!("Failed to get default config: {}", e)))?;
    let sample_format = supported.sample_format();
    let config: StreamConfig = supported.config();

    debug!(
        "Audio config: sample_rate={}, channels={}, format={:?}",
        config.sample_rate.0, config.channels, sample_format
    );

    let shared = Arc::new(Shared {
        voice: Mutex::new(None),
        volume: AtomicVolume::new(1.0),
        output_rate: config.sample_rate.0,
    });

    let stream = match sample_format {
        SampleFormat::F32 => build_stream::<f32>(&device, &config, Arc::clone(&shared))?,
        SampleFormat::I16 => build_stream::<i16>(&device, &config, Arc::clone(&shared))?,
        SampleFormat::U16 => build_stream::<u16>(&device, &config, Arc::clone(&shared))?,
        other => {
            return Err(Error::AudioOutput(format!(
                "Unsupported sample format: {:?}",
                other
            )));
        }
    };

    stream
        .play()
        .map_err(|e| Error::AudioOutput(format!("Failed to start stream: {}", e)))?;

    Ok((stream, shared))
}

fn build_stream<T>(device: &Device, config: &StreamConfig, shared: Arc<Shared>) -> Result<Stream>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = config.channels as usize;

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                fill(data, channels, &shared);
            },
            move |err| {
                error!("Audio stream error: {}", err);
            },
            None,
        )
        .map_err(|e| Error::AudioOutput(format!("Failed to build stream: {}", e)))
}

/// Audio callback body
fn fill<T>(data: &mut [T], channels: usize, shared: &Shared)
where
    T: SizedSample + FromSample<f32>,
{
    let silence = T::from_sample(0.0f32);

    // Contended or poisoned: output silence for this buffer
    let Ok(mut slot) = shared.voice.try_lock() else {
        data.iter_mut().for_each(|s| *s = silence);
        return;
    };

    let volume = shared.volume.get();
    let mut finished = false;

    for frame in data.chunks_mut(channels) {
        let (left, right) = match slot.as_mut() {
            Some(voice) if !finished => {
                let index = voice.position as usize;
                if index < voice.audio.frames() {
                    let samples = voice.audio.samples();
                    voice.position += voice.step;
                    (samples[index * 2], samples[index * 2 + 1])
                } else {
                    finished = true;
                    (0.0, 0.0)
                }
            }
            _ => (0.0, 0.0),
        };

        let left = (left * volume).clamp(-1.0, 1.0);
        let right = (right * volume).clamp(-1.0, 1.0);

        match frame.len() {
            0 => {}
            1 => frame[0] = T::from_sample((left + right) * 0.5),
            _ => {
                frame[0] = T::from_sample(left);
                frame[1] = T::from_sample(right);
                for extra in frame[2..].iter_mut() {
                    *extra = silence;
                }
            }
        }
    }

    if finished {
        *slot = None;
    }
}
