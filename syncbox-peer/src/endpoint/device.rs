//! Playback devices
//!
//! A device plays one decoded buffer at a time. Starting a new buffer
//! replaces whatever was playing.

use crate::error::Result;
use crate::lock_unpoisoned;
use crate::pipeline::DecodedAudio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use syncbox_common::PeerId;

/// Output sink owned by one endpoint
pub trait PlaybackDevice: Send + Sync {
    /// Start playing `audio` from the beginning
    fn start(&self, audio: Arc<DecodedAudio>) -> Result<()>;

    /// Stop playback; no-op when idle
    fn stop(&self);

    fn is_playing(&self) -> bool;

    /// Set gain, 0.0..=1.0
    fn set_volume(&self, volume: f32);

    fn volume(&self) -> f32;
}

/// Builds the device for a newly registered endpoint
pub type DeviceFactory = Arc<dyn Fn(PeerId) -> Result<Box<dyn PlaybackDevice>> + Send + Sync>;

/// Clamp a volume to 0.0..=1.0 (NaN becomes silence)
pub fn clamp_volume(volume: f32) -> f32 {
    if volume.is_nan() {
        0.0
    } else {
        volume.clamp(0.0, 1.0)
    }
}

/// Lock-free f32 cell for the volume shared with audio callbacks
#[derive(Debug)]
pub struct AtomicVolume(AtomicU32);

impl AtomicVolume {
    pub fn new(volume: f32) -> Self {
        Self(AtomicU32::new(clamp_volume(volume).to_bits()))
    }

    pub fn get(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    pub fn set(&self, volume: f32) {
        self.0.store(clamp_volume(volume).to_bits(), Ordering::Relaxed);
    }
}

/// Silent device
///
/// Tracks a playing state that lasts as long as the buffer would take to
/// play. Used for headless peers and tests.
#[derive(Debug)]
pub struct NullDevice {
    playing: Mutex<Option<(Instant, Duration)>>,
    volume: AtomicVolume,
}

impl NullDevice {
    pub fn new() -> Self {
        Self {
            playing: Mutex::new(None),
            volume: AtomicVolume::new(1.0),
        }
    }
}

impl Default for NullDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaybackDevice for NullDevice {
    fn start(&self, audio: Arc<DecodedAudio>) -> Result<()> {
        *lock_unpoisoned(&self.playing) = Some((Instant::now(), audio.duration()));
        Ok(())
    }

    fn stop(&self) {
        *lock_unpoisoned(&self.playing) = None;
    }

    fn is_playing(&self) -> bool {
        match *lock_unpoisoned(&self.playing) {
            Some((started, duration)) => started.elapsed() < duration,
            None => false,
        }
    }

    fn set_volume(&self, volume: f32) {
        self.volume.set(volume);
    }

    fn volume(&self) -> f32 {
        self.volume.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_volume() {
        assert_eq!(clamp_volume(-0.5), 0.0);
        assert_eq!(clamp_volume(1.5), 1.0);
        assert_eq!(clamp_volume(0.25), 0.25);
        assert_eq!(clamp_volume(f32::NAN), 0.0);
    }

    #[test]
    fn test_null_device_plays_for_duration() {
        let device = NullDevice::new();
        assert!(!device.is_playing());

        // 10 seconds at 1 kHz
        let audio = Arc::new(DecodedAudio::new(vec![0.0; 20_000], 1000, 2));
        device.start(audio).unwrap();
        assert!(device.is_playing());

        device.stop();
        assert!(!device.is_playing());
    }

    #[test]
    fn test_null_device_finishes() {
        let device = NullDevice::new();
        let empty = Arc::new(DecodedAudio::new(Vec::new(), 44100, 2));
        device.start(empty).unwrap();
        assert!(!device.is_playing());
    }

    #[test]
    fn test_null_device_volume() {
        let device = NullDevice::new();
        device.set_volume(2.0);
        assert_eq!(device.volume(), 1.0);
        device.set_volume(0.2);
        assert!((device.volume() - 0.2).abs() < f32::EPSILON);
    }
}
