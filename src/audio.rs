// Audio Module - Loopback capture of the system audio output via cpal
use anyhow::{anyhow, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const BUFFER_QUEUE: usize = 4;
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// List all available audio devices (both input and output)
/// Returns a vector of (device_name, is_output) tuples
pub fn list_audio_devices() -> Result<Vec<(String, bool)>> {
    let host = cpal::default_host();
    let mut device_list = Vec::new();
    let mut seen_devices = HashSet::new();

    if let Some(device) = host.default_output_device() {
        if let Ok(name) = device.name() {
            device_list.push((format!("{} [OUTPUT/LOOPBACK] (default)", name), true));
            seen_devices.insert(name);
        }
    }

    if let Some(device) = host.default_input_device() {
        if let Ok(name) = device.name() {
            device_list.push((format!("{} [INPUT] (default)", name), false));
            seen_devices.insert(name);
        }
    }

    if let Ok(devices) = host.output_devices() {
        for device in devices {
            if let Ok(name) = device.name() {
                if seen_devices.insert(name.clone()) {
                    device_list.push((format!("{} [OUTPUT/LOOPBACK]", name), true));
                }
            }
        }
    }

    if let Ok(devices) = host.input_devices() {
        for device in devices {
            if let Ok(name) = device.name() {
                if seen_devices.insert(name.clone()) {
                    device_list.push((format!("{} [INPUT]", name), false));
                }
            }
        }
    }

    if device_list.is_empty() {
        return Err(anyhow!("No audio devices found"));
    }

    Ok(device_list)
}

/// Find an audio device by name, case-insensitive substring match.
/// Output devices are checked first since they are captured in loopback.
/// Strip the labels `list_audio_devices` appends, so a listed name can be pasted back in
pub fn clean_device_name(device_name: &str) -> &str {
    let mut name = device_name.trim();
    for tag in [" (default)", " [OUTPUT/LOOPBACK]", " [INPUT]"] {
        name = name.strip_suffix(tag).unwrap_or(name).trim_end();
    }
    name
}

pub fn find_audio_device(device_name: &str) -> Result<Device> {
    let host = cpal::default_host();
    let wanted = clean_device_name(device_name).to_lowercase();
    let matches = |device: &Device| {
        device
            .name()
            .map(|name| name.to_lowercase().contains(&wanted))
            .unwrap_or(false)
    };

    if let Ok(mut devices) = host.output_devices() {
        if let Some(device) = devices.find(|d| matches(d)) {
            return Ok(device);
        }
    }
    if let Ok(mut devices) = host.input_devices() {
        if let Some(device) = devices.find(|d| matches(d)) {
            return Ok(device);
        }
    }

    Err(anyhow!("Audio device '{}' not found", device_name))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

/// Interleaved PCM buffers from a running capture, plus the first fatal error
pub struct AudioStream {
    pub format: AudioFormat,
    buffers: mpsc::Receiver<Vec<f32>>,
    errors: mpsc::Receiver<anyhow::Error>,
    cancel: CancellationToken,
    thread: Option<JoinHandle<()>>,
}

impl AudioStream {
    pub fn new(
        format: AudioFormat,
        buffers: mpsc::Receiver<Vec<f32>>,
        errors: mpsc::Receiver<anyhow::Error>,
        cancel: CancellationToken,
        thread: Option<JoinHandle<()>>,
    ) -> Self {
        AudioStream { format, buffers, errors, cancel, thread }
    }

    /// Next buffer; `Some(Err)` on a device error, `None` once capture has stopped
    pub async fn next(&mut self) -> Option<Result<Vec<f32>>> {
        tokio::select! {
            biased;
            Some(err) = self.errors.recv() => Some(Err(err)),
            buf = self.buffers.recv() => buf.map(Ok),
        }
    }

    /// Stop the capture thread and wait until the device is released
    pub async fn close(mut self) {
        self.cancel.cancel();
        if let Some(thread) = self.thread.take() {
            let _ = tokio::task::spawn_blocking(move || {
                if thread.join().is_err() {
                    warn!("Audio capture thread panicked");
                }
            })
            .await;
        }
    }
}

impl Drop for AudioStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Anything that can produce an audio stream
pub trait AudioSource: Send + Sync {
    /// Blocks until the device is open and playing
    fn open(&self, cancel: CancellationToken) -> Result<AudioStream>;
}

/// Captures what the system is playing: the default output device in loopback,
/// falling back to the default input on hosts without loopback
pub struct LoopbackSource {
    pub device: Option<String>,
}

fn candidates(device: Option<&str>) -> Result<Vec<Device>> {
    if let Some(name) = device {
        return Ok(vec![find_audio_device(name)?]);
    }
    let host = cpal::default_host();
    let list: Vec<Device> = host
        .default_output_device()
        .into_iter()
        .chain(host.default_input_device())
        .collect();
    if list.is_empty() {
        return Err(anyhow!("No default audio device available"));
    }
    Ok(list)
}

fn build_stream(
    device: &Device,
    buffers: mpsc::Sender<Vec<f32>>,
    errors: mpsc::Sender<anyhow::Error>,
    failed: Arc<AtomicBool>,
) -> Result<(Stream, AudioFormat)> {
    let config = device
        .default_input_config()
        .or_else(|_| device.default_output_config())?;
    let format = AudioFormat {
        sample_rate: config.sample_rate().0,
        channels: config.channels(),
    };
    let sample_format = config.sample_format();

    let on_error = move |err: cpal::StreamError| {
        failed.store(true, Ordering::Relaxed);
        let _ = errors.try_send(anyhow!("Audio stream error: {}", err));
    };

    // Buffers are dropped rather than queued when analysis falls behind
    let stream = match sample_format {
        SampleFormat::F32 => device.build_input_stream(
            &config.into(),
            move |data: &[f32], _| {
                let _ = buffers.try_send(data.to_vec());
            },
            on_error,
            None,
        )?,
        SampleFormat::I16 => device.build_input_stream(
            &config.into(),
            move |data: &[i16], _| {
                let _ = buffers.try_send(data.iter().map(|&s| s as f32 / 32768.0).collect());
            },
            on_error,
            None,
        )?,
        SampleFormat::U16 => device.build_input_stream(
            &config.into(),
            move |data: &[u16], _| {
                let _ = buffers.try_send(data.iter().map(|&s| (s as f32 - 32768.0) / 32768.0).collect());
            },
            on_error,
            None,
        )?,
        other => return Err(anyhow!("Unsupported sample format: {:?}", other)),
    };

    Ok((stream, format))
}

impl AudioSource for LoopbackSource {
    fn open(&self, cancel: CancellationToken) -> Result<AudioStream> {
        let (buf_tx, buf_rx) = mpsc::channel(BUFFER_QUEUE);
        let (err_tx, err_rx) = mpsc::channel(1);
        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<Result<AudioFormat>>(1);
        let device_name = self.device.clone();
        let thread_cancel = cancel.clone();

        // cpal streams are not Send; the stream lives and dies on this thread
        let thread = thread::Builder::new().name("audio-capture".into()).spawn(move || {
            let failed = Arc::new(AtomicBool::new(false));

            let opened = candidates(device_name.as_deref()).and_then(|devices| {
                let mut last_err = anyhow!("No audio device could be opened");
                for device in devices {
                    let name = device.name().unwrap_or_else(|_| "unknown".into());
                    match build_stream(&device, buf_tx.clone(), err_tx.clone(), failed.clone())
                        .and_then(|(stream, format)| {
                            stream.play()?;
                            Ok((stream, format))
                        }) {
                        Ok((stream, format)) => {
                            info!(device = %name, rate = format.sample_rate, channels = format.channels, "Audio capture started");
                            return Ok((stream, format));
                        }
                        Err(e) => {
                            debug!("Audio device {} unusable: {}", name, e);
                            last_err = e;
                        }
                    }
                }
                Err(last_err)
            });

            let stream = match opened {
                Ok((stream, format)) => {
                    let _ = ready_tx.send(Ok(format));
                    stream
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };

            while !thread_cancel.is_cancelled() && !failed.load(Ordering::Relaxed) {
                thread::sleep(POLL_INTERVAL);
            }

            if let Err(e) = stream.pause() {
                debug!("Audio stream pause failed: {}", e);
            }
            drop(stream);
            debug!("Audio capture stopped");
        })?;

        let format = ready_rx
            .recv()
            .map_err(|_| anyhow!("Audio capture thread exited during setup"))??;

        Ok(AudioStream::new(format, buf_rx, err_rx, cancel, Some(thread)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_device_name() {
        assert_eq!(clean_device_name("Speakers [OUTPUT/LOOPBACK] (default)"), "Speakers");
        assert_eq!(clean_device_name("USB Mic [INPUT]"), "USB Mic");
        assert_eq!(clean_device_name(" Monitor of Built-in "), "Monitor of Built-in");
        assert_eq!(clean_device_name("Line (default) In"), "Line (default) In");
    }

    #[tokio::test]
    async fn test_stream_surfaces_errors_first() {
        let (buf_tx, buf_rx) = mpsc::channel(4);
        let (err_tx, err_rx) = mpsc::channel(1);
        let format = AudioFormat { sample_rate: 48000, channels: 2 };
        let mut stream = AudioStream::new(format, buf_rx, err_rx, CancellationToken::new(), None);

        buf_tx.send(vec![0.5; 8]).await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap().len(), 8);

        buf_tx.send(vec![0.1; 8]).await.unwrap();
        err_tx.send(anyhow!("device unplugged")).await.unwrap();
        assert!(stream.next().await.unwrap().is_err());

        drop(buf_tx);
        drop(err_tx);
        // The buffer queued before the error is still delivered, then the stream ends
        assert!(stream.next().await.unwrap().is_ok());
        assert!(stream.next().await.is_none());
        stream.close().await;
    }
}
