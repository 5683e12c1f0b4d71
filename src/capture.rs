//! Loopback audio capture.
//!
//! Resolves a monitor (loopback) source for the default output device,
//! opens a cpal input stream on it, and hands out fixed-size chunks of
//! signed 16-bit samples to the pipeline.
//!
//! # Source Detection
//! Like CAVA, temporarily sets a PulseAudio monitor source as the default
//! input so the stream captures what the system is playing, not the
//! microphone. The original default source is restored on drop.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::collections::VecDeque;
use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::sync::{Arc, Condvar, Mutex};

use crate::debug_log::{dbg_log, DebugLogger};
use crate::dsp::{FFT_LEN, MONO_NOISE_FLOOR, MULTI_CHANNEL_NOISE_FLOOR};
use crate::error::PipelineError;

/// Interleaved samples per chunk; the chunk frame count is this divided by
/// the channel count, so one chunk always feeds one full FFT.
const CHUNK_SAMPLES: usize = FFT_LEN;

/// Queue high-water mark. Beyond this the oldest samples are dropped
/// silently; a buffer overrun is tolerated, never an error.
const QUEUE_LIMIT: usize = CHUNK_SAMPLES * 8;

/// RAII guard to suppress stderr during ALSA device enumeration
/// Restores stderr when dropped
struct StderrSuppressor {
    saved_fd: i32,
    dev_null: File,
}

impl StderrSuppressor {
    fn new() -> Option<Self> {
        let dev_null = File::open("/dev/null").ok()?;

        let saved_fd = unsafe { libc::dup(2) };
        if saved_fd < 0 {
            return None;
        }

        let dup2_result = unsafe { libc::dup2(dev_null.as_raw_fd(), 2) };
        if dup2_result < 0 {
            unsafe {
                libc::close(saved_fd);
            }
            return None;
        }

        Some(Self { saved_fd, dev_null })
    }
}

impl Drop for StderrSuppressor {
    fn drop(&mut self) {
        unsafe {
            libc::dup2(self.saved_fd, 2);
            libc::close(self.saved_fd);
        }
        let _ = &self.dev_null; // Keep dev_null alive until here
    }
}

/// Validate that a PulseAudio source name contains only safe characters.
/// Valid names: alphanumeric, dots, dashes, underscores, colons, at-signs
/// (e.g., "alsa_output.pci-0000_03_00.1.hdmi-stereo.monitor", "@DEFAULT_SINK@")
fn is_valid_source_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | ':' | '@'))
}

/// Resolve a loopback source and set it as the default input.
///
/// Prefers the monitor of the current default sink (the default output
/// device already in loopback form); falls back to the first monitor whose
/// sink name we can match. Returns the original default source (for
/// restoration on exit) and whether a monitor was successfully set.
fn resolve_monitor_source() -> (Option<String>, bool) {
    let original_source = std::process::Command::new("pactl")
        .args(["get-default-source"])
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
        .filter(|s| is_valid_source_name(s));

    let default_sink = std::process::Command::new("pactl")
        .args(["get-default-sink"])
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
        .filter(|s| is_valid_source_name(s));

    let monitor_set = std::process::Command::new("pactl")
        .args(["list", "sources", "short"])
        .output()
        .ok()
        .and_then(|output| {
            if !output.status.success() {
                return None;
            }

            let stdout = String::from_utf8_lossy(&output.stdout);
            let lines: Vec<&str> = stdout.lines().collect();

            // First choice: the monitor belonging to the default sink.
            if let Some(ref sink) = default_sink {
                let expected_monitor = format!("{}.monitor", sink);
                for line in &lines {
                    let parts: Vec<&str> = line.split('\t').collect();
                    if parts.len() >= 2
                        && parts[1] == expected_monitor
                        && is_valid_source_name(parts[1])
                    {
                        let _ = std::process::Command::new("pactl")
                            .args(["set-default-source", parts[1]])
                            .output();
                        return Some(parts[1].to_string());
                    }
                }
            }

            // Fallback: any monitor source.
            for line in &lines {
                let parts: Vec<&str> = line.split('\t').collect();
                if parts.len() >= 2
                    && parts[1].contains(".monitor")
                    && is_valid_source_name(parts[1])
                {
                    let _ = std::process::Command::new("pactl")
                        .args(["set-default-source", parts[1]])
                        .output();
                    return Some(parts[1].to_string());
                }
            }

            None
        });

    (original_source, monitor_set.is_some())
}

fn restore_original_source(original_source: &Option<String>) {
    if let Some(ref orig) = original_source {
        let _ = std::process::Command::new("pactl")
            .args(["set-default-source", orig])
            .output();
    }
}

/// RAII guard to restore the PulseAudio default source on drop.
/// Ensures cleanup happens on all exit paths (normal exit, early return, panic).
struct MonitorSourceGuard {
    original_source: Option<String>,
    should_restore: bool,
}

impl MonitorSourceGuard {
    fn new(original_source: Option<String>, should_restore: bool) -> Self {
        Self {
            original_source,
            should_restore,
        }
    }
}

impl Drop for MonitorSourceGuard {
    fn drop(&mut self) {
        if self.should_restore {
            restore_original_source(&self.original_source);
        }
    }
}

struct QueueState {
    samples: VecDeque<i16>,
    device_lost: bool,
}

/// Sample queue shared between the cpal callback and the pipeline thread.
///
/// The callback pushes interleaved samples; [`ChunkQueue::read_chunk`] blocks
/// until a full chunk is buffered and drains exactly that many.
struct ChunkQueue {
    inner: Mutex<QueueState>,
    ready: Condvar,
}

impl ChunkQueue {
    fn new() -> Self {
        Self {
            inner: Mutex::new(QueueState {
                samples: VecDeque::with_capacity(QUEUE_LIMIT),
                device_lost: false,
            }),
            ready: Condvar::new(),
        }
    }

    fn push(&self, data: &[i16]) {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        state.samples.extend(data.iter().copied());
        // Overrun: discard the oldest samples and keep going. Stale audio is
        // acceptable; blocking the audio callback is not.
        while state.samples.len() > QUEUE_LIMIT {
            state.samples.pop_front();
        }
        drop(state);
        self.ready.notify_one();
    }

    fn mark_lost(&self) {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        state.device_lost = true;
        drop(state);
        self.ready.notify_all();
    }

    fn read_chunk(&self, len: usize) -> Result<Vec<i16>, PipelineError> {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if state.device_lost {
                return Err(PipelineError::DeviceChanged);
            }
            if state.samples.len() >= len {
                return Ok(state.samples.drain(..len).collect());
            }
            state = self
                .ready
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
    }
}

/// An open capture stream delivering fixed-size chunks.
pub struct CaptureStream {
    // Held for its side effect: dropping the stream stops capture.
    _stream: cpal::Stream,
    queue: Arc<ChunkQueue>,
    sample_rate: u32,
    channels: u16,
    compatibility: bool,
    _source_guard: MonitorSourceGuard,
}

impl CaptureStream {
    /// Resolve a loopback device and open it, mono first, compatibility mode
    /// (native channel count, higher latency) second.
    pub fn open(log: &mut DebugLogger) -> Result<Self, PipelineError> {
        // ALSA spews to stderr during enumeration; keep it off the console.
        let _stderr_guard = StderrSuppressor::new();

        dbg_log!(log, "looking for monitor source via pactl");
        let (original_source, monitor_was_set) = resolve_monitor_source();
        dbg_log!(
            log,
            "monitor source: original={:?}, set={}",
            original_source,
            monitor_was_set
        );
        // If no monitor could be set, the default source must already be a
        // loopback; capturing a microphone instead would be silently wrong.
        let already_loopback = original_source
            .as_deref()
            .map(|s| s.contains(".monitor"))
            .unwrap_or(false);
        if !monitor_was_set && !already_loopback {
            return Err(PipelineError::LoopbackUnavailable);
        }
        let source_guard = MonitorSourceGuard::new(original_source, monitor_was_set);

        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or(PipelineError::LoopbackUnavailable)?;
        let device_name = device.name().unwrap_or_else(|_| "unknown".to_string());
        dbg_log!(log, "capture device: {}", device_name);

        let supported = device
            .default_input_config()
            .map_err(|_| PipelineError::LoopbackUnavailable)?;
        let sample_rate = supported.sample_rate().0;
        let native_channels = supported.channels().max(1);

        let queue = Arc::new(ChunkQueue::new());

        // Mono first; some loopback devices only accept their native layout.
        let (stream, channels) = match build_stream(&device, 1, sample_rate, &queue) {
            Ok(stream) => (stream, 1),
            Err(mono_err) => {
                dbg_log!(log, "mono open failed: {}", mono_err);
                println!(
                    "Your current audio device does not work with Mono mode, \
                     switching to compatibility mode (higher latency)"
                );
                let stream = build_stream(&device, native_channels, sample_rate, &queue)
                    .map_err(|e| {
                        PipelineError::StreamOpenFailed(format!("{} / {}", mono_err, e))
                    })?;
                (stream, native_channels)
            }
        };

        stream
            .play()
            .map_err(|e| PipelineError::StreamOpenFailed(e.to_string()))?;
        dbg_log!(
            log,
            "stream running: {} Hz, {} channel(s)",
            sample_rate,
            channels
        );

        Ok(Self {
            _stream: stream,
            queue,
            sample_rate,
            channels,
            compatibility: channels > 1,
            _source_guard: source_guard,
        })
    }

    /// Block until one full chunk of interleaved samples is available.
    ///
    /// Returns [`PipelineError::DeviceChanged`] once the underlying device
    /// has gone away; the outer driver restarts the whole pipeline.
    pub fn read_chunk(&self) -> Result<Vec<i16>, PipelineError> {
        self.queue.read_chunk(CHUNK_SAMPLES)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Ceiling noise floor matching the capture mode.
    pub fn noise_floor(&self) -> f32 {
        if self.compatibility {
            MULTI_CHANNEL_NOISE_FLOOR
        } else {
            MONO_NOISE_FLOOR
        }
    }
}

fn build_stream(
    device: &cpal::Device,
    channels: u16,
    sample_rate: u32,
    queue: &Arc<ChunkQueue>,
) -> Result<cpal::Stream, cpal::BuildStreamError> {
    let frames = (CHUNK_SAMPLES / channels.max(1) as usize) as u32;
    let config = cpal::StreamConfig {
        channels,
        sample_rate: cpal::SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Fixed(frames),
    };

    let data_queue = Arc::clone(queue);
    let error_queue = Arc::clone(queue);
    device.build_input_stream(
        &config,
        move |data: &[f32], _: &cpal::InputCallbackInfo| {
            // Scale float samples to the signed 16-bit range the band table
            // and ceiling constants are calibrated for.
            let scaled: Vec<i16> = data
                .iter()
                .map(|&s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
                .collect();
            data_queue.push(&scaled);
        },
        move |_err| {
            // Device unplugged or stream torn down; surface as DeviceChanged
            // on the next read.
            error_queue.mark_lost();
        },
        None,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn read_chunk_waits_for_a_full_chunk() {
        let queue = Arc::new(ChunkQueue::new());
        let producer = Arc::clone(&queue);

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            producer.push(&[1i16; 600]);
            thread::sleep(Duration::from_millis(10));
            producer.push(&[2i16; 600]);
        });

        let chunk = queue.read_chunk(1024).unwrap();
        assert_eq!(chunk.len(), 1024);
        assert_eq!(chunk[0], 1);
        assert_eq!(chunk[1023], 2);
        handle.join().unwrap();
    }

    #[test]
    fn overrun_drops_oldest_samples_silently() {
        let queue = ChunkQueue::new();
        queue.push(&[7i16; QUEUE_LIMIT]);
        queue.push(&[9i16; 100]);

        let chunk = queue.read_chunk(1024).unwrap();
        assert_eq!(chunk.len(), 1024);
        // The newest 100 samples displaced the oldest 100.
        assert!(chunk.iter().all(|&s| s == 7));
        let state = queue.inner.lock().unwrap();
        assert_eq!(state.samples.len(), QUEUE_LIMIT - 1024);
        assert_eq!(*state.samples.back().unwrap(), 9);
    }

    #[test]
    fn lost_device_unblocks_readers() {
        let queue = Arc::new(ChunkQueue::new());
        let canceller = Arc::clone(&queue);

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            canceller.mark_lost();
        });

        match queue.read_chunk(1024) {
            Err(PipelineError::DeviceChanged) => {}
            other => panic!("expected DeviceChanged, got {:?}", other.map(|c| c.len())),
        }
        handle.join().unwrap();
    }

    #[test]
    fn source_name_validation() {
        assert!(is_valid_source_name(
            "alsa_output.pci-0000_03_00.1.hdmi-stereo.monitor"
        ));
        assert!(is_valid_source_name("@DEFAULT_SINK@"));
        assert!(!is_valid_source_name(""));
        assert!(!is_valid_source_name("bad name; rm -rf"));
    }
}
