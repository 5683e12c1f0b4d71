//! The capture → analyze → encode cycle.
//!
//! A single logical thread drives the whole pipeline: every iteration polls
//! the metadata buffer, blocks on one audio chunk, folds it through the
//! smoothing state, and writes one frame to the serial link. Backpressure is
//! implicit: if a cycle runs longer than the chunk's real-time duration the
//! capture queue overruns and silently drops the oldest audio.

use crate::capture::CaptureStream;
use crate::debug_log::{dbg_log, DebugLogger};
use crate::dsp::{self, SmoothingState};
use crate::error::PipelineError;
use crate::metadata::{MetadataBuffer, MetadataSource};
use crate::protocol::{DisplayFrame, SerialLink};
use crate::settings::Settings;

/// Run the pipeline until the audio device disappears or the link fails.
///
/// Returns [`PipelineError::DeviceChanged`] when a full restart (device
/// re-enumeration) makes sense; every other error is terminal.
pub fn run(settings: &Settings, debug: bool) -> Result<(), PipelineError> {
    let mut log = DebugLogger::new(debug);
    dbg_log!(log, "starting pipeline on {}", settings.port);

    let capture = CaptureStream::open(&mut log)?;
    dbg_log!(
        log,
        "capture open: {} Hz, {} channel(s)",
        capture.sample_rate(),
        capture.channels()
    );

    let link = SerialLink::new(&settings.port);
    link.send(&DisplayFrame::handshake())?;

    let source = if settings.use_metadata {
        MetadataSource::player()
    } else {
        MetadataSource::clock(
            settings.title_format.clone(),
            settings.subtitle_format.clone(),
        )
    };
    let mut metadata = MetadataBuffer::new();
    let mut smoothing = SmoothingState::new();
    let noise_floor = capture.noise_floor();

    loop {
        // Timed-out lookups leave the buffer untouched, so a slow metadata
        // source degrades to stale text rather than a stalled display.
        metadata.apply(source.poll());

        let chunk = capture.read_chunk()?;
        let raw = dsp::band_magnitudes(&chunk, capture.sample_rate());
        smoothing.advance(&raw, noise_floor);

        let frame = DisplayFrame::data(smoothing.quantize(), metadata.current());
        link.send(&frame)?;
    }
}
