//! Serial line protocol and transport to the display firmware.
//!
//! One frame per line: 8 comma-separated levels (trailing comma), then
//! backtick-delimited title, subtitle, and animate flag, newline-terminated.
//! The firmware splits on backtick then comma and renders the columns.

use std::fmt::Write as _;
use std::io::Write as _;
use std::time::Duration;

use crate::dsp::NUM_BANDS;
use crate::error::PipelineError;
use crate::metadata::NowPlaying;

/// Baud rate the display firmware listens at.
const BAUD_RATE: u32 = 115_200;
/// Timeout for serial open/write; a frame is tiny so this is generous.
const LINK_TIMEOUT: Duration = Duration::from_millis(500);

/// Handshake text shown on the panel until audio starts flowing.
const CONNECTED_MESSAGE: &str = "Connected!";
const PROMPT_MESSAGE: &str = "Play Audio to Start";

/// One encoded display update: 8 quantized levels plus the text panel fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayFrame {
    pub levels: [u8; NUM_BANDS],
    pub title: String,
    pub subtitle: String,
    /// `false` only for the startup handshake; the firmware uses it to gate
    /// the type-out animation.
    pub animate: bool,
}

impl DisplayFrame {
    /// The fixed frame sent once at startup, before any audio is processed.
    pub fn handshake() -> Self {
        Self {
            levels: [0; NUM_BANDS],
            title: CONNECTED_MESSAGE.to_string(),
            subtitle: PROMPT_MESSAGE.to_string(),
            animate: false,
        }
    }

    /// A data frame combining one cycle's levels with the buffered metadata.
    pub fn data(levels: [u8; NUM_BANDS], now_playing: &NowPlaying) -> Self {
        Self {
            levels,
            title: now_playing.title.clone(),
            subtitle: now_playing.subtitle.clone(),
            animate: true,
        }
    }

    /// Serialize to the wire line, including the trailing newline.
    pub fn encode(&self) -> String {
        let mut line = String::new();
        for level in self.levels {
            let _ = write!(line, "{},", level);
        }
        let _ = write!(
            line,
            "`{}`{}`{}\n",
            sanitize_field(&self.title),
            sanitize_field(&self.subtitle),
            if self.animate { '1' } else { '0' }
        );
        line
    }
}

/// Text fields share the line with the frame delimiters; a stray backtick or
/// newline in a track title would desync the firmware parser.
fn sanitize_field(text: &str) -> String {
    text.replace(['`', '\n', '\r'], " ")
}

/// The serial link to the display.
///
/// Each frame is sent over a freshly opened connection that is dropped right
/// after the write. A write failure therefore costs at most one frame, and
/// the port is never left open if the process dies between frames.
pub struct SerialLink {
    port_name: String,
}

impl SerialLink {
    pub fn new(port_name: &str) -> Self {
        Self {
            port_name: port_name.to_string(),
        }
    }

    pub fn send(&self, frame: &DisplayFrame) -> Result<(), PipelineError> {
        let mut port = serialport::new(&self.port_name, BAUD_RATE)
            .timeout(LINK_TIMEOUT)
            .open()
            .map_err(|e| self.unavailable(e.to_string()))?;
        port.write_all(frame.encode().as_bytes())
            .and_then(|_| port.flush())
            .map_err(|e| self.unavailable(e.to_string()))
        // port drops here, closing the link until the next frame
    }

    fn unavailable(&self, reason: String) -> PipelineError {
        PipelineError::LinkUnavailable {
            port: self.port_name.clone(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_frame_encodes_exactly() {
        let frame = DisplayFrame::data(
            [0, 9, 9, 0, 5, 5, 5, 5],
            &NowPlaying {
                title: "Artist".into(),
                subtitle: "Song".into(),
            },
        );
        assert_eq!(frame.encode(), "0,9,9,0,5,5,5,5,`Artist`Song`1\n");
    }

    #[test]
    fn handshake_frame_is_fixed() {
        assert_eq!(
            DisplayFrame::handshake().encode(),
            "0,0,0,0,0,0,0,0,`Connected!`Play Audio to Start`0\n"
        );
    }

    #[test]
    fn firmware_split_recovers_fields() {
        let frame = DisplayFrame::data(
            [3, 5, 2, 0, 7, 9, 1, 4],
            &NowPlaying {
                title: "Artist Name".into(),
                subtitle: "Song Title".into(),
            },
        );
        let line = frame.encode();
        let line = line.strip_suffix('\n').unwrap();

        // The firmware splits on backtick, then the level field on comma.
        let fields: Vec<&str> = line.split('`').collect();
        assert_eq!(fields.len(), 4);
        let levels: Vec<u8> = fields[0]
            .split(',')
            .filter(|s| !s.is_empty())
            .map(|s| s.parse().unwrap())
            .collect();
        assert_eq!(levels, vec![3, 5, 2, 0, 7, 9, 1, 4]);
        assert_eq!(fields[1], "Artist Name");
        assert_eq!(fields[2], "Song Title");
        assert_eq!(fields[3], "1");
    }

    #[test]
    fn delimiters_in_metadata_cannot_desync_the_frame() {
        let frame = DisplayFrame::data(
            [0; 8],
            &NowPlaying {
                title: "back`tick".into(),
                subtitle: "multi\nline".into(),
            },
        );
        let line = frame.encode();
        assert_eq!(line.matches('`').count(), 3);
        assert_eq!(line.matches('\n').count(), 1);
    }
}
