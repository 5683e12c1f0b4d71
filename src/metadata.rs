//! Now-playing text for the display panel.
//!
//! The MPRIS lookup runs on its own worker thread and is polled with a
//! deadline far below one chunk period, so a slow or absent D-Bus session can
//! never stall the audio loop. When the lookup misses its deadline the
//! pipeline keeps showing the last successfully fetched pair. With metadata
//! disabled, a clock pair formatted from configurable strftime patterns is
//! shown instead.

use chrono::{DateTime, Local};
use mpris::PlayerFinder;
use std::fmt::Write as _;
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::thread;
use std::time::{Duration, Instant};

/// Deadline for one metadata poll. Well under one chunk period (~21 ms at
/// 48 kHz), so the lookup is never the bottleneck of the real-time loop.
const LOOKUP_DEADLINE: Duration = Duration::from_millis(20);

/// Pause between worker fetches once the channel slot is full.
const WORKER_IDLE: Duration = Duration::from_millis(10);

const NOT_PLAYING_TITLE: &str = "None";
const NOT_PLAYING_SUBTITLE: &str = "Nothing Playing";

pub const DEFAULT_TITLE_FORMAT: &str = "%I:%M %p";
pub const DEFAULT_SUBTITLE_FORMAT: &str = "%a, %x";

/// A title/subtitle pair for the text panel. For media playback the title
/// line carries the artist and the subtitle line the track name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NowPlaying {
    pub title: String,
    pub subtitle: String,
}

impl NowPlaying {
    pub fn not_playing() -> Self {
        Self {
            title: NOT_PLAYING_TITLE.to_string(),
            subtitle: NOT_PLAYING_SUBTITLE.to_string(),
        }
    }
}

/// Outcome of one bounded-deadline lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataUpdate {
    /// A player session exists and reported this pair.
    Current(NowPlaying),
    /// No player session is available right now.
    NoSession,
    /// The lookup missed its deadline; the caller keeps its buffered value.
    TimedOut,
}

/// Where the text panel content comes from.
pub enum MetadataSource {
    Player(PlayerPoller),
    Clock {
        title_format: String,
        subtitle_format: String,
    },
}

impl MetadataSource {
    /// MPRIS-backed source with a persistent worker thread.
    pub fn player() -> Self {
        Self::Player(PlayerPoller::spawn())
    }

    /// Clock fallback used when metadata lookup is disabled.
    pub fn clock(title_format: String, subtitle_format: String) -> Self {
        Self::Clock {
            title_format,
            subtitle_format,
        }
    }

    /// One lookup, bounded by [`LOOKUP_DEADLINE`]. The clock variant never
    /// times out.
    pub fn poll(&self) -> MetadataUpdate {
        match self {
            Self::Player(poller) => poller.poll(LOOKUP_DEADLINE),
            Self::Clock {
                title_format,
                subtitle_format,
            } => {
                let now = Local::now();
                MetadataUpdate::Current(NowPlaying {
                    title: format_clock(&now, title_format, DEFAULT_TITLE_FORMAT),
                    subtitle: format_clock(&now, subtitle_format, DEFAULT_SUBTITLE_FORMAT),
                })
            }
        }
    }
}

/// Format a timestamp with a user-supplied strftime pattern, falling back to
/// the built-in pattern when the user's pattern is malformed. chrono surfaces
/// bad specifiers as a fmt error, which must not take down the pipeline.
fn format_clock(now: &DateTime<Local>, pattern: &str, fallback: &str) -> String {
    let mut out = String::new();
    if write!(out, "{}", now.format(pattern)).is_ok() {
        out
    } else {
        now.format(fallback).to_string()
    }
}

/// Handle to the MPRIS worker thread.
///
/// The worker fetches continuously and posts into a single-slot channel;
/// `poll` takes whatever arrived within the deadline. The worker exits on its
/// own once the receiving side is dropped.
pub struct PlayerPoller {
    receiver: Receiver<MetadataUpdate>,
}

impl PlayerPoller {
    fn spawn() -> Self {
        let (tx, rx) = mpsc::sync_channel(1);
        thread::spawn(move || player_worker(tx));
        Self { receiver: rx }
    }

    fn poll(&self, deadline: Duration) -> MetadataUpdate {
        match self.receiver.recv_timeout(deadline) {
            Ok(update) => update,
            // Deadline expired, or the worker died; either way this cycle
            // gets a distinguishable "no update".
            Err(_) => MetadataUpdate::TimedOut,
        }
    }
}

fn player_worker(tx: SyncSender<MetadataUpdate>) {
    loop {
        let update = fetch_now_playing();
        match tx.try_send(update) {
            Ok(()) => {}
            // Slot still full from the previous fetch; drop this one.
            Err(TrySendError::Full(_)) => {}
            Err(TrySendError::Disconnected(_)) => return,
        }
        thread::sleep(WORKER_IDLE);
    }
}

/// One blocking MPRIS fetch. Runs only on the worker thread.
fn fetch_now_playing() -> MetadataUpdate {
    let finder = match PlayerFinder::new() {
        Ok(f) => f,
        Err(_) => return MetadataUpdate::NoSession,
    };
    let player = match finder.find_active() {
        Ok(p) => p,
        Err(_) => return MetadataUpdate::NoSession,
    };
    let meta = match player.get_metadata() {
        Ok(m) => m,
        Err(_) => return MetadataUpdate::NoSession,
    };

    let artists = meta
        .artists()
        .map(|a| a.join(", "))
        .filter(|a| !a.is_empty())
        .unwrap_or_else(|| NOT_PLAYING_TITLE.to_string());
    let track = meta.title().unwrap_or_default().to_string();
    if track.is_empty() {
        return MetadataUpdate::NoSession;
    }

    MetadataUpdate::Current(NowPlaying {
        title: artists,
        subtitle: track,
    })
}

/// The most recently successful lookup result, reused on timeouts.
///
/// Never overwritten by a timed-out lookup; stale values are retained until a
/// fresh result or an explicit no-session arrives.
pub struct MetadataBuffer {
    current: NowPlaying,
    updated_at: Option<Instant>,
}

impl MetadataBuffer {
    pub fn new() -> Self {
        Self {
            current: NowPlaying::not_playing(),
            updated_at: None,
        }
    }

    pub fn apply(&mut self, update: MetadataUpdate) {
        match update {
            MetadataUpdate::Current(now_playing) => {
                self.current = now_playing;
                self.updated_at = Some(Instant::now());
            }
            MetadataUpdate::NoSession => {
                self.current = NowPlaying::not_playing();
                self.updated_at = Some(Instant::now());
            }
            MetadataUpdate::TimedOut => {}
        }
    }

    pub fn current(&self) -> &NowPlaying {
        &self.current
    }

    #[allow(dead_code)]
    pub fn age(&self) -> Option<Duration> {
        self.updated_at.map(|t| t.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_starts_with_not_playing() {
        let buffer = MetadataBuffer::new();
        assert_eq!(buffer.current().title, "None");
        assert_eq!(buffer.current().subtitle, "Nothing Playing");
    }

    #[test]
    fn timeout_keeps_previous_value() {
        let mut buffer = MetadataBuffer::new();
        buffer.apply(MetadataUpdate::Current(NowPlaying {
            title: "Artist".into(),
            subtitle: "Song".into(),
        }));
        let before = buffer.current().clone();

        buffer.apply(MetadataUpdate::TimedOut);
        assert_eq!(buffer.current(), &before);
    }

    #[test]
    fn no_session_resets_to_not_playing() {
        let mut buffer = MetadataBuffer::new();
        buffer.apply(MetadataUpdate::Current(NowPlaying {
            title: "Artist".into(),
            subtitle: "Song".into(),
        }));
        buffer.apply(MetadataUpdate::NoSession);
        assert_eq!(buffer.current(), &NowPlaying::not_playing());
    }

    #[test]
    fn clock_source_always_yields_a_pair() {
        let source = MetadataSource::clock("%H:%M".into(), "%Y".into());
        match source.poll() {
            MetadataUpdate::Current(pair) => {
                assert!(pair.title.contains(':'));
                assert_eq!(pair.subtitle.len(), 4);
            }
            other => panic!("clock source returned {:?}", other),
        }
    }

    #[test]
    fn malformed_clock_pattern_falls_back() {
        let now = Local::now();
        let formatted = format_clock(&now, "%-!bogus", DEFAULT_TITLE_FORMAT);
        assert!(!formatted.is_empty());
        assert_eq!(formatted, now.format(DEFAULT_TITLE_FORMAT).to_string());
    }

    #[test]
    fn poller_times_out_against_a_silent_worker() {
        let (tx, rx) = mpsc::sync_channel::<MetadataUpdate>(1);
        let poller = PlayerPoller { receiver: rx };
        assert_eq!(poller.poll(Duration::from_millis(5)), MetadataUpdate::TimedOut);
        drop(tx);
        assert_eq!(poller.poll(Duration::from_millis(5)), MetadataUpdate::TimedOut);
    }
}
