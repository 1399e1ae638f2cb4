use std::collections::VecDeque;
use std::time::{Duration, Instant};

use loadtest_stats::ClientStats;
use regex::Regex;
use std::sync::OnceLock;

/// In-flight segment requests older than this are assumed lost and counted
/// as timeouts rather than tracked forever.
const IN_FLIGHT_SWEEP_AGE: Duration = Duration::from_secs(60);

fn opening_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"Opening '([^']+)' for (?:reading|writing)"#).unwrap())
}

fn http_error_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Server returned (\d{3})").unwrap())
}

fn sequence_skip_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(media sequence|discontinuity|skipping segment)").unwrap())
}

/// Classification of an opened URL, decided purely from its extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenKind {
    Manifest,
    Segment,
    Init,
    Unknown,
}

fn classify_url(url: &str) -> OpenKind {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    if path.ends_with(".m3u8") {
        OpenKind::Manifest
    } else if path.ends_with(".mp4") {
        OpenKind::Init
    } else if path.ends_with(".ts") {
        OpenKind::Segment
    } else {
        OpenKind::Unknown
    }
}

/// Parses an HLS client subprocess's unstructured stderr/debug log.
///
/// Maintains a fast path: a line that contains none of a handful of
/// sentinel substrings never reaches the compiled patterns below. Every
/// recognized pattern is anchored and pre-compiled once per process.
#[derive(Debug, Default)]
pub struct EventParser {
    in_flight_segments: VecDeque<(String, Instant)>,
}

impl EventParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line of stderr output, updating `stats` for any recognized
    /// event. Unrecognized lines are dropped with no error returned.
    pub fn feed_line(&mut self, line: &str, stats: &ClientStats) {
        if !has_any_sentinel(line) {
            return;
        }

        if let Some(caps) = opening_re().captures(line) {
            let url = caps.get(1).map(|m| m.as_str()).unwrap_or("");
            match classify_url(url) {
                OpenKind::Manifest => stats.increment_manifest_requests(),
                OpenKind::Init => stats.increment_init_requests(),
                OpenKind::Segment => {
                    stats.increment_segment_requests();
                    self.in_flight_segments
                        .push_back((url.to_string(), Instant::now()));
                }
                OpenKind::Unknown => stats.increment_unknown_requests(),
            }
            return;
        }

        if let Some(caps) = http_error_re().captures(line) {
            if let Some(code) = caps.get(1).and_then(|m| m.as_str().parse::<u16>().ok()) {
                stats.record_http_error(code);
            }
            return;
        }

        if line.contains("Reconnecting") {
            stats.record_reconnection();
            return;
        }

        if is_timeout_phrase(line) {
            stats.record_timeout();
            return;
        }

        if sequence_skip_re().is_match(line) {
            stats.increment_sequence_skips();
        }
    }

    /// Called once per closed progress record (see [`crate::ProgressParser`]):
    /// pops the oldest in-flight segment request and feeds its wall time
    /// into the client's latency digest. A no-op if nothing is in flight.
    pub fn complete_oldest_segment(&mut self, stats: &ClientStats) {
        if let Some((_, started_at)) = self.in_flight_segments.pop_front() {
            stats.record_segment_wall_time(started_at.elapsed());
        }
    }

    /// Drop and count as timeouts any in-flight segment older than
    /// [`IN_FLIGHT_SWEEP_AGE`]. Should be called periodically (e.g. from
    /// the same cadence as progress-record processing).
    pub fn sweep_stale(&mut self, stats: &ClientStats, now: Instant) {
        while let Some((_, started_at)) = self.in_flight_segments.front() {
            if now.saturating_duration_since(*started_at) > IN_FLIGHT_SWEEP_AGE {
                self.in_flight_segments.pop_front();
                stats.record_timeout();
            } else {
                break;
            }
        }
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight_segments.len()
    }
}

fn has_any_sentinel(line: &str) -> bool {
    line.contains("Opening")
        || line.contains("Server returned")
        || line.contains("Reconnecting")
        || line.contains("timed out")
        || line.contains("Timeout")
        || line.contains("sequence")
        || line.contains("discontinuity")
        || line.contains("skipping segment")
}

fn is_timeout_phrase(line: &str) -> bool {
    line.contains("Operation timed out")
        || line.contains("Connection timed out")
        || line.contains("Read timed out")
        || line.contains("Timeout expired")
        || (line.contains("timed out") && !line.contains("Reconnecting"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_by_extension() {
        assert_eq!(classify_url("https://cdn/live/index.m3u8"), OpenKind::Manifest);
        assert_eq!(classify_url("https://cdn/live/seg-001.ts"), OpenKind::Segment);
        assert_eq!(classify_url("https://cdn/live/init.mp4"), OpenKind::Init);
        assert_eq!(classify_url("https://cdn/live/seg-001.ts?token=x"), OpenKind::Segment);
        assert_eq!(classify_url("https://cdn/live/weird"), OpenKind::Unknown);
    }

    #[test]
    fn manifest_open_increments_counter() {
        let stats = ClientStats::new(1);
        let mut parser = EventParser::new();
        parser.feed_line("[https @ 0x1] Opening 'https://cdn/live/index.m3u8' for reading", &stats);
        assert_eq!(stats.summary().manifest_requests, 1);
    }

    #[test]
    fn segment_open_tracks_in_flight_and_completes() {
        let stats = ClientStats::new(1);
        let mut parser = EventParser::new();
        parser.feed_line("Opening 'https://cdn/live/seg-001.ts' for reading", &stats);
        assert_eq!(parser.in_flight_count(), 1);
        parser.complete_oldest_segment(&stats);
        assert_eq!(parser.in_flight_count(), 0);
        assert_eq!(stats.latency_percentiles().count, 1);
    }

    #[test]
    fn http_error_is_recorded() {
        let stats = ClientStats::new(1);
        let mut parser = EventParser::new();
        parser.feed_line("HTTP error: Server returned 404 Not Found", &stats);
        assert_eq!(stats.http_errors().get(&404), Some(&1));
    }

    #[test]
    fn reconnect_and_timeout_phrases() {
        let stats = ClientStats::new(1);
        let mut parser = EventParser::new();
        parser.feed_line("Reconnecting at 1234567 in 2 second(s)", &stats);
        parser.feed_line("Operation timed out after 30000 milliseconds", &stats);
        let summary = stats.summary();
        assert_eq!(summary.reconnections, 1);
        assert_eq!(summary.timeouts, 1);
    }

    #[test]
    fn unrecognized_lines_are_ignored() {
        let stats = ClientStats::new(1);
        let mut parser = EventParser::new();
        parser.feed_line("ffmpeg version 6.0 Copyright (c) 2000-2023", &stats);
        let summary = stats.summary();
        assert_eq!(summary.manifest_requests, 0);
        assert_eq!(summary.total_http_errors, 0);
    }

    #[test]
    fn stale_in_flight_segments_are_swept_as_timeouts() {
        let stats = ClientStats::new(1);
        let mut parser = EventParser::new();
        parser
            .in_flight_segments
            .push_back(("seg".to_string(), Instant::now() - Duration::from_secs(120)));
        parser.sweep_stale(&stats, Instant::now());
        assert_eq!(parser.in_flight_count(), 0);
        assert_eq!(stats.summary().timeouts, 1);
    }

    #[test]
    fn sequence_skip_is_counted() {
        let stats = ClientStats::new(1);
        let mut parser = EventParser::new();
        parser.feed_line("Media sequence jumped forward, discontinuity detected", &stats);
        assert_eq!(stats.summary().sequence_skips, 1);
    }
}
