use loadtest_stats::ClientStats;

/// Accumulates `key=value` fields from an ffmpeg `-progress` stream and
/// applies them to a [`ClientStats`] once a `progress=continue`/`progress=end`
/// terminator line closes out the record.
///
/// Field extraction mirrors a plain find-and-slice style rather than a
/// generic key/value map: each progress record carries a small, fixed set
/// of fields and this avoids allocating a map per line.
#[derive(Debug, Default)]
pub struct ProgressParser {
    total_size: Option<u64>,
    out_time_us: Option<u64>,
    speed: Option<f64>,
}

impl ProgressParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line of the progress stream. Malformed lines are silently
    /// ignored; this parser never returns an error to its caller.
    pub fn feed_line(&mut self, line: &str, stats: &ClientStats) {
        let Some((key, value)) = line.split_once('=') else {
            return;
        };
        let key = key.trim();
        let value = value.trim();

        match key {
            "total_size" => {
                // "N/A" is expected for live streams with no known final size.
                if let Ok(v) = value.parse::<u64>() {
                    self.total_size = Some(v);
                }
            }
            "out_time_us" => {
                if let Ok(v) = value.parse::<u64>() {
                    self.out_time_us = Some(v);
                }
            }
            "speed" => {
                if value == "N/A" {
                    self.speed = Some(0.0);
                } else if let Some(mult) = value.strip_suffix('x') {
                    if let Ok(v) = mult.trim().parse::<f64>() {
                        self.speed = Some(v);
                    }
                }
            }
            "progress" => {
                self.apply(stats);
                self.reset();
            }
            _ => {}
        }
    }

    fn apply(&self, stats: &ClientStats) {
        if let Some(total) = self.total_size {
            stats.update_current_bytes(total);
        }
        if let Some(out_time) = self.out_time_us {
            stats.update_drift(out_time);
        }
        if let Some(speed) = self.speed {
            stats.update_speed(speed);
        }
    }

    fn reset(&mut self) {
        self.total_size = None;
        self.out_time_us = None;
        self.speed = None;
    }
}
