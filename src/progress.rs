pub fn strip_ansi(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\u{1b}' {
            if chars.peek() == Some(&'[') {
                chars.next();
                for c in chars.by_ref() {
                    if ('@'..='~').contains(&c) {
                        break;
                    }
                }
            }
            continue;
        }
        out.push(c);
    }
    out
}

pub fn parse_timestamp(raw: &str) -> Option<f64> {
    let mut parts = raw.trim().split(':');
    let hours: f64 = parts.next()?.parse().ok()?;
    let minutes: f64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() || hours < 0.0 || minutes < 0.0 || seconds < 0.0 {
        return None;
    }
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

pub fn parse_time_position(line: &str) -> Option<f64> {
    let rest = line.split("time=").nth(1)?;
    let token = rest.split_whitespace().next()?;
    parse_timestamp(token)
}

pub fn parse_duration_line(line: &str) -> Option<f64> {
    let rest = line.trim_start().strip_prefix("Duration:")?;
    let token = rest.trim_start().split([',', ' ']).next()?;
    parse_timestamp(token)
}

pub fn parse_percent(line: &str) -> Option<f64> {
    let cleaned = strip_ansi(line);
    for token in cleaned.split_whitespace() {
        if let Some(number) = token.strip_suffix('%') {
            if let Ok(value) = number.parse::<f64>() {
                if value.is_finite() && (0.0..=100.0).contains(&value) {
                    return Some(value);
                }
            }
        }
    }
    None
}

#[derive(Debug, Clone)]
pub struct ProgressEstimator {
    floor: f64,
    cap: f64,
    total_seconds: Option<f64>,
}

impl ProgressEstimator {
    pub fn new(floor: f64, cap: f64) -> Self {
        Self {
            floor,
            cap: cap.max(floor),
            total_seconds: None,
        }
    }

    pub fn set_total(&mut self, seconds: f64) {
        if seconds.is_finite() && seconds > 0.0 {
            self.total_seconds = Some(seconds);
        }
    }

    pub fn has_total(&self) -> bool {
        self.total_seconds.is_some()
    }

    pub fn estimate(&self, position_seconds: f64) -> f64 {
        match self.total_seconds {
            Some(total) => {
                let fraction = (position_seconds / total).clamp(0.0, 1.0);
                self.floor + fraction * (self.cap - self.floor)
            }
            None => self.floor,
        }
    }

    pub fn from_percent(&self, percent: f64) -> f64 {
        let fraction = (percent / 100.0).clamp(0.0, 1.0);
        self.floor + fraction * (self.cap - self.floor)
    }
}
