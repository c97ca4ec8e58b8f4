use serde::Serialize;

/// Hook invoked after every state transition of a driver
pub type StateObserver<S> = Box<dyn Fn(&S) + Send + Sync>;

const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];

/// Render a byte count the way the device panel does (`1.5 KB`, `2 MB`)
pub fn format_bytes(bytes: u64) -> String {
    if bytes == 0 {
        return "0 B".to_string();
    }

    let mut unit = 0;
    while unit + 1 < UNITS.len() && bytes >= 1024u64.pow(unit as u32 + 1) {
        unit += 1;
    }

    let value = bytes as f64 / 1024u64.pow(unit as u32) as f64;
    let value = format!("{value:.2}");
    let value = value.trim_end_matches('0').trim_end_matches('.');

    format!("{value} {}", UNITS[unit])
}

/// Coarse signal quality buckets used for scan results and link status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalQuality {
    Excellent,
    Good,
    Fair,
    Weak,
}

impl SignalQuality {
    pub fn from_rssi(rssi: i32) -> Self {
        match rssi {
            r if r >= -50 => SignalQuality::Excellent,
            r if r >= -60 => SignalQuality::Good,
            r if r >= -70 => SignalQuality::Fair,
            _ => SignalQuality::Weak,
        }
    }
}

impl std::fmt::Display for SignalQuality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalQuality::Excellent => write!(f, "excellent"),
            SignalQuality::Good => write!(f, "good"),
            SignalQuality::Fair => write!(f, "fair"),
            SignalQuality::Weak => write!(f, "weak"),
        }
    }
}
