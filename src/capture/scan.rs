//! Parser for `iw dev <iface> scan` dumps.

/// One BSS seen in a scan.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanResult {
    pub bssid: String,
    /// Empty for hidden networks.
    pub ssid: String,
    /// Signal level in dBm.
    pub signal_dbm: Option<f64>,
    pub frequency_mhz: Option<u32>,
}

impl ScanResult {
    fn new(bssid: &str) -> Self {
        Self {
            bssid: bssid.to_lowercase(),
            ssid: String::new(),
            signal_dbm: None,
            frequency_mhz: None,
        }
    }
}

/// Decode a scan dump into one record per BSS.
///
/// Each record starts at a `BSS aa:bb:cc:dd:ee:ff(on wlan2)` line; the
/// indented `SSID:`, `freq:` and `signal:` lines that follow fill it in.
pub fn parse_scan_results(output: &str) -> Vec<ScanResult> {
    let mut results = Vec::new();
    let mut current: Option<ScanResult> = None;

    for line in output.lines() {
        if let Some(bssid) = parse_bss_line(line) {
            if let Some(done) = current.take() {
                results.push(done);
            }
            current = Some(ScanResult::new(bssid));
            continue;
        }

        let Some(entry) = current.as_mut() else {
            continue;
        };
        let Some((key, value)) = line.trim().split_once(':') else {
            continue;
        };
        let value = value.trim();

        match key {
            "SSID" => entry.ssid = value.to_string(),
            "freq" => {
                // Newer iw prints fractional MHz, e.g. "5180.0".
                let whole = value.split('.').next().unwrap_or(value);
                entry.frequency_mhz = whole.parse().ok();
            }
            "signal" => {
                entry.signal_dbm = value
                    .split_whitespace()
                    .next()
                    .and_then(|level| level.parse().ok());
            }
            _ => {}
        }
    }

    if let Some(done) = current {
        results.push(done);
    }
    results
}

/// Extract the BSSID from a record header line.
fn parse_bss_line(line: &str) -> Option<&str> {
    let rest = line.strip_prefix("BSS ")?;
    let bssid = rest.get(..17)?;
    let parts: Vec<&str> = bssid.split(':').collect();
    if parts.len() != 6 {
        return None;
    }
    if !parts
        .iter()
        .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()))
    {
        return None;
    }
    Some(bssid)
}
