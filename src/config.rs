use std::time::Duration;

/// Runtime tunables, read from `FINCH_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// Upper bound for a blocking `SendDataToNode` write.
    pub send_timeout: Duration,
    /// Period between discovery polls while a scan runs.
    pub scan_interval: Duration,
    /// Weight kept from the previous frame for smoothed outputs, in [0..1).
    pub smoothing: f32,
    /// Vendor id the HID transport filters on. `None` accepts any device
    /// whose product string names a Finch node.
    pub hid_vendor_id: Option<u16>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_millis(1000),
            scan_interval: Duration::from_millis(100),
            smoothing: 0.5,
            hid_vendor_id: None,
        }
    }
}

impl Settings {
    /// Defaults overridden by whatever `FINCH_*` variables are set.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let smoothing = read_env_f32("FINCH_SMOOTHING", defaults.smoothing);
        let smoothing = if (0.0..1.0).contains(&smoothing) {
            smoothing
        } else {
            log::warn!(
                "FINCH_SMOOTHING={} out of range [0, 1), using {}",
                smoothing,
                defaults.smoothing
            );
            defaults.smoothing
        };

        let settings = Self {
            send_timeout: Duration::from_millis(read_env_u64(
                "FINCH_SEND_TIMEOUT_MS",
                defaults.send_timeout.as_millis() as u64,
            )),
            scan_interval: Duration::from_millis(
                read_env_u64(
                    "FINCH_SCAN_INTERVAL_MS",
                    defaults.scan_interval.as_millis() as u64,
                )
                .max(1),
            ),
            smoothing,
            hid_vendor_id: read_env_hex_u16("FINCH_HID_VENDOR_ID"),
        };
        log::debug!("Finch settings: {:?}", settings);
        settings
    }
}

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn read_env_u64(name: &str, default: u64) -> u64 {
    match read_env_string(name) {
        Some(v) => v.parse::<u64>().unwrap_or_else(|_| {
            log::warn!("Invalid {}='{}', using {}", name, v, default);
            default
        }),
        None => default,
    }
}

fn read_env_f32(name: &str, default: f32) -> f32 {
    match read_env_string(name) {
        Some(v) => v.parse::<f32>().unwrap_or_else(|_| {
            log::warn!("Invalid {}='{}', using {}", name, v, default);
            default
        }),
        None => default,
    }
}

/// Accepts `0x1234`, `1234` (hex) forms.
fn read_env_hex_u16(name: &str) -> Option<u16> {
    let v = read_env_string(name)?;
    let digits = v.trim_start_matches("0x").trim_start_matches("0X");
    match u16::from_str_radix(digits, 16) {
        Ok(id) => Some(id),
        Err(_) => {
            log::warn!("Invalid {}='{}', ignoring", name, v);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let s = Settings::default();
        assert_eq!(s.send_timeout, Duration::from_secs(1));
        assert_eq!(s.scan_interval, Duration::from_millis(100));
        assert!(s.hid_vendor_id.is_none());
    }

    #[test]
    fn test_env_overrides() {
        // Variable names unique to this test so parallel tests are unaffected.
        std::env::set_var("FINCH_TEST_HEX", "0x2f3a");
        assert_eq!(read_env_hex_u16("FINCH_TEST_HEX"), Some(0x2f3a));
        std::env::set_var("FINCH_TEST_HEX", "zz");
        assert_eq!(read_env_hex_u16("FINCH_TEST_HEX"), None);

        std::env::set_var("FINCH_TEST_U64", " 250 ");
        assert_eq!(read_env_u64("FINCH_TEST_U64", 7), 250);
        std::env::set_var("FINCH_TEST_U64", "abc");
        assert_eq!(read_env_u64("FINCH_TEST_U64", 7), 7);
        assert_eq!(read_env_f32("FINCH_TEST_UNSET_F32", 0.25), 0.25);
    }
}
