//! Host signals read from the environment.
//!
//! The daemon stands in for a platform scheduler, so network and power state
//! come from variables an init script or wrapper keeps current:
//!
//! - `TETHER_NETWORK`: `0`/`false`/`off` means no usable network
//! - `TETHER_SSID`: current network name
//! - `TETHER_SCREEN_ON`: defaults to on
//! - `TETHER_LOW_POWER`: defaults to off

use tether_link::PolicyInputs;

pub fn from_env() -> PolicyInputs {
    from_lookup(|key| std::env::var(key).ok())
}

fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> PolicyInputs {
    let flag = |key: &str, default: bool| lookup(key).and_then(|v| parse_flag(&v)).unwrap_or(default);
    PolicyInputs {
        network_available: flag("TETHER_NETWORK", true),
        current_network: lookup("TETHER_SSID").filter(|s| !s.is_empty()),
        screen_on: flag("TETHER_SCREEN_ON", true),
        low_power: flag("TETHER_LOW_POWER", false),
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn inputs(vars: &[(&str, &str)]) -> PolicyInputs {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        assert_eq!(inputs(&[]), PolicyInputs::default());
    }

    #[test]
    fn reads_all_signals() {
        let got = inputs(&[
            ("TETHER_NETWORK", "off"),
            ("TETHER_SSID", "home"),
            ("TETHER_SCREEN_ON", "0"),
            ("TETHER_LOW_POWER", "YES"),
        ]);
        assert!(!got.network_available);
        assert_eq!(got.current_network.as_deref(), Some("home"));
        assert!(!got.screen_on);
        assert!(got.low_power);
    }

    #[test]
    fn garbage_falls_back_to_default() {
        let got = inputs(&[("TETHER_NETWORK", "maybe"), ("TETHER_SSID", "")]);
        assert!(got.network_available);
        assert!(got.current_network.is_none());
    }
}
