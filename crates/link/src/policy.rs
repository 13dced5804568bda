//! Run-policy evaluation.
//!
//! Whether a server's triad should be running is a pure function of its
//! configuration and externally supplied signals.

use serde::{Deserialize, Serialize};

use crate::config::ServerConfig;

/// When a server's connection is allowed to run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPolicy {
    #[default]
    Always,
    WhenScreenOn,
    WhenOnTrustedNetwork,
    Never,
}

/// Host signals sampled by the scheduler before each evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyInputs {
    /// At least one viable network path exists.
    pub network_available: bool,
    /// Name of the current network (SSID), if known.
    pub current_network: Option<String>,
    pub screen_on: bool,
    pub low_power: bool,
}

impl Default for PolicyInputs {
    fn default() -> Self {
        Self {
            network_available: true,
            current_network: None,
            screen_on: true,
            low_power: false,
        }
    }
}

/// Why a server should or should not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Run,
    Disabled,
    PolicyNever,
    NoNetwork,
    LowPower,
    ScreenOff,
    UntrustedNetwork,
}

impl Decision {
    pub fn should_run(self) -> bool {
        self == Self::Run
    }

    pub fn reason(self) -> &'static str {
        match self {
            Self::Run => "allowed",
            Self::Disabled => "disabled in settings",
            Self::PolicyNever => "policy is never",
            Self::NoNetwork => "no network",
            Self::LowPower => "low power mode",
            Self::ScreenOff => "screen off",
            Self::UntrustedNetwork => "not on a trusted network",
        }
    }
}

/// Evaluates the policy, reporting the first constraint that fails.
pub fn evaluate(server: &ServerConfig, inputs: &PolicyInputs) -> Decision {
    if !server.enabled {
        return Decision::Disabled;
    }
    if server.policy == RunPolicy::Never {
        return Decision::PolicyNever;
    }
    if !inputs.network_available {
        return Decision::NoNetwork;
    }
    if inputs.low_power && !server.run_on_low_power {
        return Decision::LowPower;
    }
    match server.policy {
        RunPolicy::WhenScreenOn if !inputs.screen_on => Decision::ScreenOff,
        RunPolicy::WhenOnTrustedNetwork => {
            let trusted = inputs
                .current_network
                .as_ref()
                .is_some_and(|n| server.trusted_networks.iter().any(|t| t == n));
            if trusted {
                Decision::Run
            } else {
                Decision::UntrustedNetwork
            }
        }
        _ => Decision::Run,
    }
}

pub fn should_run(server: &ServerConfig, inputs: &PolicyInputs) -> bool {
    evaluate(server, inputs).should_run()
}
