//! Runtime configuration.
//!
//! # Environment Variables
//!
//! | Field | Variable | Default |
//! |-------|----------|---------|
//! | `max_teams` | `FERROTEAM_MAX_TEAMS` | 64 |
//! | `check_args` | `FERROTEAM_CHECK_ARGS` | `true` |
//! | `recv_timeout` | `FERROTEAM_RECV_TIMEOUT_MS` | none (`0` = none) |

use std::env;
use std::time::Duration;

/// Default registry capacity, `Team::WORLD` included.
pub const DEFAULT_MAX_TEAMS: usize = 64;

/// Tunables shared by the registry, the split engine and the local transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Maximum number of live teams per PE, `Team::WORLD` included.
    pub max_teams: usize,
    /// Verify that every PE passed the same shared split parameters.
    ///
    /// Costs one all-gather per strided or cartesian split. When off, such
    /// splits need no communication and mismatched arguments are undefined.
    pub check_args: bool,
    /// Upper bound on a single blocking receive in [`LocalTransport`](crate::LocalTransport).
    pub recv_timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_teams: DEFAULT_MAX_TEAMS,
            check_args: true,
            recv_timeout: None,
        }
    }
}

impl Config {
    /// Defaults overridden by any `FERROTEAM_*` variables that are set and parse.
    pub fn from_env() -> Self {
        let defaults = Config::default();
        Config {
            max_teams: env::var("FERROTEAM_MAX_TEAMS")
                .ok()
                .and_then(|s| s.trim().parse().ok())
                .filter(|&n| n >= 1)
                .unwrap_or(defaults.max_teams),
            check_args: env::var("FERROTEAM_CHECK_ARGS")
                .ok()
                .and_then(|s| parse_bool(&s))
                .unwrap_or(defaults.check_args),
            recv_timeout: env::var("FERROTEAM_RECV_TIMEOUT_MS")
                .ok()
                .and_then(|s| s.trim().parse().ok())
                .filter(|&ms| ms > 0)
                .map(Duration::from_millis)
                .or(defaults.recv_timeout),
        }
    }

    /// Builder-style setter for [`max_teams`](Self::max_teams).
    pub fn with_max_teams(mut self, max_teams: usize) -> Self {
        self.max_teams = max_teams;
        self
    }

    /// Builder-style setter for [`check_args`](Self::check_args).
    pub fn with_check_args(mut self, check_args: bool) -> Self {
        self.check_args = check_args;
        self
    }

    /// Builder-style setter for [`recv_timeout`](Self::recv_timeout).
    pub fn with_recv_timeout(mut self, timeout: Duration) -> Self {
        self.recv_timeout = Some(timeout);
        self
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
