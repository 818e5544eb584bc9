use std::env;
use std::time::Duration;

const DEFAULT_API_BASE: &str = "http://localhost:8000";
const DEFAULT_PARALLEL_LIMIT: usize = 3;
const DEFAULT_COMPLETED_GRACE_MS: u64 = 3000;
const DEFAULT_DISPLAY_NAME_MAX: usize = 40;

#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub api_base: String,
    /// Upload jobs allowed in flight at once.
    pub parallel_limit: usize,
    /// How long a completed task stays visible; `None` keeps it until dismissed.
    pub completed_grace: Option<Duration>,
    pub zip_streaming: bool,
    pub serialize_destinations: bool,
    pub session_cookie: Option<String>,
    pub display_name_max: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            parallel_limit: DEFAULT_PARALLEL_LIMIT,
            completed_grace: Some(Duration::from_millis(DEFAULT_COMPLETED_GRACE_MS)),
            zip_streaming: true,
            serialize_destinations: true,
            session_cookie: None,
            display_name_max: DEFAULT_DISPLAY_NAME_MAX,
        }
    }
}

impl TransferConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let grace_ms = read_u64(&lookup, "GFWEB_COMPLETED_GRACE_MS", DEFAULT_COMPLETED_GRACE_MS);
        Self {
            api_base: lookup("GFWEB_API_BASE")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            parallel_limit: read_limit(&lookup, "GFWEB_PARALLEL_LIMIT", DEFAULT_PARALLEL_LIMIT),
            completed_grace: (grace_ms > 0).then(|| Duration::from_millis(grace_ms)),
            zip_streaming: read_bool(&lookup, "GFWEB_ZIP_STREAMING", true),
            serialize_destinations: read_bool(&lookup, "GFWEB_SERIALIZE_DESTINATIONS", true),
            session_cookie: lookup("GFWEB_SESSION_COOKIE").filter(|v| !v.is_empty()),
            display_name_max: DEFAULT_DISPLAY_NAME_MAX,
        }
    }

    pub fn with_parallel_limit(mut self, limit: usize) -> Self {
        self.parallel_limit = limit.max(1);
        self
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }
}

fn read_limit<F: Fn(&str) -> Option<String>>(lookup: &F, name: &str, default: usize) -> usize {
    lookup(name)
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

fn read_u64<F: Fn(&str) -> Option<String>>(lookup: &F, name: &str, default: u64) -> u64 {
    lookup(name)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn read_bool<F: Fn(&str) -> Option<String>>(lookup: &F, name: &str, default: bool) -> bool {
    lookup(name)
        .map(|v| v.trim().to_ascii_lowercase())
        .and_then(|v| match v.as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        })
        .unwrap_or(default)
}
