use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

/// Delay used when a throttling response declares none.
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(1);

/// Rate-limit metadata carried by a response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateLimitInfo {
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
    /// Time until the bucket's budget refills.
    pub reset_after: Option<Duration>,
    /// Server-declared delay before retrying a throttled call.
    pub retry_after: Option<Duration>,
    /// The throttling applies to every bucket, not just this one.
    pub global: bool,
    /// Service-side bucket identifier, kept for diagnostics.
    pub bucket: Option<String>,
}

#[derive(Deserialize)]
struct ThrottleBody {
    retry_after: Option<f64>,
    global: Option<bool>,
}

fn header<'a>(headers: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.trim())
}

fn seconds(value: f64) -> Option<Duration> {
    if value.is_finite() && value >= 0.0 {
        Duration::try_from_secs_f64(value).ok()
    } else {
        None
    }
}

impl RateLimitInfo {
    /// Parse the `X-RateLimit-*` and `Retry-After` headers. Header names are matched
    /// case-insensitively; unparseable values are ignored.
    pub fn from_headers(headers: &HashMap<String, String>) -> Self {
        let number = |name: &str| header(headers, name).and_then(|v| v.parse::<u32>().ok());
        let secs = |name: &str| {
            header(headers, name).and_then(|v| v.parse::<f64>().ok()).and_then(seconds)
        };
        Self {
            limit: number("X-RateLimit-Limit"),
            remaining: number("X-RateLimit-Remaining"),
            reset_after: secs("X-RateLimit-Reset-After"),
            retry_after: secs("Retry-After"),
            global: header(headers, "X-RateLimit-Global")
                .is_some_and(|v| v.eq_ignore_ascii_case("true")),
            bucket: header(headers, "X-RateLimit-Bucket").map(str::to_owned),
        }
    }

    /// Fold in the JSON body of a throttling response, which takes precedence over headers.
    pub fn merge_throttle_body(&mut self, body: &[u8]) {
        let Ok(parsed) = serde_json::from_slice::<ThrottleBody>(body) else {
            return;
        };
        if let Some(delay) = parsed.retry_after.and_then(seconds) {
            self.retry_after = Some(delay);
        }
        if let Some(global) = parsed.global {
            self.global = global;
        }
    }

    /// Delay to wait out after a throttling response.
    pub fn throttle_delay(&self) -> Duration {
        self.retry_after.or(self.reset_after).unwrap_or(DEFAULT_RETRY_AFTER)
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}
