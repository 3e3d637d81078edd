//! Subscription connection options and the wire duration format.
//!
//! [`SubscriptionOptions`] is the immutable configuration a worker is created
//! with. It doubles as the `SubscriptionConnectionOptions` wire object: the
//! server expects PascalCase keys and durations rendered as time-span strings
//! (`HH:MM:SS.fff`), which the `timespan` serde helpers produce.
//!
//! # Example
//!
//! ```
//! use docwire_client::options::{SubscriptionOptions, SubscriptionStrategy};
//! use std::time::Duration;
//!
//! let options = SubscriptionOptions::builder("orders-feed")
//!     .strategy(SubscriptionStrategy::WaitForFree)
//!     .max_docs_per_batch(512)
//!     .time_to_wait_before_connection_retry(Duration::from_secs(2))
//!     .build()
//!     .unwrap();
//! assert_eq!(options.subscription_name, "orders-feed");
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SubscriptionError};

/// How the server arbitrates between clients competing for one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriptionStrategy {
    /// Connect only if no other client holds the subscription.
    OpenIfFree,
    /// Force-disconnect the current holder and take the subscription.
    TakeOver,
    /// Block server-side until the current holder releases it.
    WaitForFree,
    /// Share the subscription with other concurrent clients.
    Concurrent,
}

/// Immutable per-worker configuration, also serialized to the server after
/// protocol negotiation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct SubscriptionOptions {
    /// Name of the server-side subscription to open. Never empty.
    pub subscription_name: String,
    /// Delay between reconnect attempts.
    #[serde(with = "timespan")]
    pub time_to_wait_before_connection_retry: Duration,
    /// Swallow listener errors instead of failing the worker.
    pub ignore_subscriber_errors: bool,
    /// Arbitration strategy for competing clients.
    pub strategy: SubscriptionStrategy,
    /// Upper bound on documents per pushed batch.
    pub max_docs_per_batch: u32,
    /// Longest tolerated streak of failed reconnects before the worker
    /// gives up fatally.
    #[serde(with = "timespan")]
    pub max_erroneous_period: Duration,
    /// Ask the server to close the subscription once the collection is
    /// exhausted instead of idling.
    pub close_when_no_docs_left: bool,
    /// Client-side payload schema selector: each item carries a
    /// current/previous revision pair instead of a single document.
    #[serde(skip, default)]
    pub with_revisions: bool,
}

impl SubscriptionOptions {
    /// Start building options for the named subscription.
    pub fn builder(subscription_name: impl Into<String>) -> SubscriptionOptionsBuilder {
        SubscriptionOptionsBuilder::new(subscription_name)
    }
}

/// Builder for [`SubscriptionOptions`].
///
/// `build()` validates what the server would otherwise reject mid-handshake:
/// an empty subscription name or a zero batch size.
#[derive(Debug, Clone)]
pub struct SubscriptionOptionsBuilder {
    subscription_name: String,
    strategy: SubscriptionStrategy,
    max_docs_per_batch: u32,
    time_to_wait_before_connection_retry: Duration,
    max_erroneous_period: Duration,
    ignore_subscriber_errors: bool,
    close_when_no_docs_left: bool,
    with_revisions: bool,
}

impl SubscriptionOptionsBuilder {
    fn new(subscription_name: impl Into<String>) -> Self {
        Self {
            subscription_name: subscription_name.into(),
            strategy: SubscriptionStrategy::OpenIfFree,
            max_docs_per_batch: 4096,
            time_to_wait_before_connection_retry: Duration::from_secs(5),
            max_erroneous_period: Duration::from_secs(5 * 60),
            ignore_subscriber_errors: false,
            close_when_no_docs_left: false,
            with_revisions: false,
        }
    }

    /// Set the arbitration strategy (default `OpenIfFree`).
    pub fn strategy(mut self, strategy: SubscriptionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Set the per-batch document cap (default 4096).
    pub fn max_docs_per_batch(mut self, max: u32) -> Self {
        self.max_docs_per_batch = max;
        self
    }

    /// Set the reconnect delay (default 5 s).
    pub fn time_to_wait_before_connection_retry(mut self, delay: Duration) -> Self {
        self.time_to_wait_before_connection_retry = delay;
        self
    }

    /// Set the maximum erroneous window (default 5 min).
    pub fn max_erroneous_period(mut self, period: Duration) -> Self {
        self.max_erroneous_period = period;
        self
    }

    /// Log and swallow listener errors instead of failing the worker.
    pub fn ignore_subscriber_errors(mut self, ignore: bool) -> Self {
        self.ignore_subscriber_errors = ignore;
        self
    }

    /// Ask the server to close the subscription once no documents remain.
    pub fn close_when_no_docs_left(mut self, close: bool) -> Self {
        self.close_when_no_docs_left = close;
        self
    }

    /// Receive revision pairs instead of single documents.
    pub fn with_revisions(mut self, revisions: bool) -> Self {
        self.with_revisions = revisions;
        self
    }

    /// Validate and produce the options.
    pub fn build(self) -> Result<SubscriptionOptions> {
        if self.subscription_name.is_empty() {
            return Err(SubscriptionError::InvalidOperation(
                "subscription name cannot be empty".to_string(),
            ));
        }
        if self.max_docs_per_batch == 0 {
            return Err(SubscriptionError::InvalidOperation(
                "max_docs_per_batch must be positive".to_string(),
            ));
        }
        Ok(SubscriptionOptions {
            subscription_name: self.subscription_name,
            strategy: self.strategy,
            max_docs_per_batch: self.max_docs_per_batch,
            time_to_wait_before_connection_retry: self.time_to_wait_before_connection_retry,
            max_erroneous_period: self.max_erroneous_period,
            ignore_subscriber_errors: self.ignore_subscriber_errors,
            close_when_no_docs_left: self.close_when_no_docs_left,
            with_revisions: self.with_revisions,
        })
    }
}

/// Render a duration as a server time-span string (`HH:MM:SS.fff`).
///
/// Hours grow past two digits for durations over a day; the server parses
/// both forms.
pub fn format_timespan(d: Duration) -> String {
    let total_secs = d.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    format!(
        "{:02}:{:02}:{:02}.{:03}",
        hours,
        minutes,
        seconds,
        d.subsec_millis()
    )
}

/// Parse a server time-span string back into a duration.
///
/// Accepts `HH:MM:SS` with an optional fractional-seconds suffix.
pub fn parse_timespan(s: &str) -> Option<Duration> {
    let (hms, frac) = match s.split_once('.') {
        Some((hms, frac)) => (hms, Some(frac)),
        None => (s, None),
    };

    let mut parts = hms.split(':');
    let hours: u64 = parts.next()?.parse().ok()?;
    let minutes: u64 = parts.next()?.parse().ok()?;
    let seconds: u64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() || minutes >= 60 || seconds >= 60 {
        return None;
    }

    let millis = match frac {
        // "5" means 500ms, "05" 50ms: pad/truncate to milliseconds.
        Some(frac) => {
            let digits: String = frac.chars().take(3).collect();
            if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
                return None;
            }
            let padded = format!("{digits:0<3}");
            padded.parse::<u64>().ok()?
        }
        None => 0,
    };

    let secs = hours * 3600 + minutes * 60 + seconds;
    Some(Duration::from_secs(secs) + Duration::from_millis(millis))
}

/// Serde adapter for duration fields carried as time-span strings.
pub mod timespan {
    use super::{format_timespan, parse_timespan};
    use serde::{de, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_timespan(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(deserializer)?;
        parse_timespan(&s)
            .ok_or_else(|| de::Error::custom(format!("invalid time-span string: {s:?}")))
    }
}
