use crate::error::ConfigError;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which puzzle a channel drops from. Persisted as a bare string: a slug, or `any`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PuzzleTarget {
    Any,
    Specific(String),
}

impl From<String> for PuzzleTarget {
    fn from(value: String) -> Self {
        match value.trim().to_lowercase().as_str() {
            "any" | "all" | "*" => PuzzleTarget::Any,
            _ => PuzzleTarget::Specific(value.trim().to_string()),
        }
    }
}

impl From<PuzzleTarget> for String {
    fn from(value: PuzzleTarget) -> Self {
        match value {
            PuzzleTarget::Any => "any".to_string(),
            PuzzleTarget::Specific(slug) => slug,
        }
    }
}

impl fmt::Display for PuzzleTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PuzzleTarget::Any => f.write_str("any"),
            PuzzleTarget::Specific(slug) => f.write_str(slug),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    Timer,
    #[serde(alias = "messages")]
    MessageCount,
}

impl TriggerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerMode::Timer => "timer",
            TriggerMode::MessageCount => "message_count",
        }
    }
}

impl fmt::Display for TriggerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerMode {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "timer" | "time" => Ok(TriggerMode::Timer),
            "message_count" | "message-count" | "messages" => Ok(TriggerMode::MessageCount),
            other => Err(format!("Unknown trigger mode: {other}")),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TriggerParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub low: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub high: Option<u64>,
}

/// A channel's trigger after its raw params have been checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Timer { interval: Duration },
    MessageCount { low: u64, high: u64 },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClaimRange {
    pub min: u32,
    pub max: u32,
}

impl Default for ClaimRange {
    fn default() -> Self {
        Self { min: 1, max: 1 }
    }
}

impl ClaimRange {
    pub fn check(&self, channel: &str) -> Result<(), ConfigError> {
        if self.min == 0 {
            return Err(ConfigError::malformed(channel, "claims_range.min must be >= 1"));
        }
        if self.max < self.min {
            return Err(ConfigError::malformed(
                channel,
                format!("claims_range max {} is below min {}", self.max, self.min),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DropChannelConfig {
    pub puzzle: PuzzleTarget,
    pub mode: TriggerMode,
    #[serde(default)]
    pub trigger_params: TriggerParams,
    #[serde(default)]
    pub message_count: u64,
    #[serde(default)]
    pub next_trigger: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_drop_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub claims_range: ClaimRange,
    #[serde(default)]
    pub count_bot_messages: bool,
}

impl DropChannelConfig {
    pub fn timer(puzzle: PuzzleTarget, interval_secs: u64, claims_range: ClaimRange) -> Self {
        Self {
            puzzle,
            mode: TriggerMode::Timer,
            trigger_params: TriggerParams {
                interval_secs: Some(interval_secs),
                ..TriggerParams::default()
            },
            message_count: 0,
            next_trigger: 0,
            last_drop_time: None,
            claims_range,
            count_bot_messages: false,
        }
    }

    pub fn message_count(
        puzzle: PuzzleTarget,
        low: u64,
        high: u64,
        claims_range: ClaimRange,
    ) -> Self {
        Self {
            puzzle,
            mode: TriggerMode::MessageCount,
            trigger_params: TriggerParams {
                interval_secs: None,
                low: Some(low),
                high: Some(high),
            },
            message_count: 0,
            next_trigger: 0,
            last_drop_time: None,
            claims_range,
            count_bot_messages: false,
        }
    }

    pub fn trigger(&self, channel: &str) -> Result<Trigger, ConfigError> {
        match self.mode {
            TriggerMode::Timer => {
                let secs = self.trigger_params.interval_secs.ok_or_else(|| {
                    ConfigError::malformed(channel, "timer mode needs interval_secs")
                })?;
                if secs == 0 {
                    return Err(ConfigError::malformed(channel, "interval_secs must be > 0"));
                }
                let interval = i64::try_from(secs)
                    .ok()
                    .and_then(Duration::try_seconds)
                    .ok_or_else(|| ConfigError::malformed(channel, "interval_secs too large"))?;
                Ok(Trigger::Timer { interval })
            }
            TriggerMode::MessageCount => {
                let (Some(low), Some(high)) = (self.trigger_params.low, self.trigger_params.high)
                else {
                    return Err(ConfigError::malformed(
                        channel,
                        "message_count mode needs low and high",
                    ));
                };
                if low == 0 {
                    return Err(ConfigError::malformed(channel, "low must be >= 1"));
                }
                if high < low {
                    return Err(ConfigError::malformed(
                        channel,
                        format!("high {high} is below low {low}"),
                    ));
                }
                Ok(Trigger::MessageCount { low, high })
            }
        }
    }

    pub fn validate(&self, channel: &str) -> Result<Trigger, ConfigError> {
        self.claims_range.check(channel)?;
        self.trigger(channel)
    }

    /// A message-count channel with no threshold drawn yet.
    pub fn needs_arming(&self) -> bool {
        self.mode == TriggerMode::MessageCount && self.next_trigger == 0
    }

    /// Errors when the next timer deadline falls outside the representable date range.
    pub fn is_due(
        &self,
        channel: &str,
        trigger: &Trigger,
        now: DateTime<Utc>,
    ) -> Result<bool, ConfigError> {
        match trigger {
            Trigger::Timer { interval } => match self.last_drop_time {
                None => Ok(true),
                Some(last) => last
                    .checked_add_signed(*interval)
                    .map(|next| now >= next)
                    .ok_or_else(|| ConfigError::malformed(channel, "interval_secs too large")),
            },
            Trigger::MessageCount { .. } => {
                Ok(self.next_trigger > 0 && self.message_count >= self.next_trigger)
            }
        }
    }

    /// Advances trigger state after a confirmed spawn. `delta` is ignored in timer mode.
    pub fn record_spawn(&mut self, trigger: &Trigger, now: DateTime<Utc>, delta: u64) {
        match trigger {
            Trigger::Timer { .. } => {
                self.last_drop_time = Some(now);
            }
            Trigger::MessageCount { .. } => {
                self.next_trigger = self.message_count.saturating_add(delta.max(1));
                self.last_drop_time = Some(now);
            }
        }
    }
}
