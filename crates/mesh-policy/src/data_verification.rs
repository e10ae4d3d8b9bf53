use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::PolicyError;

/// Placeholder written over credentials in agreement documents
pub const OBSCURED_PASSWORD: &str = "********";

/// Metering time unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Min,
    Hour,
    Day,
}

impl TimeUnit {
    /// How many of this unit fit in a day
    fn per_day(&self) -> u64 {
        match self {
            TimeUnit::Min => 1440,
            TimeUnit::Hour => 24,
            TimeUnit::Day => 1,
        }
    }
}

/// Token metering attached to data verification
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meter {
    /// Tokens per time unit
    #[serde(default)]
    pub tokens: u64,

    /// Unit the token count applies to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_time_unit: Option<TimeUnit>,

    /// Seconds between metering notifications
    #[serde(rename = "notification_interval", default)]
    pub notification_interval: u64,
}

impl Meter {
    pub fn is_empty(&self) -> bool {
        *self == Meter::default()
    }

    /// Tokens and unit come together; a notification interval needs both
    pub fn is_valid(&self) -> bool {
        let has_tokens = self.tokens != 0;
        let has_unit = self.per_time_unit.is_some();
        if has_tokens != has_unit {
            return false;
        }
        !(self.notification_interval != 0 && !has_tokens)
    }

    fn tokens_per_day(&self) -> u64 {
        self.per_time_unit
            .map(|unit| self.tokens.saturating_mul(unit.per_day()))
            .unwrap_or(0)
    }

    /// Whether `offer` pays at least the rate this meter requires
    pub fn is_satisfied_by(&self, offer: &Meter) -> bool {
        if self.is_empty() || offer.is_empty() {
            return true;
        }
        offer.tokens_per_day() >= self.tokens_per_day()
    }

    /// Combined meter for an agreement. Both sides are assumed valid and compatible.
    pub fn merge_with(&self, other: &Meter, check_rate: u64) -> Meter {
        if self.is_empty() && other.is_empty() {
            return Meter::default();
        }

        let units = [self.per_time_unit, other.per_time_unit];
        let unit = if units.contains(&Some(TimeUnit::Day)) {
            TimeUnit::Day
        } else if units.contains(&Some(TimeUnit::Hour)) {
            TimeUnit::Hour
        } else {
            TimeUnit::Min
        };

        let per_day = if other.is_empty() {
            self.tokens_per_day()
        } else {
            other.tokens_per_day()
        };

        let shorter = self.notification_interval.min(other.notification_interval);
        let longer = self.notification_interval.max(other.notification_interval);
        let notification_interval = if longer == 0 {
            check_rate.max(10)
        } else if shorter == 0 {
            longer
        } else {
            shorter
        };

        Meter {
            tokens: per_day / unit.per_day(),
            per_time_unit: Some(unit),
            notification_interval,
        }
    }
}

/// Data receipt verification settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataVerification {
    /// Whether verification is on
    #[serde(default)]
    pub enabled: bool,

    /// Verification endpoint
    #[serde(rename = "URL", default)]
    pub url: String,

    /// User for the verification endpoint
    #[serde(rename = "URLUser", default)]
    pub url_user: String,

    /// Password for the verification endpoint
    #[serde(rename = "URLPassword", default)]
    pub url_password: String,

    /// Seconds without data before giving up
    #[serde(default)]
    pub interval: u64,

    /// Seconds between checks
    #[serde(default)]
    pub check_rate: u64,

    /// Token metering
    #[serde(default, skip_serializing_if = "Meter::is_empty")]
    pub metering: Meter,
}

impl DataVerification {
    pub fn new(url: impl Into<String>, user: impl Into<String>, password: impl Into<String>, interval: u64) -> Self {
        Self {
            enabled: true,
            url: url.into(),
            url_user: user.into(),
            url_password: password.into(),
            interval,
            ..Default::default()
        }
    }

    /// Whether a policy declares any data verification at all
    pub fn is_declared(&self) -> bool {
        *self != DataVerification::default()
    }

    /// Equality excluding the password
    pub fn is_same(&self, other: &DataVerification) -> bool {
        self.enabled == other.enabled
            && self.url == other.url
            && self.url_user == other.url_user
            && self.interval == other.interval
    }

    /// Replace a set password with the placeholder
    pub fn obscure(&mut self) {
        if !self.url_password.is_empty() {
            self.url_password = OBSCURED_PASSWORD.to_string();
        }
    }

    pub fn is_valid(&self) -> Result<(), PolicyError> {
        if !self.metering.is_valid() {
            return Err(PolicyError::DataVerification(format!("metering is not valid: {:?}", self.metering)));
        }
        if self.interval != 0 && self.check_rate != 0 && self.interval < self.check_rate {
            return Err(PolicyError::DataVerification(format!(
                "interval {} is shorter than check rate {}",
                self.interval, self.check_rate
            )));
        }
        Ok(())
    }
}

impl fmt::Display for DataVerification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "enabled: {}, URL: {}, user: {}, interval: {}",
            self.enabled, self.url, self.url_user, self.interval
        )
    }
}
