use crate::error::{CampaignError, Result};
use crate::lead::is_valid_email;
use crate::warmup::WarmupSchedule;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CampaignConfig {
    pub from_address: String,
    pub from_name: String,
    pub reply_to: Option<String>,
    pub leads_path: String,
    pub ledger_path: String,
    /// Week number to maximum sends per day.
    pub warmup_schedule: WarmupSchedule,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_bounce_rate: f64,
    /// Fixed daily cap that replaces the warmup table entirely.
    pub daily_email_limit_override: Option<u32>,
    pub tracking_base_url: Option<String>,
    pub delivery: DeliveryConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    pub api_key: Option<String>,
    pub api_base_url: String,
    pub timeout_seconds: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_base_url: crate::delivery::resend::DEFAULT_API_BASE_URL.to_string(),
            timeout_seconds: 30,
        }
    }
}

impl Default for CampaignConfig {
    fn default() -> Self {
        CampaignConfig {
            from_address: "outreach@example.com".to_string(),
            from_name: "Outreach Team".to_string(),
            reply_to: None,
            leads_path: "leads.json".to_string(),
            ledger_path: "/var/lib/outreach/campaign.db".to_string(),
            warmup_schedule: WarmupSchedule::default(),
            min_delay_ms: 45_000,
            max_delay_ms: 120_000,
            max_bounce_rate: 0.03,
            daily_email_limit_override: None,
            tracking_base_url: None,
            delivery: DeliveryConfig::default(),
        }
    }
}

impl CampaignConfig {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: CampaignConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Apply `OUTREACH_*` environment overrides on top of the file values.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = lookup("OUTREACH_API_KEY").or_else(|| lookup("RESEND_API_KEY")) {
            self.delivery.api_key = Some(key);
        }
        if let Some(from) = lookup("OUTREACH_FROM_ADDRESS") {
            self.from_address = from;
        }
        if let Some(limit) = lookup("OUTREACH_DAILY_LIMIT_OVERRIDE") {
            let limit = limit.trim().parse::<u32>().map_err(|_| {
                CampaignError::config(format!(
                    "OUTREACH_DAILY_LIMIT_OVERRIDE must be a non-negative integer, got {limit:?}"
                ))
            })?;
            self.daily_email_limit_override = Some(limit);
        }
        Ok(())
    }

    /// Validate everything a run depends on. Credentials are only required
    /// when mail will actually be sent.
    pub fn validate(&self, require_credentials: bool) -> Result<()> {
        if !is_valid_email(&self.from_address) {
            return Err(CampaignError::config(format!(
                "from_address is not a valid email address: {:?}",
                self.from_address
            )));
        }
        if self.daily_email_limit_override.is_none() {
            self.warmup_schedule.validate()?;
        }
        if self.min_delay_ms > self.max_delay_ms {
            return Err(CampaignError::config(format!(
                "min_delay_ms ({}) exceeds max_delay_ms ({})",
                self.min_delay_ms, self.max_delay_ms
            )));
        }
        if !(0.0..=1.0).contains(&self.max_bounce_rate) {
            return Err(CampaignError::config(format!(
                "max_bounce_rate must be within [0, 1], got {}",
                self.max_bounce_rate
            )));
        }
        if self.delivery.timeout_seconds == 0 {
            return Err(CampaignError::config(
                "delivery.timeout_seconds must be greater than zero",
            ));
        }
        if require_credentials
            && self
                .delivery
                .api_key
                .as_deref()
                .map_or(true, |k| k.trim().is_empty())
        {
            return Err(CampaignError::config(
                "missing delivery credentials: set delivery.api_key or OUTREACH_API_KEY",
            ));
        }
        Ok(())
    }

    /// Today's allowed sends: the override when set, otherwise the warmup table.
    pub fn daily_quota(&self, start: NaiveDate, today: NaiveDate) -> u32 {
        match self.daily_email_limit_override {
            Some(limit) => limit,
            None => self.warmup_schedule.quota_for_day(start, today),
        }
    }

    pub fn delay_range(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.min_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_secs(self.delivery.timeout_seconds)
    }

    /// `Name <address>` as used in the From header.
    pub fn from_header(&self) -> String {
        if self.from_name.is_empty() {
            self.from_address.clone()
        } else {
            format!("{} <{}>", self.from_name, self.from_address)
        }
    }
}
