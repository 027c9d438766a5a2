use crate::error::{CampaignError, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Week-indexed cap on daily sends.
///
/// Weeks are 1-based. A week with no entry uses the closest earlier entry,
/// and anything past the last entry plateaus at the table's maximum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WarmupSchedule {
    weeks: BTreeMap<u32, u32>,
}

impl Default for WarmupSchedule {
    fn default() -> Self {
        Self::from_pairs(&[(1, 15), (2, 25), (3, 40), (4, 60), (5, 80)])
    }
}

impl WarmupSchedule {
    pub fn from_pairs(pairs: &[(u32, u32)]) -> Self {
        Self {
            weeks: pairs.iter().copied().collect(),
        }
    }

    /// Reject tables the scheduler cannot interpret: empty, week 0, or a
    /// limit that drops as weeks increase.
    pub fn validate(&self) -> Result<()> {
        if self.weeks.is_empty() {
            return Err(CampaignError::config("warmup schedule is empty"));
        }
        if self.weeks.contains_key(&0) {
            return Err(CampaignError::config(
                "warmup schedule weeks start at 1, found week 0",
            ));
        }
        let mut previous: Option<(u32, u32)> = None;
        for (&week, &limit) in &self.weeks {
            if let Some((prev_week, prev_limit)) = previous {
                if limit < prev_limit {
                    return Err(CampaignError::config(format!(
                        "warmup schedule must be non-decreasing: week {week} allows {limit}, \
                         below week {prev_week} ({prev_limit})"
                    )));
                }
            }
            previous = Some((week, limit));
        }
        Ok(())
    }

    pub fn max_limit(&self) -> u32 {
        self.weeks.values().copied().max().unwrap_or(0)
    }

    pub fn last_week(&self) -> u32 {
        self.weeks.keys().next_back().copied().unwrap_or(1)
    }

    pub fn limit_for_week(&self, week: u32) -> u32 {
        if week > self.last_week() {
            return self.max_limit();
        }
        self.weeks
            .range(..=week.max(1))
            .next_back()
            .map(|(_, &limit)| limit)
            // Table starts after `week`; the smallest defined limit is the
            // most conservative value available.
            .or_else(|| self.weeks.values().next().copied())
            .unwrap_or(0)
    }

    /// Daily quota for `today` in a campaign that started on `start`.
    pub fn quota_for_day(&self, start: NaiveDate, today: NaiveDate) -> u32 {
        self.limit_for_week(week_for_day(start, today))
    }
}

/// `ceil(days / 7)`, never below week 1. A date before the start counts as
/// week 1.
pub fn week_for_day(start: NaiveDate, today: NaiveDate) -> u32 {
    let days = (today - start).num_days().max(0) as u64;
    (days.div_ceil(7)).max(1) as u32
}
