//! Operator-facing commands that read or annotate the ledger without sending.

use crate::breaker::{BounceBreaker, BreakerStatus};
use crate::config::CampaignConfig;
use crate::error::{CampaignError, Result};
use crate::lead::{normalize_email, LeadStore};
use crate::ledger::{AnnotationKind, CampaignStats, Ledger};
use chrono::NaiveDate;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub today: NaiveDate,
    pub stats: CampaignStats,
    pub quota_today: u32,
    pub sent_today: u32,
    pub remaining_today: u32,
    pub breaker: BreakerStatus,
    pub max_bounce_rate: f64,
    /// Leads with no outcome and not bounced; `None` when no lead store was
    /// available.
    pub leads_remaining: Option<usize>,
    pub override_active: bool,
}

/// Ledger-derived campaign status as of `today`. Never writes.
pub fn campaign_status(
    config: &CampaignConfig,
    ledger: &Ledger,
    leads: Option<&LeadStore>,
    today: NaiveDate,
) -> Result<StatusReport> {
    let stats = ledger.compute_stats(today)?;
    let start = stats.start_date.unwrap_or(today);
    let quota_today = config.daily_quota(start, today);
    let sent_today = ledger.count_sent_today(today)?;
    let breaker = BounceBreaker::new(config.max_bounce_rate).check(&ledger.all()?);

    let leads_remaining = match leads {
        Some(store) => {
            let contacted = ledger.contacted()?;
            let bounced = ledger.bounce_list()?;
            Some(
                store
                    .iter()
                    .filter(|l| !contacted.contains(&l.key()) && !bounced.contains(&l.key()))
                    .count(),
            )
        }
        None => None,
    };

    Ok(StatusReport {
        today,
        stats,
        quota_today,
        sent_today,
        remaining_today: quota_today.saturating_sub(sent_today),
        breaker,
        max_bounce_rate: config.max_bounce_rate,
        leads_remaining,
        override_active: config.daily_email_limit_override.is_some(),
    })
}

/// Record a bounce the provider never reported. The email joins the bounce
/// list whether or not it was ever sent to.
pub fn record_bounce(
    ledger: &Ledger,
    leads: Option<&LeadStore>,
    email: &str,
    today: NaiveDate,
) -> Result<CampaignStats> {
    require_known(ledger, leads, email)?;
    ledger.annotate(AnnotationKind::Bounce, email)?;
    ledger.refresh_stats(today)
}

/// Note a reply. Informational only; scheduling ignores it.
pub fn record_reply(ledger: &Ledger, email: &str, today: NaiveDate) -> Result<CampaignStats> {
    if !ledger.has_outcome(email)? {
        return Err(CampaignError::UnknownLead(normalize_email(email)));
    }
    ledger.annotate(AnnotationKind::Reply, email)?;
    ledger.refresh_stats(today)
}

pub fn record_open(ledger: &Ledger, tracking_id: &str, today: NaiveDate) -> Result<String> {
    let email = ledger.record_open(tracking_id)?;
    ledger.refresh_stats(today)?;
    Ok(email)
}

fn require_known(ledger: &Ledger, leads: Option<&LeadStore>, email: &str) -> Result<()> {
    if ledger.has_outcome(email)? || leads.is_some_and(|store| store.contains(email)) {
        Ok(())
    } else {
        Err(CampaignError::UnknownLead(normalize_email(email)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lead::Lead;
    use crate::ledger::SendOutcome;
    use chrono::{FixedOffset, TimeZone};

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, 3).unwrap()
    }

    fn sent(email: &str) -> SendOutcome {
        let at = FixedOffset::east_opt(0)
            .unwrap()
            .with_ymd_and_hms(2025, 3, 3, 9, 0, 0)
            .unwrap();
        SendOutcome::delivered(email, at, "m".into(), format!("trk-{email}"))
    }

    fn store() -> LeadStore {
        LeadStore::from_leads(vec![
            Lead::new("a@x.com", "A", "X", "Hull"),
            Lead::new("b@x.com", "B", "X", "Hull"),
            Lead::new("c@x.com", "C", "X", "Hull"),
        ])
    }

    #[test]
    fn test_status_reflects_ledger() {
        let ledger = Ledger::open_in_memory().unwrap();
        ledger.ensure_start_date(today()).unwrap();
        ledger.append(&sent("a@x.com")).unwrap();
        let store = store();

        let status = campaign_status(&CampaignConfig::default(), &ledger, Some(&store), today()).unwrap();
        assert_eq!(status.stats.total_sent, 1);
        assert_eq!(status.quota_today, 15);
        assert_eq!(status.sent_today, 1);
        assert_eq!(status.remaining_today, 14);
        assert_eq!(status.leads_remaining, Some(2));
        assert!(!status.breaker.is_open());
        assert_eq!(ledger.stats().unwrap().last_updated, None);
    }

    #[test]
    fn test_manual_bounce_can_trip_breaker() {
        let ledger = Ledger::open_in_memory().unwrap();
        ledger.append(&sent("a@x.com")).unwrap();
        ledger.append(&sent("b@x.com")).unwrap();

        let stats = record_bounce(&ledger, None, "B@x.com", today()).unwrap();
        assert_eq!(stats.total_bounced, 1);

        let status = campaign_status(&CampaignConfig::default(), &ledger, None, today()).unwrap();
        assert!(status.breaker.is_open());
        assert_eq!(status.leads_remaining, None);
    }

    #[test]
    fn test_manual_bounce_for_unsent_lead() {
        let ledger = Ledger::open_in_memory().unwrap();
        let store = store();
        record_bounce(&ledger, Some(&store), "c@x.com", today()).unwrap();
        assert!(ledger.bounce_list().unwrap().contains("c@x.com"));
        assert!(matches!(
            record_bounce(&ledger, Some(&store), "zz@x.com", today()),
            Err(CampaignError::UnknownLead(_))
        ));
    }

    #[test]
    fn test_reply_requires_outcome_and_does_not_block() {
        let ledger = Ledger::open_in_memory().unwrap();
        assert!(record_reply(&ledger, "a@x.com", today()).is_err());

        ledger.append(&sent("a@x.com")).unwrap();
        let stats = record_reply(&ledger, "a@x.com", today()).unwrap();
        assert_eq!(stats.total_replied, 1);
        assert!(ledger.bounce_list().unwrap().is_empty());
    }

    #[test]
    fn test_open_by_tracking_id() {
        let ledger = Ledger::open_in_memory().unwrap();
        ledger.append(&sent("a@x.com")).unwrap();
        assert_eq!(record_open(&ledger, "trk-a@x.com", today()).unwrap(), "a@x.com");
        assert_eq!(ledger.stats().unwrap().total_opened, 1);
    }
}
