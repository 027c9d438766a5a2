//! The dispatch loop: one sequential pass over today's batch.
//!
//! ```text
//! IDLE -> CHECKING_BREAKER -> SELECTING_CANDIDATES -> SENDING
//!      -> (COOLING_DOWN -> SENDING)* -> DONE | HALTED | CANCELLED
//! ```
//!
//! Every attempt that reaches the provider is appended to the ledger before
//! the next one starts. Shutdown is observed while a send is in flight and
//! during the cooldown sleep; an in-flight send is always allowed to finish
//! and be recorded first.

use crate::breaker::{BounceBreaker, BreakerStatus};
use crate::compose::{MessageComposer, SubjectRotation};
use crate::config::CampaignConfig;
use crate::delivery::{DeliveryError, DeliveryPort, OutboundMessage};
use crate::error::{CampaignError, Result};
use crate::lead::{Lead, LeadStore};
use crate::ledger::{CampaignStats, Ledger, SendOutcome};
use chrono::{DateTime, FixedOffset, Local, NaiveDate};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Local>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

/// Always reports the same instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Local>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Local> {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DispatchState {
    Idle,
    CheckingBreaker,
    SelectingCandidates,
    Sending,
    CoolingDown,
    Done,
    Halted,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DoneReason {
    /// Today's quota was already used up before this run.
    QuotaReached,
    /// Every lead has been contacted or bounced.
    NoCandidates,
    BatchSent,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum RunOutcome {
    Done(DoneReason),
    /// The bounce breaker is open. A designed stop, not a failure.
    Halted { bounce_rate: f64 },
    Cancelled,
}

/// What a run would send right now.
#[derive(Debug, Clone, Serialize)]
pub struct BatchPlan {
    pub today: NaiveDate,
    pub start_date: NaiveDate,
    pub quota: u32,
    pub sent_today: u32,
    pub remaining_quota: u32,
    pub candidates: usize,
    pub batch: Vec<Lead>,
    pub breaker: BreakerStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub quota: u32,
    pub sent_today_before: u32,
    pub sent: u32,
    pub bounced: u32,
    pub transient_failures: u32,
    pub stats: CampaignStats,
}

impl RunReport {
    fn new(outcome: RunOutcome, stats: CampaignStats) -> Self {
        Self {
            outcome,
            quota: 0,
            sent_today_before: 0,
            sent: 0,
            bounced: 0,
            transient_failures: 0,
            stats,
        }
    }

    fn with_quota(mut self, plan: &BatchPlan) -> Self {
        self.quota = plan.quota;
        self.sent_today_before = plan.sent_today;
        self
    }

    /// Outcomes appended during this run.
    pub fn appended(&self) -> u32 {
        self.sent + self.bounced
    }
}

pub struct Dispatcher<'a> {
    config: &'a CampaignConfig,
    leads: &'a LeadStore,
    ledger: &'a Ledger,
    port: Arc<dyn DeliveryPort>,
    composer: Box<dyn MessageComposer>,
    clock: Box<dyn Clock>,
    breaker: BounceBreaker,
    rng: StdRng,
    delivery_timeout: Duration,
    state: DispatchState,
}

impl<'a> Dispatcher<'a> {
    pub fn new(
        config: &'a CampaignConfig,
        leads: &'a LeadStore,
        ledger: &'a Ledger,
        port: Arc<dyn DeliveryPort>,
    ) -> Self {
        Self {
            config,
            leads,
            ledger,
            port,
            composer: Box::new(SubjectRotation::new(
                &config.from_name,
                config.tracking_base_url.clone(),
            )),
            clock: Box::new(SystemClock),
            breaker: BounceBreaker::new(config.max_bounce_rate),
            rng: StdRng::from_entropy(),
            delivery_timeout: config.delivery_timeout(),
            state: DispatchState::Idle,
        }
    }

    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = rng;
        self
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn with_composer(mut self, composer: impl MessageComposer + 'static) -> Self {
        self.composer = Box::new(composer);
        self
    }

    pub fn with_delivery_timeout(mut self, timeout: Duration) -> Self {
        self.delivery_timeout = timeout;
        self
    }

    pub fn state(&self) -> DispatchState {
        self.state
    }

    fn transition(&mut self, next: DispatchState) {
        log::debug!("Dispatch state {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Breaker check plus candidate selection, without touching the ledger.
    pub fn plan(&self) -> Result<BatchPlan> {
        plan(
            self.config,
            self.leads,
            self.ledger,
            self.clock.now().date_naive(),
        )
    }

    /// Execute one dispatch pass.
    ///
    /// `shutdown` flips to `true` when the process is asked to stop. A
    /// dropped sender is treated as "never cancel".
    pub async fn run(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<RunReport> {
        let today = self.clock.now().date_naive();

        self.config.validate(false)?;
        if self.leads.is_empty() {
            return Err(CampaignError::config("lead store is empty"));
        }

        self.transition(DispatchState::CheckingBreaker);
        let status = self.breaker.check(&self.ledger.all()?);
        if let BreakerStatus::Open { bounce_rate } = status {
            log::error!(
                "Bounce rate {:.2}% exceeds {:.2}%, halting before any send",
                bounce_rate * 100.0,
                self.breaker.max_bounce_rate() * 100.0
            );
            return self.finish(DispatchState::Halted, RunOutcome::Halted { bounce_rate }, today);
        }

        self.transition(DispatchState::SelectingCandidates);
        let start_date = self.ledger.ensure_start_date(today)?;
        let plan = plan_batch(self.config, self.leads, self.ledger, today, start_date)?;
        log::info!(
            "Campaign day {} (start {}): quota {}, sent today {}, {} candidates",
            today,
            start_date,
            plan.quota,
            plan.sent_today,
            plan.candidates
        );

        if plan.remaining_quota == 0 {
            log::info!("Daily limit of {} reached, try again tomorrow", plan.quota);
            return self
                .finish(DispatchState::Done, RunOutcome::Done(DoneReason::QuotaReached), today)
                .map(|report| report.with_quota(&plan));
        }
        if plan.batch.is_empty() {
            log::info!("No uncontacted leads remain");
            return self
                .finish(DispatchState::Done, RunOutcome::Done(DoneReason::NoCandidates), today)
                .map(|report| report.with_quota(&plan));
        }

        let mut report = RunReport::new(
            RunOutcome::Done(DoneReason::BatchSent),
            CampaignStats::default(),
        )
        .with_quota(&plan);
        let last = plan.batch.len() - 1;

        for (index, lead) in plan.batch.iter().enumerate() {
            if *shutdown.borrow() {
                log::warn!("Shutdown requested before sending to {}", lead.email);
                return self.finish_with(
                    report,
                    DispatchState::Cancelled,
                    RunOutcome::Cancelled,
                    today,
                );
            }
            self.transition(DispatchState::Sending);
            let (result, cancel_requested) = self.send_one(lead, shutdown).await;
            let sent_at: DateTime<FixedOffset> = self.clock.now().into();

            let mut halt = None;
            match result {
                Ok((tracking_id, receipt)) => {
                    self.ledger.append(&SendOutcome::delivered(
                        &lead.email,
                        sent_at,
                        receipt.provider_message_id.clone(),
                        tracking_id.clone(),
                    ))?;
                    report.sent += 1;
                    log::info!(
                        "Sent to {} ({}/{}) message={} tracking={}",
                        lead.email,
                        index + 1,
                        plan.batch.len(),
                        receipt.provider_message_id,
                        tracking_id
                    );
                }
                Err((tracking_id, error)) if error.is_bounce() => {
                    self.ledger
                        .append(&SendOutcome::bounced(&lead.email, sent_at, tracking_id))?;
                    report.bounced += 1;
                    log::warn!("Bounce for {}: {}", lead.email, error);

                    if let BreakerStatus::Open { bounce_rate } =
                        self.breaker.check(&self.ledger.all()?)
                    {
                        log::error!(
                            "Bounce rate {:.2}% exceeds {:.2}% mid-run, halting",
                            bounce_rate * 100.0,
                            self.breaker.max_bounce_rate() * 100.0
                        );
                        halt = Some(bounce_rate);
                    }
                }
                Err((_, error)) => {
                    report.transient_failures += 1;
                    log::warn!(
                        "Failed to send to {}, will retry next run: {}",
                        lead.email,
                        error
                    );
                }
            }

            report.stats = self.ledger.refresh_stats(today)?;

            if cancel_requested {
                log::warn!("Shutdown requested, stopping after in-flight send");
                return self.finish_with(
                    report,
                    DispatchState::Cancelled,
                    RunOutcome::Cancelled,
                    today,
                );
            }
            if let Some(bounce_rate) = halt {
                return self.finish_with(
                    report,
                    DispatchState::Halted,
                    RunOutcome::Halted { bounce_rate },
                    today,
                );
            }

            if index < last {
                self.transition(DispatchState::CoolingDown);
                let delay = self.jitter();
                log::debug!("Cooling down for {:?}", delay);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancelled(shutdown) => {
                        log::warn!("Shutdown requested during cooldown");
                        return self.finish_with(
                            report,
                            DispatchState::Cancelled,
                            RunOutcome::Cancelled,
                            today,
                        );
                    }
                }
            }
        }

        log::info!(
            "Batch complete: {} sent, {} bounced, {} transient failures",
            report.sent,
            report.bounced,
            report.transient_failures
        );
        self.finish_with(
            report,
            DispatchState::Done,
            RunOutcome::Done(DoneReason::BatchSent),
            today,
        )
    }

    /// Render and send one message. The second value reports whether
    /// shutdown was requested while the send was in flight.
    async fn send_one(
        &mut self,
        lead: &Lead,
        shutdown: &mut watch::Receiver<bool>,
    ) -> (
        std::result::Result<(String, crate::delivery::DeliveryReceipt), (String, DeliveryError)>,
        bool,
    ) {
        let tracking_id = uuid::Uuid::new_v4().to_string();
        let (subject, body_html) = self.composer.compose(lead, &tracking_id, &mut self.rng);
        let message = OutboundMessage {
            to: lead.email.clone(),
            subject,
            body_html,
            tracking_id: tracking_id.clone(),
        };

        let timeout = self.delivery_timeout;
        let port = Arc::clone(&self.port);
        let send = async {
            match tokio::time::timeout(timeout, port.send(&message)).await {
                Ok(result) => result,
                Err(_) => Err(DeliveryError::Timeout(timeout)),
            }
        };
        tokio::pin!(send);

        let mut cancel_requested = false;
        let result = tokio::select! {
            biased;
            result = &mut send => result,
            _ = cancelled(shutdown) => {
                cancel_requested = true;
                log::warn!("Shutdown requested, waiting for in-flight send to {}", lead.email);
                send.await
            }
        };

        let result = match result {
            Ok(receipt) => Ok((tracking_id, receipt)),
            Err(error) => Err((tracking_id, error)),
        };
        (result, cancel_requested)
    }

    fn jitter(&mut self) -> Duration {
        let (min, max) = self.config.delay_range();
        if max <= min {
            return min;
        }
        let millis = self
            .rng
            .gen_range(min.as_millis() as u64..=max.as_millis() as u64);
        Duration::from_millis(millis)
    }

    fn finish(
        &mut self,
        state: DispatchState,
        outcome: RunOutcome,
        today: NaiveDate,
    ) -> Result<RunReport> {
        self.finish_with(RunReport::new(outcome, CampaignStats::default()), state, outcome, today)
    }

    fn finish_with(
        &mut self,
        mut report: RunReport,
        state: DispatchState,
        outcome: RunOutcome,
        today: NaiveDate,
    ) -> Result<RunReport> {
        report.outcome = outcome;
        report.stats = self.ledger.refresh_stats(today)?;
        self.transition(state);
        Ok(report)
    }
}

/// What a run would send on `today`, without a delivery port and without
/// writing. A campaign that has not started yet is planned as starting today.
pub fn plan(
    config: &CampaignConfig,
    leads: &LeadStore,
    ledger: &Ledger,
    today: NaiveDate,
) -> Result<BatchPlan> {
    let start_date = ledger.start_date()?.unwrap_or(today);
    plan_batch(config, leads, ledger, today, start_date)
}

fn plan_batch(
    config: &CampaignConfig,
    leads: &LeadStore,
    ledger: &Ledger,
    today: NaiveDate,
    start_date: NaiveDate,
) -> Result<BatchPlan> {
    let breaker = BounceBreaker::new(config.max_bounce_rate).check(&ledger.all()?);
    let quota = config.daily_quota(start_date, today);
    let sent_today = ledger.count_sent_today(today)?;
    let remaining_quota = quota.saturating_sub(sent_today);

    let contacted = ledger.contacted()?;
    let bounced = ledger.bounce_list()?;
    let candidates: Vec<&Lead> = leads
        .iter()
        .filter(|lead| {
            let key = lead.key();
            !contacted.contains(&key) && !bounced.contains(&key)
        })
        .collect();

    let batch = if breaker.is_open() {
        Vec::new()
    } else {
        candidates
            .iter()
            .take(remaining_quota as usize)
            .map(|lead| (*lead).clone())
            .collect()
    };

    Ok(BatchPlan {
        today,
        start_date,
        quota,
        sent_today,
        remaining_quota,
        candidates: candidates.len(),
        batch,
        breaker,
    })
}

/// Resolves once shutdown has been signalled; never resolves if the sender
/// is gone without signalling.
async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::{ScriptedDelivery, ScriptedResponse};
    use crate::ledger::AnnotationKind;
    use crate::warmup::WarmupSchedule;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use std::collections::HashMap;

    fn leads(n: usize) -> LeadStore {
        LeadStore::from_leads(
            (0..n)
                .map(|i| {
                    Lead::new(
                        &format!("lead{i}@clinic{i}.com"),
                        "Dr",
                        &format!("Clinic {i}"),
                        "Leeds",
                    )
                })
                .collect(),
        )
    }

    fn config() -> CampaignConfig {
        CampaignConfig {
            from_address: "sam@clinicreach.io".to_string(),
            warmup_schedule: WarmupSchedule::from_pairs(&[(1, 15), (2, 25), (3, 40)]),
            min_delay_ms: 0,
            max_delay_ms: 0,
            ..CampaignConfig::default()
        }
    }

    fn day0() -> DateTime<Local> {
        Local.with_ymd_and_hms(2025, 3, 3, 10, 0, 0).unwrap()
    }

    fn on_day(offset: i64) -> FixedClock {
        FixedClock(day0() + ChronoDuration::days(offset))
    }

    fn no_shutdown() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    fn emails(store: &LeadStore, range: std::ops::Range<usize>) -> Vec<String> {
        store
            .iter()
            .skip(range.start)
            .take(range.len())
            .map(|l| l.email.clone())
            .collect()
    }

    fn assert_no_double_send(ledger: &Ledger) {
        let mut counts: HashMap<String, usize> = HashMap::new();
        for outcome in ledger.all().unwrap() {
            *counts.entry(outcome.email).or_default() += 1;
        }
        assert!(counts.values().all(|&c| c == 1), "double send: {counts:?}");
    }

    async fn run_once(
        config: &CampaignConfig,
        store: &LeadStore,
        ledger: &Ledger,
        port: Arc<ScriptedDelivery>,
        clock: FixedClock,
    ) -> RunReport {
        let (_tx, mut rx) = no_shutdown();
        Dispatcher::new(config, store, ledger, port)
            .with_clock(clock)
            .with_rng(StdRng::seed_from_u64(42))
            .run(&mut rx)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_first_run_sends_first_fifteen_in_order() {
        let config = config();
        let store = leads(20);
        let ledger = Ledger::open_in_memory().unwrap();
        let port = Arc::new(ScriptedDelivery::new());

        let report = run_once(&config, &store, &ledger, port.clone(), on_day(0)).await;

        assert_eq!(report.outcome, RunOutcome::Done(DoneReason::BatchSent));
        assert_eq!(report.sent, 15);
        assert_eq!(port.attempted_recipients(), emails(&store, 0..15));

        let recorded: Vec<String> = ledger.all().unwrap().into_iter().map(|o| o.email).collect();
        assert_eq!(recorded, emails(&store, 0..15));
        assert_eq!(report.stats.total_sent, 15);
        assert_eq!(ledger.stats().unwrap().total_sent, 15);
    }

    #[tokio::test]
    async fn test_immediate_rerun_sends_nothing_new() {
        let config = config();
        let store = leads(20);
        let ledger = Ledger::open_in_memory().unwrap();

        let first = run_once(&config, &store, &ledger, Arc::new(ScriptedDelivery::new()), on_day(0)).await;
        let port = Arc::new(ScriptedDelivery::new());
        let second = run_once(&config, &store, &ledger, port.clone(), on_day(0)).await;

        assert!(second.appended() <= first.appended());
        assert_eq!(second.outcome, RunOutcome::Done(DoneReason::QuotaReached));
        assert!(port.attempts().is_empty());
        assert_no_double_send(&ledger);
    }

    #[tokio::test]
    async fn test_following_days_finish_the_list_without_repeats() {
        let config = config();
        let store = leads(20);
        let ledger = Ledger::open_in_memory().unwrap();

        run_once(&config, &store, &ledger, Arc::new(ScriptedDelivery::new()), on_day(0)).await;
        let port = Arc::new(ScriptedDelivery::new());
        let report = run_once(&config, &store, &ledger, port.clone(), on_day(1)).await;
        assert_eq!(report.sent, 5);
        assert_eq!(port.attempted_recipients(), emails(&store, 15..20));

        let report = run_once(&config, &store, &ledger, Arc::new(ScriptedDelivery::new()), on_day(2)).await;
        assert_eq!(report.outcome, RunOutcome::Done(DoneReason::NoCandidates));
        assert_eq!(ledger.all().unwrap().len(), 20);
        assert_no_double_send(&ledger);
    }

    #[tokio::test]
    async fn test_quota_counts_earlier_sends_today() {
        let config = config();
        let store = leads(30);
        let ledger = Ledger::open_in_memory().unwrap();
        let today = on_day(0);
        for i in 0..10 {
            ledger
                .append(&SendOutcome::delivered(
                    &format!("earlier{i}@elsewhere.com"),
                    today.0.into(),
                    format!("m{i}"),
                    format!("t{i}"),
                ))
                .unwrap();
        }

        let report = run_once(&config, &store, &ledger, Arc::new(ScriptedDelivery::new()), today).await;
        assert_eq!(report.sent, 5);
        let count = ledger.count_sent_today(today.0.date_naive()).unwrap();
        assert!(count <= config.daily_quota(today.0.date_naive(), today.0.date_naive()));
        assert_eq!(count, 15);
    }

    #[tokio::test]
    async fn test_warmup_week_two_raises_quota() {
        let config = config();
        let store = leads(60);
        let ledger = Ledger::open_in_memory().unwrap();

        run_once(&config, &store, &ledger, Arc::new(ScriptedDelivery::new()), on_day(0)).await;
        let report = run_once(&config, &store, &ledger, Arc::new(ScriptedDelivery::new()), on_day(8)).await;
        assert_eq!(report.quota, 25);
        assert_eq!(report.sent, 25);
        assert_eq!(report.stats.current_week, 2);
    }

    #[tokio::test]
    async fn test_open_breaker_halts_with_zero_sends() {
        let config = config();
        let store = leads(20);
        let ledger = Ledger::open_in_memory().unwrap();
        let earlier: DateTime<FixedOffset> = on_day(-3).0.into();
        for i in 0..100 {
            let email = format!("old{i}@past.com");
            let outcome = if i < 4 {
                SendOutcome::bounced(&email, earlier, format!("t{i}"))
            } else {
                SendOutcome::delivered(&email, earlier, format!("m{i}"), format!("t{i}"))
            };
            ledger.append(&outcome).unwrap();
        }

        let port = Arc::new(ScriptedDelivery::new());
        let (_tx, mut rx) = no_shutdown();
        let mut dispatcher = Dispatcher::new(&config, &store, &ledger, port.clone()).with_clock(on_day(0));
        let plan = dispatcher.plan().unwrap();
        assert!(plan.breaker.is_open());
        assert!(plan.batch.is_empty());

        let report = dispatcher.run(&mut rx).await.unwrap();
        match report.outcome {
            RunOutcome::Halted { bounce_rate } => assert!((bounce_rate - 0.04).abs() < 1e-9),
            other => panic!("expected halt, got {other:?}"),
        }
        assert_eq!(dispatcher.state(), DispatchState::Halted);
        assert!(port.attempts().is_empty());
        assert_eq!(ledger.all().unwrap().len(), 100);
        assert_eq!(report.stats.total_bounced, 4);
    }

    #[tokio::test]
    async fn test_bounce_is_recorded_and_never_retried() {
        let mut config = config();
        config.max_bounce_rate = 1.0;
        let store = leads(5);
        let ledger = Ledger::open_in_memory().unwrap();
        let port = Arc::new(ScriptedDelivery::new().respond("lead1@clinic1.com", ScriptedResponse::Bounce));

        let report = run_once(&config, &store, &ledger, port, on_day(0)).await;
        assert_eq!((report.sent, report.bounced), (4, 1));
        let outcomes = ledger.all().unwrap();
        assert!(outcomes[1].bounced);
        assert_eq!(outcomes[1].email, "lead1@clinic1.com");
        assert!(ledger.bounce_list().unwrap().contains("lead1@clinic1.com"));

        let port = Arc::new(ScriptedDelivery::new());
        let report = run_once(&config, &store, &ledger, port.clone(), on_day(1)).await;
        assert_eq!(report.outcome, RunOutcome::Done(DoneReason::NoCandidates));
        assert!(port.attempts().is_empty());
    }

    #[tokio::test]
    async fn test_bounce_mid_run_trips_breaker() {
        let config = config();
        let store = leads(10);
        let ledger = Ledger::open_in_memory().unwrap();
        let port = Arc::new(ScriptedDelivery::new().respond("lead2@clinic2.com", ScriptedResponse::Bounce));

        let report = run_once(&config, &store, &ledger, port.clone(), on_day(0)).await;
        assert!(matches!(report.outcome, RunOutcome::Halted { .. }));
        assert_eq!(port.attempts().len(), 3);
        assert_eq!(ledger.all().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_transient_failure_leaves_lead_for_next_run() {
        let config = config();
        let store = leads(3);
        let ledger = Ledger::open_in_memory().unwrap();
        let port = Arc::new(ScriptedDelivery::new().respond("lead0@clinic0.com", ScriptedResponse::Transient));

        let report = run_once(&config, &store, &ledger, port.clone(), on_day(0)).await;
        assert_eq!((report.sent, report.transient_failures), (2, 1));
        // Not retried within the same pass.
        assert_eq!(port.attempts().len(), 3);
        assert!(!ledger.has_outcome("lead0@clinic0.com").unwrap());
        assert_eq!(report.stats.total_bounced, 0);

        let port = Arc::new(ScriptedDelivery::new());
        let report = run_once(&config, &store, &ledger, port.clone(), on_day(1)).await;
        assert_eq!(report.sent, 1);
        assert_eq!(port.attempted_recipients(), vec!["lead0@clinic0.com"]);
    }

    #[tokio::test]
    async fn test_timeout_is_transient() {
        let config = config();
        let store = leads(2);
        let ledger = Ledger::open_in_memory().unwrap();
        let port = Arc::new(ScriptedDelivery::new().respond("lead0@clinic0.com", ScriptedResponse::Hang));
        let (_tx, mut rx) = no_shutdown();

        let report = Dispatcher::new(&config, &store, &ledger, port)
            .with_clock(on_day(0))
            .with_delivery_timeout(Duration::from_millis(50))
            .run(&mut rx)
            .await
            .unwrap();

        assert_eq!((report.sent, report.transient_failures), (1, 1));
        assert!(!ledger.has_outcome("lead0@clinic0.com").unwrap());
        assert!(ledger.has_outcome("lead1@clinic1.com").unwrap());
    }

    #[tokio::test]
    async fn test_shutdown_during_send_records_in_flight_outcome() {
        let config = config();
        let store = leads(5);
        let ledger = Ledger::open_in_memory().unwrap();
        let port = Arc::new(ScriptedDelivery::new().with_latency(Duration::from_millis(200)));
        let (tx, mut rx) = watch::channel(false);
        let mut dispatcher = Dispatcher::new(&config, &store, &ledger, port.clone()).with_clock(on_day(0));

        let (report, _) = tokio::join!(dispatcher.run(&mut rx), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            tx.send(true).unwrap();
        });
        let report = report.unwrap();

        assert_eq!(report.outcome, RunOutcome::Cancelled);
        assert_eq!(port.attempts().len(), 1);
        assert_eq!(report.sent, 1);
        assert!(ledger.has_outcome("lead0@clinic0.com").unwrap());
        assert_eq!(ledger.stats().unwrap().total_sent, 1);
    }

    #[tokio::test]
    async fn test_shutdown_during_cooldown_stops_promptly() {
        let mut config = config();
        config.min_delay_ms = 10_000;
        config.max_delay_ms = 10_000;
        let store = leads(5);
        let ledger = Ledger::open_in_memory().unwrap();
        let port = Arc::new(ScriptedDelivery::new());
        let (tx, mut rx) = watch::channel(false);
        let mut dispatcher = Dispatcher::new(&config, &store, &ledger, port.clone()).with_clock(on_day(0));

        let started = std::time::Instant::now();
        let (report, _) = tokio::join!(dispatcher.run(&mut rx), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            tx.send(true).unwrap();
        });

        assert_eq!(report.unwrap().outcome, RunOutcome::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(port.attempts().len(), 1);
        assert_eq!(ledger.all().unwrap().len(), 1);
        assert_eq!(dispatcher.state(), DispatchState::Cancelled);
    }

    #[tokio::test]
    async fn test_shutdown_before_run_sends_nothing() {
        let config = config();
        let store = leads(2);
        let ledger = Ledger::open_in_memory().unwrap();
        let port = Arc::new(ScriptedDelivery::new());
        let (_tx, mut rx) = watch::channel(true);
        let mut dispatcher =
            Dispatcher::new(&config, &store, &ledger, port.clone()).with_clock(on_day(0));

        let report = dispatcher.run(&mut rx).await.unwrap();

        assert_eq!(report.outcome, RunOutcome::Cancelled);
        assert!(port.attempts().is_empty());
        assert!(ledger.all().unwrap().is_empty());
        assert_eq!(dispatcher.state(), DispatchState::Cancelled);
    }

    #[tokio::test]
    async fn test_decreasing_warmup_table_is_rejected() {
        let mut config = config();
        config.warmup_schedule = WarmupSchedule::from_pairs(&[(1, 30), (2, 10)]);
        let store = leads(2);
        let ledger = Ledger::open_in_memory().unwrap();
        let port = Arc::new(ScriptedDelivery::new());
        let (_tx, mut rx) = no_shutdown();

        let result = Dispatcher::new(&config, &store, &ledger, port.clone())
            .with_clock(on_day(0))
            .run(&mut rx)
            .await;

        assert!(matches!(result, Err(CampaignError::Configuration(_))));
        assert!(port.attempts().is_empty());
        assert_eq!(ledger.start_date().unwrap(), None);
    }

    #[tokio::test]
    async fn test_empty_lead_store_is_rejected() {
        let config = config();
        let store = LeadStore::from_leads(Vec::new());
        let ledger = Ledger::open_in_memory().unwrap();
        let (_tx, mut rx) = no_shutdown();

        let result = Dispatcher::new(&config, &store, &ledger, Arc::new(ScriptedDelivery::new()))
            .with_clock(on_day(0))
            .run(&mut rx)
            .await;

        assert!(matches!(result, Err(CampaignError::Configuration(_))));
    }

    #[test]
    fn test_plan_needs_no_port() {
        let config = config();
        let store = leads(20);
        let ledger = Ledger::open_in_memory().unwrap();
        ledger
            .append(&SendOutcome::delivered(
                "lead0@clinic0.com",
                day0().into(),
                "m0".into(),
                "t0".into(),
            ))
            .unwrap();

        let plan = plan(&config, &store, &ledger, day0().date_naive()).unwrap();
        assert_eq!(plan.sent_today, 1);
        assert_eq!(plan.remaining_quota, 14);
        assert_eq!(plan.candidates, 19);
        assert_eq!(plan.batch[0].email, "lead1@clinic1.com");
    }

    #[tokio::test]
    async fn test_plan_does_not_write() {
        let config = config();
        let store = leads(20);
        let ledger = Ledger::open_in_memory().unwrap();
        let dispatcher = Dispatcher::new(&config, &store, &ledger, Arc::new(ScriptedDelivery::new()))
            .with_clock(on_day(0));

        let plan = dispatcher.plan().unwrap();
        assert_eq!(plan.remaining_quota, 15);
        assert_eq!(plan.candidates, 20);
        assert_eq!(plan.batch.len(), 15);
        assert_eq!(ledger.start_date().unwrap(), None);
        assert!(ledger.all().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_manual_bounce_excludes_unsent_lead() {
        let config = config();
        let store = leads(3);
        let ledger = Ledger::open_in_memory().unwrap();
        ledger.annotate(AnnotationKind::Bounce, "lead0@clinic0.com").unwrap();

        let port = Arc::new(ScriptedDelivery::new());
        run_once(&config, &store, &ledger, port.clone(), on_day(0)).await;
        assert_eq!(port.attempted_recipients(), emails(&store, 1..3));
    }

    #[tokio::test]
    async fn test_seeded_runs_render_identical_subjects() {
        let config = config();
        let store = leads(6);

        let subjects = |port: &ScriptedDelivery| -> Vec<String> {
            port.attempts().into_iter().map(|m| m.subject).collect()
        };

        let port_a = Arc::new(ScriptedDelivery::new());
        run_once(&config, &store, &Ledger::open_in_memory().unwrap(), port_a.clone(), on_day(0)).await;
        let port_b = Arc::new(ScriptedDelivery::new());
        run_once(&config, &store, &Ledger::open_in_memory().unwrap(), port_b.clone(), on_day(0)).await;

        assert_eq!(subjects(port_a.as_ref()), subjects(port_b.as_ref()));
        let tracking: std::collections::HashSet<String> =
            port_a.attempts().into_iter().map(|m| m.tracking_id).collect();
        assert_eq!(tracking.len(), 6);
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let mut config = config();
        config.min_delay_ms = 100;
        config.max_delay_ms = 200;
        let store = leads(1);
        let ledger = Ledger::open_in_memory().unwrap();
        let mut dispatcher = Dispatcher::new(&config, &store, &ledger, Arc::new(ScriptedDelivery::new()))
            .with_rng(StdRng::seed_from_u64(9));

        let delays: Vec<Duration> = (0..50).map(|_| dispatcher.jitter()).collect();
        assert!(delays
            .iter()
            .all(|d| *d >= Duration::from_millis(100) && *d <= Duration::from_millis(200)));
        assert!(delays.iter().any(|d| *d != delays[0]));
    }

    #[tokio::test]
    async fn test_reopened_ledger_resumes_after_restart() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("campaign.db");
        let config = config();
        let store = leads(20);

        {
            let ledger = Ledger::open(&path).unwrap();
            run_once(&config, &store, &ledger, Arc::new(ScriptedDelivery::new()), on_day(0)).await;
        }

        let ledger = Ledger::open(&path).unwrap();
        let port = Arc::new(ScriptedDelivery::new());
        let report = run_once(&config, &store, &ledger, port.clone(), on_day(1)).await;
        assert_eq!(port.attempted_recipients(), emails(&store, 15..20));
        assert_eq!(report.stats.start_date, Some(day0().date_naive()));
        assert_no_double_send(&ledger);
    }
}
