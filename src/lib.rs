pub mod breaker;
pub mod compose;
pub mod config;
pub mod delivery;
pub mod dispatch;
pub mod error;
pub mod lead;
pub mod ledger;
pub mod operator;
pub mod warmup;

pub use breaker::{BounceBreaker, BreakerStatus};
pub use config::CampaignConfig;
pub use delivery::{DeliveryError, DeliveryPort, OutboundMessage};
pub use dispatch::{Dispatcher, RunOutcome, RunReport};
pub use error::CampaignError;
pub use lead::{Lead, LeadStore};
pub use ledger::{CampaignStats, Ledger, LedgerLock, SendOutcome};
pub use warmup::WarmupSchedule;
