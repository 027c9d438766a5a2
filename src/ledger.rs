//! Durable campaign ledger backed by SQLite.
//!
//! `send_outcomes` is append-only and its `seq` column is the audit order of
//! send attempts. Bounces, replies and opens learned after the fact go into
//! the append-only `annotations` table; an outcome's effective flags are its
//! own flags OR any annotation for the same email. `campaign_state` holds
//! the start date and a cached [`CampaignStats`] row.

use crate::error::{CampaignError, Result};
use crate::lead::normalize_email;
use crate::warmup::week_for_day;
use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// One attempted send. At most one exists per email for the life of a
/// campaign; the dispatcher's candidate filter guarantees that, the ledger
/// does not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendOutcome {
    pub email: String,
    pub sent_at: DateTime<FixedOffset>,
    pub message_id: Option<String>,
    pub tracking_id: String,
    pub bounced: bool,
    pub replied: bool,
    pub opened: bool,
}

impl SendOutcome {
    pub fn delivered(
        email: &str,
        sent_at: DateTime<FixedOffset>,
        message_id: String,
        tracking_id: String,
    ) -> Self {
        Self {
            email: normalize_email(email),
            sent_at,
            message_id: Some(message_id),
            tracking_id,
            bounced: false,
            replied: false,
            opened: false,
        }
    }

    pub fn bounced(email: &str, sent_at: DateTime<FixedOffset>, tracking_id: String) -> Self {
        Self {
            email: normalize_email(email),
            sent_at,
            message_id: None,
            tracking_id,
            bounced: true,
            replied: false,
            opened: false,
        }
    }
}

/// Cached summary, always recomputable from the ledger tables.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CampaignStats {
    pub start_date: Option<NaiveDate>,
    pub total_sent: u64,
    pub total_bounced: u64,
    pub total_replied: u64,
    pub total_opened: u64,
    pub current_week: u32,
    pub last_updated: Option<DateTime<Utc>>,
}

impl CampaignStats {
    pub fn bounce_rate(&self) -> f64 {
        if self.total_sent == 0 {
            0.0
        } else {
            self.total_bounced as f64 / self.total_sent as f64
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnotationKind {
    Bounce,
    Reply,
    Open,
}

impl AnnotationKind {
    fn as_str(self) -> &'static str {
        match self {
            AnnotationKind::Bounce => "bounce",
            AnnotationKind::Reply => "reply",
            AnnotationKind::Open => "open",
        }
    }
}

const OUTCOME_COLUMNS: &str = "o.email, o.sent_at, o.message_id, o.tracking_id,
    o.bounced OR EXISTS (SELECT 1 FROM annotations a WHERE a.kind = 'bounce' AND a.email = o.email),
    o.replied OR EXISTS (SELECT 1 FROM annotations a WHERE a.kind = 'reply' AND a.email = o.email),
    o.opened OR EXISTS (SELECT 1 FROM annotations a WHERE a.kind = 'open' AND a.email = o.email)";

pub struct Ledger {
    conn: Connection,
    path: Option<PathBuf>,
}

impl Ledger {
    /// Open (or create) the ledger. Existing rows are never truncated.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        let ledger = Self {
            conn,
            path: Some(path.to_path_buf()),
        };
        ledger.init_database()?;
        Ok(ledger)
    }

    /// Open an existing ledger read-only. `None` when no ledger file exists
    /// yet; nothing is created on disk.
    pub fn open_read_only<P: AsRef<Path>>(path: P) -> Result<Option<Self>> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(None);
        }
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        Ok(Some(Self {
            conn,
            path: Some(path.to_path_buf()),
        }))
    }

    pub fn open_in_memory() -> Result<Self> {
        let ledger = Self {
            conn: Connection::open_in_memory()?,
            path: None,
        };
        ledger.init_database()?;
        Ok(ledger)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn init_database(&self) -> Result<()> {
        // WAL + FULL sync: an INSERT that returns is on disk.
        let _mode: String = self
            .conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        self.conn.execute_batch(
            "PRAGMA synchronous = FULL;

            CREATE TABLE IF NOT EXISTS send_outcomes (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                email TEXT NOT NULL,
                sent_at TEXT NOT NULL,
                sent_on TEXT NOT NULL,
                message_id TEXT,
                tracking_id TEXT NOT NULL,
                bounced INTEGER NOT NULL DEFAULT 0,
                replied INTEGER NOT NULL DEFAULT 0,
                opened INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_send_outcomes_email ON send_outcomes(email);
            CREATE INDEX IF NOT EXISTS idx_send_outcomes_sent_on ON send_outcomes(sent_on);
            CREATE INDEX IF NOT EXISTS idx_send_outcomes_tracking ON send_outcomes(tracking_id);

            CREATE TABLE IF NOT EXISTS annotations (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,
                email TEXT NOT NULL,
                recorded_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_annotations_email ON annotations(email);

            CREATE TABLE IF NOT EXISTS campaign_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                start_date TEXT,
                total_sent INTEGER NOT NULL DEFAULT 0,
                total_bounced INTEGER NOT NULL DEFAULT 0,
                total_replied INTEGER NOT NULL DEFAULT 0,
                total_opened INTEGER NOT NULL DEFAULT 0,
                current_week INTEGER NOT NULL DEFAULT 1,
                last_updated TEXT
            );
            INSERT OR IGNORE INTO campaign_state (id) VALUES (1);",
        )?;
        Ok(())
    }

    /// Append one outcome. The row is committed before this returns.
    pub fn append(&self, outcome: &SendOutcome) -> Result<()> {
        self.conn.execute(
            "INSERT INTO send_outcomes
                (email, sent_at, sent_on, message_id, tracking_id, bounced, replied, opened)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                normalize_email(&outcome.email),
                outcome.sent_at,
                outcome.sent_at.date_naive(),
                outcome.message_id,
                outcome.tracking_id,
                outcome.bounced,
                outcome.replied,
                outcome.opened,
            ],
        )?;
        Ok(())
    }

    /// Every outcome in attempt order, with annotations folded in.
    pub fn all(&self) -> Result<Vec<SendOutcome>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {OUTCOME_COLUMNS} FROM send_outcomes o ORDER BY o.seq"
        ))?;
        let outcomes = stmt
            .query_map([], |row| {
                Ok(SendOutcome {
                    email: row.get(0)?,
                    sent_at: row.get(1)?,
                    message_id: row.get(2)?,
                    tracking_id: row.get(3)?,
                    bounced: row.get(4)?,
                    replied: row.get(5)?,
                    opened: row.get(6)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(outcomes)
    }

    /// Outcomes whose `sent_at` falls on `date` in the sender's local calendar.
    pub fn count_sent_today(&self, date: NaiveDate) -> Result<u32> {
        let count: u32 = self.conn.query_row(
            "SELECT COUNT(*) FROM send_outcomes WHERE sent_on = ?1",
            params![date],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Every email with an outcome, bounced or not.
    pub fn contacted(&self) -> Result<HashSet<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT email FROM send_outcomes")?;
        let emails = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<HashSet<_>, _>>()?;
        Ok(emails)
    }

    /// Emails excluded from all future batches because they bounced.
    pub fn bounce_list(&self) -> Result<HashSet<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT email FROM send_outcomes WHERE bounced = 1
             UNION
             SELECT email FROM annotations WHERE kind = 'bounce'",
        )?;
        let emails = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<HashSet<_>, _>>()?;
        Ok(emails)
    }

    pub fn has_outcome(&self, email: &str) -> Result<bool> {
        let found: bool = self.conn.query_row(
            "SELECT EXISTS (SELECT 1 FROM send_outcomes WHERE email = ?1)",
            params![normalize_email(email)],
            |row| row.get(0),
        )?;
        Ok(found)
    }

    pub fn email_for_tracking_id(&self, tracking_id: &str) -> Result<Option<String>> {
        let email = self
            .conn
            .query_row(
                "SELECT email FROM send_outcomes WHERE tracking_id = ?1",
                params![tracking_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(email)
    }

    pub fn annotate(&self, kind: AnnotationKind, email: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO annotations (kind, email, recorded_at) VALUES (?1, ?2, ?3)",
            params![kind.as_str(), normalize_email(email), Utc::now()],
        )?;
        log::info!("Recorded {} for {}", kind.as_str(), normalize_email(email));
        Ok(())
    }

    /// Mark an opened outcome by the tracking id the open pixel carried.
    pub fn record_open(&self, tracking_id: &str) -> Result<String> {
        let email = self
            .email_for_tracking_id(tracking_id)?
            .ok_or_else(|| CampaignError::UnknownLead(tracking_id.to_string()))?;
        self.annotate(AnnotationKind::Open, &email)?;
        Ok(email)
    }

    pub fn start_date(&self) -> Result<Option<NaiveDate>> {
        let start = self.conn.query_row(
            "SELECT start_date FROM campaign_state WHERE id = 1",
            [],
            |row| row.get(0),
        )?;
        Ok(start)
    }

    /// Record `today` as the campaign start unless one is already set.
    pub fn ensure_start_date(&self, today: NaiveDate) -> Result<NaiveDate> {
        self.conn.execute(
            "UPDATE campaign_state SET start_date = ?1 WHERE id = 1 AND start_date IS NULL",
            params![today],
        )?;
        Ok(self.start_date()?.unwrap_or(today))
    }

    /// Derive [`CampaignStats`] from the tables without writing anything.
    pub fn compute_stats(&self, today: NaiveDate) -> Result<CampaignStats> {
        let outcomes = self.all()?;
        let start_date = self.start_date()?;
        Ok(CampaignStats {
            start_date,
            total_sent: outcomes.len() as u64,
            total_bounced: outcomes.iter().filter(|o| o.bounced).count() as u64,
            total_replied: outcomes.iter().filter(|o| o.replied).count() as u64,
            total_opened: outcomes.iter().filter(|o| o.opened).count() as u64,
            current_week: start_date.map_or(1, |start| week_for_day(start, today)),
            last_updated: Some(Utc::now()),
        })
    }

    /// Recompute [`CampaignStats`] and persist the cache row.
    pub fn refresh_stats(&self, today: NaiveDate) -> Result<CampaignStats> {
        let stats = self.compute_stats(today)?;

        self.conn.execute(
            "UPDATE campaign_state SET
                total_sent = ?1, total_bounced = ?2, total_replied = ?3, total_opened = ?4,
                current_week = ?5, last_updated = ?6
             WHERE id = 1",
            params![
                stats.total_sent,
                stats.total_bounced,
                stats.total_replied,
                stats.total_opened,
                stats.current_week,
                stats.last_updated,
            ],
        )?;
        Ok(stats)
    }

    /// The cached stats row as last persisted.
    pub fn stats(&self) -> Result<CampaignStats> {
        let stats = self.conn.query_row(
            "SELECT start_date, total_sent, total_bounced, total_replied, total_opened,
                    current_week, last_updated
             FROM campaign_state WHERE id = 1",
            [],
            |row| {
                Ok(CampaignStats {
                    start_date: row.get(0)?,
                    total_sent: row.get(1)?,
                    total_bounced: row.get(2)?,
                    total_replied: row.get(3)?,
                    total_opened: row.get(4)?,
                    current_week: row.get(5)?,
                    last_updated: row.get(6)?,
                })
            },
        )?;
        Ok(stats)
    }
}

/// Exclusive advisory lock on `<ledger>.lock`, held for the lifetime of a
/// dispatch run. Released when dropped.
#[derive(Debug)]
pub struct LedgerLock {
    _file: File,
    path: PathBuf,
}

impl LedgerLock {
    pub fn acquire<P: AsRef<Path>>(ledger_path: P) -> Result<Self> {
        let mut lock_path = ledger_path.as_ref().as_os_str().to_owned();
        lock_path.push(".lock");
        let path = PathBuf::from(lock_path);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;

        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
            if rc != 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::WouldBlock {
                    return Err(CampaignError::AlreadyRunning(path));
                }
                return Err(err.into());
            }
        }

        #[cfg(not(unix))]
        {
            log::warn!("Advisory ledger locking not supported on this platform");
        }

        log::debug!("Acquired ledger lock: {}", path.display());
        Ok(Self { _file: file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
