use crate::error::{CampaignError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::OnceLock;

/// A prospect the campaign may contact. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lead {
    pub email: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub clinic_name: String,
    #[serde(default)]
    pub city: String,
}

impl Lead {
    pub fn new(email: &str, first_name: &str, clinic_name: &str, city: &str) -> Self {
        Self {
            email: email.to_string(),
            first_name: first_name.to_string(),
            clinic_name: clinic_name.to_string(),
            city: city.to_string(),
        }
    }

    /// Case-insensitive identity used by the ledger and bounce list.
    pub fn key(&self) -> String {
        normalize_email(&self.email)
    }
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

fn email_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("static email pattern compiles")
    })
}

pub fn is_valid_email(email: &str) -> bool {
    email_pattern().is_match(email.trim())
}

/// Ordered, de-duplicated list of leads for one run.
///
/// Order is the file order and is what candidate selection walks, so reruns
/// pick the same leads in the same sequence.
#[derive(Debug, Clone, Default)]
pub struct LeadStore {
    leads: Vec<Lead>,
    keys: HashSet<String>,
}

impl LeadStore {
    /// Load a JSON array of lead objects. Unknown fields are ignored.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| CampaignError::LeadStore {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let leads: Vec<Lead> =
            serde_json::from_str(&content).map_err(|e| CampaignError::LeadStore {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;

        let store = Self::from_leads(leads);
        if store.is_empty() {
            return Err(CampaignError::config(format!(
                "lead store {} contains no usable leads",
                path.display()
            )));
        }
        log::info!("Loaded {} leads from {}", store.len(), path.display());
        Ok(store)
    }

    pub fn from_leads(leads: Vec<Lead>) -> Self {
        let mut store = LeadStore::default();
        for mut lead in leads {
            if !is_valid_email(&lead.email) {
                log::warn!("Skipping lead with invalid email: {:?}", lead.email);
                continue;
            }
            lead.email = lead.email.trim().to_string();
            let key = lead.key();
            if !store.keys.insert(key) {
                log::debug!("Skipping duplicate lead: {}", lead.email);
                continue;
            }
            store.leads.push(lead);
        }
        store
    }

    pub fn iter(&self) -> impl Iterator<Item = &Lead> {
        self.leads.iter()
    }

    pub fn len(&self) -> usize {
        self.leads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leads.is_empty()
    }

    pub fn contains(&self, email: &str) -> bool {
        self.keys.contains(&normalize_email(email))
    }
}
