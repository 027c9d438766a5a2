use crate::lead::Lead;
use rand::{Rng, RngCore};

/// Renders subject and HTML body for one lead. Randomness comes from the
/// caller so tests can pin it with a seeded RNG.
pub trait MessageComposer: Send + Sync {
    fn compose(&self, lead: &Lead, tracking_id: &str, rng: &mut dyn RngCore) -> (String, String);
}

const SUBJECTS: [&str; 3] = [
    "Quick question about {clinic}",
    "{first}, how many calls does {clinic} miss?",
    "A 24/7 receptionist for {city} clinics",
];

/// Default composer: one of three subject lines picked uniformly per send,
/// a short plain body, and an optional open pixel.
#[derive(Debug, Clone, Default)]
pub struct SubjectRotation {
    sender_name: String,
    tracking_base_url: Option<String>,
}

impl SubjectRotation {
    pub fn new(sender_name: &str, tracking_base_url: Option<String>) -> Self {
        Self {
            sender_name: sender_name.to_string(),
            tracking_base_url: tracking_base_url.map(|u| u.trim_end_matches('/').to_string()),
        }
    }

    fn fill(template: &str, lead: &Lead) -> String {
        let first = if lead.first_name.is_empty() {
            "Hi"
        } else {
            lead.first_name.as_str()
        };
        let clinic = if lead.clinic_name.is_empty() {
            "your clinic"
        } else {
            lead.clinic_name.as_str()
        };
        let city = if lead.city.is_empty() {
            "local"
        } else {
            lead.city.as_str()
        };
        template
            .replace("{first}", first)
            .replace("{clinic}", clinic)
            .replace("{city}", city)
    }
}

impl MessageComposer for SubjectRotation {
    fn compose(&self, lead: &Lead, tracking_id: &str, rng: &mut dyn RngCore) -> (String, String) {
        let subject = Self::fill(SUBJECTS[rng.gen_range(0..SUBJECTS.len())], lead);

        let greeting = if lead.first_name.is_empty() {
            "Hi there".to_string()
        } else {
            format!("Hi {}", escape_html(&lead.first_name))
        };
        let clinic = Self::fill("{clinic}", lead);
        let mut body = format!(
            "<p>{greeting},</p>\
             <p>Patients who reach voicemail at {} often book elsewhere. \
             We answer every call for clinics like yours, day and night, and put the \
             appointments straight into your diary.</p>\
             <p>Worth a 10 minute chat this week?</p>\
             <p>{}</p>",
            escape_html(&clinic),
            escape_html(&self.sender_name),
        );
        if let Some(base) = &self.tracking_base_url {
            body.push_str(&format!(
                "<img src=\"{base}/open/{tracking_id}.gif\" width=\"1\" height=\"1\" alt=\"\">"
            ));
        }
        (subject, body)
    }
}

fn escape_html(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
