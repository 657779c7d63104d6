//! Heuristics for spotting bulk and automated senders. Everything here is
//! pure and deterministic: same inputs, same verdict, no I/O.

use once_cell::sync::Lazy;
use regex::Regex;

/// Sender addresses that only ever carry machine-generated mail.
static NOREPLY_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        r"(?i)^no-?reply[@.+\-]",
        r"(?i)^do-?not-?reply[@.+\-]",
        r"(?i)^notifications?@",
        r"(?i)^newsletters?@",
        r"(?i)^updates?@",
        r"(?i)^digest@",
        r"(?i)^mailer(-daemon)?@",
        r"(?i)^bounce[s.\-]?",
        r"(?i)^marketing@",
    ])
});

/// Body markers that give away list mail even from a plausible sender.
static UNSUBSCRIBE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        r"(?i)unsubscribe",
        r"(?i)manage (your )?(email )?preferences",
        r"(?i)opt[ \-]?out of (these|future) emails",
        r"(?i)update (your )?subscription",
        r"(?i)you are receiving this (email )?because",
    ])
});

static BULK_SUBJECT_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        r"(?i)newsletter",
        r"(?i)(weekly|daily|monthly) digest",
        r"(?i)\d{1,3}% off",
        r"(?i)sale ends",
        r"(?i)limited time offer",
        r"(?i)your (order|shipment|receipt)",
    ])
});

/// Domains of mailing-list and campaign infrastructure. Matched against the
/// sender domain as a suffix, so subdomains count too.
const DEFAULT_BULK_DOMAINS: &[&str] = &[
    "mailchimp.com",
    "list-manage.com",
    "campaign-archive.com",
    "sendgrid.net",
    "mailgun.org",
    "amazonses.com",
    "substack.com",
    "constantcontact.com",
    "mailjet.com",
];

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|p| Regex::new(p).expect("valid filter pattern"))
        .collect()
}

pub struct SubscriptionFilter {
    extra_bulk_domains: Vec<String>,
}

impl SubscriptionFilter {
    pub fn new(extra_bulk_domains: &[String]) -> Self {
        Self {
            extra_bulk_domains: extra_bulk_domains
                .iter()
                .map(|d| d.trim().to_ascii_lowercase())
                .filter(|d| !d.is_empty())
                .collect(),
        }
    }

    /// True when the message looks like list or campaign mail that should
    /// never interrupt anyone, however urgent its content scored.
    pub fn is_bulk(&self, sender: &str, subject: &str, body: &str) -> bool {
        let address = extract_address(sender);

        if let Some((_, domain)) = address.rsplit_once('@') {
            let domain = domain.to_ascii_lowercase();
            let suffix_match = |bulk: &str| {
                domain == bulk || domain.ends_with(&format!(".{}", bulk))
            };
            if DEFAULT_BULK_DOMAINS.iter().any(|d| suffix_match(d)) {
                return true;
            }
            if self.extra_bulk_domains.iter().any(|d| suffix_match(d)) {
                return true;
            }
        }

        if NOREPLY_PATTERNS.iter().any(|re| re.is_match(address)) {
            return true;
        }
        if BULK_SUBJECT_PATTERNS.iter().any(|re| re.is_match(subject)) {
            return true;
        }
        UNSUBSCRIBE_PATTERNS.iter().any(|re| re.is_match(body))
    }
}

/// Pull the bare address out of a `Display Name <user@host>` header value.
fn extract_address(sender: &str) -> &str {
    match (sender.find('<'), sender.rfind('>')) {
        (Some(start), Some(end)) if start < end => sender[start + 1..end].trim(),
        _ => sender.trim(),
    }
}
