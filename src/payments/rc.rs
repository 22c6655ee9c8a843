//! Response-code classification.
//!
//! Every upstream publishes its own RC vocabulary. Each adapter owns one
//! static [`RcTable`] that maps a raw code to an [`Outcome`]. Lookups are
//! total: codes missing from the table fall back to the table default, which
//! is [`Outcome::Fatal`] for every built-in table.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Settlement is final and can be trusted immediately.
    Success,
    /// The upstream owns the request; a callback or status check resolves it.
    Pending,
    /// No retry can help.
    Fatal,
    /// This SKU/provider cannot fulfil, another one might.
    RetryableSwitch,
    /// The same SKU may succeed after a cooldown.
    RetryableWait,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Pending => "pending",
            Outcome::Fatal => "fatal",
            Outcome::RetryableSwitch => "retryable_switch",
            Outcome::RetryableWait => "retryable_wait",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Outcome::RetryableSwitch | Outcome::RetryableWait)
    }

    /// Success and Fatal settle a transaction.
    pub fn is_decisive(&self) -> bool {
        matches!(self, Outcome::Success | Outcome::Fatal)
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct RcTable {
    provider: &'static str,
    codes: HashMap<&'static str, Outcome>,
    default: Outcome,
}

impl RcTable {
    pub fn new(provider: &'static str, entries: &[(&'static str, Outcome)]) -> Self {
        Self {
            provider,
            codes: entries.iter().copied().collect(),
            default: Outcome::Fatal,
        }
    }

    pub fn provider(&self) -> &'static str {
        self.provider
    }

    pub fn classify(&self, rc: &str) -> Outcome {
        self.codes
            .get(rc.trim())
            .copied()
            .unwrap_or(self.default)
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }
}

fn expand(codes: &[&'static str], outcome: Outcome) -> Vec<(&'static str, Outcome)> {
    codes.iter().map(|code| (*code, outcome)).collect()
}

/// Digiflazz buyer API response codes.
pub fn digiflazz_table() -> &'static RcTable {
    static TABLE: OnceLock<RcTable> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut entries = vec![("00", Outcome::Success)];
        entries.extend(expand(&["03", "99"], Outcome::Pending));
        // 85/86: request limit reached, retry later on the same SKU
        entries.extend(expand(&["85", "86"], Outcome::RetryableWait));
        entries.extend(expand(
            &[
                "01", "02", "43", "53", "55", "58", "62", "66", "67", "68", "69", "70", "71",
                "80", "81", "83",
            ],
            Outcome::RetryableSwitch,
        ));
        entries.extend(expand(
            &[
                "40", "41", "42", "44", "45", "47", "49", "50", "51", "52", "54", "57", "59",
                "60", "61", "63", "64", "65", "72", "73", "74", "82", "84",
            ],
            Outcome::Fatal,
        ));
        RcTable::new("digiflazz", &entries)
    })
}

/// ISO-8583 style codes used by host-to-host billers.
pub fn h2h_table() -> &'static RcTable {
    static TABLE: OnceLock<RcTable> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut entries = vec![("00", Outcome::Success)];
        entries.extend(expand(&["09", "68", "94"], Outcome::Pending));
        entries.extend(expand(&["65", "RL"], Outcome::RetryableWait));
        entries.extend(expand(
            &["05", "06", "31", "90", "91", "92", "96"],
            Outcome::RetryableSwitch,
        ));
        entries.extend(expand(
            &["12", "13", "14", "30", "51", "61", "88"],
            Outcome::Fatal,
        ));
        RcTable::new("h2h", &entries)
    })
}
