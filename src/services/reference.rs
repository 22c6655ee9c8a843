//! Provider reference tokens.
//!
//! The first attempt of a transaction sends its `transaction_id` verbatim.
//! Every later attempt appends `-N`, where `N` is the number of tokens issued
//! before it, so tokens are never reused and always carry the owning id as a
//! prefix. A transport replay resends the current token without issuing a new one.

use regex::Regex;
use std::sync::OnceLock;

/// Token for the `sequence`-th attempt (0 = base id).
pub fn ref_id(base: &str, sequence: i32) -> String {
    if sequence <= 0 {
        base.to_string()
    } else {
        format!("{}-{}", base, sequence)
    }
}

fn suffix_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^([A-Za-z0-9]+-\d{8}-\d{6})-(\d+)$").ok())
        .as_ref()
}

/// Splits `TRX-20260101-000001-2` into the base id and the suffix.
/// Ids without a retry suffix come back unchanged with `None`.
pub fn split_ref_id(ref_id: &str) -> (&str, Option<i32>) {
    let captures = suffix_pattern().and_then(|re| re.captures(ref_id));
    match captures {
        Some(caps) => match (caps.get(1), caps.get(2).and_then(|m| m.as_str().parse().ok())) {
            (Some(base), Some(n)) => (base.as_str(), Some(n)),
            _ => (ref_id, None),
        },
        None => (ref_id, None),
    }
}

pub fn base_transaction_id(ref_id: &str) -> &str {
    split_ref_id(ref_id).0
}

/// Issues reference tokens for one routing pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefTokens {
    base: String,
    issued: i32,
    fixed: bool,
}

impl RefTokens {
    /// Continues the sequence after `issued` tokens already sent upstream.
    pub fn sequence(base: impl Into<String>, issued: i32) -> Self {
        Self {
            base: base.into(),
            issued: issued.max(0),
            fixed: false,
        }
    }

    /// Always hands out `token`. Used for payments, which must keep the
    /// inquiry's reference so the upstream sees a single conversation.
    pub fn fixed(token: impl Into<String>) -> Self {
        Self {
            base: token.into(),
            issued: 0,
            fixed: true,
        }
    }

    pub fn next_token(&mut self) -> String {
        if self.fixed {
            return self.base.clone();
        }
        let token = ref_id(&self.base, self.issued);
        self.issued += 1;
        token
    }

    pub fn issued(&self) -> i32 {
        self.issued
    }

    pub fn is_fixed(&self) -> bool {
        self.fixed
    }
}
