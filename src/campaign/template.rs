//! `{{placeholder}}` personalization for campaign messages.

use std::sync::LazyLock;

use regex::{Captures, Regex};

use crate::campaign::model::Recipient;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([A-Za-z0-9_]+)\s*\}\}").unwrap());

/// Replace every `{{key}}` with the recipient's value for `key`.
/// Unknown keys are left verbatim.
pub fn personalize(template: &str, recipient: &Recipient) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures| match recipient.lookup(&caps[1]) {
            Some(value) => value.to_string(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// Whether `identity` looks like a dialable E.164 number (digits only,
/// optional leading `+`, 10 to 15 digits).
pub fn is_valid_phone(identity: &str) -> bool {
    let digits = identity.strip_prefix('+').unwrap_or(identity);
    (10..=15).contains(&digits.len()) && digits.chars().all(|c| c.is_ascii_digit())
}
