//! Remote identifier normalization.
//!
//! Gateways address chats with JIDs such as `5548999990000@s.whatsapp.net`,
//! `1203630@g.us` or `5548999990000:12@s.whatsapp.net`. Contacts are keyed by the
//! canonical phone derived here.

use std::sync::LazyLock;

use regex::Regex;

const INDIVIDUAL_SUFFIX: &str = "@s.whatsapp.net";
const GROUP_SUFFIX: &str = "@g.us";
const LID_SUFFIX: &str = "@lid";
const BRAZIL_COUNTRY_CODE: &str = "55";

static DEVICE_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r":\d+").expect("device suffix pattern is valid"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedJid {
    pub phone: String,
    pub is_group: bool,
}

/// Strips gateway suffixes and applies the Brazilian ninth-digit rule.
/// Never fails; unexpected input passes through with only the suffixes removed.
pub fn normalize_remote_jid(remote_jid: &str) -> NormalizedJid {
    let is_group = remote_jid.contains(GROUP_SUFFIX);
    let stripped = remote_jid
        .trim()
        .replacen(INDIVIDUAL_SUFFIX, "", 1)
        .replacen(GROUP_SUFFIX, "", 1)
        .replacen(LID_SUFFIX, "", 1);
    let stripped = DEVICE_SUFFIX.replace(&stripped, "").into_owned();

    NormalizedJid {
        phone: with_ninth_digit(&stripped).unwrap_or(stripped),
        is_group,
    }
}

/// `55` + area code + 8 digits gains the mobile `9` after the area code.
fn with_ninth_digit(phone: &str) -> Option<String> {
    if is_brazilian(phone) && phone.len() == 12 {
        Some(format!("{}9{}", &phone[..4], &phone[4..]))
    } else {
        None
    }
}

fn without_ninth_digit(phone: &str) -> Option<String> {
    if is_brazilian(phone) && phone.len() == 13 {
        Some(format!("{}{}", &phone[..4], &phone[5..]))
    } else {
        None
    }
}

fn is_brazilian(phone: &str) -> bool {
    phone.starts_with(BRAZIL_COUNTRY_CODE) && phone.chars().all(|c| c.is_ascii_digit())
}

/// Canonical phone first, followed by the legacy sibling format contacts may
/// still be stored under.
pub fn phone_variants(canonical: &str) -> Vec<String> {
    let mut variants = vec![canonical.to_string()];
    if let Some(short) = without_ninth_digit(canonical) {
        variants.push(short);
    }
    if let Some(long) = with_ninth_digit(canonical) {
        variants.push(long);
    }
    variants
}
