//! Pattern-based PII detection.
//!
//! Regexes find candidates; checksum validators (Luhn for cards, mod-97 for
//! IBANs, area rules for SSNs) weed out numbers that merely look right.

use std::{fmt, sync::LazyLock};

use {regex::Regex, serde::Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PiiKind {
    Email,
    Ssn,
    CardNumber,
    Phone,
    Iban,
}

impl fmt::Display for PiiKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Email => "email",
            Self::Ssn => "ssn",
            Self::CardNumber => "card_number",
            Self::Phone => "phone",
            Self::Iban => "iban",
        };
        f.write_str(name)
    }
}

struct PiiPattern {
    kind: PiiKind,
    regex: Regex,
    validate: fn(&str) -> bool,
}

const DEFINITIONS: &[(PiiKind, &str, fn(&str) -> bool)] = &[
    (
        PiiKind::Email,
        r"(?i)\b[a-z0-9._%+-]+@[a-z0-9.-]+\.[a-z]{2,}\b",
        accept,
    ),
    (PiiKind::Ssn, r"\b\d{3}-\d{2}-\d{4}\b", valid_ssn),
    (PiiKind::CardNumber, r"\b(?:\d[ -]?){12,18}\d\b", luhn_valid),
    (
        PiiKind::Phone,
        r"(?:\+?1[-. ]?)?(?:\(\d{3}\)\s?|\b\d{3}[-. ])\d{3}[-. ]\d{4}\b",
        accept,
    ),
    (PiiKind::Iban, r"\b[A-Z]{2}\d{2}[A-Z0-9]{11,30}\b", iban_valid),
];

static PATTERNS: LazyLock<Vec<PiiPattern>> = LazyLock::new(|| {
    DEFINITIONS
        .iter()
        .filter_map(|(kind, pattern, validate)| {
            Regex::new(pattern).ok().map(|regex| PiiPattern {
                kind: *kind,
                regex,
                validate: *validate,
            })
        })
        .collect()
});

/// Kinds of PII present in `text`, sorted and deduplicated.
pub fn find_pii(text: &str) -> Vec<PiiKind> {
    let mut kinds: Vec<PiiKind> = PATTERNS
        .iter()
        .filter(|p| p.regex.find_iter(text).any(|m| (p.validate)(m.as_str())))
        .map(|p| p.kind)
        .collect();
    kinds.sort();
    kinds.dedup();
    kinds
}

pub fn detect_pii(text: &str) -> bool {
    PATTERNS
        .iter()
        .any(|p| p.regex.find_iter(text).any(|m| (p.validate)(m.as_str())))
}

fn accept(_: &str) -> bool {
    true
}

fn valid_ssn(candidate: &str) -> bool {
    let mut parts = candidate.split('-');
    let (Some(area), Some(group), Some(serial)) = (parts.next(), parts.next(), parts.next()) else {
        return false;
    };
    area != "000" && area != "666" && !area.starts_with('9') && group != "00" && serial != "0000"
}

fn luhn_valid(candidate: &str) -> bool {
    let digits: Vec<u32> = candidate.chars().filter_map(|c| c.to_digit(10)).collect();
    if !(13..=19).contains(&digits.len()) {
        return false;
    }
    let sum: u32 = digits
        .iter()
        .rev()
        .enumerate()
        .map(|(i, &d)| {
            if i % 2 == 1 {
                let doubled = d * 2;
                if doubled > 9 { doubled - 9 } else { doubled }
            } else {
                d
            }
        })
        .sum();
    sum % 10 == 0
}

fn iban_valid(candidate: &str) -> bool {
    let (head, tail) = candidate.split_at(4);
    let mut remainder: u32 = 0;
    for c in tail.chars().chain(head.chars()) {
        let value = match c {
            '0'..='9' => c as u32 - '0' as u32,
            'A'..='Z' => c as u32 - 'A' as u32 + 10,
            _ => return false,
        };
        let width = if value >= 10 { 100 } else { 10 };
        remainder = (remainder * width + value) % 97;
    }
    remainder == 1
}

#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest};

    #[test]
    fn all_patterns_compile() {
        assert_eq!(PATTERNS.len(), DEFINITIONS.len());
    }

    #[rstest]
    #[case::email("reach me at jane.doe@example.com please", PiiKind::Email)]
    #[case::ssn("SSN 123-45-6789 on file", PiiKind::Ssn)]
    #[case::visa("card 4111 1111 1111 1111 exp 12/29", PiiKind::CardNumber)]
    #[case::visa_compact("4111111111111111", PiiKind::CardNumber)]
    #[case::phone("call (555) 123-4567 tomorrow", PiiKind::Phone)]
    #[case::phone_dotted("+1 555.123.4567", PiiKind::Phone)]
    #[case::iban("IBAN GB82WEST12345698765432", PiiKind::Iban)]
    fn detects(#[case] text: &str, #[case] kind: PiiKind) {
        assert!(detect_pii(text));
        assert!(find_pii(text).contains(&kind), "{text}: {:?}", find_pii(text));
    }

    #[rstest]
    #[case::plain("Order flow uses Stripe webhooks")]
    #[case::luhn_failure("order 4111 1111 1111 1112 shipped")]
    #[case::reserved_ssn("ticket 666-12-3456")]
    #[case::bad_iban_checksum("GB00WEST12345698765432")]
    #[case::version_string("release 1.2.3 built on 2024-01-15")]
    fn ignores(#[case] text: &str) {
        assert!(!detect_pii(text), "{text}: {:?}", find_pii(text));
    }

    #[test]
    fn reports_multiple_kinds_once() {
        let kinds = find_pii("a@b.io, c@d.io, 123-45-6789");
        assert_eq!(kinds, vec![PiiKind::Email, PiiKind::Ssn]);
    }
}
