//! Operation classification
//!
//! Each dispatch is sorted into a quick, standard or heavy tier, which picks
//! its timeout profile and retry budget. Rules are checked in order: URL or
//! payload pattern, payload size, then the statement date span.

use chrono::{NaiveDate, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

use crate::error::{Error, Result};

/// Cost tier of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationClass {
    Quick,
    Standard,
    Heavy,
}

impl fmt::Display for OperationClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationClass::Quick => write!(f, "quick"),
            OperationClass::Standard => write!(f, "standard"),
            OperationClass::Heavy => write!(f, "heavy"),
        }
    }
}

/// Classification thresholds and patterns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassificationRules {
    /// Regexes matched against URL and payload that force the quick tier
    pub quick_patterns: Vec<String>,
    /// Regexes matched against URL and payload that force the heavy tier
    pub heavy_patterns: Vec<String>,
    /// Payloads above this size are heavy
    pub heavy_payload_bytes: usize,
    /// Statement spans shorter than this are quick
    pub quick_span_days: i64,
    /// Statement spans longer than this are heavy
    pub heavy_span_days: i64,
}

impl Default for ClassificationRules {
    fn default() -> Self {
        Self {
            quick_patterns: vec![r"<ACCTINFORQ>".to_string()],
            heavy_patterns: vec![r"<INCPOS>\s*(<DTASOF>[^<]*)?\s*<INCLUDE>\s*Y".to_string()],
            heavy_payload_bytes: 50 * 1024,
            quick_span_days: 30,
            heavy_span_days: 365,
        }
    }
}

impl ClassificationRules {
    pub fn validate(&self) -> Result<()> {
        if self.quick_span_days > self.heavy_span_days {
            return Err(Error::configuration(
                "quick_span_days must not exceed heavy_span_days",
            ));
        }
        if self.heavy_payload_bytes == 0 {
            return Err(Error::configuration("heavy_payload_bytes cannot be zero"));
        }
        OperationClassifier::new(self.clone()).map(|_| ())
    }
}

/// Compiled classification rules
#[derive(Debug, Clone)]
pub struct OperationClassifier {
    rules: ClassificationRules,
    quick: Vec<Regex>,
    heavy: Vec<Regex>,
}

impl OperationClassifier {
    pub fn new(rules: ClassificationRules) -> Result<Self> {
        let compile = |patterns: &[String]| -> Result<Vec<Regex>> {
            patterns
                .iter()
                .map(|p| {
                    Regex::new(p).map_err(|e| {
                        Error::configuration(format!("invalid classification pattern '{}': {}", p, e))
                    })
                })
                .collect()
        };
        Ok(Self {
            quick: compile(&rules.quick_patterns)?,
            heavy: compile(&rules.heavy_patterns)?,
            rules,
        })
    }

    /// Classify using today's date for open-ended ranges
    pub fn classify(&self, url: &str, payload: &str) -> OperationClass {
        self.classify_on(url, payload, Utc::now().date_naive())
    }

    /// Classify with an explicit "today"
    pub fn classify_on(&self, url: &str, payload: &str, today: NaiveDate) -> OperationClass {
        let matches = |set: &[Regex]| set.iter().any(|re| re.is_match(url) || re.is_match(payload));

        if matches(&self.heavy) {
            return OperationClass::Heavy;
        }
        if matches(&self.quick) {
            return OperationClass::Quick;
        }
        if payload.len() > self.rules.heavy_payload_bytes {
            return OperationClass::Heavy;
        }
        match statement_span_days(payload, today) {
            Some(days) if days < self.rules.quick_span_days => OperationClass::Quick,
            Some(days) if days > self.rules.heavy_span_days => OperationClass::Heavy,
            _ => OperationClass::Standard,
        }
    }
}

/// Day span between `DTSTART` and `DTEND` in a request payload
///
/// A missing `DTEND` means the range runs to `today`.
pub fn statement_span_days(payload: &str, today: NaiveDate) -> Option<i64> {
    static START_RE: OnceLock<Regex> = OnceLock::new();
    static END_RE: OnceLock<Regex> = OnceLock::new();

    let start_re = START_RE
        .get_or_init(|| Regex::new(r"<DTSTART>\s*(\d{8})").expect("DTSTART pattern is valid"));
    let end_re =
        END_RE.get_or_init(|| Regex::new(r"<DTEND>\s*(\d{8})").expect("DTEND pattern is valid"));

    let parse = |re: &Regex| {
        re.captures(payload)
            .and_then(|c| c.get(1))
            .and_then(|m| NaiveDate::parse_from_str(m.as_str(), "%Y%m%d").ok())
    };

    let start = parse(start_re)?;
    let end = parse(end_re).unwrap_or(today);
    Some((end - start).num_days())
}

#[cfg(test)]
mod tests {
    use super::*;

    const URL: &str = "https://ofx.bank.example/ofx";

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 12, 31).unwrap()
    }

    fn statement(start: &str, end: Option<&str>) -> String {
        let mut payload = format!("<OFX><STMTRQ><INCTRAN><DTSTART>{}\r\n", start);
        if let Some(end) = end {
            payload.push_str(&format!("<DTEND>{}\r\n", end));
        }
        payload.push_str("<INCLUDE>Y</INCTRAN></STMTRQ></OFX>");
        payload
    }

    fn classifier() -> OperationClassifier {
        OperationClassifier::new(ClassificationRules::default()).unwrap()
    }

    #[test]
    fn test_span_tiers() {
        let c = classifier();
        assert_eq!(
            c.classify_on(URL, &statement("20240101", Some("20240111")), today()),
            OperationClass::Quick
        );
        assert_eq!(
            c.classify_on(URL, &statement("20240101", Some("20240629")), today()),
            OperationClass::Standard
        );
        assert_eq!(
            c.classify_on(URL, &statement("20220101", Some("20240311")), today()),
            OperationClass::Heavy
        );
    }

    #[test]
    fn test_span_boundaries() {
        let c = classifier();
        // exactly 30 and exactly 365 days are standard
        assert_eq!(
            c.classify_on(URL, &statement("20240101", Some("20240131")), today()),
            OperationClass::Standard
        );
        assert_eq!(
            c.classify_on(URL, &statement("20230101", Some("20240101")), today()),
            OperationClass::Standard
        );
    }

    #[test]
    fn test_open_range_runs_to_today() {
        assert_eq!(statement_span_days(&statement("20241221", None), today()), Some(10));
        assert_eq!(
            classifier().classify_on(URL, &statement("20241221", None), today()),
            OperationClass::Quick
        );
    }

    #[test]
    fn test_patterns_take_precedence() {
        let c = classifier();
        assert_eq!(
            c.classify_on(URL, "<ACCTINFORQ><DTACCTUP>19700101000000", today()),
            OperationClass::Quick
        );
        let positions = "<INVSTMTRQ><INCTRAN><DTSTART>20241230\r\n</INCTRAN>\
                         <INCPOS>\r\n<DTASOF>20241231\r\n<INCLUDE>Y\r\n</INCPOS>";
        assert_eq!(c.classify_on(URL, positions, today()), OperationClass::Heavy);
    }

    #[test]
    fn test_large_payload_is_heavy() {
        let mut payload = statement("20241221", None);
        payload.push_str(&" ".repeat(51 * 1024));
        assert_eq!(classifier().classify_on(URL, &payload, today()), OperationClass::Heavy);
    }

    #[test]
    fn test_no_range_defaults_to_standard() {
        assert_eq!(
            classifier().classify_on(URL, "<OFX></OFX>", today()),
            OperationClass::Standard
        );
    }

    #[test]
    fn test_invalid_pattern_is_configuration_error() {
        let rules = ClassificationRules {
            quick_patterns: vec!["(".to_string()],
            ..Default::default()
        };
        assert!(rules.validate().is_err());
    }
}
