//! Request and message types shared by the encoder, dispatcher and facade

use chrono::{NaiveDate, Utc};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Kind of account a statement is requested for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccountType {
    Checking,
    Savings,
    #[serde(rename = "MONEYMRKT")]
    MoneyMarket,
    #[serde(rename = "CREDITCARD")]
    CreditCard,
    Investment,
}

impl AccountType {
    /// Value used in the `ACCTTYPE` element
    pub fn as_ofx(&self) -> &'static str {
        match self {
            AccountType::Checking => "CHECKING",
            AccountType::Savings => "SAVINGS",
            AccountType::MoneyMarket => "MONEYMRKT",
            AccountType::CreditCard => "CREDITCARD",
            AccountType::Investment => "INVESTMENT",
        }
    }

    /// Checking, savings and money market share the bank message set
    pub fn is_bank(&self) -> bool {
        matches!(
            self,
            AccountType::Checking | AccountType::Savings | AccountType::MoneyMarket
        )
    }
}

impl fmt::Display for AccountType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_ofx())
    }
}

impl FromStr for AccountType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CHECKING" => Ok(AccountType::Checking),
            "SAVINGS" => Ok(AccountType::Savings),
            "MONEYMRKT" | "MONEYMARKET" => Ok(AccountType::MoneyMarket),
            "CREDITCARD" | "CREDITLINE" => Ok(AccountType::CreditCard),
            "INVESTMENT" => Ok(AccountType::Investment),
            other => Err(Error::configuration(format!("unknown account type '{}'", other))),
        }
    }
}

/// OFX 1.x protocol version written into the `VERSION` header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OfxVersion {
    #[serde(rename = "102")]
    V102,
    #[default]
    #[serde(rename = "103")]
    V103,
    #[serde(rename = "151")]
    V151,
    #[serde(rename = "160")]
    V160,
}

impl OfxVersion {
    pub fn header_value(&self) -> &'static str {
        match self {
            OfxVersion::V102 => "102",
            OfxVersion::V103 => "103",
            OfxVersion::V151 => "151",
            OfxVersion::V160 => "160",
        }
    }
}

impl fmt::Display for OfxVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.header_value())
    }
}

/// Sign-on credentials
///
/// `Debug` never prints the password.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct Credentials {
    pub user_id: String,
    pub password: String,
}

impl Credentials {
    pub fn new(user_id: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user_id", &"***")
            .field("password", &"***")
            .finish()
    }
}

/// Client application identity sent in `APPID`/`APPVER`
///
/// Many institutions only answer well-known desktop clients, hence the
/// Quicken defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppInfo {
    pub app_id: String,
    pub app_version: String,
}

impl Default for AppInfo {
    fn default() -> Self {
        Self {
            app_id: "QWIN".to_string(),
            app_version: "2700".to_string(),
        }
    }
}

/// Statement date range; `end` is omitted from the request when absent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: Option<NaiveDate>,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: Option<NaiveDate>) -> Self {
        Self { start, end }
    }

    /// Number of days covered, treating an open end as today
    pub fn span_days(&self) -> i64 {
        let end = self.end.unwrap_or_else(|| Utc::now().date_naive());
        (end - self.start).num_days()
    }
}

/// What an investment statement request should include
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InvestmentOptions {
    pub include_transactions: bool,
    pub include_positions: bool,
    pub include_balance: bool,
    pub include_open_orders: bool,
}

impl Default for InvestmentOptions {
    fn default() -> Self {
        Self {
            include_transactions: true,
            include_positions: true,
            include_balance: true,
            include_open_orders: false,
        }
    }
}

/// The single operation a request performs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Statement(DateRange),
    AccountList,
}

impl Operation {
    pub fn kind(&self) -> OperationType {
        match self {
            Operation::Statement(_) => OperationType::Statement,
            Operation::AccountList => OperationType::AccountList,
        }
    }
}

/// Operation discriminant used for cache keys and error context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Statement,
    AccountList,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Statement => "statement",
            OperationType::AccountList => "account_list",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything needed to encode one request
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub fid: String,
    pub org: String,
    pub credentials: Credentials,
    pub account_id: String,
    /// Bank routing id or investment broker id
    pub bank_id: Option<String>,
    pub account_type: AccountType,
    pub version: OfxVersion,
    pub app: AppInfo,
    pub client_uid: Option<String>,
    pub operation: Operation,
    pub investment: InvestmentOptions,
}

impl RequestContext {
    /// Statement request with default version and app identity
    pub fn statement(
        fid: impl Into<String>,
        org: impl Into<String>,
        credentials: Credentials,
        account_id: impl Into<String>,
        account_type: AccountType,
        range: DateRange,
    ) -> Self {
        Self {
            fid: fid.into(),
            org: org.into(),
            credentials,
            account_id: account_id.into(),
            bank_id: None,
            account_type,
            version: OfxVersion::default(),
            app: AppInfo::default(),
            client_uid: None,
            operation: Operation::Statement(range),
            investment: InvestmentOptions::default(),
        }
    }

    /// Account list request
    pub fn account_list(
        fid: impl Into<String>,
        org: impl Into<String>,
        credentials: Credentials,
    ) -> Self {
        Self {
            fid: fid.into(),
            org: org.into(),
            credentials,
            account_id: String::new(),
            bank_id: None,
            account_type: AccountType::Checking,
            version: OfxVersion::default(),
            app: AppInfo::default(),
            client_uid: None,
            operation: Operation::AccountList,
            investment: InvestmentOptions::default(),
        }
    }

    pub fn with_bank_id(mut self, bank_id: impl Into<String>) -> Self {
        self.bank_id = Some(bank_id.into());
        self
    }

    pub fn with_version(mut self, version: OfxVersion) -> Self {
        self.version = version;
        self
    }

    pub fn with_app(mut self, app: AppInfo) -> Self {
        self.app = app;
        self
    }

    pub fn with_client_uid(mut self, client_uid: impl Into<String>) -> Self {
        self.client_uid = Some(client_uid.into());
        self
    }

    pub fn with_investment_options(mut self, options: InvestmentOptions) -> Self {
        self.investment = options;
        self
    }
}

/// Ordered header map as it appears in the OFX header block
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OfxHeaders {
    entries: Vec<(String, String)>,
}

impl OfxHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a field, replacing the value in place if the key already exists
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Serialize for OfxHeaders {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (key, value) in &self.entries {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

/// An encoded request: header block plus SGML body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfxMessage {
    pub headers: OfxHeaders,
    pub body: String,
}

impl OfxMessage {
    /// Render as sent on the wire: `KEY:VALUE` lines, a blank line, then the body
    pub fn to_wire(&self) -> String {
        let mut out = String::with_capacity(self.body.len() + 256);
        for (key, value) in self.headers.iter() {
            out.push_str(key);
            out.push(':');
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        out.push_str(&self.body);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_type_parsing() {
        assert_eq!("checking".parse::<AccountType>().unwrap(), AccountType::Checking);
        assert_eq!("MONEYMRKT".parse::<AccountType>().unwrap(), AccountType::MoneyMarket);
        assert!("brokerage-ish".parse::<AccountType>().is_err());
        assert!(AccountType::Savings.is_bank());
        assert!(!AccountType::CreditCard.is_bank());
    }

    #[test]
    fn test_credentials_debug_is_redacted() {
        let creds = Credentials::new("jdoe", "hunter2");
        let debug = format!("{:?}", creds);
        assert!(!debug.contains("jdoe"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn test_headers_keep_insertion_order() {
        let mut headers = OfxHeaders::new();
        headers.insert("OFXHEADER", "100");
        headers.insert("DATA", "OFXSGML");
        headers.insert("VERSION", "102");
        headers.insert("VERSION", "103");

        let keys: Vec<_> = headers.keys().collect();
        assert_eq!(keys, vec!["OFXHEADER", "DATA", "VERSION"]);
        assert_eq!(headers.get("VERSION"), Some("103"));

        let json = serde_json::to_string(&headers).unwrap();
        assert_eq!(json, r#"{"OFXHEADER":"100","DATA":"OFXSGML","VERSION":"103"}"#);
    }

    #[test]
    fn test_date_range_span() {
        let range = DateRange::new(
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, 11),
        );
        assert_eq!(range.span_days(), 10);
    }

    #[test]
    fn test_message_wire_format() {
        let mut headers = OfxHeaders::new();
        headers.insert("OFXHEADER", "100");
        let message = OfxMessage {
            headers,
            body: "<OFX></OFX>".to_string(),
        };
        assert_eq!(message.to_wire(), "OFXHEADER:100\r\n\r\n<OFX></OFX>");
    }
}
