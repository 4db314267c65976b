//! OFX 1.x SGML request encoding
//!
//! Leaf elements are written without closing tags and aggregates are wrapped
//! explicitly, the way desktop clients talk to bank servers. Values are
//! written verbatim: OFX SGML has no escaping rules, so callers must not pass
//! `<` in credentials or identifiers.

use chrono::{DateTime, NaiveDate, Utc};
use rand::Rng;
use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::types::{AccountType, DateRange, OfxHeaders, OfxMessage, Operation, RequestContext};

/// `DTACCTUP` sent with account list requests, asking for every account
const ACCOUNT_LIST_EPOCH: &str = "19700101000000";

/// Encode a request context into a complete OFX message
pub fn encode_request(ctx: &RequestContext) -> Result<OfxMessage> {
    encode_request_at(ctx, Utc::now())
}

/// Same as [`encode_request`] with an explicit client timestamp
pub fn encode_request_at(ctx: &RequestContext, now: DateTime<Utc>) -> Result<OfxMessage> {
    let mut writer = SgmlWriter::default();
    writer.open("OFX");
    write_signon(&mut writer, ctx, now);

    match ctx.operation {
        Operation::AccountList => write_account_list(&mut writer),
        Operation::Statement(range) => {
            validate_range(&range)?;
            if ctx.account_id.is_empty() {
                return Err(Error::configuration("statement requests need an account id"));
            }
            match ctx.account_type {
                t if t.is_bank() => write_bank_statement(&mut writer, ctx, &range)?,
                AccountType::CreditCard => write_credit_card_statement(&mut writer, ctx, &range),
                _ => write_investment_statement(&mut writer, ctx, &range, now)?,
            }
        }
    }

    writer.close("OFX");

    let headers = header_block(ctx);
    debug!(
        fid = %ctx.fid,
        operation = %ctx.operation.kind(),
        account_type = %ctx.account_type,
        bytes = writer.out.len(),
        "encoded OFX request"
    );

    Ok(OfxMessage {
        headers,
        body: writer.finish(),
    })
}

/// Fixed nine-field OFX 1.x header block
fn header_block(ctx: &RequestContext) -> OfxHeaders {
    let mut headers = OfxHeaders::new();
    headers.insert("OFXHEADER", "100");
    headers.insert("DATA", "OFXSGML");
    headers.insert("VERSION", ctx.version.header_value());
    headers.insert("SECURITY", "NONE");
    headers.insert("ENCODING", "USASCII");
    headers.insert("CHARSET", "1252");
    headers.insert("COMPRESSION", "NONE");
    headers.insert("OLDFILEUID", "NONE");
    headers.insert("NEWFILEUID", new_file_uid());
    headers
}

/// Random 32 character token for `NEWFILEUID`
pub fn new_file_uid() -> String {
    Uuid::new_v4().simple().to_string().to_uppercase()
}

/// Random transaction id for `TRNUID`
pub fn transaction_uid() -> String {
    Uuid::new_v4().to_string().to_uppercase()
}

/// Random five digit `CLTCOOKIE`
pub fn client_cookie() -> String {
    rand::thread_rng().gen_range(10_000..100_000).to_string()
}

fn validate_range(range: &DateRange) -> Result<()> {
    if let Some(end) = range.end {
        if end < range.start {
            return Err(Error::configuration(format!(
                "statement start {} is after end {}",
                range.start, end
            )));
        }
    }
    Ok(())
}

fn write_signon(writer: &mut SgmlWriter, ctx: &RequestContext, now: DateTime<Utc>) {
    writer.open("SIGNONMSGSRQV1");
    writer.open("SONRQ");
    writer.leaf("DTCLIENT", &now.format("%Y%m%d%H%M%S").to_string());
    writer.leaf("USERID", &ctx.credentials.user_id);
    writer.leaf("USERPASS", &ctx.credentials.password);
    writer.leaf("LANGUAGE", "ENG");
    writer.open("FI");
    writer.leaf("ORG", &ctx.org);
    writer.leaf("FID", &ctx.fid);
    writer.close("FI");
    writer.leaf("APPID", &ctx.app.app_id);
    writer.leaf("APPVER", &ctx.app.app_version);
    if let Some(client_uid) = &ctx.client_uid {
        writer.leaf("CLIENTUID", client_uid);
    }
    writer.close("SONRQ");
    writer.close("SIGNONMSGSRQV1");
}

fn open_transaction(writer: &mut SgmlWriter, wrapper: &str) {
    writer.open(wrapper);
    writer.leaf("TRNUID", &transaction_uid());
    writer.leaf("CLTCOOKIE", &client_cookie());
}

fn write_inctran(writer: &mut SgmlWriter, range: &DateRange, include: bool) {
    writer.open("INCTRAN");
    writer.leaf("DTSTART", &ofx_date(range.start));
    if let Some(end) = range.end {
        writer.leaf("DTEND", &ofx_date(end));
    }
    writer.leaf("INCLUDE", yes_no(include));
    writer.close("INCTRAN");
}

fn write_bank_statement(
    writer: &mut SgmlWriter,
    ctx: &RequestContext,
    range: &DateRange,
) -> Result<()> {
    let bank_id = ctx
        .bank_id
        .as_deref()
        .filter(|id| !id.is_empty())
        .ok_or_else(|| Error::configuration("bank statements need a routing id (bank_id)"))?;

    writer.open("BANKMSGSRQV1");
    open_transaction(writer, "STMTTRNRQ");
    writer.open("STMTRQ");
    writer.open("BANKACCTFROM");
    writer.leaf("BANKID", bank_id);
    writer.leaf("ACCTID", &ctx.account_id);
    writer.leaf("ACCTTYPE", ctx.account_type.as_ofx());
    writer.close("BANKACCTFROM");
    write_inctran(writer, range, true);
    writer.close("STMTRQ");
    writer.close("STMTTRNRQ");
    writer.close("BANKMSGSRQV1");
    Ok(())
}

fn write_credit_card_statement(writer: &mut SgmlWriter, ctx: &RequestContext, range: &DateRange) {
    writer.open("CREDITCARDMSGSRQV1");
    open_transaction(writer, "CCSTMTTRNRQ");
    writer.open("CCSTMTRQ");
    writer.open("CCACCTFROM");
    writer.leaf("ACCTID", &ctx.account_id);
    writer.close("CCACCTFROM");
    write_inctran(writer, range, true);
    writer.close("CCSTMTRQ");
    writer.close("CCSTMTTRNRQ");
    writer.close("CREDITCARDMSGSRQV1");
}

fn write_investment_statement(
    writer: &mut SgmlWriter,
    ctx: &RequestContext,
    range: &DateRange,
    now: DateTime<Utc>,
) -> Result<()> {
    let broker_id = ctx
        .bank_id
        .as_deref()
        .filter(|id| !id.is_empty())
        .ok_or_else(|| Error::configuration("investment statements need a broker id (bank_id)"))?;
    let options = ctx.investment;

    writer.open("INVSTMTMSGSRQV1");
    open_transaction(writer, "INVSTMTTRNRQ");
    writer.open("INVSTMTRQ");
    writer.open("INVACCTFROM");
    writer.leaf("BROKERID", broker_id);
    writer.leaf("ACCTID", &ctx.account_id);
    writer.close("INVACCTFROM");
    write_inctran(writer, range, options.include_transactions);
    writer.leaf("INCOO", yes_no(options.include_open_orders));
    writer.open("INCPOS");
    writer.leaf("DTASOF", &now.format("%Y%m%d%H%M%S").to_string());
    writer.leaf("INCLUDE", yes_no(options.include_positions));
    writer.close("INCPOS");
    writer.leaf("INCBAL", yes_no(options.include_balance));
    writer.close("INVSTMTRQ");
    writer.close("INVSTMTTRNRQ");
    writer.close("INVSTMTMSGSRQV1");
    Ok(())
}

fn write_account_list(writer: &mut SgmlWriter) {
    writer.open("SIGNUPMSGSRQV1");
    open_transaction(writer, "ACCTINFOTRNRQ");
    writer.open("ACCTINFORQ");
    writer.leaf("DTACCTUP", ACCOUNT_LIST_EPOCH);
    writer.close("ACCTINFORQ");
    writer.close("ACCTINFOTRNRQ");
    writer.close("SIGNUPMSGSRQV1");
}

fn ofx_date(date: NaiveDate) -> String {
    date.format("%Y%m%d").to_string()
}

fn yes_no(flag: bool) -> &'static str {
    if flag {
        "Y"
    } else {
        "N"
    }
}

/// Line oriented SGML builder
#[derive(Default)]
struct SgmlWriter {
    out: String,
}

impl SgmlWriter {
    fn open(&mut self, tag: &str) {
        self.out.push('<');
        self.out.push_str(tag);
        self.out.push_str(">\r\n");
    }

    fn close(&mut self, tag: &str) {
        self.out.push_str("</");
        self.out.push_str(tag);
        self.out.push_str(">\r\n");
    }

    fn leaf(&mut self, tag: &str, value: &str) {
        self.out.push('<');
        self.out.push_str(tag);
        self.out.push('>');
        self.out.push_str(value);
        self.out.push_str("\r\n");
    }

    fn finish(self) -> String {
        self.out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;
    use crate::types::{Credentials, InvestmentOptions, OfxVersion};

    fn range(start: (i32, u32, u32), end: Option<(i32, u32, u32)>) -> DateRange {
        DateRange::new(
            NaiveDate::from_ymd_opt(start.0, start.1, start.2).unwrap(),
            end.map(|(y, m, d)| NaiveDate::from_ymd_opt(y, m, d).unwrap()),
        )
    }

    fn checking() -> RequestContext {
        RequestContext::statement(
            "3000",
            "WF",
            Credentials::new("jdoe", "secret"),
            "1234567890",
            AccountType::Checking,
            range((2024, 1, 1), Some((2024, 1, 31))),
        )
        .with_bank_id("121000248")
    }

    #[test]
    fn test_header_block() {
        let message = encode_request(&checking().with_version(OfxVersion::V102)).unwrap();
        let keys: Vec<_> = message.headers.keys().collect();
        assert_eq!(
            keys,
            vec![
                "OFXHEADER", "DATA", "VERSION", "SECURITY", "ENCODING", "CHARSET",
                "COMPRESSION", "OLDFILEUID", "NEWFILEUID"
            ]
        );
        assert_eq!(message.headers.get("VERSION"), Some("102"));
        assert_eq!(message.headers.get("SECURITY"), Some("NONE"));
        assert_eq!(message.headers.get("NEWFILEUID").unwrap().len(), 32);
        assert!(message.to_wire().contains("\r\n\r\n<OFX>"));
    }

    #[test]
    fn test_bank_statement_body() {
        let message = encode_request(&checking()).unwrap();
        let body = &message.body;
        assert!(body.starts_with("<OFX>"));
        assert!(body.contains("<SIGNONMSGSRQV1>"));
        assert!(body.contains("<USERID>jdoe"));
        assert!(body.contains("<ORG>WF"));
        assert!(body.contains("<FID>3000"));
        assert!(body.contains("<BANKMSGSRQV1>"));
        assert!(body.contains("<STMTTRNRQ>"));
        assert!(body.contains("<BANKID>121000248"));
        assert!(body.contains("<ACCTTYPE>CHECKING"));
        assert!(body.contains("<DTSTART>20240101"));
        assert!(body.contains("<DTEND>20240131"));
        assert!(!body.contains("<CLIENTUID>"));
    }

    #[test]
    fn test_open_ended_range_omits_dtend() {
        let mut ctx = checking();
        ctx.operation = Operation::Statement(range((2024, 1, 1), None));
        let message = encode_request(&ctx).unwrap();
        assert!(message.body.contains("<DTSTART>20240101"));
        assert!(!message.body.contains("<DTEND>"));
    }

    #[test]
    fn test_credit_card_has_no_routing_id() {
        let ctx = RequestContext::statement(
            "1001",
            "Chase",
            Credentials::new("jdoe", "secret"),
            "4111111111111111",
            AccountType::CreditCard,
            range((2024, 1, 1), None),
        )
        .with_client_uid("abc-123");
        let message = encode_request(&ctx).unwrap();
        assert!(message.body.contains("<CREDITCARDMSGSRQV1>"));
        assert!(message.body.contains("<CCSTMTTRNRQ>"));
        assert!(message.body.contains("<CCACCTFROM>"));
        assert!(!message.body.contains("<BANKID>"));
        assert!(message.body.contains("<CLIENTUID>abc-123"));
    }

    #[test]
    fn test_investment_statement_flags() {
        let ctx = RequestContext::statement(
            "7776",
            "vanguard.com",
            Credentials::new("jdoe", "secret"),
            "88887777",
            AccountType::Investment,
            range((2024, 1, 1), Some((2024, 6, 30))),
        )
        .with_bank_id("vanguard.com")
        .with_investment_options(InvestmentOptions {
            include_open_orders: true,
            include_balance: false,
            ..Default::default()
        });
        let body = encode_request(&ctx).unwrap().body;
        assert!(body.contains("<INVSTMTMSGSRQV1>"));
        assert!(body.contains("<BROKERID>vanguard.com"));
        assert!(body.contains("<INCOO>Y"));
        assert!(body.contains("<INCPOS>"));
        assert!(body.contains("<INCBAL>N"));
    }

    #[test]
    fn test_account_list_body() {
        let ctx = RequestContext::account_list("3000", "WF", Credentials::new("jdoe", "secret"));
        let body = encode_request(&ctx).unwrap().body;
        assert!(body.contains("<SIGNUPMSGSRQV1>"));
        assert!(body.contains("<ACCTINFOTRNRQ>"));
        assert!(body.contains("<DTACCTUP>19700101000000"));
        assert!(!body.contains("<BANKMSGSRQV1>"));
    }

    #[test]
    fn test_tokens_are_independent() {
        let a = encode_request(&checking()).unwrap();
        let b = encode_request(&checking()).unwrap();
        assert_ne!(a.headers.get("NEWFILEUID"), b.headers.get("NEWFILEUID"));
        assert_ne!(transaction_uid(), transaction_uid());
        let cookie = client_cookie();
        assert_eq!(cookie.len(), 5);
        assert!(cookie.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn test_missing_routing_id_is_configuration_error() {
        let mut ctx = checking();
        ctx.bank_id = None;
        let err = encode_request(&ctx).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Configuration);
    }

    #[test]
    fn test_inverted_range_is_rejected() {
        let mut ctx = checking();
        ctx.operation = Operation::Statement(range((2024, 2, 1), Some((2024, 1, 1))));
        assert!(encode_request(&ctx).is_err());
    }
}
