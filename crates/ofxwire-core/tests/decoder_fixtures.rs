//! Decoder behaviour on realistic institution responses


use ofxwire_core::{decode, Decoder, DecoderConfig, ErrorCode};
use serde_json::Value;
use std::io::Write;
use tempfile::NamedTempFile;
use test_support::{statement_with_transactions, SIGNON_REJECTED, WELLS_FARGO_STATEMENT};

const TRANSACTIONS: &str = "/OFX/BANKMSGSRSV1/STMTTRNRS/STMTRS/BANKTRANLIST/STMTTRN";

#[test]
fn test_single_transaction_stays_scalar() {
    let parsed = decode(WELLS_FARGO_STATEMENT).unwrap();

    let txn = parsed.get(TRANSACTIONS).unwrap();
    assert!(txn.is_object(), "a lone STMTTRN is not wrapped in an array");
    assert_eq!(txn["TRNAMT"], "-150.00");
    assert_eq!(txn["NAME"], "ELECTRIC COMPANY");
    assert_eq!(parsed.list_at(TRANSACTIONS).len(), 1);
}

#[test]
fn test_header_block() {
    let parsed = decode(WELLS_FARGO_STATEMENT).unwrap();
    let header = parsed.header();

    assert_eq!(header.get("OFXHEADER"), Some("100"));
    assert_eq!(header.get("VERSION"), Some("103"));
    assert_eq!(header.get("DATA"), Some("OFXSGML"));
    let keys: Vec<_> = header.keys().collect();
    assert_eq!(keys.first(), Some(&"OFXHEADER"));
    assert_eq!(keys.last(), Some(&"NEWFILEUID"));
}

#[test]
fn test_aggregates_and_leaves() {
    let parsed = decode(WELLS_FARGO_STATEMENT).unwrap();

    assert_eq!(
        parsed.text_at("/OFX/SIGNONMSGSRSV1/SONRS/FI/ORG"),
        Some("WF")
    );
    assert_eq!(
        parsed.text_at("/OFX/BANKMSGSRSV1/STMTTRNRS/STMTRS/BANKACCTFROM/ACCTTYPE"),
        Some("CHECKING")
    );
    assert_eq!(
        parsed.text_at("/OFX/BANKMSGSRSV1/STMTTRNRS/STMTRS/LEDGERBAL/BALAMT"),
        Some("2500.00")
    );
    assert_eq!(
        parsed.text_at("/OFX/SIGNONMSGSRSV1/SONRS/DTSERVER"),
        Some("20240131120000.000[-8:PST]")
    );
}

#[test]
fn test_repeated_transactions_become_ordered_array() {
    let parsed = decode(&statement_with_transactions(3)).unwrap();

    let list = parsed.get(TRANSACTIONS).and_then(Value::as_array).unwrap();
    assert_eq!(list.len(), 3);
    let ids: Vec<_> = list.iter().map(|t| t["FITID"].as_str().unwrap()).collect();
    assert_eq!(ids, ["FIT000000", "FIT000001", "FIT000002"]);
}

#[test]
fn test_statuses() {
    let status = decode(WELLS_FARGO_STATEMENT).unwrap().status();
    let signon = status.signon.unwrap();
    assert_eq!(signon.code, 0);
    assert_eq!(signon.severity, "INFO");
    assert_eq!(status.transactions.len(), 1);

    let rejected = decode(SIGNON_REJECTED).unwrap();
    let error = rejected.status_error().unwrap();
    assert_eq!(error.code(), ErrorCode::OfxSignonInvalid);
    assert_eq!(
        error.technical_details().ofx_message.as_deref(),
        Some("Invalid user ID or password")
    );
}

#[test]
fn test_chunked_and_unchunked_decode_agree() {
    let raw = statement_with_transactions(1500);

    let direct = Decoder::new(DecoderConfig {
        chunk_threshold_bytes: usize::MAX,
        transaction_threshold: usize::MAX,
        ..Default::default()
    });
    let chunked = Decoder::new(DecoderConfig {
        chunk_size: 512,
        ..Default::default()
    });
    assert!(!direct.uses_chunking(&raw));
    assert!(chunked.uses_chunking(&raw));

    let a = direct.decode(&raw).unwrap();
    let b = chunked.decode(&raw).unwrap();
    assert_eq!(a.body(), b.body());
    assert_eq!(a.list_at(TRANSACTIONS).len(), 1500);
}

#[test]
fn test_missing_root_is_parse_error() {
    let err = decode("OFXHEADER:100\r\n\r\n<HTML><BODY>Maintenance</BODY></HTML>").unwrap_err();
    assert_eq!(err.code(), ErrorCode::DataParsing);
}

#[test]
fn test_unterminated_tag_is_parse_error() {
    let err = decode("<OFX><SIGNONMSGSRSV1><SONRS").unwrap_err();
    assert_eq!(err.code(), ErrorCode::DataParsing);
}

#[test]
fn test_lowercase_root_and_xml_declaration() {
    let raw = "<?xml version=\"1.0\"?>\n<?OFX OFXHEADER=\"200\"?>\n<ofx><SIGNONMSGSRSV1><SONRS><STATUS><CODE>0</CODE><SEVERITY>INFO</SEVERITY></STATUS></SONRS></SIGNONMSGSRSV1></ofx>";
    let parsed = decode(raw).unwrap();
    // element names keep their source case
    assert_eq!(parsed.text_at("/ofx/SIGNONMSGSRSV1/SONRS/STATUS/CODE"), Some("0"));
}

#[tokio::test]
async fn test_decode_file() {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(WELLS_FARGO_STATEMENT.as_bytes()).unwrap();

    let parsed = Decoder::default().decode_file(file.path()).await.unwrap();
    assert_eq!(
        parsed.text_at(&format!("{}/TRNAMT", TRANSACTIONS)),
        Some("-150.00")
    );
}

#[tokio::test]
async fn test_decode_file_streams_small_reads() {
    let raw = statement_with_transactions(40);
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(raw.as_bytes()).unwrap();

    let decoder = Decoder::new(DecoderConfig {
        chunk_size: 7,
        ..Default::default()
    });
    let streamed = decoder.decode_file(file.path()).await.unwrap();
    let direct = decoder.decode(&raw).unwrap();

    assert_eq!(streamed.markup(), direct.markup());
    assert_eq!(streamed.header(), direct.header());
    assert_eq!(streamed.list_at(TRANSACTIONS).len(), 40);
}

#[tokio::test]
async fn test_decode_file_without_root() {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(b"OFXHEADER:100\r\nDATA:OFXSGML\r\n\r\n<HTML>error</HTML>").unwrap();

    let err = Decoder::default().decode_file(file.path()).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::DataParsing);
}

#[tokio::test]
async fn test_decode_missing_file() {
    let err = Decoder::default()
        .decode_file("/nonexistent/statement.ofx")
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::DataParsing);
}
