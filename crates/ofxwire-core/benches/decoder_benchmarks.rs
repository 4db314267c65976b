//! Decoder benchmarks
//!
//! Compares the single-pass and chunked normalization paths on statements of
//! increasing size.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ofxwire_core::decoder::{normalize, normalize_chunked};
use ofxwire_core::{Decoder, DecoderConfig};

fn statement(transactions: usize) -> String {
    let mut body = String::from(
        "OFXHEADER:100\r\nDATA:OFXSGML\r\nVERSION:102\r\n\r\n\
<OFX><SIGNONMSGSRSV1><SONRS><STATUS><CODE>0<SEVERITY>INFO</STATUS><DTSERVER>20240131</SONRS></SIGNONMSGSRSV1>\r\n\
<BANKMSGSRSV1><STMTTRNRS><TRNUID>1<STATUS><CODE>0<SEVERITY>INFO</STATUS><STMTRS><CURDEF>USD\r\n\
<BANKTRANLIST><DTSTART>20240101<DTEND>20240131\r\n",
    );
    for i in 0..transactions {
        body.push_str(&format!(
            "<STMTTRN><TRNTYPE>DEBIT<DTPOSTED>20240115<TRNAMT>-{}.25<FITID>{:08}<NAME>MERCHANT {}<MEMO>CARD PURCHASE</STMTTRN>\r\n",
            i % 500,
            i,
            i % 37
        ));
    }
    body.push_str("</BANKTRANLIST></STMTRS></STMTTRNRS></BANKMSGSRSV1></OFX>\r\n");
    body
}

fn bench_normalize(c: &mut Criterion) {
    let mut group = c.benchmark_group("normalize");

    for size in [100, 1_000, 10_000] {
        let raw = statement(size);
        group.throughput(Throughput::Bytes(raw.len() as u64));

        group.bench_with_input(BenchmarkId::new("single_pass", size), &raw, |b, raw| {
            b.iter(|| normalize(black_box(raw)).unwrap())
        });
        group.bench_with_input(BenchmarkId::new("chunked_64k", size), &raw, |b, raw| {
            b.iter(|| normalize_chunked(black_box(raw), 64 * 1024).unwrap())
        });
    }

    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");
    let direct = Decoder::new(DecoderConfig {
        chunk_threshold_bytes: usize::MAX,
        transaction_threshold: usize::MAX,
        ..Default::default()
    });
    let chunked = Decoder::new(DecoderConfig {
        chunk_threshold_bytes: 1,
        ..Default::default()
    });

    for size in [100, 5_000] {
        let raw = statement(size);
        group.bench_with_input(BenchmarkId::new("direct", size), &raw, |b, raw| {
            b.iter(|| direct.decode(black_box(raw)).unwrap())
        });
        group.bench_with_input(BenchmarkId::new("chunked", size), &raw, |b, raw| {
            b.iter(|| chunked.decode(black_box(raw)).unwrap())
        });
    }

    group.finish();
}

criterion_group!(benches, bench_normalize, bench_decode);
criterion_main!(benches);
