use criterion::{black_box, criterion_group, criterion_main, Criterion};

use venuebot::candle_close::CandleCloseDetector;
use venuebot::stream::codec::{BinanceCodec, BybitCodec, OkxCodec};
use venuebot::stream::{resolve_candle, StreamCodec};
use venuebot::types::Interval;

const BYBIT_KLINE: &str = r#"{"topic":"kline.15.BTCUSDT","type":"snapshot","ts":1705327500000,"data":[{"start":1705327200000,"end":1705328099999,"interval":"15","open":"50000","high":"50100","low":"49900","close":"50050","volume":"12.5","turnover":"625000","confirm":false,"timestamp":1705327500000}]}"#;

const BINANCE_KLINE: &str = r#"{"e":"kline","E":1705327500000,"s":"BTCUSDT","k":{"t":1705327200000,"T":1705328099999,"s":"BTCUSDT","i":"15m","o":"50000","c":"50050","h":"50100","l":"49900","v":"12.5","x":false}}"#;

const OKX_CANDLE: &str = r#"{"arg":{"channel":"candle15m","instId":"BTC-USDT-SWAP"},"data":[["1705327200000","50000","50100","49900","50050","12.5","0.0125","625000","0"]]}"#;

fn parse_frames(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse");
    group.bench_function("bybit_kline", |b| b.iter(|| BybitCodec.parse(black_box(BYBIT_KLINE))));
    group.bench_function("binance_kline", |b| b.iter(|| BinanceCodec.parse(black_box(BINANCE_KLINE))));
    group.bench_function("okx_candle", |b| b.iter(|| OkxCodec.parse(black_box(OKX_CANDLE))));
    group.finish();
}

fn resolve_closes(c: &mut Criterion) {
    let frames = BybitCodec.parse(BYBIT_KLINE).unwrap_or_default();
    c.bench_function("resolve_candle", |b| {
        b.iter(|| {
            let mut detector = CandleCloseDetector::new(Interval::Min15);
            let mut pending = None;
            for frame in frames.iter().cloned() {
                if let venuebot::stream::Frame::Candle(candle) = frame {
                    black_box(resolve_candle(&mut detector, &mut pending, candle));
                }
            }
        })
    });
}

criterion_group!(benches, parse_frames, resolve_closes);
criterion_main!(benches);
