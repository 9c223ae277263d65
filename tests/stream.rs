//! Stream handler against a local WebSocket server

use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use venuebot::stream::codec::BybitCodec;
use venuebot::stream::{StreamEvent, StreamHandler, StreamSettings, StreamState};
use venuebot::types::Interval;

const BAR_OPEN_MS: i64 = 1_705_327_200_000; // 2024-01-15 14:00:00 UTC

fn kline_frame(confirm: bool, close: &str) -> String {
    format!(
        r#"{{"topic":"kline.15.BTCUSDT","type":"snapshot","data":[{{"start":{BAR_OPEN_MS},"end":{},"interval":"15","open":"50000","high":"50100","low":"49900","close":"{close}","volume":"12.5","confirm":{confirm}}}]}}"#,
        BAR_OPEN_MS + 899_999
    )
}

fn fast_settings() -> StreamSettings {
    StreamSettings {
        max_reconnect_attempts: 1,
        base_delay_secs: 0.01,
        stop_join_timeout_secs: 2,
        ..StreamSettings::default()
    }
}

async fn next_event(rx: &mut mpsc::Receiver<StreamEvent>) -> StreamEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("stream event in time")
        .expect("channel open")
}

#[tokio::test]
async fn confirmed_kline_arrives_as_close() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
        let subscribe = match ws.next().await {
            Some(Ok(Message::Text(text))) => text,
            other => panic!("expected subscribe, got {other:?}"),
        };
        ws.send(Message::Text(kline_frame(false, "50050"))).await.unwrap();
        ws.send(Message::Text(kline_frame(true, "50080"))).await.unwrap();
        while let Some(Ok(msg)) = ws.next().await {
            if msg.is_close() {
                break;
            }
        }
        subscribe
    });

    let (tx, mut rx) = mpsc::channel(16);
    let handle = StreamHandler::with_codec(Arc::new(BybitCodec), "BTCUSDT", Interval::Min15, fast_settings())
        .with_url(format!("ws://{addr}"))
        .spawn(tx);

    assert_eq!(next_event(&mut rx).await, StreamEvent::Connected);
    let StreamEvent::Candle(forming) = next_event(&mut rx).await else {
        panic!("expected candle");
    };
    assert!(!forming.is_close);
    assert_eq!(forming.candle.close, 50_050.0);

    let StreamEvent::Candle(closed) = next_event(&mut rx).await else {
        panic!("expected candle");
    };
    assert!(closed.is_close);
    assert_eq!(closed.candle.timestamp.timestamp_millis(), BAR_OPEN_MS);
    assert_eq!(closed.candle.close, 50_080.0);

    assert!(handle.is_healthy(Duration::from_secs(30)));

    handle.stop().await;
    assert_eq!(handle.state(), StreamState::Stopped);
    assert!(!handle.is_healthy(Duration::from_secs(30)));

    let subscribe = server.await.unwrap();
    assert!(subscribe.contains(r#""op": "subscribe""#));
    assert!(subscribe.contains("BTCUSDT"));
}
