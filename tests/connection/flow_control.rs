//! Send and receive flow control

use std::time::Duration;

use bytes::Bytes;
use h2_mux::h2_codec::{create_settings, create_window_update, read_u31, read_u32};
use h2_mux::{error_code, settings_id, FrameType, RequestBody};
use http::Request;
use tokio::sync::mpsc;

use crate::mock_server::{connect_with, get, post, spawn_send, test_config, wait_closed};

fn streaming_put(path: &str) -> (mpsc::Sender<Bytes>, Request<RequestBody>) {
    let (tx, rx) = mpsc::channel(8);
    let request = Request::put(format!("https://example.com{}", path))
        .body(RequestBody::streaming(rx))
        .unwrap();
    (tx, request)
}

#[tokio::test]
async fn test_initial_window_shrink_suspends_body_sends() {
    let (conn, mut server, _pool) =
        connect_with(test_config(), &[(settings_id::INITIAL_WINDOW_SIZE, 1000)]).await;

    let (tx1, request1) = streaming_put("/one");
    let (tx3, request3) = streaming_put("/three");
    let _pending1 = spawn_send(&conn, request1);
    let (header, _) = server.read_headers().await;
    assert_eq!(header.stream_id, 1);
    let _pending3 = spawn_send(&conn, request3);
    let (header, _) = server.read_headers().await;
    assert_eq!(header.stream_id, 3);

    // Both streams hold 1000 bytes of credit; shrinking the initial window
    // to 0 takes all of it away.
    server.send(&create_settings(&[(settings_id::INITIAL_WINDOW_SIZE, 0)])).await;
    let ack = server.expect_frame(FrameType::Settings).await;
    assert!(ack.header.is_ack());

    tx1.send(Bytes::from_static(b"abc")).await.unwrap();
    tx3.send(Bytes::from_static(b"abc")).await.unwrap();
    server.expect_no_frame(Duration::from_millis(150)).await;

    server.send(&create_window_update(1, 2)).await;
    let data = server.expect_frame(FrameType::Data).await;
    assert_eq!(data.stream_id(), 1);
    assert_eq!(data.payload, b"ab");
    server.expect_no_frame(Duration::from_millis(100)).await;

    server.send(&create_window_update(3, 10)).await;
    let data = server.expect_frame(FrameType::Data).await;
    assert_eq!(data.stream_id(), 3);
    assert_eq!(data.payload, b"abc");
}

#[tokio::test]
async fn test_connection_window_limits_all_streams() {
    let (conn, mut server, _pool) =
        connect_with(test_config(), &[(settings_id::INITIAL_WINDOW_SIZE, 1 << 20)]).await;

    // The connection send window starts at 65535.
    let pending = spawn_send(&conn, Request::post("https://example.com/big").body(RequestBody::from(vec![1u8; 70_000])).unwrap());
    server.read_headers().await;

    let mut received = 0;
    while received < 65535 {
        let data = server.expect_frame(FrameType::Data).await;
        received += data.payload.len();
    }
    assert_eq!(received, 65535);
    server.expect_no_frame(Duration::from_millis(100)).await;

    server.send(&create_window_update(0, 10_000)).await;
    let data = server.expect_frame(FrameType::Data).await;
    assert_eq!(data.payload.len(), 70_000 - 65535);
    assert!(data.header.is_end_stream());

    server.send_response(1, "200", true).await;
    pending.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_connection_window_update_batched() {
    let config = test_config()
        .with_connection_window_size(8 * 65536)
        .with_initial_stream_window_size(1 << 20);
    let (conn, mut server, _pool) = connect_with(config, &[]).await;

    let pending = spawn_send(&conn, get("/download"));
    server.read_headers().await;
    server.send_response(1, "200", false).await;
    let _response = pending.await.unwrap().unwrap();

    let chunk = vec![0u8; 16384];
    for _ in 0..3 {
        server.send_data(1, &chunk, false).await;
    }
    server.expect_no_frame(Duration::from_millis(100)).await;

    server.send_data(1, &chunk, false).await;
    let update = server.expect_frame(FrameType::WindowUpdate).await;
    assert_eq!(update.stream_id(), 0);
    assert_eq!(read_u31(&update.payload), 65536);
    server.expect_no_frame(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn test_stream_window_update_after_consumption() {
    let config = test_config().with_initial_stream_window_size(1000);
    let (conn, mut server, _pool) = connect_with(config, &[]).await;

    let pending = spawn_send(&conn, get("/"));
    server.read_headers().await;
    server.send_response(1, "200", false).await;
    server.send_data(1, &[1u8; 600], false).await;

    let mut body = pending.await.unwrap().unwrap().into_body();
    assert_eq!(body.chunk().await.unwrap().unwrap().len(), 600);

    let update = server.expect_frame(FrameType::WindowUpdate).await;
    assert_eq!(update.stream_id(), 1);
    assert_eq!(read_u31(&update.payload), 600);
}

#[tokio::test]
async fn test_data_beyond_stream_window_resets_stream() {
    let config = test_config().with_initial_stream_window_size(100);
    let (conn, mut server, _pool) = connect_with(config, &[]).await;

    let pending = spawn_send(&conn, get("/"));
    server.read_headers().await;
    server.send_response(1, "200", false).await;
    let mut body = pending.await.unwrap().unwrap().into_body();

    server.send_data(1, &[0u8; 200], false).await;
    let rst = server.expect_frame(FrameType::RstStream).await;
    assert_eq!(rst.stream_id(), 1);
    assert_eq!(read_u32(&rst.payload), error_code::FLOW_CONTROL_ERROR);

    let err = body.chunk().await.unwrap_err();
    assert_eq!(err.code(), Some(error_code::FLOW_CONTROL_ERROR));
    assert!(conn.is_usable());
}

#[tokio::test]
async fn test_window_overflow_is_connection_error() {
    let (conn, mut server, _pool) = connect_with(test_config(), &[]).await;
    server.send(&create_window_update(0, 0x7FFF_FFFF)).await;
    wait_closed(&conn).await;
    assert_eq!(conn.abort_error().unwrap().code(), Some(error_code::FLOW_CONTROL_ERROR));
}

#[tokio::test]
async fn test_zero_window_increment_is_protocol_error() {
    let (conn, mut server, _pool) = connect_with(test_config(), &[]).await;
    server.send(&create_window_update(0, 0)).await;
    wait_closed(&conn).await;
    assert_eq!(conn.abort_error().unwrap().code(), Some(error_code::PROTOCOL_ERROR));
}

#[tokio::test]
async fn test_window_update_for_idle_stream_is_protocol_error() {
    let (conn, mut server, _pool) = connect_with(test_config(), &[]).await;
    server.send(&create_window_update(9, 100)).await;
    wait_closed(&conn).await;
    assert_eq!(conn.abort_error().unwrap().code(), Some(error_code::PROTOCOL_ERROR));
}

#[tokio::test]
async fn test_headers_flushed_when_stream_window_is_zero() {
    let (conn, mut server, _pool) =
        connect_with(test_config(), &[(settings_id::INITIAL_WINDOW_SIZE, 0)]).await;

    let pending = spawn_send(&conn, post("/submit", "payload"));
    let (header, _) = server.read_headers().await;
    assert_eq!(header.stream_id, 1);
    assert!(!header.is_end_stream());
    server.expect_no_frame(Duration::from_millis(100)).await;

    server.send(&create_window_update(1, 7)).await;
    let data = server.expect_frame(FrameType::Data).await;
    assert_eq!(data.payload, b"payload");
    assert!(data.header.is_end_stream());

    server.send_response(1, "200", true).await;
    pending.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_headers_flushed_when_connection_window_is_zero() {
    let (conn, mut server, _pool) =
        connect_with(test_config(), &[(settings_id::INITIAL_WINDOW_SIZE, 1 << 20)]).await;

    // Spend the whole 65535-byte connection send window.
    let first = spawn_send(&conn, post("/fill", vec![0u8; 65535]));
    server.read_headers().await;
    loop {
        if server.expect_frame(FrameType::Data).await.header.is_end_stream() {
            break;
        }
    }
    server.send_response(1, "200", true).await;
    first.await.unwrap().unwrap();

    let second = spawn_send(&conn, post("/next", "payload"));
    let (header, _) = server.read_headers().await;
    assert_eq!(header.stream_id, 3);
    server.expect_no_frame(Duration::from_millis(100)).await;

    server.send(&create_window_update(0, 100)).await;
    let data = server.expect_frame(FrameType::Data).await;
    assert_eq!(data.stream_id(), 3);
    assert_eq!(data.payload, b"payload");

    server.send_response(3, "200", true).await;
    second.await.unwrap().unwrap();
}
