//! Request submission and response delivery

use std::collections::HashSet;
use std::time::Duration;

use bytes::Bytes;
use h2_mux::h2_codec::read_u32;
use h2_mux::{error_code, settings_id, Error, FrameType, RequestBody};
use http::{Request, StatusCode, Version};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::mock_server::{connect, connect_with, get, header_value, post, spawn_send, test_config, wait_until};

#[tokio::test]
async fn test_get_without_body_uses_stream_1_then_3() {
    let (conn, mut server, _pool) = connect().await;

    let first = spawn_send(&conn, get("/first"));
    let (header, headers) = server.read_headers().await;
    assert_eq!(header.stream_id, 1);
    assert!(header.is_end_stream());
    assert!(header.is_end_headers());
    assert_eq!(header_value(&headers, ":method"), Some("GET"));
    assert_eq!(header_value(&headers, ":scheme"), Some("https"));
    assert_eq!(header_value(&headers, ":authority"), Some("example.com"));
    assert_eq!(header_value(&headers, ":path"), Some("/first"));

    server
        .send_header_block(1, &[(":status", "200"), ("content-type", "text/plain")], false)
        .await;
    server.send_data(1, b"hello", true).await;

    let response = first.await.unwrap().unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.version(), Version::HTTP_2);
    assert_eq!(response.headers()["content-type"], "text/plain");
    assert_eq!(response.into_body().collect().await.unwrap(), Bytes::from_static(b"hello"));

    let second = spawn_send(&conn, get("/second"));
    let (header, _) = server.read_headers().await;
    assert_eq!(header.stream_id, 3);
    server.send_response(3, "204", true).await;
    let response = second.await.unwrap().unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(response.body().is_end_stream());
}

#[tokio::test]
async fn test_post_body_follows_headers() {
    let (conn, mut server, _pool) = connect().await;

    let pending = spawn_send(&conn, post("/submit", "payload"));
    let (header, _) = server.read_headers().await;
    assert!(!header.is_end_stream());

    let data = server.expect_frame(FrameType::Data).await;
    assert_eq!(data.stream_id(), 1);
    assert!(data.header.is_end_stream());
    assert_eq!(data.payload, b"payload");

    server.send_response(1, "201", true).await;
    assert_eq!(pending.await.unwrap().unwrap().status(), StatusCode::CREATED);
}

#[tokio::test]
async fn test_large_body_split_into_max_size_frames() {
    let (conn, mut server, _pool) =
        connect_with(test_config(), &[(settings_id::INITIAL_WINDOW_SIZE, 1 << 20)]).await;

    let body = vec![7u8; 40_000];
    let pending = spawn_send(&conn, post("/upload", body));
    server.read_headers().await;

    let mut sizes = Vec::new();
    loop {
        let frame = server.expect_frame(FrameType::Data).await;
        sizes.push(frame.payload.len());
        if frame.header.is_end_stream() {
            break;
        }
    }
    assert_eq!(sizes, vec![16384, 16384, 7232]);

    server.send_response(1, "200", true).await;
    pending.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_streaming_body_ends_with_empty_data_frame() {
    let (conn, mut server, _pool) = connect().await;
    let (tx, rx) = mpsc::channel(4);
    let request = Request::put("https://example.com/stream")
        .body(RequestBody::streaming(rx))
        .unwrap();
    let pending = spawn_send(&conn, request);

    let (header, _) = server.read_headers().await;
    assert!(!header.is_end_stream());

    tx.send(Bytes::from_static(b"chunk-1")).await.unwrap();
    let data = server.expect_frame(FrameType::Data).await;
    assert_eq!(data.payload, b"chunk-1");
    assert!(!data.header.is_end_stream());

    tx.send(Bytes::from_static(b"chunk-2")).await.unwrap();
    drop(tx);
    let data = server.expect_frame(FrameType::Data).await;
    assert_eq!(data.payload, b"chunk-2");
    let end = server.expect_frame(FrameType::Data).await;
    assert!(end.payload.is_empty());
    assert!(end.header.is_end_stream());

    server.send_response(1, "200", true).await;
    pending.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_concurrent_large_header_blocks_are_never_interleaved() {
    let (conn, mut server, _pool) = connect().await;

    let requests = 8;
    let mut pending = Vec::new();
    for i in 0..requests {
        let big = "v".repeat(40_000 + i);
        let request = Request::get(format!("https://example.com/{}", i))
            .header("x-big", big)
            .body(RequestBody::empty())
            .unwrap();
        pending.push(spawn_send(&conn, request));
    }

    let mut open: Option<u32> = None;
    let mut completed = HashSet::new();
    while completed.len() < requests {
        let frame = server.read_frame().await;
        match frame.kind() {
            Some(FrameType::Headers) => {
                assert!(open.is_none(), "HEADERS for stream {} inside another header block", frame.stream_id());
                if frame.header.is_end_headers() {
                    completed.insert(frame.stream_id());
                } else {
                    open = Some(frame.stream_id());
                }
            }
            Some(FrameType::Continuation) => {
                assert_eq!(open, Some(frame.stream_id()), "CONTINUATION for the wrong stream");
                if frame.header.is_end_headers() {
                    completed.insert(frame.stream_id());
                    open = None;
                }
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    for stream_id in completed {
        server.send_response(stream_id, "200", true).await;
    }
    for request in pending {
        request.await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn test_informational_response_skipped() {
    let (conn, mut server, _pool) = connect().await;
    let pending = spawn_send(&conn, get("/"));
    server.read_headers().await;

    server.send_response(1, "100", false).await;
    server.send_response(1, "200", true).await;
    assert_eq!(pending.await.unwrap().unwrap().status(), StatusCode::OK);
}

#[tokio::test]
async fn test_response_trailers() {
    let (conn, mut server, _pool) = connect().await;
    let pending = spawn_send(&conn, get("/"));
    server.read_headers().await;

    server.send_response(1, "200", false).await;
    server.send_data(1, b"body", false).await;
    server.send_header_block(1, &[("grpc-status", "0")], true).await;

    let mut body = pending.await.unwrap().unwrap().into_body();
    assert_eq!(body.chunk().await.unwrap(), Some(Bytes::from_static(b"body")));
    assert_eq!(body.chunk().await.unwrap(), None);
    assert!(body.is_end_stream());
    assert_eq!(body.trailers().unwrap()["grpc-status"], "0");
}

#[tokio::test]
async fn test_missing_status_resets_stream() {
    let (conn, mut server, _pool) = connect().await;
    let pending = spawn_send(&conn, get("/"));
    server.read_headers().await;

    server.send_header_block(1, &[("content-type", "text/plain")], true).await;
    let rst = server.expect_frame(FrameType::RstStream).await;
    assert_eq!(rst.stream_id(), 1);
    assert_eq!(read_u32(&rst.payload), error_code::PROTOCOL_ERROR);

    let err = pending.await.unwrap().unwrap_err();
    assert_eq!(err.code(), Some(error_code::PROTOCOL_ERROR));
    assert!(!err.is_retryable());
    assert!(conn.is_usable(), "A stream error leaves the connection usable");
}

#[tokio::test]
async fn test_cancel_while_awaiting_response_sends_rst_cancel() {
    let (conn, mut server, _pool) = connect().await;
    let cancel = CancellationToken::new();
    let task = {
        let conn = conn.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { conn.send(get("/slow"), cancel).await })
    };
    server.read_headers().await;

    cancel.cancel();
    assert!(matches!(task.await.unwrap(), Err(Error::Cancelled)));

    let rst = server.expect_frame(FrameType::RstStream).await;
    assert_eq!(rst.stream_id(), 1);
    assert_eq!(read_u32(&rst.payload), error_code::CANCEL);
    wait_until(|| conn.active_stream_count() == 0).await;
}

#[tokio::test]
async fn test_dropping_unfinished_body_resets_stream() {
    let (conn, mut server, _pool) = connect().await;
    let pending = spawn_send(&conn, get("/"));
    server.read_headers().await;
    server.send_response(1, "200", false).await;

    let response = pending.await.unwrap().unwrap();
    assert_eq!(conn.active_stream_count(), 1);
    drop(response);

    let rst = server.expect_frame(FrameType::RstStream).await;
    assert_eq!(read_u32(&rst.payload), error_code::CANCEL);
    wait_until(|| conn.active_stream_count() == 0).await;
}

#[tokio::test]
async fn test_early_response_stops_request_body() {
    let (conn, mut server, _pool) = connect().await;
    let (tx, rx) = mpsc::channel(4);
    let request = Request::post("https://example.com/upload")
        .body(RequestBody::streaming(rx))
        .unwrap();
    let pending = spawn_send(&conn, request);
    server.read_headers().await;

    server.send_response(1, "413", true).await;
    let response = pending.await.unwrap().unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);

    let rst = server.expect_frame(FrameType::RstStream).await;
    assert_eq!(rst.stream_id(), 1);
    assert_eq!(read_u32(&rst.payload), error_code::CANCEL);

    // The body source is no longer drained.
    let _ = tx.send(Bytes::from_static(b"late")).await;
    server.expect_no_frame(Duration::from_millis(100)).await;
    assert_eq!(conn.active_stream_count(), 0);
}

#[tokio::test]
async fn test_concurrent_stream_limit_queues_requests() {
    let (conn, mut server, _pool) =
        connect_with(test_config(), &[(settings_id::MAX_CONCURRENT_STREAMS, 1)]).await;

    let first = spawn_send(&conn, get("/a"));
    let (header, _) = server.read_headers().await;
    assert_eq!(header.stream_id, 1);

    let second = spawn_send(&conn, get("/b"));
    server.expect_no_frame(Duration::from_millis(100)).await;

    server.send_response(1, "200", true).await;
    first.await.unwrap().unwrap();

    let (header, _) = server.read_headers().await;
    assert_eq!(header.stream_id, 3);
    server.send_response(3, "200", true).await;
    second.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_connect_method_rejected() {
    let (conn, _server, _pool) = connect().await;
    let request = Request::connect("example.com:443").body(RequestBody::empty()).unwrap();
    let err = conn.send(request, CancellationToken::new()).await.unwrap_err();
    match err {
        Error::RequestFailed { allow_retry, source } => {
            assert!(!allow_retry);
            assert!(matches!(*source, Error::InvalidRequest(_)));
        }
        other => panic!("unexpected error {:?}", other),
    }
}

#[tokio::test]
async fn test_completed_duplex_requests_leave_no_tasks_behind() {
    let (conn, mut server, _pool) = connect().await;
    let metrics = tokio::runtime::Handle::current().metrics();
    let baseline = metrics.num_alive_tasks();

    for (i, stream_id) in [1u32, 3, 5].into_iter().enumerate() {
        let (tx, rx) = mpsc::channel(4);
        let request = Request::put(format!("https://example.com/duplex/{}", i))
            .body(RequestBody::streaming(rx))
            .unwrap();
        let pending = spawn_send(&conn, request);
        server.read_headers().await;

        // Response headers arrive while the request body is still open.
        server.send_response(stream_id, "200", false).await;
        let mut body = pending.await.unwrap().unwrap().into_body();

        tx.send(Bytes::from_static(b"ping")).await.unwrap();
        drop(tx);
        assert_eq!(server.expect_frame(FrameType::Data).await.payload, b"ping");
        assert!(server.expect_frame(FrameType::Data).await.header.is_end_stream());

        server.send_data(stream_id, b"pong", true).await;
        assert_eq!(body.chunk().await.unwrap(), Some(Bytes::from_static(b"pong")));
        assert_eq!(body.chunk().await.unwrap(), None);
    }

    wait_until(|| conn.active_stream_count() == 0).await;
    wait_until(|| metrics.num_alive_tasks() <= baseline).await;
}
