//! Resets, GOAWAY, abort and disposal

use std::sync::atomic::Ordering;
use std::time::Duration;

use h2_mux::h2_codec::{create_goaway, create_rst_stream, create_settings};
use h2_mux::{error_code, settings_id, Error, FrameType};
use tokio_util::sync::CancellationToken;

use crate::mock_server::{connect, connect_with, get, spawn_send, test_config, wait_closed, wait_until};

fn source(err: &Error) -> &Error {
    match err {
        Error::RequestFailed { source, .. } => source,
        other => other,
    }
}

#[tokio::test]
async fn test_refused_stream_is_retryable_and_isolated() {
    let (conn, mut server, _pool) = connect().await;

    let first = spawn_send(&conn, get("/one"));
    server.read_headers().await;
    let second = spawn_send(&conn, get("/two"));
    let (header, _) = server.read_headers().await;
    assert_eq!(header.stream_id, 3);

    server.send(&create_rst_stream(3, error_code::REFUSED_STREAM)).await;
    let err = second.await.unwrap().unwrap_err();
    assert!(err.is_retryable());
    assert!(matches!(
        source(&err),
        Error::StreamReset { stream_id: 3, code: error_code::REFUSED_STREAM, .. }
    ));

    assert!(conn.is_usable());
    server.send_response(1, "200", true).await;
    first.await.unwrap().unwrap();

    let third = spawn_send(&conn, get("/three"));
    let (header, _) = server.read_headers().await;
    assert_eq!(header.stream_id, 5);
    server.send_response(5, "200", true).await;
    third.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_other_reset_codes_not_retryable() {
    let (conn, mut server, _pool) = connect().await;
    let pending = spawn_send(&conn, get("/"));
    server.read_headers().await;

    server.send(&create_rst_stream(1, error_code::INTERNAL_ERROR)).await;
    let err = pending.await.unwrap().unwrap_err();
    assert!(!err.is_retryable());
    assert_eq!(err.code(), Some(error_code::INTERNAL_ERROR));
}

#[tokio::test]
async fn test_truncated_frame_aborts_all_streams_with_same_cause() {
    let (conn, mut server, pool) = connect().await;

    let first = spawn_send(&conn, get("/one"));
    server.read_headers().await;
    let second = spawn_send(&conn, get("/two"));
    server.read_headers().await;

    // A DATA header announcing 10 bytes followed by only 3.
    server.send(&[0, 0, 10, 0, 0, 0, 0, 0, 1, b'a', b'b', b'c']).await;
    drop(server);

    for pending in [first, second] {
        let err = pending.await.unwrap().unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(
            source(&err),
            Error::PrematureEof { expected: 19, received: 12 }
        ));
    }
    assert!(matches!(
        conn.abort_error(),
        Some(Error::PrematureEof { expected: 19, received: 12 })
    ));
    wait_closed(&conn).await;
    wait_until(|| pool.closed_count() == 1).await;
}

#[tokio::test]
async fn test_peer_close_between_frames_is_missing_frame() {
    let (conn, server, pool) = connect().await;
    drop(server);
    wait_closed(&conn).await;
    assert!(matches!(conn.abort_error(), Some(Error::MissingFrame)));
    assert!(pool.invalidated.load(Ordering::SeqCst) >= 1);
}

#[tokio::test]
async fn test_goaway_resets_only_streams_above_last_stream_id() {
    let (conn, mut server, pool) = connect().await;

    let mut pending = Vec::new();
    for path in ["/1", "/3", "/5", "/7"] {
        pending.push(spawn_send(&conn, get(path)));
        server.read_headers().await;
    }
    let mut pending = pending.into_iter();
    let (one, three, five, seven) = (
        pending.next().unwrap(),
        pending.next().unwrap(),
        pending.next().unwrap(),
        pending.next().unwrap(),
    );

    server.send(&create_goaway(3, error_code::NO_ERROR)).await;
    for unprocessed in [five, seven] {
        let err = unprocessed.await.unwrap().unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(source(&err), Error::GoAway { last_stream_id: 3, .. }));
    }

    assert!(!conn.is_usable());
    wait_until(|| conn.active_stream_count() == 2).await;
    assert!(pool.invalidated.load(Ordering::SeqCst) >= 1);

    let err = conn.send(get("/late"), CancellationToken::new()).await.unwrap_err();
    assert!(err.is_retryable());
    assert!(matches!(source(&err), Error::ShuttingDown));

    server.send_response(1, "200", true).await;
    server.send_response(3, "200", true).await;
    one.await.unwrap().unwrap();
    three.await.unwrap().unwrap();

    // Draining finished: the transport is closed.
    let frames = server.read_until_closed().await;
    assert!(frames.iter().all(|f| f.kind() != Some(FrameType::Headers)));
    wait_closed(&conn).await;
    assert_eq!(pool.closed_count(), 1);
}

#[tokio::test]
async fn test_second_goaway_only_lowers_last_stream_id() {
    let (conn, mut server, _pool) = connect().await;
    let one = spawn_send(&conn, get("/1"));
    server.read_headers().await;
    let three = spawn_send(&conn, get("/3"));
    server.read_headers().await;

    server.send(&create_goaway(3, error_code::NO_ERROR)).await;
    server.send(&create_goaway(1, error_code::NO_ERROR)).await;
    let err = three.await.unwrap().unwrap_err();
    assert!(matches!(source(&err), Error::GoAway { last_stream_id: 1, .. }));

    server.send(&create_goaway(0x7FFF_FFFF, error_code::NO_ERROR)).await;
    server.send_response(1, "200", true).await;
    one.await.unwrap().unwrap();
    wait_closed(&conn).await;
}

#[tokio::test]
async fn test_goaway_wakes_requests_waiting_for_slots() {
    let (conn, mut server, _pool) =
        connect_with(test_config(), &[(settings_id::MAX_CONCURRENT_STREAMS, 1)]).await;
    let first = spawn_send(&conn, get("/1"));
    server.read_headers().await;
    let queued = spawn_send(&conn, get("/queued"));
    server.expect_no_frame(Duration::from_millis(50)).await;

    server.send(&create_goaway(1, error_code::NO_ERROR)).await;
    let err = queued.await.unwrap().unwrap_err();
    assert!(err.is_retryable());

    server.send_response(1, "200", true).await;
    first.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_abort_is_idempotent() {
    let (conn, mut server, pool) = connect().await;
    let first = spawn_send(&conn, get("/one"));
    server.read_headers().await;
    let second = spawn_send(&conn, get("/two"));
    server.read_headers().await;

    conn.abort(Error::KeepAliveTimeout(Duration::from_secs(1)));
    conn.abort(Error::MissingFrame);

    assert!(matches!(conn.abort_error(), Some(Error::KeepAliveTimeout(_))));
    for pending in [first, second] {
        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(source(&err), Error::KeepAliveTimeout(_)));
    }
    wait_closed(&conn).await;
    wait_until(|| pool.closed_count() == 1).await;

    // Aborted streams are not reset on the wire.
    let frames = server.read_until_closed().await;
    assert!(frames.iter().all(|f| f.kind() != Some(FrameType::RstStream)));
}

#[tokio::test]
async fn test_requests_after_abort_fail_with_abort_error() {
    let (conn, _server, _pool) = connect().await;
    conn.abort(Error::MissingFrame);
    let err = conn.send(get("/"), CancellationToken::new()).await.unwrap_err();
    assert!(matches!(source(&err), Error::MissingFrame));
}

#[tokio::test]
async fn test_dispose_waits_for_active_streams() {
    let (conn, mut server, pool) = connect().await;
    let pending = spawn_send(&conn, get("/"));
    server.read_headers().await;

    conn.dispose();
    assert!(!conn.is_usable());
    server.expect_no_frame(Duration::from_millis(50)).await;
    assert_eq!(pool.closed_count(), 0);

    server.send_response(1, "200", true).await;
    pending.await.unwrap().unwrap();
    assert!(server.read_until_closed().await.is_empty());
    wait_until(|| pool.closed_count() == 1).await;
}

#[tokio::test]
async fn test_dropping_idle_connection_closes_transport() {
    let (conn, mut server, pool) = connect().await;
    drop(conn);
    assert!(server.read_until_closed().await.is_empty());
    wait_until(|| pool.closed_count() == 1).await;
}

#[tokio::test]
async fn test_settings_shrinking_concurrency_keeps_open_streams() {
    let (conn, mut server, _pool) = connect().await;
    let first = spawn_send(&conn, get("/1"));
    server.read_headers().await;

    server.send(&create_settings(&[(settings_id::MAX_CONCURRENT_STREAMS, 0)])).await;
    server.expect_frame(FrameType::Settings).await;

    let blocked = spawn_send(&conn, get("/2"));
    server.expect_no_frame(Duration::from_millis(50)).await;

    server.send(&create_settings(&[(settings_id::MAX_CONCURRENT_STREAMS, 2)])).await;
    server.expect_frame(FrameType::Settings).await;
    let (header, _) = server.read_headers().await;
    assert_eq!(header.stream_id, 3);

    server.send_response(1, "200", true).await;
    server.send_response(3, "200", true).await;
    first.await.unwrap().unwrap();
    blocked.await.unwrap().unwrap();
}
