//! End-to-end scenarios against the in-memory mock transport.

mod support;

use bytes::{Buf, Bytes};
use http::{Method, Request, StatusCode};

use support::mock_quic;

#[tokio::test]
async fn handshake_completes_both_sides() {
    let (client_conn, server_conn) = mock_quic::pair::<Bytes>();

    let (client_res, server_res) = tokio::join!(rh3::client::new(client_conn), rh3::server::Connection::new(server_conn));

    client_res.expect("client handshake completes");
    server_res.expect("server handshake completes");
}

#[tokio::test]
async fn simple_get_roundtrip() {
    let (client_conn, server_conn) = mock_quic::pair::<Bytes>();

    let server_task = tokio::spawn(async move {
        let mut h3 = rh3::server::Connection::new(server_conn).await.expect("server handshake");
        let (req, mut stream) = h3.accept().await.expect("accept does not error").expect("a request arrives");

        assert_eq!(req.method(), Method::GET);
        assert_eq!(req.uri().path(), "/");
        assert_eq!(req.headers().get("user-agent").unwrap(), "test");
        assert_eq!(req.headers().get("accept").unwrap(), "*/*");

        let response = http::Response::builder().status(StatusCode::OK).body(()).unwrap();
        stream.send_response(response).await.expect("send response");
        stream.finish().await.expect("finish response");
        h3.shutdown(0).await.expect("graceful shutdown");
    });

    let (mut driver, mut send_request) = rh3::client::new(client_conn).await.expect("client handshake");
    let driver_task = tokio::spawn(async move {
        let _ = futures_util::future::poll_fn(|cx| driver.poll_close(cx)).await;
    });

    let req = Request::builder()
        .method(Method::GET)
        .uri("https://example.com/")
        .header("user-agent", "test")
        .header("accept", "*/*")
        .body(())
        .unwrap();

    let mut stream = send_request.send_request(req).await.expect("send request");
    stream.finish().await.expect("finish request body");
    let resp = stream.recv_response().await.expect("receive response");
    assert_eq!(resp.status(), StatusCode::OK);

    server_task.await.expect("server task does not panic");
    driver_task.abort();
}

#[tokio::test]
async fn response_body_is_delivered_in_order() {
    let (client_conn, server_conn) = mock_quic::pair::<Bytes>();

    let server_task = tokio::spawn(async move {
        let mut h3 = rh3::server::Connection::new(server_conn).await.expect("server handshake");
        let (_, mut stream) = h3.accept().await.expect("accept does not error").expect("a request arrives");

        let response = http::Response::builder().status(StatusCode::OK).body(()).unwrap();
        stream.send_response(response).await.expect("send response");
        stream.send_data(Bytes::from_static(b"HELLO WORLD!\n")).await.expect("send body");
        stream.finish().await.expect("finish response");
        h3.shutdown(0).await.expect("graceful shutdown");
    });

    let (mut driver, mut send_request) = rh3::client::new(client_conn).await.expect("client handshake");
    let driver_task = tokio::spawn(async move {
        let _ = futures_util::future::poll_fn(|cx| driver.poll_close(cx)).await;
    });

    let req = Request::builder().method(Method::GET).uri("https://example.com/").body(()).unwrap();
    let mut stream = send_request.send_request(req).await.expect("send request");
    stream.finish().await.expect("finish request body");

    let resp = stream.recv_response().await.expect("receive response");
    assert_eq!(resp.status(), StatusCode::OK);

    let body = stream.recv_data().await.expect("receive body").expect("body chunk present");
    assert_eq!(&body.chunk()[..body.remaining()], b"HELLO WORLD!\n");

    assert!(stream.recv_data().await.expect("receive end of body").is_none());

    server_task.await.expect("server task does not panic");
    driver_task.abort();
}

#[tokio::test]
async fn handshake_failure_reports_shutdown_initiated_by_transport() {
    use std::sync::{Arc, Mutex};

    use rh3::{Api, Connection, Event};

    let conn = mock_quic::refused::<Bytes>();
    let api = Api::open();

    let events: Arc<Mutex<Vec<Event>>> = Arc::new(Mutex::new(Vec::new()));
    let recorded = events.clone();

    let result = Connection::open(&api, conn, move |ev| recorded.lock().unwrap().push(ev)).await;
    assert!(result.is_err(), "no peer ever accepts the streams this endpoint needs to open");

    let events = events.lock().unwrap();
    assert!(!events.iter().any(|e| matches!(e, Event::Connected)), "never observes Connected");
    assert!(matches!(events.first(), Some(Event::ShutdownInitiatedByTransport { .. })));
    assert!(matches!(events.get(1), Some(Event::ShutdownComplete)));
}

#[tokio::test]
async fn async_receive_pauses_until_complete_receive() {
    let (client_conn, server_conn) = mock_quic::pair::<Bytes>();

    let server_task = tokio::spawn(async move {
        let mut h3 = rh3::server::Connection::new(server_conn).await.expect("server handshake");
        let (_, mut stream) = h3.accept().await.expect("accept does not error").expect("a request arrives");

        let response = http::Response::builder().status(StatusCode::OK).body(()).unwrap();
        stream.send_response(response).await.expect("send response");
        stream.send_data(Bytes::from_static(b"first chunk")).await.expect("send first chunk");
        stream.send_data(Bytes::from_static(b"second chunk")).await.expect("send second chunk");
        stream.finish().await.expect("finish response");
        h3.shutdown(0).await.expect("graceful shutdown");
    });

    let (mut driver, mut send_request) = rh3::client::new(client_conn).await.expect("client handshake");
    let driver_task = tokio::spawn(async move {
        let _ = futures_util::future::poll_fn(|cx| driver.poll_close(cx)).await;
    });

    let req = Request::builder().method(Method::GET).uri("https://example.com/").body(()).unwrap();
    let mut stream = send_request.send_request(req).await.expect("send request");
    stream.finish().await.expect("finish request body");
    let resp = stream.recv_response().await.expect("receive response");
    assert_eq!(resp.status(), StatusCode::OK);

    let receive = stream.receive_control();

    let first = stream.recv_data().await.expect("receive first chunk").expect("chunk present");
    assert_eq!(&first.chunk()[..first.remaining()], b"first chunk");

    // Report the chunk as not fully consumed: delivery pauses until `complete_receive`.
    receive.set_receive_enabled(false);

    let mut recv_task = tokio::spawn(async move {
        let chunk = stream.recv_data().await.expect("receive second chunk").expect("chunk present");
        (stream, chunk)
    });

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert!(!recv_task.is_finished(), "recv_data stays pending while the gate is disabled");

    receive.complete_receive(first.remaining());

    let (mut stream, second) = recv_task.await.expect("recv task does not panic");
    assert_eq!(&second.chunk()[..second.remaining()], b"second chunk");

    assert!(stream.recv_data().await.expect("receive end of body").is_none());

    server_task.await.expect("server task does not panic");
    driver_task.abort();
}

#[tokio::test]
async fn peer_reset_is_observed() {
    use rh3::error::{Code, ErrorLevel};

    let (client_conn, server_conn) = mock_quic::pair::<Bytes>();

    let server_task = tokio::spawn(async move {
        let mut h3 = rh3::server::Connection::new(server_conn).await.expect("server handshake");
        let (_, mut stream) = h3.accept().await.expect("accept does not error").expect("a request arrives");
        // Reset the response stream instead of sending a response: the client's
        // pending `recv_response` observes this as a transport-level failure.
        stream.stop_stream(Code::H3_REQUEST_REJECTED);
        h3.shutdown(0).await.expect("graceful shutdown");
    });

    let (mut driver, mut send_request) = rh3::client::new(client_conn).await.expect("client handshake");
    let driver_task = tokio::spawn(async move {
        let _ = futures_util::future::poll_fn(|cx| driver.poll_close(cx)).await;
    });

    let req = Request::builder().method(Method::GET).uri("https://example.com/").body(()).unwrap();
    let mut stream = send_request.send_request(req).await.expect("send request");
    stream.finish().await.expect("finish request body");

    // A reset carries its own error code and is scoped to the one stream it
    // reset, not the whole connection.
    let err = stream.recv_response().await.expect_err("peer reset the response");
    assert_eq!(err.code(), Code::H3_REQUEST_REJECTED);
    assert_eq!(err.level(), ErrorLevel::StreamError);

    server_task.await.expect("server task does not panic");
    driver_task.abort();
}
