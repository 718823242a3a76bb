//! Fault injection over live sockets: one-shot read hooks, handshake
//! aborts, and corruption below a TLS session.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use http_harness::http::framing;
use http_harness::listener::{HelloHandler, Listener, OperationFlags, OperationOutcome};
use http_harness::net::instrument::ReadHook;
use http_harness::net::tls::TlsProvider;
use http_harness::{HttpRequest, Method};

mod common;

fn self_signed() -> (String, String) {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    (cert.cert.pem(), cert.key_pair.serialize_pem())
}

#[tokio::test]
async fn read_hook_delays_exactly_one_read() {
    let listener = Listener::bind("127.0.0.1:0").await.unwrap();
    let (operation, _) = listener
        .register_operation(Box::new(HelloHandler::new()), OperationFlags::default(), None)
        .unwrap();

    let handle = listener.prepare_instrumentation();
    handle.on_next_read(ReadHook::delay(Duration::from_millis(300)));

    let addr = listener.local_addr();
    let path = operation.path().to_string();
    let started = std::time::Instant::now();
    let outcome = Arc::clone(&operation)
        .run(Arc::clone(&listener), common::one_shot_get(addr, path))
        .await;

    assert!(outcome.is_success(), "unexpected outcome: {:?}", outcome);
    assert!(
        started.elapsed() >= Duration::from_millis(250),
        "delay hook did not fire"
    );
    assert!(!handle.has_pending_hook());
}

#[tokio::test]
async fn read_hook_failure_is_an_expected_server_error() {
    let listener = Listener::bind("127.0.0.1:0").await.unwrap();
    let flags = OperationFlags {
        expect_server_error: true,
        ..OperationFlags::default()
    };
    let (operation, _) = listener
        .register_operation(Box::new(HelloHandler::new()), flags, None)
        .unwrap();

    let handle = listener.prepare_instrumentation();
    handle.on_next_read(ReadHook::fail(
        std::io::ErrorKind::ConnectionReset,
        "injected reset",
    ));

    let addr = listener.local_addr();
    let path = operation.path().to_string();
    let outcome = Arc::clone(&operation)
        .run(Arc::clone(&listener), common::one_shot_get(addr, path))
        .await;

    assert!(
        matches!(outcome, OperationOutcome::ExpectedError(_)),
        "got {:?}",
        outcome
    );
}

#[tokio::test]
async fn server_can_abort_before_the_handshake() {
    let (cert_pem, key_pem) = self_signed();
    let provider = TlsProvider::from_pem(cert_pem.as_bytes(), key_pem.as_bytes()).unwrap();
    let listener = Listener::bind_with_tls("127.0.0.1:0", provider).await.unwrap();

    let flags = OperationFlags {
        server_aborts_handshake: true,
        ..OperationFlags::default()
    };
    let (operation, _) = listener
        .register_operation(Box::new(HelloHandler::new()), flags, None)
        .unwrap();

    let addr = listener.local_addr();
    let outcome = Arc::clone(&operation)
        .run(Arc::clone(&listener), async move {
            let connector = TlsProvider::client_connector(cert_pem.as_bytes())?;
            let stream = TcpStream::connect(addr).await?;
            // The server drops the socket, so this handshake must fail.
            let err = TlsProvider::create_client_stream(&connector, stream, "localhost")
                .await
                .err();
            match err {
                Some(e) => Err(e),
                None => Err(http_harness::HarnessError::Protocol(
                    "handshake unexpectedly completed".into(),
                )),
            }
        })
        .await;

    assert!(
        matches!(outcome, OperationOutcome::ExpectedError(_)),
        "got {:?}",
        outcome
    );
}

#[tokio::test]
async fn tls_round_trip_with_clean_transport() {
    let (cert_pem, key_pem) = self_signed();
    let provider = TlsProvider::from_pem(cert_pem.as_bytes(), key_pem.as_bytes()).unwrap();
    let listener = Listener::bind_with_tls("127.0.0.1:0", provider).await.unwrap();
    let (operation, url) = listener
        .register_operation(Box::new(HelloHandler::new()), OperationFlags::default(), None)
        .unwrap();
    assert_eq!(url.scheme(), "https");

    let addr = listener.local_addr();
    let path = operation.path().to_string();
    let outcome = Arc::clone(&operation)
        .run(Arc::clone(&listener), async move {
            let connector = TlsProvider::client_connector(cert_pem.as_bytes())?;
            let tcp = TcpStream::connect(addr).await?;
            let mut stream =
                TlsProvider::create_client_stream(&connector, tcp, "localhost").await?;

            let cancel = CancellationToken::new();
            let request = HttpRequest::new(Method::Get, &path);
            framing::write_request(&mut stream, &request, &cancel).await?;
            let mut buf = bytes::BytesMut::with_capacity(4096);
            let response = framing::read_response(&mut stream, &mut buf, &cancel).await?;
            let _ = stream.shutdown().await;
            Ok(common::observe(&response))
        })
        .await;

    assert!(outcome.is_success(), "unexpected outcome: {:?}", outcome);
}

#[tokio::test]
async fn corruption_below_tls_breaks_the_session() {
    let (cert_pem, key_pem) = self_signed();
    let provider = TlsProvider::from_pem(cert_pem.as_bytes(), key_pem.as_bytes()).unwrap();
    let listener = Listener::bind_with_tls("127.0.0.1:0", provider).await.unwrap();

    let flags = OperationFlags {
        expect_server_error: true,
        ..OperationFlags::default()
    };
    let (operation, _) = listener
        .register_operation(Box::new(HelloHandler::new()), flags, None)
        .unwrap();

    let handle = listener.prepare_instrumentation();
    // Flip bytes inside the first TLS record from the client; record
    // authentication must reject it.
    handle.on_next_read(ReadHook::corrupt(6..10));

    let addr = listener.local_addr();
    let outcome = Arc::clone(&operation)
        .run(Arc::clone(&listener), async move {
            let connector = TlsProvider::client_connector(cert_pem.as_bytes())?;
            let tcp = TcpStream::connect(addr).await?;
            let result = TlsProvider::create_client_stream(&connector, tcp, "localhost").await;
            match result {
                Err(e) => Err(e),
                Ok(_) => Err(http_harness::HarnessError::Protocol(
                    "handshake survived corrupted records".into(),
                )),
            }
        })
        .await;

    assert!(
        matches!(outcome, OperationOutcome::ExpectedError(_)),
        "got {:?}",
        outcome
    );
}
