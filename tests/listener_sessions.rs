//! End-to-end session tests: registration, keep-alive reuse, redirects,
//! and operation outcome classification over real sockets.

use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use url::Url;

use http_harness::listener::{
    ClientObservation, HelloHandler, Listener, OperationFlags, OperationOutcome, PostEchoHandler,
    RedirectHandler,
};
use http_harness::{HarnessError, HttpRequest, Method, Status};

mod common;

#[tokio::test]
async fn hello_round_trip() {
    http_harness::observability::logging::init();
    let listener = Listener::bind("127.0.0.1:0").await.unwrap();
    let (operation, url) = listener
        .register_operation(Box::new(HelloHandler::new()), OperationFlags::default(), None)
        .unwrap();
    assert_eq!(url.path(), "/id/1/Hello/");

    let addr = listener.local_addr();
    let path = operation.path().to_string();
    let outcome = Arc::clone(&operation)
        .run(Arc::clone(&listener), common::one_shot_get(addr, path))
        .await;

    assert!(outcome.is_success(), "unexpected outcome: {:?}", outcome);
}

#[tokio::test]
async fn post_body_reaches_the_handler() {
    let listener = Listener::bind("127.0.0.1:0").await.unwrap();
    let (operation, _) = listener
        .register_operation(
            Box::new(PostEchoHandler::expecting(b"payload".to_vec())),
            OperationFlags::default(),
            Some(Status::OK),
        )
        .unwrap();

    let addr = listener.local_addr();
    let path = operation.path().to_string();
    let outcome = Arc::clone(&operation)
        .run(Arc::clone(&listener), async move {
            let mut stream = TcpStream::connect(addr).await?;
            let mut request = HttpRequest::new(Method::Post, &path);
            request.body = b"payload".to_vec();
            request
                .headers
                .insert("Content-Length", request.body.len().to_string());
            let response = common::exchange_request(&mut stream, request).await?;
            Ok(common::observe(&response))
        })
        .await;

    assert!(outcome.is_success(), "unexpected outcome: {:?}", outcome);
}

#[tokio::test]
async fn keep_alive_pools_and_reuses_the_connection() {
    let listener = Listener::bind("127.0.0.1:0").await.unwrap();
    let keep_alive = OperationFlags {
        keep_alive: true,
        ..OperationFlags::default()
    };
    let (first, _) = listener
        .register_operation(Box::new(HelloHandler::new()), keep_alive, None)
        .unwrap();
    let (second, _) = listener
        .register_operation(Box::new(HelloHandler::new()), OperationFlags::default(), None)
        .unwrap();

    let stream = Arc::new(Mutex::new(
        TcpStream::connect(listener.local_addr()).await.unwrap(),
    ));

    let shared = Arc::clone(&stream);
    let path = first.path().to_string();
    let outcome = Arc::clone(&first)
        .run(Arc::clone(&listener), async move {
            let mut stream = shared.lock().await;
            let response = common::exchange(&mut stream, &path).await?;
            Ok(common::observe(&response))
        })
        .await;
    assert!(outcome.is_success(), "first hop failed: {:?}", outcome);
    assert_eq!(listener.idle_connections(), 1);

    // Second operation claims the pooled connection; the client keeps
    // talking on the same socket.
    let shared = Arc::clone(&stream);
    let path = second.path().to_string();
    let outcome = Arc::clone(&second)
        .run(Arc::clone(&listener), async move {
            let mut stream = shared.lock().await;
            let response = common::exchange(&mut stream, &path).await?;
            Ok(common::observe(&response))
        })
        .await;
    assert!(outcome.is_success(), "reused hop failed: {:?}", outcome);
    assert_eq!(listener.idle_connections(), 0);
}

#[tokio::test]
async fn unknown_path_fails_the_session() {
    let listener = Listener::bind("127.0.0.1:0").await.unwrap();
    let (operation, _) = listener
        .register_operation(Box::new(HelloHandler::new()), OperationFlags::default(), None)
        .unwrap();

    let addr = listener.local_addr();
    let outcome = Arc::clone(&operation)
        .run(
            Arc::clone(&listener),
            common::one_shot_get(addr, "/id/99/Nope/".to_string()),
        )
        .await;

    match outcome {
        OperationOutcome::UnexpectedError(HarnessError::UnknownPath(path)) => {
            assert_eq!(path, "/id/99/Nope/");
        }
        other => panic!("expected an unknown-path failure, got {:?}", other),
    }
}

#[tokio::test]
async fn client_finishing_before_accept_is_flagged() {
    let listener = Listener::bind("127.0.0.1:0").await.unwrap();
    let (operation, _) = listener
        .register_operation(Box::new(HelloHandler::new()), OperationFlags::default(), None)
        .unwrap();

    // The client never touches the server at all.
    let outcome = Arc::clone(&operation)
        .run(Arc::clone(&listener), async move {
            Ok(ClientObservation {
                status: 200,
                body: Vec::new(),
            })
        })
        .await;

    assert!(
        matches!(
            outcome,
            OperationOutcome::UnexpectedError(HarnessError::ClientRanAhead)
        ),
        "got {:?}",
        outcome
    );
}

#[tokio::test]
async fn status_expectation_mismatch_is_reported() {
    let listener = Listener::bind("127.0.0.1:0").await.unwrap();
    let (operation, _) = listener
        .register_operation(
            Box::new(HelloHandler::new()),
            OperationFlags::default(),
            Some(Status::NOT_FOUND),
        )
        .unwrap();

    let addr = listener.local_addr();
    let path = operation.path().to_string();
    let outcome = Arc::clone(&operation)
        .run(Arc::clone(&listener), common::one_shot_get(addr, path))
        .await;

    match outcome {
        OperationOutcome::UnexpectedError(HarnessError::UnexpectedStatus { expected, actual }) => {
            assert_eq!(expected, 404);
            assert_eq!(actual, 200);
        }
        other => panic!("expected a status mismatch, got {:?}", other),
    }
}

#[tokio::test]
async fn redirect_follows_on_the_same_connection() {
    let listener = Listener::bind("127.0.0.1:0").await.unwrap();
    let flags = OperationFlags {
        keep_alive: true,
        ..OperationFlags::default()
    };
    let (operation, _) = listener
        .register_operation(
            Box::new(RedirectHandler::new(Box::new(HelloHandler::new()), true)),
            flags,
            None,
        )
        .unwrap();

    let addr = listener.local_addr();
    let path = operation.path().to_string();
    let outcome = Arc::clone(&operation)
        .run(Arc::clone(&listener), async move {
            let mut stream = TcpStream::connect(addr).await?;

            let redirect = common::exchange(&mut stream, &path).await?;
            assert_eq!(redirect.status, Status::FOUND);
            let location = redirect
                .headers
                .get("Location")
                .ok_or_else(|| HarnessError::Protocol("redirect without Location".into()))?
                .to_string();
            let location = Url::parse(&location)
                .map_err(|e| HarnessError::Protocol(format!("bad Location: {}", e)))?;

            // Same socket, new path; the server reuses the connection.
            let response = common::exchange(&mut stream, location.path()).await?;
            let _ = stream.shutdown().await;
            Ok(common::observe(&response))
        })
        .await;

    assert!(outcome.is_success(), "unexpected outcome: {:?}", outcome);
}

#[tokio::test]
async fn redirect_chain_validates_the_final_body() {
    let listener = Listener::bind("127.0.0.1:0").await.unwrap();
    let flags = OperationFlags {
        keep_alive: true,
        ..OperationFlags::default()
    };
    let (operation, _) = listener
        .register_operation(
            Box::new(RedirectHandler::new(Box::new(HelloHandler::new()), true)),
            flags,
            None,
        )
        .unwrap();

    let addr = listener.local_addr();
    let path = operation.path().to_string();
    let outcome = Arc::clone(&operation)
        .run(Arc::clone(&listener), async move {
            let mut stream = TcpStream::connect(addr).await?;
            let redirect = common::exchange(&mut stream, &path).await?;
            assert_eq!(redirect.status, Status::FOUND);
            let location = redirect
                .headers
                .get("Location")
                .ok_or_else(|| HarnessError::Protocol("redirect without Location".into()))?
                .to_string();
            let location = Url::parse(&location)
                .map_err(|e| HarnessError::Protocol(format!("bad Location: {}", e)))?;

            let response = common::exchange(&mut stream, location.path()).await?;
            let _ = stream.shutdown().await;
            // Misreport the final body; the last hop's handler must
            // reject it, not the already-fired redirect handler.
            let mut observation = common::observe(&response);
            observation.body = b"garbage".to_vec();
            Ok(observation)
        })
        .await;

    assert!(
        matches!(
            outcome,
            OperationOutcome::UnexpectedError(HarnessError::ContentMismatch)
        ),
        "got {:?}",
        outcome
    );
}

#[tokio::test]
async fn each_request_gets_its_own_context() {
    let listener = Listener::bind("127.0.0.1:0").await.unwrap();
    let keep_alive = OperationFlags {
        keep_alive: true,
        ..OperationFlags::default()
    };
    let stream = Arc::new(Mutex::new(
        TcpStream::connect(listener.local_addr()).await.unwrap(),
    ));

    // Three requests over one socket still get three context instances.
    for round in 1..=3u64 {
        let flags = if round < 3 {
            keep_alive
        } else {
            OperationFlags::default()
        };
        let (operation, _) = listener
            .register_operation(Box::new(HelloHandler::new()), flags, None)
            .unwrap();
        let shared = Arc::clone(&stream);
        let path = operation.path().to_string();
        let outcome = Arc::clone(&operation)
            .run(Arc::clone(&listener), async move {
                let mut stream = shared.lock().await;
                let response = common::exchange(&mut stream, &path).await?;
                Ok(common::observe(&response))
            })
            .await;
        assert!(outcome.is_success(), "round {} failed: {:?}", round, outcome);
        assert_eq!(listener.contexts_created(), round);
    }
}

#[tokio::test]
async fn redirect_can_force_a_fresh_connection() {
    let listener = Listener::bind("127.0.0.1:0").await.unwrap();
    let (operation, _) = listener
        .register_operation(
            Box::new(RedirectHandler::new(Box::new(HelloHandler::new()), false)),
            OperationFlags::default(),
            None,
        )
        .unwrap();

    let addr = listener.local_addr();
    let path = operation.path().to_string();
    let outcome = Arc::clone(&operation)
        .run(Arc::clone(&listener), async move {
            let mut stream = TcpStream::connect(addr).await?;
            let redirect = common::exchange(&mut stream, &path).await?;
            assert_eq!(redirect.status, Status::FOUND);
            let location = redirect
                .headers
                .get("Location")
                .ok_or_else(|| HarnessError::Protocol("redirect without Location".into()))?
                .to_string();
            drop(stream);

            let location = Url::parse(&location)
                .map_err(|e| HarnessError::Protocol(format!("bad Location: {}", e)))?;
            common::one_shot_get(addr, location.path().to_string()).await
        })
        .await;

    assert!(outcome.is_success(), "unexpected outcome: {:?}", outcome);
}

#[tokio::test]
async fn abort_after_client_exits_still_succeeds() {
    let listener = Listener::bind("127.0.0.1:0").await.unwrap();
    let flags = OperationFlags {
        abort_after_client_exits: true,
        ..OperationFlags::default()
    };
    let (operation, _) = listener
        .register_operation(Box::new(HelloHandler::new()), flags, None)
        .unwrap();

    let addr = listener.local_addr();
    let path = operation.path().to_string();
    let outcome = Arc::clone(&operation)
        .run(Arc::clone(&listener), common::one_shot_get(addr, path))
        .await;

    assert!(outcome.is_success(), "unexpected outcome: {:?}", outcome);
}
