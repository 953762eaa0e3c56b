//! Control-channel round-trips over a real TCP socket.

use std::time::Duration;

use tokio::net::TcpListener;

use vsbmc::control::{self, read_frame, write_frame, Reply, Request};

#[tokio::test]
async fn call_round_trips_a_framed_request() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let request: Request = read_frame(&mut stream).await.unwrap();
        let reply = match request {
            Request::Show { vm_name } => Reply::table(
                vec!["Property".to_string(), "Value".to_string()],
                vec![vec!["vm_name".to_string(), vm_name]],
            ),
            _ => Reply::error("unexpected command"),
        };
        write_frame(&mut stream, &reply).await.unwrap();
    });

    let reply = control::call(
        addr,
        &Request::Show {
            vm_name: "node-01".to_string(),
        },
        Duration::from_secs(1),
    )
    .await
    .unwrap();

    assert_eq!(reply.rc, 0);
    assert_eq!(reply.rows.unwrap()[0][1], "node-01");
}

#[tokio::test]
async fn call_times_out_against_a_silent_server() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        // Accept and read, but never reply.
        let (mut stream, _) = listener.accept().await.unwrap();
        let _request: Result<Request, _> = read_frame(&mut stream).await;
        tokio::time::sleep(Duration::from_secs(10)).await;
    });

    let result = control::call(
        addr,
        &Request::List { fakemac: false },
        Duration::from_millis(100),
    )
    .await;
    assert!(matches!(result, Err(vsbmc::Error::Control(_))));
}

#[tokio::test]
async fn call_fails_cleanly_when_nothing_listens() {
    // Bind and drop to get a port that refuses connections.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let result = control::call(
        addr,
        &Request::List { fakemac: false },
        Duration::from_secs(1),
    )
    .await;
    assert!(result.is_err());
}
