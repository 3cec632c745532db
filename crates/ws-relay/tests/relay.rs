use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use http::StatusCode;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use ws_relay::{
    AccessGate, Credential, Relay, RelayConfig, WsConnector, UNAUTHORIZED_REASON,
    UPSTREAM_FAILURE_MESSAGE,
};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Remote = WebSocketStream<TcpStream>;

async fn within<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("timed out")
}

/// Start a relay on an ephemeral port and return its address.
async fn start_relay(upstream_url: &str, gate: AccessGate) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let relay = Relay::new(RelayConfig {
        listen_addr: addr,
        gate,
        connector: WsConnector::new(upstream_url).unwrap(),
    });
    tokio::spawn(async move {
        relay
            .serve(listener, std::future::pending())
            .await
            .unwrap();
    });
    addr
}

/// Mock remote API. Every accepted connection is handed to the test along
/// with the request target it was opened with.
async fn mock_upstream() -> (String, mpsc::UnboundedReceiver<(String, Remote)>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let target = Arc::new(Mutex::new(String::new()));
            let target_cb = Arc::clone(&target);
            let callback = move |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
                *target_cb.lock().unwrap() = req.uri().to_string();
                Ok(response)
            };
            if let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await {
                let target = target.lock().unwrap().clone();
                if tx.send((target, ws)).is_err() {
                    break;
                }
            }
        }
    });

    (format!("ws://{addr}/ws/live.Bidi"), rx)
}

async fn connect_client(addr: SocketAddr, query: &str) -> Client {
    let (client, _) = within(tokio_tungstenite::connect_async(format!("ws://{addr}/{query}")))
        .await
        .expect("upgrade accepted");
    client
}

/// Wait until the relay is forwarding by bouncing a marker frame from the
/// remote side to the client.
async fn wait_until_relaying(client: &mut Client, remote: &mut Remote) {
    remote.send(Message::text("ready")).await.unwrap();
    let marker = within(client.next()).await.unwrap().unwrap();
    assert_eq!(marker, Message::text("ready"));
}

/// Read until the connection ends, failing on any data frame.
async fn expect_closed<S>(stream: &mut S)
where
    S: StreamExt<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    loop {
        match within(stream.next()).await {
            None | Some(Err(_)) => return,
            Some(Ok(Message::Close(_))) => continue,
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(other)) => panic!("unexpected frame after close: {other:?}"),
        }
    }
}

#[tokio::test]
async fn binary_frame_reaches_upstream_unmodified() {
    let (upstream_url, mut accepted) = mock_upstream().await;
    let addr = start_relay(&upstream_url, AccessGate::default()).await;

    let (mut client, response) = within(tokio_tungstenite::connect_async(format!(
        "ws://{addr}/?key=abcdefghij"
    )))
    .await
    .unwrap();
    assert_eq!(response.headers()["access-control-allow-origin"], "*");

    let (target, mut remote) = within(accepted.recv()).await.unwrap();
    assert_eq!(target, "/ws/live.Bidi?key=abcdefghij");
    wait_until_relaying(&mut client, &mut remote).await;

    client
        .send(Message::binary(vec![0xDE, 0xAD, 0xBE, 0xEF]))
        .await
        .unwrap();
    let received = within(remote.next()).await.unwrap().unwrap();
    assert_eq!(received, Message::binary(vec![0xDE, 0xAD, 0xBE, 0xEF]));
}

#[tokio::test]
async fn frames_keep_order_and_kind_both_ways() {
    let (upstream_url, mut accepted) = mock_upstream().await;
    let addr = start_relay(&upstream_url, AccessGate::default()).await;
    let mut client = connect_client(addr, "?key=abcdefghij").await;
    let (_, mut remote) = within(accepted.recv()).await.unwrap();
    wait_until_relaying(&mut client, &mut remote).await;

    let outbound = vec![
        Message::text(r#"{"setup":{"model":"models/gemini-2.0-flash-exp"}}"#),
        Message::binary(vec![1u8; 320]),
        Message::binary(vec![2u8; 320]),
        Message::text(r#"{"clientContent":{"turnComplete":true}}"#),
    ];
    for message in &outbound {
        client.send(message.clone()).await.unwrap();
    }
    for expected in &outbound {
        let got = within(remote.next()).await.unwrap().unwrap();
        assert_eq!(&got, expected);
    }

    let inbound = vec![
        Message::binary(vec![7u8; 480]),
        Message::text(r#"{"serverContent":{"turnComplete":true}}"#),
    ];
    for message in &inbound {
        remote.send(message.clone()).await.unwrap();
    }
    for expected in &inbound {
        let got = within(client.next()).await.unwrap().unwrap();
        assert_eq!(&got, expected);
    }
}

#[tokio::test]
async fn short_key_is_refused_with_401() {
    let (upstream_url, mut accepted) = mock_upstream().await;
    let addr = start_relay(&upstream_url, AccessGate::default()).await;

    let result = within(tokio_tungstenite::connect_async(format!(
        "ws://{addr}/?key=short"
    )))
    .await;
    match result {
        Err(tungstenite::Error::Http(response)) => {
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
            assert_eq!(response.headers()["access-control-allow-origin"], "*");
        }
        Err(other) => panic!("expected HTTP 401, got {other}"),
        Ok(_) => panic!("upgrade with a short key must be refused"),
    }

    // No upstream connection is attempted for a refused upgrade.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(accepted.try_recv().is_err());
}

#[tokio::test]
async fn refused_upgrade_carries_reason_text() {
    let (upstream_url, _accepted) = mock_upstream().await;
    let addr = start_relay(&upstream_url, AccessGate::default()).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "GET /?key=short HTTP/1.1\r\n\
         Host: {addr}\r\n\
         Connection: Upgrade, close\r\n\
         Upgrade: websocket\r\n\
         Sec-WebSocket-Version: 13\r\n\
         Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
         \r\n"
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut raw = Vec::new();
    within(stream.read_to_end(&mut raw)).await.unwrap();
    let response = String::from_utf8_lossy(&raw);
    assert!(response.starts_with("HTTP/1.1 401"), "{response}");
    assert!(response.ends_with(UNAUTHORIZED_REASON), "{response}");
}

#[tokio::test]
async fn missing_key_is_refused_with_401() {
    let (upstream_url, _accepted) = mock_upstream().await;
    let addr = start_relay(&upstream_url, AccessGate::default()).await;

    let result = within(tokio_tungstenite::connect_async(format!("ws://{addr}/"))).await;
    assert!(matches!(
        result,
        Err(tungstenite::Error::Http(ref response)) if response.status() == StatusCode::UNAUTHORIZED
    ));
}

#[tokio::test]
async fn upstream_failure_yields_one_error_then_close() {
    // A port with nothing listening: the upstream handshake fails.
    let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = dead.local_addr().unwrap();
    drop(dead);

    let addr = start_relay(&format!("ws://{dead_addr}/ws/live.Bidi"), AccessGate::default()).await;
    let mut client = connect_client(addr, "?key=abcdefghij").await;

    let text = match within(client.next()).await.unwrap().unwrap() {
        Message::Text(text) => text,
        other => panic!("expected a text error notice, got {other:?}"),
    };
    let value: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
    assert_eq!(value["error"], UPSTREAM_FAILURE_MESSAGE);

    expect_closed(&mut client).await;
}

#[tokio::test]
async fn frames_before_upstream_open_are_dropped() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = listener.local_addr().unwrap();
    let (release_tx, release_rx) = oneshot::channel::<()>();
    let (first_tx, first_rx) = oneshot::channel::<Message>();

    // Hold the upstream handshake until the test releases it.
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        release_rx.await.unwrap();
        let mut remote = tokio_tungstenite::accept_async(stream).await.unwrap();
        remote.send(Message::text("ready")).await.unwrap();
        if let Some(Ok(first)) = remote.next().await {
            let _ = first_tx.send(first);
        }
    });

    let addr = start_relay(&format!("ws://{upstream_addr}/"), AccessGate::default()).await;
    let mut client = connect_client(addr, "?key=abcdefghij").await;

    client.send(Message::binary(b"early".to_vec())).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    release_tx.send(()).unwrap();

    let marker = within(client.next()).await.unwrap().unwrap();
    assert_eq!(marker, Message::text("ready"));
    client.send(Message::binary(b"late".to_vec())).await.unwrap();

    let first = within(first_rx).await.unwrap();
    assert_eq!(first, Message::binary(b"late".to_vec()));
}

#[tokio::test]
async fn client_disconnect_closes_upstream() {
    let (upstream_url, mut accepted) = mock_upstream().await;
    let addr = start_relay(&upstream_url, AccessGate::default()).await;
    let mut client = connect_client(addr, "?key=abcdefghij").await;
    let (_, mut remote) = within(accepted.recv()).await.unwrap();
    wait_until_relaying(&mut client, &mut remote).await;

    client.close(None).await.unwrap();

    // The relay answers the close handshake instead of dropping the socket.
    let reply = within(client.next()).await;
    assert!(
        matches!(reply, Some(Ok(Message::Close(_)))),
        "expected a close reply, got {reply:?}"
    );
    let forwarded = within(remote.next()).await;
    assert!(
        matches!(forwarded, Some(Ok(Message::Close(_)))),
        "expected the upstream to be closed cleanly, got {forwarded:?}"
    );
}

#[tokio::test]
async fn upstream_close_is_answered_and_passed_to_client() {
    let (upstream_url, mut accepted) = mock_upstream().await;
    let addr = start_relay(&upstream_url, AccessGate::default()).await;
    let mut client = connect_client(addr, "?key=abcdefghij").await;
    let (_, mut remote) = within(accepted.recv()).await.unwrap();
    wait_until_relaying(&mut client, &mut remote).await;

    remote.close(None).await.unwrap();

    let reply = within(remote.next()).await;
    assert!(
        matches!(reply, Some(Ok(Message::Close(_)))),
        "expected a close reply, got {reply:?}"
    );
    let forwarded = within(client.next()).await;
    assert!(
        matches!(forwarded, Some(Ok(Message::Close(_)))),
        "expected the client to be closed cleanly, got {forwarded:?}"
    );
}

#[tokio::test]
async fn shared_key_is_used_for_every_session() {
    let (upstream_url, mut accepted) = mock_upstream().await;
    let shared = Credential::new("server-side-key").unwrap();
    let addr = start_relay(&upstream_url, AccessGate::Shared(shared)).await;

    let _client = connect_client(addr, "").await;
    let (target, _remote) = within(accepted.recv()).await.unwrap();
    assert_eq!(target, "/ws/live.Bidi?key=server-side-key");
}

#[tokio::test]
async fn sessions_are_independent() {
    let (upstream_url, mut accepted) = mock_upstream().await;
    let addr = start_relay(&upstream_url, AccessGate::default()).await;

    let mut first = connect_client(addr, "?key=first-client-key").await;
    let (first_target, mut first_remote) = within(accepted.recv()).await.unwrap();
    let mut second = connect_client(addr, "?key=second-client-key").await;
    let (second_target, mut second_remote) = within(accepted.recv()).await.unwrap();
    assert!(first_target.ends_with("key=first-client-key"));
    assert!(second_target.ends_with("key=second-client-key"));

    wait_until_relaying(&mut first, &mut first_remote).await;
    wait_until_relaying(&mut second, &mut second_remote).await;

    // Ending one session leaves the other relaying.
    first.close(None).await.unwrap();
    expect_closed(&mut first_remote).await;

    second.send(Message::text("still here")).await.unwrap();
    let got = within(second_remote.next()).await.unwrap().unwrap();
    assert_eq!(got, Message::text("still here"));
}
