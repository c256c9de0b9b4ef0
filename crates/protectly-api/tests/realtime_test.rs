// Integration tests for the realtime update listener against a loopback
// websocket server.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::SinkExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use url::Url;

use protectly_api::frames::{encode_update_packet, ActionFrame, UpdatePayload};
use protectly_api::realtime::{
    updates_url, ListenerConfig, ReconnectConfig, ResumeState, UpdateListener,
};

/// Handshake details captured for every accepted connection.
#[derive(Debug, Clone)]
struct SeenConn {
    uri: String,
    cookie: Option<String>,
}

type ConnLog = Arc<Mutex<Vec<SeenConn>>>;

async fn accept_logged(listener: &TcpListener, log: ConnLog) -> WebSocketStream<TcpStream> {
    let (stream, _) = listener.accept().await.unwrap();
    tokio_tungstenite::accept_hdr_async(stream, move |req: &Request, resp: Response| {
        log.lock().unwrap().push(SeenConn {
            uri: req.uri().to_string(),
            cookie: req
                .headers()
                .get("cookie")
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned),
        });
        Ok(resp)
    })
    .await
    .unwrap()
}

fn camera_update(id: &str, last_motion: i64) -> Vec<u8> {
    let action = ActionFrame {
        action: "update".into(),
        id: id.into(),
        model_key: "camera".into(),
        new_update_id: None,
    };
    let payload = UpdatePayload::Json(serde_json::json!({ "lastMotion": last_motion }));
    encode_update_packet(&action, &payload, true).unwrap()
}

fn resume_for(addr: std::net::SocketAddr, cursor: &str) -> ResumeState {
    let base = Url::parse(&format!("http://{addr}")).unwrap();
    ResumeState {
        updates_url: updates_url(&base, cursor).unwrap(),
        cookie: "TOKEN=tok1".into(),
    }
}

fn fast_config() -> ListenerConfig {
    ListenerConfig {
        heartbeat_interval: Duration::from_millis(200),
        keepalive_interval: Duration::from_secs(30),
        reconnect: ReconnectConfig {
            initial_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(50),
            max_retries: None,
        },
        insecure_tls: false,
    }
}

async fn wait_for_connections(log: &ConnLog, count: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if log.lock().unwrap().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| {
        panic!(
            "timed out waiting for {count} connections (saw {})",
            log.lock().unwrap().len()
        )
    });
}

#[tokio::test]
async fn delivers_camera_updates_and_survives_garbage_frames() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let log: ConnLog = Arc::new(Mutex::new(Vec::new()));

    let server_log = log.clone();
    tokio::spawn(async move {
        let mut ws = accept_logged(&listener, server_log).await;
        ws.send(Message::binary(b"definitely not a packet".to_vec()))
            .await
            .unwrap();
        ws.send(Message::binary(camera_update("cam-1", 42)))
            .await
            .unwrap();
        // Keep the connection open so the client doesn't reconnect.
        std::future::pending::<()>().await;
    });

    let (resume_tx, resume_rx) = watch::channel(None);
    let cancel = CancellationToken::new();
    let update_listener = UpdateListener::spawn(resume_rx, fast_config(), cancel.clone());
    let mut packets = update_listener.subscribe();

    // Publish the resume state only after subscribing, so no packet can
    // slip past the receiver.
    resume_tx.send(Some(resume_for(addr, "c1"))).unwrap();

    let packet = tokio::time::timeout(Duration::from_secs(5), packets.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(packet.action.id, "cam-1");
    assert_eq!(packet.payload.as_json().unwrap()["lastMotion"], 42);

    // The handshake carried the session cookie and the resume cursor.
    let seen = log.lock().unwrap()[0].clone();
    assert_eq!(seen.cookie.as_deref(), Some("TOKEN=tok1"));
    assert!(seen.uri.contains("lastUpdateId=c1"), "uri: {}", seen.uri);

    cancel.cancel();
}

#[tokio::test]
async fn reconnects_after_heartbeat_timeout() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let log: ConnLog = Arc::new(Mutex::new(Vec::new()));

    let server_log = log.clone();
    tokio::spawn(async move {
        // Accept connections but never send anything, so every connection
        // dies to the heartbeat.
        let mut held = Vec::new();
        loop {
            held.push(accept_logged(&listener, server_log.clone()).await);
        }
    });

    let (resume_tx, resume_rx) = watch::channel(None);
    let cancel = CancellationToken::new();
    let update_listener = UpdateListener::spawn(resume_rx, fast_config(), cancel.clone());
    let _packets = update_listener.subscribe();

    resume_tx.send(Some(resume_for(addr, "c1"))).unwrap();

    wait_for_connections(&log, 2).await;

    cancel.cancel();
}

#[tokio::test]
async fn bootstrap_refresh_rotates_the_resume_cursor() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let log: ConnLog = Arc::new(Mutex::new(Vec::new()));

    let server_log = log.clone();
    tokio::spawn(async move {
        let mut held = Vec::new();
        loop {
            held.push(accept_logged(&listener, server_log.clone()).await);
        }
    });

    let mut config = fast_config();
    // Generous heartbeat so only the cursor rotation can cause a reconnect.
    config.heartbeat_interval = Duration::from_secs(30);

    let (resume_tx, resume_rx) = watch::channel(None);
    let cancel = CancellationToken::new();
    let update_listener = UpdateListener::spawn(resume_rx, config, cancel.clone());
    let _packets = update_listener.subscribe();

    resume_tx.send(Some(resume_for(addr, "c1"))).unwrap();
    wait_for_connections(&log, 1).await;

    // A fresh bootstrap publishes a new cursor; the live socket is torn
    // down and the stream resumes from the new position.
    resume_tx.send(Some(resume_for(addr, "c2"))).unwrap();
    wait_for_connections(&log, 2).await;

    let uris: Vec<String> = log.lock().unwrap().iter().map(|c| c.uri.clone()).collect();
    assert!(uris[0].contains("lastUpdateId=c1"), "uri: {}", uris[0]);
    assert!(uris[1].contains("lastUpdateId=c2"), "uri: {}", uris[1]);

    cancel.cancel();
}

#[tokio::test]
async fn shutdown_stops_reconnecting() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let log: ConnLog = Arc::new(Mutex::new(Vec::new()));

    let server_log = log.clone();
    tokio::spawn(async move {
        let mut held = Vec::new();
        loop {
            held.push(accept_logged(&listener, server_log.clone()).await);
        }
    });

    let (resume_tx, resume_rx) = watch::channel(None);
    let cancel = CancellationToken::new();
    let update_listener = UpdateListener::spawn(resume_rx, fast_config(), cancel);
    resume_tx.send(Some(resume_for(addr, "c1"))).unwrap();

    wait_for_connections(&log, 1).await;
    update_listener.shutdown();

    // No further connection attempts after shutdown, even though the
    // heartbeat would have expired several times over.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(log.lock().unwrap().len(), 1);
}
