//! Stream connections and the ingestion manager against loopback adapters.

use shdr_daq::error::ErrorKind;
use shdr_daq::stream::{
    CloseReason, ConnectionSettings, ConnectionState, Endpoint, Liveness, ManagerSettings,
    RecordCategory, StreamConnection, StreamEvent, StreamIngestionManager,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(2);

async fn listener() -> (TcpListener, Endpoint) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, Endpoint::new("127.0.0.1", port))
}

/// Accept one client and consume its initial PING.
async fn accept(listener: &TcpListener) -> BufReader<TcpStream> {
    let (stream, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    let mut adapter = BufReader::new(stream);
    assert_eq!(read_line(&mut adapter).await, "* PING");
    adapter
}

async fn read_line(adapter: &mut BufReader<TcpStream>) -> String {
    let mut line = String::new();
    timeout(WAIT, adapter.read_line(&mut line)).await.unwrap().unwrap();
    line.trim_end().to_string()
}

async fn send(adapter: &mut BufReader<TcpStream>, line: &str) {
    adapter
        .get_mut()
        .write_all(format!("{}\n", line).as_bytes())
        .await
        .unwrap();
}

async fn next_event(rx: &mut mpsc::Receiver<StreamEvent>) -> StreamEvent {
    timeout(WAIT, rx.recv())
        .await
        .expect("no stream event within 2s")
        .expect("stream channel closed")
}

fn connection(endpoint: Endpoint, settings: ConnectionSettings) -> (StreamConnection, mpsc::Receiver<StreamEvent>) {
    let (tx, rx) = mpsc::channel(64);
    (StreamConnection::new(endpoint, "mill-1", settings, tx), rx)
}

#[tokio::test]
async fn test_data_line_becomes_record() {
    let (listener, endpoint) = listener().await;
    let (conn, mut rx) = connection(endpoint.clone(), ConnectionSettings::default());

    let (connected, mut adapter) = tokio::join!(conn.connect(), accept(&listener));
    connected.unwrap();
    assert_eq!(
        conn.state(),
        ConnectionState::Connected(Liveness::AwaitingPong)
    );

    send(&mut adapter, "2024-01-01T00:00:00Z|Xact|500").await;
    match next_event(&mut rx).await {
        StreamEvent::Data {
            endpoint: from,
            device_id,
            record,
        } => {
            assert_eq!(from, endpoint);
            assert_eq!(device_id, "mill-1");
            assert_eq!(record.timestamp.as_deref(), Some("2024-01-01T00:00:00Z"));
            assert_eq!(record.key, "Xact");
            assert_eq!(record.value(), Some("500"));
        }
        other => panic!("unexpected event: {:?}", other),
    }

    conn.shutdown().await;
    assert_eq!(conn.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_lines_arrive_in_order_with_commands() {
    let (listener, endpoint) = listener().await;
    let mut settings = ConnectionSettings::default();
    settings
        .category_hints
        .insert("msg".into(), RecordCategory::Message);
    let (conn, mut rx) = connection(endpoint, settings);

    let (connected, mut adapter) = tokio::join!(conn.connect(), accept(&listener));
    connected.unwrap();

    send(&mut adapter, "* shdrVersion: 2").await;
    send(&mut adapter, "2024-01-01T00:00:00Z|Xact|1|mode|AUTOMATIC").await;
    // Dangling key: the whole line is skipped.
    send(&mut adapter, "2024-01-01T00:00:00Z|Yact|2|Zact").await;
    send(&mut adapter, "2024-01-01T00:00:01Z|msg|C1|Door open").await;

    match next_event(&mut rx).await {
        StreamEvent::Command { name, value, .. } => {
            assert_eq!(name, "shdrVersion");
            assert_eq!(value, "2");
        }
        other => panic!("unexpected event: {:?}", other),
    }

    let mut keys = Vec::new();
    for _ in 0..3 {
        match next_event(&mut rx).await {
            StreamEvent::Data { record, .. } => keys.push((record.key, record.category)),
            other => panic!("unexpected event: {:?}", other),
        }
    }
    assert_eq!(
        keys,
        vec![
            ("Xact".to_string(), RecordCategory::Sample),
            ("mode".to_string(), RecordCategory::Event),
            ("msg".to_string(), RecordCategory::Message),
        ]
    );

    conn.shutdown().await;
}

#[tokio::test]
async fn test_invalid_utf8_line_keeps_session_open() {
    let (listener, endpoint) = listener().await;
    let (conn, mut rx) = connection(endpoint, ConnectionSettings::default());

    let (connected, mut adapter) = tokio::join!(conn.connect(), accept(&listener));
    connected.unwrap();

    // Latin-1 degree sign from an adapter that does not speak UTF-8.
    adapter
        .get_mut()
        .write_all(b"2024-01-01T00:00:00Z|unit|\xb0C\n2024-01-01T00:00:00Z|Xact|1\n")
        .await
        .unwrap();

    match next_event(&mut rx).await {
        StreamEvent::Data { record, .. } => {
            assert_eq!(record.key, "unit");
            assert_eq!(record.value(), Some("\u{fffd}C"));
        }
        other => panic!("unexpected event: {:?}", other),
    }
    match next_event(&mut rx).await {
        StreamEvent::Data { record, .. } => assert_eq!(record.key, "Xact"),
        other => panic!("unexpected event: {:?}", other),
    }
    assert!(matches!(conn.state(), ConnectionState::Connected(_)));

    conn.shutdown().await;
}

#[tokio::test]
async fn test_pong_refreshes_status() {
    let (listener, endpoint) = listener().await;
    let (conn, _rx) = connection(endpoint, ConnectionSettings::default());
    let mut status = conn.subscribe_status();

    let (connected, mut adapter) = tokio::join!(conn.connect(), accept(&listener));
    connected.unwrap();

    send(&mut adapter, "* PONG 10000").await;
    let current = *timeout(
        WAIT,
        status.wait_for(|s| s.state == ConnectionState::Connected(Liveness::Fresh)),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(current.heartbeat, Some(Duration::from_secs(10)));
    assert_eq!(current.heartbeat_timeout(), Some(Duration::from_secs(20)));

    conn.shutdown().await;
}

#[tokio::test]
async fn test_missed_pong_closes_connection() {
    let (listener, endpoint) = listener().await;
    let (conn, mut rx) = connection(endpoint.clone(), ConnectionSettings::default());

    let (connected, mut adapter) = tokio::join!(conn.connect(), accept(&listener));
    connected.unwrap();

    send(&mut adapter, "* PONG 100").await;
    // The next PING follows one period later and goes unanswered.
    assert_eq!(read_line(&mut adapter).await, "* PING");

    match next_event(&mut rx).await {
        StreamEvent::Closed {
            endpoint: from,
            reason,
            ..
        } => {
            assert_eq!(from, endpoint);
            assert_eq!(reason, CloseReason::HeartbeatTimeout);
        }
        other => panic!("unexpected event: {:?}", other),
    }
    assert_eq!(conn.state(), ConnectionState::Closed);

    let mut rest = Vec::new();
    let read = timeout(WAIT, adapter.read_to_end(&mut rest)).await.unwrap();
    assert!(read.is_ok(), "socket not released");
}

#[tokio::test]
async fn test_answered_pings_keep_connection_open() {
    let (listener, endpoint) = listener().await;
    let (conn, mut rx) = connection(endpoint, ConnectionSettings::default());

    let (connected, adapter) = tokio::join!(conn.connect(), accept(&listener));
    connected.unwrap();

    let responder = tokio::spawn(async move {
        let mut adapter = adapter;
        let _ = adapter.get_mut().write_all(b"* PONG 50\n").await;
        loop {
            let mut line = String::new();
            match adapter.read_line(&mut line).await {
                Ok(0) | Err(_) => return,
                Ok(_) if line.trim_end() == "* PING" => {
                    let _ = adapter.get_mut().write_all(b"* PONG 50\n").await;
                }
                Ok(_) => {}
            }
        }
    });

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(matches!(conn.state(), ConnectionState::Connected(_)));
    assert!(rx.try_recv().is_err());

    conn.shutdown().await;
    match next_event(&mut rx).await {
        StreamEvent::Closed { reason, .. } => assert_eq!(reason, CloseReason::Shutdown),
        other => panic!("unexpected event: {:?}", other),
    }
    timeout(WAIT, responder).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_connect_timeout_message() {
    // A listener whose accept queue is full drops further SYNs, so the
    // connect never completes.
    let socket = TcpSocket::new_v4().unwrap();
    socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let listener = socket.listen(0).unwrap();
    let addr = listener.local_addr().unwrap();
    let mut fillers = Vec::new();
    for _ in 0..3 {
        if let Ok(Ok(stream)) = timeout(Duration::from_millis(100), TcpStream::connect(addr)).await {
            fillers.push(stream);
        }
    }

    let settings = ConnectionSettings {
        connect_timeout: Some(Duration::from_millis(200)),
        ..Default::default()
    };
    let (conn, _rx) = connection(Endpoint::new("127.0.0.1", addr.port()), settings);

    let err = conn.connect().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_eq!(
        err.to_string(),
        format!(
            "Could not connect to 127.0.0.1:{} timed out after 200ms",
            addr.port()
        )
    );
    assert_eq!(conn.state(), ConnectionState::Closed);
    drop(fillers);
}

#[tokio::test]
async fn test_manager_reuses_connection_per_endpoint() {
    let (listener, endpoint) = listener().await;
    let (manager, _rx) = StreamIngestionManager::new(ManagerSettings::default());
    let uri = format!("shdr://127.0.0.1:{}", endpoint.port());

    let (first, _adapter) = tokio::join!(manager.connect_to(&uri, "mill-1"), accept(&listener));
    let first = first.unwrap();
    let second = manager
        .connect_to(&format!("tcp://127.0.0.1:{}", endpoint.port()), "mill-1")
        .await
        .unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(manager.len().await, 1);
    assert_eq!(manager.endpoints().await, vec![endpoint.clone()]);
    assert!(manager.connection(&endpoint).await.is_some());

    // No second socket was opened.
    assert!(timeout(Duration::from_millis(100), listener.accept()).await.is_err());

    manager.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_connect_to_shares_one_connection() {
    let (listener, endpoint) = listener().await;
    let (manager, _rx) = StreamIngestionManager::new(ManagerSettings::default());
    let uri = format!("shdr://127.0.0.1:{}", endpoint.port());

    // The first caller registers and is mid-connect when the second one
    // looks up the registry.
    let (first, second) = tokio::join!(
        manager.connect_to(&uri, "mill-1"),
        manager.connect_to(&uri, "mill-1")
    );
    let (first, second) = (first.unwrap(), second.unwrap());
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(manager.len().await, 1);

    let _adapter = accept(&listener).await;
    assert!(timeout(Duration::from_millis(100), listener.accept()).await.is_err());

    manager.shutdown().await;
}

#[tokio::test]
async fn test_failed_connect_is_not_registered() {
    let (listener, endpoint) = listener().await;
    drop(listener);

    let (manager, _rx) = StreamIngestionManager::new(ManagerSettings::default());
    let err = manager
        .connect_to(&format!("shdr://127.0.0.1:{}", endpoint.port()), "mill-1")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Network);
    assert!(manager.is_empty().await);
    assert!(manager.connection(&endpoint).await.is_none());
}

#[tokio::test]
async fn test_remote_close_unregisters() {
    let (listener, endpoint) = listener().await;
    let (manager, mut rx) = StreamIngestionManager::new(ManagerSettings::default());

    let url = format!("shdr://127.0.0.1:{}", endpoint.port());
    let (conn, adapter) = tokio::join!(
        manager.connect_to(&url, "mill-1"),
        accept(&listener)
    );
    let conn = conn.unwrap();
    drop(adapter);

    match next_event(&mut rx).await {
        StreamEvent::Closed { reason, .. } => assert_eq!(reason, CloseReason::EndOfStream),
        other => panic!("unexpected event: {:?}", other),
    }
    assert_eq!(conn.state(), ConnectionState::Closed);
    assert!(manager.is_empty().await);

    // A fresh connect_to after the close opens a new connection.
    let url = format!("shdr://127.0.0.1:{}", endpoint.port());
    let (again, _adapter) = tokio::join!(
        manager.connect_to(&url, "mill-1"),
        accept(&listener)
    );
    assert!(!Arc::ptr_eq(&conn, &again.unwrap()));
    manager.shutdown().await;
}

#[tokio::test]
async fn test_manager_shutdown_closes_everything() {
    let (first_listener, first) = listener().await;
    let (second_listener, second) = listener().await;
    let (manager, _rx) = StreamIngestionManager::new(ManagerSettings::default());

    let url = format!("shdr://127.0.0.1:{}", first.port());
    let (a, mut adapter_a) = tokio::join!(
        manager.connect_to(&url, "a"),
        accept(&first_listener)
    );
    let url = format!("shdr://127.0.0.1:{}", second.port());
    let (b, mut adapter_b) = tokio::join!(
        manager.connect_to(&url, "b"),
        accept(&second_listener)
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(manager.len().await, 2);

    // One connection is already closed when the manager shuts down.
    a.shutdown().await;
    manager.shutdown().await;

    assert!(manager.is_empty().await);
    assert_eq!(a.state(), ConnectionState::Closed);
    assert_eq!(b.state(), ConnectionState::Closed);

    let mut rest = Vec::new();
    assert!(timeout(WAIT, adapter_a.read_to_end(&mut rest)).await.is_ok());
    assert!(timeout(WAIT, adapter_b.read_to_end(&mut rest)).await.is_ok());
}
