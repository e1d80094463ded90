//! End-to-end: a download that resumes from an existing `.part` file
//! negotiates `DCC RESUME`/`DCC ACCEPT` before opening the data channel.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

use xdcc_transfer::{ip_to_u32, CtcpEvent, Event, IrcOutbox, TransferConfig};

struct RecordingOutbox {
    sent: std::sync::Mutex<Vec<(String, String)>>,
}

impl RecordingOutbox {
    fn new() -> Self {
        Self {
            sent: std::sync::Mutex::new(Vec::new()),
        }
    }
    fn messages(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }
}

impl IrcOutbox for RecordingOutbox {
    fn send_privmsg(&self, target: &str, text: &str) {
        self.sent.lock().unwrap().push((target.to_string(), text.to_string()));
    }
    fn send_ctcp(&self, target: &str, text: &str) {
        self.sent.lock().unwrap().push((target.to_string(), format!("\u{1}{text}\u{1}")));
    }
}

#[tokio::test]
async fn resumed_download_requests_and_confirms_offset() {
    let dir = std::env::temp_dir().join(format!("xdcc-transfer-resume-{}", std::process::id()));
    let _ = tokio::fs::remove_dir_all(&dir).await;
    tokio::fs::create_dir_all(&dir).await.unwrap();
    tokio::fs::write(dir.join("a.bin.part"), b"\x01\x02\x03").await.unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let peer_addr = listener.local_addr().unwrap();
    let IpAddr::V4(peer_ip) = peer_addr.ip() else {
        unreachable!()
    };

    let server = tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        sock.write_all(b"\x04\x05").await.unwrap();
        let mut ack = [0u8; 4];
        sock.read_exact(&mut ack).await.unwrap();
        assert_eq!(u32::from_be_bytes(ack), 5);
    });

    let outbox = Arc::new(RecordingOutbox::new());
    let (ctcp_tx, ctcp_rx) = mpsc::unbounded_channel();
    let (events_tx, mut events_rx) = mpsc::channel(16);
    let (_cancel_tx, cancel_rx) = mpsc::channel(1);

    let config = TransferConfig {
        dest_dir: dir.clone(),
        resume_enabled: true,
        progress_interval: Duration::from_millis(20),
        progress_update_percent: 10,
        reject_private_ip: false,
        idle_timeout: Duration::from_secs(5),
    };

    let driver = tokio::spawn(xdcc_transfer::run(
        "Bot|A".to_string(),
        "7".to_string(),
        "me".to_string(),
        outbox.clone(),
        ctcp_rx,
        config,
        Arc::new(xdcc_transfer::NullLogger),
        events_tx,
        cancel_rx,
    ));

    ctcp_tx
        .send(CtcpEvent {
            sender: "Bot|A".to_string(),
            target: "me".to_string(),
            payload: format!("DCC SEND \"a.bin\" {} {} 5", ip_to_u32(peer_ip), peer_addr.port()),
        })
        .unwrap();

    // Wait for the RESUME to go out before replying with ACCEPT.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(outbox
        .messages()
        .iter()
        .any(|(_, text)| text.contains(&format!("DCC RESUME a.bin {} 3", peer_addr.port()))));

    ctcp_tx
        .send(CtcpEvent {
            sender: "Bot|A".to_string(),
            target: "me".to_string(),
            payload: format!("DCC ACCEPT a.bin {} 3", peer_addr.port()),
        })
        .unwrap();

    server.await.unwrap();

    let mut saw_complete = false;
    while let Some(event) = events_rx.recv().await {
        if let Event::Complete { size, path, .. } = event {
            assert_eq!(size, 5);
            assert_eq!(tokio::fs::read(&path).await.unwrap(), vec![1, 2, 3, 4, 5]);
            saw_complete = true;
            break;
        }
    }
    assert!(saw_complete);
    driver.await.unwrap();
}
