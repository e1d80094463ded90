//! End-to-end: an `ACCEPT` reply with a mismatched offset ends the
//! transfer in error, with no data channel ever opened and no file
//! produced.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use xdcc_transfer::{ip_to_u32, CtcpEvent, Event, IrcOutbox, TransferConfig};

struct NullOutbox;
impl IrcOutbox for NullOutbox {
    fn send_privmsg(&self, _target: &str, _text: &str) {}
    fn send_ctcp(&self, _target: &str, _text: &str) {}
}

#[tokio::test]
async fn mismatched_accept_offset_is_an_error_not_a_download() {
    let dir = std::env::temp_dir().join(format!("xdcc-transfer-mismatch-{}", std::process::id()));
    let _ = tokio::fs::remove_dir_all(&dir).await;
    tokio::fs::create_dir_all(&dir).await.unwrap();
    tokio::fs::write(dir.join("a.bin.part"), vec![0u8; 100]).await.unwrap();

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
        Arc::new(NullOutbox),
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
            payload: format!("DCC SEND \"a.bin\" {} 5000 200", ip_to_u32(std::net::Ipv4Addr::new(127, 0, 0, 1))),
        })
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;

    ctcp_tx
        .send(CtcpEvent {
            sender: "Bot|A".to_string(),
            target: "me".to_string(),
            payload: "DCC ACCEPT a.bin 5000 99".to_string(),
        })
        .unwrap();

    let mut saw_error = false;
    while let Some(event) = events_rx.recv().await {
        if let Event::Error { message } = event {
            assert!(message.contains("ACCEPT"));
            saw_error = true;
            break;
        }
    }
    assert!(saw_error);
    assert!(!dir.join("a.bin").exists());
    driver.await.unwrap();
}
