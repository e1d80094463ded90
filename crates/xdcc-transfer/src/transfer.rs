//! The Transfer state machine: CTCP negotiation, the TCP data pump, the
//! ACK writer, and the progress timer, all under a single task.
//!
//! The IRC session is consumed only through [`IrcOutbox`] and a private
//! `mpsc::UnboundedReceiver<CtcpEvent>` — the two capabilities spec'd as
//! the engine's only dependency on the outside world. The channel is
//! exclusive to this Transfer: the registry (or whatever owns CTCP
//! dispatch) decides which in-flight Transfer a given CTCP event belongs
//! to and forwards only to it, so a bot with several simultaneous
//! requests never races two Transfers over the same `DCC SEND` reply.
//! Dropping the receiver is the unsubscribe.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, MissedTickBehavior};

use crate::error::{Result, TransferError};
use crate::logging::{TransferEvent as LogEvent, TransferLog, TransferLogger};
use crate::protocol::{self, DccMessage};
use crate::store::PartialFile;

/// Negotiated pack metadata, fixed once the bot's `DCC SEND` arrives
/// (`resume_pos` is filled in afterwards, once the `.part` file is
/// inspected).
#[derive(Debug, Clone)]
pub struct PackInfo {
    pub filename: String,
    pub peer_addr: SocketAddr,
    pub file_size: u64,
    pub resume_pos: u64,
}

/// An inbound CTCP payload carried over PRIVMSG, as delivered by the IRC
/// session to every subscriber.
#[derive(Debug, Clone)]
pub struct CtcpEvent {
    pub sender: String,
    pub target: String,
    pub payload: String,
}

/// What a Transfer needs to speak to the bot: send a PRIVMSG or a CTCP.
/// Nothing else about the IRC session is visible to the engine.
pub trait IrcOutbox: Send + Sync {
    fn send_privmsg(&self, target: &str, text: &str);
    fn send_ctcp(&self, target: &str, text: &str);
}

/// Public events a Transfer emits over its lifetime. The API front-end
/// forwards these (minus `Connect`, which has no client-facing envelope)
/// to the requesting client; the log sink receives every one of them via
/// [`TransferLogger`] as well.
#[derive(Debug, Clone)]
pub enum Event {
    /// Emitted once the bot's `DCC SEND` has been parsed. Purely
    /// informational by the time this fires — the registry has already
    /// rekeyed the pending entry to `(filename, peer_port)` at dispatch
    /// time, before this Transfer ever saw the event.
    Negotiated {
        filename: String,
        peer_port: u16,
        file_size: u64,
    },
    Connect { peer: SocketAddr },
    Progress {
        filename: String,
        received: u64,
        total: u64,
        percent: Option<u8>,
    },
    Complete {
        filename: String,
        path: PathBuf,
        size: u64,
    },
    Error { message: String },
}

/// Tunables collected from configuration so a Transfer can be constructed
/// in tests without touching environment variables.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub dest_dir: PathBuf,
    pub resume_enabled: bool,
    pub progress_interval: Duration,
    pub progress_update_percent: u8,
    pub reject_private_ip: bool,
    pub idle_timeout: Duration,
}

struct DataChannelOutcome {
    /// Peer closed after every expected byte arrived (or, for an
    /// unknown-size offer, closed without a read/write error at all).
    finished_cleanly: bool,
}

/// Drive one download end to end. Returns once exactly one terminal event
/// (`Complete` or `Error`) has been sent on `events`, or once `cancel`
/// fires before negotiation completes.
pub async fn run(
    bot_name: String,
    pack_number: String,
    our_nick: String,
    outbox: Arc<dyn IrcOutbox>,
    mut ctcp_rx: mpsc::UnboundedReceiver<CtcpEvent>,
    config: TransferConfig,
    logger: Arc<dyn TransferLogger>,
    events: mpsc::Sender<Event>,
    mut cancel: mpsc::Receiver<()>,
) {
    let pending_key = format!("pending|{}", bot_name);
    outbox.send_privmsg(&bot_name, &format!("XDCC SEND #{}", pack_number));
    logger.log(TransferLog {
        component: "transfer",
        transfer_key: pending_key.clone(),
        event: LogEvent::Negotiating {
            bot: bot_name.clone(),
            file_size: 0,
        },
    });

    let pack = tokio::select! {
        biased;
        _ = cancel.recv() => {
            outbox.send_privmsg(&bot_name, "XDCC CANCEL");
            return;
        }
        result = await_send(&bot_name, &our_nick, &mut ctcp_rx, &config) => result,
    };

    let mut pack = match pack {
        Ok(p) => p,
        Err(e) => {
            send_error(&events, &logger, &pending_key, e.to_string(), 0).await;
            return;
        }
    };

    let transfer_key = format!("{}|{}", pack.filename, pack.peer_addr.port());
    logger.log(TransferLog {
        component: "transfer",
        transfer_key: transfer_key.clone(),
        event: LogEvent::Negotiating {
            bot: bot_name.clone(),
            file_size: pack.file_size,
        },
    });
    let _ = events
        .send(Event::Negotiated {
            filename: pack.filename.clone(),
            peer_port: pack.peer_addr.port(),
            file_size: pack.file_size,
        })
        .await;

    let partial = match PartialFile::open(&config.dest_dir, &pack.filename, config.resume_enabled).await {
        Ok(p) => p,
        Err(e) => {
            send_error(&events, &logger, &transfer_key, e.to_string(), 0).await;
            return;
        }
    };
    pack.resume_pos = partial.resume_offset();

    if pack.resume_pos > 0 {
        logger.log(TransferLog {
            component: "transfer",
            transfer_key: transfer_key.clone(),
            event: LogEvent::ResumeRequested {
                offset: pack.resume_pos,
            },
        });
        let resume_payload = format!(
            "\u{1}{}\u{1}",
            protocol::encode_resume(&pack.filename, pack.peer_addr.port(), pack.resume_pos)
        );
        outbox.send_ctcp(&bot_name, &resume_payload);

        let accept = tokio::select! {
            biased;
            _ = cancel.recv() => {
                outbox.send_privmsg(&bot_name, "XDCC CANCEL");
                return;
            }
            result = await_accept(&bot_name, &our_nick, &mut ctcp_rx, &pack) => result,
        };
        if let Err(e) = accept {
            send_error(&events, &logger, &transfer_key, e.to_string(), partial.received).await;
            return;
        }
        logger.log(TransferLog {
            component: "transfer",
            transfer_key: transfer_key.clone(),
            event: LogEvent::AcceptConfirmed {
                offset: pack.resume_pos,
            },
        });
    }

    run_download(
        pack,
        partial,
        transfer_key,
        outbox,
        bot_name,
        config,
        logger,
        events,
        cancel,
    )
    .await;
}

async fn await_send(
    bot_name: &str,
    our_nick: &str,
    ctcp_rx: &mut mpsc::UnboundedReceiver<CtcpEvent>,
    config: &TransferConfig,
) -> Result<PackInfo> {
    loop {
        let event = recv_ctcp(ctcp_rx).await?;
        if event.sender != bot_name || event.target != our_nick || !event.payload.starts_with("DCC ") {
            continue;
        }
        match protocol::parse_dcc(&event.payload)? {
            DccMessage::Send {
                filename,
                ip,
                port,
                file_size,
            } => {
                if config.reject_private_ip && is_rejected(&ip) {
                    return Err(TransferError::RejectedPrivateAddress(ip));
                }
                return Ok(PackInfo {
                    filename,
                    peer_addr: SocketAddr::new(ip.into(), port),
                    file_size,
                    resume_pos: 0,
                });
            }
            DccMessage::Accept { .. } => {
                return Err(TransferError::UnexpectedDccCommand {
                    command: "ACCEPT".into(),
                    expected: "SEND",
                })
            }
            DccMessage::Unknown { command } => {
                return Err(TransferError::UnexpectedDccCommand {
                    command,
                    expected: "SEND",
                })
            }
        }
    }
}

async fn await_accept(
    bot_name: &str,
    our_nick: &str,
    ctcp_rx: &mut mpsc::UnboundedReceiver<CtcpEvent>,
    pack: &PackInfo,
) -> Result<()> {
    loop {
        let event = recv_ctcp(ctcp_rx).await?;
        if event.sender != bot_name || event.target != our_nick || !event.payload.starts_with("DCC ") {
            continue;
        }
        match protocol::parse_dcc(&event.payload)? {
            DccMessage::Accept {
                filename,
                port,
                position,
            } => {
                if filename != pack.filename || port != pack.peer_addr.port() || position != pack.resume_pos {
                    return Err(TransferError::AcceptMismatch {
                        expected: pack.resume_pos,
                        got: position,
                    });
                }
                return Ok(());
            }
            // A replayed SEND while we wait for ACCEPT is not an error, just noise.
            DccMessage::Send { .. } => continue,
            DccMessage::Unknown { command } => {
                return Err(TransferError::UnexpectedDccCommand {
                    command,
                    expected: "ACCEPT",
                })
            }
        }
    }
}

async fn recv_ctcp(rx: &mut mpsc::UnboundedReceiver<CtcpEvent>) -> Result<CtcpEvent> {
    rx.recv().await.ok_or(TransferError::IrcChannelClosed)
}

#[allow(clippy::too_many_arguments)]
async fn run_download(
    pack: PackInfo,
    mut partial: PartialFile,
    transfer_key: String,
    outbox: Arc<dyn IrcOutbox>,
    bot_name: String,
    config: TransferConfig,
    logger: Arc<dyn TransferLogger>,
    events: mpsc::Sender<Event>,
    mut cancel: mpsc::Receiver<()>,
) {
    let mut socket = match timeout(config.idle_timeout, TcpStream::connect(pack.peer_addr)).await {
        Ok(Ok(s)) => s,
        Ok(Err(source)) => {
            let err = TransferError::Connect {
                addr: pack.peer_addr,
                source,
            };
            send_error(&events, &logger, &transfer_key, err.to_string(), partial.received).await;
            return;
        }
        Err(_) => {
            send_error(&events, &logger, &transfer_key, TransferError::IdleTimeout.to_string(), partial.received).await;
            return;
        }
    };

    let _ = events.send(Event::Connect { peer: pack.peer_addr }).await;
    logger.log(TransferLog {
        component: "transfer",
        transfer_key: transfer_key.clone(),
        event: LogEvent::Connected {
            peer_addr: pack.peer_addr.to_string(),
        },
    });

    let start = Instant::now();
    let mut received_at_last_tick = partial.received;
    let mut ticker = interval(config.progress_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await; // first tick fires immediately; discard it

    let mut buf = vec![0u8; 64 * 1024];
    let mut cancelled = false;

    let outcome = loop {
        tokio::select! {
            biased;
            _ = cancel.recv() => {
                cancelled = true;
                outbox.send_privmsg(&bot_name, "XDCC CANCEL");
                break DataChannelOutcome { finished_cleanly: false };
            }
            _ = ticker.tick() => {
                emit_progress(&pack, &partial, received_at_last_tick, start, &config, &logger, &transfer_key, &events).await;
                received_at_last_tick = partial.received;
            }
            read = timeout(config.idle_timeout, socket.read(&mut buf)) => {
                match read {
                    Err(_) => {
                        send_error(&events, &logger, &transfer_key, TransferError::IdleTimeout.to_string(), partial.received).await;
                        return;
                    }
                    Ok(Err(source)) => {
                        send_error(&events, &logger, &transfer_key, TransferError::Read(source).to_string(), partial.received).await;
                        return;
                    }
                    Ok(Ok(0)) => {
                        let clean = pack.file_size == 0 || partial.received == pack.file_size;
                        break DataChannelOutcome { finished_cleanly: clean };
                    }
                    Ok(Ok(n)) => {
                        if let Err(e) = partial.write(&buf[..n]).await {
                            send_error(&events, &logger, &transfer_key, e.to_string(), partial.received).await;
                            return;
                        }
                        let ack = protocol::ack_value(partial.received);
                        if let Err(source) = socket.write_all(&protocol::encode_ack(ack)).await {
                            send_error(&events, &logger, &transfer_key, TransferError::Write(source).to_string(), partial.received).await;
                            return;
                        }
                    }
                }
            }
        }
    };

    if cancelled {
        send_error(&events, &logger, &transfer_key, "download canceled".to_string(), partial.received).await;
        return;
    }

    if outcome.finished_cleanly {
        let total = partial.received;
        match partial.finalize(total, true).await {
            Ok(path) => {
                let duration_ms = start.elapsed().as_millis() as u64;
                logger.log(TransferLog {
                    component: "transfer",
                    transfer_key: transfer_key.clone(),
                    event: LogEvent::Complete {
                        total_bytes: total,
                        duration_ms,
                    },
                });
                let _ = events
                    .send(Event::Complete {
                        filename: pack.filename.clone(),
                        path,
                        size: total,
                    })
                    .await;
            }
            Err(e) => {
                send_error(&events, &logger, &transfer_key, e.to_string(), total).await;
            }
        }
    } else {
        send_error(
            &events,
            &logger,
            &transfer_key,
            "Server unexpectedly closed connection".to_string(),
            partial.received,
        )
        .await;
    }
}

#[allow(clippy::too_many_arguments)]
async fn emit_progress(
    pack: &PackInfo,
    partial: &PartialFile,
    received_at_last_tick: u64,
    start: Instant,
    config: &TransferConfig,
    logger: &Arc<dyn TransferLogger>,
    transfer_key: &str,
    events: &mpsc::Sender<Event>,
) {
    let received = partial.received;
    let elapsed = start.elapsed().as_secs_f64().max(f64::EPSILON);
    let interval_secs = config.progress_interval.as_secs_f64().max(f64::EPSILON);
    let speed_recent = received.saturating_sub(received_at_last_tick) as f64 / interval_secs;
    let speed_avg = received as f64 / elapsed;

    let percent = if pack.file_size > 0 {
        Some(((received.saturating_mul(100) / pack.file_size).min(100)) as u8)
    } else {
        None
    };

    let _ = events
        .send(Event::Progress {
            filename: pack.filename.clone(),
            received,
            total: pack.file_size,
            percent,
        })
        .await;

    if let Some(p) = percent {
        let granularity = config.progress_update_percent.max(1);
        if p == 100 || p % granularity == 0 {
            let speed = if speed_recent > 0.0 { speed_recent } else { speed_avg };
            logger.log(TransferLog {
                component: "transfer",
                transfer_key: transfer_key.to_string(),
                event: LogEvent::Progress {
                    received,
                    file_size: pack.file_size,
                    percent: p,
                    speed_bps: speed,
                },
            });
        }
    }
}

async fn send_error(
    events: &mpsc::Sender<Event>,
    logger: &Arc<dyn TransferLogger>,
    transfer_key: &str,
    message: String,
    received: u64,
) {
    logger.log(TransferLog {
        component: "transfer",
        transfer_key: transfer_key.to_string(),
        event: LogEvent::Error {
            message: message.clone(),
            received,
        },
    });
    let _ = events.send(Event::Error { message }).await;
}

/// RFC1918 private ranges, loopback, link-local, and unspecified — an
/// advertised address in any of these is unreachable from outside the
/// bot's own host.
fn is_rejected(ip: &Ipv4Addr) -> bool {
    ip.is_private() || ip.is_loopback() || ip.is_link_local() || ip.is_unspecified()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RecordingOutbox {
        sent: std::sync::Mutex<Vec<(String, String, bool)>>,
    }

    impl RecordingOutbox {
        fn new() -> Self {
            Self {
                sent: std::sync::Mutex::new(Vec::new()),
            }
        }
    }

    impl IrcOutbox for RecordingOutbox {
        fn send_privmsg(&self, target: &str, text: &str) {
            self.sent
                .lock()
                .unwrap()
                .push((target.to_string(), text.to_string(), false));
        }
        fn send_ctcp(&self, target: &str, text: &str) {
            self.sent
                .lock()
                .unwrap()
                .push((target.to_string(), text.to_string(), true));
        }
    }

    fn test_config(dest: PathBuf) -> TransferConfig {
        TransferConfig {
            dest_dir: dest,
            resume_enabled: true,
            progress_interval: Duration::from_millis(20),
            progress_update_percent: 10,
            reject_private_ip: false,
            idle_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn fresh_download_end_to_end() {
        let dir = std::env::temp_dir().join(format!("xdcc-transfer-e2e-{}", line!()));
        let _ = tokio::fs::remove_dir_all(&dir).await;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(b"\x01\x02\x03\x04\x05").await.unwrap();
            let mut ack = [0u8; 4];
            sock.read_exact(&mut ack).await.unwrap();
            assert_eq!(u32::from_be_bytes(ack), 5);
        });

        let outbox = Arc::new(RecordingOutbox::new());
        let (ctcp_tx, ctcp_rx) = mpsc::unbounded_channel();
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let (_cancel_tx, cancel_rx) = mpsc::channel(1);

        let send_payload = format!(
            "DCC SEND \"a.bin\" {} {} 5",
            protocol::ip_to_u32(match peer_addr.ip() {
                std::net::IpAddr::V4(v4) => v4,
                _ => unreachable!(),
            }),
            peer_addr.port()
        );

        let driver = tokio::spawn(run(
            "Bot|A".to_string(),
            "7".to_string(),
            "me".to_string(),
            outbox.clone(),
            ctcp_rx,
            test_config(dir.clone()),
            Arc::new(crate::logging::NullLogger),
            events_tx,
            cancel_rx,
        ));

        ctcp_tx
            .send(CtcpEvent {
                sender: "Bot|A".to_string(),
                target: "me".to_string(),
                payload: send_payload,
            })
            .unwrap();

        server.await.unwrap();

        let mut saw_complete = false;
        while let Some(event) = events_rx.recv().await {
            if let Event::Complete { path, size, .. } = event {
                assert_eq!(size, 5);
                assert_eq!(tokio::fs::read(&path).await.unwrap(), vec![1, 2, 3, 4, 5]);
                saw_complete = true;
                break;
            }
        }
        assert!(saw_complete);
        driver.await.unwrap();
    }

    #[test]
    fn private_ip_rejection_covers_loopback_and_rfc1918() {
        assert!(is_rejected(&Ipv4Addr::new(127, 0, 0, 1)));
        assert!(is_rejected(&Ipv4Addr::new(10, 0, 0, 5)));
        assert!(is_rejected(&Ipv4Addr::new(192, 168, 1, 1)));
        assert!(!is_rejected(&Ipv4Addr::new(8, 8, 8, 8)));
    }
}
