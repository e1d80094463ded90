//! Per-connection JSON API front-end: one task per accepted TCP
//! connection, reading a single request object and forwarding the
//! resulting Transfer's events back as concatenated JSON objects.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{info, warn};

use xdcc_transfer::{Event, IrcOutbox, TransferConfig};

use crate::config::Config;
use crate::registry::{Entry, Registry};

const MAX_REQUEST_BYTES: usize = 10_000;
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct DownloadRequest {
    bot_name: String,
    pack_number: String,
    send_progress: bool,
}

#[derive(Debug, Serialize)]
#[serde(tag = "status")]
enum Envelope {
    #[serde(rename = "downloading")]
    Downloading { message: String, pack_number: String },
    #[serde(rename = "progress")]
    Progress {
        filename: String,
        progress: u8,
        received: u64,
        total: u64,
    },
    #[serde(rename = "success")]
    Success {
        filename: String,
        path: String,
        size: u64,
        pack_number: String,
    },
    #[serde(rename = "error")]
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        pack_number: Option<String>,
    },
}

/// Shared handle an accept loop passes to every connection task.
pub struct ApiContext {
    pub config: Arc<Config>,
    pub registry: Arc<Registry>,
    pub outbox: Arc<dyn IrcOutbox>,
    pub our_nick: String,
}

pub async fn handle_connection(mut stream: TcpStream, ctx: Arc<ApiContext>) {
    let request = match read_request(&mut stream).await {
        Ok(req) => req,
        Err(message) => {
            let _ = write_envelope(
                &mut stream,
                &Envelope::Error {
                    message,
                    pack_number: None,
                },
            )
            .await;
            return;
        }
    };

    if request.bot_name.is_empty() || request.pack_number.is_empty() {
        let _ = write_envelope(
            &mut stream,
            &Envelope::Error {
                message: "bot_name and pack_number must be non-empty".to_string(),
                pack_number: None,
            },
        )
        .await;
        return;
    }

    if write_envelope(
        &mut stream,
        &Envelope::Downloading {
            message: "Download starting".to_string(),
            pack_number: request.pack_number.clone(),
        },
    )
    .await
    .is_err()
    {
        return;
    }

    let (events_tx, mut events_rx) = mpsc::channel::<Event>(64);
    let (cancel_tx, cancel_rx) = mpsc::channel(1);
    let (ctcp_tx, ctcp_rx) = mpsc::unbounded_channel();

    let entry = Arc::new(Entry {
        cancel: cancel_tx,
        api_tx: tokio::sync::Mutex::new(Some(events_tx.clone())),
        ctcp_tx,
        pack_number: request.pack_number.clone(),
        send_progress: request.send_progress,
        start_time: Instant::now(),
    });
    ctx.registry.insert_pending(&request.bot_name, entry);

    let transfer_config = TransferConfig {
        dest_dir: ctx.config.file_destination.clone(),
        resume_enabled: true,
        progress_interval: ctx.config.progress_interval,
        progress_update_percent: ctx.config.progress_update_percent,
        reject_private_ip: ctx.config.reject_private_ip,
        idle_timeout: IDLE_TIMEOUT,
    };

    let registry = ctx.registry.clone();
    let bot_name = request.bot_name.clone();
    let pack_number = request.pack_number.clone();
    let outbox = ctx.outbox.clone();
    let our_nick = ctx.our_nick.clone();
    let logger: Arc<dyn xdcc_transfer::TransferLogger> = Arc::new(xdcc_transfer::TracingLogger);

    let transfer_task = tokio::spawn(xdcc_transfer::run(
        bot_name.clone(),
        pack_number.clone(),
        our_nick,
        outbox,
        ctcp_rx,
        transfer_config,
        logger,
        events_tx.clone(),
        cancel_rx,
    ));
    // A panic inside the Transfer task must not kill the process or leave
    // the client hanging: surface it as a terminal `dlerror`.
    let panic_events_tx = events_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = transfer_task.await {
            if e.is_panic() {
                warn!(error = %e, "transfer task panicked");
                let _ = panic_events_tx
                    .send(Event::Error {
                        message: "internal transfer error".to_string(),
                    })
                    .await;
            }
        }
    });

    let mut last_activity = Instant::now();
    loop {
        tokio::select! {
            event = events_rx.recv() => {
                let Some(event) = event else { break; };
                last_activity = Instant::now();
                match event {
                    // The registry already promoted this request to `(filename,
                    // peer_port)` in `active` when it dispatched the SEND that
                    // produced this event — nothing left to do here.
                    Event::Negotiated { .. } => {}
                    Event::Connect { .. } => {}
                    Event::Progress { filename, received, total, percent } => {
                        if request.send_progress {
                            let envelope = Envelope::Progress {
                                filename,
                                progress: percent.unwrap_or(0),
                                received,
                                total,
                            };
                            if write_envelope(&mut stream, &envelope).await.is_err() {
                                detach(&registry, &events_tx).await;
                                return;
                            }
                        }
                    }
                    Event::Complete { filename, path, size } => {
                        let envelope = Envelope::Success {
                            filename,
                            path: path.display().to_string(),
                            size,
                            pack_number: pack_number.clone(),
                        };
                        let _ = write_envelope(&mut stream, &envelope).await;
                        let _ = stream.flush().await;
                        let _ = stream.shutdown().await;
                        break;
                    }
                    Event::Error { message } => {
                        let envelope = Envelope::Error {
                            message,
                            pack_number: Some(pack_number.clone()),
                        };
                        let _ = write_envelope(&mut stream, &envelope).await;
                        let _ = stream.flush().await;
                        let _ = stream.shutdown().await;
                        break;
                    }
                }
            }
            _ = tokio::time::sleep(IDLE_TIMEOUT.saturating_sub(last_activity.elapsed())) => {
                info!(bot = %bot_name, "api connection idle, detaching");
                detach(&registry, &events_tx).await;
                return;
            }
            n = stream.read(&mut [0u8; 1]) => {
                match n {
                    Ok(0) | Err(_) => {
                        info!(bot = %bot_name, "api client disconnected mid-transfer");
                        detach(&registry, &events_tx).await;
                        return;
                    }
                    Ok(_) => {
                        // Clients aren't expected to send anything after the
                        // initial request; ignore stray bytes.
                        last_activity = Instant::now();
                    }
                }
            }
        }
    }
}

async fn detach(registry: &Registry, events_tx: &mpsc::Sender<Event>) {
    registry.detach_socket(events_tx).await;
}

async fn read_request(stream: &mut TcpStream) -> Result<DownloadRequest, String> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        // Any parse failure just means "not a complete object yet" — keep
        // reading until it succeeds or the byte cap is hit. Objects may
        // straddle TCP segments, so a failure here is never treated as
        // terminal on its own.
        if let Ok(req) = serde_json::from_slice::<DownloadRequest>(&buf) {
            return Ok(req);
        }

        if buf.len() >= MAX_REQUEST_BYTES {
            return Err("Request too large".to_string());
        }

        let n = match timeout_read(stream, &mut chunk).await {
            Ok(n) => n,
            Err(_) => return Err("Request timed out".to_string()),
        };
        if n == 0 {
            return Err("Connection closed before a valid request was received".to_string());
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

async fn timeout_read(stream: &mut TcpStream, buf: &mut [u8]) -> Result<usize, ()> {
    match tokio::time::timeout(IDLE_TIMEOUT, stream.read(buf)).await {
        Ok(Ok(n)) => Ok(n),
        Ok(Err(_)) | Err(_) => Err(()),
    }
}

async fn write_envelope(stream: &mut TcpStream, envelope: &Envelope) -> std::io::Result<()> {
    let json = serde_json::to_vec(envelope).expect("envelope always serializes");
    stream.write_all(&json).await?;
    stream.flush().await?;
    if matches!(envelope, Envelope::Error { .. }) {
        warn!(?envelope, "sent error envelope");
    }
    Ok(())
}
