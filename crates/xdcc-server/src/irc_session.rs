//! Thin wrapper around the `irc` crate: the engine only ever sees the two
//! capabilities `xdcc_transfer::IrcOutbox` demands, plus a subscription
//! handle for inbound CTCP-PRIVMSG events. Connection, auth, channel join,
//! and reconnection on transient errors are the `irc` crate's own concern.

use std::sync::Arc;

use futures_util::stream::StreamExt;
use irc::client::prelude::{Client, Command, Config as IrcConfig, Prefix, Response};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use xdcc_transfer::{CtcpEvent, IrcOutbox};

use crate::config::Config;

const CTCP_DELIM: char = '\u{1}';

/// Live handle to the IRC connection. Cheap to clone (the underlying
/// `irc::client::Sender` is a lightweight channel handle).
pub struct IrcSession {
    sender: irc::client::Sender,
    ctcp_tx: broadcast::Sender<CtcpEvent>,
    our_nick: String,
}

/// A subscription to inbound CTCP-PRIVMSG events. Dropping it unsubscribes
/// — there is nothing else to clean up, since the sender side is a
/// `broadcast::Sender` that keeps running regardless of receiver count.
pub type CtcpSubscription = broadcast::Receiver<CtcpEvent>;

impl IrcSession {
    /// Connect, identify, join the configured channel, and start the
    /// background task that turns inbound IRC messages into `CtcpEvent`s.
    /// Returns the session handle plus the task's `JoinHandle` so the
    /// Supervisor can observe it exiting.
    pub async fn connect(config: &Config) -> anyhow::Result<(Arc<Self>, JoinHandle<()>)> {
        let irc_config = IrcConfig {
            nickname: Some(config.irc_nick.clone()),
            server: Some(config.irc_server.clone()),
            channels: vec![config.irc_channel.clone()],
            use_tls: Some(false),
            ..IrcConfig::default()
        };

        let mut client = Client::from_config(irc_config).await?;
        client.identify()?;

        let sender = client.sender();
        let (ctcp_tx, _) = broadcast::channel(1024);

        let task = spawn_reader(client, sender.clone(), ctcp_tx.clone(), config.irc_nickserv_password.clone());

        Ok((
            Arc::new(Self {
                sender,
                ctcp_tx,
                our_nick: config.irc_nick.clone(),
            }),
            task,
        ))
    }

    pub fn our_nick(&self) -> &str {
        &self.our_nick
    }

    pub fn subscribe_ctcp_privmsg(&self) -> CtcpSubscription {
        self.ctcp_tx.subscribe()
    }

    /// Send an IRC QUIT and let the connection close naturally.
    pub fn quit(&self, message: &str) {
        if let Err(e) = self.sender.send_quit(message) {
            warn!(error = %e, "failed to send IRC QUIT");
        }
    }
}

impl IrcOutbox for IrcSession {
    fn send_privmsg(&self, target: &str, text: &str) {
        if let Err(e) = self.sender.send_privmsg(target, text) {
            warn!(error = %e, target, "failed to send PRIVMSG");
        }
    }

    fn send_ctcp(&self, target: &str, text: &str) {
        let wrapped = format!("{CTCP_DELIM}{text}{CTCP_DELIM}");
        if let Err(e) = self.sender.send_privmsg(target, wrapped) {
            warn!(error = %e, target, "failed to send CTCP");
        }
    }
}

fn spawn_reader(
    mut client: irc::client::Client,
    nickserv_sender: irc::client::Sender,
    ctcp_tx: broadcast::Sender<CtcpEvent>,
    nickserv_password: Option<String>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut stream = match client.stream() {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "failed to obtain IRC message stream");
                return;
            }
        };

        while let Some(message) = stream.next().await {
            let message = match message {
                Ok(m) => m,
                Err(e) => {
                    warn!(error = %e, "IRC connection error");
                    continue;
                }
            };

            match &message.command {
                Command::Response(Response::RPL_WELCOME, _) => {
                    info!("registered with IRC server");
                    if let Some(password) = &nickserv_password {
                        let identify = format!("IDENTIFY {password}");
                        if let Err(e) = nickserv_sender.send_privmsg("NickServ", identify) {
                            warn!(error = %e, "failed to send NickServ IDENTIFY");
                        }
                    }
                }
                Command::PRIVMSG(target, text) => {
                    if let Some(payload) = strip_ctcp(text) {
                        if let Some(Prefix::Nickname(nick, _, _)) = &message.prefix {
                            debug!(sender = %nick, %target, %payload, "ctcp privmsg");
                            let _ = ctcp_tx.send(CtcpEvent {
                                sender: nick.clone(),
                                target: target.clone(),
                                payload,
                            });
                        }
                    }
                }
                _ => {}
            }
        }

        info!("IRC message stream ended");
    })
}

fn strip_ctcp(text: &str) -> Option<String> {
    let text = text.strip_prefix(CTCP_DELIM)?;
    let text = text.strip_suffix(CTCP_DELIM).unwrap_or(text);
    Some(text.to_string())
}
