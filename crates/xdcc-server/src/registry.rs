//! The request registry: maps live transfers keyed by `(filename, port)`,
//! holds the pending-by-bot-name list until the first SEND promotes an
//! entry, and garbage-collects stale, client-less entries.
//!
//! It also owns CTCP routing (spec.md §4.5: "routes CTCP events to the
//! owning transfer"). A bot may have several requests pending at once, so
//! each `Transfer` gets its own private event channel rather than racing
//! every pending transfer for that bot against a shared broadcast — the
//! registry, not the Transfer, decides which pending request a `DCC SEND`
//! belongs to (the oldest still-pending one for that bot nick, in request
//! order) and forwards the event only to it.
//!
//! Backed by `DashMap` (the pattern a sibling IRC downloader in the pack
//! uses for the same job) so lookups from the IRC reader task never block
//! behind an API connection holding the registry lock.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};

use xdcc_transfer::{CtcpEvent, DccMessage, Event};

/// Bookkeeping the registry keeps about one in-flight transfer. The
/// `Transfer` task itself owns its socket, write stream, and progress
/// timer; this is purely the routing/housekeeping layer spec.md assigns
/// to the registry.
pub struct Entry {
    pub cancel: mpsc::Sender<()>,
    pub api_tx: Mutex<Option<mpsc::Sender<Event>>>,
    /// Exclusive delivery channel for CTCP events the registry has routed
    /// to this transfer. Only the registry ever sends on this.
    pub ctcp_tx: mpsc::UnboundedSender<CtcpEvent>,
    pub pack_number: String,
    pub send_progress: bool,
    pub start_time: Instant,
}

#[derive(Default)]
pub struct Registry {
    pending: DashMap<String, VecDeque<Arc<Entry>>>,
    active: DashMap<String, Arc<Entry>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `entry` before any SEND has arrived, keyed by the bot
    /// nickname the request targets.
    pub fn insert_pending(&self, bot_name: &str, entry: Arc<Entry>) {
        self.pending
            .entry(bot_name.to_string())
            .or_default()
            .push_back(entry);
    }

    /// Rekey the oldest still-pending entry for `bot_name` under
    /// `(filename, port)`, once that bot's SEND offer names them. A bot may
    /// have several in-flight transfers; requests promote in request order.
    pub fn promote(&self, bot_name: &str, filename: &str, port: u16) -> Option<Arc<Entry>> {
        let entry = {
            let mut queue = self.pending.get_mut(bot_name)?;
            queue.pop_front()
        }?;
        self.active.insert(registry_key(filename, port), entry.clone());
        Some(entry)
    }

    /// The oldest still-pending entry for `bot_name`, without consuming it
    /// — used to route a non-SEND message (unknown command, unparseable
    /// payload) that carries no `(filename, port)` key of its own.
    fn peek_pending(&self, bot_name: &str) -> Option<Arc<Entry>> {
        self.pending.get(bot_name)?.front().cloned()
    }

    pub fn lookup(&self, filename: &str, port: u16) -> Option<Arc<Entry>> {
        self.active.get(&registry_key(filename, port)).map(|e| e.clone())
    }

    /// Route one inbound CTCP-PRIVMSG event to the transfer that owns it.
    /// This is the single exclusivity point spec.md §4.5 requires: a `DCC
    /// SEND` claims the oldest pending request for its sender and forwards
    /// only to that transfer, so two simultaneous requests to the same bot
    /// never both grab the first offer that comes back.
    ///
    /// - `DCC SEND` for an already-active `(filename, port)` (a replay) is
    ///   forwarded to that transfer; otherwise it promotes and claims the
    ///   oldest pending request for `event.sender`.
    /// - `DCC ACCEPT` is routed purely by `(filename, port)` against the
    ///   active map.
    /// - Anything else (an unknown command, or a payload that fails to
    ///   parse) has no key to route by yet, so it goes to the oldest
    ///   pending request for `event.sender`, best-effort, matching the
    ///   common case of a single outstanding request per bot.
    pub fn dispatch(&self, our_nick: &str, event: CtcpEvent) {
        if event.target != our_nick || !event.payload.starts_with("DCC ") {
            return;
        }

        match xdcc_transfer::parse_dcc(&event.payload) {
            Ok(DccMessage::Send { filename, port, .. }) => {
                let entry = self
                    .lookup(&filename, port)
                    .or_else(|| self.promote(&event.sender, &filename, port));
                if let Some(entry) = entry {
                    let _ = entry.ctcp_tx.send(event);
                }
            }
            Ok(DccMessage::Accept { filename, port, .. }) => {
                if let Some(entry) = self.lookup(&filename, port) {
                    let _ = entry.ctcp_tx.send(event);
                }
            }
            Ok(DccMessage::Unknown { .. }) | Err(_) => {
                if let Some(entry) = self.peek_pending(&event.sender) {
                    let _ = entry.ctcp_tx.send(event);
                }
            }
        }
    }

    /// Null the API-forwarding channel on every entry whose channel is
    /// `target` — the owning client disconnected, but its transfer keeps
    /// running.
    pub async fn detach_socket(&self, target: &mpsc::Sender<Event>) {
        for entry in self.active.iter() {
            let mut slot = entry.api_tx.lock().await;
            if slot.as_ref().is_some_and(|current| current.same_channel(target)) {
                *slot = None;
            }
        }
    }

    pub fn remove(&self, filename: &str, port: u16) {
        self.active.remove(&registry_key(filename, port));
    }

    /// Drop entries whose API client has detached and which have run
    /// longer than `max_age` — called on a 30-minute interval by the
    /// Supervisor.
    pub async fn sweep(&self, max_age: Duration) {
        let mut stale = Vec::new();
        for entry in self.active.iter() {
            let detached = entry.api_tx.lock().await.is_none();
            if detached && entry.start_time.elapsed() > max_age {
                stale.push(entry.key().clone());
            }
        }
        for key in stale {
            self.active.remove(&key);
        }
    }
}

pub fn registry_key(filename: &str, port: u16) -> String {
    format!("{filename}|{port}")
}
