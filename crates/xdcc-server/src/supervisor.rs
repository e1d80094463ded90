//! Owns the IRC session, the registry, and the API listener; wires signal
//! handling and graceful shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{error, info};

use crate::api::{handle_connection, ApiContext};
use crate::config::Config;
use crate::irc_session::IrcSession;
use crate::registry::Registry;

const GC_SWEEP_INTERVAL: Duration = Duration::from_secs(30 * 60);
const GC_MAX_AGE: Duration = Duration::from_secs(60 * 60);

pub struct Supervisor {
    config: Arc<Config>,
    irc: Arc<IrcSession>,
    registry: Arc<Registry>,
}

impl Supervisor {
    pub async fn start(config: Config) -> anyhow::Result<Self> {
        let config = Arc::new(config);
        let (irc, irc_task) = IrcSession::connect(&config).await?;
        let registry = Arc::new(Registry::new());

        tokio::spawn(async move {
            if irc_task.await.is_err() {
                error!("IRC reader task panicked");
            }
        });

        Ok(Self {
            config,
            irc,
            registry,
        })
    }

    /// Accept API connections and run the registry GC sweep until a
    /// termination signal arrives.
    pub async fn run(self) -> anyhow::Result<()> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        info!(%addr, "xdcc-server listening");

        let ctx = Arc::new(ApiContext {
            config: self.config.clone(),
            registry: self.registry.clone(),
            outbox: self.irc.clone(),
            our_nick: self.irc.our_nick().to_string(),
        });

        let registry_for_gc = self.registry.clone();
        let gc_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(GC_SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                registry_for_gc.sweep(GC_MAX_AGE).await;
            }
        });

        // The one and only subscriber to the IRC session's CTCP broadcast:
        // it hands every event to the registry, which owns the exclusivity
        // decision of which pending/active transfer it belongs to.
        let registry_for_dispatch = self.registry.clone();
        let our_nick = self.irc.our_nick().to_string();
        let mut ctcp_rx = self.irc.subscribe_ctcp_privmsg();
        let dispatch_task = tokio::spawn(async move {
            loop {
                match ctcp_rx.recv().await {
                    Ok(event) => registry_for_dispatch.dispatch(&our_nick, event),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let accept_loop = async {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let ctx = ctx.clone();
                        tokio::spawn(async move {
                            info!(%peer, "accepted api connection");
                            handle_connection(stream, ctx).await;
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "failed to accept api connection");
                    }
                }
            }
        };

        tokio::select! {
            _ = accept_loop => {}
            _ = shutdown_signal() => {
                info!("shutting down");
            }
        }

        gc_task.abort();
        dispatch_task.abort();
        self.irc.quit("shutting down");
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => info!("received Ctrl+C"),
            _ = sigterm.recv() => info!("received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("received Ctrl+C");
    }
}
