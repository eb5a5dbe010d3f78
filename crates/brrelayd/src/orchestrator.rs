//! Orchestrator (§4.O): the top-level lifecycle state machine that owns
//! every long-lived task and routes `CoreEvent`s between them, mode-gated
//! across the core's four lifecycle phases, with each `spawn_*` helper
//! returning the `JoinHandle` the caller tracks for shutdown.

use crate::session::{ClientFrame, ReconnectHooks, ServerFrame, Session, SessionConfig, SessionHandle};
use anyhow::{anyhow, Result};
use brcore::config::ClientConfig;
use brcore::delivery::{DeliveryHub, StreamKind};
use brcore::gc::GcController;
use brcore::kx::KxEngine;
use brcore::notify::{CoreEvent, NotificationBus};
use brcore::outbox::Outbox;
use brcore::ratchet::{seal, RvTag};
use brcore::registry::{UserId, UserRegistry};
use brcore::rv::{HandlerKind, RvManager};
use brcore::vault::Vault;
use brcore::wire::{encode, RoutedMessage};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

/// Top-level lifecycle phase (§4.O). `Degraded` is entered whenever the
/// relay session drops; `Running` resumes once it reconnects. Neither
/// implies enforcement is paused (there is none here) — it only gates
/// whether outbound traffic is attempted versus queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreMode {
    Starting,
    Running,
    Degraded,
    ShuttingDown,
}

/// Broadcast message for orchestrator-level lifecycle transitions, distinct
/// from the richer per-domain `CoreEvent`s carried on the notification bus.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    ModeChanged(CoreMode),
}

/// Every shared component the daemon wires together, constructed once at
/// startup and handed to every task and IPC handler.
pub struct Core {
    pub vault: Arc<Mutex<Vault>>,
    pub config: ClientConfig,
    pub registry: Arc<UserRegistry>,
    pub rv: Arc<RvManager>,
    pub outbox: Arc<Outbox>,
    pub kx: Arc<KxEngine>,
    pub gc: Arc<GcController>,
    pub delivery: Arc<DeliveryHub>,
    pub bus: Arc<NotificationBus>,
    pub session: RwLock<Option<SessionHandle>>,
    mode: RwLock<CoreMode>,
    mode_tx: tokio::sync::broadcast::Sender<OrchestratorEvent>,
}

impl Core {
    pub fn mode(&self) -> CoreMode {
        *self.mode.read()
    }

    fn set_mode(&self, mode: CoreMode) {
        *self.mode.write() = mode;
        let _ = self.mode_tx.send(OrchestratorEvent::ModeChanged(mode));
    }

    pub fn subscribe_mode(&self) -> tokio::sync::broadcast::Receiver<OrchestratorEvent> {
        self.mode_tx.subscribe()
    }
}

struct CoreReconnectHooks {
    rv: Arc<RvManager>,
    outbox: Arc<Outbox>,
}

#[async_trait::async_trait]
impl ReconnectHooks for CoreReconnectHooks {
    async fn live_rv_tags(&self) -> Vec<([u8; 32], bool)> {
        self.rv
            .all_tags()
            .into_iter()
            .map(|(tag, paid)| (tag.0, paid))
            .collect()
    }

    async fn unacked_pushes(&self) -> Vec<ClientFrame> {
        let mut frames = Vec::new();
        for target in self.outbox.all_targets() {
            if let Some(entry) = self.outbox.peek_front(&target) {
                frames.push(ClientFrame::Push {
                    rv: entry.rv.0,
                    payload: entry.rm_bytes,
                    payment: entry.payment_hint,
                });
            }
        }
        frames
    }
}

/// Everything spawned at startup, handed back so `main` can await it at
/// shutdown (§4.Q).
pub struct RunningTasks {
    pub handles: Vec<tokio::task::JoinHandle<()>>,
}

/// Build every component, start the relay session, and spawn every
/// long-lived task from §5: session reader/writer (owned by the session
/// itself), the inbound-frame dispatcher, the retry scheduler, and the KX
/// timeout sweeper. Returns the shared `Core` plus the task handles.
pub async fn start(
    vault: Vault,
    config: ClientConfig,
    app_dir: PathBuf,
    shutdown: watch::Receiver<bool>,
) -> Result<(Arc<Core>, RunningTasks)> {
    let registry = Arc::new(UserRegistry::load(&vault)?);
    let outbox = Arc::new(Outbox::open(
        app_dir.join("outbox"),
        config.outbox_backoff.clone(),
    )?);
    let rv = Arc::new(RvManager::new());
    let kx = Arc::new(KxEngine::new(120, config.ratchet_window));
    let gc = Arc::new(GcController::new());
    let delivery = Arc::new(DeliveryHub::open(&app_dir.join("streams"))?);
    let bus = Arc::new(NotificationBus::new());
    let vault = Arc::new(Mutex::new(vault));

    let (mode_tx, _) = tokio::sync::broadcast::channel(64);
    let core = Arc::new(Core {
        vault,
        config: config.clone(),
        registry,
        rv: rv.clone(),
        outbox: outbox.clone(),
        kx: kx.clone(),
        gc,
        delivery: delivery.clone(),
        bus: bus.clone(),
        session: RwLock::new(None),
        mode: RwLock::new(CoreMode::Starting),
        mode_tx,
    });

    let (inbound_tx, inbound_rx) = mpsc::channel(256);
    let session = Session::new(
        SessionConfig {
            server_addr: config.server.clone(),
            tls_server_name: host_only(&config.server),
            max_inflight: 256,
            keepalive_interval: Duration::from_millis(config.keepalive_interval_ms),
            reconnect_base: Duration::from_millis(250),
            reconnect_cap: Duration::from_secs(30),
        },
        inbound_tx,
    );
    let hooks = Arc::new(CoreReconnectHooks {
        rv: rv.clone(),
        outbox: outbox.clone(),
    });
    let (session_handle, session_join) = session.spawn(hooks, shutdown.clone());
    *core.session.write() = Some(session_handle);
    core.set_mode(CoreMode::Running);

    let mut handles = vec![session_join];
    handles.push(spawn_inbound_dispatcher(core.clone(), inbound_rx, shutdown.clone()));
    handles.push(spawn_connectivity_watcher(core.clone(), shutdown.clone()));
    handles.push(spawn_retry_scheduler(core.clone(), shutdown.clone()));
    handles.push(spawn_kx_sweeper(core.clone(), shutdown.clone()));
    handles.push(spawn_desync_responder(core.clone(), shutdown.clone()));

    Ok((core, RunningTasks { handles }))
}

fn host_only(server_addr: &str) -> String {
    server_addr.split(':').next().unwrap_or(server_addr).to_string()
}

/// Dispatcher task (§5): every inbound relay frame is routed through the RV
/// manager, which looks up and invokes the right handler (KX, PM, GCM...).
fn spawn_inbound_dispatcher(
    core: Arc<Core>,
    mut inbound_rx: mpsc::Receiver<ServerFrame>,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                frame = inbound_rx.recv() => {
                    let Some(frame) = frame else { return };
                    match frame {
                        ServerFrame::PushPayload { rv, payload, .. } => {
                            if let Err(e) = core.rv.dispatch(RvTag(rv), payload) {
                                warn!(error = %e, "rv dispatch failed");
                            }
                        }
                        ServerFrame::InvoiceRequest { .. } => {
                            // Payment confirmation policy is applied by the
                            // component that registered the paid subscription.
                        }
                        ServerFrame::Error { code, text } => {
                            warn!(code, text = %text, "relay server reported an error");
                        }
                        ServerFrame::Pong => {}
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() { return; }
                }
            }
        }
    })
}

/// Watches the session's connection state and flips the orchestrator's
/// `CoreMode` between `Running`/`Degraded`, publishing a `Connectivity`
/// event on the notification bus either way.
fn spawn_connectivity_watcher(
    core: Arc<Core>,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut last_connected = true;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(2)) => {
                    let connected = core
                        .session
                        .read()
                        .as_ref()
                        .map(|s| s.is_connected())
                        .unwrap_or(false);
                    if connected != last_connected {
                        last_connected = connected;
                        core.set_mode(if connected { CoreMode::Running } else { CoreMode::Degraded });
                        core.bus.publish(CoreEvent::Connectivity { connected });
                        info!(connected, "relay connectivity changed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() { return; }
                }
            }
        }
    })
}

/// Retry scheduler (§4.E, §5): for every peer lane with a pending entry,
/// attempt to push it; on retriable failure, re-enqueue after the entry's
/// backoff delay elapses.
fn spawn_retry_scheduler(core: Arc<Core>, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(500)) => {
                    let Some(session) = core.session.read().clone() else { continue };
                    if !session.is_connected() {
                        continue;
                    }
                    for target in core.outbox.all_targets() {
                        let Some(entry) = core.outbox.peek_front(&target) else { continue };
                        if let Err(e) = core.outbox.mark_sending(&target, entry.seq) {
                            warn!(error = %e, "failed to mark outbox entry sending");
                            continue;
                        }
                        let result = session
                            .submit(ClientFrame::Push {
                                rv: entry.rv.0,
                                payload: entry.rm_bytes.clone(),
                                payment: entry.payment_hint.clone(),
                            })
                            .await;
                        match result {
                            Ok(()) => {
                                // Acked once the server's delivery confirmation
                                // arrives on a dedicated RV; here we optimistically
                                // clear on successful push since the relay wire
                                // protocol has no separate push-ack frame.
                                let _ = core.outbox.mark_acked(&target, entry.seq);
                            }
                            Err(e) => {
                                warn!(error = %e, peer = %hex::encode(target), "outbox push failed, will retry");
                                let _ = core.outbox.mark_failed_retriable(&target, entry.seq);
                                core.bus.publish(CoreEvent::OutboxFailed {
                                    peer: target,
                                    reason: e.to_string(),
                                });
                            }
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() { return; }
                }
            }
        }
    })
}

/// KX timeout sweeper (§4.F): periodically evicts expired attempts and tears
/// down their pending one-shot RV subscriptions.
fn spawn_kx_sweeper(core: Arc<Core>, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(10)) => {
                    for tag in core.kx.sweep_timeouts() {
                        core.rv.unregister(tag);
                        core.bus.publish(CoreEvent::KxTimedOut { peer: tag.0 });
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() { return; }
                }
            }
        }
    })
}

/// Ratchet desync responder (§7, §8 scenario 5: "a peer observes a decrypt
/// failure it attributes to desync and initiates a reset KX"). Subscribes to
/// `RatchetDesync` on the bus and proposes a fresh ratchet with the affected
/// peer over its still-live send chain, rather than waiting on the peer to
/// notice from their side too.
fn spawn_desync_responder(core: Arc<Core>, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
    let (sub, mut events) = core.bus.subscribe_async(32);
    tokio::spawn(async move {
        // Holding `sub` for the task's lifetime keeps the bus subscription
        // alive; it is dropped (and torn down) only when this task exits.
        let _sub = sub;
        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else { return };
                    if let CoreEvent::RatchetDesync { peer } = event {
                        initiate_ratchet_reset(&core, peer);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() { return; }
                }
            }
        }
    })
}

/// Propose our half of a reset: seal a `KxStep` over the peer's current send
/// chain (still valid even if their *receive* chain desynced against us) and
/// arm a one-shot handler for the peer's unsealed ephemeral-key reply.
fn initiate_ratchet_reset(core: &Arc<Core>, peer: UserId) {
    let Some(record) = core.registry.get(&peer) else { return };
    let (our_ephemeral_pub, reply_rv) = core.kx.begin_reset();

    let core_for_reply = core.clone();
    let armed = core.rv.register(reply_rv, HandlerKind::OneShot, false, move |_tag, payload| {
        let Ok(their_ephemeral_pub) = <[u8; 32]>::try_from(payload.as_slice()) else {
            warn!("ratchet reset reply was not a 32-byte key");
            return;
        };
        let Some(our_secret) = core_for_reply.kx.take_reset_secret(reply_rv) else { return };
        let Some(record) = core_for_reply.registry.get(&peer) else { return };
        let new_ratchet = core_for_reply.kx.finish_reset(true, our_secret, their_ephemeral_pub);
        {
            let mut vault = core_for_reply.vault.lock();
            if let Err(e) = core_for_reply.registry.persist_ratchet(&mut vault, &peer, &new_ratchet) {
                warn!(error = %e, "failed to persist reset ratchet");
            }
        }
        *record.ratchet.lock() = new_ratchet;
        core_for_reply.bus.publish(CoreEvent::KxCompleted { peer });
    });
    if let Err(e) = armed {
        warn!(error = %e, peer = %hex::encode(peer), "failed to arm ratchet reset reply handler");
        return;
    }

    let sender = match core.vault.lock().user_id() {
        Ok(id) => id,
        Err(e) => {
            warn!(error = %e, "failed to read local user id for ratchet reset");
            return;
        }
    };
    let plaintext = encode(
        sender,
        RoutedMessage::KxStep {
            ephemeral_pub: our_ephemeral_pub,
            reply_rv: reply_rv.0,
        },
    );
    let sealed = {
        let mut ratchet = record.ratchet.lock();
        let sent = match ratchet.next_tag_send() {
            Ok((tag, header, key)) => Some((tag, seal(&header, &key, &plaintext))),
            Err(e) => {
                warn!(error = %e, "failed to seal ratchet reset proposal");
                None
            }
        };
        if sent.is_some() {
            let mut vault = core.vault.lock();
            let _ = core.registry.persist_ratchet(&mut vault, &peer, &ratchet);
        }
        sent
    };
    if let Some((tag, sealed)) = sealed {
        if let Err(e) = core.outbox.enqueue(peer, tag, sealed, 0, None) {
            warn!(error = %e, "failed to enqueue ratchet reset proposal");
        }
    }
}

/// Emit a stream event and push it to the delivery hub (§4.H step 1-3),
/// returning the assigned sequence ID. Shared helper used by the IPC
/// handler's RPC implementations.
pub fn emit_stream_event(delivery: &DeliveryHub, kind: StreamKind, payload: serde_json::Value) -> Result<u64> {
    let record = delivery
        .stream(kind)
        .emit(payload)
        .map_err(|e| anyhow!(e.to_string()))?;
    Ok(record.sequence_id)
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
