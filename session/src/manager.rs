//! Session manager.
//!
//! Tracks one session task per connected vault. Each task consumes its
//! command queue strictly in arrival order, so no two reconciliation passes
//! for one vault ever interleave; different vaults run concurrently. Events
//! from every task funnel into one receiver handed out at construction.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use drift_engine::{ChangeRecord, VaultId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::command::{SessionCommand, SessionEvent};
use crate::config::Config;
use crate::error::{Result, SessionError};
use crate::gate::UnlockGate;
use crate::session::SyncSession;
use crate::store::LocalStore;

/// Handle to one vault's session task.
struct SessionHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
    /// Set on disconnect so the task drains queued batches without
    /// reconciling them.
    closing: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

/// Registry of active sessions, shared across the application via `Arc`.
pub struct SessionManager {
    sessions: DashMap<VaultId, SessionHandle>,
    store: Arc<dyn LocalStore>,
    gate: Arc<dyn UnlockGate>,
    config: Config,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionManager {
    /// Create a manager and the receiver its session events arrive on.
    pub fn new(
        store: Arc<dyn LocalStore>,
        gate: Arc<dyn UnlockGate>,
        config: Config,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, event_rx) = mpsc::unbounded_channel();
        let manager = Arc::new(Self {
            sessions: DashMap::new(),
            store,
            gate,
            config,
            events,
        });
        (manager, event_rx)
    }

    /// Connect a vault and spawn its session task.
    ///
    /// `outbound` is the already-connected sync channel the session publishes
    /// on. A locked vault is refused here, before anything is spawned.
    pub fn connect(
        &self,
        vault: VaultId,
        outbound: mpsc::UnboundedSender<ChangeRecord>,
        request_id: Option<String>,
    ) -> Result<()> {
        if !self.gate.is_unlockable(&vault) {
            return Err(SessionError::VaultLocked(vault));
        }
        if self.sessions.contains_key(&vault) {
            tracing::debug!(%vault, "session already connected");
            return Ok(());
        }

        let session = SyncSession::new(
            vault.clone(),
            self.store.clone(),
            self.gate.clone(),
            outbound,
            self.config.clone(),
        );
        let (tx, rx) = mpsc::unbounded_channel();
        let closing = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(run_session(
            session,
            rx,
            self.events.clone(),
            closing.clone(),
        ));

        self.sessions.insert(
            vault.clone(),
            SessionHandle {
                commands: tx,
                closing,
                task,
            },
        );
        self.dispatch(&vault, SessionCommand::ConnectSync { request_id })
    }

    /// Queue a command for a vault's session task.
    pub fn dispatch(&self, vault: &VaultId, command: SessionCommand) -> Result<()> {
        let handle = self
            .sessions
            .get(vault)
            .ok_or(SessionError::NotConnected)?;
        handle
            .commands
            .send(command)
            .map_err(|_| SessionError::ChannelClosed)
    }

    /// Disconnect a vault. The in-flight batch finishes; queued batches are
    /// drained and discarded by the task.
    pub fn disconnect(&self, vault: &VaultId, request_id: Option<String>) -> Result<()> {
        let (_, handle) = self
            .sessions
            .remove(vault)
            .ok_or(SessionError::NotConnected)?;
        handle.closing.store(true, Ordering::SeqCst);
        handle
            .commands
            .send(SessionCommand::DisconnectSync { request_id })
            .map_err(|_| SessionError::ChannelClosed)
    }

    /// Disconnect every vault and wait for the tasks to finish.
    pub async fn shutdown(&self) {
        let vaults: Vec<VaultId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        let mut tasks = Vec::new();
        for vault in vaults {
            if let Some((_, handle)) = self.sessions.remove(&vault) {
                handle.closing.store(true, Ordering::SeqCst);
                let _ = handle
                    .commands
                    .send(SessionCommand::DisconnectSync { request_id: None });
                tasks.push(handle.task);
            }
        }
        for task in tasks {
            let _ = task.await;
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_connected(&self, vault: &VaultId) -> bool {
        self.sessions.contains_key(vault)
    }
}

/// One vault's command loop. Commands apply in arrival order; between
/// commands the loop wakes for retry ticks while any table batch is queued.
async fn run_session(
    mut session: SyncSession,
    mut commands: mpsc::UnboundedReceiver<SessionCommand>,
    events: mpsc::UnboundedSender<SessionEvent>,
    closing: Arc<AtomicBool>,
) {
    loop {
        let retry_delay = session.next_retry_delay();
        let command = tokio::select! {
            command = commands.recv() => match command {
                Some(command) => command,
                None => break,
            },
            _ = tokio::time::sleep(retry_delay.unwrap_or_default()), if retry_delay.is_some() => {
                if let Err(error) = session.retry_failed() {
                    let _ = events.send(SessionEvent::error(
                        session.vault().clone(),
                        error.to_string(),
                        None,
                    ));
                }
                continue;
            }
        };

        let request_id = command.request_id().map(str::to_string);
        if closing.load(Ordering::SeqCst)
            && !matches!(command, SessionCommand::DisconnectSync { .. })
        {
            tracing::debug!(vault = %session.vault(), "discarding queued command on disconnect");
            continue;
        }

        match command {
            SessionCommand::ConnectSync { .. } => match session.connect() {
                Ok(()) => {
                    let _ = events.send(SessionEvent::Connected {
                        vault: session.vault().clone(),
                        request_id,
                    });
                }
                Err(error) => {
                    let _ = events.send(SessionEvent::error(
                        session.vault().clone(),
                        error.to_string(),
                        request_id,
                    ));
                }
            },
            SessionCommand::DisconnectSync { .. } => {
                session.disconnect();
                let _ = events.send(SessionEvent::Disconnected {
                    vault: session.vault().clone(),
                    request_id,
                });
                break;
            }
            SessionCommand::AcceptLocalChanges { changes, .. } => {
                report(&events, &mut session, request_id, |s| {
                    s.accept_local_changes(changes)
                });
            }
            SessionCommand::AcceptRemoteChanges { changes, .. } => {
                report(&events, &mut session, request_id, |s| {
                    s.accept_remote_changes(changes)
                });
            }
        }
    }
}

fn report(
    events: &mpsc::UnboundedSender<SessionEvent>,
    session: &mut SyncSession,
    request_id: Option<String>,
    accept: impl FnOnce(&mut SyncSession) -> Result<crate::session::BatchOutcome>,
) {
    match accept(session) {
        Ok(outcome) => {
            let _ = events.send(SessionEvent::ChangesAccepted {
                vault: session.vault().clone(),
                applied: outcome.applied,
                published: outcome.published,
                request_id,
            });
        }
        Err(error) => {
            let _ = events.send(SessionEvent::error(
                session.vault().clone(),
                error.to_string(),
                request_id,
            ));
        }
    }
}
