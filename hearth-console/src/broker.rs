//! The console session broker.
//!
//! Admission and expiry decisions are made from the in-memory registry
//! under one mutex. The store only receives a best-effort mirror of each
//! session; mirror failures are logged and never change an outcome, except
//! that the reconnect throttle reads recent mirror rows. The mirror row of a
//! new session is written before the registry lock is released, so an end
//! recorded by another task always lands after it.
//!
//! Admissions, rejections, ends and expiries go to the audit sink.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use hearth_core::{
    AuditAction, AuditEvent, AuditSink, EndReason, ResourceKind, SessionId, Store, UserId, VmId,
};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::session::{generate_session_id, ActiveSession, SessionEntry};
use crate::{BrokerConfig, SessionError};

#[derive(Debug, Default)]
struct Registry {
    sessions: HashMap<SessionId, SessionEntry>,
    by_user: HashMap<UserId, Vec<SessionId>>,
}

impl Registry {
    fn insert(&mut self, entry: SessionEntry) {
        let id = entry.info.session_id.clone();
        self.by_user.entry(entry.info.user_id).or_default().push(id.clone());
        self.sessions.insert(id, entry);
    }

    /// Removes a session from both indices and cancels its liveness handle.
    fn remove(&mut self, id: &SessionId) -> Option<SessionEntry> {
        let entry = self.sessions.remove(id)?;
        entry.liveness.cancel();
        if let Some(ids) = self.by_user.get_mut(&entry.info.user_id) {
            ids.retain(|s| s != id);
            if ids.is_empty() {
                self.by_user.remove(&entry.info.user_id);
            }
        }
        Some(entry)
    }

    fn user_entries(&self, user: UserId) -> impl Iterator<Item = &SessionEntry> {
        self.by_user
            .get(&user)
            .into_iter()
            .flatten()
            .filter_map(|id| self.sessions.get(id))
    }
}

/// Issues, tracks and expires console sessions.
///
/// One broker per process, owned by the composition root. Clones share the
/// registry.
#[derive(Clone)]
pub struct SessionBroker {
    registry: Arc<Mutex<Registry>>,
    store: Arc<dyn Store>,
    audit: Arc<dyn AuditSink>,
    config: BrokerConfig,
}

impl SessionBroker {
    #[must_use]
    pub fn new(store: Arc<dyn Store>, audit: Arc<dyn AuditSink>, config: BrokerConfig) -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry::default())),
            store,
            audit,
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Admits a new session for `user` on a VM.
    ///
    /// Only sessions that are neither idle- nor duration-expired count
    /// towards the per-user cap.
    ///
    /// # Errors
    /// - [`SessionError::LimitReached`] if the user is at the cap; nothing
    ///   is registered.
    /// - [`SessionError::IdGeneration`] if no id could be minted.
    pub async fn create_session(
        &self,
        user: UserId,
        vm_id: VmId,
        vm_uuid: Uuid,
        client_ip: &str,
        client_agent: &str,
    ) -> Result<SessionId, SessionError> {
        let admitted = self.admit(user, vm_id, vm_uuid, client_ip, client_agent).await;
        let event = match &admitted {
            Ok(info) => {
                tracing::info!(
                    session_id = %info.session_id,
                    user_id = %user,
                    vm_id = %vm_id,
                    vm_uuid = %vm_uuid,
                    "console session created"
                );
                AuditEvent::success(
                    AuditAction::SessionCreated,
                    ResourceKind::ConsoleSession,
                    &info.session_id,
                )
                .with_detail(format!("vm {vm_id}"))
            }
            Err(e) => AuditEvent::failure(
                AuditAction::SessionCreated,
                ResourceKind::ConsoleSession,
                format!("vm {vm_id}"),
                e,
            ),
        };
        self.audit.record(event.with_actor(user));
        admitted.map(|info| info.session_id)
    }

    /// Checks the cap, registers the session and writes its mirror row, all
    /// under the registry lock.
    async fn admit(
        &self,
        user: UserId,
        vm_id: VmId,
        vm_uuid: Uuid,
        client_ip: &str,
        client_agent: &str,
    ) -> Result<ActiveSession, SessionError> {
        let mut registry = self.registry.lock().await;
        let now = Instant::now();
        let (idle, max) = (self.config.idle_timeout, self.config.max_duration);
        let live = registry
            .user_entries(user)
            .filter(|e| e.expiry(now, idle, max).is_none())
            .count();
        if live >= self.config.max_concurrent {
            tracing::warn!(
                user_id = %user,
                live,
                max = self.config.max_concurrent,
                "console session limit reached"
            );
            return Err(SessionError::LimitReached { max: self.config.max_concurrent });
        }

        let started_at = Utc::now();
        let info = ActiveSession {
            session_id: generate_session_id()?,
            user_id: user,
            vm_id,
            vm_uuid,
            started_at,
            last_activity_at: started_at,
            client_ip: client_ip.to_owned(),
            client_agent: client_agent.to_owned(),
        };
        registry.insert(SessionEntry::new(info.clone()));
        if let Err(e) = self.store.insert_session(info.to_record()).await {
            tracing::error!(
                session_id = %info.session_id,
                error = %e,
                "failed to persist console session"
            );
        }
        Ok(info)
    }

    /// Marks activity on a session, postponing its idle expiry.
    ///
    /// # Errors
    /// [`SessionError::NotFound`] if the session is not live.
    pub async fn update_activity(&self, id: &SessionId) -> Result<(), SessionError> {
        let at = {
            let mut registry = self.registry.lock().await;
            let entry = registry
                .sessions
                .get_mut(id)
                .ok_or_else(|| SessionError::NotFound(id.clone()))?;
            entry.touch();
            entry.info.last_activity_at
        };
        if let Err(e) = self.store.touch_session(id, at).await {
            tracing::warn!(
                session_id = %id,
                error = %e,
                "failed to persist console session activity"
            );
        }
        Ok(())
    }

    /// Ends a session: cancels its liveness handle, forgets it and records
    /// the end in the mirror.
    ///
    /// # Errors
    /// [`SessionError::NotFound`] if the session is not live, including when
    /// it was already ended.
    pub async fn end_session(&self, id: &SessionId, reason: EndReason) -> Result<(), SessionError> {
        let entry = self
            .registry
            .lock()
            .await
            .remove(id)
            .ok_or_else(|| SessionError::NotFound(id.clone()))?;
        self.finish(&entry.info, &reason, AuditAction::SessionEnded).await;
        tracing::info!(
            session_id = %id,
            user_id = %entry.info.user_id,
            %reason,
            "console session ended"
        );
        Ok(())
    }

    /// Ends every live session on a VM, returning how many were ended.
    pub async fn end_sessions_for_vm(&self, vm_id: VmId, reason: EndReason) -> usize {
        let ended: Vec<SessionEntry> = {
            let mut registry = self.registry.lock().await;
            let ids: Vec<SessionId> = registry
                .sessions
                .values()
                .filter(|e| e.info.vm_id == vm_id)
                .map(|e| e.info.session_id.clone())
                .collect();
            ids.iter().filter_map(|id| registry.remove(id)).collect()
        };
        for entry in &ended {
            self.finish(&entry.info, &reason, AuditAction::SessionEnded).await;
            tracing::info!(
                session_id = %entry.info.session_id,
                vm_id = %vm_id,
                %reason,
                "console session ended"
            );
        }
        ended.len()
    }

    /// Rejects a user who started too many sessions within the reconnect
    /// window, counted from the session mirror.
    ///
    /// # Errors
    /// [`SessionError::ReconnectThrottled`] at or above the configured
    /// maximum. A failing mirror query lets the user through.
    pub async fn check_reconnect_limit(&self, user: UserId) -> Result<(), SessionError> {
        let window = self.config.reconnect_window;
        let Ok(lookback) = chrono::Duration::from_std(window) else {
            return Ok(());
        };
        let recent = match self.store.sessions_started_since(user, Utc::now() - lookback).await {
            Ok(rows) => rows.len(),
            Err(e) => {
                tracing::warn!(
                    user_id = %user,
                    error = %e,
                    "reconnect history unavailable, allowing connection"
                );
                return Ok(());
            }
        };
        if recent >= self.config.reconnect_max {
            tracing::warn!(user_id = %user, recent, ?window, "console reconnect throttled");
            return Err(SessionError::ReconnectThrottled { recent, window });
        }
        Ok(())
    }

    /// Throttle check followed by admission, in the order a console
    /// endpoint applies them.
    ///
    /// # Errors
    /// Any error of [`check_reconnect_limit`](Self::check_reconnect_limit)
    /// or [`create_session`](Self::create_session).
    pub async fn open_session(
        &self,
        user: UserId,
        vm_id: VmId,
        vm_uuid: Uuid,
        client_ip: &str,
        client_agent: &str,
    ) -> Result<SessionId, SessionError> {
        self.check_reconnect_limit(user).await?;
        self.create_session(user, vm_id, vm_uuid, client_ip, client_agent).await
    }

    /// Ends every expired session. Returns the ended sessions with the
    /// reason each one expired.
    pub async fn reap_expired(&self) -> Vec<(SessionId, EndReason)> {
        let expired: Vec<(SessionEntry, EndReason)> = {
            let mut registry = self.registry.lock().await;
            let now = Instant::now();
            let due: Vec<(SessionId, EndReason)> = registry
                .sessions
                .iter()
                .filter_map(|(id, e)| {
                    e.expiry(now, self.config.idle_timeout, self.config.max_duration)
                        .map(|reason| (id.clone(), reason))
                })
                .collect();
            due.into_iter()
                .filter_map(|(id, reason)| registry.remove(&id).map(|e| (e, reason)))
                .collect()
        };

        let mut reaped = Vec::with_capacity(expired.len());
        for (entry, reason) in expired {
            tracing::info!(
                session_id = %entry.info.session_id,
                user_id = %entry.info.user_id,
                %reason,
                "console session expired"
            );
            self.finish(&entry.info, &reason, AuditAction::SessionReaped).await;
            reaped.push((entry.info.session_id, reason));
        }
        reaped
    }

    /// Runs [`reap_expired`](Self::reap_expired) every reap interval until
    /// `shutdown` is cancelled.
    #[must_use]
    pub fn spawn_reaper(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let broker = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(broker.config.reap_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => {
                        tracing::debug!("console session reaper stopping");
                        return;
                    }
                    _ = ticker.tick() => {
                        let reaped = broker.reap_expired().await;
                        if !reaped.is_empty() {
                            tracing::info!(count = reaped.len(), "expired console sessions reaped");
                        }
                    }
                }
            }
        })
    }

    /// The live session with `id`.
    pub async fn get_session(&self, id: &SessionId) -> Option<ActiveSession> {
        self.registry.lock().await.sessions.get(id).map(|e| e.info.clone())
    }

    /// Every live session of `user`, in admission order.
    pub async fn get_user_sessions(&self, user: UserId) -> Vec<ActiveSession> {
        self.registry
            .lock()
            .await
            .user_entries(user)
            .map(|e| e.info.clone())
            .collect()
    }

    /// A child of the session's liveness handle. It is cancelled when the
    /// session ends; cancelling it does not end the session.
    pub async fn liveness(&self, id: &SessionId) -> Option<CancellationToken> {
        self.registry.lock().await.sessions.get(id).map(|e| e.liveness.child_token())
    }

    /// Number of live sessions across all users.
    pub async fn active_count(&self) -> usize {
        self.registry.lock().await.sessions.len()
    }

    /// Records the end of a session in the mirror and the audit sink.
    async fn finish(&self, info: &ActiveSession, reason: &EndReason, action: AuditAction) {
        let ended = self.store.end_session(&info.session_id, Utc::now(), reason.as_str()).await;
        if let Err(e) = ended {
            tracing::warn!(
                session_id = %info.session_id,
                error = %e,
                "failed to persist console session end"
            );
        }
        self.audit.record(
            AuditEvent::success(action, ResourceKind::ConsoleSession, &info.session_id)
                .with_actor(info.user_id)
                .with_detail(reason.as_str()),
        );
    }
}
