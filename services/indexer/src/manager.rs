//! Session registry: start/stop/status, the per-(user, contract)
//! single-session invariant, tier contract limits, and stale recovery.

use crate::error::{IndexerError, Result};
use crate::metrics::Metrics;
use crate::session::{IndexerSession, SessionContext};
use crate::storage::{AnalysisFilter, AnalysisPatch, AnalysisRecord, SubscriptionSource};
use chain_common::ChainId;
use chrono::Utc;
use indexer_common::tier::SubscriptionTier;
use indexer_common::{SessionMetrics, SessionState, SessionView};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

pub struct SessionManager {
    ctx: Arc<SessionContext>,
    subscriptions: Arc<dyn SubscriptionSource>,
    sessions: Mutex<HashMap<String, Arc<IndexerSession>>>,
}

impl SessionManager {
    pub fn new(ctx: Arc<SessionContext>, subscriptions: Arc<dyn SubscriptionSource>) -> Self {
        Self {
            ctx,
            subscriptions,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Start indexing `contract_address` for `user_id`. Returns the new
    /// session id, or `AlreadyRunning` with the existing one.
    pub async fn start(
        &self,
        user_id: &str,
        contract_address: &str,
        chain: ChainId,
    ) -> Result<String> {
        let tier = self.resolve_tier(user_id).await;
        let address = contract_address.to_lowercase();
        if address.is_empty() {
            return Err(IndexerError::InvalidRequest(
                "contract address is required".to_string(),
            ));
        }

        let session = {
            let mut sessions = self.sessions.lock();
            sessions.retain(|_, s| !s.is_terminal());

            if let Some(existing) = sessions
                .values()
                .find(|s| s.user_id == user_id && s.contract_address == address)
            {
                return Err(IndexerError::AlreadyRunning {
                    session_id: existing.id.clone(),
                });
            }

            let active_contracts = sessions
                .values()
                .filter(|s| s.user_id == user_id)
                .count() as u32;
            if active_contracts >= tier.max_contracts {
                return Err(IndexerError::ContractLimit {
                    tier: tier.name.to_string(),
                    max: tier.max_contracts,
                });
            }

            let session = IndexerSession::new(
                Uuid::new_v4().to_string(),
                user_id.to_string(),
                address,
                chain,
                tier,
            );
            sessions.insert(session.id.clone(), session.clone());
            Metrics::update_active_sessions(sessions.len());
            session
        };

        let record = AnalysisRecord {
            id: session.id.clone(),
            user_id: session.user_id.clone(),
            contract_address: session.contract_address.clone(),
            chain,
            tier: tier.name.to_string(),
            state: SessionState::Pending,
            progress: 0,
            metrics: SessionMetrics::default(),
            window: None,
            error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        if let Err(e) = self.ctx.repo.create(record).await {
            self.sessions.lock().remove(&session.id);
            return Err(IndexerError::StorageUnavailable(e.to_string()));
        }

        info!(
            "starting session {} for user {} on {} ({}, tier {})",
            session.id, session.user_id, session.contract_address, chain, tier.name
        );
        tokio::spawn(session.clone().run(self.ctx.clone()));
        Ok(session.id.clone())
    }

    /// Ask a session to stop. Idempotent; succeeds for any known session,
    /// running or already terminal.
    pub async fn stop(&self, session_id: &str) -> Result<()> {
        if let Some(session) = self.sessions.lock().get(session_id) {
            session.request_cancel();
            return Ok(());
        }
        // Terminal sessions fall out of the registry but stay known.
        match self.ctx.repo.find_by_id(session_id).await? {
            Some(_) => Ok(()),
            None => Err(IndexerError::UnknownSession(session_id.to_string())),
        }
    }

    pub async fn status(&self, session_id: &str) -> Result<SessionView> {
        if let Some(session) = self.sessions.lock().get(session_id) {
            return Ok(session.view());
        }
        self.ctx
            .repo
            .find_by_id(session_id)
            .await?
            .map(|r| r.to_view())
            .ok_or_else(|| IndexerError::UnknownSession(session_id.to_string()))
    }

    pub async fn list_by_user(&self, user_id: &str) -> Result<Vec<SessionView>> {
        let mut views: HashMap<String, SessionView> = self
            .ctx
            .repo
            .find_by_user(user_id, AnalysisFilter::default())
            .await?
            .into_iter()
            .map(|r| (r.id.clone(), r.to_view()))
            .collect();

        // Live registry state wins over what storage last saw.
        for session in self.sessions.lock().values() {
            if session.user_id == user_id {
                views.insert(session.id.clone(), session.view());
            }
        }

        let mut views: Vec<SessionView> = views.into_values().collect();
        views.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(views)
    }

    /// Fail sessions a previous process left behind. Runs once at startup,
    /// before any new request is accepted.
    pub async fn recover_stale(&self) -> Result<usize> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.ctx.config.stale_session_after)
                .unwrap_or_else(|_| chrono::Duration::seconds(300));

        let mut recovered = 0;
        for record in self.ctx.repo.list_non_terminal().await? {
            if record.updated_at >= cutoff {
                continue;
            }
            warn!(
                "recovering stale session {} (last update {})",
                record.id, record.updated_at
            );
            let patch = AnalysisPatch {
                state: Some(SessionState::Failed),
                error: Some(Some(IndexerError::Stale.to_payload())),
                ..Default::default()
            };
            if let Err(e) = self.ctx.repo.update(&record.id, patch).await {
                warn!("failed to recover session {}: {}", record.id, e);
                continue;
            }
            recovered += 1;
        }
        if recovered > 0 {
            info!("recovered {} stale sessions", recovered);
        }
        Ok(recovered)
    }

    /// Live session counts per state, for the health snapshot.
    pub fn sessions_by_state(&self) -> HashMap<SessionState, usize> {
        let mut counts = HashMap::new();
        for session in self.sessions.lock().values() {
            *counts.entry(session.state()).or_insert(0) += 1;
        }
        counts
    }

    pub fn active_session_count(&self) -> usize {
        self.sessions
            .lock()
            .values()
            .filter(|s| !s.is_terminal())
            .count()
    }

    async fn resolve_tier(&self, user_id: &str) -> SubscriptionTier {
        match self.subscriptions.resolve(user_id).await {
            Ok(info) => info.tier(),
            Err(e) => {
                warn!(
                    "subscription resolution failed for {}, falling back to free: {}",
                    user_id, e
                );
                indexer_common::tier::FREE
            }
        }
    }
}
