//! Repository and subscription seams.
//!
//! The core writes durable `Analysis` records through these traits and
//! never reads back except on startup recovery. Two implementations ship:
//! an in-memory store for tests and small deployments, and a JSON
//! file-per-record store whose writes go through a temp file and rename so
//! a record is always either the old or the new version.

use crate::error::{IndexerError, Result};
use async_trait::async_trait;
use chain_common::ChainId;
use chrono::{DateTime, Utc};
use indexer_common::{
    BlockWindow, ErrorPayload, SessionMetrics, SessionState, SessionView, TierInfo,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Durable record of one indexing session, keyed by session id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisRecord {
    pub id: String,
    pub user_id: String,
    pub contract_address: String,
    pub chain: ChainId,
    pub tier: String,
    pub state: SessionState,
    pub progress: u8,
    pub metrics: SessionMetrics,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window: Option<BlockWindow>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AnalysisRecord {
    pub fn to_view(&self) -> SessionView {
        SessionView {
            session_id: self.id.clone(),
            user_id: self.user_id.clone(),
            contract_address: self.contract_address.clone(),
            chain: self.chain,
            tier: self.tier.clone(),
            state: self.state,
            progress: self.progress,
            metrics: self.metrics.clone(),
            window: self.window,
            error: self.error.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Partial update applied transactionally to one record.
#[derive(Debug, Clone, Default)]
pub struct AnalysisPatch {
    pub state: Option<SessionState>,
    pub progress: Option<u8>,
    pub metrics: Option<SessionMetrics>,
    pub window: Option<BlockWindow>,
    pub error: Option<Option<ErrorPayload>>,
}

impl AnalysisPatch {
    fn apply(self, record: &mut AnalysisRecord) {
        if let Some(state) = self.state {
            record.state = state;
        }
        if let Some(progress) = self.progress {
            record.progress = progress;
        }
        if let Some(metrics) = self.metrics {
            record.metrics = metrics;
        }
        if let Some(window) = self.window {
            record.window = Some(window);
        }
        if let Some(error) = self.error {
            record.error = error;
        }
        record.updated_at = Utc::now();
    }
}

/// Filter for `find_by_user`.
#[derive(Debug, Clone, Default)]
pub struct AnalysisFilter {
    pub state: Option<SessionState>,
    pub contract_address: Option<String>,
}

impl AnalysisFilter {
    fn matches(&self, record: &AnalysisRecord) -> bool {
        if let Some(state) = self.state {
            if record.state != state {
                return false;
            }
        }
        if let Some(address) = &self.contract_address {
            if !record.contract_address.eq_ignore_ascii_case(address) {
                return false;
            }
        }
        true
    }
}

#[async_trait]
pub trait AnalysisRepository: Send + Sync {
    async fn create(&self, record: AnalysisRecord) -> Result<String>;
    async fn update(&self, id: &str, patch: AnalysisPatch) -> Result<()>;
    async fn find_by_id(&self, id: &str) -> Result<Option<AnalysisRecord>>;
    async fn find_by_user(
        &self,
        user_id: &str,
        filter: AnalysisFilter,
    ) -> Result<Vec<AnalysisRecord>>;
    /// Records whose session has not reached a terminal state. Used only
    /// by startup recovery.
    async fn list_non_terminal(&self) -> Result<Vec<AnalysisRecord>>;
}

/// Minimal user record consumed by onboarding glue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub id: String,
    pub wallet_address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_contract: Option<String>,
}

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<UserRecord>>;
    async fn update_onboarding(&self, id: &str, default_contract: Option<String>) -> Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractRecord {
    pub address: String,
    pub chain: ChainId,
    pub user_id: String,
}

#[async_trait]
pub trait ContractRepository: Send + Sync {
    async fn by_user(&self, user_id: &str) -> Result<Vec<ContractRecord>>;
}

/// Resolves a wallet's subscription. Resolution failures fall back to Free
/// at the call site.
#[async_trait]
pub trait SubscriptionSource: Send + Sync {
    async fn resolve(&self, wallet_address: &str) -> Result<TierInfo>;
}

/// Static subscription table; the default resolver when no on-chain source
/// is wired in.
#[derive(Default)]
pub struct StaticSubscriptions {
    tiers: RwLock<HashMap<String, TierInfo>>,
}

impl StaticSubscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, wallet: &str, info: TierInfo) {
        self.tiers.write().insert(wallet.to_lowercase(), info);
    }
}

#[async_trait]
impl SubscriptionSource for StaticSubscriptions {
    async fn resolve(&self, wallet_address: &str) -> Result<TierInfo> {
        Ok(self
            .tiers
            .read()
            .get(&wallet_address.to_lowercase())
            .cloned()
            .unwrap_or(TierInfo {
                tier_number: 0,
                tier_name: "free".to_string(),
                expires_at: None,
            }))
    }
}

/// In-memory repository.
#[derive(Default)]
pub struct MemoryRepository {
    analyses: RwLock<HashMap<String, AnalysisRecord>>,
    users: RwLock<HashMap<String, UserRecord>>,
    contracts: RwLock<Vec<ContractRecord>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_user(&self, user: UserRecord) {
        self.users.write().insert(user.id.clone(), user);
    }

    pub fn insert_contract(&self, contract: ContractRecord) {
        self.contracts.write().push(contract);
    }
}

#[async_trait]
impl AnalysisRepository for MemoryRepository {
    async fn create(&self, record: AnalysisRecord) -> Result<String> {
        let id = record.id.clone();
        self.analyses.write().insert(id.clone(), record);
        Ok(id)
    }

    async fn update(&self, id: &str, patch: AnalysisPatch) -> Result<()> {
        let mut analyses = self.analyses.write();
        let record = analyses
            .get_mut(id)
            .ok_or_else(|| IndexerError::UnknownSession(id.to_string()))?;
        patch.apply(record);
        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<AnalysisRecord>> {
        Ok(self.analyses.read().get(id).cloned())
    }

    async fn find_by_user(
        &self,
        user_id: &str,
        filter: AnalysisFilter,
    ) -> Result<Vec<AnalysisRecord>> {
        let mut records: Vec<AnalysisRecord> = self
            .analyses
            .read()
            .values()
            .filter(|r| r.user_id == user_id && filter.matches(r))
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    async fn list_non_terminal(&self) -> Result<Vec<AnalysisRecord>> {
        Ok(self
            .analyses
            .read()
            .values()
            .filter(|r| !r.state.is_terminal())
            .cloned()
            .collect())
    }
}

#[async_trait]
impl UserRepository for MemoryRepository {
    async fn get(&self, id: &str) -> Result<Option<UserRecord>> {
        Ok(self.users.read().get(id).cloned())
    }

    async fn update_onboarding(&self, id: &str, default_contract: Option<String>) -> Result<()> {
        let mut users = self.users.write();
        let user = users
            .get_mut(id)
            .ok_or_else(|| IndexerError::InvalidRequest(format!("unknown user {}", id)))?;
        user.default_contract = default_contract;
        Ok(())
    }
}

#[async_trait]
impl ContractRepository for MemoryRepository {
    async fn by_user(&self, user_id: &str) -> Result<Vec<ContractRecord>> {
        Ok(self
            .contracts
            .read()
            .iter()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect())
    }
}

const WRITE_RETRIES: u32 = 3;

/// JSON file-per-record repository rooted at a directory.
pub struct FileRepository {
    dir: PathBuf,
}

impl FileRepository {
    pub async fn open(dir: PathBuf) -> Result<Self> {
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| IndexerError::StorageUnavailable(e.to_string()))?;
        Ok(Self { dir })
    }

    fn path_for(&self, id: &str) -> PathBuf {
        // Session ids are UUIDs; refuse anything that could escape the dir.
        let safe: String = id
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
            .collect();
        self.dir.join(format!("{}.json", safe))
    }

    async fn write_record(&self, record: &AnalysisRecord) -> Result<()> {
        let path = self.path_for(&record.id);
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(record)
            .map_err(|e| IndexerError::StorageUnavailable(e.to_string()))?;

        let mut last_error = None;
        for attempt in 1..=WRITE_RETRIES {
            let result = async {
                tokio::fs::write(&tmp, &body).await?;
                tokio::fs::rename(&tmp, &path).await
            }
            .await;
            match result {
                Ok(()) => {
                    debug!("persisted analysis {} ({} bytes)", record.id, body.len());
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        "write attempt {}/{} for {} failed: {}",
                        attempt, WRITE_RETRIES, record.id, e
                    );
                    last_error = Some(e);
                }
            }
        }
        Err(IndexerError::StorageUnavailable(
            last_error.map(|e| e.to_string()).unwrap_or_default(),
        ))
    }

    async fn read_record(&self, id: &str) -> Result<Option<AnalysisRecord>> {
        match tokio::fs::read(self.path_for(id)).await {
            Ok(body) => serde_json::from_slice(&body)
                .map(Some)
                .map_err(|e| IndexerError::StorageUnavailable(e.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(IndexerError::StorageUnavailable(e.to_string())),
        }
    }

    async fn read_all(&self) -> Result<Vec<AnalysisRecord>> {
        let mut records = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| IndexerError::StorageUnavailable(e.to_string()))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| IndexerError::StorageUnavailable(e.to_string()))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match tokio::fs::read(&path).await {
                Ok(body) => match serde_json::from_slice::<AnalysisRecord>(&body) {
                    Ok(record) => records.push(record),
                    Err(e) => warn!("skipping unreadable record {:?}: {}", path, e),
                },
                Err(e) => warn!("skipping unreadable record {:?}: {}", path, e),
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl AnalysisRepository for FileRepository {
    async fn create(&self, record: AnalysisRecord) -> Result<String> {
        let id = record.id.clone();
        self.write_record(&record).await?;
        Ok(id)
    }

    async fn update(&self, id: &str, patch: AnalysisPatch) -> Result<()> {
        let mut record = self
            .read_record(id)
            .await?
            .ok_or_else(|| IndexerError::UnknownSession(id.to_string()))?;
        patch.apply(&mut record);
        self.write_record(&record).await
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<AnalysisRecord>> {
        self.read_record(id).await
    }

    async fn find_by_user(
        &self,
        user_id: &str,
        filter: AnalysisFilter,
    ) -> Result<Vec<AnalysisRecord>> {
        let mut records: Vec<AnalysisRecord> = self
            .read_all()
            .await?
            .into_iter()
            .filter(|r| r.user_id == user_id && filter.matches(r))
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    async fn list_non_terminal(&self) -> Result<Vec<AnalysisRecord>> {
        Ok(self
            .read_all()
            .await?
            .into_iter()
            .filter(|r| !r.state.is_terminal())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, user: &str, state: SessionState) -> AnalysisRecord {
        AnalysisRecord {
            id: id.to_string(),
            user_id: user.to_string(),
            contract_address: "0xae".to_string(),
            chain: ChainId::Lisk,
            tier: "free".to_string(),
            state,
            progress: 0,
            metrics: SessionMetrics::default(),
            window: None,
            error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_memory_crud() {
        let repo = MemoryRepository::new();
        repo.create(record("s1", "u1", SessionState::Pending))
            .await
            .unwrap();

        repo.update(
            "s1",
            AnalysisPatch {
                state: Some(SessionState::Running),
                progress: Some(40),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let found = repo.find_by_id("s1").await.unwrap().unwrap();
        assert_eq!(found.state, SessionState::Running);
        assert_eq!(found.progress, 40);

        let err = repo
            .update("missing", AnalysisPatch::default())
            .await
            .unwrap_err();
        assert!(matches!(err, IndexerError::UnknownSession(_)));
    }

    #[tokio::test]
    async fn test_memory_filters() {
        let repo = MemoryRepository::new();
        repo.create(record("s1", "u1", SessionState::Completed))
            .await
            .unwrap();
        repo.create(record("s2", "u1", SessionState::Running))
            .await
            .unwrap();
        repo.create(record("s3", "u2", SessionState::Running))
            .await
            .unwrap();

        let running = repo
            .find_by_user(
                "u1",
                AnalysisFilter {
                    state: Some(SessionState::Running),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, "s2");

        let non_terminal = repo.list_non_terminal().await.unwrap();
        assert_eq!(non_terminal.len(), 2);
    }

    #[tokio::test]
    async fn test_file_repository_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let repo = FileRepository::open(dir.path().to_path_buf()).await.unwrap();

        repo.create(record("11111111-2222-3333-4444-555555555555", "u1", SessionState::Pending))
            .await
            .unwrap();
        repo.update(
            "11111111-2222-3333-4444-555555555555",
            AnalysisPatch {
                state: Some(SessionState::Completed),
                progress: Some(100),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let found = repo
            .find_by_id("11111111-2222-3333-4444-555555555555")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.state, SessionState::Completed);
        assert_eq!(found.progress, 100);
        assert!(repo.list_non_terminal().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_repository_path_safety() {
        let dir = tempfile::tempdir().unwrap();
        let repo = FileRepository::open(dir.path().to_path_buf()).await.unwrap();
        let path = repo.path_for("../../etc/passwd");
        assert!(path.starts_with(dir.path()));
    }

    #[tokio::test]
    async fn test_static_subscriptions_fallback() {
        let subs = StaticSubscriptions::new();
        let info = subs.resolve("0xunknown").await.unwrap();
        assert_eq!(info.tier_number, 0);

        subs.set(
            "0xWALLET",
            TierInfo {
                tier_number: 2,
                tier_name: "pro".to_string(),
                expires_at: None,
            },
        );
        let info = subs.resolve("0xwallet").await.unwrap();
        assert_eq!(info.tier_number, 2);
    }

    #[tokio::test]
    async fn test_user_onboarding_update() {
        let repo = MemoryRepository::new();
        repo.insert_user(UserRecord {
            id: "u1".into(),
            wallet_address: "0xw".into(),
            default_contract: None,
        });
        repo.update_onboarding("u1", Some("0xae".into()))
            .await
            .unwrap();
        let user = repo.get("u1").await.unwrap().unwrap();
        assert_eq!(user.default_contract.as_deref(), Some("0xae"));
    }
}
