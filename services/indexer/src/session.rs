//! Per-user indexing session.
//!
//! A session owns its chunk list and drives it through the state machine
//! `Pending -> Planning -> Running -> Validating -> Completed`, with
//! `Failed` reachable from any non-terminal state and `Cancelled` on
//! external stop. The session task is the only writer of chunk state;
//! status reads get a snapshot copy.

use crate::chunk::{self, Chunk, ChunkOutcome, ChunkState};
use crate::config::IndexerConfig;
use crate::deployment::DeploymentFinder;
use crate::error::{IndexerError, Result};
use crate::fetcher::ContractFetcher;
use crate::metrics::Metrics;
use crate::publisher::ProgressPublisher;
use crate::rpc::CallOptions;
use crate::storage::{AnalysisPatch, AnalysisRepository};
use crate::tier::calculate_window;
use crate::validator;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chain_common::ChainId;
use chrono::{DateTime, Utc};
use indexer_common::tier::SubscriptionTier;
use indexer_common::{ProgressEvent, SessionMetrics, SessionState, SessionView};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Minimum interval between progress events to one subscriber.
const PROGRESS_EMIT_INTERVAL: Duration = Duration::from_millis(500);

/// Soft-deadline floor.
const SOFT_DEADLINE_FLOOR: Duration = Duration::from_secs(180);

/// Rough per-wave fetch estimate feeding the soft deadline.
const CHUNK_WAVE_ESTIMATE: Duration = Duration::from_secs(30);

/// Dependencies a session needs to run; one bundle shared by all sessions.
pub struct SessionContext {
    pub config: Arc<IndexerConfig>,
    pub fetcher: Arc<dyn ContractFetcher>,
    pub finder: Arc<DeploymentFinder>,
    pub publisher: Arc<ProgressPublisher>,
    pub repo: Arc<dyn AnalysisRepository>,
}

struct SessionCore {
    state: SessionState,
    progress: u8,
    metrics: SessionMetrics,
    window: Option<indexer_common::BlockWindow>,
    chunks: Vec<Chunk>,
    error: Option<indexer_common::ErrorPayload>,
    updated_at: DateTime<Utc>,
}

pub struct IndexerSession {
    pub id: String,
    pub user_id: String,
    pub contract_address: String,
    pub chain: ChainId,
    pub tier: SubscriptionTier,
    created_at: DateTime<Utc>,
    core: RwLock<SessionCore>,
    cancel: CancellationToken,
}

/// Session-local aggregation state kept out of the shared core.
struct Accumulators {
    accounts: HashSet<String>,
    blocks: HashSet<u64>,
    tx_hashes: HashSet<String>,
    persisted_blocks: u64,
    total_blocks: u64,
    last_progress_emit: Option<Instant>,
}

impl IndexerSession {
    pub fn new(
        id: String,
        user_id: String,
        contract_address: String,
        chain: ChainId,
        tier: SubscriptionTier,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            user_id,
            contract_address: contract_address.to_lowercase(),
            chain,
            tier,
            created_at: Utc::now(),
            core: RwLock::new(SessionCore {
                state: SessionState::Pending,
                progress: 0,
                metrics: SessionMetrics::default(),
                window: None,
                chunks: Vec::new(),
                error: None,
                updated_at: Utc::now(),
            }),
            cancel: CancellationToken::new(),
        })
    }

    pub fn state(&self) -> SessionState {
        self.core.read().state
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// Ask the session to stop. Idempotent.
    pub fn request_cancel(&self) {
        self.cancel.cancel();
    }

    /// Snapshot for the status endpoint.
    pub fn view(&self) -> SessionView {
        let core = self.core.read();
        SessionView {
            session_id: self.id.clone(),
            user_id: self.user_id.clone(),
            contract_address: self.contract_address.clone(),
            chain: self.chain,
            tier: self.tier.name.to_string(),
            state: core.state,
            progress: core.progress,
            metrics: core.metrics.clone(),
            window: core.window,
            error: core.error.clone(),
            created_at: self.created_at,
            updated_at: core.updated_at,
        }
    }

    /// Run the session to a terminal state. Spawned by the manager.
    pub async fn run(self: Arc<Self>, ctx: Arc<SessionContext>) {
        Metrics::session_started();
        let result = self.drive(&ctx).await;

        // Stop any straggling chunk work before reporting the outcome.
        self.cancel.cancel();

        match result {
            Ok(()) => {
                let metrics = self.core.read().metrics.clone();
                info!("session {} completed ({} logs)", self.id, metrics.log_count);
                Metrics::session_completed();
                ctx.publisher.publish(ProgressEvent::Progress {
                    session_id: self.id.clone(),
                    progress: 100,
                    metrics: metrics.clone(),
                    ts: Utc::now(),
                });
                ctx.publisher.publish(ProgressEvent::SessionCompleted {
                    session_id: self.id.clone(),
                    metrics,
                    ts: Utc::now(),
                });
            }
            Err(IndexerError::Cancelled) => {
                info!("session {} cancelled", self.id);
                self.transition(SessionState::Cancelled);
                // Partial results are discarded on cancel.
                let patch = AnalysisPatch {
                    state: Some(SessionState::Cancelled),
                    progress: Some(0),
                    metrics: Some(SessionMetrics::default()),
                    ..Default::default()
                };
                if let Err(e) = ctx.repo.update(&self.id, patch).await {
                    warn!("failed to record cancellation of {}: {}", self.id, e);
                }
                ctx.publisher.publish(ProgressEvent::SessionCancelled {
                    session_id: self.id.clone(),
                    ts: Utc::now(),
                });
            }
            Err(err) => {
                warn!("session {} failed: {}", self.id, err);
                Metrics::session_failed();
                let payload = err.to_payload();
                {
                    let mut core = self.core.write();
                    core.state = SessionState::Failed;
                    core.error = Some(payload.clone());
                    core.updated_at = Utc::now();
                }
                let patch = AnalysisPatch {
                    state: Some(SessionState::Failed),
                    error: Some(Some(payload.clone())),
                    ..Default::default()
                };
                if let Err(e) = ctx.repo.update(&self.id, patch).await {
                    warn!("failed to record failure of {}: {}", self.id, e);
                }
                ctx.publisher.publish(ProgressEvent::SessionFailed {
                    session_id: self.id.clone(),
                    error: payload,
                    ts: Utc::now(),
                });
            }
        }
    }

    async fn drive(&self, ctx: &SessionContext) -> Result<()> {
        let opts = CallOptions::with_cancel(self.cancel.child_token());

        self.transition(SessionState::Planning);
        ctx.repo
            .update(
                &self.id,
                AnalysisPatch {
                    state: Some(SessionState::Planning),
                    ..Default::default()
                },
            )
            .await?;

        let head = ctx.fetcher.get_head(self.chain, &opts).await?;
        let deployment = ctx
            .finder
            .find_deployment_block(self.chain, &self.contract_address, head, &opts)
            .await?;
        let window = calculate_window(self.chain, head, &self.tier, deployment);
        let chunks = chunk::plan(&window, ctx.config.chunk_size_blocks);
        info!(
            "session {} covering blocks {}..{} on {} in {} chunks",
            self.id,
            window.start_block,
            window.end_block,
            self.chain,
            chunks.len()
        );

        {
            let mut core = self.core.write();
            core.window = Some(window);
            core.chunks = chunks;
            core.state = SessionState::Running;
            core.updated_at = Utc::now();
        }
        ctx.repo
            .update(
                &self.id,
                AnalysisPatch {
                    state: Some(SessionState::Running),
                    window: Some(window),
                    ..Default::default()
                },
            )
            .await?;

        self.run_chunks(ctx, &opts).await?;

        self.transition(SessionState::Validating);
        ctx.repo
            .update(
                &self.id,
                AnalysisPatch {
                    state: Some(SessionState::Validating),
                    ..Default::default()
                },
            )
            .await?;

        {
            let core = self.core.read();
            let verdict = validator::validate(&window, &core.chunks);
            if let Some(err) = verdict.into_error() {
                return Err(err);
            }
        }

        // Final flush must land before the session is declared complete.
        let metrics = self.core.read().metrics.clone();
        ctx.repo
            .update(
                &self.id,
                AnalysisPatch {
                    state: Some(SessionState::Completed),
                    progress: Some(100),
                    metrics: Some(metrics),
                    error: Some(None),
                    ..Default::default()
                },
            )
            .await?;

        {
            let mut core = self.core.write();
            core.state = SessionState::Completed;
            core.progress = 100;
            core.updated_at = Utc::now();
        }
        Ok(())
    }

    /// Chunk scheduler: up to the tier's chunk concurrency in flight,
    /// transient failures re-queued with backoff, deadline and cancellation
    /// checked at every suspension.
    async fn run_chunks(&self, ctx: &SessionContext, opts: &CallOptions) -> Result<()> {
        let (total_chunks, total_blocks) = {
            let core = self.core.read();
            let window = core.window.expect("window set before run_chunks");
            (core.chunks.len(), window.total_blocks)
        };

        let hard_deadline = ctx
            .config
            .session_hard_deadline
            .unwrap_or_else(|| self.tier.hard_deadline());
        let concurrency = self.tier.chunk_concurrency();
        let soft_deadline = estimate_runtime(total_chunks, concurrency)
            .saturating_mul(3)
            .max(SOFT_DEADLINE_FLOOR);

        let started = Instant::now();
        let hard_at = started + hard_deadline;
        let soft_at = started + soft_deadline;
        let mut slow_emitted = false;

        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut join_set: JoinSet<(usize, Result<ChunkOutcome>)> = JoinSet::new();
        let mut ready: VecDeque<usize> = (0..total_chunks).collect();
        let mut delayed: Vec<(Instant, usize)> = Vec::new();
        let mut backoffs: HashMap<usize, ExponentialBackoff> = HashMap::new();
        let mut done = 0usize;

        let mut acc = Accumulators {
            accounts: HashSet::new(),
            blocks: HashSet::new(),
            tx_hashes: HashSet::new(),
            persisted_blocks: 0,
            total_blocks,
            last_progress_emit: None,
        };

        while done < total_chunks {
            let now = Instant::now();
            if now >= hard_at {
                return Err(IndexerError::Timeout);
            }

            // Promote chunks whose backoff has elapsed.
            delayed.retain(|&(at, idx)| {
                if at <= now {
                    ready.push_back(idx);
                    false
                } else {
                    true
                }
            });

            // Dispatch while permits are free.
            while let Some(&idx) = ready.front() {
                let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                    break;
                };
                ready.pop_front();

                let (from_block, to_block) = {
                    let mut core = self.core.write();
                    let chunk = &mut core.chunks[idx];
                    chunk.state = ChunkState::InFlight;
                    chunk.started_at = Some(Utc::now());
                    (chunk.from_block, chunk.to_block)
                };

                let fetcher = ctx.fetcher.clone();
                let address = self.contract_address.clone();
                let chain = self.chain;
                let floor = ctx.config.chunk_floor_blocks;
                let task_opts = opts.clone();
                join_set.spawn(async move {
                    let _permit = permit;
                    let result = chunk::execute(
                        fetcher.as_ref(),
                        chain,
                        &address,
                        from_block,
                        to_block,
                        floor,
                        &task_opts,
                    )
                    .await;
                    (idx, result)
                });
            }

            let requeue_at = delayed.iter().map(|&(at, _)| at).min().unwrap_or(hard_at);

            tokio::select! {
                _ = self.cancel.cancelled() => return Err(IndexerError::Cancelled),
                _ = tokio::time::sleep_until(hard_at) => return Err(IndexerError::Timeout),
                _ = tokio::time::sleep_until(soft_at), if !slow_emitted => {
                    slow_emitted = true;
                    warn!(
                        "session {} exceeded its soft deadline ({:?})",
                        self.id, soft_deadline
                    );
                    ctx.publisher.publish(ProgressEvent::Slow {
                        session_id: self.id.clone(),
                        elapsed_secs: started.elapsed().as_secs(),
                        ts: Utc::now(),
                    });
                }
                _ = tokio::time::sleep_until(requeue_at), if !delayed.is_empty() => {}
                joined = join_set.join_next(), if !join_set.is_empty() => {
                    match joined {
                        Some(Ok((idx, Ok(outcome)))) => {
                            self.handle_chunk_success(ctx, idx, outcome, &mut acc).await?;
                            done += 1;
                        }
                        Some(Ok((idx, Err(err)))) => {
                            if let Some(delay) =
                                self.handle_chunk_failure(ctx, idx, err, &mut backoffs)?
                            {
                                delayed.push((Instant::now() + delay, idx));
                            }
                        }
                        Some(Err(join_err)) => {
                            return Err(IndexerError::TransientRpc(format!(
                                "chunk task aborted: {}",
                                join_err
                            )));
                        }
                        None => {}
                    }
                }
            }
        }

        Ok(())
    }

    async fn handle_chunk_success(
        &self,
        ctx: &SessionContext,
        idx: usize,
        outcome: ChunkOutcome,
        acc: &mut Accumulators,
    ) -> Result<()> {
        Metrics::chunk_completed();
        acc.accounts.extend(outcome.accounts.iter().cloned());
        acc.blocks.extend(outcome.blocks.iter().copied());
        acc.tx_hashes.extend(outcome.tx_hashes.iter().cloned());

        let (progress, metrics, chunk_blocks, event) = {
            let mut core = self.core.write();
            let chunk = &mut core.chunks[idx];
            chunk.state = ChunkState::Validated;
            chunk.log_count = outcome.log_count;
            chunk.first_log = outcome.first_log;
            chunk.last_log = outcome.last_log;
            chunk.min_log_block = outcome.min_log_block;
            chunk.max_log_block = outcome.max_log_block;
            chunk.completed_at = Some(Utc::now());
            chunk.error = None;
            let chunk_blocks = chunk.blocks();
            let event = ProgressEvent::ChunkCompleted {
                session_id: self.id.clone(),
                chunk_index: idx,
                from_block: chunk.from_block,
                to_block: chunk.to_block,
                log_count: outcome.log_count,
                ts: Utc::now(),
            };

            core.metrics.log_count += outcome.log_count;
            core.metrics.bytes_in += outcome.bytes_in;
            // One failed parent call per split plus one call per leaf.
            core.metrics.rpc_calls += 2 * u64::from(outcome.splits) + 1;
            core.metrics.tx_count = acc.tx_hashes.len() as u64;
            core.metrics.unique_accounts = acc.accounts.len() as u64;
            core.metrics.unique_blocks = acc.blocks.len() as u64;

            let persisted = acc.persisted_blocks + chunk_blocks;
            let progress = ((persisted.saturating_mul(100)) / acc.total_blocks.max(1)) as u8;
            core.updated_at = Utc::now();
            (progress, core.metrics.clone(), chunk_blocks, event)
        };

        // Persist before the chunk counts toward progress.
        ctx.repo
            .update(
                &self.id,
                AnalysisPatch {
                    progress: Some(progress),
                    metrics: Some(metrics.clone()),
                    ..Default::default()
                },
            )
            .await?;

        {
            let mut core = self.core.write();
            core.chunks[idx].state = ChunkState::Persisted;
            core.progress = progress;
        }
        acc.persisted_blocks += chunk_blocks;
        debug!(
            "session {} chunk {} persisted, progress {}%",
            self.id, idx, progress
        );

        ctx.publisher.publish(event);
        let throttled = acc
            .last_progress_emit
            .map(|at| at.elapsed() < PROGRESS_EMIT_INTERVAL)
            .unwrap_or(false);
        if !throttled {
            acc.last_progress_emit = Some(Instant::now());
            ctx.publisher.publish(ProgressEvent::Progress {
                session_id: self.id.clone(),
                progress,
                metrics,
                ts: Utc::now(),
            });
        }
        Ok(())
    }

    /// Returns the re-queue delay for a retryable failure, or the fatal
    /// error when the chunk is out of attempts or the error is permanent.
    fn handle_chunk_failure(
        &self,
        ctx: &SessionContext,
        idx: usize,
        err: IndexerError,
        backoffs: &mut HashMap<usize, ExponentialBackoff>,
    ) -> Result<Option<Duration>> {
        if err == IndexerError::Cancelled {
            return Err(err);
        }

        let payload = err.to_payload();
        let (attempts, fatal) = {
            let mut core = self.core.write();
            let chunk = &mut core.chunks[idx];
            chunk.attempts += 1;
            chunk.error = Some(payload.clone());
            let fatal = !err.is_retryable() || chunk.attempts >= ctx.config.max_chunk_attempts;
            chunk.state = if !err.is_retryable() {
                ChunkState::Failed
            } else if fatal {
                ChunkState::Abandoned
            } else {
                ChunkState::Pending
            };
            let attempts = chunk.attempts;
            if fatal {
                core.metrics.rpc_failures += 1;
            } else {
                core.metrics.retries += 1;
                core.metrics.rpc_failures += 1;
            }
            core.updated_at = Utc::now();
            (attempts, fatal)
        };

        ctx.publisher.publish(ProgressEvent::ChunkFailed {
            session_id: self.id.clone(),
            chunk_index: idx,
            error: payload,
            ts: Utc::now(),
        });
        if let IndexerError::NoHealthyEndpoint(chain) = &err {
            ctx.publisher.publish(ProgressEvent::RpcDegraded {
                session_id: self.id.clone(),
                chain: *chain,
                endpoint: "*".to_string(),
                ts: Utc::now(),
            });
        }

        if fatal {
            warn!(
                "session {} chunk {} gave up after {} attempts: {}",
                self.id, idx, attempts, err
            );
            return Err(err);
        }

        Metrics::chunk_retry();
        let schedule = backoffs.entry(idx).or_insert_with(|| ExponentialBackoff {
            initial_interval: ctx.config.rpc_base_delay,
            max_interval: ctx.config.rpc_max_delay,
            multiplier: 2.0,
            randomization_factor: 0.25,
            max_elapsed_time: None,
            ..Default::default()
        });
        let delay = schedule.next_backoff().unwrap_or(ctx.config.rpc_max_delay);
        debug!(
            "session {} re-queueing chunk {} in {:?} (attempt {})",
            self.id, idx, delay, attempts
        );
        Ok(Some(delay))
    }

    fn transition(&self, state: SessionState) {
        let mut core = self.core.write();
        debug!("session {}: {} -> {}", self.id, core.state, state);
        core.state = state;
        core.updated_at = Utc::now();
    }
}

fn estimate_runtime(chunk_count: usize, concurrency: usize) -> Duration {
    let waves = chunk_count.div_ceil(concurrency.max(1)) as u32;
    CHUNK_WAVE_ESTIMATE.saturating_mul(waves)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{AnalysisRecord, MemoryRepository};
    use crate::testing::MockFetcher;
    use indexer_common::tier;

    fn context(fetcher: Arc<MockFetcher>, config: IndexerConfig) -> Arc<SessionContext> {
        let fetcher: Arc<dyn ContractFetcher> = fetcher;
        Arc::new(SessionContext {
            config: Arc::new(config),
            finder: Arc::new(DeploymentFinder::new(fetcher.clone())),
            fetcher,
            publisher: Arc::new(ProgressPublisher::new()),
            repo: Arc::new(MemoryRepository::new()),
        })
    }

    async fn seed_record(ctx: &SessionContext, session: &IndexerSession) {
        ctx.repo
            .create(AnalysisRecord {
                id: session.id.clone(),
                user_id: session.user_id.clone(),
                contract_address: session.contract_address.clone(),
                chain: session.chain,
                tier: session.tier.name.to_string(),
                state: SessionState::Pending,
                progress: 0,
                metrics: SessionMetrics::default(),
                window: None,
                error: None,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .await
            .unwrap();
    }

    fn session(tier: SubscriptionTier) -> Arc<IndexerSession> {
        IndexerSession::new(
            uuid::Uuid::new_v4().to_string(),
            "u1".to_string(),
            "0xAE".to_string(),
            ChainId::Lisk,
            tier,
        )
    }

    #[tokio::test]
    async fn test_session_completes() {
        let fetcher = Arc::new(
            MockFetcher::new(300_000)
                .with_deployment(0)
                .with_log_density(100),
        );
        let mut config = IndexerConfig::default();
        config.chunk_size_blocks = 100_000;
        let ctx = context(fetcher, config);

        let session = session(tier::FREE);
        seed_record(&ctx, &session).await;
        let mut stream = ctx.publisher.subscribe(&session.id);

        session.clone().run(ctx.clone()).await;

        assert_eq!(session.state(), SessionState::Completed);
        let view = session.view();
        assert_eq!(view.progress, 100);
        // Free tier on lisk: 216,001 blocks, one log per 100 blocks.
        assert_eq!(view.metrics.log_count, 2_161);

        let record = ctx.repo.find_by_id(&session.id).await.unwrap().unwrap();
        assert_eq!(record.state, SessionState::Completed);
        assert_eq!(record.progress, 100);

        // The stream is monotonic and ends with exactly one terminal event.
        let mut last_progress = 0u8;
        let mut terminals = 0;
        while let Some(event) = stream.recv().await {
            if let ProgressEvent::Progress { progress, .. } = &event {
                assert!(*progress >= last_progress);
                last_progress = *progress;
            }
            if event.is_terminal() {
                terminals += 1;
            }
        }
        assert_eq!(terminals, 1);
        assert_eq!(last_progress, 100);
    }

    #[tokio::test]
    async fn test_session_splits_overflowing_chunks() {
        // Mirror of the overflow scenario: overflow above 50k blocks, one
        // log per 10 blocks, 200k-block window.
        let fetcher = Arc::new(
            MockFetcher::new(200_001)
                .with_deployment(2)
                .with_overflow_above(50_000)
                .with_log_density(10),
        );
        let mut config = IndexerConfig::default();
        config.chunk_size_blocks = 200_000;
        let ctx = context(fetcher, config);

        let unlimited = SubscriptionTier {
            historical_days: tier::FROM_DEPLOYMENT,
            ..tier::ENTERPRISE
        };
        let session = session(unlimited);
        seed_record(&ctx, &session).await;
        session.clone().run(ctx.clone()).await;

        assert_eq!(session.state(), SessionState::Completed);
        let metrics = session.view().metrics;
        // 200,000 blocks at one log per 10: exactly 20,000 logs.
        assert_eq!(metrics.log_count, 20_000);
    }

    #[tokio::test]
    async fn test_session_fails_for_missing_contract() {
        let fetcher = Arc::new(MockFetcher::new(10_000));
        let ctx = context(fetcher, IndexerConfig::default());
        let session = session(tier::FREE);
        seed_record(&ctx, &session).await;

        session.clone().run(ctx.clone()).await;

        assert_eq!(session.state(), SessionState::Failed);
        let view = session.view();
        assert_eq!(view.error.as_ref().unwrap().code, "not-a-contract");
        let record = ctx.repo.find_by_id(&session.id).await.unwrap().unwrap();
        assert_eq!(record.state, SessionState::Failed);
    }

    #[tokio::test]
    async fn test_session_retries_transient_chunk_failures() {
        let fetcher = Arc::new(
            MockFetcher::new(50_000)
                .with_deployment(0)
                .with_log_density(1_000)
                .with_transient_failures(2),
        );
        let mut config = IndexerConfig::default();
        config.rpc_base_delay = Duration::from_millis(10);
        config.rpc_max_delay = Duration::from_millis(50);
        let ctx = context(fetcher, config);

        let session = session(tier::FREE);
        seed_record(&ctx, &session).await;
        session.clone().run(ctx.clone()).await;

        assert_eq!(session.state(), SessionState::Completed);
        let metrics = session.view().metrics;
        assert!(metrics.retries >= 1);
        assert!(metrics.rpc_failures >= 1);
    }

    #[tokio::test]
    async fn test_session_abandons_after_attempt_cap() {
        let fetcher = Arc::new(
            MockFetcher::new(50_000)
                .with_deployment(0)
                .with_transient_failures(1_000),
        );
        let mut config = IndexerConfig::default();
        config.rpc_base_delay = Duration::from_millis(5);
        config.rpc_max_delay = Duration::from_millis(10);
        config.max_chunk_attempts = 3;
        let ctx = context(fetcher, config);

        let session = session(tier::FREE);
        seed_record(&ctx, &session).await;
        session.clone().run(ctx.clone()).await;

        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(
            session.view().error.unwrap().code,
            "transient-rpc"
        );
    }

    #[tokio::test]
    async fn test_cancellation_stops_promptly() {
        let fetcher = Arc::new(
            MockFetcher::new(500_000)
                .with_deployment(0)
                .with_log_density(100)
                .with_delay(Duration::from_millis(200)),
        );
        let ctx = context(fetcher.clone(), IndexerConfig::default());
        let session = session(tier::FREE);
        seed_record(&ctx, &session).await;
        let mut stream = ctx.publisher.subscribe(&session.id);

        let handle = tokio::spawn(session.clone().run(ctx.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        session.request_cancel();
        handle.await.unwrap();

        assert_eq!(session.state(), SessionState::Cancelled);
        let calls_at_cancel = fetcher.log_calls() + fetcher.code_calls() + fetcher.head_calls();

        // The terminal event is the last one on the stream.
        let mut last = None;
        while let Some(event) = stream.recv().await {
            last = Some(event);
        }
        assert!(matches!(
            last,
            Some(ProgressEvent::SessionCancelled { .. })
        ));

        // No further RPC activity after cancellation.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            fetcher.log_calls() + fetcher.code_calls() + fetcher.head_calls(),
            calls_at_cancel
        );

        // Partial results were discarded.
        let record = ctx.repo.find_by_id(&session.id).await.unwrap().unwrap();
        assert_eq!(record.state, SessionState::Cancelled);
        assert_eq!(record.progress, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hard_deadline_times_out() {
        let fetcher = Arc::new(
            MockFetcher::new(400_000)
                .with_deployment(0)
                .with_log_density(100)
                .with_delay(Duration::from_secs(7_200)),
        );
        let ctx = context(fetcher, IndexerConfig::default());
        let session = session(tier::FREE);
        seed_record(&ctx, &session).await;

        session.clone().run(ctx.clone()).await;

        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(session.view().error.unwrap().code, "timeout");
    }

    #[test]
    fn test_runtime_estimate() {
        assert_eq!(estimate_runtime(1, 4), Duration::from_secs(30));
        assert_eq!(estimate_runtime(8, 4), Duration::from_secs(60));
        assert_eq!(estimate_runtime(9, 4), Duration::from_secs(90));
    }
}
