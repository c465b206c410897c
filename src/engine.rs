//! Per-account orchestration: refresh token, sweep each entity type, drain
//! the action queue, then hand the account back for checkpoint write-back.
//!
//! Every stage is its own failure boundary. A failed stage is logged with
//! account and operation context and the account moves on to the next one.
use std::sync::Arc;
use tracing::{debug, error, info, instrument};

use crate::config::SyncSettings;
use crate::crm::{CrmService, OAuthCredentials};
use crate::db::AccountStore;
use crate::error::SyncError;
use crate::model::{Account, EntityType};
use crate::normalize::Normalizer;
use crate::queue::{ActionQueue, QueueStats};
use crate::sink::ActionSink;
use crate::sweep::{SweepReport, Sweeper};
use crate::token::TokenManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    RefreshingToken,
    Sweeping(EntityType),
    Draining,
    Checkpointed,
}

impl Stage {
    pub fn operation(&self) -> &'static str {
        match self {
            Stage::RefreshingToken => "refresh_access_token",
            Stage::Sweeping(EntityType::Contacts) => "sweep_contacts",
            Stage::Sweeping(EntityType::Companies) => "sweep_companies",
            Stage::Sweeping(EntityType::Meetings) => "sweep_meetings",
            Stage::Draining => "drain_queue",
            Stage::Checkpointed => "save_checkpoints",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AccountReport {
    pub account_id: String,
    pub stage: Stage,
    pub sweeps: Vec<SweepReport>,
    pub failed: Vec<Stage>,
    pub queue: QueueStats,
}

impl AccountReport {
    fn new(account_id: &str) -> Self {
        Self {
            account_id: account_id.to_string(),
            stage: Stage::RefreshingToken,
            sweeps: Vec::new(),
            failed: Vec::new(),
            queue: QueueStats::default(),
        }
    }

    fn enter(&mut self, stage: Stage) {
        debug!(account = %self.account_id, operation = stage.operation(), "entering stage");
        self.stage = stage;
    }

    fn fail(&mut self, err: &SyncError) {
        error!(
            account = %self.account_id,
            operation = self.stage.operation(),
            error = ?err,
            "stage failed"
        );
        self.failed.push(self.stage);
    }

    pub fn succeeded(&self, stage: Stage) -> bool {
        !self.failed.contains(&stage)
    }
}

pub struct SyncEngine {
    tokens: Arc<TokenManager>,
    sweeper: Sweeper,
    sink: Arc<dyn ActionSink>,
    flush_threshold: usize,
    queue_capacity: usize,
    persist_checkpoints: bool,
}

impl SyncEngine {
    pub fn new(
        crm: Arc<dyn CrmService>,
        sink: Arc<dyn ActionSink>,
        credentials: OAuthCredentials,
        settings: &SyncSettings,
    ) -> Self {
        let tokens = Arc::new(TokenManager::new(
            crm.clone(),
            credentials,
            settings.refresh_policy(),
        ));
        let sweeper = Sweeper::new(
            crm,
            tokens.clone(),
            Normalizer::new(settings.sentinel_predicate),
            settings.search_policy(),
        )
        .with_paging(settings.page_size, settings.cursor_ceiling);
        Self {
            tokens,
            sweeper,
            sink,
            flush_threshold: settings.flush_threshold,
            queue_capacity: settings.queue_capacity,
            persist_checkpoints: true,
        }
    }

    pub fn with_checkpoint_persistence(mut self, persist: bool) -> Self {
        self.persist_checkpoints = persist;
        self
    }

    /// Processes every stored account in order, then returns.
    #[instrument(skip_all)]
    pub async fn run(&self, store: &dyn AccountStore) -> Result<Vec<AccountReport>, SyncError> {
        info!("start pulling data from CRM");
        let accounts = store.load_accounts().await.map_err(SyncError::Store)?;
        let mut reports = Vec::with_capacity(accounts.len());
        for mut account in accounts {
            let mut report = self.sync_account(&mut account).await;
            if self.persist_checkpoints {
                if let Err(err) = store.save_account(&account).await {
                    report.fail(&SyncError::Store(err));
                }
            }
            reports.push(report);
        }
        info!(accounts = reports.len(), "finished pulling data from CRM");
        Ok(reports)
    }

    #[instrument(skip_all, fields(account = %account.id))]
    pub async fn sync_account(&self, account: &mut Account) -> AccountReport {
        info!("start processing account");
        let prior = account.checkpoints.clone();
        let mut report = AccountReport::new(&account.id);

        report.enter(Stage::RefreshingToken);
        if let Err(err) = self.tokens.refresh(account).await {
            report.fail(&err);
        }

        let queue = ActionQueue::spawn(
            self.sink.clone(),
            self.flush_threshold,
            self.queue_capacity,
        );
        for entity in EntityType::ALL {
            report.enter(Stage::Sweeping(entity));
            match self.sweeper.sweep(account, entity, &queue).await {
                Ok(sweep) => report.sweeps.push(sweep),
                Err(err) => report.fail(&err),
            }
        }

        report.enter(Stage::Draining);
        match queue.drain().await {
            Ok(stats) => report.queue = stats,
            Err(err) => {
                // Actions may not have reached the sink; keep the old checkpoints
                // so the next run picks those records up again.
                report.fail(&err);
                account.checkpoints = prior;
            }
        }

        report.enter(Stage::Checkpointed);
        info!(
            actions = report.queue.received,
            flushed = report.queue.flushed,
            dropped = report.queue.dropped,
            failed_stages = report.failed.len(),
            "finish processing account"
        );
        report
    }
}
