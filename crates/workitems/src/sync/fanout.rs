//! Fan-out coordinator
//!
//! One job per (provider, account, fetch capability), run in parallel on
//! the rayon pool. Failures are isolated per job: the report carries the
//! records every successful job produced plus one error per failed job.

use log::{debug, error, info, warn};
use rayon::prelude::*;
use std::collections::HashSet;
use std::time::Instant;

use super::threads::{sync_threads, ThreadSyncOptions};
use super::{ignore_not_found, CancelToken};
use crate::error::{SyncError, SyncResult};
use crate::models::{AccountId, CanonicalRecord, RecordKey, SourceId, UserId};
use crate::providers::{
    Capability, CredentialStore, FetchedItem, LinkedAccount, ProviderContext, ProviderRegistry,
};
use crate::reconcile::{RecordFilter, Reconciler};

/// A failed (provider, account, capability) job
#[derive(Debug)]
pub struct SourceError {
    pub source_id: SourceId,
    pub account_id: AccountId,
    pub capability: Capability,
    pub error: SyncError,
    /// Expected failures (re-link needed, cancelled) that should not be
    /// escalated
    pub suppress_escalation: bool,
}

/// Aggregate result of [`FanOut::sync_all`]
#[derive(Debug, Default)]
pub struct SyncReport {
    pub records: Vec<CanonicalRecord>,
    pub errors: Vec<SourceError>,
}

impl SyncReport {
    /// Some jobs failed while others produced records
    pub fn is_partial(&self) -> bool {
        !self.errors.is_empty() && !self.records.is_empty()
    }

    /// Errors worth surfacing to an operator
    pub fn escalations(&self) -> impl Iterator<Item = &SourceError> {
        self.errors.iter().filter(|e| !e.suppress_escalation)
    }

    /// Records in display order: manual position first, then provider
    /// creation time
    pub fn sorted_for_display(&self) -> Vec<&CanonicalRecord> {
        let mut records: Vec<&CanonicalRecord> = self.records.iter().collect();
        records.sort_by(|a, b| {
            a.ordering_key
                .cmp(&b.ordering_key)
                .then_with(|| a.created_at_external.cmp(&b.created_at_external))
        });
        records
    }
}

struct Job<'a> {
    account: &'a LinkedAccount,
    capability: Capability,
}

/// Runs every fetch a user's linked accounts support
pub struct FanOut<'a> {
    reconciler: &'a Reconciler,
    registry: &'a ProviderRegistry,
    credentials: &'a dyn CredentialStore,
    thread_options: &'a ThreadSyncOptions,
}

impl<'a> FanOut<'a> {
    pub fn new(
        reconciler: &'a Reconciler,
        registry: &'a ProviderRegistry,
        credentials: &'a dyn CredentialStore,
        thread_options: &'a ThreadSyncOptions,
    ) -> Self {
        Self {
            reconciler,
            registry,
            credentials,
            thread_options,
        }
    }

    /// Fetch and reconcile everything for `user_id`
    ///
    /// Only fails if the user's linked accounts cannot be read; per-job
    /// failures land in [`SyncReport::errors`].
    pub fn sync_all(&self, user_id: &UserId, cancel: &CancelToken) -> SyncResult<SyncReport> {
        let start = Instant::now();
        let accounts = self.credentials.linked_accounts(user_id)?;

        let mut jobs = Vec::new();
        for account in &accounts {
            if self.registry.get(&account.source_id).is_none() {
                warn!(
                    "[FANOUT] No provider registered for {} (account {})",
                    account.source_id, account.account_id
                );
                continue;
            }
            jobs.extend(
                self.registry
                    .capabilities(&account.source_id)
                    .fetches()
                    .map(|capability| Job { account, capability }),
            );
        }
        info!(
            "[FANOUT] Starting {} jobs across {} accounts for {}",
            jobs.len(),
            accounts.len(),
            user_id
        );

        let results: Vec<_> = jobs
            .par_iter()
            .map(|job| (job, self.run_job(user_id, job, cancel)))
            .collect();

        let mut report = SyncReport::default();
        for (job, result) in results {
            match result {
                Ok(records) => report.records.extend(records),
                Err(err) => report.errors.push(self.source_error(user_id, job, err)),
            }
        }

        info!(
            "[FANOUT] Sync for {} finished in {}ms: {} records, {} failed jobs",
            user_id,
            start.elapsed().as_millis(),
            report.records.len(),
            report.errors.len()
        );
        Ok(report)
    }

    fn run_job(&self, user_id: &UserId, job: &Job<'_>, cancel: &CancelToken) -> SyncResult<Vec<CanonicalRecord>> {
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        let account = job.account;
        let token = self
            .credentials
            .access_token(user_id, &account.source_id, &account.account_id)?;
        let ctx = ProviderContext {
            user_id: user_id.clone(),
            account_id: account.account_id.clone(),
            token,
            site: account.site.clone(),
            cancel: cancel.child(),
        };
        debug!(
            "[FANOUT] Running {} for {} {}",
            job.capability, account.source_id, account.account_id
        );

        match job.capability {
            Capability::FetchEmails => {
                let source = self.registry.thread_source(&account.source_id)?;
                let output = sync_threads(
                    self.reconciler,
                    source,
                    &account.source_id,
                    &ctx,
                    self.thread_options,
                )?;
                Ok(output.threads)
            }
            capability => {
                let items = self.registry.fetch(&account.source_id, capability, &ctx)?;
                self.reconcile_items(&ctx, &account.source_id, capability, items)
            }
        }
    }

    /// Merge fetched items; an item that fails an integrity check is
    /// dropped without failing the job
    fn reconcile_items(
        &self,
        ctx: &ProviderContext,
        source_id: &SourceId,
        capability: Capability,
        items: Vec<FetchedItem>,
    ) -> SyncResult<Vec<CanonicalRecord>> {
        let mut records = Vec::with_capacity(items.len());
        let mut seen = HashSet::new();

        for item in items {
            let key = RecordKey::new(ctx.user_id.clone(), item.external_id.clone(), source_id.clone());
            if item.removed {
                ignore_not_found(self.reconciler.soft_delete(&key))?;
                continue;
            }
            seen.insert(item.external_id.clone());

            let filters = [RecordFilter::Kind(item.kind())];
            match self
                .reconciler
                .reconcile(&key, Some(&item.new), &item.update, &filters)
            {
                Ok(reconciled) if reconciled.record.is_live() => records.push(reconciled.record),
                Ok(_) => {}
                Err(SyncError::DataIntegrity(msg)) => {
                    error!("[FANOUT] Skipping {}: {}", key, msg);
                }
                Err(e) => return Err(e),
            }
        }

        if capability == Capability::FetchTasks {
            self.reconciler
                .complete_missing(&ctx.user_id, source_id, &ctx.account_id, &seen)?;
        }
        Ok(records)
    }

    fn source_error(&self, user_id: &UserId, job: &Job<'_>, error: SyncError) -> SourceError {
        let account = job.account;
        match &error {
            SyncError::Credential(_) => {
                info!(
                    "[FANOUT] {} account {} needs re-link: {}",
                    account.source_id, account.account_id, error
                );
                self.credentials
                    .mark_bad(user_id, &account.source_id, &account.account_id);
            }
            SyncError::Cancelled => {
                debug!("[FANOUT] {} for {} cancelled", job.capability, account.source_id);
            }
            SyncError::DataIntegrity(_) => {
                error!(
                    "[FANOUT] {} for {} {} failed: {}",
                    job.capability, account.source_id, account.account_id, error
                );
            }
            _ => {
                warn!(
                    "[FANOUT] {} for {} {} failed: {}",
                    job.capability, account.source_id, account.account_id, error
                );
            }
        }
        SourceError {
            source_id: account.source_id.clone(),
            account_id: account.account_id.clone(),
            capability: job.capability,
            suppress_escalation: error.suppresses_escalation(),
            error,
        }
    }
}
