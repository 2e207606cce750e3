//! Incremental thread sync
//!
//! FULL lists the most recent threads and fetches each one. DELTA pages
//! through the provider's change log from the stored cursor, resolves
//! threads whose messages were all removed without fetching them, and
//! re-fetches the rest. Both paths merge through the reconciler, so a FULL
//! and a DELTA racing on the same thread converge on one record.

use chrono::Duration as ChronoDuration;
use log::{debug, error, info, warn};
use rayon::prelude::*;
use std::collections::{BTreeMap, HashSet};
use std::time::Instant;

use super::{ignore_not_found, RetryPolicy};
use crate::error::{ProviderError, SyncError, SyncResult};
use crate::models::{
    CanonicalRecord, CursorKey, EmailThread, Payload, RecordKey, RecordKind, SourceId, SyncCursor,
};
use crate::providers::{FetchedThread, ProviderContext, ThreadSource, DEFAULT_SECTION};
use crate::reconcile::{store_error, NewRecord, RecordFilter, RecordUpdate, Reconciler};

/// Prefix on message records' external ids
///
/// Providers reuse a thread's first message id as the thread id, so message
/// records live in their own namespace under the same source.
pub const MESSAGE_ID_PREFIX: &str = "msg:";

/// External id of the record holding provider message `message_id`
pub fn message_external_id(message_id: &str) -> String {
    format!("{}{}", MESSAGE_ID_PREFIX, message_id)
}

/// Which path a thread sync took
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    #[default]
    Full,
    Delta,
}

/// Statistics from a thread sync
#[derive(Debug, Default, Clone)]
pub struct ThreadSyncStats {
    pub mode: SyncMode,
    /// Threads fetched from the provider
    pub fetched: usize,
    /// Threads merged into the store
    pub stored: usize,
    /// Threads deleted from the change log alone
    pub deleted: usize,
    /// Threads abandoned after retries (nil placeholders) or aborted on
    /// an integrity error
    pub skipped: usize,
    pub duration_ms: u64,
}

/// Thread records written by a sync, plus its statistics
#[derive(Debug, Default, Clone)]
pub struct ThreadSyncOutput {
    pub threads: Vec<CanonicalRecord>,
    pub stats: ThreadSyncStats,
}

/// Tuning for [`sync_threads`]
#[derive(Debug, Clone)]
pub struct ThreadSyncOptions {
    /// Threads listed by a FULL sync
    pub page_size: usize,
    /// Cursors older than this are not trusted for a DELTA sync
    pub cursor_max_age: ChronoDuration,
    pub retry: RetryPolicy,
}

impl Default for ThreadSyncOptions {
    fn default() -> Self {
        Self {
            page_size: 500,
            cursor_max_age: ChronoDuration::days(7),
            retry: RetryPolicy::default(),
        }
    }
}

/// Sync one (user, account) thread source into the store
///
/// Picks DELTA when a usable cursor is stored and falls back to FULL when
/// the provider reports the cursor expired. The new cursor is saved only
/// after every fetched thread has been merged.
pub fn sync_threads(
    reconciler: &Reconciler,
    source: &dyn ThreadSource,
    source_id: &SourceId,
    ctx: &ProviderContext,
    options: &ThreadSyncOptions,
) -> SyncResult<ThreadSyncOutput> {
    let start = Instant::now();
    let syncer = ThreadSyncer {
        reconciler,
        source,
        source_id,
        ctx,
        options,
    };
    let cursor_key = CursorKey::new(ctx.user_id.clone(), source_id.clone(), ctx.account_id.clone());

    let stored = reconciler
        .store()
        .get_cursor(&cursor_key)
        .map_err(store_error)?;
    let usable = match stored {
        Some(cursor) if cursor.is_usable(options.cursor_max_age) => Some(cursor),
        Some(cursor) => {
            info!(
                "[SYNC] Cursor for {} {} is stale or unset (last sync {}), running full sync",
                source_id, ctx.account_id, cursor.last_sync_at
            );
            None
        }
        None => None,
    };

    let mut output = match usable {
        Some(cursor) => match syncer.delta(cursor) {
            Err(SyncError::CursorExpired) => {
                warn!(
                    "[SYNC] Cursor expired for {} {}, running full sync",
                    source_id, ctx.account_id
                );
                syncer.full(cursor_key)?
            }
            other => other?,
        },
        None => syncer.full(cursor_key)?,
    };

    output.stats.duration_ms = start.elapsed().as_millis() as u64;
    info!(
        "[SYNC] {} {} {:?} sync: fetched={} stored={} deleted={} skipped={} in {}ms",
        source_id,
        ctx.account_id,
        output.stats.mode,
        output.stats.fetched,
        output.stats.stored,
        output.stats.deleted,
        output.stats.skipped,
        output.stats.duration_ms
    );
    Ok(output)
}

struct ThreadSyncer<'a> {
    reconciler: &'a Reconciler,
    source: &'a dyn ThreadSource,
    source_id: &'a SourceId,
    ctx: &'a ProviderContext,
    options: &'a ThreadSyncOptions,
}

impl ThreadSyncer<'_> {
    fn full(&self, cursor_key: CursorKey) -> SyncResult<ThreadSyncOutput> {
        let listing = self
            .source
            .list_recent_threads(self.ctx, self.options.page_size)?;
        debug!(
            "[SYNC] Full sync listed {} threads for {}",
            listing.thread_ids.len(),
            self.ctx.account_id
        );

        let mut output = ThreadSyncOutput::default();
        output.stats.mode = SyncMode::Full;
        self.fetch_and_merge(&listing.thread_ids, &mut output)?;

        self.save_cursor(SyncCursor::new(cursor_key, listing.cursor))?;
        Ok(output)
    }

    fn delta(&self, cursor: SyncCursor) -> SyncResult<ThreadSyncOutput> {
        let mut deltas: BTreeMap<String, i64> = BTreeMap::new();
        let mut next_cursor = cursor.cursor.clone();
        let mut page_token: Option<String> = None;

        loop {
            if self.ctx.cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            let page = self
                .source
                .list_changes(self.ctx, &cursor.cursor, page_token.as_deref())?;
            for change in page.changes {
                *deltas.entry(change.thread_id).or_default() += change.kind.delta();
            }
            if let Some(position) = page.cursor {
                next_cursor = position;
            }
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        let mut output = ThreadSyncOutput::default();
        output.stats.mode = SyncMode::Delta;

        let mut refetch = Vec::new();
        for (thread_id, delta) in deltas {
            let existing = self.live_thread(&thread_id)?;
            let count = existing
                .as_ref()
                .and_then(|r| r.payload.as_thread())
                .map_or(0, EmailThread::message_count) as i64;

            if count + delta <= 0 {
                self.delete_thread(&thread_id, existing.as_ref())?;
                output.stats.deleted += 1;
            } else {
                refetch.push(thread_id);
            }
        }
        debug!(
            "[SYNC] Delta touched {} threads: {} deleted, {} to re-fetch",
            output.stats.deleted + refetch.len(),
            output.stats.deleted,
            refetch.len()
        );

        self.fetch_and_merge(&refetch, &mut output)?;

        self.save_cursor(cursor.updated(next_cursor))?;
        Ok(output)
    }

    /// Fetch threads concurrently and merge the ones that arrived
    ///
    /// A thread that still fails after retries becomes a nil placeholder
    /// and is skipped. A rejected credential or cancellation fails the
    /// whole run instead, since every other fetch would fail the same way.
    fn fetch_and_merge(&self, thread_ids: &[String], output: &mut ThreadSyncOutput) -> SyncResult<()> {
        let fetched = self.fetch_threads(thread_ids)?;

        for thread in fetched {
            let Some(thread) = thread else {
                output.stats.skipped += 1;
                continue;
            };
            output.stats.fetched += 1;
            match self.merge_thread(thread) {
                Ok(record) => {
                    output.stats.stored += 1;
                    output.threads.push(record);
                }
                Err(SyncError::DataIntegrity(msg)) => {
                    error!("[SYNC] Aborting thread merge: {}", msg);
                    output.stats.skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// One concurrent fetch per thread id; `None` marks an abandoned fetch
    fn fetch_threads(&self, thread_ids: &[String]) -> SyncResult<Vec<Option<FetchedThread>>> {
        let results: Vec<_> = thread_ids
            .par_iter()
            .map(|thread_id| {
                self.options
                    .retry
                    .run(&format!("get thread {}", thread_id), &self.ctx.cancel, |_| {
                        self.source.get_thread(self.ctx, thread_id)
                    })
                    .map_err(|e| (thread_id, e))
            })
            .collect();

        let mut threads = Vec::with_capacity(results.len());
        for result in results {
            match result {
                Ok(thread) => threads.push(Some(thread)),
                Err((_, e)) if e.is_bad_credential() => return Err(e.into()),
                Err((_, ProviderError::Cancelled)) => return Err(SyncError::Cancelled),
                Err((thread_id, e)) => {
                    warn!("[SYNC] Giving up on thread {}: {}", thread_id, e);
                    threads.push(None);
                }
            }
        }
        Ok(threads)
    }

    fn thread_key(&self, thread_id: &str) -> RecordKey {
        RecordKey::new(self.ctx.user_id.clone(), thread_id, self.source_id.clone())
    }

    fn message_key(&self, message_id: &str) -> RecordKey {
        RecordKey::new(
            self.ctx.user_id.clone(),
            message_external_id(message_id),
            self.source_id.clone(),
        )
    }

    fn live_thread(&self, thread_id: &str) -> SyncResult<Option<CanonicalRecord>> {
        self.reconciler
            .store()
            .find_one(
                &self.thread_key(thread_id),
                &[RecordFilter::Kind(RecordKind::Thread), RecordFilter::NotDeleted],
            )
            .map_err(store_error)
    }

    /// Soft-delete a thread and its messages; already-gone records are fine
    fn delete_thread(&self, thread_id: &str, existing: Option<&CanonicalRecord>) -> SyncResult<()> {
        ignore_not_found(self.reconciler.soft_delete(&self.thread_key(thread_id)))?;
        if let Some(thread) = existing.and_then(|r| r.payload.as_thread()) {
            for email in &thread.emails {
                ignore_not_found(self.reconciler.soft_delete(&self.message_key(&email.message_id)))?;
            }
        }
        debug!("[SYNC] Deleted thread {} from change log", thread_id);
        Ok(())
    }

    /// Merge a fetched thread and its messages into the store
    ///
    /// Internal ids of messages already stored are carried over so
    /// unchanged messages keep their identity.
    fn merge_thread(&self, fetched: FetchedThread) -> SyncResult<CanonicalRecord> {
        let key = self.thread_key(&fetched.thread_id);
        let stored = self
            .reconciler
            .store()
            .find_one(&key, &[RecordFilter::Kind(RecordKind::Thread)])
            .map_err(store_error)?;
        let previous = stored.as_ref().and_then(|r| r.payload.as_thread());

        let mut emails = fetched.emails;
        if let Some(previous) = previous {
            for email in &mut emails {
                if let Some(id) = previous.internal_id_for(&email.message_id) {
                    email.internal_id = id;
                }
            }
        }
        let thread = EmailThread::new(fetched.thread_id, emails);

        for email in &thread.emails {
            let new = NewRecord::new(
                self.ctx.account_id.clone(),
                email.subject.clone(),
                Payload::Message(email.clone()),
            )
            .with_body(email.body.clone())
            .with_created_at(email.sent_at);
            let update = RecordUpdate {
                title: Some(email.subject.clone()),
                body: Some(email.body.clone()),
                deleted: Some(false),
                payload: Some(Payload::Message(email.clone())),
                ..Default::default()
            };
            self.reconciler.reconcile(
                &self.message_key(&email.message_id),
                Some(&new),
                &update,
                &[RecordFilter::Kind(RecordKind::Message)],
            )?;
        }

        if let Some(previous) = previous {
            let current: HashSet<&str> = thread.emails.iter().map(|e| e.message_id.as_str()).collect();
            for gone in previous
                .emails
                .iter()
                .filter(|e| !current.contains(e.message_id.as_str()))
            {
                ignore_not_found(self.reconciler.soft_delete(&self.message_key(&gone.message_id)))?;
            }
        }

        let title = thread.subject();
        let body = thread.emails.last().map(|e| e.body.clone()).unwrap_or_default();
        let mut new = NewRecord::new(self.ctx.account_id.clone(), title.clone(), Payload::Thread(thread.clone()))
            .with_body(body.clone())
            .with_section(DEFAULT_SECTION);
        if let Some(first) = thread.emails.first() {
            new = new.with_created_at(first.sent_at);
        }
        let update = RecordUpdate {
            title: Some(title),
            body: Some(body),
            deleted: Some(false),
            payload: Some(Payload::Thread(thread)),
            ..Default::default()
        };
        let reconciled = self.reconciler.reconcile(
            &key,
            Some(&new),
            &update,
            &[RecordFilter::Kind(RecordKind::Thread)],
        )?;
        Ok(reconciled.record)
    }

    fn save_cursor(&self, cursor: SyncCursor) -> SyncResult<()> {
        if self.ctx.cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        debug!(
            "[SYNC] Saving cursor {} for {} {}",
            cursor.cursor, self.source_id, self.ctx.account_id
        );
        self.reconciler
            .store()
            .save_cursor(&cursor)
            .map_err(store_error)
    }
}
