use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Utc};
use core_model::{
    CalendarSignal, CalendarSource, Classifier, CrmRecord, Field, FieldSet, MessageSource,
    MonitoredAccount, NormalizedMessage, RecordStore, RefineRequest, SheetRow, SyncError,
};
use ingest::{CounterpartBatch, group_by_counterpart};
use schema::{FieldMap, decode_row, encode_new_row, encode_updates};
use tracing::{debug, error, info, warn};

use crate::merge::{self, Decision, MergeInput, MergePolicy, SkipReason};
use crate::presentation::sort_and_highlight;
use crate::resolver::resolve;
use crate::{CycleSummary, SyncContext, SyncSettings};

/// Fields fill-empty tries to complete.
const FILLABLE: [Field; 4] = [
    Field::Name,
    Field::Organization,
    Field::MeetingStatus,
    Field::MeetingDate,
];

#[derive(Debug, Clone)]
pub enum CyclePhase {
    Polling { account_count: usize },
    Grouping { message_count: usize },
    Reconciling { counterpart_count: usize },
    Presenting,
    Done { processed: usize },
}

enum Outcome {
    Added,
    Updated,
    Unchanged,
    Skipped(SkipReason),
}

/// Drives cycles and maintenance runs against one store.
pub struct Reconciler<'a> {
    messages: &'a dyn MessageSource,
    calendar: &'a dyn CalendarSource,
    classifier: &'a dyn Classifier,
    store: &'a mut dyn RecordStore,
    settings: SyncSettings,
    clock: fn() -> DateTime<Utc>,
    on_progress: Option<Box<dyn Fn(CyclePhase) + 'a>>,
}

impl<'a> Reconciler<'a> {
    pub fn new(
        messages: &'a dyn MessageSource,
        calendar: &'a dyn CalendarSource,
        classifier: &'a dyn Classifier,
        store: &'a mut dyn RecordStore,
        settings: SyncSettings,
    ) -> Self {
        Self {
            messages,
            calendar,
            classifier,
            store,
            settings,
            clock: Utc::now,
            on_progress: None,
        }
    }

    pub fn with_clock(mut self, clock: fn() -> DateTime<Utc>) -> Self {
        self.clock = clock;
        self
    }

    pub fn on_progress(mut self, callback: impl Fn(CyclePhase) + 'a) -> Self {
        self.on_progress = Some(Box::new(callback));
        self
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    fn progress(&self, phase: CyclePhase) {
        if let Some(cb) = &self.on_progress {
            cb(phase);
        }
    }

    fn monitored(&self) -> BTreeSet<String> {
        self.settings
            .accounts
            .iter()
            .map(|a| a.address.clone())
            .collect()
    }

    /// One incremental cycle: poll every account, reconcile each counterpart,
    /// then sort and recolor if anything was written. Cursors are persisted
    /// last, after the batch has been applied.
    pub async fn run_cycle(&mut self, ctx: &mut SyncContext) -> Result<CycleSummary, SyncError> {
        let now = (self.clock)();
        if !ctx.cursors_loaded {
            ctx.cursors = self.store.load_cursors().await?;
            ctx.cursors_loaded = true;
            debug!(count = ctx.cursors.len(), "cursors loaded");
        }

        self.progress(CyclePhase::Polling {
            account_count: self.settings.accounts.len(),
        });
        let report = ingest::poll_all(
            self.messages,
            &self.settings.accounts,
            &mut ctx.cursors,
            self.settings.lookback,
            now,
        )
        .await;

        let mut summary = CycleSummary {
            accounts_failed: report.accounts_failed,
            ..CycleSummary::default()
        };
        self.reconcile_messages(report.messages, ctx, now, &mut summary)
            .await?;

        self.store.save_cursors(&ctx.cursors).await?;
        self.progress(CyclePhase::Done {
            processed: summary.processed,
        });
        info!(%summary, "cycle complete");
        Ok(summary)
    }

    /// Historical re-ingestion over `days`. With `clear`, every row is
    /// removed first. Cursors are neither read nor written.
    pub async fn backfill(
        &mut self,
        days: i64,
        clear: bool,
        ctx: &mut SyncContext,
    ) -> Result<CycleSummary, SyncError> {
        let now = (self.clock)();
        ingest::window_days(days)?;
        if clear {
            self.store.clear_all_rows().await?;
            info!("cleared all rows before backfill");
        }

        let mut summary = CycleSummary::default();
        let corpus = self.fetch_corpus(days, now, &mut summary).await;
        info!(days, messages = corpus.len(), "backfill corpus fetched");
        self.reconcile_messages(corpus, ctx, now, &mut summary)
            .await?;
        info!(%summary, "backfill complete");
        Ok(summary)
    }

    /// Completes blank name, organization, status and date cells from each
    /// contact's recent mail. Cells that already hold a value are left alone.
    pub async fn fill_empty(&mut self, ctx: &mut SyncContext) -> Result<CycleSummary, SyncError> {
        let now = (self.clock)();
        let map = self.schema(ctx).await?;
        let rows = self.store.read_all_rows().await?;
        let mut records: Vec<CrmRecord> = rows.iter().map(|r| decode_row(&map, r)).collect();

        let mut summary = CycleSummary::default();
        let corpus = self
            .fetch_corpus(self.settings.history_days, now, &mut summary)
            .await;
        let by_counterpart = self.index_by_counterpart(corpus);

        let mut first = true;
        for record in records.iter_mut() {
            if record.email.is_empty() {
                continue;
            }
            let wanted: Vec<Field> = FILLABLE
                .into_iter()
                .filter(|f| map.is_bound(*f) && record.get(*f).trim().is_empty())
                .collect();
            if wanted.is_empty() {
                continue;
            }
            if !first {
                self.pause().await;
            }
            first = false;
            summary.processed += 1;

            let Some(batch) = by_counterpart.get(&record.email) else {
                debug!(email = %record.email, "no recent mail for contact");
                summary.unchanged += 1;
                continue;
            };
            let messages = self.thread_for(batch).await;
            let request = RefineRequest {
                record: &*record,
                messages: &messages,
                fields: &wanted,
                guidance: None,
            };
            let proposal = match self.classifier.refine(&request).await {
                Ok(p) => p,
                Err(SyncError::ClassificationParse(msg)) => {
                    warn!(email = %record.email, error = %msg, "refine output unusable");
                    summary.skip(SkipReason::AnalysisFailed);
                    continue;
                }
                Err(err) => {
                    warn!(email = %record.email, error = %err, "refine failed");
                    summary.failed += 1;
                    continue;
                }
            };

            let mut fields = FieldSet::new();
            for (field, value) in proposal.iter() {
                if wanted.contains(field) {
                    fields.set_non_empty(*field, value);
                }
            }
            self.tally_update(&map, record, fields, &mut summary).await;
        }

        self.finish_maintenance(&map, now, &summary).await?;
        info!(%summary, "fill-empty complete");
        Ok(summary)
    }

    /// Re-derives `fields` on every record with the operator's guidance.
    /// Requested fields are overwritten, except notes, which only grow.
    pub async fn redo(
        &mut self,
        fields: &[Field],
        guidance: Option<&str>,
        ctx: &mut SyncContext,
    ) -> Result<CycleSummary, SyncError> {
        let now = (self.clock)();
        let requested: Vec<Field> = fields
            .iter()
            .copied()
            .filter(|f| *f != Field::Email)
            .collect();
        if requested.len() < fields.len() {
            warn!("email is an identity field and is never redone");
        }
        if requested.is_empty() {
            return Err(SyncError::Configuration(
                "redo needs at least one field other than email".to_string(),
            ));
        }

        let map = self.schema(ctx).await?;
        let requested: Vec<Field> = requested.into_iter().filter(|f| map.is_bound(*f)).collect();
        let rows = self.store.read_all_rows().await?;
        let mut records: Vec<CrmRecord> = rows.iter().map(|r| decode_row(&map, r)).collect();

        let mut summary = CycleSummary::default();
        let corpus = self
            .fetch_corpus(self.settings.history_days, now, &mut summary)
            .await;
        let by_counterpart = self.index_by_counterpart(corpus);
        let today = now.with_timezone(&self.settings.timezone).date_naive();

        for (i, record) in records.iter_mut().enumerate() {
            if i > 0 {
                self.pause().await;
            }
            summary.processed += 1;
            let messages = match by_counterpart.get(&record.email) {
                Some(batch) => self.thread_for(batch).await,
                None => Vec::new(),
            };
            let request = RefineRequest {
                record: &*record,
                messages: &messages,
                fields: &requested,
                guidance,
            };
            let proposal = match self.classifier.refine(&request).await {
                Ok(p) => p,
                Err(SyncError::ClassificationParse(msg)) => {
                    warn!(row = record.row_index, error = %msg, "refine output unusable");
                    summary.skip(SkipReason::AnalysisFailed);
                    continue;
                }
                Err(err) => {
                    warn!(row = record.row_index, error = %err, "refine failed");
                    summary.failed += 1;
                    continue;
                }
            };

            let mut updates = FieldSet::new();
            for (field, value) in proposal.iter() {
                if !requested.contains(field) {
                    continue;
                }
                if *field == Field::Notes {
                    if let Some(notes) = merge::append_note(&record.notes, value, today) {
                        updates.set(Field::Notes, notes);
                    }
                } else {
                    updates.set_non_empty(*field, value);
                }
            }
            self.tally_update(&map, record, updates, &mut summary).await;
        }

        self.finish_maintenance(&map, now, &summary).await?;
        info!(%summary, "redo complete");
        Ok(summary)
    }

    /// Free-text question over the current records.
    pub async fn ask(&mut self, question: &str, ctx: &mut SyncContext) -> Result<String, SyncError> {
        let map = self.schema(ctx).await?;
        let rows = self.store.read_all_rows().await?;
        let records: Vec<CrmRecord> = rows.iter().map(|r| decode_row(&map, r)).collect();
        debug!(records = records.len(), "answering question");
        self.classifier.answer(question, &records).await
    }

    async fn reconcile_messages(
        &mut self,
        messages: Vec<NormalizedMessage>,
        ctx: &mut SyncContext,
        now: DateTime<Utc>,
        summary: &mut CycleSummary,
    ) -> Result<(), SyncError> {
        self.progress(CyclePhase::Grouping {
            message_count: messages.len(),
        });
        let mut batches = group_by_counterpart(messages, &self.monitored());
        if batches.is_empty() {
            debug!("nothing to reconcile");
            return Ok(());
        }

        let map = self.schema(ctx).await?;
        let rows = self.store.read_all_rows().await?;
        let mut records: Vec<CrmRecord> = rows.iter().map(|r| decode_row(&map, r)).collect();

        self.progress(CyclePhase::Reconciling {
            counterpart_count: batches.len(),
        });
        for (i, batch) in batches.iter_mut().enumerate() {
            if i > 0 {
                self.pause().await;
            }
            batch.sort_oldest_first();
            summary.processed += 1;
            match self.reconcile_one(batch, &map, &mut records, now).await {
                Ok(Outcome::Added) => summary.added += 1,
                Ok(Outcome::Updated) => summary.updated += 1,
                Ok(Outcome::Unchanged) => summary.unchanged += 1,
                Ok(Outcome::Skipped(reason)) => {
                    debug!(counterpart = %batch.address, reason = reason.as_str(), "skipped");
                    summary.skip(reason);
                }
                Err(err) => {
                    summary.failed += 1;
                    error!(counterpart = %batch.address, error = %err, "counterpart failed");
                }
            }
        }

        if summary.wrote_anything() {
            self.progress(CyclePhase::Presenting);
            let today = now.with_timezone(&self.settings.timezone).date_naive();
            sort_and_highlight(&mut *self.store, &map, today).await?;
        }
        Ok(())
    }

    async fn reconcile_one(
        &mut self,
        batch: &CounterpartBatch,
        map: &FieldMap,
        records: &mut Vec<CrmRecord>,
        now: DateTime<Utc>,
    ) -> Result<Outcome, SyncError> {
        let Some(latest) = batch.latest() else {
            return Ok(Outcome::Unchanged);
        };
        let email_bound = map.is_bound(Field::Email);

        let preliminary = resolve(&batch.address, &batch.display_name, records, email_bound)
            .map(|m| m.record.clone());
        let signal = match self.classifier.classify(latest, preliminary.as_ref()).await {
            Ok(signal) => signal,
            Err(SyncError::ClassificationParse(msg)) => {
                warn!(counterpart = %batch.address, error = %msg, "classifier output unusable");
                return Ok(Outcome::Skipped(SkipReason::AnalysisFailed));
            }
            Err(err) => return Err(err),
        };

        let display_name = if signal.display_name.trim().is_empty() {
            batch.display_name.as_str()
        } else {
            signal.display_name.trim()
        };
        let existing = resolve(&batch.address, display_name, records, email_bound).map(|m| {
            debug!(counterpart = %batch.address, kind = ?m.kind, row = m.record.row_index, "matched record");
            m.record.clone()
        });

        if let Some(reason) = merge::precheck(&signal, self.settings.require_target_category) {
            return Ok(Outcome::Skipped(reason));
        }

        let calendar = CalendarSignal {
            next_meeting: self.calendar.find_next_meeting(&batch.address).await?,
            last_meeting: self.calendar.find_last_meeting(&batch.address).await?,
        };

        let thread_summary = if batch.messages.len() > 1 {
            match self.classifier.summarize_thread(&batch.messages).await {
                Ok(text) => Some(text),
                Err(err) => {
                    warn!(counterpart = %batch.address, error = %err, "thread summary failed; using single-message note");
                    None
                }
            }
        } else {
            None
        };

        let participants = batch.participants();
        let decision = merge::decide(
            &MergeInput {
                counterpart: &batch.address,
                display_name,
                signal: &signal,
                calendar: &calendar,
                existing: existing.as_ref(),
                thread_summary: thread_summary.as_deref(),
                participants: &participants,
            },
            &MergePolicy {
                require_target_category: self.settings.require_target_category,
                team: &self.settings.team,
                now,
                timezone: self.settings.timezone,
            },
        );

        match decision {
            Decision::Skip(reason) => Ok(Outcome::Skipped(reason)),
            Decision::Update { row_index, fields } => {
                let Some(record) = records.iter_mut().find(|r| r.row_index == row_index) else {
                    return Err(SyncError::store(format!("row {row_index} vanished mid-cycle")));
                };
                if self.write_update(map, record, fields).await? {
                    info!(counterpart = %batch.address, row = row_index, "updated contact");
                    Ok(Outcome::Updated)
                } else {
                    Ok(Outcome::Unchanged)
                }
            }
            Decision::Create { fields } => {
                let cells = encode_new_row(map, &fields);
                let index = self.store.append_row(cells.clone()).await?;
                info!(counterpart = %batch.address, row = index, "created contact");
                records.push(decode_row(map, &SheetRow { index, cells }));
                Ok(Outcome::Added)
            }
        }
    }

    /// Writes the part of `fields` that differs from `record` and is bound to
    /// a column. Returns whether anything was written.
    async fn write_update(
        &mut self,
        map: &FieldMap,
        record: &mut CrmRecord,
        mut fields: FieldSet,
    ) -> Result<bool, SyncError> {
        fields.retain_changes(record);
        let updates = encode_updates(map, &fields);
        if updates.is_empty() {
            return Ok(false);
        }
        self.store.update_row(record.row_index, &updates).await?;
        record.apply(&fields);
        Ok(true)
    }

    async fn tally_update(
        &mut self,
        map: &FieldMap,
        record: &mut CrmRecord,
        fields: FieldSet,
        summary: &mut CycleSummary,
    ) {
        match self.write_update(map, record, fields).await {
            Ok(true) => summary.updated += 1,
            Ok(false) => summary.unchanged += 1,
            Err(err) => {
                summary.failed += 1;
                error!(row = record.row_index, error = %err, "write failed");
            }
        }
    }

    async fn finish_maintenance(
        &mut self,
        map: &FieldMap,
        now: DateTime<Utc>,
        summary: &CycleSummary,
    ) -> Result<(), SyncError> {
        if summary.wrote_anything() {
            let today = now.with_timezone(&self.settings.timezone).date_naive();
            sort_and_highlight(&mut *self.store, map, today).await?;
        }
        Ok(())
    }

    /// Current header mapping, re-discovered only when the header changed.
    async fn schema(&mut self, ctx: &mut SyncContext) -> Result<FieldMap, SyncError> {
        let header = self.store.read_header().await?;
        if header.iter().all(|h| h.trim().is_empty()) {
            return Err(SyncError::Configuration(
                "store has no header row; run `contact-sync init` first".to_string(),
            ));
        }
        if let Some((cached, map)) = &ctx.schema
            && *cached == header
        {
            return Ok(map.clone());
        }
        let map = schema::discover(&header);
        if !map.is_bound(Field::Email) {
            warn!("no email column found; contacts are matched by name only");
        }
        info!(columns = header.len(), bound = map.bound_fields().count(), "schema mapped");
        ctx.schema = Some((header, map.clone()));
        Ok(map)
    }

    /// Range-fetches every account, oldest first, one copy per message id.
    async fn fetch_corpus(
        &self,
        days: i64,
        now: DateTime<Utc>,
        summary: &mut CycleSummary,
    ) -> Vec<NormalizedMessage> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut out = Vec::new();
        for account in &self.settings.accounts {
            match ingest::fetch_range(self.messages, account, days, now).await {
                Ok(messages) => {
                    debug!(account = %account, count = messages.len(), "range fetched");
                    out.extend(messages.into_iter().filter(|m| seen.insert(m.id.clone())));
                }
                Err(err) => {
                    summary.accounts_failed += 1;
                    error!(account = %account, error = %err, "range fetch failed; skipping account");
                }
            }
        }
        out.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        out
    }

    fn index_by_counterpart(
        &self,
        corpus: Vec<NormalizedMessage>,
    ) -> HashMap<String, CounterpartBatch> {
        group_by_counterpart(corpus, &self.monitored())
            .into_iter()
            .map(|mut batch| {
                batch.sort_oldest_first();
                (batch.address.clone(), batch)
            })
            .collect()
    }

    /// Full thread of the contact's latest message, falling back to the
    /// messages already at hand when the thread cannot be fetched.
    async fn thread_for(&self, batch: &CounterpartBatch) -> Vec<NormalizedMessage> {
        let Some(latest) = batch.latest() else {
            return Vec::new();
        };
        let account = MonitoredAccount::new(&latest.source_account);
        match self.messages.fetch_thread(&account, &latest.thread_id).await {
            Ok(thread) if !thread.is_empty() => thread,
            Ok(_) => batch.messages.clone(),
            Err(err) => {
                warn!(account = %account, thread = %latest.thread_id, error = %err, "thread fetch failed");
                batch.messages.clone()
            }
        }
    }

    async fn pause(&self) {
        if !self.settings.item_delay.is_zero() {
            tokio::time::sleep(self.settings.item_delay).await;
        }
    }
}
