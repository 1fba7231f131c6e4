//! Run driver: one pass per calendar day, files in listing order, records in
//! arrival order.
//!
//! Per record the driver resolves external keys to an internal id, folds the
//! location record into the book and feeds every observation to the
//! coalescers. Open intervals are checkpointed for the next day (or flushed
//! after the last one when asked to). Errors are routed through
//! [`AvlError::disposition`]: unresolvable keys skip the record, everything
//! else aborts the run with the offending record in the message.

#![allow(missing_docs)]

use std::path::PathBuf;
use std::time::Instant;

use chrono::NaiveDate;
use serde::Serialize;
use serde_json::Value;

use crate::coalesce::checkpoint::{FsStateStore, StateStore};
use crate::coalesce::interval::{Coalescer, LocationKey, SlotKey};
use crate::coalesce::value::{Availability, SlotAvailability};
use crate::core::config::Config;
use crate::core::dates::next_day;
use crate::core::errors::{AvlError, Disposition, Result};
use crate::identity::keys::ExternalKey;
use crate::identity::resolver::{IdMap, InternalId, Resolution};
use crate::ingest::feed::{Feed, FeedRecord, Interpretation, SkipReason};
use crate::ingest::location::{LocationBook, LocationRecord};
use crate::ingest::normalize::utc_offset_hours;
use crate::ingest::source::{
    EXTERNAL_IDS_SEED, FsRecordSource, LOCATIONS_SEED, RecordSource, read_ndjson_file,
};
use crate::logger::dual::{ActivityEvent, ActivityLoggerHandle, DayReport};
use crate::output::csv_sink::{
    DayWriter, IDS_FILE, LOCATIONS_FILE, read_ids, read_locations, write_ids, write_locations,
};

/// What one `run` call covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    /// Days to process, ascending.
    pub days: Vec<NaiveDate>,
    /// Track slot-level intervals (ignored by feeds without slots).
    pub slots: bool,
    /// Emit every open interval after the last day instead of checkpointing.
    pub flush: bool,
    /// Ignore the id and location snapshots of earlier runs and seed from
    /// the newest raw snapshot instead.
    pub clean_run: bool,
    /// Per-day progress lines on stderr.
    pub verbose: bool,
}

/// Result of a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub feed: Feed,
    pub config_hash: String,
    pub days: Vec<DayReport>,
    pub external_keys: usize,
    pub internal_ids: usize,
    pub locations: usize,
    pub legacy_keys_rewritten: usize,
    pub duration_ms: u64,
}

/// Mutable state of the day being processed.
struct DayState {
    day: NaiveDate,
    avs: Coalescer<LocationKey, Availability>,
    slots: Option<Coalescer<SlotKey, SlotAvailability>>,
    writer: DayWriter,
    report: DayReport,
}

pub struct Driver<S, T> {
    config: Config,
    config_hash: String,
    feed: Feed,
    source: S,
    store: T,
    ids: IdMap,
    locations: LocationBook,
    /// An earlier run or day left state behind, so a missing checkpoint
    /// means lost intervals.
    has_history: bool,
    logger: Option<ActivityLoggerHandle>,
}

impl Driver<FsRecordSource, FsStateStore> {
    /// Driver over the configured raw and state directories.
    pub fn from_config(config: Config, feed: Feed) -> Result<Self> {
        let source = FsRecordSource::new(config.paths.raw_dir.clone(), feed);
        let store = FsStateStore::new(config.paths.state_dir.clone());
        Self::new(config, feed, source, store)
    }
}

impl<S, T> Driver<S, T>
where
    S: RecordSource,
    T: StateStore,
{
    pub fn new(config: Config, feed: Feed, source: S, store: T) -> Result<Self> {
        let config_hash = config.stable_hash()?;
        let ids = IdMap::new(config.identity.policy(), config.identity.merge_conflict);
        let locations = LocationBook::new(config.locations.merge_policy);
        Ok(Self {
            config,
            config_hash,
            feed,
            source,
            store,
            ids,
            locations,
            has_history: false,
            logger: None,
        })
    }

    /// Route activity events to the logger thread.
    #[must_use]
    pub fn with_logger(mut self, logger: ActivityLoggerHandle) -> Self {
        self.logger = Some(logger);
        self
    }

    #[must_use]
    pub fn ids(&self) -> &IdMap {
        &self.ids
    }

    #[must_use]
    pub fn locations(&self) -> &LocationBook {
        &self.locations
    }

    fn emit(&self, event: ActivityEvent) {
        if let Some(logger) = &self.logger {
            logger.send(event);
        }
    }

    fn snapshot_path(&self, name: &str) -> PathBuf {
        self.config.paths.out_dir.join(name)
    }

    /// Process every day of `options.days` in order.
    pub fn run(&mut self, options: &RunOptions) -> Result<RunSummary> {
        let (Some(first), Some(last)) = (options.days.first(), options.days.last()) else {
            return Err(AvlError::DateRange {
                details: "date range has no elements".to_string(),
            });
        };
        let started = Instant::now();
        self.emit(ActivityEvent::RunStarted {
            version: env!("CARGO_PKG_VERSION").to_string(),
            config_hash: self.config_hash.clone(),
            feed: self.feed.to_string(),
            first_day: first.to_string(),
            last_day: last.to_string(),
        });

        let outcome = self.run_days(options);
        let duration_ms = elapsed_ms(started);
        match outcome {
            Ok((days, legacy_keys_rewritten)) => {
                self.emit(ActivityEvent::RunFinished {
                    days: days.len(),
                    ok: true,
                    duration_ms,
                });
                Ok(RunSummary {
                    feed: self.feed,
                    config_hash: self.config_hash.clone(),
                    days,
                    external_keys: self.ids.len(),
                    internal_ids: self.ids.id_count(),
                    locations: self.locations.len(),
                    legacy_keys_rewritten,
                    duration_ms,
                })
            }
            Err(err) => {
                self.emit(ActivityEvent::Error {
                    code: err.code().to_string(),
                    message: err.to_string(),
                });
                self.emit(ActivityEvent::RunFinished {
                    days: 0,
                    ok: false,
                    duration_ms,
                });
                Err(err)
            }
        }
    }

    fn run_days(&mut self, options: &RunOptions) -> Result<(Vec<DayReport>, usize)> {
        let legacy = if options.clean_run {
            eprintln!("[AVL-RUN] clean run: ignoring {IDS_FILE} and {LOCATIONS_FILE}");
            self.seed_from_latest_snapshot(options.days[0])?;
            0
        } else {
            self.load_snapshots()?
        };
        if self.feed == Feed::UnivafLog {
            self.seed_from_side_files(options.days[0])?;
        }

        let mut reports = Vec::with_capacity(options.days.len());
        for (index, day) in options.days.iter().enumerate() {
            let is_last = index + 1 == options.days.len();
            let report = self.process_day(*day, is_last && options.flush, options)?;
            if options.verbose {
                eprintln!(
                    "[AVL-RUN] {day}: {} records, {} avs / {} slot intervals written, {} open",
                    report.records, report.avs_emitted, report.slots_emitted, report.open_avs
                );
            }
            reports.push(report);
        }
        Ok((reports, legacy))
    }

    /// Seed the id map and location book from the previous run's output.
    fn load_snapshots(&mut self) -> Result<usize> {
        if let Some(pairs) = read_ids(&self.snapshot_path(IDS_FILE))? {
            self.has_history |= !pairs.is_empty();
            let duplicates = self.ids.load(pairs)?;
            for key in duplicates {
                eprintln!("[AVL-RESOLVE] WARNING: {key} listed twice in {IDS_FILE}; keeping the first id");
            }
        }
        if let Some(records) = read_locations(&self.snapshot_path(LOCATIONS_FILE))? {
            self.locations.load(records);
        }
        let rewritten = self.ids.normalize_legacy_keys();
        for (old, new, id) in &rewritten {
            eprintln!("[AVL-RESOLVE] rewrote legacy key {old} -> {new} (id {id})");
        }
        Ok(rewritten.len())
    }

    /// Clean univaf snapshot run: mint ids and take location metadata from the
    /// newest snapshot on disk, without observing its availability.
    fn seed_from_latest_snapshot(&mut self, day: NaiveDate) -> Result<()> {
        let Some(path) = self.source.latest_snapshot()? else {
            return Ok(());
        };
        eprintln!("[AVL-RUN] seeding ids and locations from {}", path.display());
        let day_label = day.to_string();
        let mut seeded = 0_usize;
        for (index, item) in self.source.open(&path)?.enumerate() {
            let source_name = format!("{}#{}", path.display(), index + 1);
            let outcome = item.and_then(|record| self.seed_record(&record, &source_name, &day_label));
            match outcome {
                Ok(true) => seeded += 1,
                Ok(false) => {}
                Err(err) if err.disposition() == Disposition::SkipRecord => {
                    self.warn_skip(&day_label, &err);
                }
                Err(err) => return Err(err),
            }
        }
        if seeded > 0 {
            eprintln!("[AVL-RUN] seeded {seeded} locations, {} internal ids", self.ids.id_count());
        }
        Ok(())
    }

    fn seed_record(&mut self, record: &Value, source_name: &str, day: &str) -> Result<bool> {
        let Interpretation::Record(rec) = self.feed.interpret(record, source_name, false)? else {
            return Ok(false);
        };
        let FeedRecord {
            primary,
            externals,
            location,
            ..
        } = *rec;
        let resolution = self.ids.resolve(&externals, &primary)?;
        self.note_resolution(day, &primary, &resolution);
        if let Some(location) = location {
            self.locations.merge(resolution.id, location);
        }
        Ok(true)
    }

    /// univaf log feed: ids and locations come from side files, not the log.
    fn seed_from_side_files(&mut self, day: NaiveDate) -> Result<()> {
        let day_label = day.to_string();
        let raw_dir = self.config.paths.raw_dir.clone();

        let locations_path = raw_dir.join(LOCATIONS_SEED);
        match read_ndjson_file(&locations_path)? {
            None => {
                eprintln!(
                    "[AVL-RUN] WARNING: {} not found; relying on previous snapshots",
                    locations_path.display()
                );
                self.emit(ActivityEvent::MissingInput {
                    day: day_label.clone(),
                    feed: format!("{} ({LOCATIONS_SEED})", self.feed),
                });
            }
            Some(rows) => {
                let source_name = locations_path.display().to_string();
                for row in &rows {
                    let Some(obj) = row.as_object() else {
                        return Err(AvlError::malformed(&source_name, "record is not an object", row));
                    };
                    let Some(id) = obj.get("id").and_then(Value::as_str) else {
                        return Err(AvlError::malformed(&source_name, "location without id", row));
                    };
                    let key = match ExternalKey::uuid(id) {
                        Ok(key) => key,
                        Err(err) => {
                            self.warn_skip(&day_label, &err);
                            continue;
                        }
                    };
                    let resolution = self.ids.resolve(&[], &key)?;
                    self.note_resolution(&day_label, &key, &resolution);
                    let mut record = LocationRecord::from_row(obj);
                    if record.uuid.is_none() {
                        record.uuid = Some(id.to_string());
                    }
                    self.locations.merge(resolution.id, record);
                }
            }
        }

        let external_path = raw_dir.join(EXTERNAL_IDS_SEED);
        let Some(rows) = read_ndjson_file(&external_path)? else {
            eprintln!(
                "[AVL-RUN] WARNING: {} not found; no external ids attached",
                external_path.display()
            );
            self.emit(ActivityEvent::MissingInput {
                day: day_label,
                feed: format!("{} ({EXTERNAL_IDS_SEED})", self.feed),
            });
            return Ok(());
        };
        let source_name = external_path.display().to_string();
        for row in &rows {
            let field = |name: &str| row.get(name).and_then(Value::as_str);
            let (Some(system), Some(value), Some(location)) =
                (field("system"), field("value"), field("provider_location_id"))
            else {
                return Err(AvlError::malformed(
                    &source_name,
                    "external id without system, value and provider_location_id",
                    row,
                ));
            };
            let keys = ExternalKey::from_parts(system, value)
                .and_then(|key| ExternalKey::uuid(location).map(|anchor| (key, anchor)));
            let (key, anchor) = match keys {
                Ok(keys) => keys,
                Err(err) => {
                    self.warn_skip(&day_label, &err);
                    continue;
                }
            };
            if self.ids.alias(key, &anchor).is_none() {
                let err = AvlError::UnknownKey {
                    key: anchor.to_string(),
                };
                self.warn_skip(&day_label, &err);
            }
        }
        Ok(())
    }

    fn warn_skip(&self, day: &str, err: &AvlError) {
        eprintln!("[AVL-RESOLVE] WARNING: skipping record: {err}");
        let event = match err {
            AvlError::UnknownKey { key } => ActivityEvent::UnknownKey {
                day: day.to_string(),
                key: key.clone(),
            },
            AvlError::MalformedKey { key, details } => ActivityEvent::MalformedKey {
                day: day.to_string(),
                key: key.clone(),
                message: details.clone(),
            },
            other => ActivityEvent::Error {
                code: other.code().to_string(),
                message: other.to_string(),
            },
        };
        self.emit(event);
    }

    fn note_resolution(
        &self,
        day: &str,
        key: &ExternalKey,
        resolution: &Resolution,
    ) -> (u64, u64) {
        let mut conflicts = 0;
        let mut collisions = 0;
        if !resolution.conflicting_ids.is_empty() {
            conflicts += 1;
            eprintln!(
                "[AVL-RESOLVE] WARNING: keys of {key} span ids {:?}; using {}",
                resolution.conflicting_ids, resolution.id
            );
            self.emit(ActivityEvent::MergeConflict {
                day: day.to_string(),
                key: key.to_string(),
                ids: resolution.conflicting_ids.clone(),
            });
        }
        if resolution.hash_collision {
            collisions += 1;
            eprintln!(
                "[AVL-RESOLVE] WARNING: hash id {} for {key} is already used by another location",
                resolution.id
            );
            self.emit(ActivityEvent::HashCollision {
                day: day.to_string(),
                key: key.to_string(),
                id: resolution.id,
            });
        }
        (conflicts, collisions)
    }

    fn process_day(&mut self, day: NaiveDate, flush: bool, options: &RunOptions) -> Result<DayReport> {
        let started = Instant::now();
        let day_label = day.to_string();
        let with_slots = options.slots && self.feed.has_slots();

        let avs_state = self.store.load_avs(day)?;
        let checkpoint_loaded = avs_state.is_some();
        if !checkpoint_loaded && self.has_history {
            eprintln!(
                "[AVL-RUN] WARNING: no checkpoint for {day}; intervals open at the end of the previous day are lost"
            );
            self.emit(ActivityEvent::CheckpointMissing {
                day: day_label.clone(),
                path: format!("state_{day}_avs.json"),
            });
        }
        let first_sight = self.config.coalesce.first_sight;
        let slots = if with_slots {
            let state = self
                .store
                .load_slots(day, self.config.coalesce.slot_retention_days)?
                .unwrap_or_default();
            Some(Coalescer::with_state(first_sight, state))
        } else {
            None
        };

        let mut state = DayState {
            day,
            avs: Coalescer::with_state(first_sight, avs_state.unwrap_or_default()),
            slots,
            writer: DayWriter::new(&self.config.paths.out_dir, day, with_slots)?,
            report: DayReport {
                day: day_label.clone(),
                feed: self.feed.to_string(),
                config_hash: self.config_hash.clone(),
                checkpoint_loaded,
                ..DayReport::default()
            },
        };

        let files = self.source.files_for_day(day)?;
        if files.is_empty() {
            eprintln!("[AVL-RUN] WARNING: no {} input for {day}", self.feed);
            self.emit(ActivityEvent::MissingInput {
                day: day_label.clone(),
                feed: self.feed.to_string(),
            });
        }
        for path in &files {
            state.report.files += 1;
            for (index, item) in self.source.open(path)?.enumerate() {
                let source_name = format!("{}#{}", path.display(), index + 1);
                let outcome = item.and_then(|record| {
                    state.report.records += 1;
                    self.handle_record(&record, &source_name, with_slots, &mut state)
                });
                match outcome {
                    Ok(()) => {}
                    Err(err) if err.disposition() == Disposition::SkipRecord => {
                        state.report.skipped_records += 1;
                        self.warn_skip(&day_label, &err);
                    }
                    Err(err) => {
                        if let AvlError::MalformedRecord { details, .. } = &err {
                            self.emit(ActivityEvent::MalformedRecord {
                                day: day_label.clone(),
                                path: source_name,
                                message: details.clone(),
                            });
                        }
                        return Err(err);
                    }
                }
            }
        }

        self.finish_day(state, flush, started)
    }

    fn handle_record(
        &mut self,
        record: &Value,
        source_name: &str,
        with_slots: bool,
        state: &mut DayState,
    ) -> Result<()> {
        let rec = match self.feed.interpret(record, source_name, with_slots)? {
            Interpretation::Record(rec) => rec,
            Interpretation::Skip(SkipReason::UnknownAction(action)) => {
                state.report.skipped_records += 1;
                eprintln!("[AVL-RUN] WARNING: {source_name}: unknown change action {action:?}, skipped");
                return Ok(());
            }
            Interpretation::Skip(_) => return Ok(()),
        };
        let FeedRecord {
            primary,
            externals,
            location,
            observations,
            slots,
        } = *rec;

        let id = self.resolve(&primary, &externals, state)?;
        if let Some(location) = location {
            self.locations.merge(id, location);
        }

        for observation in observations {
            let zone = match observation.time_zone {
                Some(zone) => Some(zone),
                None => self.locations.lookup(id)?.timezone.clone(),
            };
            let offset = utc_offset_hours(
                observation.checked.utc,
                zone.as_deref(),
                observation.checked.source_offset,
            );
            state.report.observations += 1;
            if let Some(closed) = state
                .avs
                .observe(id, observation.checked.utc, offset, observation.value)
            {
                state.writer.write_location(&closed)?;
                state.report.avs_emitted += 1;
            }
        }

        if let Some(coalescer) = state.slots.as_mut() {
            for slot in slots {
                let offset = slot.slot.offset_hours();
                if let Some(closed) = coalescer.observe((id, slot.slot), slot.checked.utc, offset, slot.value) {
                    state.writer.write_slot(&closed)?;
                    state.report.slots_emitted += 1;
                }
            }
        }
        Ok(())
    }

    fn resolve(
        &mut self,
        primary: &ExternalKey,
        externals: &[ExternalKey],
        state: &mut DayState,
    ) -> Result<InternalId> {
        if !self.feed.mints_ids() {
            return self.ids.get(primary).ok_or_else(|| AvlError::UnknownKey {
                key: primary.to_string(),
            });
        }
        let resolution = self.ids.resolve(externals, primary)?;
        let (conflicts, collisions) =
            self.note_resolution(&state.day.to_string(), primary, &resolution);
        state.report.merge_conflicts += conflicts;
        state.report.hash_collisions += collisions;
        Ok(resolution.id)
    }

    fn finish_day(&mut self, mut state: DayState, flush: bool, started: Instant) -> Result<DayReport> {
        let day = state.day;
        if flush {
            for closed in state.avs.flush() {
                state.writer.write_location(&closed)?;
                state.report.avs_emitted += 1;
            }
            if let Some(slots) = state.slots.as_mut() {
                for closed in slots.flush() {
                    state.writer.write_slot(&closed)?;
                    state.report.slots_emitted += 1;
                }
            }
        }

        let out_of_order = state.avs.out_of_order()
            + state.slots.as_ref().map_or(0, Coalescer::out_of_order);
        if out_of_order > 0 {
            eprintln!("[AVL-RUN] {day}: {out_of_order} observations arrived out of order; last_seen clamped");
        }

        state.writer.commit()?;

        state.report.open_avs = state.avs.len() as u64;
        state.report.open_slots = state.slots.as_ref().map_or(0, |s| s.len() as u64);
        if !flush {
            let resume = next_day(day);
            self.store.save_avs(resume, state.avs.state())?;
            if let Some(slots) = &state.slots {
                self.store.save_slots(resume, slots.state())?;
            }
            self.emit(ActivityEvent::CheckpointSaved {
                day: resume.to_string(),
                path: format!("state_{resume}_avs.json"),
                open: state.report.open_avs + state.report.open_slots,
            });
            self.has_history = true;
        }

        write_locations(&self.snapshot_path(LOCATIONS_FILE), &self.locations)?;
        write_ids(&self.snapshot_path(IDS_FILE), &self.ids)?;

        state.report.duration_ms = elapsed_ms(started);
        self.emit(ActivityEvent::DayCompleted(Box::new(state.report.clone())));
        Ok(state.report)
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
