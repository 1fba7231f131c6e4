//! CSV output: per-day interval tables plus the location and id snapshots.
//!
//! Every file is written under a `.tmp` name and renamed into place once
//! complete, so a run that dies mid-day never leaves a truncated table where
//! a finished one used to be.

#![allow(missing_docs)]

use std::fs::{self, File};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::coalesce::interval::{ClosedInterval, LocationKey, SlotKey};
use crate::coalesce::value::{Availability, SlotAvailability};
use crate::core::dates::format_timestamp;
use crate::core::errors::{AvlError, Result};
use crate::identity::keys::ExternalKey;
use crate::identity::resolver::{IdMap, InternalId};
use crate::ingest::location::{LocationBook, LocationRecord};

pub const LOCATIONS_FILE: &str = "locations.csv";
pub const IDS_FILE: &str = "ids.csv";

#[must_use]
pub fn avs_path(out_dir: &Path, day: NaiveDate) -> PathBuf {
    out_dir.join(format!("avs_{day}.csv"))
}

#[must_use]
pub fn slots_path(out_dir: &Path, day: NaiveDate) -> PathBuf {
    out_dir.join(format!("slots_{day}.csv"))
}

fn tmp_path(target: &Path) -> PathBuf {
    target.with_extension("csv.tmp")
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(|e| AvlError::io(parent, e))?;
    }
    Ok(())
}

/// A CSV file being written under its temporary name.
struct PendingCsv {
    tmp: PathBuf,
    target: PathBuf,
    writer: Option<csv::Writer<File>>,
    rows: u64,
}

impl PendingCsv {
    fn create(target: PathBuf) -> Result<Self> {
        ensure_parent(&target)?;
        let tmp = tmp_path(&target);
        let file = File::create(&tmp).map_err(|e| AvlError::io(&tmp, e))?;
        let writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        Ok(Self {
            tmp,
            target,
            writer: Some(writer),
            rows: 0,
        })
    }

    fn write<S: Serialize>(&mut self, row: S) -> Result<()> {
        let Some(writer) = self.writer.as_mut() else {
            return Err(AvlError::Runtime {
                details: format!("write to committed file {}", self.target.display()),
            });
        };
        writer.serialize(row)?;
        self.rows += 1;
        Ok(())
    }

    fn commit(&mut self) -> Result<u64> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush().map_err(|e| AvlError::io(&self.tmp, e))?;
            drop(writer);
            fs::rename(&self.tmp, &self.target).map_err(|e| AvlError::io(&self.target, e))?;
        }
        Ok(self.rows)
    }
}

impl Drop for PendingCsv {
    fn drop(&mut self) {
        if self.writer.take().is_some() {
            let _ = fs::remove_file(&self.tmp);
        }
    }
}

/// Row counts of one committed day.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DayRows {
    pub avs: u64,
    pub slots: u64,
}

/// The day's `avs_<day>.csv` and, optionally, `slots_<day>.csv`.
///
/// Nothing becomes visible until [`DayWriter::commit`]; dropping the writer
/// discards the partial files.
pub struct DayWriter {
    avs: PendingCsv,
    slots: Option<PendingCsv>,
}

impl DayWriter {
    pub fn new(out_dir: &Path, day: NaiveDate, with_slots: bool) -> Result<Self> {
        let avs = PendingCsv::create(avs_path(out_dir, day))?;
        let slots = if with_slots {
            Some(PendingCsv::create(slots_path(out_dir, day))?)
        } else {
            None
        };
        Ok(Self { avs, slots })
    }

    /// `id, first_seen, last_seen, offset, value`
    pub fn write_location(&mut self, interval: &ClosedInterval<LocationKey, Availability>) -> Result<()> {
        self.avs.write((
            interval.key,
            format_timestamp(interval.first_seen),
            format_timestamp(interval.last_seen),
            interval.utc_offset,
            interval.value.to_string(),
        ))
    }

    /// `id, slot_time (UTC), first_seen, last_seen, offset, available`.
    /// Ignored when the writer was opened without slots.
    pub fn write_slot(&mut self, interval: &ClosedInterval<SlotKey, SlotAvailability>) -> Result<()> {
        let Some(slots) = self.slots.as_mut() else {
            return Ok(());
        };
        let (id, slot) = &interval.key;
        slots.write((
            id,
            slot.utc_stamp(),
            format_timestamp(interval.first_seen),
            format_timestamp(interval.last_seen),
            interval.utc_offset,
            interval.value.as_flag(),
        ))
    }

    /// Flush and rename both files into place.
    pub fn commit(mut self) -> Result<DayRows> {
        let avs = self.avs.commit()?;
        let slots = match self.slots.as_mut() {
            Some(slots) => slots.commit()?,
            None => 0,
        };
        Ok(DayRows { avs, slots })
    }
}

// ──────────────────── snapshots ────────────────────

/// `locations.csv` row; header names are the column names.
#[derive(Debug, Serialize, Deserialize)]
struct LocationRow {
    id: InternalId,
    uuid: Option<String>,
    name: Option<String>,
    provider: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    address: Option<String>,
    city: Option<String>,
    county: Option<String>,
    state: Option<String>,
    zip: Option<String>,
    lat: Option<f64>,
    lng: Option<f64>,
    timezone: Option<String>,
}

impl LocationRow {
    fn from_record(id: InternalId, record: &LocationRecord) -> Self {
        Self {
            id,
            uuid: record.uuid.clone(),
            name: record.name.clone(),
            provider: record.provider.clone(),
            kind: record.kind.clone(),
            address: record.address.clone(),
            city: record.city.clone(),
            county: record.county.clone(),
            state: record.state.clone(),
            zip: record.zip.clone(),
            lat: record.lat,
            lng: record.lng,
            timezone: record.timezone.clone(),
        }
    }

    fn into_record(self) -> (InternalId, LocationRecord) {
        (
            self.id,
            LocationRecord {
                uuid: self.uuid,
                name: self.name,
                provider: self.provider,
                kind: self.kind,
                address: self.address,
                city: self.city,
                county: self.county,
                state: self.state,
                zip: self.zip,
                lat: self.lat,
                lng: self.lng,
                timezone: self.timezone,
            },
        )
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct IdRow {
    eid: ExternalKey,
    iid: InternalId,
}

fn write_with_header<R, I>(path: &Path, rows: I) -> Result<u64>
where
    R: Serialize,
    I: IntoIterator<Item = R>,
{
    ensure_parent(path)?;
    let tmp = tmp_path(path);
    let written = (|| -> Result<u64> {
        let mut writer = csv::Writer::from_path(&tmp)?;
        let mut count = 0;
        for row in rows {
            writer.serialize(row)?;
            count += 1;
        }
        writer.flush().map_err(|e| AvlError::io(&tmp, e))?;
        Ok(count)
    })();
    match written {
        Ok(count) => {
            fs::rename(&tmp, path).map_err(|e| AvlError::io(path, e))?;
            Ok(count)
        }
        Err(e) => {
            let _ = fs::remove_file(&tmp);
            Err(e)
        }
    }
}

fn read_with_header<R>(path: &Path) -> Result<Option<Vec<R>>>
where
    R: for<'de> Deserialize<'de>,
{
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(AvlError::io(path, e)),
    };
    let mut reader = csv::Reader::from_reader(file);
    let rows = reader
        .deserialize()
        .collect::<std::result::Result<Vec<R>, csv::Error>>()
        .map_err(|e| AvlError::Csv {
            context: "snapshot",
            details: format!("{}: {e}", path.display()),
        })?;
    Ok(Some(rows))
}

/// Write `locations.csv`, sorted by id.
pub fn write_locations(path: &Path, book: &LocationBook) -> Result<u64> {
    write_with_header(
        path,
        book.iter()
            .map(|(id, record)| LocationRow::from_record(id, record)),
    )
}

/// Read `locations.csv`; `Ok(None)` when absent.
pub fn read_locations(path: &Path) -> Result<Option<Vec<(InternalId, LocationRecord)>>> {
    Ok(read_with_header::<LocationRow>(path)?
        .map(|rows| rows.into_iter().map(LocationRow::into_record).collect()))
}

/// Write `ids.csv`, sorted by external key.
pub fn write_ids(path: &Path, ids: &IdMap) -> Result<u64> {
    write_with_header(
        path,
        ids.iter().map(|(eid, iid)| IdRow {
            eid: eid.clone(),
            iid,
        }),
    )
}

/// Read `ids.csv`; `Ok(None)` when absent.
pub fn read_ids(path: &Path) -> Result<Option<Vec<(ExternalKey, InternalId)>>> {
    Ok(read_with_header::<IdRow>(path)?
        .map(|rows| rows.into_iter().map(|row| (row.eid, row.iid)).collect()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coalesce::interval::SlotTime;
    use crate::identity::resolver::{IdPolicy, MergeConflict};
    use crate::ingest::location::LocationMerge;
    use chrono::NaiveDateTime;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2021, 5, 1).unwrap()
    }

    fn ts(raw: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    fn location_interval(id: InternalId, value: Availability) -> ClosedInterval<LocationKey, Availability> {
        ClosedInterval {
            key: id,
            first_seen: ts("2021-05-01 09:00:00"),
            last_seen: ts("2021-05-01 10:00:00"),
            utc_offset: -4,
            value,
        }
    }

    #[test]
    fn day_files_appear_only_on_commit() {
        let tmp = tempfile::tempdir().unwrap();
        let mut writer = DayWriter::new(tmp.path(), day(), true).unwrap();
        writer
            .write_location(&location_interval(1, Availability::Unavailable))
            .unwrap();
        writer
            .write_location(&location_interval(2, Availability::Uncounted))
            .unwrap();
        writer
            .write_location(&location_interval(3, Availability::Unknown))
            .unwrap();
        writer
            .write_slot(&ClosedInterval {
                key: (1, SlotTime::parse("2021-05-02T09:00:00-04:00").unwrap()),
                first_seen: ts("2021-05-01 09:00:00"),
                last_seen: ts("2021-05-01 09:30:00"),
                utc_offset: -4,
                value: SlotAvailability::Open,
            })
            .unwrap();
        assert!(!avs_path(tmp.path(), day()).exists());

        let rows = writer.commit().unwrap();
        assert_eq!(rows, DayRows { avs: 3, slots: 1 });
        let avs = fs::read_to_string(avs_path(tmp.path(), day())).unwrap();
        assert_eq!(
            avs,
            "1,2021-05-01 09:00:00,2021-05-01 10:00:00,-4,0\n\
             2,2021-05-01 09:00:00,2021-05-01 10:00:00,-4,+\n\
             3,2021-05-01 09:00:00,2021-05-01 10:00:00,-4,\n"
        );
        let slots = fs::read_to_string(slots_path(tmp.path(), day())).unwrap();
        assert_eq!(
            slots,
            "1,2021-05-02 13:00,2021-05-01 09:00:00,2021-05-01 09:30:00,-4,1\n"
        );
        assert!(!tmp_path(&avs_path(tmp.path(), day())).exists());
    }

    #[test]
    fn dropped_writer_leaves_no_files() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let mut writer = DayWriter::new(tmp.path(), day(), true).unwrap();
            writer
                .write_location(&location_interval(1, Availability::Count(3)))
                .unwrap();
        }
        let leftovers: Vec<_> = fs::read_dir(tmp.path()).unwrap().collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn without_slots_no_slot_file_is_written() {
        let tmp = tempfile::tempdir().unwrap();
        let writer = DayWriter::new(tmp.path(), day(), false).unwrap();
        writer.commit().unwrap();
        assert!(avs_path(tmp.path(), day()).exists());
        assert!(!slots_path(tmp.path(), day()).exists());
    }

    #[test]
    fn locations_snapshot_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(LOCATIONS_FILE);
        let mut book = LocationBook::new(LocationMerge::FirstKnown);
        book.merge(
            12,
            LocationRecord {
                name: Some("Walgreens, Downtown".to_string()),
                provider: Some("walgreens".to_string()),
                zip: Some("02138".to_string()),
                lat: Some(42.37),
                lng: Some(-71.11),
                ..LocationRecord::default()
            },
        );
        book.merge(3, LocationRecord::default());
        assert_eq!(write_locations(&path, &book).unwrap(), 2);

        let text = fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next(),
            Some("id,uuid,name,provider,type,address,city,county,state,zip,lat,lng,timezone")
        );
        assert!(lines.next().unwrap().starts_with("3,"));

        let back = read_locations(&path).unwrap().unwrap();
        assert_eq!(back.len(), 2);
        assert_eq!(back[1].0, 12);
        assert_eq!(back[1].1.name.as_deref(), Some("Walgreens, Downtown"));
        assert_eq!(back[1].1.zip.as_deref(), Some("02138"));
        assert_eq!(back[1].1.lat, Some(42.37));
        assert!(back[0].1.name.is_none());
    }

    #[test]
    fn ids_snapshot_round_trips_sorted() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(IDS_FILE);
        let mut ids = IdMap::new(IdPolicy::Counter, MergeConflict::Warn);
        let primary = ExternalKey::parse("uuid:b").unwrap();
        let other = ExternalKey::parse("cvs:1").unwrap();
        ids.resolve(&[other], &primary).unwrap();
        write_ids(&path, &ids).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text, "eid,iid\ncvs:1,1\nuuid:b,1\n");
        let back = read_ids(&path).unwrap().unwrap();
        assert_eq!(back.len(), 2);
        assert_eq!(back[0].0.as_str(), "cvs:1");
    }

    #[test]
    fn missing_snapshots_read_as_none() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(read_locations(&tmp.path().join(LOCATIONS_FILE)).unwrap().is_none());
        assert!(read_ids(&tmp.path().join(IDS_FILE)).unwrap().is_none());
    }

    #[test]
    fn corrupt_id_snapshot_is_a_csv_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(IDS_FILE);
        fs::write(&path, "eid,iid\nnot-a-key,1\n").unwrap();
        let err = read_ids(&path).unwrap_err();
        assert_eq!(err.code(), "AVL-2103");
    }
}
