//! Record sources: raw feed files on disk, decoded lazily into JSON values.

#![allow(missing_docs)]

use std::fs::{self, File};
use std::io::{BufRead, BufReader, ErrorKind};
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use flate2::read::GzDecoder;
use serde_json::Value;

use crate::core::dates::compact_stamp;
use crate::core::errors::{AvlError, Result};

use super::feed::Feed;
use super::normalize::repair_backslashes;

/// Location metadata dump that seeds the univaf log feed.
pub const LOCATIONS_SEED: &str = "locations.ndjson";
/// External id dump that seeds the univaf log feed.
pub const EXTERNAL_IDS_SEED: &str = "external_ids.ndjson";

/// Lazily decoded records of one file, in arrival order.
pub type RecordIter = Box<dyn Iterator<Item = Result<Value>>>;

/// Something that can list and open the raw files of a day.
pub trait RecordSource {
    /// Files holding the day's records, in processing order. Empty when the
    /// day has no input.
    fn files_for_day(&self, day: NaiveDate) -> Result<Vec<PathBuf>>;

    /// Open one file. Can be called again to restart it.
    fn open(&self, path: &Path) -> Result<RecordIter>;

    /// Newest full snapshot of every location, for seeding a clean run.
    /// `None` for feeds without snapshots or when none is on disk.
    fn latest_snapshot(&self) -> Result<Option<PathBuf>> {
        Ok(None)
    }
}

/// The on-disk layouts written by the scrapers.
#[derive(Debug, Clone)]
pub struct FsRecordSource {
    raw_dir: PathBuf,
    feed: Feed,
}

impl FsRecordSource {
    #[must_use]
    pub fn new(raw_dir: impl Into<PathBuf>, feed: Feed) -> Self {
        Self {
            raw_dir: raw_dir.into(),
            feed,
        }
    }

    #[must_use]
    pub fn raw_dir(&self) -> &Path {
        &self.raw_dir
    }

    #[must_use]
    pub const fn feed(&self) -> Feed {
        self.feed
    }

    fn existing(path: PathBuf) -> Vec<PathBuf> {
        if path.is_file() { vec![path] } else { Vec::new() }
    }

    /// Raw files whose name starts with `prefix`, sorted by name.
    fn listed(&self, prefix: &str) -> Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(&self.raw_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(AvlError::io(&self.raw_dir, e)),
        };
        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| AvlError::io(&self.raw_dir, e))?;
            if entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(prefix))
            {
                files.push(entry.path());
            }
        }
        files.sort();
        Ok(files)
    }
}

impl RecordSource for FsRecordSource {
    fn files_for_day(&self, day: NaiveDate) -> Result<Vec<PathBuf>> {
        match self.feed {
            Feed::UnivafSnapshot => self.listed(&format!("locations_{}_", compact_stamp(day))),
            Feed::UnivafLog => Ok(Self::existing(
                self.raw_dir.join(format!("availability_log-{day}.ndjson")),
            )),
            Feed::Vaccinespotter => Ok(Self::existing(self.raw_dir.join(format!("{day}.jsonl.gz")))),
        }
    }

    fn open(&self, path: &Path) -> Result<RecordIter> {
        match self.feed {
            Feed::UnivafSnapshot => open_json_array(path),
            Feed::UnivafLog => {
                let file = File::open(path).map_err(|e| AvlError::io(path, e))?;
                Ok(ndjson_records(path, BufReader::new(file), false))
            }
            Feed::Vaccinespotter => {
                let file = File::open(path).map_err(|e| AvlError::io(path, e))?;
                Ok(ndjson_records(path, BufReader::new(GzDecoder::new(file)), true))
            }
        }
    }

    fn latest_snapshot(&self) -> Result<Option<PathBuf>> {
        match self.feed {
            Feed::UnivafSnapshot => Ok(self.listed("locations_")?.pop()),
            Feed::UnivafLog | Feed::Vaccinespotter => Ok(None),
        }
    }
}

fn open_json_array(path: &Path) -> Result<RecordIter> {
    let bytes = fs::read(path).map_err(|e| AvlError::io(path, e))?;
    let rows: Vec<Value> = serde_json::from_slice(&bytes).map_err(|e| AvlError::Serialization {
        context: "snapshot file",
        details: format!("{}: {e}", path.display()),
    })?;
    Ok(Box::new(rows.into_iter().map(Ok)))
}

/// One JSON value per line; blank lines are ignored.
fn ndjson_records<R>(path: &Path, reader: R, repair: bool) -> RecordIter
where
    R: BufRead + 'static,
{
    let path = path.to_path_buf();
    Box::new(
        reader
            .split(b'\n')
            .enumerate()
            .filter_map(move |(index, line)| {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => return Some(Err(AvlError::io(&path, e))),
                };
                let line = if repair { repair_backslashes(&line) } else { line };
                if line.iter().all(u8::is_ascii_whitespace) {
                    return None;
                }
                Some(serde_json::from_slice(&line).map_err(|e| AvlError::MalformedRecord {
                    source_name: format!("{}:{}", path.display(), index + 1),
                    details: format!("invalid JSON: {e}"),
                    record: String::from_utf8_lossy(&line).into_owned(),
                }))
            }),
    )
}

/// Read a whole ndjson side file. `Ok(None)` when it does not exist.
pub fn read_ndjson_file(path: &Path) -> Result<Option<Vec<Value>>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(AvlError::io(path, e)),
    };
    ndjson_records(path, BufReader::new(file), false)
        .collect::<Result<Vec<_>>>()
        .map(Some)
}
