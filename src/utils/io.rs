use crate::config::{CcMethod, CcParameters};
use crate::constants::CCF_FILE_EXTENSION;
use crate::correlation::CcfResult;
use crate::error::{CcError, Result};
use crate::utils::loader::StationInfo;
use crate::{FloatType, Timestamp};
use log::{debug, warn};
use ndarray::Array2;
use rocksdb::{IteratorMode, Options, DB};
use serde_derive::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Parameters stored next to every correlation function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CcfParameters {
    pub lon_s: f64,
    pub lat_s: f64,
    pub lon_r: f64,
    pub lat_r: f64,
    pub dt: f64,
    pub maxlag: f64,
    /// Lag samples per row.
    pub npts: usize,
    pub cc_len: f64,
    pub step: f64,
    pub method: CcMethod,
    pub smoothspect_n: usize,
    pub substack: bool,
    pub substack_len: f64,
    /// Start time of each row.
    pub time: Vec<Timestamp>,
    /// Segments stacked into each row.
    pub ngood: Vec<usize>,
    pub date: String,
}

impl CcfParameters {
    pub fn new(
        params: &CcParameters,
        source: &StationInfo,
        receiver: &StationInfo,
        result: &CcfResult,
        day: &str,
    ) -> Result<CcfParameters> {
        let rows = result.data.nrows();
        if result.timestamps.len() != rows || result.counts.len() != rows {
            return Err(CcError::configuration(format!(
                "{rows} correlation rows but {} timestamps and {} counts",
                result.timestamps.len(),
                result.counts.len()
            )));
        }

        Ok(CcfParameters {
            lon_s: source.longitude,
            lat_s: source.latitude,
            lon_r: receiver.longitude,
            lat_r: receiver.latitude,
            dt: params.dt,
            maxlag: params.maxlag,
            npts: result.data.ncols(),
            cc_len: params.cc_len,
            step: params.step,
            method: params.cc_method,
            smoothspect_n: params.smoothspect_n,
            substack: params.substack,
            substack_len: params.substack_len,
            time: result.timestamps.clone(),
            ngood: result.counts.clone(),
            date: day.to_string(),
        })
    }
}

/// One correlation function as stored in a day container.
///
/// `data_type` groups records by source channel (`NETsSTAsC`); `path` addresses the
/// receiver channel and load chunk (`NETsSTAsC{chunk}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CcfRecord {
    pub data_type: String,
    pub path: String,
    pub parameters: CcfParameters,
    pub data: Array2<FloatType>,
}

impl CcfRecord {
    pub fn address(&self) -> (String, String) {
        (self.data_type.clone(), self.path.clone())
    }
}

/// Receives correlation records as they are produced.
pub trait CcfSink {
    fn append(&mut self, record: CcfRecord) -> Result<()>;
}

impl CcfSink for Vec<CcfRecord> {
    fn append(&mut self, record: CcfRecord) -> Result<()> {
        self.push(record);
        Ok(())
    }
}

/// One day of correlations, stored in a rocksdb database keyed by `{data_type}/{path}`.
/// Values are `bincode`-encoded [`CcfRecord`]s.
pub struct CcfContainer {
    path: PathBuf,
    db: DB,
}

impl CcfContainer {
    /// Opens the database at `path`, creating it if absent.
    pub fn open(path: impl AsRef<Path>) -> Result<CcfContainer> {
        let path = path.as_ref().to_path_buf();

        let mut options = Options::default();
        options.create_if_missing(true);
        let db = DB::open(&options, &path).map_err(|err| db_error(&path, err))?;

        Ok(CcfContainer { path, db })
    }

    /// Stores `record`. Returns `false` (and writes nothing) if its address is taken.
    pub fn append(&mut self, record: &CcfRecord) -> Result<bool> {
        let key = record_key(&record.data_type, &record.path);
        if self.has_key(&key)? {
            warn!(
                "{}: {key} already exists, not overwritten",
                self.path.display()
            );
            return Ok(false);
        }

        self.db
            .put(key.as_bytes(), bincode::serialize(record)?)
            .map_err(|err| db_error(&self.path, err))?;
        Ok(true)
    }

    /// Number of stored records.
    pub fn len(&self) -> Result<usize> {
        let mut count = 0;
        for entry in self.db.iterator(IteratorMode::Start) {
            entry.map_err(|err| db_error(&self.path, err))?;
            count += 1;
        }
        Ok(count)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn contains(&self, data_type: &str, path: &str) -> Result<bool> {
        self.has_key(&record_key(data_type, path))
    }

    fn has_key(&self, key: &str) -> Result<bool> {
        self.db
            .get_pinned(key.as_bytes())
            .map(|value| value.is_some())
            .map_err(|err| db_error(&self.path, err))
    }
}

fn record_key(data_type: &str, path: &str) -> String {
    format!("{data_type}/{path}")
}

fn db_error(path: &Path, err: rocksdb::Error) -> CcError {
    CcError::io(
        path,
        std::io::Error::new(std::io::ErrorKind::Other, err.into_string()),
    )
}

/// Reads every record of a day container, ordered by address.
pub fn read_container(path: impl AsRef<Path>) -> Result<Vec<CcfRecord>> {
    let path = path.as_ref();
    let db = DB::open_for_read_only(&Options::default(), path, false)
        .map_err(|err| CcError::storage(path, err))?;

    let mut records = vec![];
    for entry in db.iterator(IteratorMode::Start) {
        let (_, value) = entry.map_err(|err| CcError::storage(path, err))?;
        records.push(bincode::deserialize(&value)?);
    }

    Ok(records)
}

/// Day container path, `{ccf_dir}/{day}.ccf`.
pub fn day_container_path(ccf_dir: impl AsRef<Path>, day: &str) -> PathBuf {
    ccf_dir.as_ref().join(format!("{day}.{CCF_FILE_EXTENSION}"))
}

/// Writes one day's records, creating the container on the first record.
///
/// The database is closed when the writer is dropped.
pub struct DayWriter {
    path: PathBuf,
    container: Option<CcfContainer>,
    written: usize,
}

impl DayWriter {
    pub fn new(ccf_dir: impl AsRef<Path>, day: &str) -> Self {
        DayWriter {
            path: day_container_path(ccf_dir, day),
            container: None,
            written: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records actually written (duplicates excluded).
    pub fn written(&self) -> usize {
        self.written
    }

    fn container(&mut self) -> Result<&mut CcfContainer> {
        let container = match self.container.take() {
            Some(container) => container,
            None => {
                if let Some(dir) = self.path.parent() {
                    std::fs::create_dir_all(dir).map_err(|err| CcError::io(dir, err))?;
                }
                debug!("opening {}", self.path.display());
                CcfContainer::open(&self.path)?
            }
        };
        Ok(self.container.insert(container))
    }
}

impl CcfSink for DayWriter {
    fn append(&mut self, record: CcfRecord) -> Result<()> {
        if self.container()?.append(&record)? {
            self.written += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
fn test_record(data_type: &str, path: &str, fill: f32) -> CcfRecord {
    CcfRecord {
        data_type: data_type.to_string(),
        path: path.to_string(),
        parameters: CcfParameters {
            lon_s: -117.1,
            lat_s: 34.2,
            lon_r: -116.9,
            lat_r: 33.8,
            dt: 0.05,
            maxlag: 0.2,
            npts: 9,
            cc_len: 3600.0,
            step: 1800.0,
            method: CcMethod::Deconv,
            smoothspect_n: 10,
            substack: false,
            substack_len: 14400.0,
            time: vec![1.26e9],
            ngood: vec![4],
            date: String::from("2010_01_01"),
        },
        data: Array2::from_elem((1, 9), fill),
    }
}

#[test]
fn test_container_created_lazily_and_enumerated() {
    let dir = tempfile::tempdir().unwrap();
    let mut writer = DayWriter::new(dir.path().join("CCF"), "2010_01_01");
    let path = writer.path().to_path_buf();
    assert!(!path.exists());

    writer.append(test_record("AAsSTAsZ", "BBsSTBsZ0", 1.0)).unwrap();
    writer.append(test_record("AAsSTAsZ", "BBsSTBsN0", 2.0)).unwrap();
    assert_eq!(writer.written(), 2);
    drop(writer);

    // Ordered by address
    let records = read_container(&path).unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].path, "BBsSTBsN0");
    assert_eq!(records[1], test_record("AAsSTAsZ", "BBsSTBsZ0", 1.0));
}

#[test]
fn test_reopened_container_skips_existing_addresses() {
    let dir = tempfile::tempdir().unwrap();
    let path = day_container_path(dir.path(), "2010_01_01");

    {
        let mut container = CcfContainer::open(&path).unwrap();
        assert!(container.append(&test_record("AAsSTAsZ", "BBsSTBsZ0", 1.0)).unwrap());
        assert!(!container.append(&test_record("AAsSTAsZ", "BBsSTBsZ0", 5.0)).unwrap());
    }

    // Same address in a later run is left alone, a new one is added
    let mut container = CcfContainer::open(&path).unwrap();
    assert!(container.contains("AAsSTAsZ", "BBsSTBsZ0").unwrap());
    assert!(!container.append(&test_record("AAsSTAsZ", "BBsSTBsZ0", 9.0)).unwrap());
    assert!(container.append(&test_record("AAsSTAsZ", "BBsSTBsZ1", 3.0)).unwrap());
    assert_eq!(container.len().unwrap(), 2);
    drop(container);

    let records = read_container(&path).unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].data[[0, 0]], 1.0);
}

#[test]
fn test_damaged_record_does_not_block_later_appends() {
    let dir = tempfile::tempdir().unwrap();
    let path = day_container_path(dir.path(), "2010_01_01");

    // A run that died halfway through writing a value
    {
        let mut container = CcfContainer::open(&path).unwrap();
        assert!(container.append(&test_record("AAsSTAsZ", "BBsSTBsZ0", 1.0)).unwrap());
        drop(container);
        let db = DB::open_default(&path).unwrap();
        db.put(b"AAsSTAsZ/BBsSTBsN0", &[7_u8; 5]).unwrap();
    }

    let mut writer = DayWriter::new(dir.path(), "2010_01_01");
    writer.append(test_record("AAsSTAsZ", "BBsSTBsZ1", 3.0)).unwrap();
    writer.append(test_record("AAsSTAsZ", "BBsSTBsN0", 2.0)).unwrap();
    assert_eq!(writer.written(), 1);
    drop(writer);

    let container = CcfContainer::open(&path).unwrap();
    assert!(container.contains("AAsSTAsZ", "BBsSTBsZ1").unwrap());
    assert_eq!(container.len().unwrap(), 3);
    drop(container);
    assert!(matches!(read_container(&path), Err(CcError::Encoding(_))));
}

#[test]
fn test_unwritable_location_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("CCF");
    std::fs::write(&blocker, b"not a directory").unwrap();

    let mut writer = DayWriter::new(&blocker, "2010_01_01");
    let err = writer
        .append(test_record("AAsSTAsZ", "BBsSTBsZ0", 1.0))
        .unwrap_err();
    assert!(matches!(err, CcError::Io { .. }));
}

#[test]
fn test_container_path_taken_by_file_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = day_container_path(dir.path(), "2010_01_01");
    std::fs::write(&path, b"left over").unwrap();

    assert!(matches!(CcfContainer::open(&path), Err(CcError::Io { .. })));
}
