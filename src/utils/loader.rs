use crate::constants::*;
use crate::error::{CcError, Result};
use crate::utils::div_ceil;
use crate::{ChannelIndex, FloatType, Spectra, Timestamp};
use glob::glob;
use log::{debug, info, warn};
use ndarray::{arr1, s, Array1, Array2};
use ndarray_npy::{NpzReader, NpzWriter};
use num_complex::Complex;
use std::collections::BTreeMap;
use std::fs::File;
use std::ops::Range;
use std::path::{Path, PathBuf};

/// Array holding `[longitude, latitude]` in every station file.
const COORDINATES: &str = "coordinates";
const SPECTRA: &str = "spectra";
const STD: &str = "std";
const TIMESTAMPS: &str = "timestamps";
/// Array holding `[nfft, nseg]` for one component and day.
const LAYOUT: &str = "layout";

/// Identity and position of one station.
#[derive(Debug, Clone, PartialEq)]
pub struct StationInfo {
    pub network: String,
    pub station: String,
    pub longitude: f64,
    pub latitude: f64,
}

impl StationInfo {
    /// Address label of one of this station's channels, e.g. `CIsSDDsZ`.
    pub fn channel_label(&self, component: &str) -> String {
        format!("{}s{}s{}", self.network, self.station, component)
    }
}

/// Spectra, amplitude statistics and start times of one channel's segments.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelData {
    /// (segments, nfft / 2)
    pub spectra: Spectra,
    /// Max absolute amplitude over std, one per segment.
    pub stats: Array1<FloatType>,
    pub timestamps: Array1<Timestamp>,
}

/// Everything loaded for one day and one load chunk. Dropping it releases the spectra.
#[derive(Debug)]
pub struct FftChunk {
    pub index: usize,
    pub stations: Vec<StationInfo>,
    ncomp: usize,
    channels: Vec<Option<ChannelData>>,
}

impl FftChunk {
    /// `channels` holds `ncomp` entries per station, station-major.
    pub fn new(
        index: usize,
        stations: Vec<StationInfo>,
        ncomp: usize,
        channels: Vec<Option<ChannelData>>,
    ) -> Result<FftChunk> {
        if channels.len() != stations.len() * ncomp {
            return Err(CcError::configuration(format!(
                "{} channels for {} stations x {ncomp} components",
                channels.len(),
                stations.len()
            )));
        }
        Ok(FftChunk {
            index,
            stations,
            ncomp,
            channels,
        })
    }

    pub fn nsta(&self) -> usize {
        self.stations.len()
    }

    pub fn channel_index(&self, station: usize, component: usize) -> ChannelIndex {
        station * self.ncomp + component
    }

    /// Data of a channel, `None` when the station has nothing for this component and day.
    pub fn channel(&self, index: ChannelIndex) -> Option<&ChannelData> {
        self.channels.get(index).and_then(Option::as_ref)
    }
}

/// Shape of the spectral data shared by every station and day.
#[derive(Debug, Clone, PartialEq)]
pub struct DataLayout {
    /// Transform length of each segment.
    pub nfft: usize,
    /// Segments per day.
    pub nseg: usize,
    pub nsta: usize,
    /// Component labels, in `COMPONENTS` order.
    pub components: Vec<&'static str>,
}

impl DataLayout {
    /// Reads the transform length and segment count from the first group/path of the first
    /// station file that has any, and checks that the sampled stations agree on the number
    /// of components.
    pub fn detect(files: &[PathBuf]) -> Result<DataLayout> {
        if files.is_empty() {
            return Err(CcError::unavailable("no station files to read the layout from"));
        }

        let mut found: Option<(usize, usize, Vec<String>)> = None;
        let mut component_counts: Vec<(&PathBuf, usize)> = vec![];
        for path in files.iter().take(LAYOUT_CANDIDATES) {
            let mut file = SpectralFile::open(path)?;
            let groups = file.groups()?;
            if groups.is_empty() {
                warn!("{} holds no spectra", path.display());
                continue;
            }
            component_counts.push((path, groups.len()));

            if found.is_none() {
                if let Some((component, days)) = groups.iter().find(|(_, days)| !days.is_empty()) {
                    let (nfft, nseg) = file.layout(component, &days[0])?;
                    found = Some((nfft, nseg, groups.keys().cloned().collect()));
                }
            }
        }

        let (nfft, nseg, labels) = found.ok_or_else(|| {
            CcError::unavailable(format!(
                "none of the first {} station files holds spectra",
                LAYOUT_CANDIDATES.min(files.len())
            ))
        })?;

        for (path, count) in component_counts {
            if count != labels.len() {
                return Err(CcError::configuration(format!(
                    "{} has {count} components, expected {}",
                    path.display(),
                    labels.len()
                )));
            }
        }
        if nfft < 4 || nfft % 2 != 0 || nseg == 0 {
            return Err(CcError::configuration(format!(
                "unusable layout: nfft = {nfft}, nseg = {nseg}"
            )));
        }

        let layout = DataLayout {
            nfft,
            nseg,
            nsta: files.len(),
            components: component_table(&labels)?,
        };
        info!(
            "layout: {} stations x {} components, nfft = {}, nseg = {}",
            layout.nsta,
            layout.ncomp(),
            layout.nfft,
            layout.nseg
        );
        Ok(layout)
    }

    pub fn nfft2(&self) -> usize {
        self.nfft / 2
    }

    pub fn ncomp(&self) -> usize {
        self.components.len()
    }

    pub fn ntrace(&self) -> usize {
        self.nsta * self.ncomp()
    }

    pub fn component_index(&self, label: &str) -> Option<usize> {
        self.components.iter().position(|&c| c == label)
    }
}

/// Maps group names to the fixed component table, ordered by table position.
fn component_table(labels: &[String]) -> Result<Vec<&'static str>> {
    if labels.is_empty() || labels.len() > COMPONENTS.len() {
        return Err(CcError::configuration(format!(
            "expected between 1 and {} components, found {}",
            COMPONENTS.len(),
            labels.len()
        )));
    }
    let mut positions = labels
        .iter()
        .map(|label| {
            COMPONENTS
                .iter()
                .position(|&c| c == label)
                .ok_or_else(|| CcError::configuration(format!("unknown component {label}")))
        })
        .collect::<Result<Vec<usize>>>()?;
    positions.sort_unstable();
    positions.dedup();
    Ok(positions.into_iter().map(|p| COMPONENTS[p]).collect())
}

/// How a day's segments are split so that one chunk fits the memory budget.
///
/// The budget covers the chunk that is kept. Station files store each channel-day as one
/// npz array, so every chunk re-reads the full channel-day and slices it: reading a day
/// costs `num_load` passes over the files, and one full channel-day is held briefly on
/// top of the chunk while it is sliced.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct ChunkPlan {
    pub num_load: usize,
    pub nseg_per_load: usize,
    /// Estimated bytes to hold every channel's full day at once.
    pub total_bytes: f64,
}

impl ChunkPlan {
    pub fn new(layout: &DataLayout, max_mem_bytes: f64) -> ChunkPlan {
        let per_segment = (layout.ntrace() * layout.nfft2() * BYTES_PER_COMPLEX) as f64;
        let total_bytes = per_segment * layout.nseg as f64;

        if total_bytes <= max_mem_bytes {
            return ChunkPlan {
                num_load: 1,
                nseg_per_load: layout.nseg,
                total_bytes,
            };
        }

        // Equal chunks; the last one may be shorter
        let num_load = ((total_bytes / max_mem_bytes).ceil() as usize).clamp(1, layout.nseg);
        let nseg_per_load = div_ceil(layout.nseg, num_load);
        let num_load = div_ceil(layout.nseg, nseg_per_load);

        info!(
            "{:.2} GB exceeds the {:.2} GB budget, loading {num_load} chunks of {nseg_per_load} segments",
            total_bytes / BYTES_PER_GB,
            max_mem_bytes / BYTES_PER_GB
        );
        if nseg_per_load as f64 * per_segment > max_mem_bytes {
            warn!("a single segment across all stations does not fit the memory budget");
        }

        ChunkPlan {
            num_load,
            nseg_per_load,
            total_bytes,
        }
    }

    /// Segment rows belonging to `chunk`.
    pub fn rows(&self, chunk: usize, nseg: usize) -> Range<usize> {
        let start = (chunk * self.nseg_per_load).min(nseg);
        start..(start + self.nseg_per_load).min(nseg)
    }
}

/// Sorted station files in `dir`. Station indices follow this order.
pub fn discover_station_files(dir: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
    let pattern = dir
        .as_ref()
        .join(format!("*.{STATION_FILE_EXTENSION}"))
        .display()
        .to_string();
    let mut paths = glob(&pattern)
        .map_err(|err| CcError::configuration(format!("bad pattern {pattern}: {err}")))?
        .filter_map(|entry| match entry {
            Ok(path) => Some(path),
            Err(err) => {
                warn!("skipping unreadable entry: {err}");
                None
            }
        })
        .collect::<Vec<PathBuf>>();
    paths.sort();

    if paths.is_empty() {
        return Err(CcError::unavailable(format!(
            "no spectral data in {}",
            dir.as_ref().display()
        )));
    }
    info!("found {} station files in {}", paths.len(), dir.as_ref().display());
    Ok(paths)
}

/// Loads rows `plan.rows(chunk)` of every channel for `day`.
pub fn load_chunk(
    day: &str,
    chunk: usize,
    layout: &DataLayout,
    plan: &ChunkPlan,
    files: &[PathBuf],
) -> Result<FftChunk> {
    let rows = plan.rows(chunk, layout.nseg);
    let ncomp = layout.ncomp();

    let mut stations = Vec::with_capacity(files.len());
    let mut channels: Vec<Option<ChannelData>> =
        (0..files.len() * ncomp).map(|_| None).collect();

    for (ista, path) in files.iter().enumerate() {
        let mut file = SpectralFile::open(path)?;
        stations.push(file.station_info()?);

        for (label, days) in file.groups()? {
            let icomp = match layout.component_index(&label) {
                Some(icomp) => icomp,
                None => {
                    warn!("{}: ignoring component {label}", path.display());
                    continue;
                }
            };
            if !days.iter().any(|d| d == day) {
                continue;
            }
            channels[ista * ncomp + icomp] =
                Some(file.read_day(&label, day, layout, rows.clone())?);
        }
    }

    let valid = channels.iter().filter(|c| c.is_some()).count();
    if valid == 0 {
        return Err(CcError::unavailable(format!("no spectra for {day}")));
    }
    debug!(
        "{day} chunk {chunk}: segments {:?}, {valid}/{} channels with data",
        rows,
        channels.len()
    );

    FftChunk::new(chunk, stations, ncomp, channels)
}

/// Read access to one station's spectral file (`NET.STA.npz`).
///
/// Arrays are named `coordinates` and `{component}/{day}/{spectra|std|timestamps|layout}`.
pub struct SpectralFile {
    path: PathBuf,
    npz: NpzReader<File>,
}

impl SpectralFile {
    pub fn open(path: impl AsRef<Path>) -> Result<SpectralFile> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|err| CcError::storage(&path, err))?;
        let npz = NpzReader::new(file).map_err(|err| CcError::storage(&path, err))?;
        Ok(SpectralFile { path, npz })
    }

    /// Network and station come from the file name, coordinates from the file.
    pub fn station_info(&mut self) -> Result<StationInfo> {
        let stem = self
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let (network, station) = stem.split_once('.').ok_or_else(|| {
            CcError::configuration(format!(
                "station file {} is not named NET.STA.{STATION_FILE_EXTENSION}",
                self.path.display()
            ))
        })?;

        let coordinates: Array1<f64> = self.array(COORDINATES)?;
        if coordinates.len() != 2 {
            return Err(CcError::configuration(format!(
                "{}: coordinates should be [lon, lat]",
                self.path.display()
            )));
        }

        Ok(StationInfo {
            network: network.to_string(),
            station: station.to_string(),
            longitude: coordinates[0],
            latitude: coordinates[1],
        })
    }

    /// Component groups and, for each, the days (paths) recorded under it.
    pub fn groups(&mut self) -> Result<BTreeMap<String, Vec<String>>> {
        let names = self
            .npz
            .names()
            .map_err(|err| CcError::storage(&self.path, err))?;

        let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for name in names {
            let name = name.strip_suffix(".npy").unwrap_or(&name);
            let parts: Vec<&str> = name.split('/').collect();
            if let [component, day, SPECTRA] = parts[..] {
                groups
                    .entry(component.to_string())
                    .or_default()
                    .push(day.to_string());
            }
        }
        groups.values_mut().for_each(|days| days.sort());

        Ok(groups)
    }

    /// `(nfft, nseg)` recorded for one component and day.
    pub fn layout(&mut self, component: &str, day: &str) -> Result<(usize, usize)> {
        let layout: Array1<u64> = self.array(&format!("{component}/{day}/{LAYOUT}"))?;
        match layout.as_slice() {
            Some(&[nfft, nseg]) => Ok((nfft as usize, nseg as usize)),
            _ => Err(CcError::configuration(format!(
                "{}: {component}/{day}/{LAYOUT} should be [nfft, nseg]",
                self.path.display()
            ))),
        }
    }

    /// Reads one component's day and keeps only `rows`. The whole day is decoded first
    /// and dropped once sliced.
    pub fn read_day(
        &mut self,
        component: &str,
        day: &str,
        layout: &DataLayout,
        rows: Range<usize>,
    ) -> Result<ChannelData> {
        let prefix = format!("{component}/{day}");
        let expected = (layout.nfft, layout.nseg);
        if self.layout(component, day)? != expected {
            return Err(CcError::configuration(format!(
                "{}: {prefix} does not match layout nfft = {}, nseg = {}",
                self.path.display(),
                layout.nfft,
                layout.nseg
            )));
        }

        let spectra: Array2<Complex<FloatType>> = self.array(&format!("{prefix}/{SPECTRA}"))?;
        let stats: Array1<FloatType> = self.array(&format!("{prefix}/{STD}"))?;
        let timestamps: Array1<Timestamp> = self.array(&format!("{prefix}/{TIMESTAMPS}"))?;
        if spectra.dim() != (layout.nseg, layout.nfft2())
            || stats.len() != layout.nseg
            || timestamps.len() != layout.nseg
        {
            return Err(CcError::configuration(format!(
                "{}: {prefix} arrays have inconsistent shapes",
                self.path.display()
            )));
        }

        Ok(ChannelData {
            spectra: spectra.slice(s![rows.clone(), ..]).to_owned(),
            stats: stats.slice(s![rows.clone()]).to_owned(),
            timestamps: timestamps.slice(s![rows]).to_owned(),
        })
    }

    fn array<A, D>(&mut self, name: &str) -> Result<ndarray::Array<A, D>>
    where
        A: ndarray_npy::ReadableElement,
        D: ndarray::Dimension,
    {
        self.npz
            .by_name(name)
            .map_err(|err| CcError::storage(&self.path, format!("{name}: {err}")))
    }
}

/// Writes a station file in the layout [`SpectralFile`] reads.
pub struct SpectralFileWriter {
    path: PathBuf,
    npz: NpzWriter<File>,
}

impl SpectralFileWriter {
    pub fn create(path: impl AsRef<Path>, longitude: f64, latitude: f64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path).map_err(|err| CcError::io(&path, err))?;
        let mut writer = SpectralFileWriter {
            path,
            npz: NpzWriter::new(file),
        };
        writer.add(COORDINATES, &arr1(&[longitude, latitude]))?;
        Ok(writer)
    }

    pub fn add_day(
        &mut self,
        component: &str,
        day: &str,
        nfft: usize,
        data: &ChannelData,
    ) -> Result<()> {
        let prefix = format!("{component}/{day}");
        self.add(
            &format!("{prefix}/{LAYOUT}"),
            &arr1(&[nfft as u64, data.spectra.nrows() as u64]),
        )?;
        self.add(&format!("{prefix}/{SPECTRA}"), &data.spectra)?;
        self.add(&format!("{prefix}/{STD}"), &data.stats)?;
        self.add(&format!("{prefix}/{TIMESTAMPS}"), &data.timestamps)
    }

    pub fn finish(self) -> Result<()> {
        let path = self.path;
        self.npz.finish().map(|_| ()).map_err(|err| write_error(&path, err))
    }

    fn add<A, D>(&mut self, name: &str, array: &ndarray::Array<A, D>) -> Result<()>
    where
        A: ndarray_npy::WritableElement,
        D: ndarray::Dimension,
    {
        self.npz
            .add_array(name, array)
            .map_err(|err| write_error(&self.path, err))
    }
}

fn write_error(path: &Path, err: impl std::fmt::Display) -> CcError {
    CcError::io(
        path,
        std::io::Error::new(std::io::ErrorKind::Other, err.to_string()),
    )
}

#[cfg(test)]
fn layout(nsta: usize, ncomp: usize, nfft: usize, nseg: usize) -> DataLayout {
    DataLayout {
        nfft,
        nseg,
        nsta,
        components: COMPONENTS[..ncomp].to_vec(),
    }
}

#[test]
fn test_whole_day_fits() {
    let plan = ChunkPlan::new(&layout(10, 3, 1024, 47), 4.0 * BYTES_PER_GB);
    assert_eq!(plan.num_load, 1);
    assert_eq!(plan.nseg_per_load, 47);
    assert_eq!(plan.total_bytes, (30 * 512 * 47 * 8) as f64);
}

#[test]
fn test_chunk_plan_covers_day_within_budget() {
    for nsta in [1, 7, 40] {
        for nseg in [1, 5, 47, 96] {
            for budget in [1.0e4, 3.3e5, 1.0e6, 2.5e7] {
                let layout = layout(nsta, 3, 512, nseg);
                let plan = ChunkPlan::new(&layout, budget);
                let per_segment = (layout.ntrace() * layout.nfft2() * BYTES_PER_COMPLEX) as f64;

                assert!(plan.num_load * plan.nseg_per_load >= nseg);
                assert!(plan.nseg_per_load >= 1);
                // Within one segment of the budget, unless one segment alone exceeds it
                if per_segment <= budget {
                    assert!(plan.nseg_per_load as f64 * per_segment <= budget + per_segment);
                }
                // No empty trailing chunk
                assert!(!plan.rows(plan.num_load - 1, nseg).is_empty());
            }
        }
    }
}

#[test]
fn test_chunk_count_is_ceiling_of_ratio() {
    // 2 stations x 3 comps x 256 bins x 8 bytes = 12288 bytes per segment, 100 segments
    let plan = ChunkPlan::new(&layout(2, 3, 512, 100), 300_000.0);
    assert_eq!(plan.num_load, 5);
    assert_eq!(plan.nseg_per_load, 20);
    assert_eq!(plan.rows(4, 100), 80..100);
}

#[test]
fn test_component_table_orders_and_validates() {
    let labels = vec![String::from("Z"), String::from("E")];
    assert_eq!(component_table(&labels).unwrap(), vec!["E", "Z"]);

    let labels = vec![String::from("X")];
    assert!(matches!(
        component_table(&labels),
        Err(CcError::Configuration(_))
    ));
}

#[test]
fn test_chunk_read_keeps_only_its_rows() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("XX.STA.npz");
    let day = ChannelData {
        spectra: Array2::from_shape_fn((5, 8), |(i, k)| Complex::new(i as f32, k as f32)),
        stats: Array1::from_shape_fn(5, |i| i as f32 + 1.0),
        timestamps: Array1::from_shape_fn(5, |i| 1.26e9 + 1800.0 * i as f64),
    };
    let mut writer = SpectralFileWriter::create(&path, -117.0, 34.0).unwrap();
    writer.add_day("Z", "2010_01_01", 16, &day).unwrap();
    writer.finish().unwrap();

    let layout = DataLayout {
        nfft: 16,
        nseg: 5,
        nsta: 1,
        components: vec!["Z"],
    };
    // 1 channel x 8 bins x 8 bytes per segment, two segments per chunk
    let plan = ChunkPlan::new(&layout, 128.0);
    assert_eq!((plan.num_load, plan.nseg_per_load), (3, 2));

    let files = vec![path];
    let last = load_chunk("2010_01_01", 2, &layout, &plan, &files).unwrap();
    let channel = last.channel(0).unwrap();
    assert_eq!(last.index, 2);
    assert_eq!(channel.spectra.dim(), (1, 8));
    assert_eq!(channel.spectra[[0, 3]], Complex::new(4.0, 3.0));
    assert_eq!(channel.stats.to_vec(), vec![5.0]);
    assert_eq!(channel.timestamps.to_vec(), vec![1.26e9 + 7200.0]);
    assert_eq!(last.stations[0].station, "STA");
}
