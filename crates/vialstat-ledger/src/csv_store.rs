//! CSV file store in the experiment directory
//!
//! Layout: `<root>/<log dir>/vial<N>_<suffix>.txt`, one record per line,
//! newest last. Files get a header line on creation; header and label lines
//! are skipped on read.

use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use vialstat_common::{LogKind, Record, SelectionParams, StoreError, VialId, NUM_VIALS};

use crate::codec::{
    decode_row, decode_selection_params, decode_steps, encode_row, encode_selection_params,
    is_header_line,
};
use crate::store::{check_order, check_vial, VialStore};
use crate::{SELECTION_CONTROL_DIR, SELECTION_STEPS_DIR};

/// Bytes read per backwards step when tailing a log
const TAIL_CHUNK: u64 = 4096;

/// File-backed vial store
#[derive(Debug)]
pub struct CsvVialStore {
    /// Experiment directory
    root: PathBuf,
    /// Serializes appends within this process
    append_lock: Mutex<()>,
}

impl CsvVialStore {
    /// Open a store rooted at an existing or new experiment directory
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        for kind in LogKind::ALL {
            let dir = root.join(kind.dir());
            fs::create_dir_all(&dir).map_err(|e| io_error(&dir, e))?;
        }
        for dir in [SELECTION_CONTROL_DIR, SELECTION_STEPS_DIR] {
            let dir = root.join(dir);
            fs::create_dir_all(&dir).map_err(|e| io_error(&dir, e))?;
        }

        info!(root = %root.display(), "Opened experiment store");
        Ok(Self {
            root,
            append_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of a vial's log file
    pub fn log_path(&self, kind: LogKind, vial: VialId) -> PathBuf {
        self.root
            .join(kind.dir())
            .join(format!("vial{}_{}.txt", vial, kind.suffix()))
    }

    fn control_path(&self, vial: VialId) -> PathBuf {
        self.root
            .join(SELECTION_CONTROL_DIR)
            .join(format!("vial{}_{}.txt", vial, SELECTION_CONTROL_DIR))
    }

    fn steps_path(&self, vial: VialId) -> PathBuf {
        self.root
            .join(SELECTION_STEPS_DIR)
            .join(format!("vial{}_{}.txt", vial, SELECTION_STEPS_DIR))
    }

    /// Write a vial's selection-control table, replacing any previous one
    pub fn write_selection_params(
        &self,
        vial: VialId,
        params: &SelectionParams,
    ) -> Result<(), StoreError> {
        check_vial(vial)?;
        let path = self.control_path(vial);
        let text = encode_selection_params(params)?;
        fs::write(&path, text).map_err(|e| io_error(&path, e))
    }

    /// Append a selection step sequence; the newest line is the active one
    pub fn write_selection_steps(&self, vial: VialId, steps: &[f64]) -> Result<(), StoreError> {
        check_vial(vial)?;
        let path = self.steps_path(vial);
        let line = steps
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| io_error(&path, e))?;
        writeln!(file, "{line}").map_err(|e| io_error(&path, e))
    }

    /// Data lines of a log, oldest first
    fn data_lines(path: &Path) -> Result<Vec<String>, StoreError> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(path, e)),
        };

        let mut lines = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|e| io_error(path, e))?;
            if !line.trim().is_empty() && !is_header_line(&line) {
                lines.push(line);
            }
        }
        Ok(lines)
    }

    /// The newest `n` data lines of a log, read backwards from the end
    fn tail_lines(path: &Path, n: usize) -> Result<Vec<String>, StoreError> {
        if n == 0 {
            return Ok(Vec::new());
        }

        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(path, e)),
        };
        let len = file.metadata().map_err(|e| io_error(path, e))?.len();

        // Grow the window until it holds n complete lines or the whole file
        let mut start = len;
        let mut buf: Vec<u8> = Vec::new();
        loop {
            let step = TAIL_CHUNK.min(start);
            start -= step;

            let mut chunk = vec![0u8; step as usize];
            file.seek(SeekFrom::Start(start))
                .map_err(|e| io_error(path, e))?;
            file.read_exact(&mut chunk).map_err(|e| io_error(path, e))?;
            chunk.extend_from_slice(&buf);
            buf = chunk;

            let newlines = buf.iter().filter(|&&b| b == b'\n').count();
            if start == 0 || newlines > n + 1 {
                break;
            }
        }

        let text = String::from_utf8_lossy(&buf);
        let mut lines: Vec<&str> = text.lines().collect();
        // The first line is partial unless the window reached the file start
        if start > 0 && !lines.is_empty() {
            lines.remove(0);
        }

        let data: Vec<String> = lines
            .into_iter()
            .filter(|line| !line.trim().is_empty() && !is_header_line(line))
            .map(str::to_string)
            .collect();
        let skip = data.len().saturating_sub(n);
        Ok(data.into_iter().skip(skip).collect())
    }
}

impl VialStore for CsvVialStore {
    fn read_last<R: Record>(&self, vial: VialId, n: usize) -> Result<Vec<R>, StoreError> {
        check_vial(vial)?;
        Self::tail_lines(&self.log_path(R::KIND, vial), n)?
            .iter()
            .map(|line| decode_row::<R>(vial, line))
            .collect()
    }

    fn read_all<R: Record>(&self, vial: VialId) -> Result<Vec<R>, StoreError> {
        check_vial(vial)?;
        Self::data_lines(&self.log_path(R::KIND, vial))?
            .iter()
            .map(|line| decode_row::<R>(vial, line))
            .collect()
    }

    fn count<R: Record>(&self, vial: VialId) -> Result<usize, StoreError> {
        check_vial(vial)?;
        Ok(Self::data_lines(&self.log_path(R::KIND, vial))?.len())
    }

    fn append<R: Record>(&self, vial: VialId, record: &R) -> Result<(), StoreError> {
        check_vial(vial)?;
        let _guard = self.append_lock.lock();

        let last = self.last::<R>(vial)?;
        check_order(vial, last.as_ref(), record)?;

        let path = self.log_path(R::KIND, vial);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| io_error(&path, e))?;

        let is_new = file.metadata().map_err(|e| io_error(&path, e))?.len() == 0;
        if is_new {
            writeln!(file, "{}", R::KIND.header()).map_err(|e| io_error(&path, e))?;
        }

        let row = encode_row(record)?;
        writeln!(file, "{row}").map_err(|e| io_error(&path, e))?;
        debug!(vial, log = %R::KIND, row = %row, "Record appended");
        Ok(())
    }

    fn selection_params(&self, vial: VialId) -> Result<Option<SelectionParams>, StoreError> {
        check_vial(vial)?;
        let path = self.control_path(vial);
        match fs::read_to_string(&path) {
            Ok(text) => decode_selection_params(vial, &text),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(&path, e)),
        }
    }

    fn selection_steps(&self, vial: VialId) -> Result<Option<Vec<f64>>, StoreError> {
        check_vial(vial)?;
        let path = self.steps_path(vial);
        match fs::read_to_string(&path) {
            Ok(text) => decode_steps(vial, &text),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(&path, e)),
        }
    }
}

fn io_error(path: &Path, source: io::Error) -> StoreError {
    StoreError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Vials that have an OD log in the experiment directory
pub fn vials_with_data(store: &CsvVialStore) -> Vec<VialId> {
    (0..NUM_VIALS)
        .filter(|&vial| store.log_path(LogKind::Od, vial).exists())
        .collect()
}
