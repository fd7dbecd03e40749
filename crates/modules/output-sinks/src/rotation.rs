//! Time based file rotation.
//!
//! Output goes to `<dir>/lightmon.log.<%Y%m%d%H%M>`, where the suffix is the
//! start of the current rotation period. When a new period starts a new file
//! is opened and the oldest files are deleted, keeping at most `max_files`.

use std::{
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    time::Duration,
};

use chrono::{DateTime, Local};

use crate::SinkError;

pub const LOG_FILE_PREFIX: &str = "lightmon.log.";
pub const DEFAULT_ROTATION_PERIOD: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_MAX_FILES: usize = 8;

const SUFFIX_FORMAT: &str = "%Y%m%d%H%M";

struct CurrentFile {
    period_start: i64,
    path: PathBuf,
    file: File,
}

pub struct RotatingFileWriter {
    dir: PathBuf,
    period_secs: i64,
    max_files: usize,
    current: Option<CurrentFile>,
}

impl RotatingFileWriter {
    /// Hourly rotation, keeping [`DEFAULT_MAX_FILES`] files.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, SinkError> {
        Self::with_rotation(dir, DEFAULT_ROTATION_PERIOD, DEFAULT_MAX_FILES)
    }

    /// Errors if `period` is shorter than a minute, the resolution of file
    /// names, or if `max_files == 0`. The directory is created if missing.
    pub fn with_rotation(
        dir: impl AsRef<Path>,
        period: Duration,
        max_files: usize,
    ) -> Result<Self, SinkError> {
        if period < Duration::from_secs(60) {
            return Err(SinkError::ZeroPeriod);
        }
        if max_files == 0 {
            return Err(SinkError::ZeroFiles);
        }

        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .map_err(|_| SinkError::InvalidDirectory(dir.display().to_string()))?;

        Ok(Self {
            dir,
            period_secs: period.as_secs() as i64,
            max_files,
            current: None,
        })
    }

    /// The file being written, if anything was written yet.
    pub fn current_path(&self) -> Option<&Path> {
        self.current.as_ref().map(|current| current.path.as_path())
    }

    /// Writes `buf` in the file of the period `now` falls in.
    pub fn write_at(&mut self, now: DateTime<Local>, buf: &[u8]) -> io::Result<()> {
        let period_start = now.timestamp().div_euclid(self.period_secs) * self.period_secs;
        if self
            .current
            .as_ref()
            .is_none_or(|current| current.period_start != period_start)
        {
            self.rotate(period_start)?;
        }

        match &mut self.current {
            Some(current) => current.file.write_all(buf),
            None => Err(io::Error::from(io::ErrorKind::NotConnected)),
        }
    }

    fn rotate(&mut self, period_start: i64) -> io::Result<()> {
        // a failed rotation leaves no file open, the next write retries
        self.current = None;

        let path = self.path_for(period_start)?;
        log::debug!("rotating output to {}", path.display());
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        self.current = Some(CurrentFile {
            period_start,
            path,
            file,
        });

        self.prune();
        Ok(())
    }

    fn path_for(&self, period_start: i64) -> io::Result<PathBuf> {
        let start = DateTime::from_timestamp(period_start, 0)
            .ok_or_else(|| io::Error::other(format!("invalid timestamp {period_start}")))?
            .with_timezone(&Local);
        Ok(self
            .dir
            .join(format!("{LOG_FILE_PREFIX}{}", start.format(SUFFIX_FORMAT))))
    }

    /// Deletes the oldest log files beyond `max_files`. Failures are only logged,
    /// output goes on anyway.
    fn prune(&self) {
        let pattern = format!(
            "{}/{LOG_FILE_PREFIX}*",
            glob::Pattern::escape(&self.dir.to_string_lossy())
        );
        let mut files: Vec<PathBuf> = match glob::glob(&pattern) {
            Ok(paths) => paths.flatten().filter(|path| path.is_file()).collect(),
            Err(err) => {
                log::warn!("listing log files in {} failed: {err}", self.dir.display());
                return;
            }
        };
        if files.len() <= self.max_files {
            return;
        }

        // suffixes are zero padded timestamps, so names sort by age
        files.sort();
        let excess = files.len() - self.max_files;
        for path in &files[..excess] {
            if self.current_path() == Some(path.as_path()) {
                continue;
            }
            if let Err(err) = fs::remove_file(path) {
                log::warn!("removing old log file {} failed: {err}", path.display());
            }
        }
    }
}

impl Write for RotatingFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_at(Local::now(), buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.current {
            Some(current) => current.file.flush(),
            None => Ok(()),
        }
    }
}
