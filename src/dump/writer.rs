//! # Dump Writer
//!
//! Rotation-capable writer for diagnostic snapshots of the live flow table.
//!
//! Each snapshot is framed as:
//!
//! ```text
//! Stats Dump Started: <timestamp>
//! Number of Entries: <n>
//! <one line per record>
//! Stats Dump Completed: <timestamp>
//! ```
//!
//! Rotated files sit next to the active file as `<name>.<timestamp>`, gzipped
//! to `<name>.<timestamp>.gz` when compression is enabled.

use std::fmt::Display;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::Utc;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::{info, warn};

use crate::config::{DumpConfig, RotationPolicy};
use crate::error::FlowError;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

pub struct DumpWriter {
    config: DumpConfig,
    dir: PathBuf,
    file_name: String,
    current: Option<DumpFile>,
}

struct DumpFile {
    writer: BufWriter<File>,
    created_at: SystemTime,
    bytes_written: u64,
    dumps_written: u64,
}

/// Statistics for the active dump file
#[derive(Debug, Clone)]
pub struct DumpStats {
    pub path: PathBuf,
    pub bytes_written: u64,
    pub dumps_written: u64,
    pub created_at: SystemTime,
}

impl DumpWriter {
    /// Creates the parent directory and opens (appends to) the dump file.
    pub fn new(config: DumpConfig) -> Result<Self, FlowError> {
        let file_name = config
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .ok_or_else(|| FlowError::Config(format!("dump path {:?} has no file name", config.path)))?;
        let dir = match config.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        fs::create_dir_all(&dir)
            .map_err(|e| FlowError::Config(format!("failed to create dump directory {:?}: {}", dir, e)))?;

        let mut writer = DumpWriter {
            config,
            dir,
            file_name,
            current: None,
        };
        writer
            .open()
            .map_err(|e| FlowError::Config(format!("failed to open dump file {:?}: {}", writer.config.path, e)))?;

        Ok(writer)
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Writes one framed snapshot, flushes, and rotates if the policy says so.
    /// Returns the number of entries written.
    pub fn write_snapshot<I>(&mut self, entries: I) -> Result<usize, FlowError>
    where
        I: IntoIterator,
        I::IntoIter: ExactSizeIterator,
        I::Item: Display,
    {
        let entries = entries.into_iter();
        let total = entries.len();
        let limit = self.config.max_entries;

        let mut buf = String::new();
        buf.push_str(&format!("Stats Dump Started: {}\n", Utc::now().format(TIMESTAMP_FORMAT)));
        buf.push_str(&format!("Number of Entries: {}\n", total));
        let mut written = 0;
        for entry in entries.take(limit) {
            buf.push_str(&format!("{}\n", entry));
            written += 1;
        }
        if total > written {
            buf.push_str(&format!("... {} more entries omitted\n", total - written));
        }
        buf.push_str(&format!("Stats Dump Completed: {}\n", Utc::now().format(TIMESTAMP_FORMAT)));

        if self.current.is_none() {
            self.open()?;
        }
        if let Some(file) = self.current.as_mut() {
            file.writer.write_all(buf.as_bytes())?;
            file.writer.flush()?;
            file.bytes_written += buf.len() as u64;
            file.dumps_written += 1;
        }

        if self.should_rotate() {
            self.rotate()?;
        }

        Ok(written)
    }

    /// Flush pending writes
    pub fn flush(&mut self) -> Result<(), FlowError> {
        if let Some(file) = self.current.as_mut() {
            file.writer.flush()?;
        }
        Ok(())
    }

    pub fn stats(&self) -> Option<DumpStats> {
        self.current.as_ref().map(|file| DumpStats {
            path: self.config.path.clone(),
            bytes_written: file.bytes_written,
            dumps_written: file.dumps_written,
            created_at: file.created_at,
        })
    }

    fn should_rotate(&self) -> bool {
        let Some(file) = self.current.as_ref() else {
            return false;
        };
        match self.config.rotation {
            RotationPolicy::BySize(max_bytes) => file.bytes_written >= max_bytes,
            RotationPolicy::ByTime(seconds) => {
                let elapsed = SystemTime::now()
                    .duration_since(file.created_at)
                    .unwrap_or_default()
                    .as_secs();
                elapsed >= seconds
            }
            RotationPolicy::Never => false,
        }
    }

    fn open(&mut self) -> io::Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.config.path)?;
        let bytes_written = file.metadata().map(|m| m.len()).unwrap_or(0);

        self.current = Some(DumpFile {
            writer: BufWriter::new(file),
            created_at: SystemTime::now(),
            bytes_written,
            dumps_written: 0,
        });
        Ok(())
    }

    fn rotate(&mut self) -> Result<(), FlowError> {
        if let Some(mut old) = self.current.take() {
            old.writer.flush()?;
            drop(old);

            let rotated = self.rotated_path();
            fs::rename(&self.config.path, &rotated)?;
            info!("Rotated stats dump to {:?}", rotated);

            if self.config.compress_rotated {
                if let Err(e) = compress_file(&rotated) {
                    warn!("Failed to compress rotated dump {:?}: {}", rotated, e);
                }
            }

            self.cleanup_old_files()?;
        }

        self.open()?;
        Ok(())
    }

    fn rotated_path(&self) -> PathBuf {
        let stamp = Utc::now().format("%Y%m%d%H%M%S%3f");
        let mut candidate = self.dir.join(format!("{}.{}", self.file_name, stamp));
        let mut n = 1;
        while candidate.exists() || gz_path(&candidate).exists() {
            candidate = self.dir.join(format!("{}.{}-{}", self.file_name, stamp, n));
            n += 1;
        }
        candidate
    }

    fn cleanup_old_files(&self) -> Result<(), FlowError> {
        let rotated = self.rotated_files();
        if rotated.len() > self.config.max_rotated_files {
            for path in &rotated[self.config.max_rotated_files..] {
                fs::remove_file(path).ok();
            }
        }
        Ok(())
    }

    /// Rotated files currently kept beside the active dump, newest first.
    pub fn rotated_files(&self) -> Vec<PathBuf> {
        let prefix = format!("{}.", self.file_name);
        let mut rotated: Vec<PathBuf> = fs::read_dir(&self.dir)
            .map(|dir| {
                dir.filter_map(|entry| entry.ok())
                    .map(|entry| entry.path())
                    .filter(|path| {
                        path.file_name()
                            .and_then(|n| n.to_str())
                            .map(|name| name.starts_with(&prefix))
                            .unwrap_or(false)
                    })
                    .collect()
            })
            .unwrap_or_default();
        // Timestamped names sort oldest first.
        rotated.sort();
        rotated.reverse();
        rotated
    }
}

fn gz_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".gz");
    PathBuf::from(name)
}

/// Gzips `path` to `<path>.gz` and removes the original.
fn compress_file(path: &Path) -> io::Result<()> {
    let input = fs::read(path)?;
    let output = File::create(gz_path(path))?;

    let mut encoder = GzEncoder::new(output, Compression::default());
    encoder.write_all(&input)?;
    encoder.finish()?;

    fs::remove_file(path).ok();
    Ok(())
}
