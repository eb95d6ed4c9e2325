//! Frame persistence sinks.
//!
//! [`FrameStore`] writes frames into a session directory with a
//! monotonically increasing file counter, so nothing saved earlier in the
//! session is ever overwritten. Three encodings mirror the formats the rig
//! has always produced: an 8-bit raster rescaled to full range, a 16-bit
//! raster with the samples as captured, and a binary archive of the whole
//! frame including metadata.
//!
//! [`MemorySink`] records saves without touching the filesystem, for tests
//! and dry runs.

use crate::config::StorageSettings;
use crate::core::{Frame, PersistenceSink, SaveFormat};
use crate::error::AppResult;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use log::info;
use std::collections::HashSet;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

/// Directory-backed persistence sink.
pub struct FrameStore {
    dir: PathBuf,
    prefix: String,
    counter: u64,
}

impl FrameStore {
    /// Create the sink, creating the target directory if needed.
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> AppResult<Self> {
        let dir = dir.into();
        if !dir.exists() {
            std::fs::create_dir_all(&dir)?;
        }
        info!("Frame store initialized at '{}'", dir.display());
        Ok(Self {
            dir,
            prefix: prefix.into(),
            counter: 0,
        })
    }

    /// Create the sink from storage settings.
    pub fn from_settings(settings: &StorageSettings) -> AppResult<Self> {
        Self::new(settings.default_path.clone(), settings.file_prefix.clone())
    }

    /// Number of frames saved so far in this session.
    pub fn saved_count(&self) -> u64 {
        self.counter
    }

    fn file_name(&self, label: &str, format: SaveFormat) -> String {
        if label.is_empty() {
            format!(
                "{}_{:04}.{}",
                self.prefix,
                self.counter,
                format.extension()
            )
        } else {
            format!(
                "{}_{:04}_{}.{}",
                self.prefix,
                self.counter,
                label,
                format.extension()
            )
        }
    }
}

#[async_trait]
impl PersistenceSink for FrameStore {
    async fn save(&mut self, frame: &Frame, label: &str, format: SaveFormat) -> Result<PathBuf> {
        let path = self.dir.join(self.file_name(label, format));
        let mut file = File::create(&path)
            .with_context(|| format!("Failed to create '{}'", path.display()))?;

        match format {
            SaveFormat::Raster8 => {
                // Rescale to full 8-bit range by the frame peak, truncating,
                // as the rig has always written its 8-bit rasters.
                let max = frame.max_pixel();
                let scaled: Vec<u8> = if max == 0 {
                    vec![0; frame.data.len()]
                } else {
                    frame
                        .data
                        .iter()
                        .map(|&px| (f64::from(px) * 255.0 / f64::from(max)) as u8)
                        .collect()
                };
                write!(file, "P5\n{} {}\n255\n", frame.width, frame.height)?;
                file.write_all(&scaled)?;
            }
            SaveFormat::Raster16 => {
                write!(file, "P5\n{} {}\n65535\n", frame.width, frame.height)?;
                for &px in &frame.data {
                    file.write_all(&px.to_be_bytes())?;
                }
            }
            SaveFormat::Archive => {
                let bytes = bincode::serialize(frame).context("Failed to encode frame")?;
                file.write_all(&bytes)?;
            }
        }

        file.flush()?;
        self.counter += 1;
        Ok(path)
    }
}

/// A record of one save accepted by [`MemorySink`].
#[derive(Clone, Debug)]
pub struct SavedFrame {
    /// Label the frame was saved under.
    pub label: String,
    /// The frame's capture sequence number.
    pub sequence: u64,
    /// Requested encoding.
    pub format: SaveFormat,
}

/// In-memory sink for tests: records saves, optionally failing chosen
/// labels to exercise persistence-failure paths.
#[derive(Default)]
pub struct MemorySink {
    saves: Vec<SavedFrame>,
    counter: u64,
    fail_labels: HashSet<String>,
}

impl MemorySink {
    /// Empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make saves under this label fail.
    pub fn failing_for_label(mut self, label: impl Into<String>) -> Self {
        self.fail_labels.insert(label.into());
        self
    }

    /// Saves accepted so far, in order.
    pub fn saved(&self) -> &[SavedFrame] {
        &self.saves
    }

    /// Labels accepted so far, in order.
    pub fn saved_labels(&self) -> Vec<String> {
        self.saves.iter().map(|s| s.label.clone()).collect()
    }
}

#[async_trait]
impl PersistenceSink for MemorySink {
    async fn save(&mut self, frame: &Frame, label: &str, format: SaveFormat) -> Result<PathBuf> {
        if self.fail_labels.contains(label) {
            bail!("injected persistence failure for '{label}'");
        }
        self.saves.push(SavedFrame {
            label: label.to_string(),
            sequence: frame.sequence,
            format,
        });
        let path = PathBuf::from(format!("mem/{:04}_{label}", self.counter));
        self.counter += 1;
        Ok(path)
    }
}
