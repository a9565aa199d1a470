//! Per-stream batch staging.
//!
//! Records accumulate in an in-memory batch, keyed by their primary-key
//! tuple when one is declared so that a later record for the same key
//! replaces the earlier one (last-writer-wins within a batch). Sealing
//! the batch writes the rows out as CSV slice files under the scratch
//! directory, optionally compressed, and hands the file paths to the
//! flush task; the writer is immediately ready for the next batch so
//! ingestion never waits on an in-flight load.

use bzip2::write::BzEncoder;
use flate2::write::GzEncoder;
use snafu::prelude::*;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::config::Compression;
use crate::emit;
use crate::error::{CsvEncodeSnafu, StageFileSnafu, StorageError};
use crate::metrics::events::BytesStaged;

/// A sealed batch of stage files ready to load.
#[derive(Debug)]
pub struct StagedBatch {
    pub stream: String,
    pub batch_id: Uuid,
    pub files: Vec<PathBuf>,
    pub rows: usize,
    pub bytes: u64,
    pub extension: &'static str,
}

impl StagedBatch {
    /// Best-effort removal of the local slice files after a successful
    /// load.
    pub fn remove_files(&self) {
        for path in &self.files {
            if let Err(e) = std::fs::remove_file(path) {
                tracing::warn!("Failed to remove stage file {}: {}", path.display(), e);
            }
        }
    }
}

/// Streaming sink for one slice file.
enum SliceSink {
    Plain(BufWriter<File>),
    Gzip(GzEncoder<BufWriter<File>>),
    Bzip2(BzEncoder<BufWriter<File>>),
}

impl SliceSink {
    fn create(path: &Path, compression: Compression) -> std::io::Result<Self> {
        let file = BufWriter::new(File::create(path)?);
        Ok(match compression {
            Compression::None => SliceSink::Plain(file),
            Compression::Gzip => {
                SliceSink::Gzip(GzEncoder::new(file, flate2::Compression::default()))
            }
            Compression::Bzip2 => {
                SliceSink::Bzip2(BzEncoder::new(file, bzip2::Compression::default()))
            }
        })
    }

    /// Finish the compression stream and return the underlying file.
    fn finish(self) -> std::io::Result<File> {
        let buffered = match self {
            SliceSink::Plain(w) => w,
            SliceSink::Gzip(encoder) => encoder.finish()?,
            SliceSink::Bzip2(encoder) => encoder.finish()?,
        };
        buffered.into_inner().map_err(|e| e.into_error())
    }
}

impl Write for SliceSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            SliceSink::Plain(w) => w.write(buf),
            SliceSink::Gzip(w) => w.write(buf),
            SliceSink::Bzip2(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            SliceSink::Plain(w) => w.flush(),
            SliceSink::Gzip(w) => w.flush(),
            SliceSink::Bzip2(w) => w.flush(),
        }
    }
}

/// Batch accumulator and CSV writer for one stream.
pub struct StageWriter {
    stream: String,
    dir: PathBuf,
    compression: Compression,
    slices: usize,
    /// Rows in arrival order; replaced rows leave a tombstone.
    rows: Vec<Option<Vec<String>>>,
    /// Primary-key tuple to row index, for last-writer-wins.
    by_key: HashMap<String, usize>,
    live_rows: usize,
}

impl StageWriter {
    pub fn new(
        stream: impl Into<String>,
        dir: impl Into<PathBuf>,
        compression: Compression,
        slices: usize,
    ) -> Self {
        Self {
            stream: stream.into(),
            dir: dir.into(),
            compression,
            slices: slices.max(1),
            rows: Vec::new(),
            by_key: HashMap::new(),
            live_rows: 0,
        }
    }

    /// Distinct rows staged in the current batch.
    pub fn rows(&self) -> usize {
        self.live_rows
    }

    /// Append one normalized row. When `key` is present and was already
    /// seen in this batch, the new row replaces the old one.
    pub fn append(&mut self, fields: Vec<String>, key: Option<String>) {
        match key {
            Some(key) => {
                if let Some(&index) = self.by_key.get(&key) {
                    self.rows[index] = Some(fields);
                } else {
                    self.by_key.insert(key, self.rows.len());
                    self.rows.push(Some(fields));
                    self.live_rows += 1;
                }
            }
            None => {
                self.rows.push(Some(fields));
                self.live_rows += 1;
            }
        }
    }

    /// Seal the current batch into slice files, if it has any rows.
    pub fn rotate(&mut self) -> Result<Option<StagedBatch>, StorageError> {
        if self.live_rows == 0 {
            self.rows.clear();
            self.by_key.clear();
            return Ok(None);
        }

        let rows = std::mem::take(&mut self.rows);
        self.by_key.clear();
        let live_rows = std::mem::take(&mut self.live_rows);

        std::fs::create_dir_all(&self.dir).context(StageFileSnafu {
            path: self.dir.display().to_string(),
        })?;

        let batch_id = Uuid::new_v4();
        let mut writers = Vec::with_capacity(self.slices);
        let mut paths = Vec::with_capacity(self.slices);
        for slice in 0..self.slices {
            let path = self.dir.join(self.slice_file_name(batch_id, slice));
            let sink = SliceSink::create(&path, self.compression).context(StageFileSnafu {
                path: path.display().to_string(),
            })?;
            writers.push(csv::Writer::from_writer(sink));
            paths.push(path);
        }

        // Round-robin keeps slice byte sizes roughly equal.
        for (index, fields) in rows.into_iter().flatten().enumerate() {
            let slice = index % self.slices;
            writers[slice]
                .write_record(&fields)
                .context(CsvEncodeSnafu {
                    path: paths[slice].display().to_string(),
                })?;
        }

        let mut bytes = 0;
        for (writer, path) in writers.into_iter().zip(&paths) {
            let sink = writer
                .into_inner()
                .map_err(|e| e.into_error())
                .context(StageFileSnafu {
                    path: path.display().to_string(),
                })?;
            let file = sink.finish().with_context(|_| StageFileSnafu {
                path: path.display().to_string(),
            })?;
            file.sync_all().with_context(|_| StageFileSnafu {
                path: path.display().to_string(),
            })?;
            bytes += file
                .metadata()
                .with_context(|_| StageFileSnafu {
                    path: path.display().to_string(),
                })?
                .len();
        }

        emit!(BytesStaged { bytes });

        Ok(Some(StagedBatch {
            stream: self.stream.clone(),
            batch_id,
            files: paths,
            rows: live_rows,
            bytes,
            extension: self.compression.extension(),
        }))
    }

    fn slice_file_name(&self, batch_id: Uuid, slice: usize) -> String {
        let file_stem: String = self
            .stream
            .chars()
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect();
        if self.slices == 1 {
            format!("{file_stem}_{batch_id}.{}", self.compression.extension())
        } else {
            format!(
                "{file_stem}_{batch_id}_part_{slice:05}.{}",
                self.compression.extension()
            )
        }
    }
}
