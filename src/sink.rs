use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::{Local, NaiveDateTime};
use regex::Regex;
use tracing::{info, warn};

use crate::classifier::{OutputRecord, PaymentBucket};
use crate::error::{ExportError, Result};

/// UTF-8 byte order mark, so that Excel picks the right encoding when opening the CSV files
pub const UTF8_BOM: [u8; 3] = [0xEF, 0xBB, 0xBF];

const FILE_TIMESTAMP_FORMAT: &str = "%Y.%m.%d_%H-%M-%S";

pub type Clock = fn() -> NaiveDateTime;

/// Creates the file a bucket is written to
pub type CreateFile<W> = fn(&Path) -> io::Result<W>;

fn local_now() -> NaiveDateTime {
    Local::now().naive_local()
}

fn create_new_file(path: &Path) -> io::Result<File> {
    OpenOptions::new().write(true).create_new(true).open(path)
}

/// Destination of a bucket, synced to storage once all its records are flushed
pub trait BucketFile: Write {
    fn sync(&mut self) -> io::Result<()>;
}

impl BucketFile for File {
    fn sync(&mut self) -> io::Result<()> {
        self.sync_all()
    }
}

/// Writes records to one CSV file per payment bucket.
///
/// The file of a bucket is created, in a directory named after the bucket, when the first record
/// for that bucket comes in. Buckets are told apart by name. Records are appended in the order
/// they are given and only flushed by [`BucketSink::finalize`].
pub struct BucketSink<W: BucketFile = File> {
    base_dir: PathBuf,
    clock: Clock,
    create: CreateFile<W>,
    streams: Vec<BucketStream<W>>,
}

struct BucketStream<W: BucketFile> {
    bucket: PaymentBucket,
    path: PathBuf,
    writer: csv::Writer<W>,
    written: usize,
    lost: usize,
}

/// What ended up in a bucket file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketSummary {
    pub bucket: PaymentBucket,
    pub path: PathBuf,
    pub written: usize,
    pub lost: usize,
}

/// Result of a single append. Write failures are not fatal and only reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendStatus {
    Written,
    Lost,
}

impl BucketSink {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self::with_clock(base_dir, local_now)
    }

    pub fn with_clock(base_dir: impl Into<PathBuf>, clock: Clock) -> Self {
        Self::with_files(base_dir, clock, create_new_file)
    }
}

impl<W: BucketFile> BucketSink<W> {
    pub fn with_files(base_dir: impl Into<PathBuf>, clock: Clock, create: CreateFile<W>) -> Self {
        Self {
            base_dir: base_dir.into(),
            clock,
            create,
            streams: Vec::new(),
        }
    }

    pub fn append(&mut self, bucket: &PaymentBucket, record: &OutputRecord) -> Result<AppendStatus> {
        let existing = self
            .streams
            .iter()
            .position(|s| s.bucket.name() == bucket.name());
        let index = match existing {
            Some(index) => index,
            None => {
                let stream = self.open(bucket)?;
                self.streams.push(stream);
                self.streams.len() - 1
            }
        };
        let stream = &mut self.streams[index];
        match stream.writer.serialize(record) {
            Ok(()) => {
                stream.written += 1;
                Ok(AppendStatus::Written)
            }
            Err(err) => {
                warn!(
                    "Could not write record {} to {:?}: {err}",
                    record.operation_number, stream.path
                );
                stream.lost += 1;
                Ok(AppendStatus::Lost)
            }
        }
    }

    fn open(&self, bucket: &PaymentBucket) -> Result<BucketStream<W>> {
        let name = sanitize_file_name(bucket.name());
        let dir = self.base_dir.join(&name);
        let creation_error = |path: &Path| {
            let bucket = bucket.name().to_owned();
            let path = path.to_owned();
            move |source: io::Error| ExportError::OutputCreation {
                bucket,
                path,
                source,
            }
        };
        fs::create_dir_all(&dir).map_err(creation_error(&dir))?;

        let stem = format!("{name}_{}", (self.clock)().format(FILE_TIMESTAMP_FORMAT));
        let mut path = dir.join(format!("{stem}.csv"));
        // Distinct methods may sanitize to the same name
        let mut suffix = 2;
        while self.streams.iter().any(|s| s.path == path) {
            path = dir.join(format!("{stem}_{suffix}.csv"));
            suffix += 1;
        }
        let mut file = (self.create)(&path).map_err(creation_error(&path))?;
        file.write_all(&UTF8_BOM).map_err(creation_error(&path))?;

        info!("Writing {} records to {path:?}", bucket.name());
        let writer = csv::WriterBuilder::new()
            .has_headers(false)
            .quote_style(csv::QuoteStyle::Never)
            .from_writer(file);
        Ok(BucketStream {
            bucket: bucket.clone(),
            path,
            writer,
            written: 0,
            lost: 0,
        })
    }

    /// Number of buckets opened so far
    pub fn bucket_count(&self) -> usize {
        self.streams.len()
    }

    /// Flushes and closes every bucket file, in the order the buckets were opened.
    ///
    /// A bucket that cannot be flushed does not stop the others: its buffered records are counted
    /// as lost.
    pub fn finalize(self) -> Vec<BucketSummary> {
        let mut summaries = Vec::with_capacity(self.streams.len());
        for stream in self.streams {
            let BucketStream {
                bucket,
                path,
                writer,
                mut written,
                mut lost,
            } = stream;
            match writer.into_inner() {
                Ok(mut file) => {
                    if let Err(err) = file.sync() {
                        warn!("Could not sync {path:?}: {err}");
                    }
                }
                Err(err) => {
                    warn!(
                        "Could not flush {written} {} records to {path:?}: {}",
                        bucket.name(),
                        err.error()
                    );
                    lost += written;
                    written = 0;
                }
            }
            summaries.push(BucketSummary {
                bucket,
                path,
                written,
                lost,
            });
        }
        summaries
    }
}

/// Makes a payment method usable as a directory and file name
pub fn sanitize_file_name(name: &str) -> String {
    static ILLEGAL_CHARACTERS: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r#"[<>:"/\\|?*\x00-\x1F]"#).expect("regex"));

    let sanitized = ILLEGAL_CHARACTERS.replace_all(name.trim(), "_");
    if sanitized.chars().all(|c| c == '.') {
        "_".to_owned()
    } else {
        sanitized.into_owned()
    }
}
