//! Frames stored in a byte range of a spill or shuffle file, and inputs made
//! of several such segments.

use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom, Take};
use std::path::{Path, PathBuf};

use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use nbx_common::{BridgeConfig, IpcReadMode, MetricsRegistry, NbxError, Result};
use nbx_execution::{SendableRecordBatchStream, iter_stream};
use tracing::{debug, warn};

use crate::codec::FrameCodec;
use crate::frame::FrameReader;
use crate::reader::FrameBatchReader;

pub type SegmentSource = Take<BufReader<File>>;

/// Byte source of one segment of a segmented input.
pub type SegmentReader = Box<dyn Read + Send>;

fn open_range(path: &Path, offset: u64, length: u64) -> Result<SegmentSource> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    debug!(path = %path.display(), offset, length, "opening file segment");
    Ok(BufReader::new(file).take(length))
}

/// Frame reader over `length` bytes of `path` starting at `offset`.
pub fn open_file_segment(
    path: impl AsRef<Path>,
    offset: u64,
    length: u64,
    config: &BridgeConfig,
) -> Result<FrameReader<SegmentSource>> {
    let source = open_range(path.as_ref(), offset, length)?;
    Ok(FrameReader::new(source, config.max_frame_bytes))
}

/// Batches of a file segment, decoded with the configured read mode.
pub fn read_file_segment(
    path: impl AsRef<Path>,
    offset: u64,
    length: u64,
    config: &BridgeConfig,
    metrics: MetricsRegistry,
) -> Result<FrameBatchReader<SegmentSource>> {
    let frames = open_file_segment(path, offset, length, config)?;
    Ok(FrameBatchReader::new(
        frames,
        FrameCodec::from_config(config),
        metrics,
    ))
}

/// One piece of a segmented input.
pub enum Segment {
    /// Frames read from an already open byte stream.
    Channel(SegmentReader),
    /// Frames stored in `length` bytes of `path` starting at `offset`.
    File {
        path: PathBuf,
        offset: u64,
        length: u64,
    },
}

impl Segment {
    pub fn channel(reader: impl Read + Send + 'static) -> Self {
        Segment::Channel(Box::new(reader))
    }

    pub fn file(path: impl Into<PathBuf>, offset: u64, length: u64) -> Self {
        Segment::File {
            path: path.into(),
            offset,
            length,
        }
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Channel(_) => f.write_str("Segment::Channel(..)"),
            Segment::File {
                path,
                offset,
                length,
            } => f
                .debug_struct("Segment::File")
                .field("path", path)
                .field("offset", offset)
                .field("length", length)
                .finish(),
        }
    }
}

/// Reads the batches of each segment in turn, opening the next segment only
/// once the current one is exhausted.
///
/// File segments are accepted only in
/// [`IpcReadMode::ChannelAndFileSegment`]. A failure in any segment ends the
/// whole input.
pub struct SegmentedBatchReader<I> {
    segments: I,
    config: BridgeConfig,
    metrics: MetricsRegistry,
    current: Option<FrameBatchReader<SegmentReader>>,
    segments_opened: u64,
    done: bool,
}

impl<I> SegmentedBatchReader<I>
where
    I: Iterator<Item = Segment>,
{
    pub fn new(
        segments: impl IntoIterator<IntoIter = I>,
        config: &BridgeConfig,
        metrics: MetricsRegistry,
    ) -> Self {
        Self {
            segments: segments.into_iter(),
            config: config.clone(),
            metrics,
            current: None,
            segments_opened: 0,
            done: false,
        }
    }

    pub fn segments_opened(&self) -> u64 {
        self.segments_opened
    }

    fn open(&self, segment: Segment) -> Result<FrameBatchReader<SegmentReader>> {
        let source: SegmentReader = match segment {
            Segment::Channel(reader) => reader,
            Segment::File {
                path,
                offset,
                length,
            } => {
                if self.config.read_mode != IpcReadMode::ChannelAndFileSegment {
                    return Err(NbxError::InvalidConfig(format!(
                        "file segment {} needs read_mode=channel_and_file_segment, got {}",
                        path.display(),
                        self.config.read_mode.as_str()
                    )));
                }
                Box::new(open_range(&path, offset, length)?)
            }
        };
        Ok(FrameBatchReader::new(
            FrameReader::new(source, self.config.max_frame_bytes),
            FrameCodec::from_config(&self.config),
            self.metrics.clone(),
        ))
    }

    /// Adapt to the native stream interface.
    pub fn into_stream(self, schema: SchemaRef) -> SendableRecordBatchStream
    where
        I: Send + Unpin + 'static,
    {
        iter_stream(schema, self)
    }
}

impl<I> Iterator for SegmentedBatchReader<I>
where
    I: Iterator<Item = Segment>,
{
    type Item = Result<RecordBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }
            if let Some(current) = self.current.as_mut() {
                match current.next() {
                    Some(Ok(batch)) => return Some(Ok(batch)),
                    Some(Err(err)) => {
                        self.current = None;
                        self.done = true;
                        return Some(Err(err));
                    }
                    None => self.current = None,
                }
            }
            let Some(segment) = self.segments.next() else {
                self.done = true;
                return None;
            };
            match self.open(segment) {
                Ok(reader) => {
                    self.segments_opened += 1;
                    self.current = Some(reader);
                }
                Err(err) => {
                    warn!(error = %err, segment = self.segments_opened, "segment open failed");
                    self.done = true;
                    return Some(Err(err));
                }
            }
        }
    }
}
