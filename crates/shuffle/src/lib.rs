//! Length-prefixed framing of Arrow IPC payloads on a shared byte stream,
//! used where batches are spilled or shuffled instead of handed over live.

pub mod codec;
pub mod frame;
pub mod reader;
pub mod segment;
pub mod writer;

pub use codec::{EncodedFrame, FrameCodec};
pub use frame::{FRAME_HEADER_LEN, Frame, FrameHeader, FrameReader, FrameWriter};
pub use reader::FrameBatchReader;
pub use segment::{
    Segment, SegmentReader, SegmentSource, SegmentedBatchReader, open_file_segment,
    read_file_segment,
};
pub use writer::FrameBatchWriter;
