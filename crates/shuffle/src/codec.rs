//! Frame payload encoding: an Arrow IPC stream, optionally zstd-compressed.

use std::io::Cursor;

use arrow::ipc::reader::StreamReader;
use arrow::ipc::writer::StreamWriter;
use arrow::record_batch::RecordBatch;
use nbx_common::{BridgeConfig, IpcReadMode, NbxError, Result};

/// A payload ready to be written as one frame.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub payload: Vec<u8>,
    pub uncompressed_len: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    mode: IpcReadMode,
    zstd_level: i32,
    max_decoded_bytes: u64,
}

impl FrameCodec {
    pub fn new(mode: IpcReadMode, zstd_level: i32) -> Self {
        Self {
            mode,
            zstd_level,
            max_decoded_bytes: BridgeConfig::default().max_frame_bytes,
        }
    }

    pub fn from_config(config: &BridgeConfig) -> Self {
        Self::new(config.read_mode, config.zstd_level)
            .with_max_decoded_bytes(config.max_frame_bytes)
    }

    /// Upper bound on the decoded size a frame header may announce.
    pub fn with_max_decoded_bytes(mut self, bytes: u64) -> Self {
        self.max_decoded_bytes = bytes;
        self
    }

    pub fn mode(&self) -> IpcReadMode {
        self.mode
    }

    /// Serialize `batches` into one frame payload. All batches must share a schema.
    pub fn encode(&self, batches: &[RecordBatch]) -> Result<EncodedFrame> {
        let schema = batches.first().map(|b| b.schema()).ok_or_else(|| {
            NbxError::InvalidConfig("frame payload cannot be empty".to_string())
        })?;

        let mut ipc = Vec::new();
        {
            let mut writer = StreamWriter::try_new(&mut ipc, schema.as_ref())
                .map_err(|e| NbxError::Execution(format!("ipc writer init failed: {e}")))?;
            for b in batches {
                writer
                    .write(b)
                    .map_err(|e| NbxError::Execution(format!("ipc write failed: {e}")))?;
            }
            writer
                .finish()
                .map_err(|e| NbxError::Execution(format!("ipc finish failed: {e}")))?;
        }

        let uncompressed_len = ipc.len() as u64;
        let payload = if self.mode.is_compressed() {
            zstd::encode_all(ipc.as_slice(), self.zstd_level)?
        } else {
            ipc
        };
        Ok(EncodedFrame {
            payload,
            uncompressed_len,
        })
    }

    /// Rebuild the batches of one frame payload.
    ///
    /// The decoded IPC length must equal the `uncompressed_len` announced by
    /// the frame header, and may not exceed the codec's decoded-size bound.
    /// Decompression never writes past the announced length.
    pub fn decode(&self, payload: &[u8], uncompressed_len: u64) -> Result<Vec<RecordBatch>> {
        if uncompressed_len > self.max_decoded_bytes {
            return Err(NbxError::FramingCorruption(format!(
                "frame announces {uncompressed_len} decoded bytes, limit is {}",
                self.max_decoded_bytes
            )));
        }
        let ipc = if self.mode.is_compressed() {
            zstd::bulk::decompress(payload, uncompressed_len as usize).map_err(|e| {
                NbxError::FramingCorruption(format!("zstd frame decode failed: {e}"))
            })?
        } else {
            payload.to_vec()
        };
        if ipc.len() as u64 != uncompressed_len {
            return Err(NbxError::FramingCorruption(format!(
                "frame decoded to {} bytes, header announced {uncompressed_len}",
                ipc.len()
            )));
        }

        let reader = StreamReader::try_new(Cursor::new(ipc), None)
            .map_err(|e| NbxError::Execution(format!("ipc reader init failed: {e}")))?;
        reader
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| NbxError::Execution(format!("ipc read failed: {e}")))
    }
}
