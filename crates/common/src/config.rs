use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{NbxError, Result};

/// How frame payloads on a byte stream are encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IpcReadMode {
    /// Raw Arrow IPC stream payloads (live conversion path).
    ChannelUncompressed,
    /// zstd-compressed Arrow IPC stream payloads (broadcast/shuffle/spill).
    Channel,
    /// Compressed payloads read from a mix of channel and file segments.
    ChannelAndFileSegment,
}

impl IpcReadMode {
    /// Stable lowercase name used in metric labels and config values.
    pub fn as_str(self) -> &'static str {
        match self {
            IpcReadMode::ChannelUncompressed => "channel_uncompressed",
            IpcReadMode::Channel => "channel",
            IpcReadMode::ChannelAndFileSegment => "channel_and_file_segment",
        }
    }

    pub fn is_compressed(self) -> bool {
        !matches!(self, IpcReadMode::ChannelUncompressed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Max rows per batch built by an export cursor.
    pub record_batch_size: usize,
    /// Bounded wait for each rendezvous step before the fault channel is polled.
    pub poll_interval_ms: u64,
    /// Budget shared by all reservations of one memory pool.
    pub mem_budget_bytes: usize,
    /// Largest payload a frame header may announce.
    pub max_frame_bytes: u64,
    pub zstd_level: i32,
    pub read_mode: IpcReadMode,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            record_batch_size: 10_000,
            poll_interval_ms: 1_000,
            mem_budget_bytes: usize::MAX,
            max_frame_bytes: 1024 * 1024 * 1024,
            zstd_level: 1,
            read_mode: IpcReadMode::Channel,
        }
    }
}

impl BridgeConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Apply `key=value` pairs separated by `,` or `;` on top of `self`.
    pub fn apply_kv(&mut self, kv: &str) -> Result<()> {
        for pair in kv
            .split([',', ';'])
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            let Some((k, v)) = pair.split_once('=') else {
                return Err(NbxError::InvalidConfig(format!(
                    "invalid config pair '{pair}', expected key=value"
                )));
            };
            let key = k.trim().to_ascii_lowercase();
            let value = v.trim();
            match key.as_str() {
                "record_batch_size" => {
                    self.record_batch_size = parse_num(&key, value)?;
                    if self.record_batch_size == 0 {
                        return Err(NbxError::InvalidConfig(
                            "record_batch_size must be positive".to_string(),
                        ));
                    }
                }
                "poll_interval_ms" => self.poll_interval_ms = parse_num(&key, value)?,
                "mem_budget_bytes" => self.mem_budget_bytes = parse_num(&key, value)?,
                "max_frame_bytes" => self.max_frame_bytes = parse_num(&key, value)?,
                "zstd_level" => self.zstd_level = parse_num(&key, value)?,
                "read_mode" => {
                    self.read_mode = match value.to_ascii_lowercase().as_str() {
                        "channel" => IpcReadMode::Channel,
                        "channel_uncompressed" => IpcReadMode::ChannelUncompressed,
                        "channel_and_file_segment" => IpcReadMode::ChannelAndFileSegment,
                        other => {
                            return Err(NbxError::InvalidConfig(format!(
                                "invalid read_mode '{other}'"
                            )));
                        }
                    };
                }
                other => {
                    return Err(NbxError::InvalidConfig(format!(
                        "unknown config key '{other}'"
                    )));
                }
            }
        }
        Ok(())
    }
}

fn parse_num<T>(key: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| NbxError::InvalidConfig(format!("invalid {key} '{value}': {e}")))
}
