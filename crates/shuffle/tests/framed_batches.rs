use std::io::{Cursor, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use arrow::array::{Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use futures::StreamExt;
use nbx_common::{BridgeConfig, IpcReadMode, MetricsRegistry, NbxError};
use nbx_shuffle::{
    FrameBatchReader, FrameBatchWriter, FrameCodec, FrameReader, Segment, SegmentedBatchReader,
    open_file_segment, read_file_segment,
};

fn temp_spill_path() -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    std::env::temp_dir().join(format!("nbx_spill_test_{nanos}.bin"))
}

fn schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::Int64, false),
        Field::new("name", DataType::Utf8, true),
    ]))
}

fn batch(start: i64, rows: usize) -> RecordBatch {
    let ids = (start..start + rows as i64).collect::<Vec<_>>();
    let names = ids
        .iter()
        .map(|v| (v % 3 != 0).then(|| format!("n{v}")))
        .collect::<Vec<_>>();
    RecordBatch::try_new(
        schema(),
        vec![
            Arc::new(Int64Array::from(ids)),
            Arc::new(names.into_iter().collect::<StringArray>()),
        ],
    )
    .expect("batch")
}

fn framed(mode: IpcReadMode, frames: &[Vec<RecordBatch>]) -> (Vec<u8>, MetricsRegistry) {
    let metrics = MetricsRegistry::new();
    let mut writer = FrameBatchWriter::new(Vec::new(), FrameCodec::new(mode, 1), metrics.clone());
    for batches in frames {
        writer.write_batches(batches).expect("write frame");
    }
    assert_eq!(writer.frames_written(), frames.len() as u64);
    (writer.finish().expect("finish"), metrics)
}

#[test]
fn batches_survive_framing_in_both_modes() {
    for mode in [IpcReadMode::Channel, IpcReadMode::ChannelUncompressed] {
        let input = vec![vec![batch(0, 5), batch(5, 3)], vec![batch(8, 100)]];
        let (bytes, metrics) = framed(mode, &input);

        let frames = FrameReader::new(Cursor::new(bytes), 1 << 20);
        let reader = FrameBatchReader::new(frames, FrameCodec::new(mode, 1), metrics.clone());
        let out = reader
            .collect::<nbx_common::Result<Vec<_>>>()
            .expect("read batches");
        assert_eq!(out, input.concat());

        let text = metrics.render_prometheus();
        assert!(text.contains("nbx_frames_read_total"));
        assert!(text.contains("nbx_frames_written_total"));
        assert!(text.contains(mode.as_str()));
    }
}

#[test]
fn corrupt_tail_surfaces_after_good_frames() {
    let (mut bytes, metrics) = framed(IpcReadMode::Channel, &[vec![batch(0, 4)]]);
    bytes.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);

    let frames = FrameReader::new(Cursor::new(bytes), 1 << 20);
    let mut reader = FrameBatchReader::new(
        frames,
        FrameCodec::new(IpcReadMode::Channel, 1),
        metrics,
    );
    assert_eq!(reader.next().expect("first").expect("batch").num_rows(), 4);
    let err = reader.next().expect("error item").expect_err("corruption");
    assert!(matches!(err, NbxError::FramingCorruption(_)));
    assert!(reader.next().is_none());
}

#[test]
fn reads_frames_from_a_file_segment() {
    let path = temp_spill_path();
    let (first, _) = framed(IpcReadMode::Channel, &[vec![batch(0, 10)]]);
    let (second, _) = framed(
        IpcReadMode::Channel,
        &[vec![batch(10, 20)], vec![batch(30, 1)]],
    );
    let mut file = std::fs::File::create(&path).expect("create spill");
    file.write_all(b"junk-prefix").expect("prefix");
    file.write_all(&first).expect("first segment");
    file.write_all(&second).expect("second segment");
    file.write_all(b"junk-suffix").expect("suffix");
    file.flush().expect("flush");
    drop(file);

    let config = BridgeConfig::default();
    let offset = (b"junk-prefix".len() + first.len()) as u64;
    let batches = read_file_segment(
        &path,
        offset,
        second.len() as u64,
        &config,
        MetricsRegistry::new(),
    )
    .expect("open segment")
    .collect::<nbx_common::Result<Vec<_>>>()
    .expect("segment batches");
    assert_eq!(batches, vec![batch(10, 20), batch(30, 1)]);

    // A segment cut short ends inside a header.
    let mut frames = open_file_segment(&path, b"junk-prefix".len() as u64, 10, &config)
        .expect("open short segment");
    assert!(matches!(
        frames.has_next(),
        Err(NbxError::FramingCorruption(_))
    ));

    let _ = std::fs::remove_file(path);
}

#[test]
fn segmented_input_mixes_channel_and_file_segments() {
    let mode = IpcReadMode::ChannelAndFileSegment;
    let path = temp_spill_path();
    let (stored, _) = framed(mode, &[vec![batch(3, 4)], vec![batch(7, 2)]]);
    let mut file = std::fs::File::create(&path).expect("create spill");
    file.write_all(b"header-bytes").expect("prefix");
    file.write_all(&stored).expect("stored segment");
    file.flush().expect("flush");
    drop(file);

    let (head, _) = framed(mode, &[vec![batch(0, 3)]]);
    let (tail, _) = framed(mode, &[vec![batch(9, 1)]]);
    let segments = vec![
        Segment::channel(Cursor::new(head)),
        Segment::channel(Cursor::new(Vec::new())),
        Segment::file(&path, b"header-bytes".len() as u64, stored.len() as u64),
        Segment::channel(Cursor::new(tail)),
    ];
    let config = BridgeConfig {
        read_mode: mode,
        ..BridgeConfig::default()
    };
    let metrics = MetricsRegistry::new();
    let mut reader = SegmentedBatchReader::new(segments, &config, metrics.clone());
    let out = reader
        .by_ref()
        .collect::<nbx_common::Result<Vec<_>>>()
        .expect("segmented batches");
    assert_eq!(out, vec![batch(0, 3), batch(3, 4), batch(7, 2), batch(9, 1)]);
    assert_eq!(reader.segments_opened(), 4);
    assert!(reader.next().is_none());
    assert!(metrics.render_prometheus().contains(mode.as_str()));

    let _ = std::fs::remove_file(path);
}

#[test]
fn file_segment_outside_segmented_mode_is_rejected() {
    let (head, _) = framed(IpcReadMode::Channel, &[vec![batch(0, 2)]]);
    let segments = vec![
        Segment::channel(Cursor::new(head)),
        Segment::file(temp_spill_path(), 0, 16),
        Segment::channel(Cursor::new(Vec::new())),
    ];
    let mut reader =
        SegmentedBatchReader::new(segments, &BridgeConfig::default(), MetricsRegistry::new());
    assert_eq!(reader.next().expect("first").expect("batch").num_rows(), 2);
    let err = reader.next().expect("error item").expect_err("file segment");
    assert!(matches!(err, NbxError::InvalidConfig(_)), "{err:?}");
    assert!(reader.next().is_none());
    assert_eq!(reader.segments_opened(), 1);
}

#[test]
fn framed_batches_feed_a_native_stream() {
    let (bytes, metrics) = framed(
        IpcReadMode::ChannelUncompressed,
        &[vec![batch(0, 2)], vec![batch(2, 2)]],
    );
    let frames = FrameReader::new(Cursor::new(bytes), 1 << 20);
    let mut stream = FrameBatchReader::new(
        frames,
        FrameCodec::new(IpcReadMode::ChannelUncompressed, 1),
        metrics,
    )
    .into_stream(schema());

    let mut rows = 0;
    futures::executor::block_on(async {
        while let Some(batch) = stream.next().await {
            rows += batch.expect("batch").num_rows();
        }
    });
    assert_eq!(rows, 4);
}
