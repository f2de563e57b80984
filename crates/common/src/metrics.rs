use std::sync::Arc;

use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};

#[derive(Clone, Debug)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    registry: Registry,
    import_batches: CounterVec,
    import_rows: CounterVec,
    import_bytes: CounterVec,
    export_batches: CounterVec,
    export_rows: CounterVec,
    pull_wait_seconds: HistogramVec,
    producer_faults: CounterVec,
    cursors_closed: CounterVec,
    frames_read: CounterVec,
    frame_bytes_read: CounterVec,
    frames_written: CounterVec,
    frame_bytes_written: CounterVec,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::new()),
        }
    }

    pub fn record_import_batch(&self, task_id: &str, rows: u64, bytes: u64, wait_secs: f64) {
        let labels = [task_id];
        self.inner.import_batches.with_label_values(&labels).inc();
        self.inner
            .import_rows
            .with_label_values(&labels)
            .inc_by(rows as f64);
        self.inner
            .import_bytes
            .with_label_values(&labels)
            .inc_by(bytes as f64);
        self.inner
            .pull_wait_seconds
            .with_label_values(&labels)
            .observe(wait_secs.max(0.0));
    }

    pub fn record_export_batch(&self, task_id: &str, rows: u64) {
        let labels = [task_id];
        self.inner.export_batches.with_label_values(&labels).inc();
        self.inner
            .export_rows
            .with_label_values(&labels)
            .inc_by(rows as f64);
    }

    pub fn inc_producer_faults(&self, task_id: &str) {
        self.inner
            .producer_faults
            .with_label_values(&[task_id])
            .inc();
    }

    pub fn inc_cursors_closed(&self, task_id: &str, kind: &str) {
        self.inner
            .cursors_closed
            .with_label_values(&[task_id, kind])
            .inc();
    }

    pub fn record_frame_read(&self, mode: &str, bytes: u64) {
        let labels = [mode];
        self.inner.frames_read.with_label_values(&labels).inc();
        self.inner
            .frame_bytes_read
            .with_label_values(&labels)
            .inc_by(bytes as f64);
    }

    pub fn record_frame_written(&self, mode: &str, bytes: u64) {
        let labels = [mode];
        self.inner.frames_written.with_label_values(&labels).inc();
        self.inner
            .frame_bytes_written
            .with_label_values(&labels)
            .inc_by(bytes as f64);
    }

    pub fn render_prometheus(&self) -> String {
        let metric_families = self.inner.registry.gather();
        let mut out = Vec::new();
        let enc = TextEncoder::new();
        if enc.encode(&metric_families, &mut out).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&out).to_string()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsInner {
    fn new() -> Self {
        let registry = Registry::new();

        let import_batches = counter_vec(
            &registry,
            "nbx_import_batches_total",
            "Batches imported from a producer",
            &["task_id"],
        );
        let import_rows = counter_vec(
            &registry,
            "nbx_import_rows_total",
            "Rows imported from a producer",
            &["task_id"],
        );
        let import_bytes = counter_vec(
            &registry,
            "nbx_import_bytes_total",
            "Array memory of imported batches",
            &["task_id"],
        );
        let export_batches = counter_vec(
            &registry,
            "nbx_export_batches_total",
            "Batches finalized by export cursors",
            &["task_id"],
        );
        let export_rows = counter_vec(
            &registry,
            "nbx_export_rows_total",
            "Rows finalized by export cursors",
            &["task_id"],
        );
        let pull_wait_seconds = histogram_vec(
            &registry,
            "nbx_pull_wait_seconds",
            "Time a consumer blocked in one rendezvous pull",
            &["task_id"],
        );
        let producer_faults = counter_vec(
            &registry,
            "nbx_producer_faults_total",
            "Producer faults surfaced on the consumer",
            &["task_id"],
        );
        let cursors_closed = counter_vec(
            &registry,
            "nbx_cursors_closed_total",
            "Cursor shutdowns",
            &["task_id", "kind"],
        );

        let frames_read = counter_vec(
            &registry,
            "nbx_frames_read_total",
            "Frames read from byte streams",
            &["mode"],
        );
        let frame_bytes_read = counter_vec(
            &registry,
            "nbx_frame_bytes_read_total",
            "Frame payload bytes read",
            &["mode"],
        );
        let frames_written = counter_vec(
            &registry,
            "nbx_frames_written_total",
            "Frames written to byte streams",
            &["mode"],
        );
        let frame_bytes_written = counter_vec(
            &registry,
            "nbx_frame_bytes_written_total",
            "Frame payload bytes written",
            &["mode"],
        );

        Self {
            registry,
            import_batches,
            import_rows,
            import_bytes,
            export_batches,
            export_rows,
            pull_wait_seconds,
            producer_faults,
            cursors_closed,
            frames_read,
            frame_bytes_read,
            frames_written,
            frame_bytes_written,
        }
    }
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> CounterVec {
    let c = CounterVec::new(Opts::new(name, help), labels).expect("counter vec");
    registry
        .register(Box::new(c.clone()))
        .expect("register counter");
    c
}

fn histogram_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> HistogramVec {
    let h = HistogramVec::new(HistogramOpts::new(name, help), labels).expect("histogram vec");
    registry
        .register(Box::new(h.clone()))
        .expect("register histogram");
    h
}

#[cfg(test)]
mod tests {
    use super::MetricsRegistry;

    #[test]
    fn renders_prometheus_text() {
        let m = MetricsRegistry::new();
        m.record_import_batch("7", 4096, 32768, 0.01);
        let text = m.render_prometheus();
        assert!(text.contains("nbx_import_rows_total"));
        assert!(text.contains("task_id=\"7\""));
    }

    #[test]
    fn renders_all_metric_families() {
        let m = MetricsRegistry::new();
        m.record_import_batch("1", 10, 100, 0.02);
        m.record_export_batch("1", 10);
        m.inc_producer_faults("1");
        m.inc_cursors_closed("1", "import");
        m.record_frame_read("channel", 512);
        m.record_frame_written("channel", 512);
        let text = m.render_prometheus();

        assert!(text.contains("nbx_import_batches_total"));
        assert!(text.contains("nbx_import_rows_total"));
        assert!(text.contains("nbx_import_bytes_total"));
        assert!(text.contains("nbx_pull_wait_seconds"));
        assert!(text.contains("nbx_export_batches_total"));
        assert!(text.contains("nbx_export_rows_total"));
        assert!(text.contains("nbx_producer_faults_total"));
        assert!(text.contains("nbx_cursors_closed_total"));

        assert!(text.contains("nbx_frames_read_total"));
        assert!(text.contains("nbx_frame_bytes_read_total"));
        assert!(text.contains("nbx_frames_written_total"));
        assert!(text.contains("nbx_frame_bytes_written_total"));
    }
}
