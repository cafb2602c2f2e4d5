use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use vdna_batch::config::{DeviceSpec, PipelineConfig};
use vdna_batch::pipeline::Pipeline;
use vdna_batch::registry::TaskRegistry;
use vdna_batch::report::{ProgressReporter, ReportPaths};
use vdna_batch::task::{Device, TaskStatus};
use vdna_batch::test_utils::{init_tracing, probed_task, FakeToolchain};

const MB: u64 = 1024 * 1024;

fn cpu_config(cache: &Path) -> Arc<PipelineConfig> {
    Arc::new(
        PipelineConfig::new(cache)
            .with_devices(vec![DeviceSpec {
                device: Device::Cpu,
                capacity: 2,
            }])
            .with_workers(2)
            .with_poll_interval(Duration::from_millis(5)),
    )
}

/// Tick until both stages drain, checking the queue invariants on the way.
async fn drive(pipeline: &mut Pipeline, compressing: &[usize], never_fingerprinted: &[usize]) {
    let config_capacity = 2;
    let total = pipeline.registry().len();
    while !pipeline.is_finished() {
        pipeline.tick().await.unwrap();

        let compression = pipeline.compression().queues();
        let fingerprint = pipeline.fingerprint().queues();
        assert!(pipeline.compression().in_flight_on(0) <= config_capacity);
        assert!(fingerprint.in_flight() <= 2);
        for index in 0..total {
            let expected = usize::from(compressing.contains(&index));
            assert_eq!(compression.membership(index), expected, "task {index} in compression");
            assert!(fingerprint.membership(index) <= 1, "task {index} in fingerprinting");
        }
        for index in never_fingerprinted {
            assert_eq!(fingerprint.membership(*index), 0);
        }

        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn oversized_sources_are_compressed_then_everything_is_fingerprinted() {
    init_tracing();
    let media = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();
    let reports = tempfile::tempdir().unwrap();
    let config = cpu_config(cache.path());

    let registry = TaskRegistry::from_tasks([
        probed_task(media.path(), "small", 50 * MB, 640, 480),
        probed_task(media.path(), "medium", 100 * MB, 1920, 1080),
        probed_task(media.path(), "large", 500 * MB, 3840, 2160),
    ]);
    let tools = Arc::new(FakeToolchain::new().with_delay(Duration::from_millis(30)));
    let paths = ReportPaths::new(reports.path(), "batch");
    paths.prepare().await.unwrap();
    let mut pipeline = Pipeline::new(
        config,
        tools.clone(),
        registry,
        ProgressReporter::new(Some(paths.clone())),
    )
    .await;

    assert_eq!(pipeline.scheduled(), 3);
    let waiting: Vec<usize> = pipeline.compression().queues().wait().iter().copied().collect();
    assert_eq!(waiting, vec![2, 1]);
    let waiting: Vec<usize> = pipeline.fingerprint().queues().wait().iter().copied().collect();
    assert_eq!(waiting, vec![0]);

    pipeline.tick().await.unwrap();
    let running: Vec<usize> = pipeline
        .compression()
        .queues()
        .running()
        .map(|job| job.index)
        .collect();
    assert_eq!(running, vec![2, 1]);

    drive(&mut pipeline, &[1, 2], &[]).await;
    assert_eq!(tools.compressed().len(), 2);
    let rows = pipeline.run().await.unwrap();

    assert_eq!(rows.len(), 3);
    assert!(rows.iter().all(|row| row.status == "success"));
    assert_eq!(rows[2].compress_device, "CPU");
    assert!(rows[0].compress_device.is_empty());

    // Compressed copies, not originals, were fingerprinted.
    let fingerprinted = tools.fingerprinted();
    assert_eq!(fingerprinted.len(), 3);
    assert!(fingerprinted.contains(&media.path().join("small.mp4")));
    assert!(!fingerprinted.contains(&media.path().join("large.mp4")));
    assert_eq!(
        fingerprinted.iter().filter(|p| p.starts_with(cache.path())).count(),
        2
    );

    let manifest = std::fs::read_to_string(&paths.manifest).unwrap();
    assert_eq!(manifest.lines().count(), 3);
    let table = std::fs::read_to_string(&paths.table).unwrap();
    assert_eq!(table.lines().count(), 4);
    assert!(paths.table_backup.is_file());
}

#[tokio::test]
async fn compression_failure_keeps_the_task_out_of_fingerprinting() {
    init_tracing();
    let media = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();
    let config = cpu_config(cache.path());

    let registry = TaskRegistry::from_tasks([
        probed_task(media.path(), "good", 300 * MB, 3840, 2160),
        probed_task(media.path(), "bad", 200 * MB, 3840, 2160),
    ]);
    let tools = Arc::new(
        FakeToolchain::new()
            .with_delay(Duration::from_millis(10))
            .failing_compression(&media.path().join("bad.mp4")),
    );
    let mut pipeline =
        Pipeline::new(config, tools.clone(), registry, ProgressReporter::new(None)).await;

    drive(&mut pipeline, &[0, 1], &[1]).await;

    assert_eq!(pipeline.compression().queues().error(), &[1]);
    assert_eq!(pipeline.compression().queues().done(), &[0]);
    assert_eq!(pipeline.fingerprint().queues().done(), &[0]);
    assert_eq!(pipeline.registry().status(1).await, Some(TaskStatus::CompressError));
    assert_eq!(tools.fingerprinted().len(), 1);

    let rows = pipeline.run().await.unwrap();
    assert_eq!(rows[0].status, "success");
    assert_eq!(rows[1].status, "compression error");
    assert!(rows[1].vdnagen_start_time.is_empty());
}

#[tokio::test]
async fn unprobed_tasks_are_reported_as_parse_errors() {
    let media = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();
    let mut broken = probed_task(media.path(), "broken", MB, 640, 480);
    broken.status = TaskStatus::ParseError;
    broken.media = None;
    let fine = probed_task(media.path(), "fine", MB, 640, 480);
    let registry = TaskRegistry::from_tasks([broken, fine]);

    let pipeline = Pipeline::new(
        cpu_config(cache.path()),
        Arc::new(FakeToolchain::new()),
        registry,
        ProgressReporter::new(None),
    )
    .await;
    assert_eq!(pipeline.scheduled(), 1);

    let rows = pipeline.run().await.unwrap();
    assert_eq!(rows[0].status, "parse error");
    assert_eq!(rows[1].status, "success");
}

#[tokio::test]
async fn crashed_compressor_is_reported_as_a_compression_error() {
    init_tracing();
    let media = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();
    let config = Arc::new(
        PipelineConfig::new(cache.path())
            .with_devices(vec![DeviceSpec {
                device: Device::Cpu,
                capacity: 1,
            }])
            .with_workers(1)
            .with_poll_interval(Duration::from_millis(5)),
    );

    let registry =
        TaskRegistry::from_tasks([probed_task(media.path(), "huge", 400 * MB, 3840, 2160)]);
    let source = media.path().join("huge.mp4");
    let tools = Arc::new(FakeToolchain::new().panicking_compression(&source));
    let pipeline =
        Pipeline::new(config, tools.clone(), registry, ProgressReporter::new(None)).await;

    let rows = pipeline.run().await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, "compression error");
    assert!(tools.fingerprinted().is_empty());
}
