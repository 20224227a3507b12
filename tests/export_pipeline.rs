use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::Router;
use reqwest::Url;

use profile_exporter::application::{ApplicationInfo, StaticApplicationStore};
use profile_exporter::config::TagsConfig;
use profile_exporter::delivery::DeliveryError;
use profile_exporter::endpoint::Endpoint;
use profile_exporter::pipeline::base_tags;
use profile_exporter::profile::{
    decode_artifact, EnabledProfilers, Frame, PprofBuffer, ProfileBuffer, ProfileError,
    ProfilerKind, Sample, SampleType, TimeWindow,
};
use profile_exporter::{ExportFailure, ExporterSettings, ProfileExporter};

const PID: u32 = 4242;

fn settings(endpoint: Endpoint) -> ExporterSettings {
    let profilers = EnabledProfilers::new(&[ProfilerKind::Walltime]);
    let tags = TagsConfig {
        language: "dotnet".to_string(),
        ..Default::default()
    };

    let mut apps = HashMap::new();
    apps.insert(
        "svc-a".to_string(),
        ApplicationInfo {
            service: "svc-a".to_string(),
            environment: "prod".to_string(),
            version: String::new(),
        },
    );

    ExporterSettings {
        endpoint,
        process_id: PID,
        base_tags: base_tags(&tags, PID, &profilers).expect("valid tags"),
        profilers,
        applications: Arc::new(StaticApplicationStore::new("", apps)),
    }
}

fn disk(dir: &Path) -> Endpoint {
    Endpoint::Disk {
        directory: dir.to_path_buf(),
    }
}

fn sample(function: &str) -> Sample {
    Sample::new(vec![Frame::new("app", function), Frame::new("app", "Main")], vec![1])
}

#[tokio::test]
async fn test_single_application_export() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let exporter: ProfileExporter = ProfileExporter::new(settings(disk(tmp.path()))).expect("exporter");

    for _ in 0..100 {
        assert!(exporter.add_sample("svc-a", &sample("Work")));
    }

    let report = exporter.export().await;
    assert!(report.is_success());
    assert_eq!(report.outcomes.len(), 1);
    assert_eq!(report.outcomes[0].sample_count, 100);

    let acc = exporter.accumulator("svc-a").expect("registered");
    assert_eq!(acc.export_count(), 1);
    assert_eq!(acc.sample_count(), 0);

    let bytes = std::fs::read(tmp.path().join(format!("svc-a_svc-a_{PID}_1.pprof"))).expect("artifact");
    let profile = decode_artifact(&bytes).expect("decodes");
    assert_eq!(profile.total(0), 100);
    assert_eq!(profile.string(profile.sample_type[0].r#type), "wall");
}

#[tokio::test]
async fn test_export_with_no_applications() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let exporter: ProfileExporter = ProfileExporter::new(settings(disk(tmp.path()))).expect("exporter");

    let report = exporter.export().await;
    assert!(report.is_success());
    assert!(report.outcomes.is_empty());
    assert_eq!(std::fs::read_dir(tmp.path()).expect("read dir").count(), 0);
}

#[tokio::test]
async fn test_idle_application_produces_no_artifact() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let exporter: ProfileExporter = ProfileExporter::new(settings(disk(tmp.path()))).expect("exporter");

    exporter.add_sample("svc-a", &sample("Work"));
    assert_eq!(exporter.export().await.outcomes.len(), 1);

    let report = exporter.export().await;
    assert!(report.is_success());
    assert!(report.outcomes.is_empty());
    assert_eq!(exporter.accumulator("svc-a").expect("registered").export_count(), 2);
    assert_eq!(std::fs::read_dir(tmp.path()).expect("read dir").count(), 1);
}

#[tokio::test]
async fn test_disk_exports_never_overwrite() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let exporter: ProfileExporter = ProfileExporter::new(settings(disk(tmp.path()))).expect("exporter");

    exporter.add_sample("svc-a", &sample("First"));
    let first = exporter.export().await;
    let first_path = tmp.path().join(format!("svc-a_svc-a_{PID}_1.pprof"));
    let first_bytes = std::fs::read(&first_path).expect("first artifact");

    exporter.add_sample("svc-a", &sample("Second"));
    exporter.add_sample("svc-a", &sample("Second"));
    let second = exporter.export().await;

    assert!(first.is_success() && second.is_success());
    assert!(second.outcomes[0].export_index > first.outcomes[0].export_index);

    let second_bytes =
        std::fs::read(tmp.path().join(format!("svc-a_svc-a_{PID}_2.pprof"))).expect("second artifact");
    assert_eq!(std::fs::read(&first_path).expect("first artifact"), first_bytes);
    assert_eq!(decode_artifact(&first_bytes).expect("decodes").total(0), 1);
    assert_eq!(decode_artifact(&second_bytes).expect("decodes").total(0), 2);
}

#[tokio::test]
async fn test_unknown_application_file_uses_identifier() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let exporter: ProfileExporter = ProfileExporter::new(settings(disk(tmp.path()))).expect("exporter");

    exporter.add_sample("rt/7f3a", &sample("Work"));
    assert!(exporter.export().await.is_success());
    assert!(tmp.path().join(format!("rt_7f3a_rt_2F7f3a_{PID}_1.pprof")).exists());
}

#[tokio::test]
async fn test_applications_sharing_a_service_get_separate_files() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let mut s = settings(disk(tmp.path()));
    s.applications = Arc::new(StaticApplicationStore::new("fallback", HashMap::new()));
    let exporter: ProfileExporter = ProfileExporter::new(s).expect("exporter");

    for id in ["rt-1", "rt-2", "rt/1", "rt_1"] {
        exporter.add_sample(id, &sample("Work"));
    }

    let report = exporter.export().await;
    assert!(report.is_success());
    assert_eq!(report.outcomes.len(), 4);
    for name in ["rt-1", "rt-2", "rt_2F1", "rt_5F1"] {
        let path = tmp.path().join(format!("fallback_{name}_{PID}_1.pprof"));
        assert!(path.exists(), "missing {}", path.display());
    }
    assert_eq!(std::fs::read_dir(tmp.path()).expect("read dir").count(), 4);
}

/// Collector that stalls on artifacts from `svc-b`.
async fn spawn_collector() -> Url {
    let app = Router::new().route(
        "/profiling/v1/input",
        post(|headers: HeaderMap| async move {
            let application = headers
                .get("x-profile-application")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            if application == "svc-b" {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            StatusCode::ACCEPTED
        }),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Url::parse(&format!("http://{addr}/profiling/v1/input")).expect("url")
}

#[tokio::test]
async fn test_timeout_fails_only_that_application() {
    let url = spawn_collector().await;
    let exporter: ProfileExporter = ProfileExporter::new(settings(Endpoint::Http {
        url,
        api_key: None,
        timeout: Duration::from_millis(200),
    }))
    .expect("exporter");

    exporter.add_sample("svc-a", &sample("Work"));
    exporter.add_sample("svc-b", &sample("Work"));

    let report = exporter.export().await;
    assert!(!report.is_success());
    assert_eq!(report.outcomes.len(), 2);
    assert_eq!(report.succeeded(), 1);

    assert!(report.outcome("svc-a").expect("svc-a").is_success());
    let b = report.outcome("svc-b").expect("svc-b");
    assert!(matches!(
        b.result,
        Err(ExportFailure::Deliver(DeliveryError::Timeout(_)))
    ));

    // Failed deliveries still consumed their samples.
    let acc = exporter.accumulator("svc-b").expect("registered");
    assert_eq!(acc.export_count(), 1);
    assert_eq!(acc.sample_count(), 0);
}

/// Buffer that refuses to serialize once it saw a `poison` frame.
struct PoisonableBuffer {
    inner: PprofBuffer,
    poisoned: bool,
}

impl ProfileBuffer for PoisonableBuffer {
    fn create(sample_types: &[SampleType]) -> Self {
        Self {
            inner: PprofBuffer::create(sample_types),
            poisoned: false,
        }
    }

    fn add(&mut self, sample: &Sample) -> Result<(), ProfileError> {
        self.inner.add(sample)?;
        self.poisoned |= sample.frames.iter().any(|f| f.function == "poison");
        Ok(())
    }

    fn serialize(&self, window: &TimeWindow) -> Result<Vec<u8>, ProfileError> {
        if self.poisoned {
            return Err(ProfileError::Compress(std::io::Error::other("poisoned buffer")));
        }
        self.inner.serialize(window)
    }
}

#[tokio::test]
async fn test_serialization_failure_is_isolated() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let exporter: ProfileExporter<PoisonableBuffer> =
        ProfileExporter::new(settings(disk(tmp.path()))).expect("exporter");

    exporter.add_sample("svc-a", &sample("poison"));
    exporter.add_sample("svc-b", &sample("Work"));

    let report = exporter.export().await;
    assert_eq!(report.outcomes.len(), 2);

    let a = report.outcome("svc-a").expect("svc-a");
    assert!(matches!(a.result, Err(ExportFailure::Serialize(_))));
    assert_eq!(a.payload_bytes, 0);
    assert!(report.outcome("svc-b").expect("svc-b").is_success());
    assert!(tmp.path().join(format!("svc-b_svc-b_{PID}_1.pprof")).exists());

    // The next cycle starts from a fresh buffer.
    exporter.add_sample("svc-a", &sample("Work"));
    let report = exporter.export().await;
    assert!(report.is_success());
    assert_eq!(report.outcome("svc-a").expect("svc-a").export_index, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_interleaved_ingest_and_export_conserves_samples() {
    const APPS: usize = 4;
    const THREADS_PER_APP: usize = 2;
    const SAMPLES_PER_THREAD: usize = 2_000;

    let tmp = tempfile::tempdir().expect("tempdir");
    let exporter: Arc<ProfileExporter> =
        Arc::new(ProfileExporter::new(settings(disk(tmp.path()))).expect("exporter"));

    let mut handles = Vec::new();
    for app in 0..APPS {
        for _ in 0..THREADS_PER_APP {
            let exporter = Arc::clone(&exporter);
            handles.push(thread::spawn(move || {
                let id = format!("app-{app}");
                for i in 0..SAMPLES_PER_THREAD {
                    let function = if i % 2 == 0 { "Even" } else { "Odd" };
                    assert!(exporter.add_sample(&id, &sample(function)));
                }
            }));
        }
    }

    let mut exported: HashMap<String, u64> = HashMap::new();
    let mut cycles = 0;
    while handles.iter().any(|h| !h.is_finished()) {
        let report = exporter.export().await;
        assert!(report.is_success());
        for outcome in &report.outcomes {
            *exported.entry(outcome.application_id.to_string()).or_default() += outcome.sample_count;
        }
        cycles += 1;
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    for h in handles {
        h.join().expect("ingest thread panicked");
    }

    let report = exporter.export().await;
    assert!(report.is_success());
    for outcome in &report.outcomes {
        *exported.entry(outcome.application_id.to_string()).or_default() += outcome.sample_count;
    }

    let expected = (THREADS_PER_APP * SAMPLES_PER_THREAD) as u64;
    assert_eq!(exported.len(), APPS);
    for app in 0..APPS {
        let id = format!("app-{app}");
        assert_eq!(exported[&id], expected, "{id} lost or duplicated samples");
        let acc = exporter.accumulator(&id).expect("registered");
        assert_eq!(acc.sample_count(), 0);
        // Applications registered after the first cycle saw fewer extractions.
        assert!((1..=cycles + 1).contains(&acc.export_count()));
    }
}
