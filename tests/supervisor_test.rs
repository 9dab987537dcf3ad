//! Supervisor behaviour with synthetic cameras

use pi_mjpeg_streamer::capture::test_pattern::TestPatternBackend;
use pi_mjpeg_streamer::capture::{CameraBackend, CameraDevice, CaptureError};
use pi_mjpeg_streamer::config::{
    CameraConfig, CameraKind, ConfigError, Resolution, Rotation, ServerConfig,
};
use pi_mjpeg_streamer::supervisor::{Backends, RunSummary, Supervisor, SupervisorError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Test-pattern backend that counts opens
struct CountingBackend {
    inner: TestPatternBackend,
    opens: AtomicUsize,
}

impl CountingBackend {
    fn new(inner: TestPatternBackend) -> Arc<Self> {
        Arc::new(Self {
            inner,
            opens: AtomicUsize::new(0),
        })
    }

    fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

impl CameraBackend for CountingBackend {
    fn name(&self) -> &'static str {
        "counting"
    }

    fn open(
        &self,
        index: u32,
        resolution: Resolution,
    ) -> Result<Box<dyn CameraDevice>, CaptureError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.inner.open(index, resolution)
    }

    fn probe(&self, index: u32) -> bool {
        self.inner.probe(index)
    }
}

fn camera(name: &str, kind: &str, port: u16) -> CameraConfig {
    CameraConfig {
        name: name.into(),
        kind: CameraKind::from(kind.to_string()),
        resolution: Resolution::new(64, 48),
        rotation: Rotation::None,
        port,
        fps: 30,
    }
}

fn settings() -> ServerConfig {
    ServerConfig {
        bind_ip: "127.0.0.1".into(),
        max_device_index: 8,
        ..ServerConfig::default()
    }
}

fn http_client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}

/// Run the supervisor in the background until the returned sender fires
fn spawn_supervisor(
    supervisor: Supervisor,
    configs: Vec<CameraConfig>,
) -> (
    oneshot::Sender<()>,
    JoinHandle<Result<RunSummary, SupervisorError>>,
) {
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(async move {
        supervisor
            .run_until(&configs, async {
                let _ = stop_rx.await;
            })
            .await
    });
    (stop_tx, handle)
}

/// Poll a URL until the unit's server answers
async fn fetch_when_ready(url: &str) -> reqwest::Response {
    timeout(TEST_TIMEOUT, async {
        loop {
            if let Ok(response) = http_client().get(url).send().await {
                return response;
            }
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn test_only_first_builtin_starts() {
    let builtin = CountingBackend::new(TestPatternBackend::new());
    let external = CountingBackend::new(TestPatternBackend::with_devices([0]));
    let supervisor = Supervisor::new(
        Backends {
            builtin: builtin.clone(),
            external: external.clone(),
        },
        settings(),
    );

    let configs = vec![camera("pi1", "picamera", 18611), camera("pi2", "picamera", 18612)];
    let (stop, handle) = spawn_supervisor(supervisor, configs);

    let response = fetch_when_ready("http://127.0.0.1:18611/record/current.jpg").await;
    assert_eq!(response.status(), 200);
    let jpeg = response.bytes().await.unwrap();
    assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);

    // The skipped camera never binds its port.
    assert!(http_client()
        .get("http://127.0.0.1:18612/index.html")
        .send()
        .await
        .is_err());

    stop.send(()).unwrap();
    let summary = timeout(TEST_TIMEOUT, handle).await.unwrap().unwrap().unwrap();
    assert_eq!(summary.spawned, vec!["pi1"]);
    assert_eq!(summary.skipped, vec!["pi2"]);
    assert!(summary.failed.is_empty());
    assert_eq!(builtin.opens(), 1);
    assert_eq!(external.opens(), 0);
}

#[tokio::test]
async fn test_unknown_type_starts_nothing() {
    let builtin = CountingBackend::new(TestPatternBackend::new());
    let external = CountingBackend::new(TestPatternBackend::with_devices([0, 1]));
    let supervisor = Supervisor::new(
        Backends {
            builtin: builtin.clone(),
            external: external.clone(),
        },
        settings(),
    );

    let configs = [
        camera("pi", "picamera", 18621),
        camera("usb", "usbcamera", 18622),
        camera("dslr", "dslr", 18623),
    ];
    let result = timeout(TEST_TIMEOUT, supervisor.run(&configs)).await.unwrap();

    match result {
        Err(SupervisorError::Config(ConfigError::UnknownCameraType { camera, kind })) => {
            assert_eq!(camera, "dslr");
            assert_eq!(kind, "dslr");
        }
        other => panic!("expected unknown camera type, got {:?}", other),
    }
    assert_eq!(builtin.opens(), 0);
    assert_eq!(external.opens(), 0);
}

#[tokio::test]
async fn test_external_cameras_never_share_a_device() {
    let external = CountingBackend::new(TestPatternBackend::with_devices([0]));
    let supervisor = Supervisor::new(
        Backends {
            builtin: Arc::new(TestPatternBackend::new()),
            external: external.clone(),
        },
        settings(),
    );
    let registry = supervisor.registry().clone();

    let configs = vec![
        camera("usb1", "usbcamera", 18631),
        camera("usb2", "usbcamera", 18632),
    ];
    let (stop, handle) = spawn_supervisor(supervisor, configs);

    timeout(TEST_TIMEOUT, async {
        while registry.leased() != vec![0] {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    // Give the losing unit time to find nothing left.
    sleep(Duration::from_millis(300)).await;

    stop.send(()).unwrap();
    let summary = timeout(TEST_TIMEOUT, handle).await.unwrap().unwrap().unwrap();
    assert_eq!(summary.spawned.len(), 2);
    assert_eq!(summary.failed.len(), 1);
    assert_eq!(external.opens(), 1);

    // Aborted units stop their capture threads, which hand the lease back.
    timeout(TEST_TIMEOUT, async {
        while !registry.leased().is_empty() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_failed_unit_does_not_stop_others() {
    let supervisor = Supervisor::new(
        Backends {
            builtin: Arc::new(TestPatternBackend::new()),
            external: Arc::new(TestPatternBackend::with_devices(std::iter::empty())),
        },
        settings(),
    );

    let configs = vec![
        camera("usb", "usbcamera", 18641),
        camera("pi", "picamera", 18642),
    ];
    let (stop, handle) = spawn_supervisor(supervisor, configs);

    let response = fetch_when_ready("http://127.0.0.1:18642/stream.mjpg").await;
    let mut response = response;
    assert_eq!(response.status(), 200);
    let chunk = timeout(TEST_TIMEOUT, response.chunk())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(chunk.starts_with(b"--FRAME\r\n"));
    drop(response);

    stop.send(()).unwrap();
    let summary = timeout(TEST_TIMEOUT, handle).await.unwrap().unwrap().unwrap();
    assert_eq!(summary.spawned, vec!["usb", "pi"]);
    assert_eq!(summary.failed, vec!["usb"]);
}

#[tokio::test]
async fn test_dead_capture_keeps_server_listening() {
    let supervisor = Supervisor::new(
        Backends {
            builtin: Arc::new(TestPatternBackend::new()),
            external: Arc::new(TestPatternBackend::with_devices([0]).with_read_limit(3)),
        },
        settings(),
    );
    let registry = supervisor.registry().clone();

    let (stop, handle) = spawn_supervisor(supervisor, vec![camera("usb", "usbcamera", 18661)]);

    // The server binds only after the device is leased and opened.
    let response = fetch_when_ready("http://127.0.0.1:18661/index.html").await;
    assert_eq!(response.status(), 200);

    // Three reads later the loop dies and hands the device back.
    timeout(TEST_TIMEOUT, async {
        while !registry.leased().is_empty() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let response = http_client()
        .get("http://127.0.0.1:18661/index.html")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let mut stream = http_client()
        .get("http://127.0.0.1:18661/stream.mjpg")
        .send()
        .await
        .unwrap();
    assert_eq!(stream.status(), 200);
    assert_eq!(
        stream.headers()["content-type"],
        "multipart/x-mixed-replace; boundary=FRAME"
    );
    // No new frames ever arrive.
    assert!(timeout(Duration::from_millis(300), stream.chunk())
        .await
        .is_err());
    drop(stream);

    stop.send(()).unwrap();
    let summary = timeout(TEST_TIMEOUT, handle).await.unwrap().unwrap().unwrap();
    assert_eq!(summary.spawned, vec!["usb"]);
    assert!(summary.failed.is_empty());
}

#[tokio::test]
async fn test_supervisor_returns_when_all_units_end() {
    // A unit whose port is already taken ends at once.
    let blocker = std::net::TcpListener::bind("127.0.0.1:18651").unwrap();
    let supervisor = Supervisor::new(
        Backends {
            builtin: Arc::new(TestPatternBackend::new()),
            external: Arc::new(TestPatternBackend::new()),
        },
        settings(),
    );

    let summary = timeout(TEST_TIMEOUT, supervisor.run(&[camera("pi", "picamera", 18651)]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(summary.failed, vec!["pi"]);
    drop(blocker);
}
