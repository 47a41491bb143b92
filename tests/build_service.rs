//! End-to-end tests: a real server on a loopback port, driving a fake
//! toolchain script that behaves like `go get`.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use buildbox::config::{Config, ToolchainConfig};
use buildbox::executor::toolchain_info;
use buildbox::http_server;
use buildbox::AppState;
use reqwest::StatusCode;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;

const FAKE_TOOLCHAIN: &str = r##"
case "$1" in
  version) echo "go version go0.0-fake linux/amd64"; exit 0;;
  tool) echo 'GOOS="linux"'; exit 0;;
esac
echo "$@" >> "@DIR@/calls"
shift
[ "$1" = "-insecure" ] && shift
pkg="$1"
src="$GOPATH/src/$pkg"
if [ -f "$src/DELAY" ]; then
  mkdir -p "@DIR@/running"
  touch "@DIR@/running/$$"
  ls "@DIR@/running" | wc -l >> "@DIR@/concurrency"
  sleep "$(cat "$src/DELAY")"
  rm -f "@DIR@/running/$$"
fi
if [ ! -f "$src/main.go" ]; then
  echo "cannot find package \"$pkg\" in any of:" >&2
  echo "	$src (from \$GOPATH)" >&2
  exit 1
fi
if grep -q SYNTAX "$src/main.go"; then
  echo "# $pkg"
  echo "$src/main.go:3:1: syntax error: unexpected }" >&2
  exit 2
fi
mkdir -p "$GOPATH/bin"
cp "$src/main.go" "$GOPATH/bin/$(basename "$pkg")"
"##;

struct Harness {
    _tmp: TempDir,
    dir: PathBuf,
    base: String,
    client: reqwest::Client,
    state: AppState,
}

impl Harness {
    async fn start(workers: usize, queue_capacity: usize, max_archive_bytes: u64) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().to_path_buf();
        let script = dir.join("fake-go.sh");
        std::fs::write(&script, FAKE_TOOLCHAIN.replace("@DIR@", &dir.display().to_string())).unwrap();

        let config = Config {
            port: 0,
            workers,
            max_archive_bytes,
            queue_capacity,
            sandbox_root: dir.join("sandboxes"),
            preserve_permissions: false,
            toolchain: ToolchainConfig {
                command: vec!["/bin/sh".to_string(), script.display().to_string()],
                ..ToolchainConfig::default()
            },
        };
        let info = toolchain_info(&config.toolchain).unwrap();
        let state = AppState::start(config, info).unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(http_server::serve(listener, state.clone()));

        Self {
            _tmp: tmp,
            dir,
            base: format!("http://{}", addr),
            client: reqwest::Client::builder().no_proxy().build().unwrap(),
            state,
        }
    }

    async fn build(&self, package: &str, archive: Vec<u8>) -> reqwest::Response {
        self.client
            .post(format!("{}/build/{}", self.base, package))
            .body(archive)
            .send()
            .await
            .unwrap()
    }

    fn slot_dir(&self, index: usize) -> PathBuf {
        self.dir.join("sandboxes").join(index.to_string())
    }

    fn calls(&self) -> String {
        std::fs::read_to_string(self.dir.join("calls")).unwrap_or_default()
    }

    async fn wait_until(&self, what: &str, cond: impl Fn(&AppState) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !cond(&self.state) {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

fn tarball(files: &[(&str, &str)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, data) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, data.as_bytes()).unwrap();
    }
    builder.into_inner().unwrap()
}

const HELLO_BINARY: &str = "\x7fELF fake hello binary\n";

fn hello_archive() -> Vec<u8> {
    tarball(&[("src/example/hello/main.go", HELLO_BINARY)])
}

fn slow_archive(package: &str, delay: &str) -> Vec<u8> {
    let main = format!("src/{}/main.go", package);
    let delay_file = format!("src/{}/DELAY", package);
    tarball(&[(main.as_str(), "slow binary"), (delay_file.as_str(), delay)])
}

fn assert_not_exists(path: &Path) {
    assert!(!path.exists(), "{} should not exist", path.display());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_build_returns_artifact_bytes() {
    let h = Harness::start(1, 8, 2_000_000).await;

    let resp = h.build("example/hello", hello_archive()).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers()["content-length"],
        HELLO_BINARY.len().to_string().as_str()
    );
    assert_eq!(resp.headers()["accept-ranges"], "bytes");
    assert_eq!(resp.bytes().await.unwrap().as_ref(), HELLO_BINARY.as_bytes());

    assert_not_exists(&h.slot_dir(0));
    assert_eq!(h.calls(), "get example/hello\n");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_insecure_flag_is_separate_argument() {
    let h = Harness::start(1, 8, 2_000_000).await;

    let resp = h
        .client
        .post(format!("{}/build/example/hello?insecure=true", h.base))
        .body(hello_archive())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(h.calls(), "get -insecure example/hello\n");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_oversize_archive_is_413_without_build() {
    let h = Harness::start(1, 8, 1024).await;

    let big = tarball(&[("src/example/hello/main.go", "x".repeat(4096).as_str())]);
    let resp = h.build("example/hello", big).await;
    assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(resp.text().await.unwrap(), "request body too large");
    assert_eq!(h.calls(), "");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_chunked_upload_past_cap_is_413_without_build() {
    let h = Harness::start(1, 8, 4096).await;

    // A valid archive followed by padding: only the full body exceeds the cap.
    let archive = hello_archive();
    assert!(archive.len() < 4096);
    let chunks: Vec<Result<Vec<u8>, std::io::Error>> = vec![Ok(archive), Ok(vec![0u8; 32 * 1024])];
    let resp = h
        .client
        .post(format!("{}/build/example/hello", h.base))
        .body(reqwest::Body::wrap_stream(futures_util::stream::iter(chunks)))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(resp.text().await.unwrap(), "request body too large");
    assert_eq!(h.calls(), "");
    assert_not_exists(&h.slot_dir(0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_client_disconnect_cancels_build() {
    let h = Harness::start(1, 8, 2_000_000).await;

    let archive = slow_archive("example/sleepy", "30");
    let addr = h.base.trim_start_matches("http://");
    let mut conn = tokio::net::TcpStream::connect(addr).await.unwrap();
    let head = format!(
        "POST /build/example/sleepy HTTP/1.1\r\nHost: {}\r\nContent-Length: {}\r\n\r\n",
        addr,
        archive.len()
    );
    conn.write_all(head.as_bytes()).await.unwrap();
    conn.write_all(&archive).await.unwrap();

    let running = h.dir.join("running");
    let deadline = Instant::now() + Duration::from_secs(10);
    while std::fs::read_dir(&running).map_or(true, |mut d| d.next().is_none()) {
        assert!(Instant::now() < deadline, "toolchain never started");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(h.state.busy(), 1);

    let dropped = Instant::now();
    drop(conn);
    h.wait_until("cancelled build to free its worker", |s| s.busy() == 0)
        .await;
    assert!(dropped.elapsed() < Duration::from_secs(10));
    assert_not_exists(&h.slot_dir(0));

    // The freed worker takes the next job.
    let resp = h.build("example/hello", hello_archive()).await;
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_garbage_archive_is_422_without_build() {
    let h = Harness::start(1, 8, 2_000_000).await;

    let resp = h.build("example/hello", b"not a tar!".to_vec()).await;
    assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body = resp.text().await.unwrap();
    assert!(body.contains("extract archive"), "got: {}", body);
    assert_eq!(h.calls(), "");
    assert_not_exists(&h.slot_dir(0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_compile_error_body_is_toolchain_output() {
    let h = Harness::start(1, 8, 2_000_000).await;

    let archive = tarball(&[("src/example/broken/main.go", "package main\nSYNTAX\n}\n")]);
    let resp = h.build("example/broken", archive).await;
    assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let src = h.slot_dir(0).join("src/example/broken");
    let expected = format!(
        "# example/broken\n{}/main.go:3:1: syntax error: unexpected }}\n",
        src.display()
    );
    assert_eq!(resp.text().await.unwrap(), expected);
    assert_not_exists(&h.slot_dir(0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sequential_jobs_do_not_share_files() {
    let h = Harness::start(1, 8, 2_000_000).await;

    let first = h.build("example/hello", hello_archive()).await;
    assert_eq!(first.status(), StatusCode::OK);

    // Same slot, same package, but this archive does not contain it.
    let other = tarball(&[("src/example/other/main.go", "other")]);
    let second = h.build("example/hello", other).await;
    assert_eq!(second.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body = second.text().await.unwrap();
    assert!(
        body.starts_with("cannot find package \"example/hello\""),
        "got: {}",
        body
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_builds_bounded_by_worker_count() {
    let h = Harness::start(2, 8, 2_000_000).await;

    let started = Instant::now();
    let mut requests = Vec::new();
    for i in 0..4 {
        let pkg = format!("example/slow{}", i);
        let archive = slow_archive(&pkg, "0.5");
        let client = h.client.clone();
        let url = format!("{}/build/{}", h.base, pkg);
        requests.push(tokio::spawn(async move {
            client.post(url).body(archive).send().await.unwrap().status()
        }));
    }
    for request in requests {
        assert_eq!(request.await.unwrap(), StatusCode::OK);
    }

    // Two waves of two builds each.
    assert!(started.elapsed() >= Duration::from_millis(1000));
    let observed = std::fs::read_to_string(h.dir.join("concurrency")).unwrap();
    let max = observed
        .lines()
        .map(|l| l.trim().parse::<usize>().unwrap())
        .max()
        .unwrap();
    assert!(max <= 2, "saw {} concurrent builds", max);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_full_queue_is_refused() {
    let h = Harness::start(1, 1, 2_000_000).await;

    let spawn_build = |pkg: &str| {
        let client = h.client.clone();
        let url = format!("{}/build/{}", h.base, pkg);
        let archive = slow_archive(pkg, "1");
        tokio::spawn(async move { client.post(url).body(archive).send().await.unwrap().status() })
    };

    let running = spawn_build("example/a");
    h.wait_until("first build to start", |s| s.busy() == 1).await;
    let queued = spawn_build("example/b");
    h.wait_until("second build to queue", |s| s.queue.depth() == 1).await;

    let refused = h.build("example/c", hello_archive()).await;
    assert_eq!(refused.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(refused.headers()["retry-after"], "1");

    assert_eq!(running.await.unwrap(), StatusCode::OK);
    assert_eq!(queued.await.unwrap(), StatusCode::OK);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_range_request() {
    let h = Harness::start(1, 8, 2_000_000).await;

    let resp = h
        .client
        .post(format!("{}/build/example/hello", h.base))
        .header("range", "bytes=0-3")
        .body(hello_archive())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        resp.headers()["content-range"],
        format!("bytes 0-3/{}", HELLO_BINARY.len()).as_str()
    );
    assert_eq!(resp.bytes().await.unwrap().as_ref(), &HELLO_BINARY.as_bytes()[..4]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_invalid_package_rejected() {
    let h = Harness::start(1, 8, 2_000_000).await;

    let resp = h.build("-insecure", hello_archive()).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(h.calls(), "");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_info_and_status() {
    let h = Harness::start(3, 16, 2_000_000).await;

    let info = h
        .client
        .get(format!("{}/info", h.base))
        .send()
        .await
        .unwrap();
    assert_eq!(info.status(), StatusCode::OK);
    assert_eq!(
        info.text().await.unwrap(),
        "go version go0.0-fake linux/amd64\nGOOS=\"linux\"\n"
    );

    let status = h
        .client
        .get(format!("{}/status", h.base))
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = serde_json::from_slice(&status.bytes().await.unwrap()).unwrap();
    assert_eq!(body["workers"], 3);
    assert_eq!(body["busy"], 0);
    assert_eq!(body["queued"], 0);
    assert_eq!(body["queue_capacity"], 16);
    assert_eq!(body["max_archive_bytes"], 2_000_000);
}
