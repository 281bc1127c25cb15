//! End-to-end runs of the proxy binary with `/bin/cat` standing in for the
//! daemon, so every frame sent upstream comes straight back downstream.

#![cfg(unix)]

use buildservice_proxy_protocol::frame::encode_frame;
use buildservice_proxy_protocol::message::{encode_code, json_body, task_id_body};
use buildservice_proxy_protocol::{decode_message, FrameCodec};
use serde_json::{json, Value};
use std::io::{Read, Write};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const BIN: &str = env!("CARGO_BIN_EXE_buildservice-proxy");
const CAT: &str = "/bin/cat";

/// Kills the child if a test bails out early.
struct ChildGuard(Option<Child>);

impl ChildGuard {
    fn take(&mut self) -> Child {
        self.0.take().expect("child already taken")
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if let Some(child) = self.0.as_mut() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

fn proxy(cache: &Path) -> Command {
    let mut command = Command::new(BIN);
    command
        .env("BUILD_SERVICE_PROXY_DAEMON_PATH", CAT)
        .env("BUILD_SERVICE_PROXY_CACHE_DIR", cache)
        .env_remove("BUILD_SERVICE_PROXY_SESSION")
        .env_remove("BUILD_SERVICE_PROXY_OWNER_PID")
        .env_remove("BUILD_SERVICE_PROXY_DEBUG_LOG")
        .env_remove("RUST_LOG")
        .env_remove("BUILD_XCODE_SINGLE_FILE_PATH")
        .env_remove("continueBuildingAfterErrors");
    command
}

/// Collects a child's stdout on a background thread.
struct Output {
    rx: mpsc::Receiver<Vec<u8>>,
    buffered: Vec<u8>,
}

impl Output {
    fn capture(mut stdout: std::process::ChildStdout) -> Self {
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let mut chunk = [0u8; 4096];
            while let Ok(n) = stdout.read(&mut chunk) {
                if n == 0 || tx.send(chunk[..n].to_vec()).is_err() {
                    break;
                }
            }
        });
        Self {
            rx,
            buffered: Vec::new(),
        }
    }

    /// The next `len` bytes, or `None` if they do not arrive within `timeout`.
    fn next(&mut self, len: usize, timeout: Duration) -> Option<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        while self.buffered.len() < len {
            let left = deadline.checked_duration_since(Instant::now())?;
            match self.rx.recv_timeout(left) {
                Ok(chunk) => self.buffered.extend(chunk),
                Err(_) => return None,
            }
        }
        Some(self.buffered.drain(..len).collect())
    }
}

fn spawn_client(cache: &Path, session: &str) -> ChildGuard {
    let mut command = proxy(cache);
    command
        .args(["--proxy-role", "client", "--proxy-session", session])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null());
    ChildGuard(Some(command.spawn().expect("spawn client")))
}

fn stop_session(cache: &Path, session: &str) {
    let mut stop = proxy(cache);
    stop.args(["--proxy-role", "stop", "--proxy-session", session]);
    let (code, _) = run_to_completion(stop, b"");
    assert_eq!(code, 0);
}

fn log_contains(cache: &Path, role: &str, needle: &str) -> bool {
    std::fs::read_to_string(cache.join("logs").join(format!("{role}.log")))
        .map(|log| log.contains(needle))
        .unwrap_or(false)
}

fn split_frames(mut bytes: &[u8]) -> Vec<Vec<u8>> {
    let mut codec = FrameCodec::new();
    let mut frames = Vec::new();
    while !bytes.is_empty() {
        let used = codec.feed(bytes).expect("feed");
        bytes = &bytes[used..];
        if codec.is_complete() {
            frames.push(codec.frame().to_vec());
            codec.reset();
        }
    }
    codec.finish().expect("no partial frame at end of output");
    frames
}

fn create_build_frame(id: u64) -> Vec<u8> {
    let outer = json!({
        "sessionHandle": "S0",
        "request": {"continueBuildingAfterErrors": false, "configuredTargets": []}
    });
    encode_frame(id, &json_body("CREATE_BUILD", &outer))
}

fn request_of(frame: &[u8]) -> Value {
    let message = decode_message(frame).expect("decode");
    message.json().expect("json payload")["request"].clone()
}

/// Writes `input`, closes stdin and collects everything the proxy prints.
fn run_to_completion(mut command: Command, input: &[u8]) -> (i32, Vec<u8>) {
    let mut guard = ChildGuard(Some(
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn proxy"),
    ));
    let child = guard.0.as_mut().expect("child");
    let mut stdin = child.stdin.take().expect("stdin");
    stdin.write_all(input).expect("write input");
    drop(stdin);

    let mut stdout = child.stdout.take().expect("stdout");
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let mut output = Vec::new();
        let _ = stdout.read_to_end(&mut output);
        let _ = tx.send(output);
    });
    let output = rx
        .recv_timeout(Duration::from_secs(20))
        .expect("proxy did not finish");
    let status = guard.take().wait().expect("wait");
    (status.code().expect("exit code"), output)
}

#[test]
fn direct_mode_relays_frames_unchanged() {
    let cache = TempDir::new().expect("tempdir");
    let mut input = Vec::new();
    for id in 0..50u64 {
        let body = json_body("CREATE_SESSION", &json!({"name": format!("session-{id}"), "n": id}));
        input.extend(encode_frame(id, &body));
    }
    input.extend(encode_frame(50, b"\xa4PING"));
    input.extend(encode_frame(51, b""));

    let (code, output) = run_to_completion(proxy(cache.path()), &input);
    assert_eq!(code, 0);
    assert_eq!(output, input);
}

#[test]
fn direct_mode_rewrites_only_the_first_build_request() {
    let cache = TempDir::new().expect("tempdir");
    let first = create_build_frame(1);
    let second = create_build_frame(2);
    let input = [first.clone(), second.clone()].concat();

    let mut command = proxy(cache.path());
    command.env("continueBuildingAfterErrors", "YES");
    let (code, output) = run_to_completion(command, &input);
    assert_eq!(code, 0);

    let frames = split_frames(&output);
    assert_eq!(frames.len(), 2);
    assert_ne!(frames[0], first);
    assert_eq!(&frames[0][..8], &first[..8]);
    assert_eq!(request_of(&frames[0])["continueBuildingAfterErrors"], json!(true));
    assert_eq!(request_of(&frames[0])["configuredTargets"], json!([]));
    assert_eq!(frames[1], second);
}

#[test]
fn direct_mode_writes_target_status() {
    let cache = TempDir::new().expect("tempdir");
    let status_file = cache.path().join("status.log");

    let mut signature = b"P2:target-".to_vec();
    signature.extend_from_slice(b"GUID-APP");
    signature.extend_from_slice(b"-SDKROOT:macosx");
    let input = [
        encode_frame(
            1,
            &json_body(
                "BUILD_TARGET_STARTED",
                &json!({
                    "guid": "GUID-APP",
                    "id": 4,
                    "info": {"name": "App", "projectInfo": {"path": "/src/App.xcodeproj"}}
                }),
            ),
        ),
        encode_frame(
            2,
            &json_body(
                "BUILD_TASK_ENDED",
                &json!({"id": 30, "signature": signature, "status": 7}),
            ),
        ),
        encode_frame(3, &task_id_body("BUILD_TARGET_ENDED", 4)),
    ]
    .concat();

    let mut command = proxy(cache.path());
    command.arg("--proxy-status-file").arg(&status_file);
    let (code, output) = run_to_completion(command, &input);
    assert_eq!(code, 0);
    assert_eq!(output, input);

    let status = std::fs::read_to_string(&status_file).expect("status file");
    assert_eq!(status, "Fail:/src/App.xcodeproj::App:end_tail\n");
}

#[test]
fn missing_daemon_fails() {
    let cache = TempDir::new().expect("tempdir");
    let mut command = proxy(cache.path());
    command.env("BUILD_SERVICE_PROXY_DAEMON_PATH", cache.path().join("no-such-daemon"));
    let (code, output) = run_to_completion(command, b"");
    assert_eq!(code, 1);
    assert!(output.is_empty());
}

#[test]
fn session_roles_require_a_session() {
    let cache = TempDir::new().expect("tempdir");
    let mut command = proxy(cache.path());
    command.args(["--proxy-role", "server"]);
    let (code, _) = run_to_completion(command, b"");
    assert_eq!(code, 1);
}

#[test]
fn stop_without_server_is_a_no_op() {
    let cache = TempDir::new().expect("tempdir");
    let mut command = proxy(cache.path());
    command.args(["--proxy-role", "stop", "--proxy-session", "nobody-home"]);
    let (code, _) = run_to_completion(command, b"");
    assert_eq!(code, 0);
}

#[test]
fn client_relays_through_session_server() {
    let cache = TempDir::new().expect("tempdir");
    let session = format!("relay-roles-{}", std::process::id());
    let frame = encode_frame(
        9,
        &json_body("CREATE_SESSION", &json!({"name": "persistent"})),
    );

    let mut guard = spawn_client(cache.path(), &session);
    let child = guard.0.as_mut().expect("child");
    let mut stdin = child.stdin.take().expect("stdin");
    let mut stdout = Output::capture(child.stdout.take().expect("stdout"));
    stdin.write_all(&frame).expect("write frame");
    stdin.flush().expect("flush");
    assert_eq!(stdout.next(frame.len(), Duration::from_secs(20)), Some(frame));

    drop(stdin);
    let status = guard.take().wait().expect("wait client");
    assert_eq!(status.code(), Some(0));

    stop_session(cache.path(), &session);
}

#[test]
fn server_outlives_a_short_lived_parent() {
    let cache = TempDir::new().expect("tempdir");
    let session = format!("short-parent-{}", std::process::id());
    let frame = encode_frame(3, &json_body("CREATE_SESSION", &json!({"name": "nested"})));
    let input = cache.path().join("input.bin");
    std::fs::write(&input, &frame).expect("write input");

    // The client's parent is a shell that exits together with it.
    let mut shell = Command::new("sh");
    shell
        .arg("-c")
        .arg(r#""$0" --proxy-role client --proxy-session "$1" < "$2"; true"#)
        .arg(BIN)
        .arg(&session)
        .arg(&input);
    for (key, value) in proxy(cache.path()).get_envs() {
        match value {
            Some(value) => shell.env(key, value),
            None => shell.env_remove(key),
        };
    }
    let (code, output) = run_to_completion(shell, b"");
    assert_eq!(code, 0);
    assert_eq!(output, frame);

    std::thread::sleep(Duration::from_millis(1500));
    assert!(log_contains(cache.path(), "server", "Session server starting"));
    assert!(!log_contains(cache.path(), "server", "Owner process gone"));

    stop_session(cache.path(), &session);
    assert!(log_contains(cache.path(), "stop", "Stop requested"));
}

#[test]
fn pipes_are_handed_over_only_after_the_build_ends() {
    let cache = TempDir::new().expect("tempdir");
    let session = format!("hand-off-{}", std::process::id());
    let wait = Duration::from_secs(20);

    let mut first = spawn_client(cache.path(), &session);
    let first_child = first.0.as_mut().expect("child");
    let mut first_in = first_child.stdin.take().expect("stdin");
    let mut first_out = Output::capture(first_child.stdout.take().expect("stdout"));

    let build_start = encode_frame(1, &encode_code("BUILD_START"));
    first_in.write_all(&build_start).expect("write");
    first_in.flush().expect("flush");
    assert_eq!(first_out.next(build_start.len(), wait), Some(build_start));

    let mut second = spawn_client(cache.path(), &session);
    let second_child = second.0.as_mut().expect("child");
    let mut second_in = second_child.stdin.take().expect("stdin");
    let mut second_out = Output::capture(second_child.stdout.take().expect("stdout"));
    let hello = encode_frame(2, &json_body("CREATE_SESSION", &json!({"name": "second"})));
    second_in.write_all(&hello).expect("write");
    second_in.flush().expect("flush");

    // Building: the daemon stays on the first client's pipes.
    assert_eq!(second_out.next(hello.len(), Duration::from_millis(2000)), None);
    let progress = encode_frame(3, &json_body("CREATE_SESSION", &json!({"name": "still first"})));
    first_in.write_all(&progress).expect("write");
    first_in.flush().expect("flush");
    assert_eq!(first_out.next(progress.len(), wait), Some(progress));

    let ended = encode_frame(4, &encode_code("BUILD_OPERATION_ENDED"));
    first_in.write_all(&ended).expect("write");
    first_in.flush().expect("flush");
    assert_eq!(first_out.next(ended.len(), wait), Some(ended));

    assert_eq!(second_out.next(hello.len(), wait), Some(hello));

    drop(first_in);
    let status = first.take().wait().expect("wait first");
    assert_eq!(status.code(), Some(0));
    drop(second_in);
    let status = second.take().wait().expect("wait second");
    assert_eq!(status.code(), Some(0));

    stop_session(cache.path(), &session);
}
