//! Frame-aware byte pumps between the IDE side and the daemon.
//!
//! A pump reads exactly as many bytes as the frame codec needs to reach its
//! next boundary, hands each complete frame to the shared tracking state
//! (and the request modifier on the way to the daemon), then forwards the
//! frame. Frames that fail to decode are forwarded untouched; only a broken
//! frame structure stops a pump.
//!
//! The server swaps a pump's source or sink when another client attaches,
//! which is what [`Reattach`] carries.

use buildservice_proxy_protocol::{decode_message, FrameCodec};
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::ProxyError;
use crate::modifier::RequestModifier;
use crate::state::SharedState;

const READ_CHUNK: usize = 64 * 1024;
const TAIL_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// IDE to daemon.
    ClientToServer,
    /// Daemon to IDE.
    ServerToClient,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::ClientToServer => "client",
            Direction::ServerToClient => "server",
        }
    }
}

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A file another process appends to. End of file means "nothing yet".
pub struct TailFile {
    file: tokio::fs::File,
}

impl TailFile {
    pub async fn open(path: &Path) -> io::Result<Self> {
        let file = tokio::fs::File::open(path).await?;
        Ok(Self { file })
    }

    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let n = self.file.read(buf).await?;
            if n > 0 {
                return Ok(n);
            }
            tokio::time::sleep(TAIL_POLL_INTERVAL).await;
        }
    }
}

pub enum Source {
    /// Ends at end of stream.
    Stream(BoxedReader),
    /// Never ends on its own.
    Tail(TailFile),
}

impl Source {
    pub fn stream<R>(reader: R) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        Source::Stream(Box::new(reader))
    }

    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Source::Stream(reader) => reader.read(buf).await,
            Source::Tail(tail) => tail.read(buf).await,
        }
    }
}

/// Replacement endpoints for a running pump. `None` keeps the current one.
#[derive(Default)]
pub struct Reattach {
    pub source: Option<Source>,
    pub sink: Option<BoxedWriter>,
    pub modifier: Option<RequestModifier>,
}

pub struct Pump {
    direction: Direction,
    source: Option<Source>,
    sink: Option<BoxedWriter>,
    state: Option<Arc<SharedState>>,
    modifier: Option<RequestModifier>,
    reattach: Option<mpsc::Receiver<Reattach>>,
    frames: Option<Arc<AtomicU64>>,
}

impl Pump {
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            source: None,
            sink: None,
            state: None,
            modifier: None,
            reattach: None,
            frames: None,
        }
    }

    pub fn source(mut self, source: Source) -> Self {
        self.source = Some(source);
        self
    }

    pub fn sink<W>(mut self, sink: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        self.sink = Some(Box::new(sink));
        self
    }

    pub fn observed_by(mut self, state: Arc<SharedState>) -> Self {
        self.state = Some(state);
        self
    }

    pub fn modifier(mut self, modifier: RequestModifier) -> Self {
        self.modifier = Some(modifier);
        self
    }

    /// Counts forwarded frames into `counter`.
    pub fn count_frames(mut self, counter: Arc<AtomicU64>) -> Self {
        self.frames = Some(counter);
        self
    }

    pub fn reattachable(mut self) -> (Self, mpsc::Sender<Reattach>) {
        let (tx, rx) = mpsc::channel(4);
        self.reattach = Some(rx);
        (self, tx)
    }

    /// Runs until the source ends or `cancel` fires. Returns the number of
    /// frames forwarded.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<u64, ProxyError> {
        let direction = self.direction.as_str();
        let mut codec = FrameCodec::new();
        let mut buf = vec![0u8; READ_CHUNK];
        let mut forwarded = 0u64;

        loop {
            let want = codec.bytes_needed().clamp(1, READ_CHUNK);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(direction, forwarded, "Relay cancelled");
                    return Ok(forwarded);
                }
                Some(update) = next_reattach(&mut self.reattach) => {
                    self.apply_reattach(update, &mut codec);
                }
                read = read_source(&mut self.source, &mut buf[..want]) => {
                    let n = read?;
                    if n == 0 {
                        codec
                            .finish()
                            .map_err(|source| ProxyError::Framing { direction, source })?;
                        if let Some(sink) = self.sink.as_mut() {
                            sink.flush().await?;
                        }
                        debug!(direction, forwarded, "Relay source closed");
                        return Ok(forwarded);
                    }

                    let mut chunk = &buf[..n];
                    while !chunk.is_empty() {
                        let used = codec
                            .feed(chunk)
                            .map_err(|source| ProxyError::Framing { direction, source })?;
                        chunk = &chunk[used..];
                        if codec.is_complete() {
                            self.forward(&mut codec).await?;
                            forwarded += 1;
                            codec.reset();
                        }
                    }
                }
            }
        }
    }

    fn apply_reattach(&mut self, update: Reattach, codec: &mut FrameCodec) {
        let direction = self.direction.as_str();
        if let Some(source) = update.source {
            if !codec.is_at_boundary() {
                warn!(direction, "Dropping partial frame from detached source");
            }
            *codec = FrameCodec::new();
            self.source = Some(source);
        }
        if let Some(sink) = update.sink {
            self.sink = Some(sink);
        }
        if let Some(modifier) = update.modifier {
            self.modifier = Some(modifier);
        }
        debug!(direction, "Relay reattached");
    }

    async fn forward(&mut self, codec: &mut FrameCodec) -> Result<(), ProxyError> {
        let direction = self.direction.as_str();
        match decode_message(codec.frame()) {
            Ok(message) => {
                trace!(direction, code = %message.code, frame_len = codec.frame().len(), "Frame");
                if let Some(state) = self.state.as_ref() {
                    state.observe(self.direction, &message);
                }
                if let Some(modifier) = self.modifier.as_mut() {
                    modifier.apply(codec, &message);
                }
            }
            Err(err) => {
                debug!(direction, error = %err, frame_len = codec.frame().len(), "Undecodable frame forwarded as is");
            }
        }

        let Some(sink) = self.sink.as_mut() else {
            warn!(direction, frame_len = codec.frame().len(), "No client attached, dropping frame");
            return Ok(());
        };
        sink.write_all(codec.frame()).await?;
        sink.flush().await?;
        if let Some(frames) = self.frames.as_ref() {
            frames.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }
}

async fn next_reattach(rx: &mut Option<mpsc::Receiver<Reattach>>) -> Option<Reattach> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn read_source(source: &mut Option<Source>, buf: &mut [u8]) -> io::Result<usize> {
    match source {
        Some(source) => source.read(buf).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RequestFlags;
    use crate::tracker::tests::SharedBuffer;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use buildservice_proxy_protocol::frame::encode_frame;
    use buildservice_proxy_protocol::message::{encode_code, json_body, task_id_body};
    use buildservice_proxy_protocol::FramingError;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use serde_json::json;
    use std::io::Write;
    use tokio::io::{duplex, DuplexStream};

    fn sample_stream() -> Vec<u8> {
        let mut stream = Vec::new();
        stream.extend(encode_frame(1, &encode_code("BUILD_START")));
        stream.extend(encode_frame(
            2,
            &json_body(
                "BUILD_TARGET_STARTED",
                &json!({"guid": "G1", "id": 4, "info": {"name": "App", "projectInfo": {"path": "/p"}}}),
            ),
        ));
        stream.extend(encode_frame(3, &[]));
        stream.extend(encode_frame(4, &[0x01, 0x02, 0x03]));
        stream.extend(encode_frame(5, &task_id_body("BUILD_TARGET_ENDED", 4)));
        stream.extend(encode_frame(6, &encode_code("PING")));
        stream
    }

    fn spawn_chunked_writer(mut writer: DuplexStream, bytes: Vec<u8>, seed: u64) {
        tokio::spawn(async move {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut rest = &bytes[..];
            while !rest.is_empty() {
                let take = rng.gen_range(1..=rest.len().min(17));
                writer.write_all(&rest[..take]).await.expect("write chunk");
                rest = &rest[take..];
            }
        });
    }

    fn spawn_collector(mut reader: DuplexStream) -> tokio::task::JoinHandle<Vec<u8>> {
        tokio::spawn(async move {
            let mut out = Vec::new();
            reader.read_to_end(&mut out).await.expect("read output");
            out
        })
    }

    #[tokio::test]
    async fn forwards_arbitrarily_split_stream_unchanged() {
        let input = sample_stream();
        for seed in 0..20 {
            let (in_w, in_r) = duplex(64);
            let (out_w, out_r) = duplex(64);
            spawn_chunked_writer(in_w, input.clone(), seed);
            let collected = spawn_collector(out_r);

            let forwarded = Pump::new(Direction::ServerToClient)
                .source(Source::stream(in_r))
                .sink(out_w)
                .run(CancellationToken::new())
                .await
                .expect("relay");

            assert_eq!(forwarded, 6);
            assert_eq!(collected.await.expect("join"), input);
        }
    }

    #[tokio::test]
    async fn truncated_stream_is_a_framing_error() {
        let mut input = encode_frame(1, &encode_code("BUILD_START"));
        input.truncate(input.len() - 2);
        let (mut in_w, in_r) = duplex(256);
        in_w.write_all(&input).await.expect("write");
        drop(in_w);

        let err = Pump::new(Direction::ClientToServer)
            .source(Source::stream(in_r))
            .sink(tokio::io::sink())
            .run(CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProxyError::Framing {
                source: FramingError::Truncated { missing: 2 },
                ..
            }
        ));
    }

    #[tokio::test]
    async fn rewrites_first_build_request_on_the_way_in() {
        let inner = STANDARD.encode(json!({"continueBuildingAfterErrors": false}).to_string());
        let request = json_body(
            "CREATE_BUILD",
            &json!({"request": {"continueBuildingAfterErrors": false, "jsonRepresentation": inner}}),
        );
        let first = encode_frame(1, &request);
        let second = encode_frame(2, &request);

        let (mut in_w, in_r) = duplex(4096);
        let (out_w, out_r) = duplex(4096);
        in_w.write_all(&first).await.expect("write");
        in_w.write_all(&second).await.expect("write");
        drop(in_w);
        let collected = spawn_collector(out_r);

        let modifier = RequestModifier::new(RequestFlags {
            continue_building_after_errors: true,
            single_file_path: None,
        });
        Pump::new(Direction::ClientToServer)
            .source(Source::stream(in_r))
            .sink(out_w)
            .modifier(modifier)
            .run(CancellationToken::new())
            .await
            .expect("relay");

        let out = collected.await.expect("join");
        assert!(out.ends_with(&second));
        let rewritten = &out[..out.len() - second.len()];
        assert_ne!(rewritten, &first[..]);
        let message = decode_message(rewritten).expect("decode rewritten");
        assert_eq!(
            message.json().expect("json")["request"]["continueBuildingAfterErrors"],
            json!(true)
        );
    }

    #[tokio::test]
    async fn feeds_tracker_with_daemon_frames() {
        let statuses = SharedBuffer::default();
        let state = Arc::new(SharedState::new(Some(Box::new(statuses.clone()))));

        let (mut in_w, in_r) = duplex(4096);
        in_w.write_all(&sample_stream()).await.expect("write");
        drop(in_w);

        Pump::new(Direction::ServerToClient)
            .source(Source::stream(in_r))
            .sink(tokio::io::sink())
            .observed_by(state)
            .run(CancellationToken::new())
            .await
            .expect("relay");

        assert_eq!(statuses.contents(), "Success:/p::App:end_tail\n");
    }

    #[tokio::test]
    async fn reattach_switches_source_and_sink() {
        let (pump, reattach) = Pump::new(Direction::ClientToServer).reattachable();
        let cancel = CancellationToken::new();
        let counter = Arc::new(AtomicU64::new(0));
        let task = tokio::spawn(pump.count_frames(counter.clone()).run(cancel.clone()));

        let frame = encode_frame(7, &encode_code("BUILD_START"));
        let (mut in_w, in_r) = duplex(256);
        let (out_w, mut out_r) = duplex(256);
        reattach
            .send(Reattach {
                source: Some(Source::stream(in_r)),
                sink: Some(Box::new(out_w)),
                modifier: None,
            })
            .await
            .expect("send reattach");

        in_w.write_all(&frame).await.expect("write");
        let mut received = vec![0u8; frame.len()];
        out_r.read_exact(&mut received).await.expect("read");
        assert_eq!(received, frame);

        cancel.cancel();
        assert_eq!(task.await.expect("join").expect("relay"), 1);
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn tails_a_growing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("stdout");
        let first = encode_frame(1, &encode_code("BUILD_START"));
        let second = encode_frame(2, &encode_code("BUILD_OPERATION_ENDED"));
        let mut file = std::fs::File::create(&path).expect("create");
        file.write_all(&first).expect("write");

        let (out_w, mut out_r) = duplex(256);
        let cancel = CancellationToken::new();
        let tail = TailFile::open(&path).await.expect("open tail");
        let task = tokio::spawn(
            Pump::new(Direction::ServerToClient)
                .source(Source::Tail(tail))
                .sink(out_w)
                .run(cancel.clone()),
        );

        let mut received = vec![0u8; first.len()];
        out_r.read_exact(&mut received).await.expect("read first");
        assert_eq!(received, first);

        file.write_all(&second).expect("append");
        let mut received = vec![0u8; second.len()];
        out_r.read_exact(&mut received).await.expect("read second");
        assert_eq!(received, second);

        cancel.cancel();
        assert_eq!(task.await.expect("join").expect("relay"), 2);
    }
}
