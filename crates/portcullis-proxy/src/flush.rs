//! Response body streaming with bounded flush latency
//!
//! A [`FlushWriter`] sits between the upstream body and the client. Data is
//! buffered behind an async mutex and pushed to the client either on every
//! write (immediate mode) or by a ticker task every interval. The same mutex
//! is held across the channel send, so the ticker and the copy loop never
//! interleave partial flushes.

use bytes::{Bytes, BytesMut};
use futures::channel::mpsc;
use futures::SinkExt;
use http::{HeaderMap, Version};
use http_body::{Body as HttpBody, Frame};
use http_body_util::{BodyExt, StreamBody};
use portcullis_core::{Body, Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

type FrameResult = std::result::Result<Frame<Bytes>, hyper::Error>;

/// Frames buffered between the copy loop and the client
const CHANNEL_CAPACITY: usize = 16;

/// How often buffered response data is pushed to the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlushInterval {
    /// Frames pass straight through
    #[default]
    Disabled,
    /// Every write is flushed as soon as it arrives
    Immediate,
    /// Data is coalesced and flushed on a ticker
    Every(Duration),
}

/// Request facts used to pick a flush interval once the response is known
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamHints {
    event_stream: bool,
    unknown_length: bool,
    keep_alive: bool,
    h2: bool,
    identity_encoding: bool,
}

impl StreamHints {
    /// Capture hints from the inbound request
    pub fn from_request<B: HttpBody>(req: &http::Request<B>) -> Self {
        let headers = req.headers();

        let event_stream = headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(';').next())
            .map_or(false, |media| media.trim().eq_ignore_ascii_case("text/event-stream"));

        let keep_alive = headers
            .get_all(http::header::CONNECTION)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .any(|v| v.to_ascii_lowercase().contains("keep-alive"));

        let identity_encoding = headers
            .get(http::header::ACCEPT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map_or(true, |v| v.is_empty() || v == "identity");

        Self {
            event_stream,
            unknown_length: req.body().size_hint().exact().is_none(),
            keep_alive,
            h2: req.version() == Version::HTTP_2,
            identity_encoding,
        }
    }

    /// Interval for a response, falling back to `configured`
    pub fn resolve<B: HttpBody>(
        &self,
        configured: FlushInterval,
        response: &http::Response<B>,
    ) -> FlushInterval {
        let bidirectional = self.h2
            && response.version() == Version::HTTP_2
            && response.body().size_hint().exact().is_none()
            && self.identity_encoding;

        if self.event_stream || self.unknown_length || bidirectional || self.keep_alive {
            return FlushInterval::Immediate;
        }
        configured
    }
}

/// Hook run once the body has been fully relayed
pub type ExitHook = Box<dyn FnOnce(u64) + Send + 'static>;

struct FlushState {
    buf: BytesMut,
    tx: mpsc::Sender<FrameResult>,
}

impl FlushState {
    async fn flush(&mut self) -> Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let chunk = self.buf.split().freeze();
        self.send(Frame::data(chunk)).await
    }

    async fn send(&mut self, frame: Frame<Bytes>) -> Result<()> {
        self.tx.send(Ok(frame)).await.map_err(|_| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "client went away",
            ))
        })
    }
}

/// Latency-bounded writer feeding a response body channel
pub struct FlushWriter {
    state: Arc<Mutex<FlushState>>,
    latency: Option<Duration>,
    ticker: Option<JoinHandle<()>>,
    on_exit: Option<ExitHook>,
    written: u64,
}

impl std::fmt::Debug for FlushWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlushWriter")
            .field("latency", &self.latency)
            .field("written", &self.written)
            .finish()
    }
}

impl FlushWriter {
    /// Create a writer. `None` latency flushes on every write.
    pub fn new(tx: mpsc::Sender<FrameResult>, latency: Option<Duration>) -> Self {
        let state = Arc::new(Mutex::new(FlushState {
            buf: BytesMut::new(),
            tx,
        }));

        let ticker = latency.map(|every| {
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
                loop {
                    ticker.tick().await;
                    if state.lock().await.flush().await.is_err() {
                        break;
                    }
                }
            })
        });

        Self {
            state,
            latency,
            ticker,
            on_exit: None,
            written: 0,
        }
    }

    /// Run `hook` with the byte count once the writer finishes
    pub fn on_exit(mut self, hook: ExitHook) -> Self {
        self.on_exit = Some(hook);
        self
    }

    /// Buffer a chunk, flushing right away in immediate mode
    pub async fn write(&mut self, chunk: Bytes) -> Result<()> {
        self.written += chunk.len() as u64;
        let mut state = self.state.lock().await;
        state.buf.extend_from_slice(&chunk);
        if self.latency.is_none() {
            state.flush().await?;
        }
        Ok(())
    }

    /// Push buffered data now
    pub async fn flush(&mut self) -> Result<()> {
        self.state.lock().await.flush().await
    }

    fn stop(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
    }

    /// Stop the ticker, flush what is left, then send trailers
    pub async fn finish(mut self, trailers: Option<HeaderMap>) -> Result<u64> {
        self.stop();
        {
            let mut state = self.state.lock().await;
            state.flush().await?;
            if let Some(trailers) = trailers {
                state.send(Frame::trailers(trailers)).await?;
            }
        }
        if let Some(hook) = self.on_exit.take() {
            hook(self.written);
        }
        Ok(self.written)
    }
}

impl Drop for FlushWriter {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Relay `body` to the client according to `interval`
pub fn stream_body<B>(body: B, interval: FlushInterval, on_exit: Option<ExitHook>) -> Body
where
    B: HttpBody<Data = Bytes, Error = hyper::Error> + Send + Sync + Unpin + 'static,
{
    let latency = match interval {
        FlushInterval::Disabled => return body.boxed(),
        FlushInterval::Immediate => None,
        FlushInterval::Every(every) => Some(every),
    };

    let (mut tx, rx) = mpsc::channel::<FrameResult>(CHANNEL_CAPACITY);
    let mut writer = FlushWriter::new(tx.clone(), latency);
    if let Some(hook) = on_exit {
        writer = writer.on_exit(hook);
    }

    tokio::spawn(async move {
        let mut body = body;
        let mut trailers = None;

        while let Some(frame) = body.frame().await {
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::debug!(category = "proxy", error = %e, "Upstream body read error");
                    let _ = writer.flush().await;
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            };

            match frame.into_data() {
                Ok(data) => {
                    if writer.write(data).await.is_err() {
                        return;
                    }
                }
                Err(frame) => {
                    if let Ok(map) = frame.into_trailers() {
                        trailers = Some(map);
                    }
                }
            }
        }

        if let Err(e) = writer.finish(trailers).await {
            tracing::debug!(category = "proxy", error = %e, "Client left before the body was relayed");
        }
    });

    StreamBody::new(rx).boxed()
}
