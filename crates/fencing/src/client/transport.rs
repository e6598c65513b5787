//! Channel to the fencer.
//!
//! [`UnixTransport`] speaks newline-delimited JSON over a Unix stream socket.
//! A reader task splits incoming frames in two: direct responses go to
//! whoever is waiting in [`Transport::send`], everything else is queued as an
//! event for the dispatcher.

use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use super::message::{Frame, Response};
use crate::error::{FenceError, Result};

/// What [`Transport::next_event`] and [`Transport::try_next_event`] produce.
#[derive(Debug)]
pub enum Incoming {
    Frame(Frame),
    /// A frame arrived but could not be decoded.
    Malformed(FenceError),
    /// Nothing queued right now.
    Empty,
    /// The fencer went away.
    Closed,
}

/// Connection to the fencer.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `frame`. With `expect_response`, wait up to `timeout` for the
    /// fencer's direct response and return it.
    async fn send(
        &self,
        frame: &Frame,
        expect_response: bool,
        timeout: Option<Duration>,
    ) -> Result<Option<Response>>;

    /// Wait up to `timeout` for another direct response.
    ///
    /// Used after [`Transport::send`] returned a response that belonged to an
    /// earlier request.
    async fn next_response(&self, timeout: Option<Duration>) -> Result<Response>;

    /// Wait for the next pushed frame.
    async fn next_event(&self) -> Incoming;

    /// Next pushed frame if one is already queued.
    fn try_next_event(&self) -> Incoming;

    fn is_connected(&self) -> bool;

    /// Stop reading and mark the channel closed.
    fn close(&self);
}

/// NDJSON over a Unix stream socket.
pub struct UnixTransport {
    writer: Mutex<OwnedWriteHalf>,
    responses: Mutex<mpsc::UnboundedReceiver<Result<Response>>>,
    events: Mutex<mpsc::UnboundedReceiver<Incoming>>,
    connected: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl UnixTransport {
    /// Connect to the fencer listening on `path`.
    pub async fn connect(path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(path).await.map_err(|e| {
            debug!(socket = %path.display(), error = %e, "Connection to fencer failed");
            FenceError::NotConnected
        })?;
        debug!(socket = %path.display(), "Connected to fencer socket");
        Ok(Self::from_stream(stream))
    }

    /// Wrap an already connected stream.
    pub fn from_stream(stream: UnixStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        let (response_tx, response_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(true));
        let reader = tokio::spawn(read_frames(
            read_half,
            response_tx,
            event_tx,
            Arc::clone(&connected),
        ));
        Self {
            writer: Mutex::new(write_half),
            responses: Mutex::new(response_rx),
            events: Mutex::new(event_rx),
            connected,
            reader,
        }
    }

    async fn write_frame(&self, frame: &Frame) -> Result<()> {
        let line = frame.encode()?;
        let mut writer = self.writer.lock().await;
        let written = async {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        }
        .await;
        written.map_err(|e| {
            error!(error = %e, "Could not send message to fencer");
            self.connected.store(false, Ordering::SeqCst);
            FenceError::Communication(e.to_string())
        })
    }
}

#[async_trait]
impl Transport for UnixTransport {
    async fn send(
        &self,
        frame: &Frame,
        expect_response: bool,
        timeout: Option<Duration>,
    ) -> Result<Option<Response>> {
        if !self.is_connected() {
            return Err(FenceError::NotConnected);
        }
        if !expect_response {
            self.write_frame(frame).await?;
            return Ok(None);
        }

        // Hold the response queue across the write so no one else takes our answer.
        let mut responses = self.responses.lock().await;
        self.write_frame(frame).await?;
        recv_response(&mut responses, timeout).await.map(Some)
    }

    async fn next_response(&self, timeout: Option<Duration>) -> Result<Response> {
        let mut responses = self.responses.lock().await;
        recv_response(&mut responses, timeout).await
    }

    async fn next_event(&self) -> Incoming {
        self.events.lock().await.recv().await.unwrap_or(Incoming::Closed)
    }

    fn try_next_event(&self) -> Incoming {
        let Ok(mut events) = self.events.try_lock() else {
            return Incoming::Empty;
        };
        match events.try_recv() {
            Ok(incoming) => incoming,
            Err(mpsc::error::TryRecvError::Empty) => Incoming::Empty,
            Err(mpsc::error::TryRecvError::Disconnected) => Incoming::Closed,
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.reader.abort();
    }
}

impl Drop for UnixTransport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn recv_response(
    responses: &mut mpsc::UnboundedReceiver<Result<Response>>,
    timeout: Option<Duration>,
) -> Result<Response> {
    let received = match timeout {
        Some(timeout) => tokio::time::timeout(timeout, responses.recv())
            .await
            .map_err(|_| {
                FenceError::Communication(format!(
                    "no response from the fencer within {timeout:?}"
                ))
            })?,
        None => responses.recv().await,
    };
    received.unwrap_or_else(|| {
        Err(FenceError::Communication(
            "fencer closed the connection".to_string(),
        ))
    })
}

async fn read_frames(
    read_half: OwnedReadHalf,
    responses: mpsc::UnboundedSender<Result<Response>>,
    events: mpsc::UnboundedSender<Incoming>,
    connected: Arc<AtomicBool>,
) {
    let mut lines = BufReader::new(read_half).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!("Fencer closed the connection");
                break;
            }
            Err(e) => {
                warn!(error = %e, "Reading from fencer failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        trace!(message = %line, "Received message from fencer");

        let value: serde_json::Value = match serde_json::from_str(&line) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, message = %line, "Received malformed message from fencer");
                continue;
            }
        };

        // A closed receiver just means nobody is listening any more.
        if value.get("type").and_then(serde_json::Value::as_str) == Some("response") {
            let response = serde_json::from_value::<Response>(value).map_err(FenceError::from);
            let _ = responses.send(response);
        } else {
            let incoming = match serde_json::from_value::<Frame>(value) {
                Ok(frame) => Incoming::Frame(frame),
                Err(e) => Incoming::Malformed(e.into()),
            };
            let _ = events.send(incoming);
        }
    }
    connected.store(false, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::message::{Notification, Reply, Request};
    use crate::client::options::CallOptions;

    fn request(call_id: i32) -> Frame {
        Frame::Command(Request {
            operation: "st_query".to_string(),
            call_id,
            call_options: CallOptions::sync(),
            client_token: None,
            client_name: None,
            timeout: 0,
            payload: None,
        })
    }

    async fn write_line(peer: &mut UnixStream, frame: &Frame) {
        peer.write_all(frame.encode().unwrap().as_bytes()).await.unwrap();
    }

    #[tokio::test]
    async fn test_responses_and_events_are_split() {
        let (ours, mut peer) = UnixStream::pair().unwrap();
        let transport = UnixTransport::from_stream(ours);

        write_line(
            &mut peer,
            &Frame::Notify(Notification {
                subtype: "st_notify_fence".to_string(),
                operation: None,
                result_code: 0,
                payload: None,
            }),
        )
        .await;
        write_line(
            &mut peer,
            &Frame::Response(Response {
                call_id: Some(1),
                result_code: Some(0),
                ..Response::default()
            }),
        )
        .await;

        let response = transport
            .send(&request(1), true, Some(Duration::from_secs(5)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.call_id, Some(1));

        assert!(matches!(
            transport.next_event().await,
            Incoming::Frame(Frame::Notify(_))
        ));
        assert!(matches!(transport.try_next_event(), Incoming::Empty));
    }

    #[tokio::test]
    async fn test_garbage_is_skipped_and_bad_events_reported() {
        let (ours, mut peer) = UnixStream::pair().unwrap();
        let transport = UnixTransport::from_stream(ours);

        peer.write_all(b"this is not json\n").await.unwrap();
        peer.write_all(b"{\"type\":\"reply\",\"call_id\":\"seven\"}\n").await.unwrap();
        write_line(
            &mut peer,
            &Frame::Reply(Reply {
                call_id: 2,
                result_code: 0,
                payload: None,
            }),
        )
        .await;

        assert!(matches!(transport.next_event().await, Incoming::Malformed(_)));
        assert!(matches!(
            transport.next_event().await,
            Incoming::Frame(Frame::Reply(Reply { call_id: 2, .. }))
        ));
    }

    #[tokio::test]
    async fn test_peer_hangup_closes_transport() {
        let (ours, peer) = UnixStream::pair().unwrap();
        let transport = UnixTransport::from_stream(ours);
        drop(peer);

        assert!(matches!(transport.next_event().await, Incoming::Closed));
        assert!(!transport.is_connected());
        assert_eq!(
            transport.send(&request(1), false, None).await.unwrap_err(),
            FenceError::NotConnected
        );
    }

    #[tokio::test]
    async fn test_next_response_reads_queued_responses_in_order() {
        let (ours, mut peer) = UnixStream::pair().unwrap();
        let transport = UnixTransport::from_stream(ours);

        for call_id in [1, 2] {
            write_line(
                &mut peer,
                &Frame::Response(Response {
                    call_id: Some(call_id),
                    result_code: Some(0),
                    ..Response::default()
                }),
            )
            .await;
        }

        let first = transport
            .send(&request(2), true, Some(Duration::from_secs(5)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.call_id, Some(1));
        let second = transport
            .next_response(Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(second.call_id, Some(2));
        assert!(matches!(
            transport.next_response(Some(Duration::from_millis(50))).await,
            Err(FenceError::Communication(_))
        ));
    }

    #[tokio::test]
    async fn test_response_wait_times_out() {
        let (ours, _peer) = UnixStream::pair().unwrap();
        let transport = UnixTransport::from_stream(ours);
        let err = transport
            .send(&request(1), true, Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, FenceError::Communication(_)));
    }
}
