//! Multiplexing of chat, file metadata and file chunks over one ordered
//! reliable link.
//!
//! Every message on the wire is a frame:
//!
//!   [1 byte: channel kind] [4 bytes: sequence, BE] [4 bytes: payload length, BE] [payload]
//!
//! Sequence numbers count independently per channel kind. Control and
//! metadata frames are always drained before the next chunk frame is written,
//! so chat keeps flowing while a large file is in flight.

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use log::{error, trace};
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use uuid::Uuid;

use crate::{
    error::{Result, TelekinesisError},
    models::FileMetadata,
    transport::Link,
};

pub const HEADER_LEN: usize = 9;

/// Chunks queued ahead of the writer. Keeps a slow link from buffering a
/// whole file in memory.
const CHUNK_QUEUE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ChannelKind {
    Control = 0x01,
    FileMeta = 0x02,
    FileChunk = 0x03,
}

impl ChannelKind {
    fn index(self) -> usize {
        self as usize - 1
    }
}

impl TryFrom<u8> for ChannelKind {
    type Error = TelekinesisError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(ChannelKind::Control),
            0x02 => Ok(ChannelKind::FileMeta),
            0x03 => Ok(ChannelKind::FileChunk),
            other => Err(TelekinesisError::Protocol(format!(
                "unknown channel kind 0x{other:02x}"
            ))),
        }
    }
}

/// Chat and session-level signals carried on the control channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    TextMessage { content: String },
    FileAbort { id: Uuid, reason: String },
    /// The receiver committed file `id`.
    FileComplete { id: Uuid },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: ChannelKind,
    pub seq: u32,
    pub payload: Bytes,
}

pub fn encode_frame(kind: ChannelKind, seq: u32, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u8(kind as u8);
    buf.put_u32(seq);
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(payload);
    buf.freeze()
}

pub fn decode_frame(data: &Bytes) -> Result<Frame> {
    if data.len() < HEADER_LEN {
        return Err(TelekinesisError::Protocol(format!(
            "frame of {} bytes is shorter than its header",
            data.len()
        )));
    }
    let kind = ChannelKind::try_from(data[0])?;
    let seq = u32::from_be_bytes([data[1], data[2], data[3], data[4]]);
    let len = u32::from_be_bytes([data[5], data[6], data[7], data[8]]) as usize;
    if data.len() - HEADER_LEN != len {
        return Err(TelekinesisError::Protocol(format!(
            "frame announces {len} payload bytes but carries {}",
            data.len() - HEADER_LEN
        )));
    }
    Ok(Frame {
        kind,
        seq,
        payload: data.slice(HEADER_LEN..),
    })
}

/// Inbound side: decodes frames and checks per-kind sequence continuity.
#[derive(Debug, Default)]
pub struct Demultiplexer {
    expected: [u32; 3],
}

impl Demultiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accept(&mut self, data: &Bytes) -> Result<Frame> {
        let frame = decode_frame(data)?;
        let slot = &mut self.expected[frame.kind.index()];
        if frame.seq != *slot {
            let expected = *slot;
            // resynchronise so a single bad frame does not poison the rest
            *slot = frame.seq.wrapping_add(1);
            return Err(TelekinesisError::Protocol(format!(
                "{:?} frame {} arrived, expected {expected}",
                frame.kind, frame.seq
            )));
        }
        *slot = slot.wrapping_add(1);
        Ok(frame)
    }
}

struct Outbound {
    kind: ChannelKind,
    payload: Bytes,
    ack: Option<oneshot::Sender<Result<()>>>,
}

/// Cloneable entry point for queueing frames on a running [`Multiplexer`].
#[derive(Clone)]
pub struct MuxSender {
    priority: mpsc::UnboundedSender<Outbound>,
    chunks: mpsc::Sender<Outbound>,
}

impl MuxSender {
    pub fn send_control(&self, msg: &ControlMessage) -> Result<()> {
        let payload = Bytes::from(serde_json::to_vec(msg)?);
        self.priority
            .send(Outbound {
                kind: ChannelKind::Control,
                payload,
                ack: None,
            })
            .map_err(|_| closed())
    }

    /// Resolves once the metadata frame has been handed to the link.
    pub async fn send_metadata(&self, meta: &FileMetadata) -> Result<()> {
        let payload = Bytes::from(serde_json::to_vec(meta)?);
        let (ack, done) = oneshot::channel();
        self.priority
            .send(Outbound {
                kind: ChannelKind::FileMeta,
                payload,
                ack: Some(ack),
            })
            .map_err(|_| closed())?;
        done.await.map_err(|_| closed())?
    }

    /// Resolves once the chunk has been handed to the link.
    pub async fn send_chunk(&self, payload: Bytes) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.chunks
            .send(Outbound {
                kind: ChannelKind::FileChunk,
                payload,
                ack: Some(ack),
            })
            .await
            .map_err(|_| closed())?;
        done.await.map_err(|_| closed())?
    }
}

fn closed() -> TelekinesisError {
    TelekinesisError::Transport("multiplexer is closed".into())
}

/// Outbound side: owns the writer task and the sequence counters.
pub struct Multiplexer {
    sender: MuxSender,
    writer: JoinHandle<()>,
}

impl Multiplexer {
    pub fn spawn(link: Arc<dyn Link>) -> Self {
        let (priority, priority_rx) = mpsc::unbounded_channel();
        let (chunks, chunks_rx) = mpsc::channel(CHUNK_QUEUE);
        let writer = tokio::spawn(write_frames(link, priority_rx, chunks_rx));
        Self {
            sender: MuxSender { priority, chunks },
            writer,
        }
    }

    pub fn sender(&self) -> MuxSender {
        self.sender.clone()
    }

    pub fn send_control(&self, msg: &ControlMessage) -> Result<()> {
        self.sender.send_control(msg)
    }

    /// Stops the writer immediately; anything still queued is dropped and its
    /// waiters see a closed multiplexer.
    pub fn shutdown(self) {
        self.writer.abort();
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        self.writer.abort();
    }
}

async fn write_frames(
    link: Arc<dyn Link>,
    mut priority: mpsc::UnboundedReceiver<Outbound>,
    mut chunks: mpsc::Receiver<Outbound>,
) {
    let mut seqs = [0u32; 3];
    loop {
        let next = tokio::select! {
            biased;
            Some(out) = priority.recv() => out,
            Some(out) = chunks.recv() => out,
            else => break,
        };

        let slot = &mut seqs[next.kind.index()];
        let frame = encode_frame(next.kind, *slot, &next.payload);
        *slot = slot.wrapping_add(1);

        trace!("writing {:?} frame of {} bytes", next.kind, frame.len());
        let result = link.send(frame).await;
        match next.ack {
            Some(ack) => {
                let _ = ack.send(result);
            }
            None => {
                if let Err(e) = result {
                    error!("could not send {:?} frame: {e}", next.kind);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[test]
    fn frame_header_layout() {
        let frame = encode_frame(ChannelKind::FileChunk, 7, b"abc");
        assert_eq!(&frame[..], &[0x03, 0, 0, 0, 7, 0, 0, 0, 3, b'a', b'b', b'c']);
        let decoded = decode_frame(&frame).unwrap();
        assert_eq!(decoded.kind, ChannelKind::FileChunk);
        assert_eq!(decoded.seq, 7);
        assert_eq!(&decoded.payload[..], b"abc");
    }

    #[test]
    fn unknown_kind_is_a_protocol_error() {
        let mut frame = encode_frame(ChannelKind::Control, 0, b"{}").to_vec();
        frame[0] = 0x7f;
        let err = decode_frame(&Bytes::from(frame)).unwrap_err();
        assert!(matches!(err, TelekinesisError::Protocol(_)));
    }

    #[test]
    fn truncated_frames_are_rejected() {
        assert!(decode_frame(&Bytes::from_static(&[0x01, 0, 0])).is_err());
        let mut frame = encode_frame(ChannelKind::Control, 0, b"hello").to_vec();
        frame.pop();
        assert!(decode_frame(&Bytes::from(frame)).is_err());
    }

    #[test]
    fn demux_tracks_sequences_per_kind() {
        let mut demux = Demultiplexer::new();
        assert!(demux.accept(&encode_frame(ChannelKind::Control, 0, b"a")).is_ok());
        assert!(demux.accept(&encode_frame(ChannelKind::FileChunk, 0, b"b")).is_ok());
        assert!(demux.accept(&encode_frame(ChannelKind::Control, 1, b"c")).is_ok());
        // gap on the chunk channel
        assert!(demux.accept(&encode_frame(ChannelKind::FileChunk, 5, b"d")).is_err());
        assert!(demux.accept(&encode_frame(ChannelKind::FileChunk, 6, b"e")).is_ok());
        // an unknown kind does not disturb the others
        let mut bogus = encode_frame(ChannelKind::Control, 2, b"x").to_vec();
        bogus[0] = 0x09;
        assert!(demux.accept(&Bytes::from(bogus)).is_err());
        assert!(demux.accept(&encode_frame(ChannelKind::Control, 2, b"f")).is_ok());
    }

    #[test]
    fn control_messages_use_tagged_json() {
        let msg = ControlMessage::TextMessage {
            content: "hi".into(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"type":"text_message","content":"hi"}"#);
    }

    #[test]
    fn completion_names_the_transfer() {
        let id = Uuid::new_v4();
        let value = serde_json::to_value(ControlMessage::FileComplete { id }).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"type": "file_complete", "id": id.to_string()})
        );
    }

    /// Records frames and holds every chunk until the test lets it through.
    struct GatedLink {
        frames: Mutex<Vec<Frame>>,
        gate: tokio::sync::Semaphore,
    }

    #[async_trait]
    impl Link for GatedLink {
        async fn apply_answer(&self, _answer: &[u8]) -> Result<()> {
            Ok(())
        }

        async fn send(&self, frame: Bytes) -> Result<()> {
            let frame = decode_frame(&frame)?;
            if frame.kind == ChannelKind::FileChunk {
                self.gate.acquire().await.unwrap().forget();
            }
            self.frames.lock().unwrap().push(frame);
            Ok(())
        }

        async fn close(&self) {}
    }

    #[tokio::test]
    async fn chat_overtakes_queued_chunks() {
        let link = Arc::new(GatedLink {
            frames: Mutex::new(vec![]),
            gate: tokio::sync::Semaphore::new(0),
        });
        let mux = Multiplexer::spawn(link.clone());
        let sender = mux.sender();

        let chunk_task = {
            let sender = sender.clone();
            tokio::spawn(async move {
                for i in 0..3u8 {
                    sender.send_chunk(Bytes::from(vec![i; 4])).await.unwrap();
                }
            })
        };
        // the writer is now blocked inside the first chunk
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        mux.send_control(&ControlMessage::TextMessage {
            content: "hello".into(),
        })
        .unwrap();

        link.gate.add_permits(3);
        chunk_task.await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let kinds: Vec<ChannelKind> = link.frames.lock().unwrap().iter().map(|f| f.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ChannelKind::FileChunk,
                ChannelKind::Control,
                ChannelKind::FileChunk,
                ChannelKind::FileChunk
            ]
        );
        let seqs: Vec<u32> = link.frames.lock().unwrap().iter().map(|f| f.seq).collect();
        assert_eq!(seqs, vec![0, 0, 1, 2]);
    }

    #[tokio::test]
    async fn shutdown_fails_pending_chunks() {
        let link = Arc::new(GatedLink {
            frames: Mutex::new(vec![]),
            gate: tokio::sync::Semaphore::new(0),
        });
        let mux = Multiplexer::spawn(link);
        let sender = mux.sender();
        let pending = tokio::spawn(async move { sender.send_chunk(Bytes::from_static(b"x")).await });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        mux.shutdown();
        assert!(pending.await.unwrap().is_err());
    }
}
