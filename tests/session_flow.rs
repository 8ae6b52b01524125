//! Two peers in one process, wired together with the in-memory transport.

use std::{path::Path, sync::Arc, time::Duration};

use bytes::Bytes;
use telekinesis::{
    config::{Config, EventConfig, SessionConfig},
    descriptor::{self, SessionDescriptor},
    error::TelekinesisError,
    events::{Envelope, Event},
    models::{total_chunks, ChatDirection, Direction, FileMetadata, Role, SessionState},
    mux::{decode_frame, encode_frame, ChannelKind, ControlMessage},
    transfer::OutgoingFile,
    transport::{memory::MemoryConnector, Connector, Link, LinkEvent},
    PeerService,
};
use tempfile::TempDir;
use tokio::sync::{broadcast::Receiver, mpsc};
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(10);

struct Peer {
    service: PeerService,
    feed: Receiver<Envelope>,
    dir: TempDir,
}

impl Peer {
    fn new(connector: &MemoryConnector) -> Self {
        Self::with_session(connector, |_| {})
    }

    fn with_session(connector: &MemoryConnector, tweak: impl FnOnce(&mut SessionConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut session = SessionConfig {
            chunk_size: 1024,
            progress_interval_ms: 0,
            negotiation_timeout_secs: 10,
            ..Default::default()
        };
        tweak(&mut session);
        let config = Config {
            download_dir: dir.path().join("downloads"),
            data_dir: dir.path().join("data"),
            session,
            events: EventConfig {
                heartbeat_interval_secs: 1,
                backlog: 4096,
            },
            ..Default::default()
        };
        let service = PeerService::with_connector(config, Arc::new(connector.clone()));
        let feed = service.events.subscribe(None).live;
        Self { service, feed, dir }
    }

    fn downloads(&self) -> std::path::PathBuf {
        self.dir.path().join("downloads")
    }

    /// Waits for the next event matching `f`, returning it and everything
    /// that came before it.
    async fn wait_for(&mut self, f: impl Fn(&Event) -> bool) -> (Event, Vec<Event>) {
        let feed = &mut self.feed;
        tokio::time::timeout(WAIT, async move {
            let mut seen = Vec::new();
            loop {
                let event = feed.recv().await.unwrap().event;
                if f(&event) {
                    return (event, seen);
                }
                seen.push(event);
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    async fn wait_state(&mut self, state: SessionState) -> Vec<Event> {
        let (_, seen) = self
            .wait_for(|e| *e == Event::ConnectionStateChanged { state })
            .await;
        seen
    }

    /// Waits until the sender has wrapped up its last transfer.
    async fn wait_transfer_done(&self) {
        tokio::time::timeout(WAIT, async {
            while self.service.session.status().await.unwrap().transfer.is_some() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("transfer did not finish");
    }

    fn write_file(&self, name: &str, contents: &[u8]) -> OutgoingFile {
        let path = self.dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        OutgoingFile::new(path, name)
    }
}

/// The far end of a link driven frame by frame, so tests can put exactly
/// what they want on the wire.
struct RawPeer {
    link: Arc<dyn Link>,
    rx: mpsc::UnboundedReceiver<LinkEvent>,
    seq: [u32; 3],
}

impl RawPeer {
    /// Offers a link and lets `peer` answer it.
    async fn connect(connector: &MemoryConnector, peer: &mut Peer) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (link, payload) = connector.offer(tx).await.unwrap();
        let offer = descriptor::encode(&SessionDescriptor::new(Role::Offerer, payload)).unwrap();

        peer.service.session.create_answer(offer).await.unwrap();
        let (Event::AnswerCreated { answer }, _) = peer
            .wait_for(|e| matches!(e, Event::AnswerCreated { .. }))
            .await
        else {
            unreachable!()
        };
        let answer = descriptor::decode(&answer).unwrap();
        link.apply_answer(&answer.payload).await.unwrap();

        assert_eq!(rx.recv().await, Some(LinkEvent::Open));
        peer.wait_state(SessionState::Connected).await;
        Self {
            link,
            rx,
            seq: [0; 3],
        }
    }

    async fn send(&mut self, kind: ChannelKind, payload: &[u8]) {
        let slot = &mut self.seq[kind as usize - 1];
        let frame = encode_frame(kind, *slot, payload);
        *slot += 1;
        self.link.send(frame).await.unwrap();
    }

    async fn send_control(&mut self, msg: &ControlMessage) {
        let payload = serde_json::to_vec(msg).unwrap();
        self.send(ChannelKind::Control, &payload).await;
    }

    async fn send_metadata(&mut self, meta: &FileMetadata) {
        let payload = serde_json::to_vec(meta).unwrap();
        self.send(ChannelKind::FileMeta, &payload).await;
    }

    /// Next frame of `kind` from the session under test, skipping others.
    async fn next_frame(&mut self, kind: ChannelKind) -> Bytes {
        tokio::time::timeout(WAIT, async {
            loop {
                match self.rx.recv().await {
                    Some(LinkEvent::Message(data)) => {
                        let frame = decode_frame(&data).unwrap();
                        if frame.kind == kind {
                            return frame.payload;
                        }
                    }
                    other => panic!("link ended: {other:?}"),
                }
            }
        })
        .await
        .expect("no frame arrived")
    }

    async fn next_control(&mut self) -> ControlMessage {
        let payload = self.next_frame(ChannelKind::Control).await;
        serde_json::from_slice(&payload).unwrap()
    }
}

fn metadata(name: &str, data: &[u8], chunk_size: u32) -> FileMetadata {
    FileMetadata {
        id: Uuid::new_v4(),
        file_name: name.into(),
        size: data.len() as u64,
        file_type: "application/octet-stream".into(),
        sha256: Some(sha256::digest(data)),
        chunk_size,
        total_chunks: total_chunks(data.len() as u64, chunk_size),
    }
}

fn dir_is_empty(dir: &Path) -> bool {
    match std::fs::read_dir(dir) {
        Ok(mut entries) => entries.next().is_none(),
        Err(_) => true,
    }
}

async fn connect(offerer: &mut Peer, answerer: &mut Peer) {
    offerer.service.session.create_offer().await.unwrap();
    let (Event::OfferCreated { offer }, _) = offerer
        .wait_for(|e| matches!(e, Event::OfferCreated { .. }))
        .await
    else {
        unreachable!()
    };

    answerer.service.session.create_answer(offer).await.unwrap();
    let (Event::AnswerCreated { answer }, _) = answerer
        .wait_for(|e| matches!(e, Event::AnswerCreated { .. }))
        .await
    else {
        unreachable!()
    };

    offerer.service.session.set_answer(answer).await.unwrap();
    offerer.wait_state(SessionState::Connected).await;
    answerer.wait_state(SessionState::Connected).await;
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[tokio::test]
async fn offer_answer_connects_both_sides() {
    let connector = MemoryConnector::new();
    let mut a = Peer::new(&connector);
    let mut b = Peer::new(&connector);

    connect(&mut a, &mut b).await;

    let a_status = a.service.session.status().await.unwrap();
    let b_status = b.service.session.status().await.unwrap();
    assert!(a_status.is_connected && b_status.is_connected);
    assert_eq!(a_status.role, Some(Role::Offerer));
    assert_eq!(b_status.role, Some(Role::Answerer));
    assert!(a_status.peer_descriptor_received);
    assert_eq!(a.service.events.state(), SessionState::Connected);
}

#[tokio::test]
async fn chat_flows_both_ways() {
    let connector = MemoryConnector::new();
    let mut a = Peer::new(&connector);
    let mut b = Peer::new(&connector);
    connect(&mut a, &mut b).await;

    a.service.session.send_message("hello").await.unwrap();
    let (event, _) = b
        .wait_for(|e| matches!(e, Event::MessageReceived { .. }))
        .await;
    assert_eq!(event, Event::MessageReceived { text: "hello".into() });

    b.service.session.send_message("hi back").await.unwrap();
    a.wait_for(|e| matches!(e, Event::MessageReceived { .. }))
        .await;

    let log = a.service.session.chat_log().await.unwrap();
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].direction, ChatDirection::Sent);
    assert_eq!(log[1].direction, ChatDirection::Received);
    assert_eq!(log[1].text, "hi back");
}

#[tokio::test]
async fn file_arrives_intact_with_monotonic_progress() {
    let connector = MemoryConnector::new();
    let mut a = Peer::new(&connector);
    let mut b = Peer::new(&connector);
    connect(&mut a, &mut b).await;

    let data = payload(10 * 1024 + 17);
    let file = a.write_file("data.bin", &data);
    a.service.session.send_file(file).await.unwrap();

    let (Event::FileReceived { filename, path }, before) = b
        .wait_for(|e| matches!(e, Event::FileReceived { .. }))
        .await
    else {
        unreachable!()
    };
    assert_eq!(filename, "data.bin");
    assert_eq!(std::fs::read(&path).unwrap(), data);

    let progress: Vec<f64> = before
        .iter()
        .filter_map(|e| match e {
            Event::Progress {
                progress,
                is_sending: false,
            } => Some(*progress),
            _ => None,
        })
        .collect();
    assert!(!progress.is_empty());
    assert!(progress.windows(2).all(|w| w[0] <= w[1]));
    assert!(progress.iter().all(|p| (0.0..=100.0).contains(p)));
    assert_eq!(progress.last(), Some(&100.0));

    // the sender finishes at 100 too
    let (Event::Progress { progress, .. }, _) = a
        .wait_for(|e| {
            matches!(
                e,
                Event::Progress {
                    is_sending: true,
                    progress
                } if *progress == 100.0
            )
        })
        .await
    else {
        unreachable!()
    };
    assert_eq!(progress, 100.0);
    a.wait_transfer_done().await;

    // a second copy gets a numbered name
    let file = a.write_file("data.bin", &data);
    a.service.session.send_file(file).await.unwrap();
    let (Event::FileReceived { filename, .. }, _) = b
        .wait_for(|e| matches!(e, Event::FileReceived { .. }))
        .await
    else {
        unreachable!()
    };
    assert_eq!(filename, "data_1.bin");
}

#[tokio::test]
async fn empty_file_completes_without_chunks() {
    let connector = MemoryConnector::new();
    let mut a = Peer::new(&connector);
    let mut b = Peer::new(&connector);
    connect(&mut a, &mut b).await;

    let file = a.write_file("empty.txt", b"");
    a.service.session.send_file(file).await.unwrap();

    let (first, _) = b.wait_for(|e| matches!(e, Event::Progress { .. })).await;
    assert_eq!(
        first,
        Event::Progress {
            progress: 100.0,
            is_sending: false
        }
    );
    let (Event::FileReceived { path, .. }, _) = b
        .wait_for(|e| matches!(e, Event::FileReceived { .. }))
        .await
    else {
        unreachable!()
    };
    assert_eq!(std::fs::metadata(path).unwrap().len(), 0);

    let (first, _) = a.wait_for(|e| matches!(e, Event::Progress { .. })).await;
    assert_eq!(
        first,
        Event::Progress {
            progress: 100.0,
            is_sending: true
        }
    );
}

#[tokio::test]
async fn peer_close_mid_transfer_discards_partial_file() {
    let connector = MemoryConnector::with_frame_delay(Duration::from_millis(5));
    let mut a = Peer::new(&connector);
    let mut b = Peer::new(&connector);
    connect(&mut a, &mut b).await;

    let file = a.write_file("big.bin", &payload(400 * 1024));
    a.service.session.send_file(file).await.unwrap();
    b.wait_for(|e| matches!(e, Event::Progress { progress, .. } if *progress > 0.0))
        .await;

    a.service.session.disconnect().await.unwrap();
    let before_close = b.wait_state(SessionState::Closed).await;

    assert!(before_close
        .iter()
        .any(|e| matches!(e, Event::Error { .. })));
    assert!(!before_close
        .iter()
        .any(|e| matches!(e, Event::FileReceived { .. })));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(dir_is_empty(&b.downloads()));
    assert!(b.service.session.status().await.unwrap().transfer.is_none());

    // closed is terminal until the user moves on
    b.service.session.reset().await.unwrap();
    assert_eq!(
        b.service.session.status().await.unwrap().state,
        SessionState::Idle
    );
}

#[tokio::test]
async fn second_transfer_is_refused_while_one_is_active() {
    let connector = MemoryConnector::with_frame_delay(Duration::from_millis(1));
    let mut a = Peer::new(&connector);
    let mut b = Peer::new(&connector);
    connect(&mut a, &mut b).await;

    let data = payload(256 * 1024);
    let first = a.write_file("first.bin", &data);
    a.service.session.send_file(first).await.unwrap();

    let second = a.write_file("second.bin", b"second");
    assert!(matches!(
        a.service.session.send_file(second).await,
        Err(TelekinesisError::AlreadyTransferring)
    ));

    // the receiving side is busy as well
    b.wait_for(|e| matches!(e, Event::Progress { .. })).await;
    let reverse = b.write_file("reverse.bin", b"reverse");
    assert!(matches!(
        b.service.session.send_file(reverse).await,
        Err(TelekinesisError::AlreadyTransferring)
    ));

    let (Event::FileReceived { path, .. }, _) = b
        .wait_for(|e| matches!(e, Event::FileReceived { .. }))
        .await
    else {
        unreachable!()
    };
    assert_eq!(std::fs::read(path).unwrap(), data);
}

#[tokio::test]
async fn chat_is_not_stuck_behind_a_file() {
    let connector = MemoryConnector::with_frame_delay(Duration::from_millis(2));
    let mut a = Peer::new(&connector);
    let mut b = Peer::new(&connector);
    connect(&mut a, &mut b).await;

    let file = a.write_file("slow.bin", &payload(128 * 1024));
    a.service.session.send_file(file).await.unwrap();
    b.wait_for(|e| matches!(e, Event::Progress { .. })).await;

    a.service.session.send_message("still here").await.unwrap();
    let (_, before) = b
        .wait_for(|e| matches!(e, Event::MessageReceived { .. }))
        .await;
    assert!(!before
        .iter()
        .any(|e| matches!(e, Event::FileReceived { .. })));

    b.wait_for(|e| matches!(e, Event::FileReceived { .. }))
        .await;
}

#[tokio::test]
async fn disconnect_twice_is_harmless() {
    let connector = MemoryConnector::new();
    let mut a = Peer::new(&connector);
    let mut b = Peer::new(&connector);
    connect(&mut a, &mut b).await;
    let old_session = a.service.session.status().await.unwrap().session_id;

    a.service.session.disconnect().await.unwrap();
    a.wait_state(SessionState::Idle).await;
    assert!(matches!(
        a.service.session.disconnect().await,
        Err(TelekinesisError::InvalidState { .. })
    ));

    let status = a.service.session.status().await.unwrap();
    assert_eq!(status.state, SessionState::Idle);
    assert_ne!(status.session_id, old_session);
    assert_eq!(status.chat_messages, 0);

    b.wait_state(SessionState::Closed).await;
}

#[tokio::test]
async fn closed_feed_can_be_resumed_from_backlog() {
    let connector = MemoryConnector::new();
    let mut a = Peer::new(&connector);
    let mut b = Peer::new(&connector);
    connect(&mut a, &mut b).await;

    // a push consumer on b goes away here
    let seen = b.service.events.last_id();

    let file = a.write_file("late.txt", b"while you were away");
    a.service.session.send_file(file).await.unwrap();
    b.wait_for(|e| matches!(e, Event::FileReceived { .. }))
        .await;
    a.service.session.disconnect().await.unwrap();
    b.wait_state(SessionState::Closed).await;

    let resumed = b.service.events.subscribe(Some(seen));
    assert!(!resumed.gap);
    let missed: Vec<Event> = resumed.replay.into_iter().map(|e| e.event).collect();
    assert!(missed
        .iter()
        .any(|e| matches!(e, Event::FileReceived { .. })));
    assert!(missed.contains(&Event::ConnectionStateChanged {
        state: SessionState::Closed
    }));

    // and a poller sees the same terminal events
    let snapshot = b.service.events.poll();
    assert_eq!(snapshot.files_received.len(), 1);
    assert!(snapshot.state_changes.contains(&SessionState::Closed));
    assert_eq!(snapshot.connection_state, SessionState::Closed);
}

#[tokio::test]
async fn stop_tears_the_session_down() {
    let connector = MemoryConnector::new();
    let mut a = Peer::new(&connector);
    let mut b = Peer::new(&connector);
    connect(&mut a, &mut b).await;

    a.service.stop().await;
    b.wait_state(SessionState::Closed).await;
    assert!(matches!(
        a.service.session.status().await,
        Err(TelekinesisError::ServiceStopped)
    ));
}

#[tokio::test]
async fn local_disconnect_mid_send_is_reported() {
    let connector = MemoryConnector::with_frame_delay(Duration::from_millis(5));
    let mut a = Peer::new(&connector);
    let mut b = Peer::new(&connector);
    connect(&mut a, &mut b).await;

    let file = a.write_file("big.bin", &payload(400 * 1024));
    a.service.session.send_file(file).await.unwrap();
    b.wait_for(|e| matches!(e, Event::Progress { progress, .. } if *progress > 0.0))
        .await;

    a.service.session.disconnect().await.unwrap();
    let before_idle = a.wait_state(SessionState::Idle).await;
    assert!(before_idle.iter().any(|e| matches!(
        e,
        Event::Error { message } if message.contains("big.bin")
    )));
    assert!(a.service.session.status().await.unwrap().transfer.is_none());
}

#[tokio::test]
async fn local_disconnect_mid_receive_is_reported() {
    let connector = MemoryConnector::with_frame_delay(Duration::from_millis(5));
    let mut a = Peer::new(&connector);
    let mut b = Peer::new(&connector);
    connect(&mut a, &mut b).await;

    let file = a.write_file("big.bin", &payload(400 * 1024));
    a.service.session.send_file(file).await.unwrap();
    b.wait_for(|e| matches!(e, Event::Progress { progress, .. } if *progress > 0.0))
        .await;

    b.service.session.disconnect().await.unwrap();
    let before_idle = b.wait_state(SessionState::Idle).await;
    assert!(before_idle.iter().any(|e| matches!(
        e,
        Event::Error { message } if message.contains("big.bin")
    )));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(dir_is_empty(&b.downloads()));
}

#[tokio::test]
async fn sender_holds_the_transfer_until_the_peer_confirms() {
    let connector = MemoryConnector::new();
    let mut a = Peer::new(&connector);
    let mut raw = RawPeer::connect(&connector, &mut a).await;

    let file = a.write_file("one.txt", &payload(3000));
    let id = a.service.session.send_file(file).await.unwrap();

    // visible straight away, before the file has even been measured
    let transfer = a.service.session.status().await.unwrap().transfer.unwrap();
    assert_eq!(transfer.id, id);
    assert_eq!(transfer.direction, Direction::Outbound);
    assert_eq!(transfer.filename, "one.txt");

    let meta: FileMetadata =
        serde_json::from_slice(&raw.next_frame(ChannelKind::FileMeta).await).unwrap();
    assert_eq!(meta.id, id);
    let mut received = 0;
    while received < meta.size {
        received += raw.next_frame(ChannelKind::FileChunk).await.len() as u64;
    }

    tokio::time::timeout(WAIT, async {
        loop {
            let status = a.service.session.status().await.unwrap();
            if status.transfer.is_some_and(|t| t.awaiting_confirmation) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("sender never finished streaming");

    // every byte is out but the peer may still be writing
    let two = a.write_file("two.txt", b"two");
    assert!(matches!(
        a.service.session.send_file(two).await,
        Err(TelekinesisError::AlreadyTransferring)
    ));

    raw.send_control(&ControlMessage::FileComplete { id }).await;
    a.wait_transfer_done().await;
    let two = a.write_file("two.txt", b"two");
    a.service.session.send_file(two).await.unwrap();
}

#[tokio::test]
async fn receiver_confirms_saved_files() {
    let connector = MemoryConnector::new();
    let mut b = Peer::new(&connector);
    let mut raw = RawPeer::connect(&connector, &mut b).await;

    let data = b"confirmed".to_vec();
    let meta = metadata("c.txt", &data, 1024);
    raw.send_metadata(&meta).await;
    raw.send(ChannelKind::FileChunk, &data).await;

    b.wait_for(|e| matches!(e, Event::FileReceived { .. }))
        .await;
    assert_eq!(
        raw.next_control().await,
        ControlMessage::FileComplete { id: meta.id }
    );
}

#[tokio::test]
async fn junk_frames_are_skipped_without_dropping_the_session() {
    let connector = MemoryConnector::new();
    let mut b = Peer::new(&connector);
    let mut raw = RawPeer::connect(&connector, &mut b).await;

    // unknown channel kind, then a frame cut short inside its header
    raw.link
        .send(Bytes::from_static(&[0x09, 0, 0, 0, 0, 0, 0, 0, 2, b'h', b'i']))
        .await
        .unwrap();
    raw.link
        .send(Bytes::from_static(&[0x01, 0, 0]))
        .await
        .unwrap();
    raw.send_control(&ControlMessage::TextMessage {
        content: "after the junk".into(),
    })
    .await;

    let (event, before) = b
        .wait_for(|e| matches!(e, Event::MessageReceived { .. }))
        .await;
    assert_eq!(
        event,
        Event::MessageReceived {
            text: "after the junk".into()
        }
    );
    assert!(!before
        .iter()
        .any(|e| matches!(e, Event::ConnectionStateChanged { .. })));
    assert!(b.service.session.status().await.unwrap().is_connected);
}

#[tokio::test]
async fn metadata_while_busy_is_refused_back_to_the_sender() {
    let connector = MemoryConnector::new();
    let mut b = Peer::new(&connector);
    let mut raw = RawPeer::connect(&connector, &mut b).await;

    let first_data = b"first file".to_vec();
    let first = metadata("first.txt", &first_data, 1024);
    let second = metadata("second.txt", b"second file", 1024);
    raw.send_metadata(&first).await;
    raw.send_metadata(&second).await;

    match raw.next_control().await {
        ControlMessage::FileAbort { id, .. } => assert_eq!(id, second.id),
        other => panic!("expected an abort, got {other:?}"),
    }

    // the first transfer carries on
    raw.send(ChannelKind::FileChunk, &first_data).await;
    let (Event::FileReceived { filename, path }, _) = b
        .wait_for(|e| matches!(e, Event::FileReceived { .. }))
        .await
    else {
        unreachable!()
    };
    assert_eq!(filename, "first.txt");
    assert_eq!(std::fs::read(path).unwrap(), first_data);
    assert_eq!(
        raw.next_control().await,
        ControlMessage::FileComplete { id: first.id }
    );
}

#[tokio::test]
async fn transfer_fails_when_storage_falls_behind() {
    let connector = MemoryConnector::new();
    let mut b = Peer::with_session(&connector, |session| session.inbound_chunk_buffer = 2);
    let mut raw = RawPeer::connect(&connector, &mut b).await;

    let data = payload(64 * 1024);
    let meta = metadata("flood.bin", &data, 1024);
    // the whole file is queued before the session gets to run
    raw.send_metadata(&meta).await;
    for chunk in data.chunks(1024) {
        raw.send(ChannelKind::FileChunk, chunk).await;
    }

    let (Event::Error { message }, _) = b
        .wait_for(|e| matches!(e, Event::Error { .. }))
        .await
    else {
        unreachable!()
    };
    assert!(message.contains("flood.bin"), "{message}");
    match raw.next_control().await {
        ControlMessage::FileAbort { id, .. } => assert_eq!(id, meta.id),
        other => panic!("expected an abort, got {other:?}"),
    }

    let status = b.service.session.status().await.unwrap();
    assert!(status.is_connected);
    assert!(status.transfer.is_none());
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(dir_is_empty(&b.downloads()));
}
