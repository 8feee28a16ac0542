use crate::config::ClientConfig;
use crate::error::RecvError;
use crate::protocol::{self, Message, Request};
use crate::store::{Publish, SnapshotWriter};
use crate::transport::Transport;
use crate::types::{ConnectionState, Snapshot};
use crossbeam_channel::Sender;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Counters kept by the receiver thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReceiverStats {
    /// Datagrams read from either channel.
    pub datagrams: u64,
    pub frames_published: u64,
    pub decode_errors: u64,
    /// Frames discarded because their number was not newer.
    pub out_of_order: u64,
    pub timeouts: u64,
}

#[derive(Default)]
struct Counters {
    datagrams: AtomicU64,
    frames_published: AtomicU64,
    decode_errors: AtomicU64,
    out_of_order: AtomicU64,
    timeouts: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// State shared between the receiver thread and the client.
pub(crate) struct ReceiverShared {
    state: AtomicU8,
    stop: AtomicBool,
    counters: Counters,
}

impl ReceiverShared {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(ConnectionState::Disconnected as u8),
            stop: AtomicBool::new(false),
            counters: Counters::default(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    fn should_stop(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> ReceiverStats {
        let c = &self.counters;
        ReceiverStats {
            datagrams: c.datagrams.load(Ordering::Relaxed),
            frames_published: c.frames_published.load(Ordering::Relaxed),
            decode_errors: c.decode_errors.load(Ordering::Relaxed),
            out_of_order: c.out_of_order.load(Ordering::Relaxed),
            timeouts: c.timeouts.load(Ordering::Relaxed),
        }
    }
}

/// Loop timing derived from [`ClientConfig`].
#[derive(Debug, Clone)]
pub(crate) struct ReceiverOptions {
    pub receive_timeout: Duration,
    pub stale_after: Duration,
    pub lost_after_timeouts: Option<u32>,
    pub keepalive_interval: Option<Duration>,
}

impl ReceiverOptions {
    /// Keep-alives only make sense when the server streams to us directly.
    pub fn from_config(config: &ClientConfig, unicast: bool) -> Self {
        Self {
            receive_timeout: config.receive_timeout,
            stale_after: config.stale_after,
            lost_after_timeouts: config.lost_after_timeouts,
            keepalive_interval: if unicast {
                config.keepalive_interval
            } else {
                None
            },
        }
    }
}

enum Step {
    Continue,
    Lost(String),
}

/// Receive → decode → publish loop. Owns the transport and the store's
/// write side for the whole life of a session.
pub(crate) struct FrameReceiver<T: Transport> {
    transport: T,
    writer: SnapshotWriter,
    frames: Sender<Arc<Snapshot>>,
    options: ReceiverOptions,
    shared: Arc<ReceiverShared>,
    last_frame_at: Instant,
    last_keepalive: Instant,
    consecutive_timeouts: u32,
    stale: bool,
}

impl<T: Transport + 'static> FrameReceiver<T> {
    pub fn new(
        transport: T,
        writer: SnapshotWriter,
        frames: Sender<Arc<Snapshot>>,
        options: ReceiverOptions,
        shared: Arc<ReceiverShared>,
    ) -> Self {
        let now = Instant::now();
        Self {
            transport,
            writer,
            frames,
            options,
            shared,
            last_frame_at: now,
            last_keepalive: now,
            consecutive_timeouts: 0,
            stale: false,
        }
    }

    /// Run the loop on a dedicated thread.
    pub fn spawn(self) -> std::io::Result<std::thread::JoinHandle<()>> {
        std::thread::Builder::new()
            .name("natnet-receiver".into())
            .spawn(move || self.run())
    }

    /// Loop until a stop is requested or the connection is lost, then close
    /// the transport and report `Disconnected`.
    pub fn run(mut self) {
        log::info!("Frame receiver started");

        let lost = loop {
            if self.shared.should_stop() {
                break None;
            }
            if let Step::Lost(reason) = self.step() {
                break Some(reason);
            }
        };

        match lost {
            Some(reason) => {
                log::warn!("NatNet connection lost: {}", reason);
                self.writer.mark_stale();
            }
            None => log::info!("Frame receiver stopping (stop requested)"),
        }

        self.transport.close();
        self.shared.set_state(ConnectionState::Disconnected);
    }

    /// One bounded receive plus its bookkeeping.
    fn step(&mut self) -> Step {
        self.maybe_keepalive();

        let received = self
            .transport
            .receive(self.options.receive_timeout)
            .map(protocol::decode_message);

        match received {
            Ok(decoded) => {
                self.consecutive_timeouts = 0;
                bump(&self.shared.counters.datagrams);
                match decoded {
                    Ok(Message::FrameOfData(snapshot)) => self.handle_frame(snapshot),
                    Ok(Message::Disconnect) => {
                        return Step::Lost("server sent disconnect".into());
                    }
                    Ok(other) => log::trace!("Ignoring {:?}", other),
                    Err(e) => {
                        bump(&self.shared.counters.decode_errors);
                        log::debug!("Dropping undecodable datagram: {}", e);
                    }
                }
            }
            Err(RecvError::Timeout) => {
                bump(&self.shared.counters.timeouts);
                self.consecutive_timeouts += 1;
                if let Some(max) = self.options.lost_after_timeouts {
                    if self.consecutive_timeouts >= max {
                        return Step::Lost(format!(
                            "{} consecutive receive timeouts",
                            self.consecutive_timeouts
                        ));
                    }
                }
            }
            Err(RecvError::ConnectionLost(reason)) => return Step::Lost(reason),
        }

        self.check_stale();
        Step::Continue
    }

    fn handle_frame(&mut self, snapshot: Snapshot) {
        let snapshot = Arc::new(snapshot);
        match self.writer.publish_arc(snapshot.clone()) {
            Publish::Accepted => {
                bump(&self.shared.counters.frames_published);
                self.last_frame_at = Instant::now();
                if self.stale {
                    log::info!("Frames resumed at #{}", snapshot.frame_number);
                    self.stale = false;
                }
                log::trace!(
                    "Frame #{} with {} rigid bodies",
                    snapshot.frame_number,
                    snapshot.bodies.len()
                );
                if let Err(crossbeam_channel::TrySendError::Full(_)) =
                    self.frames.try_send(snapshot)
                {
                    log::trace!("Frame channel full, dropping snapshot");
                }
            }
            Publish::Rejected { latest } => {
                bump(&self.shared.counters.out_of_order);
                log::debug!(
                    "Discarding frame #{} (latest published #{})",
                    snapshot.frame_number,
                    latest
                );
            }
        }
    }

    fn check_stale(&mut self) {
        if !self.stale && self.last_frame_at.elapsed() > self.options.stale_after {
            self.stale = true;
            self.writer.mark_stale();
            log::warn!(
                "No frames for {:?}, rigid body data is stale",
                self.options.stale_after
            );
        }
    }

    fn maybe_keepalive(&mut self) {
        let Some(interval) = self.options.keepalive_interval else {
            return;
        };
        if self.last_keepalive.elapsed() >= interval {
            if let Err(e) = self.transport.send_command(&Request::KeepAlive) {
                log::debug!("Keep-alive failed: {}", e);
            }
            self.last_keepalive = Instant::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{snapshot_store, SnapshotReader};
    use crate::types::{FrameFlags, RigidBody};
    use crossbeam_channel::Receiver;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    enum Scripted {
        Datagram(Vec<u8>),
        Timeout,
        Lost,
    }

    /// Replays a script; an exhausted script times out forever.
    struct ScriptedTransport {
        script: VecDeque<Scripted>,
        current: Vec<u8>,
        sent: Arc<Mutex<Vec<Request>>>,
        closed: Arc<AtomicBool>,
    }

    impl Transport for ScriptedTransport {
        fn receive(&mut self, _timeout: Duration) -> Result<&[u8], RecvError> {
            match self.script.pop_front() {
                Some(Scripted::Datagram(bytes)) => {
                    self.current = bytes;
                    Ok(&self.current)
                }
                Some(Scripted::Lost) => Err(RecvError::ConnectionLost("socket error".into())),
                Some(Scripted::Timeout) | None => {
                    std::thread::sleep(Duration::from_millis(1));
                    Err(RecvError::Timeout)
                }
            }
        }

        fn send_command(&mut self, request: &Request) -> std::io::Result<()> {
            self.sent.lock().unwrap().push(request.clone());
            Ok(())
        }

        fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    struct Harness {
        receiver: FrameReceiver<ScriptedTransport>,
        reader: SnapshotReader,
        frames: Receiver<Arc<Snapshot>>,
        shared: Arc<ReceiverShared>,
        sent: Arc<Mutex<Vec<Request>>>,
        closed: Arc<AtomicBool>,
    }

    fn options() -> ReceiverOptions {
        ReceiverOptions {
            receive_timeout: Duration::from_millis(5),
            stale_after: Duration::from_secs(60),
            lost_after_timeouts: None,
            keepalive_interval: None,
        }
    }

    fn harness(script: Vec<Scripted>, options: ReceiverOptions) -> Harness {
        let (writer, reader) = snapshot_store();
        let (tx, rx) = crossbeam_channel::bounded(16);
        let shared = Arc::new(ReceiverShared::new());
        shared.set_state(ConnectionState::Streaming);
        let sent = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let transport = ScriptedTransport {
            script: script.into(),
            current: Vec::new(),
            sent: sent.clone(),
            closed: closed.clone(),
        };
        Harness {
            receiver: FrameReceiver::new(transport, writer, tx, options, shared.clone()),
            reader,
            frames: rx,
            shared,
            sent,
            closed,
        }
    }

    fn frame(frame_number: u32, ids: &[i32]) -> Vec<u8> {
        protocol::encode_frame(&Snapshot {
            frame_number,
            timestamp: frame_number as f64,
            flags: FrameFlags::empty(),
            bodies: ids
                .iter()
                .map(|&id| RigidBody {
                    id,
                    position: [1.0, 2.0, 3.0],
                    orientation: [0.0, 0.0, 0.0, 1.0],
                })
                .collect(),
        })
        .unwrap()
    }

    fn steps(h: &mut Harness, n: usize) {
        for _ in 0..n {
            assert!(matches!(h.receiver.step(), Step::Continue));
        }
    }

    #[test]
    fn test_publishes_decoded_frames() {
        let mut h = harness(vec![Scripted::Datagram(frame(1, &[3, 1]))], options());
        assert!(h.reader.latest().is_none());
        steps(&mut h, 1);

        let latest = h.reader.latest().unwrap();
        assert_eq!(latest.frame_number, 1);
        assert_eq!(latest.bodies.iter().map(|b| b.id).collect::<Vec<_>>(), vec![3, 1]);
        assert_eq!(h.frames.try_recv().unwrap().frame_number, 1);
        assert_eq!(h.shared.stats().frames_published, 1);
    }

    #[test]
    fn test_out_of_order_frame_discarded() {
        let mut h = harness(
            vec![
                Scripted::Datagram(frame(5, &[5])),
                Scripted::Datagram(frame(4, &[4])),
            ],
            options(),
        );
        steps(&mut h, 2);

        let latest = h.reader.latest().unwrap();
        assert_eq!(latest.frame_number, 5);
        assert_eq!(latest.bodies[0].id, 5);
        assert_eq!(h.shared.stats().out_of_order, 1);
        assert_eq!(h.frames.len(), 1);
    }

    #[test]
    fn test_truncated_frame_dropped() {
        let good = frame(1, &[1, 2]);
        // declared count 3, two bodies of bytes
        let mut bad = frame(2, &[1, 2]);
        let count_offset = protocol::HEADER_SIZE + 16 + 6;
        bad[count_offset..count_offset + 4].copy_from_slice(&3u32.to_le_bytes());

        let mut h = harness(
            vec![Scripted::Datagram(good), Scripted::Datagram(bad)],
            options(),
        );
        steps(&mut h, 2);

        assert_eq!(h.reader.latest().unwrap().frame_number, 1);
        assert_eq!(h.shared.stats().decode_errors, 1);
        assert_eq!(h.shared.state(), ConnectionState::Streaming);
    }

    #[test]
    fn test_garbage_is_not_fatal() {
        let mut h = harness(
            vec![
                Scripted::Datagram(vec![0xFF]),
                Scripted::Datagram(vec![0x63, 0x00, 0x00, 0x00]),
                Scripted::Datagram(frame(1, &[1])),
            ],
            options(),
        );
        steps(&mut h, 3);
        assert_eq!(h.reader.latest().unwrap().frame_number, 1);
        assert_eq!(h.shared.stats().decode_errors, 2);
    }

    #[test]
    fn test_stale_after_idle_keeps_last_snapshot() {
        let opts = ReceiverOptions {
            stale_after: Duration::from_millis(20),
            ..options()
        };
        let mut h = harness(vec![Scripted::Datagram(frame(7, &[1]))], opts);
        steps(&mut h, 1);
        assert!(!h.reader.is_stale());

        std::thread::sleep(Duration::from_millis(30));
        steps(&mut h, 1);
        assert!(h.reader.is_stale());
        assert_eq!(h.reader.latest().unwrap().frame_number, 7);
        assert_eq!(h.shared.state(), ConnectionState::Streaming);
    }

    #[test]
    fn test_fresh_frame_clears_stale() {
        let opts = ReceiverOptions {
            stale_after: Duration::from_millis(10),
            ..options()
        };
        let mut h = harness(
            vec![
                Scripted::Timeout,
                Scripted::Datagram(frame(1, &[1])),
            ],
            opts,
        );
        std::thread::sleep(Duration::from_millis(20));
        steps(&mut h, 1);
        assert!(h.reader.is_stale());
        steps(&mut h, 1);
        assert!(!h.reader.is_stale());
    }

    #[test]
    fn test_timeout_ceiling_loses_connection() {
        let opts = ReceiverOptions {
            lost_after_timeouts: Some(3),
            ..options()
        };
        let mut h = harness(vec![Scripted::Datagram(frame(1, &[1]))], opts);
        steps(&mut h, 3);
        assert!(matches!(h.receiver.step(), Step::Lost(_)));
    }

    #[test]
    fn test_datagram_resets_timeout_count() {
        let opts = ReceiverOptions {
            lost_after_timeouts: Some(2),
            ..options()
        };
        let mut h = harness(
            vec![
                Scripted::Timeout,
                Scripted::Datagram(frame(1, &[1])),
                Scripted::Timeout,
            ],
            opts,
        );
        steps(&mut h, 3);
        assert!(matches!(h.receiver.step(), Step::Lost(_)));
    }

    #[test]
    fn test_server_disconnect_ends_session() {
        let h = harness(
            vec![
                Scripted::Datagram(frame(1, &[1])),
                Scripted::Datagram(protocol::encode_request(&Request::Disconnect)),
                Scripted::Datagram(frame(2, &[1])),
            ],
            options(),
        );
        let reader = h.reader.clone();
        let shared = h.shared.clone();
        let closed = h.closed.clone();

        h.receiver.run();

        assert_eq!(reader.latest().unwrap().frame_number, 1);
        assert!(reader.is_stale());
        assert!(closed.load(Ordering::SeqCst));
        assert_eq!(shared.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_socket_error_ends_session() {
        let h = harness(vec![Scripted::Lost], options());
        let shared = h.shared.clone();
        h.receiver.run();
        assert_eq!(shared.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_stop_request_exits_and_closes() {
        let h = harness(Vec::new(), options());
        let shared = h.shared.clone();
        let closed = h.closed.clone();

        let handle = h.receiver.spawn().unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(shared.state(), ConnectionState::Streaming);

        shared.request_stop();
        handle.join().unwrap();
        assert!(closed.load(Ordering::SeqCst));
        assert_eq!(shared.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_keepalive_sent_on_interval() {
        let opts = ReceiverOptions {
            keepalive_interval: Some(Duration::from_millis(5)),
            ..options()
        };
        let mut h = harness(Vec::new(), opts);
        std::thread::sleep(Duration::from_millis(10));
        steps(&mut h, 1);
        assert_eq!(h.sent.lock().unwrap().as_slice(), &[Request::KeepAlive]);
    }
}
