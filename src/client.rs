use crate::config::ClientConfig;
use crate::error::ConnectError;
use crate::receiver::{FrameReceiver, ReceiverOptions, ReceiverShared, ReceiverStats};
use crate::store::{snapshot_store, SnapshotReader};
use crate::transport::{self, Transport};
use crate::types::{ConnectionState, NatNetVersion, RigidBody, ServerInfo, SessionInfo, Snapshot};
use crate::Result;
use crossbeam_channel::Receiver;
use std::sync::Arc;
use std::thread::JoinHandle;

/// Connection to one NatNet server.
///
/// `connect` starts a background receiver thread; `get_rigid_bodies` and the
/// other accessors read the latest frame without blocking it. Several
/// clients can coexist in one process.
pub struct Client {
    config: ClientConfig,
    shared: Arc<ReceiverShared>,
    reader: Option<SnapshotReader>,
    frames: Option<Receiver<Arc<Snapshot>>>,
    session: Option<SessionInfo>,
    thread: Option<JoinHandle<()>>,
}

impl Client {
    pub fn new() -> Self {
        Self::with_config(ClientConfig::default())
    }

    pub fn with_config(config: ClientConfig) -> Self {
        Self {
            config,
            shared: Arc::new(ReceiverShared::new()),
            reader: None,
            frames: None,
            session: None,
            thread: None,
        }
    }

    /// Client configured from `NATNET_*` environment variables.
    pub fn from_env() -> Self {
        Self::with_config(ClientConfig::from_env())
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Connect and start streaming.
    ///
    /// `server_address` may be `ip`, `ip:port` or a host name; `None` (or an
    /// empty string) runs discovery. `local_address` picks the interface to
    /// bind. A live session is torn down first. Blocks for at most the
    /// discovery or handshake timeout.
    pub fn connect(&mut self, server_address: Option<&str>, local_address: Option<&str>) -> Result<()> {
        self.disconnect();

        let shared = self.reset_shared();
        shared.set_state(ConnectionState::Connecting);

        let session = match transport::open(&self.config, server_address, local_address) {
            Ok(session) => session,
            Err(e) => {
                log::warn!("NatNet connect failed: {}", e);
                shared.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        let info = session.info().clone();
        let options = ReceiverOptions::from_config(&self.config, !info.server_info.multicast);
        self.start(session, options, Some(info))
    }

    /// Start streaming from an already established transport.
    ///
    /// Used for custom transports, and for substituting fakes in tests.
    pub fn connect_with<T: Transport + 'static>(&mut self, transport: T) -> Result<()> {
        self.disconnect();
        self.reset_shared();
        let options = ReceiverOptions::from_config(&self.config, true);
        self.start(transport, options, None)
    }

    fn reset_shared(&mut self) -> Arc<ReceiverShared> {
        self.shared = Arc::new(ReceiverShared::new());
        self.shared.clone()
    }

    fn start<T: Transport + 'static>(
        &mut self,
        transport: T,
        options: ReceiverOptions,
        info: Option<SessionInfo>,
    ) -> Result<()> {
        let (writer, reader) = snapshot_store();
        let (sender, receiver) = crossbeam_channel::bounded(self.config.subscriber_capacity.max(1));
        let shared = self.shared.clone();

        // Streaming before the thread exists, so an early loss can't be overwritten.
        shared.set_state(ConnectionState::Streaming);
        let thread = FrameReceiver::new(transport, writer, sender, options, shared.clone())
            .spawn()
            .map_err(|e| {
                shared.set_state(ConnectionState::Disconnected);
                ConnectError::Spawn(e)
            })?;

        self.reader = Some(reader);
        self.frames = Some(receiver);
        self.session = info;
        self.thread = Some(thread);
        Ok(())
    }

    /// Stop the receiver thread and close the session. No-op when not connected.
    ///
    /// Waits at most one receive timeout for the thread to notice.
    pub fn disconnect(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.shared.request_stop();
        if thread.join().is_err() {
            log::error!("Frame receiver thread panicked");
            self.shared.set_state(ConnectionState::Disconnected);
        }
        self.reader = None;
        self.frames = None;
        self.session = None;
        log::info!("Disconnected");
    }

    /// Bodies of the latest frame. Empty before the first frame, after
    /// `disconnect`, or when the server tracks nothing.
    pub fn get_rigid_bodies(&self) -> Vec<RigidBody> {
        self.latest_snapshot()
            .map(|s| s.bodies.clone())
            .unwrap_or_default()
    }

    /// Latest frame, or `None` when no frame has arrived yet.
    pub fn latest_snapshot(&self) -> Option<Arc<Snapshot>> {
        self.reader.as_ref().and_then(|r| r.latest())
    }

    pub fn rigid_body_count(&self) -> usize {
        self.latest_snapshot().map_or(0, |s| s.bodies.len())
    }

    /// Body at `index` in the latest frame.
    ///
    /// Successive calls may see different frames; take a
    /// [`latest_snapshot`](Self::latest_snapshot) to iterate one frame.
    pub fn rigid_body(&self, index: usize) -> Option<RigidBody> {
        self.latest_snapshot()
            .and_then(|s| s.bodies.get(index).copied())
    }

    pub fn rigid_body_by_id(&self, id: i32) -> Option<RigidBody> {
        self.latest_snapshot().and_then(|s| s.body(id).copied())
    }

    /// True when no frame arrived within the stale threshold, or the
    /// connection was lost.
    pub fn is_stale(&self) -> bool {
        self.reader.as_ref().is_some_and(|r| r.is_stale())
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Streaming
    }

    /// Receiver of every published frame. Bounded; frames are dropped when
    /// it is full. Clones share one queue.
    pub fn frames(&self) -> Option<Receiver<Arc<Snapshot>>> {
        self.frames.clone()
    }

    pub fn stats(&self) -> ReceiverStats {
        self.shared.stats()
    }

    pub fn session_info(&self) -> Option<&SessionInfo> {
        self.session.as_ref()
    }

    pub fn server_info(&self) -> Option<&ServerInfo> {
        self.session.as_ref().map(|s| &s.server_info)
    }

    pub fn negotiated_version(&self) -> Option<NatNetVersion> {
        self.session.as_ref().map(|s| s.version)
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.disconnect();
    }
}
