//! Session and stream registry
//!
//! Maps opaque 64-bit handles to live transport objects. Sessions own their
//! streams; a stream may additionally own the codec pair of the participant
//! it carries. Destroying a session destroys its streams and their codecs.
//!
//! Handles come from one counter shared by sessions and streams. They start
//! at 1, only grow, and are never reused; 0 means "none".
//!
//! The maps sit behind one reentrant lock that is held only while they are
//! read or updated. Backend objects have their own locks, and backend calls
//! (socket binds, sends, receives) run after the registry lock is released.
//! Closures passed to [`TransportRegistry::with_codec`] run unlocked too and
//! may call back into the registry.

use parking_lot::{Mutex, ReentrantMutex};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::codec::CodecPair;
use crate::error::TransportError;
use crate::network::backend::{
    ReceivedFrame, StreamDirection, TransportBackend, TransportSession, TransportStream,
};

/// Handle of a live session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionHandle(pub u64);

/// Handle of a live stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamHandle(pub u64);

impl SessionHandle {
    pub const INVALID: SessionHandle = SessionHandle(0);

    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

impl StreamHandle {
    pub const INVALID: StreamHandle = StreamHandle(0);

    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session#{}", self.0)
    }
}

impl fmt::Display for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream#{}", self.0)
    }
}

/// Lifecycle of a stream handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Never handed out
    Unborn,
    /// Created, no frame moved yet
    Created,
    /// Last operation succeeded
    Active,
    /// Last operation failed at the backend
    Erroring,
    /// Torn down; terminal
    Destroyed,
}

type SharedStream = Arc<Mutex<Box<dyn TransportStream>>>;
type SharedSession = Arc<Mutex<Box<dyn TransportSession>>>;
type SharedCodec = Arc<Mutex<CodecPair>>;

struct StreamEntry {
    stream: SharedStream,
    state: StreamState,
}

struct SessionEntry {
    session: SharedSession,
    local: SocketAddr,
    streams: HashMap<StreamHandle, StreamEntry>,
}

struct RegistryState {
    next_handle: u64,
    sessions: HashMap<SessionHandle, SessionEntry>,
    stream_owner: HashMap<StreamHandle, SessionHandle>,
    codecs: HashMap<StreamHandle, SharedCodec>,
}

impl RegistryState {
    fn mint(&mut self) -> u64 {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }

    fn stream_mut(&mut self, handle: StreamHandle) -> Option<&mut StreamEntry> {
        let owner = self.stream_owner.get(&handle)?;
        self.sessions.get_mut(owner)?.streams.get_mut(&handle)
    }

    /// Record the outcome of a backend call on a still-live stream
    fn record(&mut self, handle: StreamHandle, ok: bool, error: Option<&TransportError>) {
        let Some(entry) = self.stream_mut(handle) else {
            return;
        };
        if ok {
            entry.state = StreamState::Active;
            return;
        }
        if entry.state != StreamState::Erroring {
            if let Some(e) = error {
                tracing::warn!(%handle, error = %e, "stream failing");
            }
        }
        entry.state = StreamState::Erroring;
    }

    fn remove_stream(&mut self, handle: StreamHandle) -> bool {
        let Some(owner) = self.stream_owner.remove(&handle) else {
            return false;
        };
        self.codecs.remove(&handle);
        if let Some(session) = self.sessions.get_mut(&owner) {
            session.streams.remove(&handle);
        }
        true
    }
}

/// Registry of transport sessions and streams for one backend
pub struct TransportRegistry {
    backend: Box<dyn TransportBackend>,
    state: ReentrantMutex<RefCell<RegistryState>>,
}

impl TransportRegistry {
    pub fn new<B: TransportBackend + 'static>(backend: B) -> Self {
        Self {
            backend: Box::new(backend),
            state: ReentrantMutex::new(RefCell::new(RegistryState {
                next_handle: 1,
                sessions: HashMap::new(),
                stream_owner: HashMap::new(),
                codecs: HashMap::new(),
            })),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Open a backend session on `local` and register it
    pub fn create_session(&self, local: SocketAddr) -> Result<SessionHandle, TransportError> {
        let session = self.backend.create_session(local).inspect_err(|e| {
            tracing::warn!(backend = self.backend.name(), %local, error = %e, "session creation failed");
        })?;
        let bound = session.local_endpoint();

        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        let handle = SessionHandle(state.mint());
        state.sessions.insert(
            handle,
            SessionEntry {
                session: Arc::new(Mutex::new(session)),
                local: bound,
                streams: HashMap::new(),
            },
        );
        tracing::debug!(%handle, %local, "session created");
        Ok(handle)
    }

    /// Open a stream on `port` inside `session`
    pub fn create_stream(
        &self,
        session: SessionHandle,
        port: u16,
        direction: StreamDirection,
    ) -> Result<StreamHandle, TransportError> {
        if port == 0 {
            return Err(TransportError::InvalidPort(port));
        }
        let backend_session = self
            .state
            .lock()
            .borrow()
            .sessions
            .get(&session)
            .map(|entry| entry.session.clone())
            .ok_or(TransportError::UnknownSession(session.0))?;

        let stream = backend_session
            .lock()
            .create_stream(port, direction)
            .inspect_err(|e| {
                tracing::warn!(%session, port, error = %e, "stream creation failed");
            })?;

        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        // The session may have been destroyed while the backend was busy
        if !state.sessions.contains_key(&session) {
            return Err(TransportError::UnknownSession(session.0));
        }
        let handle = StreamHandle(state.mint());
        if let Some(entry) = state.sessions.get_mut(&session) {
            entry.streams.insert(
                handle,
                StreamEntry {
                    stream: Arc::new(Mutex::new(stream)),
                    state: StreamState::Created,
                },
            );
        }
        state.stream_owner.insert(handle, session);
        tracing::debug!(%session, %handle, port, direction = direction.as_str(), "stream created");
        Ok(handle)
    }

    /// Tear down one stream and its codec. `false` if the handle was not live.
    pub fn destroy_stream(&self, handle: StreamHandle) -> bool {
        let guard = self.state.lock();
        let removed = guard.borrow_mut().remove_stream(handle);
        if removed {
            tracing::debug!(%handle, "stream destroyed");
        }
        removed
    }

    /// Tear down a session with all its streams and codecs.
    /// `false` if the handle was not live.
    pub fn destroy_session(&self, handle: SessionHandle) -> bool {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        let Some(entry) = state.sessions.remove(&handle) else {
            return false;
        };
        for stream in entry.streams.keys() {
            state.stream_owner.remove(stream);
            state.codecs.remove(stream);
        }
        tracing::debug!(%handle, streams = entry.streams.len(), "session destroyed");
        true
    }

    /// Backend stream behind a live handle
    fn stream(&self, handle: StreamHandle) -> Result<SharedStream, TransportError> {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        state
            .stream_mut(handle)
            .map(|entry| entry.stream.clone())
            .ok_or(TransportError::UnknownStream(handle.0))
    }

    /// Send one frame on a send stream
    pub fn push_frame(
        &self,
        handle: StreamHandle,
        payload: &[u8],
        timestamp: u32,
    ) -> Result<(), TransportError> {
        let stream = self.stream(handle)?;
        let result = stream.lock().push_frame(payload, timestamp);

        let guard = self.state.lock();
        guard
            .borrow_mut()
            .record(handle, result.is_ok(), result.as_ref().err());
        result
    }

    /// Next inbound frame on a receive stream, if any
    pub fn pull_frame(&self, handle: StreamHandle) -> Result<Option<ReceivedFrame>, TransportError> {
        let stream = self.stream(handle)?;
        let result = stream.lock().pull_frame();

        match &result {
            Ok(None) => {}
            Ok(Some(_)) => self.state.lock().borrow_mut().record(handle, true, None),
            Err(e) => self.state.lock().borrow_mut().record(handle, false, Some(e)),
        }
        result
    }

    /// Lifecycle state of `handle`
    pub fn stream_state(&self, handle: StreamHandle) -> StreamState {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        if let Some(entry) = state.stream_mut(handle) {
            return entry.state;
        }
        if handle.is_valid() && handle.0 < state.next_handle {
            StreamState::Destroyed
        } else {
            StreamState::Unborn
        }
    }

    /// Hand the codec pair carried by `stream` to the registry
    pub fn attach_codec(&self, stream: StreamHandle, codec: CodecPair) -> Result<(), TransportError> {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        if !state.stream_owner.contains_key(&stream) {
            return Err(TransportError::UnknownStream(stream.0));
        }
        if state.codecs.contains_key(&stream) {
            return Err(TransportError::CodecAlreadyAttached(stream.0));
        }
        state.codecs.insert(stream, Arc::new(Mutex::new(codec)));
        Ok(())
    }

    /// Run `f` on the codec pair attached to `stream`.
    ///
    /// Only the codec's own lock is held while `f` runs, so `f` may use the
    /// registry freely and other streams are not held up by the encode or
    /// decode. Calls for the same codec are serialized. `f` must not call
    /// `with_codec` for the same stream. If `f` destroys the stream the codec
    /// is dropped once `f` returns.
    pub fn with_codec<R>(&self, stream: StreamHandle, f: impl FnOnce(&mut CodecPair) -> R) -> Option<R> {
        let codec = self.state.lock().borrow().codecs.get(&stream).cloned()?;
        let mut codec = codec.lock();
        Some(f(&mut codec))
    }

    pub fn has_codec(&self, stream: StreamHandle) -> bool {
        self.state.lock().borrow().codecs.contains_key(&stream)
    }

    /// Owning session of a live stream
    pub fn session_of(&self, stream: StreamHandle) -> Option<SessionHandle> {
        self.state.lock().borrow().stream_owner.get(&stream).copied()
    }

    pub fn is_session_live(&self, session: SessionHandle) -> bool {
        self.state.lock().borrow().sessions.contains_key(&session)
    }

    /// Local endpoint a live session is bound to
    pub fn session_endpoint(&self, session: SessionHandle) -> Option<SocketAddr> {
        self.state.lock().borrow().sessions.get(&session).map(|s| s.local)
    }

    pub fn session_count(&self) -> usize {
        self.state.lock().borrow().sessions.len()
    }

    pub fn stream_count(&self) -> usize {
        self.state.lock().borrow().stream_owner.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DataPlaneConfig;
    use crate::network::loopback::LoopbackBackend;
    use crossbeam_channel::{bounded, Receiver, Sender};
    use std::time::Duration;

    fn local() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    struct FailingBackend;

    impl TransportBackend for FailingBackend {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn create_session(&self, _local: SocketAddr) -> Result<Box<dyn TransportSession>, TransportError> {
            Err(TransportError::BindFailed("refused".into()))
        }
    }

    /// Streams whose sends block until the test releases them
    struct GatedBackend {
        entered: Sender<()>,
        release: Receiver<()>,
    }

    struct GatedSession {
        entered: Sender<()>,
        release: Receiver<()>,
        local: SocketAddr,
    }

    struct GatedStream {
        entered: Sender<()>,
        release: Receiver<()>,
        port: u16,
    }

    impl TransportBackend for GatedBackend {
        fn name(&self) -> &'static str {
            "gated"
        }

        fn create_session(&self, local: SocketAddr) -> Result<Box<dyn TransportSession>, TransportError> {
            Ok(Box::new(GatedSession {
                entered: self.entered.clone(),
                release: self.release.clone(),
                local,
            }))
        }
    }

    impl TransportSession for GatedSession {
        fn local_endpoint(&self) -> SocketAddr {
            self.local
        }

        fn create_stream(
            &mut self,
            port: u16,
            _direction: StreamDirection,
        ) -> Result<Box<dyn TransportStream>, TransportError> {
            Ok(Box::new(GatedStream {
                entered: self.entered.clone(),
                release: self.release.clone(),
                port,
            }))
        }
    }

    impl TransportStream for GatedStream {
        fn direction(&self) -> StreamDirection {
            StreamDirection::Send
        }

        fn port(&self) -> u16 {
            self.port
        }

        fn push_frame(&mut self, _payload: &[u8], _timestamp: u32) -> Result<(), TransportError> {
            let _ = self.entered.send(());
            self.release
                .recv()
                .map_err(|_| TransportError::SendFailed("gate dropped".into()))
        }

        fn pull_frame(&mut self) -> Result<Option<ReceivedFrame>, TransportError> {
            Ok(None)
        }
    }

    #[test]
    fn test_backend_io_runs_unlocked() {
        let (entered_tx, entered_rx) = bounded(1);
        let (release_tx, release_rx) = bounded(1);
        let registry = Arc::new(TransportRegistry::new(GatedBackend {
            entered: entered_tx,
            release: release_rx,
        }));
        let session = registry.create_session(local()).unwrap();
        let stream = registry
            .create_stream(session, 5400, StreamDirection::Send)
            .unwrap();

        let sender = {
            let registry = registry.clone();
            std::thread::spawn(move || registry.push_frame(stream, &[1], 0))
        };
        entered_rx.recv().unwrap();

        // The send is parked inside the backend; the registry must still answer
        let (done_tx, done_rx) = bounded(1);
        let observer = {
            let registry = registry.clone();
            std::thread::spawn(move || {
                let second = registry.create_stream(session, 5401, StreamDirection::Send);
                let _ = done_tx.send((registry.stream_count(), second.is_ok()));
            })
        };
        let observed = done_rx.recv_timeout(Duration::from_secs(2));

        release_tx.send(()).unwrap();
        assert!(sender.join().unwrap().is_ok());
        observer.join().unwrap();
        assert_eq!(observed, Ok((2, true)));
        assert_eq!(registry.stream_state(stream), StreamState::Active);
    }

    #[test]
    fn test_session_endpoint() {
        let registry = TransportRegistry::new(LoopbackBackend::new());
        let addr: SocketAddr = "127.0.0.1:4400".parse().unwrap();
        let session = registry.create_session(addr).unwrap();
        assert_eq!(registry.session_endpoint(session), Some(addr));
        registry.destroy_session(session);
        assert_eq!(registry.session_endpoint(session), None);
    }

    #[test]
    fn test_session_teardown_invalidates_streams() {
        let registry = TransportRegistry::new(LoopbackBackend::new());
        let session = registry.create_session(local()).unwrap();
        let stream = registry
            .create_stream(session, 5000, StreamDirection::Send)
            .unwrap();
        assert!(session.is_valid());
        assert!(stream.is_valid());
        assert_ne!(session.0, stream.0);

        assert!(registry.destroy_session(session));
        assert_eq!(
            registry.push_frame(stream, &[1, 2], 0),
            Err(TransportError::UnknownStream(stream.0))
        );
        assert_eq!(registry.stream_state(stream), StreamState::Destroyed);
        assert!(!registry.destroy_session(session));
        assert!(!registry.destroy_stream(stream));
    }

    #[test]
    fn test_stream_state_machine() {
        let registry = TransportRegistry::new(LoopbackBackend::new());
        let session = registry.create_session(local()).unwrap();
        let tx = registry
            .create_stream(session, 5100, StreamDirection::Send)
            .unwrap();
        assert_eq!(registry.stream_state(tx), StreamState::Created);
        assert_eq!(registry.stream_state(StreamHandle(999)), StreamState::Unborn);
        assert_eq!(registry.stream_state(StreamHandle::INVALID), StreamState::Unborn);

        // Nobody listens yet
        assert!(registry.push_frame(tx, &[0], 0).is_err());
        assert_eq!(registry.stream_state(tx), StreamState::Erroring);

        let rx = registry
            .create_stream(session, 5100, StreamDirection::Receive)
            .unwrap();
        registry.push_frame(tx, &[4, 2], 480).unwrap();
        assert_eq!(registry.stream_state(tx), StreamState::Active);

        let frame = registry.pull_frame(rx).unwrap().unwrap();
        assert_eq!(frame.timestamp, 480);
        assert_eq!(&frame.payload[..], &[4, 2]);

        assert!(registry.destroy_stream(tx));
        assert_eq!(registry.stream_state(tx), StreamState::Destroyed);
        assert_eq!(registry.stream_count(), 1);
    }

    #[test]
    fn test_create_stream_validation() {
        let registry = TransportRegistry::new(LoopbackBackend::new());
        let session = registry.create_session(local()).unwrap();
        assert_eq!(
            registry.create_stream(session, 0, StreamDirection::Send),
            Err(TransportError::InvalidPort(0))
        );
        assert_eq!(
            registry.create_stream(SessionHandle(77), 5000, StreamDirection::Send),
            Err(TransportError::UnknownSession(77))
        );
        assert_eq!(
            registry.create_stream(SessionHandle::INVALID, 5000, StreamDirection::Send),
            Err(TransportError::UnknownSession(0))
        );
    }

    #[test]
    fn test_backend_failure() {
        let registry = TransportRegistry::new(FailingBackend);
        assert!(registry.create_session(local()).is_err());
        assert_eq!(registry.session_count(), 0);
    }

    #[test]
    fn test_codec_cascade() {
        let registry = TransportRegistry::new(LoopbackBackend::new());
        let session = registry.create_session(local()).unwrap();
        let stream = registry
            .create_stream(session, 5200, StreamDirection::Send)
            .unwrap();
        let codec = CodecPair::new(3, &DataPlaneConfig::default(), 2).unwrap();
        registry.attach_codec(stream, codec).unwrap();
        assert!(registry.has_codec(stream));

        let owner = registry.with_codec(stream, |codec| codec.owner());
        assert_eq!(owner, Some(3));

        assert!(registry.destroy_session(session));
        assert!(!registry.has_codec(stream));
        assert_eq!(registry.with_codec(stream, |codec| codec.owner()), None);
    }

    #[test]
    fn test_with_codec_reentry() {
        let registry = TransportRegistry::new(LoopbackBackend::new());
        let session = registry.create_session(local()).unwrap();
        let stream = registry
            .create_stream(session, 5300, StreamDirection::Send)
            .unwrap();
        registry
            .attach_codec(stream, CodecPair::new(1, &DataPlaneConfig::default(), 1).unwrap())
            .unwrap();

        let pushed = registry.with_codec(stream, |codec| {
            let payload = codec.encode_channel(&[0.0; 480], 0).unwrap();
            registry.push_frame(stream, &payload, 0).is_ok()
        });
        // No listener on 5300: the push fails cleanly but the codec survives
        assert_eq!(pushed, Some(false));
        assert!(registry.has_codec(stream));

        registry.with_codec(stream, |_| registry.destroy_stream(stream));
        assert!(!registry.has_codec(stream));
    }

    #[test]
    fn test_handles_are_unique() {
        let registry = TransportRegistry::new(LoopbackBackend::new());
        let mut seen = std::collections::HashSet::new();
        for i in 0..50 {
            let session = registry.create_session(local()).unwrap();
            assert!(seen.insert(session.0));
            let stream = registry
                .create_stream(session, 7000 + i, StreamDirection::Send)
                .unwrap();
            assert!(seen.insert(stream.0));
        }
        assert!(!seen.contains(&0));
    }
}
