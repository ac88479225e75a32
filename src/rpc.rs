//! Narrow transport abstraction consumed by the three tiers.
//!
//! The surface mirrors a kernel-bypass RPC library: a process-wide
//! [`Nexus`] listener identity, a per-thread [`RpcEndpoint`] that must be
//! created and driven from the same thread, blocking session setup, pooled
//! message buffers, and a polled event loop. Requests and responses are
//! correlated by opaque pointer-sized tags.
//!
//! The implementation here is an in-process loopback: frames travel over
//! crossbeam channels between nexus inboxes registered in a process-wide
//! table. It keeps the exact calling discipline of the real transport
//! (single-threaded endpoints, per-session FIFO, buffer reuse) so the
//! components and the test suite exercise the same paths a deployment
//! would.

use crate::error::{Error, Result};
use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

const MSG_BUFFER_SIZES: [usize; 8] = [64, 128, 256, 512, 1024, 2048, 4096, 8192];
const MAX_MSG_BUFFER_SIZE: usize = 8192;
const BUFFERS_PER_CLASS: usize = 64;
const EVENT_LOOP_BATCH: usize = 64;
const SESSION_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

static BUFFER_POOLS: OnceLock<Vec<Mutex<Vec<Vec<u8>>>>> = OnceLock::new();

fn buffer_pools() -> &'static [Mutex<Vec<Vec<u8>>>] {
    BUFFER_POOLS.get_or_init(|| {
        MSG_BUFFER_SIZES
            .iter()
            .map(|&size| {
                let mut buffers = Vec::with_capacity(BUFFERS_PER_CLASS);
                for _ in 0..BUFFERS_PER_CLASS {
                    buffers.push(vec![0u8; size]);
                }
                Mutex::new(buffers)
            })
            .collect()
    })
}

fn size_class_for(len: usize) -> usize {
    let capped = len.clamp(1, MAX_MSG_BUFFER_SIZE);
    let mut class = capped.next_power_of_two();
    if class < MSG_BUFFER_SIZES[0] {
        class = MSG_BUFFER_SIZES[0];
    }
    class
}

fn class_index(size: usize) -> usize {
    debug_assert!(size.is_power_of_two());
    size.trailing_zeros() as usize - MSG_BUFFER_SIZES[0].trailing_zeros() as usize
}

fn acquire_vec(size: usize) -> Vec<u8> {
    let pool = &buffer_pools()[class_index(size)];
    pool.lock().pop().unwrap_or_else(|| vec![0u8; size])
}

fn release_vec(size: usize, mut buffer: Vec<u8>) {
    buffer.clear();
    buffer.resize(size, 0);
    buffer_pools()[class_index(size)].lock().push(buffer);
}

/// Pooled, resizable message buffer. Returned to its size-class stash on
/// drop so steady-state traffic allocates nothing.
#[derive(Debug)]
pub struct MsgBuffer {
    size_class: usize,
    len: usize,
    data: Option<Vec<u8>>,
}

impl MsgBuffer {
    fn with_class(size_class: usize, len: usize) -> MsgBuffer {
        MsgBuffer {
            size_class,
            len,
            data: Some(acquire_vec(size_class)),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data.as_ref().expect("buffer moved out")[..self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let len = self.len;
        &mut self.data.as_mut().expect("buffer moved out")[..len]
    }

    fn fill_from(&mut self, payload: &[u8]) {
        let n = payload.len().min(MAX_MSG_BUFFER_SIZE);
        self.resize(n);
        self.as_mut_slice().copy_from_slice(&payload[..n]);
    }

    /// Shrink or grow the valid length, migrating to a larger size class
    /// when the requested length no longer fits.
    pub fn resize(&mut self, len: usize) {
        if len > self.size_class {
            let new_class = size_class_for(len);
            let mut new_data = acquire_vec(new_class);
            if let Some(old) = self.data.take() {
                new_data[..self.len].copy_from_slice(&old[..self.len]);
                release_vec(self.size_class, old);
            }
            self.size_class = new_class;
            self.data = Some(new_data);
        }
        self.len = len.min(self.size_class);
    }
}

impl Drop for MsgBuffer {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            release_vec(self.size_class, data);
        }
    }
}

/// Acquire a pooled buffer with `size` valid bytes.
pub fn alloc_msg_buffer(size: usize) -> MsgBuffer {
    MsgBuffer::with_class(size_class_for(size), size.min(MAX_MSG_BUFFER_SIZE))
}

/// Explicit release; equivalent to dropping the buffer.
pub fn free_msg_buffer(buf: MsgBuffer) {
    drop(buf);
}

enum Frame {
    Request {
        token: u64,
        req_type: u8,
        payload: Vec<u8>,
        reply_to: Sender<Frame>,
    },
    Response {
        token: u64,
        payload: Vec<u8>,
    },
}

static NEXUS_REGISTRY: OnceLock<Mutex<HashMap<String, Sender<Frame>>>> = OnceLock::new();

fn registry() -> &'static Mutex<HashMap<String, Sender<Frame>>> {
    NEXUS_REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Process-wide listener identity bound to a local URI.
pub struct Nexus {
    uri: String,
    inbox_tx: Sender<Frame>,
    inbox_rx: Receiver<Frame>,
    registered_types: HashSet<u8>,
}

impl Nexus {
    /// Bind `uri`. Fails if another nexus in this process already owns it.
    pub fn new(uri: &str) -> Result<Nexus> {
        let (inbox_tx, inbox_rx) = unbounded();
        let mut reg = registry().lock();
        if reg.contains_key(uri) {
            return Err(Error::Transport(format!("address already bound: {uri}")));
        }
        reg.insert(uri.to_string(), inbox_tx.clone());
        Ok(Nexus {
            uri: uri.to_string(),
            inbox_tx,
            inbox_rx,
            registered_types: HashSet::new(),
        })
    }

    /// Admit a request-type dispatch ID. Requests carrying an unregistered
    /// type are dropped by the event loop.
    pub fn register_req_func(&mut self, req_type: u8) {
        self.registered_types.insert(req_type);
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }
}

impl Drop for Nexus {
    fn drop(&mut self) {
        registry().lock().remove(&self.uri);
    }
}

/// Handle to one in-flight inbound request; consumed by
/// [`RpcEndpoint::enqueue_response`]. The handle alone cannot touch the
/// network: responding requires the thread-pinned endpoint.
#[derive(Debug, Clone)]
pub struct ReqHandle {
    token: u64,
    reply_to: Sender<Frame>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionHandle(usize);

struct PendingCall {
    tag: u64,
    resp: MsgBuffer,
}

/// Event surfaced by one turn of the endpoint's event loop.
pub enum RpcEvent {
    /// Inbound request of a registered type.
    Request {
        req_type: u8,
        data: MsgBuffer,
        handle: ReqHandle,
    },
    /// Response matched to an earlier `enqueue_request` by its tag. The
    /// pre-allocated response buffer comes back resized to the payload.
    Response { tag: u64, data: MsgBuffer },
}

/// Per-thread endpoint. `!Send` by construction: every transport primitive
/// is invoked from the thread that created it, which is what makes the
/// worker's single-I/O-task rule checkable at compile time.
pub struct RpcEndpoint {
    inbox_rx: Receiver<Frame>,
    inbox_tx: Sender<Frame>,
    registered_types: HashSet<u8>,
    sessions: Vec<Sender<Frame>>,
    pending: HashMap<u64, PendingCall>,
    next_token: u64,
    _pinned: PhantomData<*mut ()>,
}

impl RpcEndpoint {
    /// Create the endpoint for `nexus` on the current thread.
    pub fn new(nexus: &Nexus) -> RpcEndpoint {
        RpcEndpoint {
            inbox_rx: nexus.inbox_rx.clone(),
            inbox_tx: nexus.inbox_tx.clone(),
            registered_types: nexus.registered_types.clone(),
            sessions: Vec::new(),
            pending: HashMap::new(),
            next_token: 1,
            _pinned: PhantomData,
        }
    }

    /// Connect to a remote nexus, blocking until it is reachable.
    pub fn create_session(&mut self, remote_uri: &str) -> Result<SessionHandle> {
        let deadline = Instant::now() + SESSION_CONNECT_TIMEOUT;
        loop {
            if let Some(tx) = registry().lock().get(remote_uri).cloned() {
                self.sessions.push(tx);
                return Ok(SessionHandle(self.sessions.len() - 1));
            }
            if Instant::now() >= deadline {
                return Err(Error::Transport(format!(
                    "session to {remote_uri} timed out"
                )));
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Fire a request on `session`. The response, when it arrives, is
    /// surfaced as [`RpcEvent::Response`] carrying `tag` and `resp_buf`.
    pub fn enqueue_request(
        &mut self,
        session: SessionHandle,
        req_type: u8,
        req_buf: &MsgBuffer,
        resp_buf: MsgBuffer,
        tag: u64,
    ) -> Result<()> {
        let token = self.next_token;
        self.next_token += 1;
        let remote = self
            .sessions
            .get(session.0)
            .ok_or_else(|| Error::Transport(format!("bad session {}", session.0)))?;
        let frame = Frame::Request {
            token,
            req_type,
            payload: req_buf.as_slice().to_vec(),
            reply_to: self.inbox_tx.clone(),
        };
        remote
            .send(frame)
            .map_err(|_| Error::Transport("session peer gone".into()))?;
        self.pending.insert(token, PendingCall { tag, resp: resp_buf });
        Ok(())
    }

    /// Send the response for an inbound request. Delivery failure means the
    /// peer went away mid-flight; the response is silently dropped, which
    /// the peer observes as a timeout.
    pub fn enqueue_response(&mut self, handle: &ReqHandle, resp_buf: &MsgBuffer) {
        let frame = Frame::Response {
            token: handle.token,
            payload: resp_buf.as_slice().to_vec(),
        };
        if handle.reply_to.send(frame).is_err() {
            log::debug!("response dropped: requester session closed");
        }
    }

    /// Drive one round of progress, surfacing at most a batch of events.
    pub fn run_event_loop_once(&mut self) -> Vec<RpcEvent> {
        let mut events = Vec::new();
        for _ in 0..EVENT_LOOP_BATCH {
            match self.inbox_rx.try_recv() {
                Ok(Frame::Request {
                    token,
                    req_type,
                    payload,
                    reply_to,
                }) => {
                    if !self.registered_types.contains(&req_type) {
                        log::warn!("dropping request with unregistered type {req_type}");
                        continue;
                    }
                    let mut data = alloc_msg_buffer(payload.len());
                    data.fill_from(&payload);
                    events.push(RpcEvent::Request {
                        req_type,
                        data,
                        handle: ReqHandle { token, reply_to },
                    });
                }
                Ok(Frame::Response { token, payload }) => {
                    let Some(mut call) = self.pending.remove(&token) else {
                        log::warn!("response for unknown token {token}, discarding");
                        continue;
                    };
                    call.resp.fill_from(&payload);
                    events.push(RpcEvent::Response {
                        tag: call.tag,
                        data: call.resp,
                    });
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        events
    }

    /// Number of requests sent but not yet matched to a response.
    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn buffer_resize_crosses_size_classes() {
        let mut buf = alloc_msg_buffer(32);
        assert_eq!(buf.len(), 32);
        buf.as_mut_slice().fill(7);
        buf.resize(4000);
        assert_eq!(buf.len(), 4000);
        assert!(buf.as_slice()[..32].iter().all(|&b| b == 7));
        buf.resize(8);
        assert_eq!(buf.len(), 8);
    }

    #[test]
    fn double_bind_is_rejected() {
        let _a = Nexus::new("test://double-bind").unwrap();
        assert!(matches!(
            Nexus::new("test://double-bind"),
            Err(Error::Transport(_))
        ));
    }

    #[test]
    fn request_response_round_trip_across_threads() {
        let mut server_nexus = Nexus::new("test://rpc-server").unwrap();
        server_nexus.register_req_func(9);

        let server = thread::spawn(move || {
            let mut ep = RpcEndpoint::new(&server_nexus);
            loop {
                for event in ep.run_event_loop_once() {
                    if let RpcEvent::Request { data, handle, .. } = event {
                        let mut resp = alloc_msg_buffer(data.len());
                        for (o, i) in resp.as_mut_slice().iter_mut().zip(data.as_slice()) {
                            *o = i.wrapping_add(1);
                        }
                        ep.enqueue_response(&handle, &resp);
                        return;
                    }
                }
                thread::yield_now();
            }
        });

        let client_nexus = Nexus::new("test://rpc-client").unwrap();
        let mut client = RpcEndpoint::new(&client_nexus);
        let session = client.create_session("test://rpc-server").unwrap();

        let mut req = alloc_msg_buffer(4);
        req.as_mut_slice().copy_from_slice(&[1, 2, 3, 4]);
        client
            .enqueue_request(session, 9, &req, alloc_msg_buffer(4), 0x55)
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        let mut got = None;
        while got.is_none() && Instant::now() < deadline {
            for event in client.run_event_loop_once() {
                if let RpcEvent::Response { tag, data } = event {
                    got = Some((tag, data.as_slice().to_vec()));
                }
            }
        }
        server.join().unwrap();
        let (tag, data) = got.expect("response arrived");
        assert_eq!(tag, 0x55);
        assert_eq!(data, vec![2, 3, 4, 5]);
        assert_eq!(client.pending_calls(), 0);
    }

    #[test]
    fn unregistered_request_type_is_dropped() {
        let mut nexus = Nexus::new("test://rpc-unreg").unwrap();
        nexus.register_req_func(1);
        let mut server = RpcEndpoint::new(&nexus);

        let client_nexus = Nexus::new("test://rpc-unreg-client").unwrap();
        let mut client = RpcEndpoint::new(&client_nexus);
        let session = client.create_session("test://rpc-unreg").unwrap();
        let req = alloc_msg_buffer(8);
        client
            .enqueue_request(session, 42, &req, alloc_msg_buffer(8), 1)
            .unwrap();

        thread::sleep(Duration::from_millis(10));
        assert!(server.run_event_loop_once().is_empty());
    }

    #[test]
    fn session_to_missing_peer_times_out() {
        let nexus = Nexus::new("test://rpc-lonely").unwrap();
        let mut ep = RpcEndpoint::new(&nexus);
        let start = Instant::now();
        let result = ep.create_session("test://rpc-nobody-home");
        assert!(result.is_err());
        assert!(start.elapsed() >= SESSION_CONNECT_TIMEOUT);
    }
}
