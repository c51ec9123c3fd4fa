//! Device node layer
//!
//! The host-environment collaborator: owns the public name table and routes
//! external requests to the right stream. Requests arrive over a channel
//! and are answered over per-request oneshots; blocking readiness waits are
//! parked in a `FuturesUnordered` so the router never stalls on one caller.
//!
//! This is also the boundary where a delivery fault is observable. Read
//! data is handed back before the cursor commits; when the reply receiver
//! has vanished the operation is accounted a fault and the cursor stays
//! put.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use embedded_io::SeekFrom;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::DeviceError;
use crate::registry::Registry;
use crate::stream::{ControlRequest, Credentials, Handle, Readiness};

/// Descriptor for one open session at the node layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionFd(pub i32);

/// Requests routed by the node layer.
pub enum NodeRequest {
    Open {
        name: String,
        creds: Credentials,
        resp: oneshot::Sender<Result<SessionFd, DeviceError>>,
    },
    Close {
        fd: SessionFd,
        resp: oneshot::Sender<Result<(), DeviceError>>,
    },
    Read {
        fd: SessionFd,
        max: usize,
        resp: oneshot::Sender<Result<Vec<u8>, DeviceError>>,
    },
    Write {
        fd: SessionFd,
        data: Vec<u8>,
        resp: oneshot::Sender<Result<usize, DeviceError>>,
    },
    Seek {
        fd: SessionFd,
        pos: SeekFrom,
        resp: oneshot::Sender<Result<u64, DeviceError>>,
    },
    Poll {
        fd: SessionFd,
        resp: oneshot::Sender<Result<Readiness, DeviceError>>,
    },
    /// Like `Poll`, but parks until the session cursor is readable.
    WaitReadable {
        fd: SessionFd,
        resp: oneshot::Sender<Result<Readiness, DeviceError>>,
    },
    Control {
        fd: SessionFd,
        verb: String,
        arg: Vec<u8>,
        resp: oneshot::Sender<Result<(), DeviceError>>,
    },
}

/// Completed async operation, fed back into the router loop.
enum NodeEvent {
    WaitDone {
        fd: SessionFd,
        alive: bool,
        resp: oneshot::Sender<Result<Readiness, DeviceError>>,
    },
}

type NodeFuture = Pin<Box<dyn Future<Output = NodeEvent> + Send>>;

/// The router: name table, session table and the request loop.
pub struct NodeHost {
    registry: Arc<Registry>,
    entries: HashMap<String, usize>,
    sessions: HashMap<SessionFd, Handle>,
    next_fd: i32,
    node_tx: Option<mpsc::UnboundedSender<NodeRequest>>,
    request_rx: mpsc::UnboundedReceiver<NodeRequest>,
}

impl NodeHost {
    /// Register every stream of `registry` under its public name.
    ///
    /// A name collision unwinds the partially built table before the
    /// failure is reported; no entry of a failed registration survives.
    pub fn new(registry: Arc<Registry>) -> Result<Self, DeviceError> {
        let (node_tx, request_rx) = mpsc::unbounded_channel();
        let mut entries = HashMap::new();
        for (index, name) in registry.names().enumerate() {
            if entries.insert(name.to_string(), index).is_some() {
                warn!(name, "node: duplicate entry name, unwinding registration");
                entries.clear();
                return Err(DeviceError::InvalidArgument);
            }
        }
        info!(entries = entries.len(), "node: registered");
        Ok(Self {
            registry,
            entries,
            sessions: HashMap::new(),
            // Session descriptors start above the stdio range.
            next_fd: 3,
            node_tx: Some(node_tx),
            request_rx,
        })
    }

    /// Publish extra names for existing entries.
    ///
    /// Validated name by name; on the first bad index every alias added by
    /// this call is removed again, leaving the table as it was.
    pub fn add_aliases(&mut self, aliases: &[(&str, usize)]) -> Result<(), DeviceError> {
        let mut added: Vec<String> = Vec::new();
        for &(name, index) in aliases {
            if index >= self.registry.device_count() || self.entries.contains_key(name) {
                warn!(name, index, "node: alias rejected, rolling back");
                for name in added {
                    self.entries.remove(&name);
                }
                return Err(DeviceError::InvalidArgument);
            }
            self.entries.insert(name.to_string(), index);
            added.push(name.to_string());
        }
        Ok(())
    }

    /// Get a client for issuing requests to this router.
    #[allow(clippy::expect_used)]
    #[must_use]
    pub fn client(&self) -> NodeClient {
        NodeClient {
            tx: self.node_tx.as_ref().expect("node_tx taken").clone(),
        }
    }

    fn alloc_fd(&mut self) -> SessionFd {
        let fd = SessionFd(self.next_fd);
        self.next_fd += 1;
        fd
    }

    fn handle_open(
        &mut self,
        name: &str,
        creds: Credentials,
        resp: oneshot::Sender<Result<SessionFd, DeviceError>>,
    ) {
        let result = match self.entries.get(name) {
            Some(&index) => match self.registry.stream(index).cloned() {
                Some(stream) => {
                    let fd = self.alloc_fd();
                    self.sessions.insert(fd, Handle::new(stream, creds));
                    info!(name, fd = fd.0, "node: open");
                    Ok(fd)
                }
                None => Err(DeviceError::NotFound),
            },
            None => {
                debug!(name, "node: open of unknown entry");
                Err(DeviceError::NotFound)
            }
        };
        let _ = resp.send(result);
    }

    fn handle_close(&mut self, fd: SessionFd, resp: oneshot::Sender<Result<(), DeviceError>>) {
        let result = match self.sessions.remove(&fd) {
            Some(_) => {
                debug!(fd = fd.0, "node: close");
                Ok(())
            }
            None => Err(DeviceError::InvalidArgument),
        };
        let _ = resp.send(result);
    }

    /// Read at the session cursor. The cursor advances only after the reply
    /// has been accepted; a vanished receiver is a fault and leaves it
    /// unmoved.
    fn handle_read(
        &mut self,
        fd: SessionFd,
        max: usize,
        resp: oneshot::Sender<Result<Vec<u8>, DeviceError>>,
    ) {
        let Some(handle) = self.sessions.get_mut(&fd) else {
            let _ = resp.send(Err(DeviceError::InvalidArgument));
            return;
        };
        // The request size is unbounded; allocate only what the stream can
        // deliver at this cursor.
        let mut data = vec![0u8; max.min(handle.available())];
        let n = handle.read_peek(&mut data);
        data.truncate(n);
        trace!(fd = fd.0, bytes = n, "node: read");
        match resp.send(Ok(data)) {
            Ok(()) => handle.advance(n),
            Err(_) => {
                warn!(fd = fd.0, label = DeviceError::Fault.as_label(), "node: reply delivery failed, cursor not advanced");
            }
        }
    }

    fn handle_write(
        &mut self,
        fd: SessionFd,
        data: &[u8],
        resp: oneshot::Sender<Result<usize, DeviceError>>,
    ) {
        let result = match self.sessions.get_mut(&fd) {
            Some(handle) => handle.write(data),
            None => Err(DeviceError::InvalidArgument),
        };
        trace!(fd = fd.0, bytes = data.len(), "node: write");
        // The append is committed either way; only the count can be lost.
        let _ = resp.send(result);
    }

    fn handle_seek(
        &mut self,
        fd: SessionFd,
        pos: SeekFrom,
        resp: oneshot::Sender<Result<u64, DeviceError>>,
    ) {
        let result = match self.sessions.get_mut(&fd) {
            Some(handle) => handle.seek(pos),
            None => Err(DeviceError::InvalidArgument),
        };
        let _ = resp.send(result);
    }

    fn handle_poll(&self, fd: SessionFd, resp: oneshot::Sender<Result<Readiness, DeviceError>>) {
        let result = match self.sessions.get(&fd) {
            Some(handle) => Ok(handle.poll()),
            None => Err(DeviceError::InvalidArgument),
        };
        let _ = resp.send(result);
    }

    /// Park the wait in the pending set; the router keeps serving other
    /// callers meanwhile.
    fn handle_wait_readable(
        &self,
        fd: SessionFd,
        resp: oneshot::Sender<Result<Readiness, DeviceError>>,
    ) -> Option<NodeFuture> {
        let Some(handle) = self.sessions.get(&fd) else {
            let _ = resp.send(Err(DeviceError::InvalidArgument));
            return None;
        };
        let stream = Arc::clone(handle.stream());
        let cursor = handle.cursor();
        trace!(fd = fd.0, cursor, "node: wait-readable parked");
        Some(Box::pin(async move {
            let alive = stream.wait_readable(cursor).await;
            NodeEvent::WaitDone { fd, alive, resp }
        }))
    }

    fn handle_wait_done(
        &self,
        fd: SessionFd,
        alive: bool,
        resp: oneshot::Sender<Result<Readiness, DeviceError>>,
    ) {
        let result = if !alive {
            // Torn down while parked.
            Err(DeviceError::NotFound)
        } else {
            match self.sessions.get(&fd) {
                // Readiness is re-evaluated at the session's current cursor.
                Some(handle) => Ok(handle.poll()),
                None => Err(DeviceError::InvalidArgument),
            }
        };
        let _ = resp.send(result);
    }

    fn handle_control(
        &self,
        fd: SessionFd,
        verb: &str,
        arg: &[u8],
        resp: oneshot::Sender<Result<(), DeviceError>>,
    ) {
        let result = match self.sessions.get(&fd) {
            Some(handle) => {
                ControlRequest::parse(verb, arg).and_then(|req| handle.control(&req))
            }
            None => Err(DeviceError::InvalidArgument),
        };
        if let Err(e) = &result {
            debug!(fd = fd.0, verb, label = e.as_label(), "node: control rejected");
        }
        let _ = resp.send(result);
    }

    /// Main router loop. Exits when every client is gone and no wait is
    /// still parked, or when `token` is canceled at shutdown. Registry
    /// teardown wakes parked waits so they drain instead of hanging.
    pub async fn run(mut self, token: CancellationToken) {
        // Drop our copy of the sender so the channel closes with the last
        // external client.
        drop(self.node_tx.take());

        let mut pending_waits: FuturesUnordered<NodeFuture> = FuturesUnordered::new();
        let mut request_rx_open = true;

        loop {
            if !request_rx_open && pending_waits.is_empty() {
                info!("node: no more work, exiting");
                break;
            }

            tokio::select! {
                () = token.cancelled() => {
                    // Outstanding replies are dropped; senders observe a
                    // fault, which is what talking to a vanished device is.
                    info!("node: shutdown requested");
                    break;
                }

                request = self.request_rx.recv(), if request_rx_open => {
                    if let Some(request) = request {
                        match request {
                            NodeRequest::Open { name, creds, resp } => {
                                self.handle_open(&name, creds, resp);
                            }
                            NodeRequest::Close { fd, resp } => {
                                self.handle_close(fd, resp);
                            }
                            NodeRequest::Read { fd, max, resp } => {
                                self.handle_read(fd, max, resp);
                            }
                            NodeRequest::Write { fd, data, resp } => {
                                self.handle_write(fd, &data, resp);
                            }
                            NodeRequest::Seek { fd, pos, resp } => {
                                self.handle_seek(fd, pos, resp);
                            }
                            NodeRequest::Poll { fd, resp } => {
                                self.handle_poll(fd, resp);
                            }
                            NodeRequest::WaitReadable { fd, resp } => {
                                if let Some(fut) = self.handle_wait_readable(fd, resp) {
                                    pending_waits.push(fut);
                                }
                            }
                            NodeRequest::Control { fd, verb, arg, resp } => {
                                self.handle_control(fd, &verb, &arg, resp);
                            }
                        }
                    } else {
                        debug!("node: request channel closed");
                        request_rx_open = false;
                    }
                }

                Some(event) = pending_waits.next(), if !pending_waits.is_empty() => {
                    match event {
                        NodeEvent::WaitDone { fd, alive, resp } => {
                            self.handle_wait_done(fd, alive, resp);
                        }
                    }
                }
            }
        }
    }
}

/// Cheap-to-clone async client for a [`NodeHost`].
#[derive(Clone)]
pub struct NodeClient {
    tx: mpsc::UnboundedSender<NodeRequest>,
}

impl NodeClient {
    async fn roundtrip<T>(
        &self,
        req: NodeRequest,
        rx: oneshot::Receiver<Result<T, DeviceError>>,
    ) -> Result<T, DeviceError> {
        self.tx.send(req).map_err(|_| DeviceError::Fault)?;
        rx.await.map_err(|_| DeviceError::Fault)?
    }

    pub async fn open(&self, name: &str, creds: Credentials) -> Result<SessionFd, DeviceError> {
        let (resp, rx) = oneshot::channel();
        let req = NodeRequest::Open {
            name: name.to_string(),
            creds,
            resp,
        };
        self.roundtrip(req, rx).await
    }

    /// Open with the bare-name fallback: try `prefix` itself, then
    /// `<prefix>0`.
    pub async fn open_first(
        &self,
        prefix: &str,
        creds: Credentials,
    ) -> Result<SessionFd, DeviceError> {
        match self.open(prefix, creds).await {
            Err(DeviceError::NotFound) => self.open(&format!("{prefix}0"), creds).await,
            other => other,
        }
    }

    pub async fn close(&self, fd: SessionFd) -> Result<(), DeviceError> {
        let (resp, rx) = oneshot::channel();
        self.roundtrip(NodeRequest::Close { fd, resp }, rx).await
    }

    pub async fn read(&self, fd: SessionFd, max: usize) -> Result<Vec<u8>, DeviceError> {
        let (resp, rx) = oneshot::channel();
        self.roundtrip(NodeRequest::Read { fd, max, resp }, rx).await
    }

    pub async fn write(&self, fd: SessionFd, data: &[u8]) -> Result<usize, DeviceError> {
        let (resp, rx) = oneshot::channel();
        let req = NodeRequest::Write {
            fd,
            data: data.to_vec(),
            resp,
        };
        self.roundtrip(req, rx).await
    }

    pub async fn seek(&self, fd: SessionFd, pos: SeekFrom) -> Result<u64, DeviceError> {
        let (resp, rx) = oneshot::channel();
        self.roundtrip(NodeRequest::Seek { fd, pos, resp }, rx).await
    }

    pub async fn poll(&self, fd: SessionFd) -> Result<Readiness, DeviceError> {
        let (resp, rx) = oneshot::channel();
        self.roundtrip(NodeRequest::Poll { fd, resp }, rx).await
    }

    /// Block until the session has bytes to read, then report readiness.
    pub async fn wait_readable(&self, fd: SessionFd) -> Result<Readiness, DeviceError> {
        let (resp, rx) = oneshot::channel();
        self.roundtrip(NodeRequest::WaitReadable { fd, resp }, rx)
            .await
    }

    pub async fn control(&self, fd: SessionFd, verb: &str, arg: &[u8]) -> Result<(), DeviceError> {
        let (resp, rx) = oneshot::channel();
        let req = NodeRequest::Control {
            fd,
            verb: verb.to_string(),
            arg: arg.to_vec(),
            resp,
        };
        self.roundtrip(req, rx).await
    }

    /// Hand a pre-built request to the router without waiting for the
    /// reply.
    pub fn send_raw(&self, req: NodeRequest) -> Result<(), DeviceError> {
        self.tx.send(req).map_err(|_| DeviceError::Fault)
    }
}
