//! Append-only byte-stream device
//!
//! One [`Stream`] per device: a growable owned buffer behind a
//! reader/writer lock, a capacity ceiling shared by all devices of a
//! registry, and a readiness signal that wakes blocked readers after every
//! append. [`Handle`] is a caller's open connection, carrying a private
//! cursor and the caller's credentials.
//!
//! Writers take the lock exclusively; reads, seeks and polls share it.
//! Appends never invalidate a previously valid read offset, so readers at
//! their own cursors need no coordination beyond the lock.

use embedded_io::SeekFrom;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

use crate::error::DeviceError;
use crate::readiness::{ReadinessQueueArc, SignalId, TEARDOWN};

/// Longest control text accepted, excluding the terminator.
pub const MAX_CONTROL_TEXT: usize = 134;

/// Caller identity for the privileged control operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credentials {
    admin: bool,
}

impl Credentials {
    #[must_use]
    pub fn admin() -> Self {
        Self { admin: true }
    }

    #[must_use]
    pub fn user() -> Self {
        Self { admin: false }
    }

    /// Credentials of the invoking process (root is admin). Off unix the
    /// capability is never granted.
    #[must_use]
    pub fn from_process() -> Self {
        #[cfg(unix)]
        {
            // SAFETY: geteuid has no preconditions and cannot fail.
            let admin = unsafe { libc::geteuid() } == 0;
            Self { admin }
        }
        #[cfg(not(unix))]
        {
            Self { admin: false }
        }
    }

    #[must_use]
    pub fn is_admin(self) -> bool {
        self.admin
    }
}

/// Readiness state of one cursor against one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    /// Bytes are available at the cursor.
    pub readable: bool,
    /// The stream is below its capacity ceiling.
    pub writable: bool,
}

/// A control-plane request, parsed from its wire form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlRequest {
    /// Echo text to the diagnostic log. Unprivileged.
    Print(String),
    /// Log text, then kill the hosting process. Admin only.
    Panic(String),
    /// Trigger a deliberate fault in the hosting process. Admin only.
    Oops,
}

impl ControlRequest {
    /// Parse a verb plus its raw argument bytes.
    ///
    /// Text arguments are NUL-terminated on the wire; input without a
    /// terminator is force-terminated at [`MAX_CONTROL_TEXT`] bytes.
    /// Unknown verbs are rejected.
    pub fn parse(verb: &str, arg: &[u8]) -> Result<Self, DeviceError> {
        match verb {
            "print" => Ok(ControlRequest::Print(control_text(arg))),
            "panic" => Ok(ControlRequest::Panic(control_text(arg))),
            "oops" => Ok(ControlRequest::Oops),
            _ => Err(DeviceError::InvalidArgument),
        }
    }

    #[must_use]
    pub fn needs_admin(&self) -> bool {
        !matches!(self, ControlRequest::Print(_))
    }
}

fn control_text(arg: &[u8]) -> String {
    let end = arg
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(arg.len())
        .min(MAX_CONTROL_TEXT);
    String::from_utf8_lossy(&arg[..end]).into_owned()
}

/// One device's shared state.
pub struct Stream {
    name: String,
    ceiling: usize,
    state: RwLock<Vec<u8>>,
    signal: SignalId,
    queue: ReadinessQueueArc,
}

impl Stream {
    /// Created by the registry, which whitelists the readiness signal and
    /// un-lists it again at teardown.
    pub(crate) fn new(
        name: String,
        ceiling: usize,
        signal: SignalId,
        queue: ReadinessQueueArc,
    ) -> Arc<Self> {
        queue.whitelist(signal, &name);
        Arc::new(Self {
            name,
            ceiling,
            state: RwLock::new(Vec::new()),
            signal,
            queue,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn capacity_ceiling(&self) -> usize {
        self.ceiling
    }

    pub(crate) fn signal(&self) -> SignalId {
        self.signal
    }

    /// Current logical length.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append up to the remaining headroom below the ceiling.
    ///
    /// Returns the number of bytes actually written; `Ok(0)` on a full
    /// device. Allocation failure leaves the stream untouched. Readers
    /// parked on the readiness signal are woken outside the lock.
    pub fn append(&self, data: &[u8]) -> Result<usize, DeviceError> {
        if data.is_empty() {
            return Ok(0);
        }

        let (new_len, allowed) = {
            let mut buf = self.state.write();
            let headroom = self.ceiling.saturating_sub(buf.len());
            let allowed = data.len().min(headroom);
            if allowed == 0 {
                log::debug!("{}: append of {} bytes on a full device", self.name, data.len());
                return Ok(0);
            }
            buf.try_reserve(allowed)
                .map_err(|_| DeviceError::ResourceExhausted)?;
            buf.extend_from_slice(&data[..allowed]);
            (buf.len(), allowed)
        };

        // Notify outside lock
        self.queue.notify(self.signal, new_len as i64);
        log::debug!("{}: appended {} bytes, length {}", self.name, allowed, new_len);
        Ok(allowed)
    }

    /// Copy bytes at `cursor` into `buf`; returns the count copied.
    ///
    /// A cursor at or past the length reads zero bytes: end-of-stream is
    /// not an error. Never returns bytes beyond the length observed when
    /// the lock was taken.
    #[must_use]
    pub fn read_at(&self, cursor: usize, buf: &mut [u8]) -> usize {
        let state = self.state.read();
        if cursor >= state.len() {
            return 0;
        }
        let n = buf.len().min(state.len() - cursor);
        buf[..n].copy_from_slice(&state[cursor..cursor + n]);
        n
    }

    /// Resolve a seek against the current length.
    ///
    /// `End` is the length at this moment; a concurrent append may grow the
    /// stream before the caller uses the result, which is accepted. Targets
    /// outside `[0, length]` are rejected. The guard is released on every
    /// path.
    pub fn resolve_seek(&self, cursor: usize, pos: SeekFrom) -> Result<usize, DeviceError> {
        let state = self.state.read();
        let len = state.len() as i64;
        let target = match pos {
            SeekFrom::Start(offset) => {
                i64::try_from(offset).map_err(|_| DeviceError::InvalidArgument)?
            }
            SeekFrom::Current(delta) => (cursor as i64)
                .checked_add(delta)
                .ok_or(DeviceError::InvalidArgument)?,
            SeekFrom::End(delta) => len.checked_add(delta).ok_or(DeviceError::InvalidArgument)?,
        };
        if target < 0 || target > len {
            return Err(DeviceError::InvalidArgument);
        }
        Ok(target as usize)
    }

    /// Readiness snapshot for `cursor`.
    #[must_use]
    pub fn poll(&self, cursor: usize) -> Readiness {
        let state = self.state.read();
        Readiness {
            readable: cursor < state.len(),
            writable: state.len() < self.ceiling,
        }
    }

    /// Park until bytes are available at `cursor`.
    ///
    /// Registers on the readiness signal under the queue lock, re-checking
    /// the condition there so a concurrent append cannot slip between check
    /// and registration (see the readiness module documentation). Returns
    /// `false` only when the stream was torn down while waiting.
    pub async fn wait_readable(&self, cursor: usize) -> bool {
        loop {
            if self.poll(cursor).readable {
                return true;
            }

            // Lock ordering: queue, then the stream lock briefly inside.
            // Writers take the stream lock alone and notify after releasing
            // it, so the order never inverts.
            let lock = self.queue.get_lock();
            if self.poll(cursor).readable {
                drop(lock);
                return true;
            }
            let value = self.queue.wait_async(self.signal, &self.name, lock).await;
            if value == TEARDOWN {
                return false;
            }
        }
    }

    /// Execute a control request under the caller's credentials.
    ///
    /// `Panic` and `Oops` deliberately kill the hosting process and do not
    /// return; they exist for fault-injection drills only.
    pub fn control(&self, creds: Credentials, req: &ControlRequest) -> Result<(), DeviceError> {
        if req.needs_admin() && !creds.is_admin() {
            log::warn!("{}: privileged control op {:?} denied", self.name, req);
            return Err(DeviceError::PermissionDenied);
        }
        match req {
            ControlRequest::Print(text) => {
                log::info!("{}: user print: [{}]", self.name, text);
                Ok(())
            }
            ControlRequest::Panic(text) => {
                log::error!("{}: user panic: [{}]", self.name, text);
                std::process::abort();
            }
            ControlRequest::Oops => {
                // An unwind would be caught at a task boundary; only an
                // abort reliably takes the whole process down.
                log::error!("{}: user oops, killing the process", self.name);
                std::process::abort();
            }
        }
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("name", &self.name)
            .field("len", &self.len())
            .field("ceiling", &self.ceiling)
            .finish()
    }
}

/// A caller's open connection to one stream.
///
/// Owns the cursor; many handles may reference the same stream. Dropping a
/// handle releases nothing on the stream side.
pub struct Handle {
    stream: Arc<Stream>,
    cursor: usize,
    creds: Credentials,
}

impl Handle {
    pub(crate) fn new(stream: Arc<Stream>, creds: Credentials) -> Self {
        Self {
            stream,
            cursor: 0,
            creds,
        }
    }

    #[must_use]
    pub fn stream(&self) -> &Arc<Stream> {
        &self.stream
    }

    #[must_use]
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Bytes currently available between the cursor and the end of the
    /// stream. The stream never shrinks, so the value is a lower bound by
    /// the time the caller acts on it.
    #[must_use]
    pub fn available(&self) -> usize {
        self.stream.len().saturating_sub(self.cursor)
    }

    /// Append to the stream. The cursor advances by the count written,
    /// file-position style, even though the data always lands at the end.
    pub fn write(&mut self, data: &[u8]) -> Result<usize, DeviceError> {
        let n = self.stream.append(data)?;
        self.cursor += n;
        Ok(n)
    }

    /// Read at the cursor and advance by the count read.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, DeviceError> {
        let n = self.stream.read_at(self.cursor, buf);
        self.cursor += n;
        Ok(n)
    }

    /// Peek at the cursor without committing the advance. Transports that
    /// must confirm delivery first pair this with [`Handle::advance`].
    pub fn read_peek(&self, buf: &mut [u8]) -> usize {
        self.stream.read_at(self.cursor, buf)
    }

    pub(crate) fn advance(&mut self, n: usize) {
        self.cursor += n;
    }

    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64, DeviceError> {
        let cursor = self.stream.resolve_seek(self.cursor, pos)?;
        self.cursor = cursor;
        Ok(cursor as u64)
    }

    #[must_use]
    pub fn poll(&self) -> Readiness {
        self.stream.poll(self.cursor)
    }

    /// Park until the cursor becomes readable; `false` on stream teardown.
    pub async fn wait_readable(&self) -> bool {
        self.stream.wait_readable(self.cursor).await
    }

    pub fn control(&self, req: &ControlRequest) -> Result<(), DeviceError> {
        self.stream.control(self.creds, req)
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("stream", &self.stream.name)
            .field("cursor", &self.cursor)
            .field("admin", &self.creds.is_admin())
            .finish()
    }
}

// Implement embedded_io traits so a handle plugs into generic byte I/O.
impl embedded_io::ErrorType for Handle {
    type Error = DeviceError;
}

impl embedded_io::Write for Handle {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        Handle::write(self, buf)
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

impl embedded_io::Read for Handle {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        Handle::read(self, buf)
    }
}

impl embedded_io::Seek for Handle {
    fn seek(&mut self, pos: SeekFrom) -> Result<u64, Self::Error> {
        Handle::seek(self, pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(ceiling: usize) -> Arc<Stream> {
        let queue = ReadinessQueueArc::new();
        Stream::new("memdev0".to_string(), ceiling, SignalId::new(0), queue)
    }

    #[test]
    fn control_parse_cuts_at_nul() {
        let req = ControlRequest::parse("print", b"hello\0trailing").unwrap();
        assert_eq!(req, ControlRequest::Print("hello".to_string()));
    }

    #[test]
    fn control_parse_forces_termination() {
        let long = vec![b'a'; 500];
        let ControlRequest::Print(text) = ControlRequest::parse("print", &long).unwrap() else {
            panic!("wrong verb");
        };
        assert_eq!(text.len(), MAX_CONTROL_TEXT);
    }

    #[test]
    fn control_parse_rejects_unknown_verb() {
        let err = ControlRequest::parse("reboot", b"\0").unwrap_err();
        assert_eq!(err, DeviceError::InvalidArgument);
    }

    #[test]
    fn seek_bounds() {
        let s = stream(64);
        s.append(b"0123456789").unwrap();

        assert_eq!(s.resolve_seek(0, SeekFrom::Start(10)).unwrap(), 10);
        assert_eq!(s.resolve_seek(4, SeekFrom::Current(-4)).unwrap(), 0);
        assert_eq!(s.resolve_seek(0, SeekFrom::End(-10)).unwrap(), 0);
        assert_eq!(
            s.resolve_seek(0, SeekFrom::Start(11)).unwrap_err(),
            DeviceError::InvalidArgument
        );
        assert_eq!(
            s.resolve_seek(0, SeekFrom::Current(-1)).unwrap_err(),
            DeviceError::InvalidArgument
        );
        assert_eq!(
            s.resolve_seek(0, SeekFrom::End(1)).unwrap_err(),
            DeviceError::InvalidArgument
        );
    }

    #[test]
    fn append_ignores_cursor_and_truncates_at_ceiling() {
        let s = stream(4);
        assert_eq!(s.append(b"abcdef").unwrap(), 4);
        assert_eq!(s.append(b"x").unwrap(), 0);
        assert_eq!(s.len(), 4);
        assert!(!s.poll(0).writable);
    }

    #[tokio::test]
    async fn wait_readable_woken_by_append() {
        let s = stream(64);
        let waiter = {
            let s = s.clone();
            tokio::spawn(async move { s.wait_readable(0).await })
        };
        // Give the waiter time to park before the append.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        s.append(b"x").unwrap();
        assert!(waiter.await.unwrap());
    }
}
