//! Mock byte transport for testing.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::traits::{ByteTransport, TransportError};
use crate::protocol::frame;
use crate::protocol::{OpCode, OpStatus};

/// Called with every write; returned bytes become readable.
pub type Responder = Box<dyn FnMut(&[u8]) -> Option<Vec<u8>> + Send>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scripted transport. Clones share state, so a test can keep a handle
/// after moving the transport into a session.
#[derive(Clone)]
pub struct MockTransport {
    /// Bytes waiting to be read.
    rx: Arc<Mutex<VecDeque<u8>>>,
    /// Captured writes.
    write_log: Arc<Mutex<Vec<Vec<u8>>>>,
    responder: Arc<Mutex<Option<Responder>>>,
    /// Whether device is "connected".
    connected: Arc<Mutex<bool>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            rx: Arc::new(Mutex::new(VecDeque::new())),
            write_log: Arc::new(Mutex::new(Vec::new())),
            responder: Arc::new(Mutex::new(None)),
            connected: Arc::new(Mutex::new(true)),
        }
    }

    /// Make raw bytes available to the next reads.
    pub fn queue_rx(&self, bytes: &[u8]) {
        lock(&self.rx).extend(bytes.iter().copied());
    }

    /// Queue an encoded response frame.
    pub fn queue_response(&self, op: OpCode, status: OpStatus) {
        self.queue_rx(&frame::encode_response(op.as_u8(), status.as_u8()));
    }

    /// React to every write with `responder`.
    pub fn set_responder<F>(&self, responder: F)
    where
        F: FnMut(&[u8]) -> Option<Vec<u8>> + Send + 'static,
    {
        *lock(&self.responder) = Some(Box::new(responder));
    }

    /// Get all captured writes.
    pub fn get_writes(&self) -> Vec<Vec<u8>> {
        lock(&self.write_log).clone()
    }

    /// Bytes queued but not yet read.
    pub fn pending_rx(&self) -> usize {
        lock(&self.rx).len()
    }

    /// Simulate device disconnect.
    pub fn disconnect(&self) {
        *lock(&self.connected) = false;
    }

    /// Simulate device reconnect.
    pub fn reconnect(&self) {
        *lock(&self.connected) = true;
    }

    fn check_connected(&self) -> Result<(), TransportError> {
        if *lock(&self.connected) {
            Ok(())
        } else {
            Err(TransportError::Disconnected)
        }
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ByteTransport for MockTransport {
    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        self.check_connected()?;
        lock(&self.write_log).push(data.to_vec());

        let reply = lock(&self.responder).as_mut().and_then(|r| r(data));
        if let Some(reply) = reply {
            self.queue_rx(&reply);
        }
        Ok(data.len())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        self.check_connected()?;
        let mut rx = lock(&self.rx);
        let n = buf.len().min(rx.len());
        for (slot, byte) in buf.iter_mut().zip(rx.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn description(&self) -> String {
        "mock".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_rx_queue() {
        let mut mock = MockTransport::new();
        mock.queue_rx(b"Hello");

        let mut buf = [0u8; 3];
        assert_eq!(mock.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf, b"Hel");
        assert_eq!(mock.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"lo");

        // Queue is empty now
        assert_eq!(mock.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_mock_write_capture() {
        let mut mock = MockTransport::new();
        mock.write_all(b"Hello").unwrap();
        mock.write_all(b"World").unwrap();

        let writes = mock.get_writes();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0], b"Hello");
        assert_eq!(writes[1], b"World");
    }

    #[test]
    fn test_mock_responder_and_shared_handle() {
        let mut mock = MockTransport::new();
        let handle = mock.clone();
        mock.set_responder(|data| (data == b"ping").then(|| b"pong".to_vec()));

        mock.write_all(b"noise").unwrap();
        assert_eq!(handle.pending_rx(), 0);
        mock.write_all(b"ping").unwrap();
        assert_eq!(handle.pending_rx(), 4);
        assert_eq!(handle.get_writes().len(), 2);
    }

    #[test]
    fn test_mock_disconnect() {
        let mut mock = MockTransport::new();
        mock.disconnect();
        assert!(mock.write(b"test").is_err());
        assert!(matches!(
            mock.read(&mut [0u8; 4]),
            Err(TransportError::Disconnected)
        ));
        mock.reconnect();
        assert!(mock.write(b"test").is_ok());
    }
}
