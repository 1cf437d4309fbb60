//! Byte-stream transport abstraction.
//!
//! The update protocol only needs an exclusively owned, blocking byte pipe.
//! `ByteTransport` is implemented by the serial port backend and by
//! [`MockTransport`](super::MockTransport) for tests.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to open {port}: {message}")]
    OpenFailed { port: String, message: String },

    #[error("Failed to configure {port}: {message}")]
    ConfigureFailed { port: String, message: String },

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Device disconnected")]
    Disconnected,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Abstract byte-stream transport.
pub trait ByteTransport {
    /// Write bytes, returning how many were accepted.
    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError>;

    /// Read whatever is available into `buf`.
    ///
    /// Blocks for at most a short poll interval and returns `Ok(0)` when
    /// nothing arrived; callers enforce their own deadlines on top.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Push out anything buffered on the host side.
    fn flush(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    /// Human-readable endpoint name for logs.
    fn description(&self) -> String;

    /// Write all of `data`.
    fn write_all(&mut self, mut data: &[u8]) -> Result<(), TransportError> {
        while !data.is_empty() {
            match self.write(data)? {
                0 => return Err(TransportError::WriteFailed("wrote zero bytes".into())),
                n => data = &data[n..],
            }
        }
        self.flush()
    }
}

impl<T: ByteTransport + ?Sized> ByteTransport for Box<T> {
    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        (**self).write(data)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        (**self).read(buf)
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        (**self).flush()
    }

    fn description(&self) -> String {
        (**self).description()
    }
}
