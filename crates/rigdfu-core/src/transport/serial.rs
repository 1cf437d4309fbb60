//! Serial port transport built on the `serial` crate.

use std::io::{self, Read, Write};

use serial::{BaudRate, SerialPort, SerialPortSettings};
use tracing::{debug, info, instrument};

use super::traits::{ByteTransport, TransportError};
use crate::protocol::constants::POLL_INTERVAL;

/// 8N1 serial link without flow control.
pub struct SerialTransport {
    port: serial::SystemPort,
    name: String,
}

impl SerialTransport {
    /// Open and configure `port` at `baud_rate`.
    #[instrument(level = "info")]
    pub fn open(port: &str, baud_rate: usize) -> Result<Self, TransportError> {
        let mut handle = serial::open(port).map_err(|e| TransportError::OpenFailed {
            port: port.to_string(),
            message: e.to_string(),
        })?;

        let configure = |e: serial::Error| TransportError::ConfigureFailed {
            port: port.to_string(),
            message: e.to_string(),
        };
        handle
            .reconfigure(&|settings: &mut dyn SerialPortSettings| {
                settings.set_baud_rate(BaudRate::from_speed(baud_rate))?;
                settings.set_char_size(serial::Bits8);
                settings.set_parity(serial::ParityNone);
                settings.set_stop_bits(serial::Stop1);
                settings.set_flow_control(serial::FlowNone);
                Ok(())
            })
            .map_err(configure)?;
        handle.set_timeout(POLL_INTERVAL).map_err(configure)?;

        info!(port, baud_rate, "Opened serial port");
        Ok(Self {
            port: handle,
            name: port.to_string(),
        })
    }
}

impl ByteTransport for SerialTransport {
    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        self.port
            .write(data)
            .map_err(|e| TransportError::WriteFailed(e.to_string()))
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {
                Ok(0)
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(0),
            Err(e) => {
                debug!(error = %e, "Serial read failed");
                Err(TransportError::ReadFailed(e.to_string()))
            }
        }
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        self.port.flush()?;
        Ok(())
    }

    fn description(&self) -> String {
        self.name.clone()
    }
}
