//! Update session - high-level orchestrator for the serial DFU process.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::events::{DfuEvent, DfuObserver, DfuPhase, TracingObserver};
use crate::image::{ContainerError, ImageContainer};
use crate::protocol::constants::*;
use crate::protocol::frame::{self, FrameError};
use crate::protocol::{OpCode, OpStatus};
use crate::signer::{ConfigRecord, ConfigSigner, SignerError, sign_config};
use crate::state::handlers::{
    HandlerContext, handle_activate, handle_config, handle_init, handle_start, handle_transfer,
    handle_validate,
};
use crate::state::machine::{InvalidTransition, StateMachineContext, UpdatePhase};
use crate::transport::{ByteTransport, TransportError};

#[derive(Error, Debug)]
pub enum SessionError {
    /// `echoed` is the opcode of the frame that came back. `status` is 0
    /// when that frame was not a Response.
    #[error("{sent} expected {expected}, device answered opcode {echoed} status {status}")]
    ProtocolMismatch {
        sent: OpCode,
        expected: OpStatus,
        echoed: u8,
        status: u8,
    },

    #[error("no response to {op}")]
    NoResponse { op: OpCode },

    #[error("device not responding after {attempts} wake attempts")]
    DeviceNotResponding { attempts: u32 },

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error("framing error: {0}")]
    Frame(#[from] FrameError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("invalid image: {0}")]
    Container(#[from] ContainerError),

    #[error("signing failed: {0}")]
    Signer(#[from] SignerError),

    #[error("config packet must be 92 bytes, got {len}")]
    ConfigPacketSize { len: usize },

    #[error("invalid session config: {0}")]
    InvalidConfig(String),
}

/// Configuration for an update session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Serial device path.
    pub port: Option<String>,
    pub baud_rate: usize,
    /// Image bytes per ImageTransfer frame.
    pub chunk_size: usize,
    /// Bytes between progress reports.
    pub progress_interval: usize,
    pub response_timeout_ms: u64,
    /// Listening time after each wake pattern.
    pub banner_timeout_ms: u64,
    pub wake_attempts: u32,
    /// Wait after ActivateAndReset before reporting completion.
    pub settle_delay_ms: u64,
    /// Extra whole-session attempts after a failed update.
    pub retries: u32,
    /// Executable used to encrypt config packets.
    pub signer_path: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: DEFAULT_BAUD_RATE,
            chunk_size: DEFAULT_CHUNK_SIZE,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            response_timeout_ms: DEFAULT_RESPONSE_TIMEOUT.as_millis() as u64,
            banner_timeout_ms: DEFAULT_BANNER_TIMEOUT.as_millis() as u64,
            wake_attempts: DEFAULT_WAKE_ATTEMPTS,
            settle_delay_ms: DEFAULT_SETTLE_DELAY.as_millis() as u64,
            retries: 0,
            signer_path: None,
        }
    }
}

impl SessionConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SessionConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), SessionError> {
        if self.chunk_size == 0 || self.chunk_size > MAX_PAYLOAD_SIZE {
            return Err(SessionError::InvalidConfig(format!(
                "chunk_size {} outside 1..={MAX_PAYLOAD_SIZE}",
                self.chunk_size
            )));
        }
        if self.wake_attempts == 0 {
            return Err(SessionError::InvalidConfig(
                "wake_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn banner_timeout(&self) -> Duration {
        Duration::from_millis(self.banner_timeout_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

/// Update session - owns one transport for its whole lifetime.
pub struct UpdateSession<T: ByteTransport, O: DfuObserver> {
    transport: T,
    config: SessionConfig,
    observer: Arc<O>,
    state: StateMachineContext,
}

impl<T: ByteTransport> UpdateSession<T, TracingObserver> {
    /// Create a new session with default tracing observer.
    pub fn new(transport: T, config: SessionConfig) -> Self {
        Self::with_observer(transport, config, Arc::new(TracingObserver))
    }
}

impl<T: ByteTransport, O: DfuObserver> UpdateSession<T, O> {
    /// Create a new session with a custom observer.
    pub fn with_observer(transport: T, config: SessionConfig, observer: Arc<O>) -> Self {
        Self {
            transport,
            config,
            observer,
            state: StateMachineContext::new(),
        }
    }

    pub fn phase(&self) -> UpdatePhase {
        self.state.phase
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn phase_changed(&self, from: DfuPhase, to: DfuPhase) {
        self.observer.on_event(&DfuEvent::PhaseChanged { from, to });
    }

    fn fail(&self, from: DfuPhase, err: SessionError) -> SessionError {
        self.observer.on_event(&DfuEvent::Error {
            message: err.to_string(),
        });
        self.phase_changed(from, DfuPhase::Error);
        err
    }

    fn context(&mut self) -> HandlerContext<'_, T, O> {
        HandlerContext {
            transport: &mut self.transport,
            observer: self.observer.as_ref(),
            state: &mut self.state,
            config: &self.config,
        }
    }

    /// Wake the serial loader and wait for its banner.
    #[instrument(skip(self), fields(port = %self.transport.description()))]
    pub fn activate_link(&mut self) -> Result<String, SessionError> {
        let max = self.config.wake_attempts;
        for attempt in 1..=max {
            self.observer
                .on_event(&DfuEvent::WakeAttempt { attempt, max });
            self.transport.write_all(&WAKE_PATTERN)?;

            let reply = frame::read_raw(
                &mut self.transport,
                MAX_BANNER_SIZE,
                self.config.banner_timeout(),
                Some(b'\n'),
            )?;
            if !reply.is_empty() {
                let banner = String::from_utf8_lossy(&reply).trim().to_string();
                self.observer.on_event(&DfuEvent::LinkReady {
                    banner: banner.clone(),
                });
                return Ok(banner);
            }
        }
        Err(SessionError::DeviceNotResponding { attempts: max })
    }

    /// Run the full update sequence for `container`, from link activation
    /// to the post-activation settling delay.
    #[instrument(skip_all, fields(bytes = container.total_len()))]
    pub fn run(&mut self, container: &ImageContainer) -> Result<(), SessionError> {
        self.config.validate()?;
        container.header.validate()?;
        self.state.reset();

        self.phase_changed(DfuPhase::LinkActivation, DfuPhase::LinkActivation);
        if let Err(e) = self.activate_link() {
            return Err(self.fail(DfuPhase::LinkActivation, e));
        }

        self.phase_changed(DfuPhase::LinkActivation, DfuPhase::Update);
        if let Err(e) = self.update_sequence(container) {
            return Err(self.fail(DfuPhase::Update, e));
        }

        self.phase_changed(DfuPhase::Update, DfuPhase::Settling);
        info!(delay_ms = self.config.settle_delay_ms, "Waiting for device reset");
        thread::sleep(self.config.settle_delay());

        self.phase_changed(DfuPhase::Settling, DfuPhase::Complete);
        self.observer.on_event(&DfuEvent::Complete);
        Ok(())
    }

    fn update_sequence(&mut self, container: &ImageContainer) -> Result<(), SessionError> {
        let mut ctx = self.context();
        handle_start(&mut ctx, container)?;
        handle_init(&mut ctx, container)?;
        handle_transfer(&mut ctx, container.payload())?;
        handle_validate(&mut ctx)?;
        handle_activate(&mut ctx)
    }

    /// Rotate the device key and/or MAC.
    ///
    /// The packet is signed before the link is touched so that a signer
    /// failure leaves the device alone.
    #[instrument(skip_all)]
    pub fn configure(
        &mut self,
        record: &ConfigRecord,
        signer: &dyn ConfigSigner,
    ) -> Result<(), SessionError> {
        let packet = sign_config(signer, record)?;
        self.send_config(&packet)
    }

    /// Send an already encrypted config packet.
    pub fn send_config(&mut self, packet: &[u8]) -> Result<(), SessionError> {
        self.config.validate()?;

        self.phase_changed(DfuPhase::LinkActivation, DfuPhase::LinkActivation);
        if let Err(e) = self.activate_link() {
            return Err(self.fail(DfuPhase::LinkActivation, e));
        }

        self.phase_changed(DfuPhase::LinkActivation, DfuPhase::Configure);
        let mut ctx = self.context();
        if let Err(e) = handle_config(&mut ctx, packet) {
            return Err(self.fail(DfuPhase::Configure, e));
        }

        self.phase_changed(DfuPhase::Configure, DfuPhase::Complete);
        self.observer.on_event(&DfuEvent::Complete);
        Ok(())
    }
}

/// Run an update, restarting from `Idle` on a fresh transport up to
/// `config.retries` more times.
///
/// `open` is called once per attempt; the previous transport is dropped
/// (closing the port) before the next one is opened.
pub fn run_with_retries<T, O, F>(
    mut open: F,
    container: &ImageContainer,
    config: &SessionConfig,
    observer: Arc<O>,
) -> Result<(), SessionError>
where
    T: ByteTransport,
    O: DfuObserver,
    F: FnMut() -> Result<T, TransportError>,
{
    // Bad input never gets better by retrying.
    config.validate()?;
    container.header.validate()?;

    let attempts = config.retries.saturating_add(1);
    let mut attempt = 1;
    loop {
        let result = open().map_err(SessionError::from).and_then(|transport| {
            UpdateSession::with_observer(transport, config.clone(), observer.clone())
                .run(container)
        });
        match result {
            Ok(()) => return Ok(()),
            Err(e) if attempt < attempts => {
                warn!(attempt, attempts, error = %e, "Update failed, restarting session");
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
