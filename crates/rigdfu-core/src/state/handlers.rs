//! Per-phase request handlers.
//!
//! Each handler sends one kind of request, checks the device's answer and
//! advances the state machine. Any unexpected answer aborts with
//! [`SessionError::ProtocolMismatch`].

use tracing::{debug, info};

use crate::events::{DfuEvent, DfuObserver, LogLevel};
use crate::image::ImageContainer;
use crate::protocol::constants::CONFIG_PACKET_SIZE;
use crate::protocol::frame::{self, FrameError, Response};
use crate::protocol::{OpCode, OpStatus};
use crate::session::{SessionConfig, SessionError};
use crate::state::machine::{StateMachineContext, TransferProgress, UpdatePhase};
use crate::transport::ByteTransport;

/// Handler context containing all resources.
pub struct HandlerContext<'a, T: ByteTransport + ?Sized, O: DfuObserver + ?Sized> {
    pub transport: &'a mut T,
    pub observer: &'a O,
    pub state: &'a mut StateMachineContext,
    pub config: &'a SessionConfig,
}

impl<'a, T: ByteTransport + ?Sized, O: DfuObserver + ?Sized> HandlerContext<'a, T, O> {
    pub(crate) fn emit(&self, event: DfuEvent) {
        self.observer.on_event(&event);
    }

    pub(crate) fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.emit(DfuEvent::Log {
            level,
            message: message.into(),
        });
    }

    fn advance(&mut self, to: UpdatePhase) -> Result<(), SessionError> {
        let from = self.state.phase;
        self.state.goto_state(to)?;
        self.emit(DfuEvent::StateChanged { from, to });
        Ok(())
    }

    /// Send one request and require `expected` in the answer.
    pub(crate) fn exchange(
        &mut self,
        op: OpCode,
        payload: &[u8],
        expected: OpStatus,
    ) -> Result<(), SessionError> {
        frame::write_frame(&mut *self.transport, op, payload)?;
        self.emit(DfuEvent::RequestSent {
            op,
            length: payload.len(),
        });

        let reply = match frame::read_frame(&mut *self.transport, self.config.response_timeout()) {
            Ok(reply) => reply,
            Err(FrameError::ShortRead { .. }) => return Err(SessionError::NoResponse { op }),
            Err(e) => return Err(e.into()),
        };
        // Any other frame in place of a Response counts as a wrong answer.
        if reply.opcode != OpCode::Response {
            return Err(SessionError::ProtocolMismatch {
                sent: op,
                expected,
                echoed: reply.opcode.as_u8(),
                status: 0,
            });
        }
        let response = Response::from_frame(&reply)?;

        match (response.opcode(), response.op_status()) {
            (Ok(echoed), Ok(status)) if echoed == op && status == expected => {
                self.emit(DfuEvent::ResponseReceived { op, status });
                Ok(())
            }
            _ => Err(SessionError::ProtocolMismatch {
                sent: op,
                expected,
                echoed: response.echoed,
                status: response.status,
            }),
        }
    }
}

/// Start: announce the three segment lengths.
pub fn handle_start<T, O>(
    ctx: &mut HandlerContext<'_, T, O>,
    container: &ImageContainer,
) -> Result<(), SessionError>
where
    T: ByteTransport + ?Sized,
    O: DfuObserver + ?Sized,
{
    info!(
        sd = container.header.softdevice_len,
        bl = container.header.bootloader_len,
        app = container.header.application_len,
        "Starting DFU"
    );
    ctx.exchange(OpCode::Start, &container.start_packet(), OpStatus::Success)?;
    ctx.advance(UpdatePhase::Started)
}

/// Init: IV and tag.
pub fn handle_init<T, O>(
    ctx: &mut HandlerContext<'_, T, O>,
    container: &ImageContainer,
) -> Result<(), SessionError>
where
    T: ByteTransport + ?Sized,
    O: DfuObserver + ?Sized,
{
    ctx.exchange(OpCode::Init, &container.init_packet(), OpStatus::Success)?;
    ctx.advance(UpdatePhase::Initialized)
}

/// Stream the image payload. Every chunk but the last must be answered
/// with `SuccessNeedMoreData`.
pub fn handle_transfer<T, O>(
    ctx: &mut HandlerContext<'_, T, O>,
    payload: &[u8],
) -> Result<(), SessionError>
where
    T: ByteTransport + ?Sized,
    O: DfuObserver + ?Sized,
{
    ctx.advance(UpdatePhase::Transferring)?;

    let mut progress = TransferProgress::new(
        payload.len(),
        ctx.config.chunk_size,
        ctx.config.progress_interval,
    );
    while let Some(chunk) = progress.next_chunk() {
        let expected = if progress.is_last_chunk(&chunk) {
            OpStatus::Success
        } else {
            OpStatus::SuccessNeedMoreData
        };
        debug!(offset = chunk.start, len = chunk.len(), "Sending chunk");
        ctx.exchange(OpCode::ImageTransfer, &payload[chunk.clone()], expected)?;

        if progress.advance(chunk.len()) {
            ctx.emit(DfuEvent::Progress {
                current: progress.offset as u64,
                total: progress.total as u64,
            });
        }
    }
    Ok(())
}

pub fn handle_validate<T, O>(ctx: &mut HandlerContext<'_, T, O>) -> Result<(), SessionError>
where
    T: ByteTransport + ?Sized,
    O: DfuObserver + ?Sized,
{
    ctx.exchange(OpCode::Validate, &[], OpStatus::Success)?;
    ctx.advance(UpdatePhase::Validated)
}

/// After this the device resets and stops answering.
pub fn handle_activate<T, O>(ctx: &mut HandlerContext<'_, T, O>) -> Result<(), SessionError>
where
    T: ByteTransport + ?Sized,
    O: DfuObserver + ?Sized,
{
    ctx.exchange(OpCode::ActivateAndReset, &[], OpStatus::Success)?;
    ctx.advance(UpdatePhase::Activated)
}

/// Send an already signed config packet. Independent of the update phases.
pub fn handle_config<T, O>(
    ctx: &mut HandlerContext<'_, T, O>,
    packet: &[u8],
) -> Result<(), SessionError>
where
    T: ByteTransport + ?Sized,
    O: DfuObserver + ?Sized,
{
    if packet.len() != CONFIG_PACKET_SIZE {
        return Err(SessionError::ConfigPacketSize { len: packet.len() });
    }
    ctx.log(LogLevel::Info, "Configuring device");
    ctx.exchange(OpCode::Config, packet, OpStatus::Success)
}
