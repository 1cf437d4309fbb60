//! Request opcodes and response status codes.
//!
//! Both are closed enums; bytes the device sends outside the known set are
//! rejected at decode time instead of being carried along as integers.

use std::fmt;

/// Operation carried by a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    Start = 1,
    Init = 2,
    ImageTransfer = 3,
    Validate = 4,
    ActivateAndReset = 5,
    Reset = 6,
    Config = 9,
    /// Device to host only.
    Response = 16,
}

impl OpCode {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for OpCode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Self::Start,
            2 => Self::Init,
            3 => Self::ImageTransfer,
            4 => Self::Validate,
            5 => Self::ActivateAndReset,
            6 => Self::Reset,
            9 => Self::Config,
            16 => Self::Response,
            other => return Err(other),
        })
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.as_u8())
    }
}

/// Outcome reported by the device for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpStatus {
    Success = 1,
    InvalidState = 2,
    NotSupported = 3,
    DataSizeError = 4,
    CrcError = 5,
    OperationFailed = 6,
    /// Chunk accepted, more image data expected.
    SuccessNeedMoreData = 7,
}

impl OpStatus {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn is_success(self) -> bool {
        matches!(self, Self::Success | Self::SuccessNeedMoreData)
    }
}

impl TryFrom<u8> for OpStatus {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Self::Success,
            2 => Self::InvalidState,
            3 => Self::NotSupported,
            4 => Self::DataSizeError,
            5 => Self::CrcError,
            6 => Self::OperationFailed,
            7 => Self::SuccessNeedMoreData,
            other => return Err(other),
        })
    }
}

impl fmt::Display for OpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.as_u8())
    }
}
