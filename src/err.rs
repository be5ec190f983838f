// ===== Types and Structures =====

use core::fmt;

use crate::emmc::DeviceStatus;

/// Faults reported by the card or the controller while a command was in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    /// Command-phase error bits from the interrupt status register.
    Command(u32),
    /// Error bits from an R1 card status word, with the failing operation.
    CardStatus(u32, &'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdError {
    /// A bounded poll ran out of time.
    Timeout,
    Protocol(ProtocolError),
    CardNotPresent,
    BadParameter,
    /// Error recovery could not bring the data lines back to idle.
    NotInitialized,
    ReadFailed(DeviceStatus),
    Unsupported,
}

impl SdError {
    pub fn is_protocol(&self) -> bool {
        matches!(self, SdError::Protocol(_))
    }
}

impl From<ProtocolError> for SdError {
    fn from(err: ProtocolError) -> Self {
        SdError::Protocol(err)
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::Command(bits) => write!(f, "command error: int status 0x{:X}", bits),
            ProtocolError::CardStatus(status, desc) => {
                write!(f, "card error: 0x{:X} ({})", status, desc)
            }
        }
    }
}

impl fmt::Display for SdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SdError::Timeout => write!(f, "Timeout"),
            SdError::Protocol(err) => write!(f, "Protocol error: {}", err),
            SdError::CardNotPresent => write!(f, "No card detected"),
            SdError::BadParameter => write!(f, "Bad parameter"),
            SdError::NotInitialized => write!(f, "Controller recovery failed"),
            SdError::ReadFailed(status) => write!(f, "Read failed: {:?}", status),
            SdError::Unsupported => write!(f, "Unsupported card mode"),
        }
    }
}
