use super::config::{Direction, RadioConfigError};
use crate::errno;
use std::fmt;

/// Radio errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioError {
    /// The modem never came up. Fatal to the radio subsystem.
    DeviceNotReady,
    /// Parameters failed local validation.
    InvalidConfig(RadioConfigError),
    /// The modem rejected the parameters or was busy.
    ConfigRejected(i32),
    /// No configuration has been applied yet.
    NotConfigured,
    /// The operation is illegal in the configured direction.
    WrongDirection { required: Direction },
    /// Hardware-level send failure.
    TransmitFailed(i32),
    /// Arming or cancelling receive failed.
    ReceiveFailed(i32),
    /// Payload larger than the node accepts.
    PayloadTooLarge { size: usize, max: usize },
    /// Empty payload.
    EmptyPayload,
}

/// Which device call produced an errno.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeviceOp {
    Configure,
    Send,
    Receive,
}

impl RadioError {
    /// Map a negative errno from the device boundary.
    pub(crate) fn from_code(op: DeviceOp, code: i32) -> Self {
        if code == -errno::ENODEV {
            return Self::DeviceNotReady;
        }
        match op {
            DeviceOp::Configure => Self::ConfigRejected(code),
            DeviceOp::Send => Self::TransmitFailed(code),
            DeviceOp::Receive => Self::ReceiveFailed(code),
        }
    }

    /// Whether the radio subsystem cannot be used at all.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::DeviceNotReady)
    }
}

impl fmt::Display for RadioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DeviceNotReady => write!(f, "radio device not ready"),
            Self::InvalidConfig(e) => write!(f, "invalid radio config: {}", e),
            Self::ConfigRejected(code) => write!(f, "radio config rejected: {}", code),
            Self::NotConfigured => write!(f, "radio not configured"),
            Self::WrongDirection { required } => {
                write!(f, "radio must be configured for {}", required)
            }
            Self::TransmitFailed(code) => write!(f, "transmit failed: {}", code),
            Self::ReceiveFailed(code) => write!(f, "receive control failed: {}", code),
            Self::PayloadTooLarge { size, max } => {
                write!(f, "payload too large: {} bytes (max {})", size, max)
            }
            Self::EmptyPayload => write!(f, "empty payload"),
        }
    }
}

impl std::error::Error for RadioError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::InvalidConfig(e) => Some(e),
            _ => None,
        }
    }
}

impl From<RadioConfigError> for RadioError {
    fn from(e: RadioConfigError) -> Self {
        Self::InvalidConfig(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enodev_is_not_ready_for_every_op() {
        for op in [DeviceOp::Configure, DeviceOp::Send, DeviceOp::Receive] {
            assert_eq!(
                RadioError::from_code(op, -errno::ENODEV),
                RadioError::DeviceNotReady
            );
        }
        assert!(RadioError::DeviceNotReady.is_fatal());
    }

    #[test]
    fn test_codes_map_by_operation() {
        assert_eq!(
            RadioError::from_code(DeviceOp::Configure, -errno::EBUSY),
            RadioError::ConfigRejected(-16)
        );
        assert_eq!(
            RadioError::from_code(DeviceOp::Send, -errno::EIO),
            RadioError::TransmitFailed(-5)
        );
        assert_eq!(
            RadioError::from_code(DeviceOp::Receive, -errno::EINVAL),
            RadioError::ReceiveFailed(-22)
        );
        assert!(!RadioError::TransmitFailed(-5).is_fatal());
    }

    #[test]
    fn test_display() {
        let e = RadioError::PayloadTooLarge { size: 200, max: 128 };
        assert_eq!(e.to_string(), "payload too large: 200 bytes (max 128)");
        let e = RadioError::WrongDirection {
            required: Direction::Transmit,
        };
        assert_eq!(e.to_string(), "radio must be configured for tx");
    }
}
