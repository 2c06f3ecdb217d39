use thiserror::Error;

pub type Result<T> = std::result::Result<T, UsbdError>;

/// Errors reported by the host USB transport.
///
/// These mirror the host library's own error space (libusb's `LIBUSB_ERROR_*`). They never reach
/// the guest directly: the device manager translates them into [`UsbdError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HostError {
    #[error("input/output error")]
    Io,
    #[error("invalid parameter")]
    InvalidParam,
    #[error("access denied (insufficient permissions)")]
    Access,
    #[error("no such device (it may have been disconnected)")]
    NoDevice,
    #[error("entity not found")]
    NotFound,
    #[error("resource busy")]
    Busy,
    #[error("operation timed out")]
    Timeout,
    #[error("overflow")]
    Overflow,
    #[error("pipe error")]
    Pipe,
    #[error("system call interrupted")]
    Interrupted,
    #[error("insufficient memory")]
    NoMem,
    #[error("operation not supported or unimplemented on this platform")]
    NotSupported,
    #[error("other error")]
    Other,
}

/// Guest-facing error taxonomy.
///
/// Small buffers are not errors: descriptor and control reads truncate and report the byte count
/// that fit. `Overflow` is reserved for host-reported overflows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum UsbdError {
    #[error("invalid argument")]
    InvalidArgument,
    #[error("input/output error")]
    Io,
    #[error("access denied")]
    Access,
    #[error("no such device")]
    NoDevice,
    #[error("not found")]
    NotFound,
    #[error("resource busy")]
    Busy,
    #[error("timed out")]
    Timeout,
    #[error("overflow")]
    Overflow,
    #[error("pipe stalled")]
    Pipe,
    #[error("interrupted")]
    Interrupted,
    #[error("out of memory")]
    OutOfMemory,
    #[error("not supported")]
    NotSupported,
    #[error("fatal host error")]
    Fatal,
}

impl UsbdError {
    /// Whether retrying the same request later may succeed.
    pub fn is_retryable(self) -> bool {
        matches!(self, UsbdError::Busy | UsbdError::Timeout | UsbdError::Interrupted)
    }
}

impl From<HostError> for UsbdError {
    fn from(err: HostError) -> Self {
        match err {
            HostError::Io => UsbdError::Io,
            HostError::InvalidParam => UsbdError::InvalidArgument,
            HostError::Access => UsbdError::Access,
            HostError::NoDevice => UsbdError::NoDevice,
            HostError::NotFound => UsbdError::NotFound,
            HostError::Busy => UsbdError::Busy,
            HostError::Timeout => UsbdError::Timeout,
            HostError::Overflow => UsbdError::Overflow,
            HostError::Pipe => UsbdError::Pipe,
            HostError::Interrupted => UsbdError::Interrupted,
            HostError::NoMem => UsbdError::OutOfMemory,
            HostError::NotSupported => UsbdError::NotSupported,
            HostError::Other => UsbdError::Fatal,
        }
    }
}

/// Errors produced while loading a [`crate::UsbdConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid usbd config json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("transfer_pool_size must be in 1..={max} (got {got})")]
    TransferPoolSize { got: usize, max: usize },

    #[error("emulated device {index}: {reason}")]
    EmulatedDevice { index: usize, reason: &'static str },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_errors_map_into_closed_taxonomy() {
        assert_eq!(UsbdError::from(HostError::InvalidParam), UsbdError::InvalidArgument);
        assert_eq!(UsbdError::from(HostError::NoDevice), UsbdError::NoDevice);
        assert_eq!(UsbdError::from(HostError::Busy), UsbdError::Busy);
        assert_eq!(UsbdError::from(HostError::NoMem), UsbdError::OutOfMemory);
        assert_eq!(UsbdError::from(HostError::Pipe), UsbdError::Pipe);
        assert_eq!(UsbdError::from(HostError::Other), UsbdError::Fatal);
    }

    #[test]
    fn only_contention_errors_are_retryable() {
        assert!(UsbdError::Busy.is_retryable());
        assert!(UsbdError::Timeout.is_retryable());
        assert!(!UsbdError::NoDevice.is_retryable());
        assert!(!UsbdError::Fatal.is_retryable());
    }
}
