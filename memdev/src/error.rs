//! Error taxonomy for device, registry and pool operations.

/// Error type for all device-facing operations.
///
/// Every variant maps to a stable errno-style code so external clients
/// can exit with a conventional status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    /// Malformed request: seek target out of range, unknown control verb,
    /// negative cursor from a transport.
    #[error("invalid argument")]
    InvalidArgument,

    /// The named device does not exist or the index is outside the
    /// registered range.
    #[error("device not found")]
    NotFound,

    /// Privileged control operation from a caller without the admin
    /// capability.
    #[error("permission denied")]
    PermissionDenied,

    /// Allocation refused, or no execution unit left to run on.
    #[error("resource exhausted")]
    ResourceExhausted,

    /// Data could not be delivered to or from the caller.
    #[error("bad address")]
    Fault,
}

impl DeviceError {
    /// Errno-style code (EINVAL, ENOENT, EPERM, ENOMEM, EFAULT).
    #[must_use]
    pub fn code(self) -> i32 {
        match self {
            DeviceError::InvalidArgument => 22,
            DeviceError::NotFound => 2,
            DeviceError::PermissionDenied => 1,
            DeviceError::ResourceExhausted => 12,
            DeviceError::Fault => 14,
        }
    }

    /// Short label for log lines.
    #[must_use]
    pub fn as_label(self) -> &'static str {
        match self {
            DeviceError::InvalidArgument => "invalid_argument",
            DeviceError::NotFound => "not_found",
            DeviceError::PermissionDenied => "permission_denied",
            DeviceError::ResourceExhausted => "resource_exhausted",
            DeviceError::Fault => "fault",
        }
    }
}

impl embedded_io::Error for DeviceError {
    fn kind(&self) -> embedded_io::ErrorKind {
        match self {
            DeviceError::InvalidArgument => embedded_io::ErrorKind::InvalidInput,
            DeviceError::NotFound => embedded_io::ErrorKind::NotFound,
            DeviceError::PermissionDenied => embedded_io::ErrorKind::PermissionDenied,
            DeviceError::ResourceExhausted => embedded_io::ErrorKind::OutOfMemory,
            DeviceError::Fault => embedded_io::ErrorKind::Other,
        }
    }
}
