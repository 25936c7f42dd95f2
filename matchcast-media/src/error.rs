//! Camera acquisition errors
//!
//! Acquisition failures need action from the person operating the camera
//! (granting access, closing another app, plugging a device in), so every
//! variant carries a message meant to be shown to them as is.

use matchcast_core::MatchcastError;
use thiserror::Error;

/// Error raised while acquiring local camera or microphone input
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    /// The user or the platform refused access
    #[error("Permission denied for {device}")]
    PermissionDenied {
        /// Device that was refused
        device: String,
    },

    /// Another application holds the device
    #[error("Device busy: {device}")]
    DeviceBusy {
        /// Device that is in use
        device: String,
    },

    /// No device matches the request
    #[error("Device not found: {device}")]
    DeviceNotFound {
        /// Requested device
        device: String,
    },

    /// The device cannot satisfy the requested constraints
    #[error("Unsatisfiable constraint: {constraint}")]
    Constraints {
        /// Constraint that failed
        constraint: String,
    },

    /// Capture is not available on this platform
    #[error("Capture unsupported: {reason}")]
    Unsupported {
        /// Why capture is unavailable
        reason: String,
    },
}

/// Result type alias for capture operations
pub type CaptureResult<T> = Result<T, CaptureError>;

impl CaptureError {
    /// Message to show to the broadcaster
    pub fn user_message(&self) -> &'static str {
        match self {
            CaptureError::PermissionDenied { .. } => {
                "Camera or microphone access was denied. Allow access in your browser or system settings and try again."
            }
            CaptureError::DeviceBusy { .. } => {
                "The camera is already in use by another application. Close it and try again."
            }
            CaptureError::DeviceNotFound { .. } => {
                "No camera or microphone was found. Connect a device and try again."
            }
            CaptureError::Constraints { .. } => {
                "The selected camera does not support the requested settings."
            }
            CaptureError::Unsupported { .. } => "Live streaming is not supported on this device.",
        }
    }

    /// Get error code for programmatic handling
    pub fn error_code(&self) -> &'static str {
        match self {
            CaptureError::PermissionDenied { .. } => "CAPTURE_PERMISSION_DENIED",
            CaptureError::DeviceBusy { .. } => "CAPTURE_DEVICE_BUSY",
            CaptureError::DeviceNotFound { .. } => "CAPTURE_DEVICE_NOT_FOUND",
            CaptureError::Constraints { .. } => "CAPTURE_CONSTRAINTS",
            CaptureError::Unsupported { .. } => "CAPTURE_UNSUPPORTED",
        }
    }

    /// Get error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            CaptureError::PermissionDenied { .. } => ErrorCategory::Permission,
            CaptureError::DeviceBusy { .. } | CaptureError::DeviceNotFound { .. } => {
                ErrorCategory::Device
            }
            CaptureError::Constraints { .. } => ErrorCategory::Configuration,
            CaptureError::Unsupported { .. } => ErrorCategory::Platform,
        }
    }

    /// Capture errors always need user action before a retry can succeed
    pub fn is_recoverable(&self) -> bool {
        false
    }
}

/// Error categories for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Access was refused
    Permission,
    /// Device missing or unavailable
    Device,
    /// Requested settings are invalid
    Configuration,
    /// Platform lacks capture support
    Platform,
}

impl From<CaptureError> for MatchcastError {
    fn from(error: CaptureError) -> Self {
        MatchcastError::Media {
            reason: format!("{} [{}]", error.user_message(), error.error_code()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        let denied = CaptureError::PermissionDenied {
            device: "camera".to_string(),
        };
        assert_eq!(denied.category(), ErrorCategory::Permission);
        assert!(!denied.is_recoverable());

        let busy = CaptureError::DeviceBusy {
            device: "FaceTime HD".to_string(),
        };
        assert_eq!(busy.category(), ErrorCategory::Device);
        assert!(busy.user_message().contains("in use"));
    }

    #[test]
    fn test_error_display() {
        let error = CaptureError::Constraints {
            constraint: "1920x1080".to_string(),
        };
        assert_eq!(error.to_string(), "Unsatisfiable constraint: 1920x1080");
    }

    #[test]
    fn test_into_matchcast_error() {
        let error: MatchcastError = CaptureError::DeviceNotFound {
            device: "usb-cam".to_string(),
        }
        .into();
        assert_eq!(error.error_code(), "MEDIA_ERROR");
        assert!(error.to_string().contains("CAPTURE_DEVICE_NOT_FOUND"));
    }
}
