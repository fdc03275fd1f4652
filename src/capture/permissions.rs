use crate::errors::LinkError;
use serde::{Deserialize, Serialize};

/// Camera permission as reported by the host platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionStatus {
    Granted,
    Denied,
    /// User hasn't been asked yet, or no device to ask about
    NotDetermined,
    /// Blocked by system policy
    Restricted,
}

impl std::fmt::Display for PermissionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PermissionStatus::Granted => write!(f, "granted"),
            PermissionStatus::Denied => write!(f, "denied"),
            PermissionStatus::NotDetermined => write!(f, "not_determined"),
            PermissionStatus::Restricted => write!(f, "restricted"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionInfo {
    pub status: PermissionStatus,
    pub message: String,
    pub can_request: bool,
}

impl PermissionInfo {
    /// Map a negative answer onto the capture error taxonomy. `NotDetermined`
    /// passes, the device open itself will prompt or fail.
    pub fn ensure_allowed(&self) -> Result<(), LinkError> {
        match self.status {
            PermissionStatus::Granted | PermissionStatus::NotDetermined => Ok(()),
            PermissionStatus::Denied | PermissionStatus::Restricted => {
                Err(LinkError::PermissionDenied(self.message.clone()))
            }
        }
    }
}

pub fn check_permission() -> PermissionStatus {
    check_permission_detailed().status
}

pub fn check_permission_detailed() -> PermissionInfo {
    #[cfg(target_os = "linux")]
    {
        check_permission_linux()
    }

    #[cfg(not(target_os = "linux"))]
    {
        PermissionInfo {
            status: PermissionStatus::NotDetermined,
            message: "Camera permission is checked when the device is opened".to_string(),
            can_request: true,
        }
    }
}

#[cfg(target_os = "linux")]
fn check_permission_linux() -> PermissionInfo {
    use std::fs::OpenOptions;
    use std::path::Path;

    let video_devices: Vec<_> = (0..10)
        .map(|i| format!("/dev/video{}", i))
        .filter(|path| Path::new(path).exists())
        .collect();

    let Some(first_device) = video_devices.first() else {
        return PermissionInfo {
            status: PermissionStatus::NotDetermined,
            message: "No video devices found at /dev/video*".to_string(),
            can_request: false,
        };
    };

    match OpenOptions::new().read(true).open(first_device) {
        Ok(_) => PermissionInfo {
            status: PermissionStatus::Granted,
            message: format!("Camera access granted ({} readable)", first_device),
            can_request: false,
        },
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => PermissionInfo {
            status: PermissionStatus::Denied,
            message: format!(
                "Camera device {} exists but is not readable - run: sudo usermod -a -G video $USER",
                first_device
            ),
            can_request: true,
        },
        // Busy or transient errors are not a permission answer.
        Err(e) => PermissionInfo {
            status: PermissionStatus::NotDetermined,
            message: format!("Cannot probe {}: {}", first_device, e),
            can_request: false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_denied_maps_to_permission_error() {
        let info = PermissionInfo {
            status: PermissionStatus::Denied,
            message: "blocked".to_string(),
            can_request: true,
        };
        assert_eq!(
            info.ensure_allowed(),
            Err(LinkError::PermissionDenied("blocked".to_string()))
        );
    }

    #[test]
    fn test_undetermined_is_allowed() {
        let info = PermissionInfo {
            status: PermissionStatus::NotDetermined,
            message: String::new(),
            can_request: true,
        };
        assert!(info.ensure_allowed().is_ok());
    }

    #[test]
    fn test_check_permission_does_not_panic() {
        let info = check_permission_detailed();
        assert!(!info.message.is_empty());
        assert_eq!(check_permission(), info.status);
    }
}
