
use crate::catalog::WindowId;


/// Conditions the core can run into. None of these are allowed to take the process down ..
/// only `PermissionDenied` ever needs to reach the user, and that's the host's job to surface.
# [ derive (Debug, Clone, PartialEq, Eq, thiserror::Error) ]
pub enum CoreError {

    #[error("input event tap could not be installed (input-monitoring / accessibility permission not granted)")]
    PermissionDenied,

    #[error("window enumeration degraded: {reason}")]
    EnumerationDegraded { reason: String },

    #[error("window {id} no longer exists")]
    StaleWindow { id: WindowId },

    #[error("refresh #{seq} superseded by already applied refresh #{applied}")]
    RefreshSuperseded { seq: u64, applied: u64 },

    #[error("platform unsupported: {reason}")]
    Platform { reason: String },

    #[error("config error: {reason}")]
    Config { reason: String },
}


/// Failures the activation bridge can report back for a confirm
# [ derive (Debug, Clone, PartialEq, Eq, thiserror::Error) ]
pub enum ActivationError {

    #[error("window {id} vanished between enumeration and activation")]
    StaleWindow { id: WindowId },

    #[error("OS refused to focus window {id}: {reason}")]
    FocusRefused { id: WindowId, reason: String },
}

impl From <ActivationError> for CoreError {
    fn from (e: ActivationError) -> Self {
        match e {
            ActivationError::StaleWindow { id }           => CoreError::StaleWindow { id },
            ActivationError::FocusRefused { id, reason }  => CoreError::Platform { reason: format! ("focus of {id} refused: {reason}") },
        }
    }
}

pub type CoreResult<T> = Result <T, CoreError>;



#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_activation_maps_to_stale_core_error() {
        let e: CoreError = ActivationError::StaleWindow { id: WindowId(42) }.into();
        assert_eq!(e, CoreError::StaleWindow { id: WindowId(42) });
        assert_eq!(e.to_string(), "window 42 no longer exists");
    }

    #[test]
    fn superseded_message_names_both_sequence_numbers() {
        let e = CoreError::RefreshSuperseded { seq: 3, applied: 4 };
        assert_eq!(e.to_string(), "refresh #3 superseded by already applied refresh #4");
    }
}
