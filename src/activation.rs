
use std::sync::Arc;

use tracing::{debug, info};

use crate::catalog::{WindowId, WindowRecord};
use crate::errors::ActivationError;



# [ derive (Debug, Copy, Clone, Eq, PartialEq) ]
pub enum RaiseOutcome {
    Raised,
    NotFound,
}


/// The OS focus primitives the bridge drives. Nothing else in the crate touches focus.
pub trait FocusApi : Send + Sync {

    /// Locate the live window by id and bring it to the front of its app
    fn raise_window (&self, record: &WindowRecord) -> Result <RaiseOutcome, String>;

    /// Bring the owning process to the foreground
    fn activate_app (&self, pid: u32) -> Result <(), String>;
}



# [ derive (Clone) ]
pub struct ActivationBridge {
    focus : Arc <dyn FocusApi>,
}

impl ActivationBridge {

    pub fn new (focus: Arc<dyn FocusApi>) -> ActivationBridge {
        ActivationBridge { focus }
    }

    /// Raises the record's window then its app. A vanished window comes back as StaleWindow, which callers treat as a plain hide.
    pub fn activate (&self, record: &WindowRecord) -> Result <(), ActivationError> {
        let id : WindowId = record.id;
        match self.focus.raise_window (record) {
            Ok (RaiseOutcome::Raised)   => { }
            Ok (RaiseOutcome::NotFound) => {
                debug! (%id, "window gone before activation");
                return Err (ActivationError::StaleWindow { id })
            }
            Err (reason) => return Err (ActivationError::FocusRefused { id, reason }),
        }
        self.focus.activate_app (record.pid) .map_err (|reason| ActivationError::FocusRefused { id, reason })?;
        info! (%id, app = %record.app_name, "activated window");
        Ok(())
    }
}
