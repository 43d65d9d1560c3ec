//! Native backends for the window-server, focus and event-tap seams.

use std::sync::Arc;

use crate::activation::FocusApi;
use crate::catalog::WindowServer;
use crate::errors::CoreResult;
use crate::input_proc::EventTapBackend;

#[cfg(target_os = "macos")]
mod mac;

#[cfg(windows)]
mod win;



/// The OS-facing collaborators for the running platform, ready to hand to the switcher
pub struct NativeBackends {
    pub server : Arc <dyn WindowServer>,
    pub focus  : Arc <dyn FocusApi>,
    pub tap    : Box <dyn EventTapBackend>,
}


#[cfg(target_os = "macos")]
pub fn native () -> CoreResult<NativeBackends> {
    Ok ( NativeBackends {
        server : Arc::new (mac::MacWindowServer),
        focus  : Arc::new (mac::MacFocus),
        tap    : Box::new (mac::MacEventTap::default()),
    } )
}

#[cfg(windows)]
pub fn native () -> CoreResult<NativeBackends> {
    Ok ( NativeBackends {
        server : Arc::new (win::WinWindowServer),
        focus  : Arc::new (win::WinFocus),
        tap    : Box::new (win::WinKbdHook::default()),
    } )
}

#[cfg(not(any(target_os = "macos", windows)))]
pub fn native () -> CoreResult<NativeBackends> {
    Err (crate::errors::CoreError::Platform { reason: format! ("no native backend for {}", std::env::consts::OS) })
}



/// Whether we're allowed to intercept global keyboard input. With `prompt` set, asks the OS to show
/// its permission prompt when we aren't.
#[cfg(target_os = "macos")]
pub fn check_input_permission (prompt: bool) -> bool { mac::check_accessibility (prompt) }

#[cfg(windows)]
pub fn check_input_permission (_prompt: bool) -> bool { true }
// ^^ low-level hooks need no grant on windows

#[cfg(not(any(target_os = "macos", windows)))]
pub fn check_input_permission (_prompt: bool) -> bool { false }
