#![ allow (non_upper_case_globals, clippy::missing_safety_doc) ]

use std::ffi::c_void;
use std::path::PathBuf;
use std::ptr::{null, null_mut, NonNull};
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::thread::{sleep, spawn, JoinHandle};
use std::time::Duration;

use objc2_app_kit::{NSApplicationActivationOptions, NSRunningApplication, NSWorkspace};
use objc2_application_services::{AXError, AXIsProcessTrusted, AXUIElement};
use objc2_core_foundation::{
    kCFRunLoopCommonModes, CFArray, CFDictionary, CFMachPort, CFNumber, CFRetained, CFRunLoop, CFString, CFType,
};
use objc2_core_graphics::{
    kCGNullWindowID, CGEvent, CGEventField, CGEventFlags, CGEventTapLocation, CGEventTapOptions, CGEventTapPlacement,
    CGEventTapProxy, CGEventType, CGRequestPostEventAccess, CGWindowListCopyWindowInfo, CGWindowListOption,
};
use tracing::{debug, info, trace, warn};

use crate::activation::{FocusApi, RaiseOutcome};
use crate::catalog::{IconHandle, RawWindow, WindowId, WindowRecord, WindowServer};
use crate::errors::{CoreError, CoreResult};
use crate::input_proc::{EventTapBackend, Key, Modifiers, TapDecision, TapEvent, TapHandler};



#[link(name = "ApplicationServices", kind = "framework")]
unsafe extern "C" {
    // private, but the only way from an AX element to its CGWindowID
    fn _AXUIElementGetWindow (element: &AXUIElement, id: *mut u32) -> AXError;
}



#[allow(unused_unsafe)]
pub fn check_accessibility (prompt: bool) -> bool {
    if unsafe { AXIsProcessTrusted() } { return true }
    if prompt {
        info! ("requesting accessibility permission");
        let _ = unsafe { CGRequestPostEventAccess() };
    }
    false
}




/*****  CF dictionary reading for the window list  ******/

/// Borrowed (get-rule) value out of a window-info dictionary
unsafe fn dict_value<'a> (dict: &'a CFDictionary, key: &CFString) -> Option<&'a CFType> {
    let v = unsafe { dict.value (key as *const CFString as *const c_void) } as *const CFType;
    unsafe { v.as_ref() }
}

unsafe fn dict_i64 (dict: &CFDictionary, key: &CFString) -> Option<i64> {
    unsafe { dict_value (dict, key) }? .downcast_ref::<CFNumber>()? .as_i64()
}

unsafe fn dict_string (dict: &CFDictionary, key: &CFString) -> Option<String> {
    unsafe { dict_value (dict, key) }? .downcast_ref::<CFString>() .map (|s| s.to_string())
}




pub struct MacWindowServer;

impl WindowServer for MacWindowServer {

    fn list_on_screen_windows (&self) -> CoreResult <Vec<RawWindow>> {
        objc2::rc::autoreleasepool (|_pool| {
            let option = CGWindowListOption::OptionOnScreenOnly | CGWindowListOption::ExcludeDesktopElements;
            let Some(list) = (unsafe { CGWindowListCopyWindowInfo (option, kCGNullWindowID) }) else {
                return Err (CoreError::EnumerationDegraded { reason: "window server returned no window list".into() })
            };
            let (k_id, k_pid, k_owner, k_name, k_layer) = (
                CFString::from_str ("kCGWindowNumber"),  CFString::from_str ("kCGWindowOwnerPID"),
                CFString::from_str ("kCGWindowOwnerName"), CFString::from_str ("kCGWindowName"),
                CFString::from_str ("kCGWindowLayer"),
            );
            let count = list.count();
            let mut windows = Vec::with_capacity (count.max(0) as usize);
            for idx in 0..count {
                let Some(dict) = (unsafe { (list.value_at_index (idx) as *const CFDictionary).as_ref() }) else { continue };
                let (id, pid, layer) = unsafe { (dict_i64 (dict, &k_id), dict_i64 (dict, &k_pid), dict_i64 (dict, &k_layer)) };
                let (Some(id), Some(pid), Some(layer)) = (id, pid, layer) else { continue };
                windows.push ( RawWindow {
                    id       : WindowId (id as u64),
                    pid      : pid as u32,
                    app_name : unsafe { dict_string (dict, &k_owner) } .unwrap_or_default(),
                    title    : unsafe { dict_string (dict, &k_name) } .unwrap_or_default(),
                    // ^^ titles come back empty without screen-recording permission, those windows then get filtered out
                    layer,
                } );
            }
            Ok (windows)
        } )
    }

    fn foreground_app_pid (&self) -> Option<u32> {
        let app = unsafe { NSWorkspace::sharedWorkspace().frontmostApplication() }?;
        let pid = unsafe { app.processIdentifier() };
        (pid > 0) .then_some (pid as u32)
    }

    fn app_icon (&self, pid: u32) -> Option<IconHandle> {
        let app  = unsafe { NSRunningApplication::runningApplicationWithProcessIdentifier (pid as i32) }?;
        let url  = unsafe { app.bundleURL() }?;
        let path = unsafe { url.path() }?;
        Some ( IconHandle { source: PathBuf::from (path.to_string()) } )
    }
}




pub struct MacFocus;

impl FocusApi for MacFocus {

    fn raise_window (&self, record: &WindowRecord) -> Result <RaiseOutcome, String> {
        let target = record.id.0 as u32;
        let app = unsafe { AXUIElement::new_application (record.pid as i32) };

        let mut value : *const CFType = null();
        let err = unsafe { app.copy_attribute_value (&CFString::from_str ("AXWindows"), NonNull::from (&mut value)) };
        if err == AXError::APIDisabled { return Err ("accessibility access not granted".into()) }
        if err != AXError::Success { return Ok (RaiseOutcome::NotFound) }
        let Some(value) = NonNull::new (value as *mut CFType) else { return Ok (RaiseOutcome::NotFound) };
        // copied value, so we own it .. dropping the CFRetained releases it
        let Ok(windows) = unsafe { CFRetained::from_raw (value) } .downcast::<CFArray>() else {
            return Ok (RaiseOutcome::NotFound)
        };

        let k_raise = CFString::from_str ("AXRaise");
        for i in 0 .. windows.count() {
            let Some(w) = (unsafe { (windows.value_at_index (i) as *const AXUIElement).as_ref() }) else { continue };
            let mut wid : u32 = 0;
            if unsafe { _AXUIElementGetWindow (w, &mut wid) } != AXError::Success || wid != target { continue }
            let err = unsafe { w.perform_action (&k_raise) };
            return if err == AXError::Success { Ok (RaiseOutcome::Raised) } else { Err (format! ("AXRaise failed with {}", err.0)) }
        }
        Ok (RaiseOutcome::NotFound)
    }

    fn activate_app (&self, pid: u32) -> Result <(), String> {
        let app = unsafe { NSRunningApplication::runningApplicationWithProcessIdentifier (pid as i32) }
            .ok_or_else (|| format! ("no running app with pid {pid}"))?;
        #[allow(deprecated)]
        let ok = unsafe { app.activateWithOptions (NSApplicationActivationOptions::ActivateIgnoringOtherApps) };
        if ok { Ok(()) } else { Err (format! ("app {pid} refused activation")) }
    }
}




/*****  session event tap  ******/

/// What the tap callback gets as its user-info pointer
struct TapCtx {
    handler : Arc <TapHandler>,
    port    : AtomicPtr <CFMachPort>,
}

/// The tap's mach port and the run loop serving it, handed back from the tap thread
struct TapLoop {
    run_loop : CFRetained <CFRunLoop>,
    port     : CFRetained <CFMachPort>,
}
unsafe impl Send for TapLoop { }
// ^^ only used to enable/disable the tap and to stop the loop, both allowed from any thread

struct TapThread {
    ctx    : *const TapCtx,
    tap    : TapLoop,
    thread : JoinHandle<()>,
}
unsafe impl Send for TapThread { }

# [ derive (Default) ]
/// Session-level CGEvent tap running on its own thread and run loop
pub struct MacEventTap {
    active : Option <TapThread>,
}


fn mods_from_flags (flags: CGEventFlags) -> Modifiers {
    let mut mods = Modifiers::empty();
    let has = |m: CGEventFlags| flags.0 & m.0 != 0;
    if has (CGEventFlags::MaskShift)     { mods |= Modifiers::SHIFT }
    if has (CGEventFlags::MaskControl)   { mods |= Modifiers::CONTROL }
    if has (CGEventFlags::MaskAlternate) { mods |= Modifiers::ALT }
    if has (CGEventFlags::MaskCommand)   { mods |= Modifiers::COMMAND }
    mods
}

fn key_from_keycode (code: u16) -> Key {
    match code {
        48      => Key::Tab,
        36 | 76 => Key::Return,
        53      => Key::Escape,
        123     => Key::Left,
        124     => Key::Right,
        125     => Key::Down,
        126     => Key::Up,
        c       => Key::Other (c as u32),
    }
}

unsafe extern "C-unwind" fn tap_callback (
    _proxy: CGEventTapProxy, etype: CGEventType, event: NonNull<CGEvent>, user_info: *mut c_void,
) -> *mut CGEvent {
    let ctx = unsafe { &*(user_info as *const TapCtx) };

    if etype == CGEventType::TapDisabledByTimeout || etype == CGEventType::TapDisabledByUserInput {
        trace! ("event tap was disabled by the OS, re-enabling");
        if let Some(port) = unsafe { ctx.port.load (Ordering::SeqCst).as_ref() } {
            CGEvent::tap_enable (port, true);
        }
        return event.as_ptr()
    }
    let mods = mods_from_flags ( unsafe { CGEvent::flags (Some (event.as_ref())) } );
    let ev = match etype {
        CGEventType::KeyDown => {
            let code = unsafe { CGEvent::integer_value_field (Some (event.as_ref()), CGEventField::KeyboardEventKeycode) } as u16;
            TapEvent::KeyDown { key: key_from_keycode (code), mods }
        }
        CGEventType::FlagsChanged => TapEvent::ModifiersChanged { mods },
        _ => return event.as_ptr(),
    };
    match ctx.handler.handle (ev) {
        TapDecision::Consume     => null_mut(),
        TapDecision::Passthrough => event.as_ptr(),
    }
}


impl EventTapBackend for MacEventTap {

    fn install (&mut self, handler: Arc<TapHandler>) -> CoreResult<()> {
        if self.active.is_some() { return Ok(()) }
        if !check_accessibility (false) { return Err (CoreError::PermissionDenied) }

        let ctx = Box::into_raw ( Box::new ( TapCtx { handler, port: AtomicPtr::new (null_mut()) } ) );
        let ctx_addr = ctx as usize;
        let (tx, rx) = crossbeam_channel::bounded (1);

        let thread = spawn ( move || {
            let mask = (1u64 << CGEventType::KeyDown.0 as u64) | (1u64 << CGEventType::FlagsChanged.0 as u64);
            let port = unsafe { CGEvent::tap_create (
                CGEventTapLocation::SessionEventTap, CGEventTapPlacement::HeadInsertEventTap, CGEventTapOptions::Default,
                mask, Some (tap_callback), ctx_addr as *mut c_void,
            ) };
            let Some(port) = port else { let _ = tx.send (None); return };

            let source   = CFMachPort::new_run_loop_source (None, Some (&port), 0);
            let run_loop = CFRunLoop::current();
            let (Some(source), Some(run_loop)) = (source, run_loop) else {
                port.invalidate();
                let _ = tx.send (None);
                return
            };
            unsafe { &*(ctx_addr as *const TapCtx) } .port .store (CFRetained::as_ptr (&port) .as_ptr(), Ordering::SeqCst);
            run_loop.add_source (Some (&source), unsafe { kCFRunLoopCommonModes });
            CGEvent::tap_enable (&port, true);
            let _ = tx.send ( Some ( TapLoop { run_loop, port: port.clone() } ) );

            CFRunLoop::run();

            port.invalidate();
            debug! ("event tap thread exiting");
        } );

        match rx.recv() {
            Ok (Some (tap)) => {
                self.active = Some ( TapThread { ctx, tap, thread } );
                Ok(())
            }
            _ => {
                let _ = thread.join();
                drop ( unsafe { Box::from_raw (ctx) } );
                warn! ("CGEventTapCreate failed, most likely missing accessibility permission");
                Err (CoreError::PermissionDenied)
            }
        }
    }

    fn uninstall (&mut self) {
        let Some(t) = self.active.take() else { return };
        CGEvent::tap_enable (&t.tap.port, false);
        // a stop that lands before the loop is running is lost, so keep at it until the thread is gone
        while !t.thread.is_finished() {
            t.tap.run_loop.stop();
            sleep (Duration::from_millis(5));
        }
        let _ = t.thread.join();
        drop (t.tap);
        drop ( unsafe { Box::from_raw (t.ctx as *mut TapCtx) } );
    }
}

impl Drop for MacEventTap {
    fn drop (&mut self) { self.uninstall() }
}



#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keycodes_and_flags_map_onto_logical_keys() {
        assert_eq! (key_from_keycode (48), Key::Tab);
        assert_eq! (key_from_keycode (76), Key::Return);
        assert_eq! (key_from_keycode (0),  Key::Other (0));
        let flags = CGEventFlags (CGEventFlags::MaskAlternate.0 | CGEventFlags::MaskShift.0);
        assert_eq! (mods_from_flags (flags), Modifiers::ALT | Modifiers::SHIFT);
    }

    #[test]
    fn window_info_dictionaries_read_cleanly() {
        // whatever the session shows (possibly nothing on a headless runner), every entry must have come through typed
        if let Ok(windows) = MacWindowServer.list_on_screen_windows() {
            assert! (windows.iter() .all (|w| w.id.0 > 0));
        }
    }

    #[test]
    fn raising_a_window_of_a_missing_process_never_reports_raised() {
        let rec = WindowRecord {
            id: WindowId (u32::MAX as u64), pid: i32::MAX as u32, app_name: "Nobody".into(), title: "gone".into(),
            icon: None, is_foreground_app: false,
        };
        assert! (!matches! (MacFocus.raise_window (&rec), Ok (RaiseOutcome::Raised)));
    }
}
