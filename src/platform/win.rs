#![ allow (non_snake_case, clippy::missing_safety_doc) ]

use std::ffi::c_void;
use std::mem::size_of;
use std::os::raw::c_int;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, PoisonError, Weak};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread::{spawn, JoinHandle};

use once_cell::sync::Lazy;
use tracing::{debug, info, warn};

use windows::core::PWSTR;
use windows::Win32::Foundation::{BOOL, CloseHandle, HINSTANCE, HWND, LPARAM, LRESULT, WPARAM};
use windows::Win32::Graphics::Dwm::{DwmGetWindowAttribute, DWMWA_CLOAKED};
use windows::Win32::System::Threading::{GetCurrentThreadId, OpenProcess, QueryFullProcessImageNameW, PROCESS_NAME_WIN32, PROCESS_QUERY_LIMITED_INFORMATION};
use windows::Win32::UI::Input::KeyboardAndMouse::{
    GetAsyncKeyState, SendInput, INPUT, INPUT_0, INPUT_KEYBOARD, KEYBD_EVENT_FLAGS, KEYBDINPUT, KEYEVENTF_KEYUP, VIRTUAL_KEY,
    VK_CONTROL, VK_DOWN, VK_ESCAPE, VK_LCONTROL, VK_LEFT, VK_LMENU, VK_LSHIFT, VK_LWIN, VK_MENU, VK_RCONTROL, VK_RETURN,
    VK_RIGHT, VK_RMENU, VK_RSHIFT, VK_RWIN, VK_SHIFT, VK_TAB, VK_UP,
};
use windows::Win32::UI::WindowsAndMessaging::{
    CallNextHookEx, EnumWindows, GetAncestor, GetForegroundWindow, GetMessageW, GetWindowLongW, GetWindowPlacement,
    GetWindowTextW, GetWindowThreadProcessId, IsWindow, IsWindowVisible, PostThreadMessageW, SetForegroundWindow,
    SetWindowsHookExW, ShowWindowAsync, UnhookWindowsHookEx, GA_ROOTOWNER, GWL_EXSTYLE, HHOOK, KBDLLHOOKSTRUCT, MSG,
    SW_RESTORE, SW_SHOW, SW_SHOWMINIMIZED, WH_KEYBOARD_LL, WINDOWPLACEMENT, WM_KEYDOWN, WM_KEYUP, WM_SYSKEYDOWN,
    WM_SYSKEYUP, WM_USER, WS_EX_APPWINDOW, WS_EX_TOOLWINDOW,
};

use crate::activation::{FocusApi, RaiseOutcome};
use crate::catalog::{IconHandle, RawWindow, WindowId, WindowRecord, WindowServer};
use crate::errors::{CoreError, CoreResult};
use crate::input_proc::{EventTapBackend, Key, Modifiers, TapDecision, TapEvent, TapHandler};



// extra-info stamp on the key events we inject ourselves, so the hook can let them straight through
const WINHOP_INJECTED_IDENTIFIER_EXTRA_INFO: usize = 0x3177_40B5;

const KILL_MSG : u32 = WM_USER + 1;

/// Layer we report for windows that aren't normal top-level app windows (tool, owned, or cloaked)
const NON_APP_LAYER : i64 = 1;


fn hwnd (id: WindowId) -> HWND { HWND (id.0 as isize as *mut c_void) }



/*****  window queries  ******/

fn check_window_visible (hwnd:HWND) -> bool { unsafe {
    IsWindowVisible (hwnd) .as_bool()
} }

fn check_window_cloaked (hwnd:HWND) -> bool { unsafe {
    let mut cloaked_state: u32 = 0;
    let out_ptr = &mut cloaked_state as *mut u32 as *mut c_void;
    let _ = DwmGetWindowAttribute (hwnd, DWMWA_CLOAKED, out_ptr, size_of::<u32>() as u32);
    cloaked_state != 0
} }

fn check_if_app_window (hwnd:HWND) -> bool { unsafe {
    GetWindowLongW (hwnd, GWL_EXSTYLE) & WS_EX_APPWINDOW.0 as i32 != 0
} }

fn check_if_tool_window (hwnd:HWND) -> bool { unsafe {
    GetWindowLongW (hwnd, GWL_EXSTYLE) & WS_EX_TOOLWINDOW.0 as i32 != 0
} }

fn check_window_has_owner (hwnd:HWND) -> bool { unsafe {
    GetAncestor (hwnd, GA_ROOTOWNER) != hwnd
} }

fn get_window_text (hwnd:HWND) -> String { unsafe {
    const MAX_LEN : usize = 512;
    let mut lpstr = [0u16; MAX_LEN];
    let copied_len = GetWindowTextW (hwnd, &mut lpstr);
    String::from_utf16_lossy (&lpstr [.. (copied_len.max(0) as usize)])
} }

fn get_window_pid (hwnd:HWND) -> u32 { unsafe {
    let mut pid : u32 = 0;
    let _ = GetWindowThreadProcessId (hwnd, Some(&mut pid));
    pid
} }

fn get_pid_exe_path (pid:u32) -> Option<String> { unsafe {
    const MAX_LEN : usize = 1024;
    let handle = OpenProcess (PROCESS_QUERY_LIMITED_INFORMATION, BOOL::from(false), pid) .ok()?;
    let mut lpstr = [0u16; MAX_LEN];
    let mut lpdwsize = MAX_LEN as u32;
    let res = QueryFullProcessImageNameW (handle, PROCESS_NAME_WIN32, PWSTR::from_raw(lpstr.as_mut_ptr()), &mut lpdwsize);
    let _ = CloseHandle (handle);
    res.ok() .map (|_| String::from_utf16_lossy (&lpstr [.. lpdwsize as usize]))
} }

/// Windows that would show up in the native alt-tab list get layer 0, everything else is pushed off it
fn window_layer (hwnd:HWND) -> i64 {
    let is_app_window = check_if_app_window(hwnd);
    if check_window_cloaked(hwnd) { return NON_APP_LAYER }
    if check_if_tool_window(hwnd) && !is_app_window { return NON_APP_LAYER }
    if check_window_has_owner(hwnd) && !is_app_window { return NON_APP_LAYER }
    0
}


// EnumWindows hands us each window through a callback, we collect them via the lparam
unsafe extern "system" fn enum_windows_cb (hwnd:HWND, lparam:LPARAM) -> BOOL {
    let acc = unsafe { &mut *(lparam.0 as *mut Vec<isize>) };
    acc.push (hwnd.0 as isize);
    BOOL (true as i32)
}



pub struct WinWindowServer;

impl WindowServer for WinWindowServer {

    fn list_on_screen_windows (&self) -> CoreResult <Vec<RawWindow>> {
        let mut hwnds : Vec<isize> = Vec::with_capacity (256);
        unsafe { EnumWindows ( Some(enum_windows_cb), LPARAM (&mut hwnds as *mut Vec<isize> as isize) ) }
            .map_err (|e| CoreError::EnumerationDegraded { reason: e.to_string() })?;

        Ok ( hwnds .into_iter()
            .map (|h| HWND (h as *mut c_void))
            .filter (|&h| check_window_visible(h))
            .map (|h| {
                let pid = get_window_pid(h);
                let app_name = get_pid_exe_path(pid) .as_deref()
                    .and_then (|p| Path::new(p).file_name() .map (|f| f.to_string_lossy().to_string()))
                    .unwrap_or_default();
                RawWindow { id: WindowId (h.0 as isize as u64), pid, app_name, title: get_window_text(h), layer: window_layer(h) }
            } )
            .collect() )
    }

    fn foreground_app_pid (&self) -> Option<u32> {
        let fgnd = unsafe { GetForegroundWindow() };
        if fgnd.0.is_null() { return None }
        Some (get_window_pid (fgnd)) .filter (|&p| p != 0)
    }

    fn app_icon (&self, pid: u32) -> Option<IconHandle> {
        get_pid_exe_path(pid) .map (|p| IconHandle { source: PathBuf::from(p) })
    }
}




pub struct WinFocus;

impl FocusApi for WinFocus {

    fn raise_window (&self, record: &WindowRecord) -> Result <RaiseOutcome, String> { unsafe {
        let hwnd = hwnd (record.id);
        if !IsWindow (hwnd).as_bool() || get_window_pid(hwnd) != record.pid {
            // gone, or the handle got recycled by some other process
            return Ok (RaiseOutcome::NotFound)
        }
        let mut win_state = WINDOWPLACEMENT::default();
        let _ = GetWindowPlacement (hwnd, &mut win_state);
        if win_state.showCmd == SW_SHOWMINIMIZED.0 as u32 {
            let _ = ShowWindowAsync (hwnd, SW_RESTORE);
        } else {
            let _ = ShowWindowAsync (hwnd, SW_SHOW);
        }
        // windows only lets whoever handled the last input take the foreground, so we feed ourselves a harmless key release first
        send_dummy_key_release();
        if SetForegroundWindow (hwnd) .as_bool() { Ok (RaiseOutcome::Raised) }
        else { Err ("SetForegroundWindow was refused".into()) }
    } }

    fn activate_app (&self, _pid: u32) -> Result <(), String> {
        // bringing the window foreground already activates its process here
        Ok(())
    }
}


fn send_dummy_key_release () {
    let inputs = [ INPUT {
        r#type: INPUT_KEYBOARD,
        Anonymous: INPUT_0 {
            ki: KEYBDINPUT {
                wVk: VIRTUAL_KEY(0x9A),
                wScan: 0,
                dwFlags: KEYBD_EVENT_FLAGS::default() | KEYEVENTF_KEYUP,
                time: 0,
                dwExtraInfo: WINHOP_INJECTED_IDENTIFIER_EXTRA_INFO,
        } }
    } ];
    unsafe { SendInput (&inputs, size_of::<INPUT>() as c_int) };
}




/*****  low-level keyboard hook  ******/

// the LL hook proc gets no user-data slot, so the installed handler is reachable through this weak ref only while a hook is up
static HOOK_HANDLER : Lazy <RwLock <Weak <TapHandler>>> = Lazy::new (|| RwLock::new (Weak::new()));

// set when we swallowed a tab key-down, so we swallow its key-up too and keep the pair balanced
static TAB_CONSUMED : AtomicBool = AtomicBool::new (false);


fn is_key_down (vk:VIRTUAL_KEY) -> bool { unsafe {
    GetAsyncKeyState (vk.0 as i32) as u16 & 0x8000 != 0
} }

fn modifier_of (vk:u32) -> Option<Modifiers> {
    let is = |k:VIRTUAL_KEY| vk == k.0 as u32;
    if is(VK_SHIFT)   || is(VK_LSHIFT)   || is(VK_RSHIFT)   { return Some (Modifiers::SHIFT) }
    if is(VK_CONTROL) || is(VK_LCONTROL) || is(VK_RCONTROL) { return Some (Modifiers::CONTROL) }
    if is(VK_MENU)    || is(VK_LMENU)    || is(VK_RMENU)    { return Some (Modifiers::ALT) }
    if is(VK_LWIN)    || is(VK_RWIN)                        { return Some (Modifiers::COMMAND) }
    None
}

fn current_modifiers () -> Modifiers {
    let mut mods = Modifiers::empty();
    if is_key_down(VK_SHIFT)   { mods |= Modifiers::SHIFT }
    if is_key_down(VK_CONTROL) { mods |= Modifiers::CONTROL }
    if is_key_down(VK_MENU)    { mods |= Modifiers::ALT }
    if is_key_down(VK_LWIN) || is_key_down(VK_RWIN) { mods |= Modifiers::COMMAND }
    mods
}

fn key_from_vk (vk:u32) -> Key {
    match vk {
        v if v == VK_TAB.0    as u32 => Key::Tab,
        v if v == VK_RETURN.0 as u32 => Key::Return,
        v if v == VK_ESCAPE.0 as u32 => Key::Escape,
        v if v == VK_LEFT.0   as u32 => Key::Left,
        v if v == VK_RIGHT.0  as u32 => Key::Right,
        v if v == VK_UP.0     as u32 => Key::Up,
        v if v == VK_DOWN.0   as u32 => Key::Down,
        v => Key::Other (v),
    }
}

/// Keyboard lower-level-hook processor
unsafe extern "system" fn kbd_hook_cb (code:c_int, w_param:WPARAM, l_param:LPARAM) -> LRESULT {

    let return_call  = || unsafe { CallNextHookEx (HHOOK::default(), code, w_param, l_param) };
    let return_block = || LRESULT(1);    // non-zero tells the OS to drop the event

    if code < 0 { return return_call() }

    let kbs = unsafe { *(l_param.0 as *const KBDLLHOOKSTRUCT) };
    if kbs.dwExtraInfo == WINHOP_INJECTED_IDENTIFIER_EXTRA_INFO { return return_call() }

    let Some(handler) = HOOK_HANDLER.read() .unwrap_or_else (PoisonError::into_inner) .upgrade() else { return return_call() };

    let msg = w_param.0 as u32;
    let is_down = msg == WM_KEYDOWN || msg == WM_SYSKEYDOWN;
    let is_up   = msg == WM_KEYUP   || msg == WM_SYSKEYUP;

    let ev = match modifier_of (kbs.vkCode) {
        Some(changed) => {
            // async key state lags the event we're handling, so patch in the modifier that just moved
            let mut mods = current_modifiers();
            if is_down { mods |= changed } else if is_up { mods &= !changed }
            TapEvent::ModifiersChanged { mods }
        }
        None if is_down => TapEvent::KeyDown { key: key_from_vk (kbs.vkCode), mods: current_modifiers() },
        None => {
            if is_up && kbs.vkCode == VK_TAB.0 as u32 && TAB_CONSUMED.swap (false, Ordering::SeqCst) {
                return return_block()
            }
            return return_call()
        }
    };

    match handler.handle (ev) {
        TapDecision::Consume => {
            if kbs.vkCode == VK_TAB.0 as u32 { TAB_CONSUMED.store (true, Ordering::SeqCst) }
            return_block()
        }
        TapDecision::Passthrough => return_call(),
    }
}



# [ derive (Default) ]
/// WH_KEYBOARD_LL hook on a dedicated thread with its own message loop
pub struct WinKbdHook {
    handler : Option <Arc<TapHandler>>,
    thread  : Option <JoinHandle<()>>,
    hook_thread_id : Arc <AtomicU32>,
}

impl EventTapBackend for WinKbdHook {

    fn install (&mut self, handler: Arc<TapHandler>) -> CoreResult<()> {
        if self.thread.is_some() { return Ok(()) }
        *HOOK_HANDLER.write() .unwrap_or_else (PoisonError::into_inner) = Arc::downgrade (&handler);

        let (tx, rx) = crossbeam_channel::bounded (1);
        let thread_id = self.hook_thread_id.clone();

        let thread = spawn ( move || unsafe {
            let hook = match SetWindowsHookExW (WH_KEYBOARD_LL, Some(kbd_hook_cb), HINSTANCE::default(), 0) {
                Ok (h) => h,
                Err (e) => { let _ = tx.send (Err (e.to_string())); return }
            };
            // we'll store this thread's id so uninstall can post us the kill msg
            thread_id.store (GetCurrentThreadId(), Ordering::SeqCst);
            let _ = tx.send (Ok(()));

            // win32 delivers hook calls to a thread with a message loop, but we own no windows, so a blocking GetMessage
            // is all we need .. the thread gets woken for each hook call, and only ever sees an actual msg for our kill-msg
            let mut msg = MSG::default();
            while GetMessageW (&mut msg, HWND::default(), 0, 0) .0 > 0 {
                if msg.message == KILL_MSG { break }
            }
            if UnhookWindowsHookEx (hook) .is_err() { warn! ("unhooking kbd hook failed") }
            debug! ("kbd hook thread exiting");
        } );

        match rx.recv() {
            Ok (Ok(())) => {
                info! ("kbd hook set");
                self.handler = Some (handler);
                self.thread = Some (thread);
                Ok(())
            }
            Ok (Err (reason)) => {
                let _ = thread.join();
                *HOOK_HANDLER.write() .unwrap_or_else (PoisonError::into_inner) = Weak::new();
                Err (CoreError::Platform { reason: format! ("SetWindowsHookExW failed : {reason}") })
            }
            Err (_) => {
                let _ = thread.join();
                Err (CoreError::Platform { reason: "kbd hook thread died during setup".into() })
            }
        }
    }

    fn uninstall (&mut self) {
        let Some(thread) = self.thread.take() else { return };
        let tid = self.hook_thread_id.swap (0, Ordering::SeqCst);
        let _ = unsafe { PostThreadMessageW (tid, KILL_MSG, WPARAM::default(), LPARAM::default()) };
        let _ = thread.join();
        *HOOK_HANDLER.write() .unwrap_or_else (PoisonError::into_inner) = Weak::new();
        self.handler = None;
        TAB_CONSUMED.store (false, Ordering::SeqCst);
    }
}

impl Drop for WinKbdHook {
    fn drop (&mut self) { self.uninstall() }
}
