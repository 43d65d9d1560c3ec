
use std::ops::Deref;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::sync::atomic::{AtomicBool, Ordering};

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use strum_macros::AsRefStr;
use tracing::{info, trace, warn};

use crate::errors::{CoreError, CoreResult};
use crate::switcher::{PhaseMirror, SwitcherPhase};



bitflags! {
    # [ derive (Debug, Default, Copy, Clone, Eq, PartialEq, Hash) ]
    /// Platform-neutral modifier mask .. backends translate their native flag words into this
    pub struct Modifiers : u8 {
        const SHIFT   = 0b0001;
        const CONTROL = 0b0010;
        const ALT     = 0b0100;
        const COMMAND = 0b1000;
    }
}


# [ derive (Debug, Copy, Clone, Eq, PartialEq, Hash) ]
/// The handful of keys the switcher cares about .. everything else is carried as its raw platform code
pub enum Key {
    Tab,
    Left,
    Right,
    Up,
    Down,
    Return,
    Escape,
    Other (u32),
}


# [ derive (Debug, Copy, Clone, Eq, PartialEq) ]
pub enum TapEvent {
    KeyDown          { key: Key, mods: Modifiers },
    ModifiersChanged { mods: Modifiers },
}


# [ derive (Debug, Copy, Clone, Eq, PartialEq) ]
/// What the tap callback tells the OS to do with the raw event
pub enum TapDecision {
    Consume,
    Passthrough,
}


#[allow(non_camel_case_types)]
# [ derive (Debug, Eq, PartialEq, Hash, Copy, Clone, AsRefStr, Serialize, Deserialize) ]
pub enum LogicalAction {
    ActivateTrigger,
    NavigateNext,
    NavigatePrevious,
    Confirm,
    Cancel,
    Passthrough,
}
impl LogicalAction {
    pub fn str (&self) -> &str { self.as_ref() }
}




# [ derive (Debug, Copy, Clone, Eq, PartialEq) ]
/// The modifier held while cycling, i.e. the 'alt' in alt-tab
pub struct TriggerModifier (pub Modifiers);

impl TriggerModifier {
    pub const PLATFORM_DEFAULT : TriggerModifier = TriggerModifier (Modifiers::ALT);
}

impl FromStr for TriggerModifier {
    type Err = CoreError;
    fn from_str (s: &str) -> CoreResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "alt"  | "option"  => Ok (TriggerModifier (Modifiers::ALT)),
            "cmd"  | "command" | "win" => Ok (TriggerModifier (Modifiers::COMMAND)),
            "ctrl" | "control" => Ok (TriggerModifier (Modifiers::CONTROL)),
            _ => Err (CoreError::Config { reason: format! ("unknown trigger modifier '{s}'") }),
        }
    }
}



# [ derive (Debug, Copy, Clone, Eq, PartialEq) ]
/// Hotkey layout the classifier runs with. Built once per start(), after the capability gate was consulted.
pub struct HotkeyBinding {
    pub hold_modifier        : TriggerModifier,
    pub reverse_with_shift   : bool,
    pub auto_hide_on_release : bool,
}

impl Default for HotkeyBinding {
    fn default () -> Self {
        HotkeyBinding {
            hold_modifier        : TriggerModifier::PLATFORM_DEFAULT,
            reverse_with_shift   : false,
            auto_hide_on_release : true,
        }
    }
}

impl HotkeyBinding {

    /// Maps one key-down to a logical action. Pure .. no state beyond the visibility passed in.
    pub fn classify_key_down (&self, key: Key, mods: Modifiers, visible: bool) -> LogicalAction {
        use LogicalAction::*;
        let hold = self.hold_modifier.0;
        if key == Key::Tab && mods.contains(hold) {
            if visible && self.reverse_with_shift && mods.contains(Modifiers::SHIFT) {
                return NavigatePrevious
            }
            return ActivateTrigger
        }
        if !visible { return Passthrough }
        match key {
            Key::Left  | Key::Up    => NavigatePrevious,
            Key::Right | Key::Down  => NavigateNext,
            Key::Return             => Confirm,
            Key::Escape             => Cancel,
            _                       => Passthrough,
        }
    }
}



# [ derive (Debug, Default) ]
/// Tracks whether the hold-modifier is physically down, as last seen by the tap
pub struct ModifierGateState {
    held : AtomicBool,
}

impl ModifierGateState {

    pub fn is_held (&self) -> bool { self.held.load (Ordering::SeqCst) }

    /// A trigger key-down with the modifier in its mask means it's held, even if we never saw it go down
    pub fn note_key_down (&self, mods: Modifiers, hold: Modifiers) {
        if mods.contains(hold) { self.held.store (true, Ordering::SeqCst) }
    }

    /// Returns true only on a down -> up transition of the hold modifier
    pub fn on_modifiers_changed (&self, mods: Modifiers, hold: Modifiers) -> bool {
        let now_held = mods.contains(hold);
        let was_held = self.held.swap (now_held, Ordering::SeqCst);
        was_held && !now_held
    }
}



/// Where the tap hands classified actions off to .. implementations must not block
pub trait ActionSink : Send + Sync {
    fn post (&self, action: LogicalAction);
}



/// Everything the tap callback needs, bundled so a backend can hold it as one handle.
/// Lives for as long as a tap is installed; the backend drops its reference on uninstall.
pub struct TapHandler {
    binding : HotkeyBinding,
    gate    : ModifierGateState,
    phase   : PhaseMirror,
    sink    : Arc <dyn ActionSink>,
}

impl TapHandler {

    pub fn new (binding: HotkeyBinding, phase: PhaseMirror, sink: Arc<dyn ActionSink>) -> TapHandler {
        TapHandler { binding, gate: ModifierGateState::default(), phase, sink }
    }

    pub fn binding (&self) -> &HotkeyBinding { &self.binding }
    pub fn gate    (&self) -> &ModifierGateState { &self.gate }

    /// The real-time path : classify, post, decide. Only atomics and a non-blocking channel send in here.
    pub fn handle (&self, ev: TapEvent) -> TapDecision {
        let visible = self.phase.get() == SwitcherPhase::Visible;
        let hold = self.binding.hold_modifier.0;
        match ev {
            TapEvent::KeyDown { key, mods } => {
                self.gate.note_key_down (mods, hold);
                match self.binding.classify_key_down (key, mods, visible) {
                    LogicalAction::Passthrough => TapDecision::Passthrough,
                    action => {
                        trace! (action = action.str(), "tap consumed key-down");
                        self.sink.post (action);
                        TapDecision::Consume
                    }
                }
            }
            TapEvent::ModifiersChanged { mods } => {
                let released = self.gate.on_modifiers_changed (mods, hold);
                if released && visible && self.binding.auto_hide_on_release {
                    trace! ("hold-modifier released while visible .. implicit cancel");
                    self.sink.post (LogicalAction::Cancel);
                }
                // flag changes always flow on, other apps need to see the modifier go up
                TapDecision::Passthrough
            }
        }
    }
}



/// OS-specific tap installation. `uninstall` must disable the tap before releasing anything it holds,
/// and must be a no-op when nothing is installed.
pub trait EventTapBackend : Send {
    fn install   (&mut self, handler: Arc<TapHandler>) -> CoreResult<()>;
    fn uninstall (&mut self);
}



pub struct _InputProcessor {
    backend : Mutex <Box <dyn EventTapBackend>>,
    running : AtomicBool,
}

# [ derive (Clone) ]
/// Owns the global event tap lifecycle. start/stop are idempotent.
pub struct InputProcessor ( Arc <_InputProcessor> );

impl Deref for InputProcessor {
    type Target = _InputProcessor;
    fn deref (&self) -> &_InputProcessor { &self.0 }
}

impl InputProcessor {

    pub fn new (backend: Box<dyn EventTapBackend>) -> InputProcessor {
        InputProcessor ( Arc::new ( _InputProcessor {
            backend : Mutex::new (backend),
            running : AtomicBool::new (false),
        } ) )
    }

    pub fn is_running (&self) -> bool { self.running.load (Ordering::SeqCst) }

    /// Installs the tap. On PermissionDenied we stay inert and hand the error back .. no retrying here,
    /// the host prompts for permission and calls start again.
    pub fn start (&self, handler: Arc<TapHandler>) -> CoreResult<()> {
        let mut backend = self.backend.lock() .unwrap_or_else (PoisonError::into_inner);
        if self.is_running() { return Ok(()) }
        match backend.install (handler) {
            Ok(()) => {
                self.running.store (true, Ordering::SeqCst);
                info! ("input event tap installed");
                Ok(())
            }
            Err (e) => {
                warn! ("input event tap not installed : {e}");
                Err (e)
            }
        }
    }

    pub fn stop (&self) {
        let mut backend = self.backend.lock() .unwrap_or_else (PoisonError::into_inner);
        if !self.is_running() { return }
        backend.uninstall();
        self.running.store (false, Ordering::SeqCst);
        info! ("input event tap removed");
    }
}
