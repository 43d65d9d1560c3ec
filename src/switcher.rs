#![ allow (non_camel_case_types) ]

use std::ops::Deref;
use std::sync::{Arc, Mutex, PoisonError};
use std::sync::atomic::Ordering;
use std::thread::{spawn, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use strum_macros::AsRefStr;
use tracing::{debug, info, trace, warn};

use crate::activation::ActivationBridge;
use crate::catalog::{CatalogSnapshot, WindowCatalog, WindowRecord};
use crate::errors::{ActivationError, CoreError, CoreResult};
use crate::gate::CapabilityGate;
use crate::input_proc::{ActionSink, HotkeyBinding, InputProcessor, LogicalAction, TapHandler, TriggerModifier};



# [ atomic_enum::atomic_enum ]
# [ derive (PartialEq) ]
pub enum SwitcherPhase { Hidden, Visible }
// ^^ the atomic_enum crate will generate an AtomicSwitcherPhase for us


# [ derive (Clone) ]
/// Read-only copy of the phase for the tap context. Only the coordination thread ever writes it.
pub struct PhaseMirror ( Arc <AtomicSwitcherPhase> );

impl Default for PhaseMirror {
    fn default () -> Self { PhaseMirror ( Arc::new ( AtomicSwitcherPhase::new (SwitcherPhase::Hidden) ) ) }
}
impl PhaseMirror {
    pub fn get (&self) -> SwitcherPhase { self.0 .load (Ordering::SeqCst) }
    pub fn set (&self, phase: SwitcherPhase) { self.0 .store (phase, Ordering::SeqCst) }
}



# [ derive (Debug, Clone) ]
/// Visibility, selection and the snapshot being shown
pub struct SwitcherState {
    pub visible        : bool,
    pub selected_index : usize,
    pub snapshot       : CatalogSnapshot,
}

impl Default for SwitcherState {
    fn default () -> Self {
        SwitcherState { visible: false, selected_index: 0, snapshot: CatalogSnapshot::empty() }
    }
}

impl SwitcherState {
    pub fn phase (&self) -> SwitcherPhase {
        if self.visible { SwitcherPhase::Visible } else { SwitcherPhase::Hidden }
    }
    pub fn selected_record (&self) -> Option<&WindowRecord> {
        self.snapshot.get (self.selected_index)
    }
    /// The selection invariants that must hold in every reachable state
    pub fn invariants_hold (&self) -> bool {
        if self.snapshot.is_empty() { self.selected_index == 0 }
        else { !self.visible || self.selected_index < self.snapshot.len() }
    }
}



# [ derive (Debug, Copy, Clone, Eq, PartialEq, Hash, AsRefStr, Serialize, Deserialize) ]
/// Why a refresh was asked for .. decides how the selection is treated when the result lands
pub enum RefreshReason {
    warmup,
    show,
    retrigger,
    manual,
}


#[derive (Debug, Eq, PartialEq, Hash, Copy, Clone, AsRefStr, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitcherEventKind {
    shown,
    hidden,
    selection_changed,
    snapshot_replaced,
}
impl SwitcherEventKind {
    pub fn str (&self) -> &str { self.as_ref() }
}


# [ derive (Debug, Clone, Serialize) ]
/// Render payload for the presentation layer
pub struct SwitcherView {
    pub visible        : bool,
    pub selected_index : usize,
    pub is_empty       : bool,
    pub windows        : CatalogSnapshot,
}

impl From <&SwitcherState> for SwitcherView {
    fn from (s: &SwitcherState) -> Self {
        SwitcherView {
            visible        : s.visible,
            selected_index : s.selected_index,
            is_empty       : s.snapshot.is_empty(),
            windows        : s.snapshot.clone(),
        }
    }
}


# [ derive (Debug, Clone, Serialize) ]
/// State-changed notification .. always sent after the mutation it describes has been applied
pub struct SwitcherEvent {
    pub kind : SwitcherEventKind,
    pub view : SwitcherView,
}



# [ derive (Debug, Clone, PartialEq) ]
/// Side effects a transition asks the coordinator to carry out
pub enum Effect {
    RequestRefresh (RefreshReason),
    Activate (WindowRecord),
    Notify (SwitcherEventKind),
}




# [ derive (Debug, Default) ]
/// The pure transition logic .. no threads, no OS. The coordinator drives it and runs the effects it returns.
pub struct SwitcherStateMachine {
    state                : SwitcherState,
    last_applied_seq     : u64,
    refresh_on_retrigger : bool,
}

impl SwitcherStateMachine {

    pub fn new (refresh_on_retrigger: bool) -> SwitcherStateMachine {
        SwitcherStateMachine { refresh_on_retrigger, ..Default::default() }
    }

    pub fn state (&self) -> &SwitcherState { &self.state }
    pub fn last_applied_seq (&self) -> u64 { self.last_applied_seq }

    fn hide (&mut self) {
        self.state = SwitcherState::default();
        // ^^ discarding the snapshot too, so a reopen never flashes stale windows
    }

    pub fn apply (&mut self, action: LogicalAction) -> Vec<Effect> {
        use LogicalAction::*;
        let count = self.state.snapshot.len();
        match (self.state.visible, action) {
            (false, ActivateTrigger) => {
                self.state.visible = true;
                self.state.selected_index = 0;
                vec! [ Effect::Notify (SwitcherEventKind::shown), Effect::RequestRefresh (RefreshReason::show) ]
            }
            (true, ActivateTrigger) => {
                if self.refresh_on_retrigger { vec! [ Effect::RequestRefresh (RefreshReason::retrigger) ] } else { vec![] }
            }
            (true, NavigateNext) if count > 0 => {
                self.state.selected_index = (self.state.selected_index + 1) % count;
                vec! [ Effect::Notify (SwitcherEventKind::selection_changed) ]
            }
            (true, NavigatePrevious) if count > 0 => {
                self.state.selected_index = (self.state.selected_index + count - 1) % count;
                vec! [ Effect::Notify (SwitcherEventKind::selection_changed) ]
            }
            (true, Confirm) => {
                let target = self.state.selected_record().cloned();
                self.hide();
                let mut effects = vec! [ Effect::Notify (SwitcherEventKind::hidden) ];
                if let Some(rec) = target { effects.push (Effect::Activate (rec)) }
                effects
            }
            (true, Cancel) => {
                self.hide();
                vec! [ Effect::Notify (SwitcherEventKind::hidden) ]
            }
            _ => vec![],
        }
    }

    /// Pointer path : direct selection, then an implicit confirm. Out of range or hidden is ignored.
    pub fn select_index (&mut self, idx: usize) -> Vec<Effect> {
        if !self.state.visible || idx >= self.state.snapshot.len() { return vec![] }
        self.state.selected_index = idx;
        self.apply (LogicalAction::Confirm)
    }

    /// Applies a finished refresh unless something newer already landed. Refreshes asked for by an open
    /// switcher are dropped once it has hidden, the hide already superseded them.
    pub fn apply_refresh (&mut self, seq: u64, reason: RefreshReason, snapshot: CatalogSnapshot) -> CoreResult <Vec<Effect>> {
        let for_open_switcher = matches! (reason, RefreshReason::show | RefreshReason::retrigger);
        if seq <= self.last_applied_seq || (for_open_switcher && !self.state.visible) {
            return Err (CoreError::RefreshSuperseded { seq, applied: self.last_applied_seq })
        }
        self.last_applied_seq = seq;

        let keep = match reason {
            RefreshReason::retrigger if self.state.visible => {
                self.state.selected_record() .map (|r| r.id) .and_then (|id| snapshot.position_of(id))
            }
            _ => None,
        };
        self.state.selected_index = keep.unwrap_or (0);
        self.state.snapshot = snapshot;
        Ok ( vec! [ Effect::Notify (SwitcherEventKind::snapshot_replaced) ] )
    }
}




/// Messages into the coordination thread
enum CoordMsg {
    Action      (LogicalAction),
    SelectIndex (usize),
    Refresh     (RefreshReason),
    RefreshDone { seq: u64, reason: RefreshReason, snapshot: CatalogSnapshot },
    Subscribe   (Sender<SwitcherEvent>),
    Query       (Sender<SwitcherView>),
    Shutdown,
}


/// Tap-side handle into the coordination thread. Sending on an unbounded channel never blocks.
struct ChannelSink ( Sender<CoordMsg> );

impl ActionSink for ChannelSink {
    fn post (&self, action: LogicalAction) {
        let _ = self.0 .send (CoordMsg::Action (action));
        // ^^ only fails once the coordinator is gone, at which point there's nobody to act on it anyway
    }
}



/// Owns the state machine on a single thread; every mutation happens here, serialized
struct Coordinator {
    machine     : SwitcherStateMachine,
    catalog     : WindowCatalog,
    bridge      : ActivationBridge,
    mirror      : PhaseMirror,
    tx          : Sender<CoordMsg>,
    subscribers : Vec <Sender<SwitcherEvent>>,
    next_seq    : u64,
}

impl Coordinator {

    fn run (mut self, rx: Receiver<CoordMsg>) {
        info! ("coordination context started");
        while let Ok(msg) = rx.recv() {
            let effects = match msg {
                CoordMsg::Action (action) => {
                    trace! (action = action.str(), "applying action");
                    self.machine.apply (action)
                }
                CoordMsg::SelectIndex (idx) => self.machine.select_index (idx),
                CoordMsg::Refresh (reason)  => vec! [ Effect::RequestRefresh (reason) ],
                CoordMsg::RefreshDone { seq, reason, snapshot } => {
                    match self.machine.apply_refresh (seq, reason, snapshot) {
                        Ok (effects) => effects,
                        Err (e) => { trace! ("dropping refresh : {e}"); vec![] }
                    }
                }
                CoordMsg::Subscribe (sub) => { self.subscribers.push (sub); vec![] }
                CoordMsg::Query (reply) => {
                    let _ = reply.send (SwitcherView::from (self.machine.state()));
                    vec![]
                }
                CoordMsg::Shutdown => break,
            };
            self.mirror.set (self.machine.state().phase());
            effects .into_iter() .for_each (|e| self.run_effect (e));
        }
        info! ("coordination context stopped");
    }

    fn run_effect (&mut self, effect: Effect) {
        match effect {
            Effect::RequestRefresh (reason) => self.spawn_refresh (reason),
            Effect::Activate (record) => {
                match self.bridge.activate (&record) {
                    Ok(()) => { }
                    Err (ActivationError::StaleWindow { id }) => debug! (%id, "confirmed window had vanished, just hiding"),
                    Err (e) => warn! ("activation failed : {e}"),
                }
            }
            Effect::Notify (kind) => self.notify (kind),
        }
    }

    fn spawn_refresh (&mut self, reason: RefreshReason) {
        self.next_seq += 1;
        let seq = self.next_seq;
        let (catalog, tx) = (self.catalog.clone(), self.tx.clone());
        debug! (seq, reason = reason.as_ref(), "starting catalog refresh");
        spawn ( move || {
            let snapshot = catalog.refresh();
            let _ = tx.send (CoordMsg::RefreshDone { seq, reason, snapshot });
        } );
    }

    fn notify (&mut self, kind: SwitcherEventKind) {
        let ev = SwitcherEvent { kind, view: SwitcherView::from (self.machine.state()) };
        // subscribers that hung up are dropped here
        self.subscribers .retain (|s| s.send (ev.clone()).is_ok());
    }
}




# [ derive (Debug, Clone) ]
/// Knobs the switcher runs with, usually read out of the config file
pub struct SwitcherSettings {
    pub shell_apps           : Vec<String>,
    pub trigger_modifier     : TriggerModifier,
    pub auto_hide_on_release : bool,
    pub refresh_on_retrigger : bool,
}

impl Default for SwitcherSettings {
    fn default () -> Self {
        SwitcherSettings {
            shell_apps           : vec! [],
            trigger_modifier     : TriggerModifier::PLATFORM_DEFAULT,
            auto_hide_on_release : true,
            refresh_on_retrigger : true,
        }
    }
}


/// The OS-facing collaborators, injected at construction
pub struct SwitcherDeps {
    pub catalog : WindowCatalog,
    pub bridge  : ActivationBridge,
    pub input   : InputProcessor,
    pub gate    : Arc <dyn CapabilityGate>,
}



pub struct _Switcher {
    settings    : SwitcherSettings,
    input       : InputProcessor,
    gate        : Arc <dyn CapabilityGate>,
    mirror      : PhaseMirror,
    tx          : Sender<CoordMsg>,
    coordinator : Mutex <Option <JoinHandle<()>>>,
}

# [ derive (Clone) ]
/// Handle to the switcher core. Construct one at process start and hand clones to the host and
/// presentation layer; it lives until the last clone drops, which stops monitoring and joins the
/// coordination thread.
pub struct Switcher ( Arc <_Switcher> );

impl Deref for Switcher {
    type Target = _Switcher;
    fn deref (&self) -> &_Switcher { &self.0 }
}

impl Switcher {

    pub fn new (settings: SwitcherSettings, deps: SwitcherDeps) -> Switcher {
        let (tx, rx) = unbounded();
        let mirror = PhaseMirror::default();
        let coordinator = Coordinator {
            machine     : SwitcherStateMachine::new (settings.refresh_on_retrigger),
            catalog     : deps.catalog,
            bridge      : deps.bridge,
            mirror      : mirror.clone(),
            tx          : tx.clone(),
            subscribers : vec![],
            next_seq    : 0,
        };
        let handle = spawn ( move || coordinator.run(rx) );
        Switcher ( Arc::new ( _Switcher {
            settings,
            input       : deps.input,
            gate        : deps.gate,
            mirror,
            tx,
            coordinator : Mutex::new (Some(handle)),
        } ) )
    }

    fn post (&self, msg: CoordMsg) {
        if self.tx.send(msg).is_err() { warn! ("coordination context is gone, dropping request") }
    }

    /// Hotkey layout for the next tap install, with the gated bits resolved against the capability gate
    pub fn hotkey_binding (&self) -> HotkeyBinding {
        let custom_ok = self.gate.can_use_custom_hotkeys();
        let hold_modifier = if custom_ok { self.settings.trigger_modifier } else { TriggerModifier::PLATFORM_DEFAULT };
        if !custom_ok && hold_modifier != self.settings.trigger_modifier {
            info! ("custom trigger modifier needs a license, falling back to default");
        }
        HotkeyBinding {
            hold_modifier,
            reverse_with_shift   : self.gate.can_use_advanced_switching(),
            auto_hide_on_release : self.settings.auto_hide_on_release,
        }
    }


    /*****  lifecycle  ******/

    /// Installs the tap and warms up the catalog. Idempotent; PermissionDenied is handed back for the host to act on.
    pub fn start_monitoring (&self) -> CoreResult<()> {
        if self.input.is_running() { return Ok(()) }
        let sink : Arc<dyn ActionSink> = Arc::new (ChannelSink (self.tx.clone()));
        let handler = Arc::new (TapHandler::new (self.hotkey_binding(), self.mirror.clone(), sink));
        self.input.start (handler)?;
        self.post (CoordMsg::Refresh (RefreshReason::warmup));
        Ok(())
    }

    pub fn stop_monitoring (&self) {
        self.input.stop();
    }

    pub fn is_monitoring (&self) -> bool { self.input.is_running() }

    /// Host enable/disable toggle .. returns whether monitoring is on afterwards
    pub fn toggle_monitoring (&self) -> CoreResult<bool> {
        if self.is_monitoring() { self.stop_monitoring(); Ok(false) }
        else { self.start_monitoring() .map (|_| true) }
    }


    /*****  intents, same semantics as the keyboard path  ******/

    pub fn show            (&self) { self.post (CoordMsg::Action (LogicalAction::ActivateTrigger)) }
    pub fn select_next     (&self) { self.post (CoordMsg::Action (LogicalAction::NavigateNext)) }
    pub fn select_previous (&self) { self.post (CoordMsg::Action (LogicalAction::NavigatePrevious)) }
    pub fn select_current  (&self) { self.post (CoordMsg::Action (LogicalAction::Confirm)) }
    pub fn cancel          (&self) { self.post (CoordMsg::Action (LogicalAction::Cancel)) }

    /// Pointer click on a rendered entry
    pub fn select_index (&self, idx: usize) { self.post (CoordMsg::SelectIndex (idx)) }

    pub fn refresh_windows (&self) { self.post (CoordMsg::Refresh (RefreshReason::manual)) }


    /*****  observation  ******/

    /// Subscribes to state-changed events, delivered in mutation order
    pub fn subscribe (&self) -> Receiver<SwitcherEvent> {
        let (tx, rx) = unbounded();
        self.post (CoordMsg::Subscribe (tx));
        rx
    }

    /// Current view, as of after everything posted before this call. Blocks on the coordination thread, so not for the tap.
    pub fn view (&self) -> Option<SwitcherView> {
        let (tx, rx) = crossbeam_channel::bounded (1);
        self.post (CoordMsg::Query (tx));
        rx.recv().ok()
    }

    pub fn phase (&self) -> SwitcherPhase { self.mirror.get() }

    /// The capability gate as the core sees it (override already applied), for hosts to query
    pub fn capabilities (&self) -> &dyn CapabilityGate { self.gate.as_ref() }
}

impl Drop for _Switcher {
    fn drop (&mut self) {
        self.input.stop();
        let _ = self.tx.send (CoordMsg::Shutdown);
        if let Some(h) = self.coordinator.lock() .unwrap_or_else (PoisonError::into_inner) .take() {
            let _ = h.join();
        }
    }
}
