//! End-to-end flows through the coordination thread, with in-memory platform fakes.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_channel::Receiver;
use pretty_assertions::assert_eq;

use winhop::activation::{ActivationBridge, FocusApi, RaiseOutcome};
use winhop::catalog::{IconHandle, RawWindow, WindowCatalog, WindowId, WindowRecord, WindowServer};
use winhop::gate::{CapabilityGate, NoCapabilities};
use winhop::input_proc::{EventTapBackend, InputProcessor, Key, Modifiers, TapDecision, TapEvent, TapHandler, TriggerModifier};
use winhop::switcher::SwitcherPhase;
use winhop::{CoreError, CoreResult, Switcher, SwitcherDeps, SwitcherEvent, SwitcherEventKind, SwitcherSettings};



struct FakeServer {
    windows : Mutex <CoreResult <Vec<RawWindow>>>,
    fgnd    : Option<u32>,
}
impl WindowServer for FakeServer {
    fn list_on_screen_windows (&self) -> CoreResult <Vec<RawWindow>> { self.windows.lock().unwrap().clone() }
    fn foreground_app_pid (&self) -> Option<u32> { self.fgnd }
    fn app_icon (&self, pid: u32) -> Option<IconHandle> { Some (IconHandle { source: format! ("/apps/{pid}").into() }) }
}

#[derive(Default)]
struct FakeFocus {
    live   : Mutex <HashSet<WindowId>>,
    raised : Mutex <Vec<WindowId>>,
}
impl FocusApi for FakeFocus {
    fn raise_window (&self, record: &WindowRecord) -> Result <RaiseOutcome, String> {
        if !self.live.lock().unwrap().contains (&record.id) { return Ok (RaiseOutcome::NotFound) }
        self.raised.lock().unwrap().push (record.id);
        Ok (RaiseOutcome::Raised)
    }
    fn activate_app (&self, _pid: u32) -> Result <(), String> { Ok(()) }
}

/// Holds on to the installed handler so tests can feed it key events
#[derive(Default, Clone)]
struct FakeTap {
    deny    : Arc <AtomicBool>,
    handler : Arc <Mutex <Option <Arc<TapHandler>>>>,
    removes : Arc <Mutex <u32>>,
}
impl EventTapBackend for FakeTap {
    fn install (&mut self, handler: Arc<TapHandler>) -> CoreResult<()> {
        if self.deny.load (Ordering::SeqCst) { return Err (CoreError::PermissionDenied) }
        *self.handler.lock().unwrap() = Some (handler);
        Ok(())
    }
    fn uninstall (&mut self) {
        if self.handler.lock().unwrap().take().is_some() { *self.removes.lock().unwrap() += 1 }
    }
}
impl FakeTap {
    fn send (&self, ev: TapEvent) -> TapDecision {
        let h = self.handler.lock().unwrap().clone().expect ("tap not installed");
        h.handle (ev)
    }
    fn key (&self, key: Key, mods: Modifiers) -> TapDecision { self.send (TapEvent::KeyDown { key, mods }) }
}

struct AllOn;
impl CapabilityGate for AllOn {
    fn can_use_advanced_switching (&self) -> bool { true }
    fn can_use_custom_hotkeys     (&self) -> bool { true }
    fn can_use_window_history     (&self) -> bool { true }
    fn can_use_multiple_displays  (&self) -> bool { true }
}


fn raw (id: u64, pid: u32, app: &str, title: &str) -> RawWindow {
    RawWindow { id: WindowId(id), pid, app_name: app.into(), title: title.into(), layer: 0 }
}

struct Rig {
    switcher : Switcher,
    events   : Receiver<SwitcherEvent>,
    tap      : FakeTap,
    focus    : Arc<FakeFocus>,
}

fn rig_with (windows: CoreResult<Vec<RawWindow>>, settings: SwitcherSettings, gate: Arc<dyn CapabilityGate>) -> Rig {
    let server = Arc::new ( FakeServer { windows: Mutex::new (windows), fgnd: Some(20) } );
    let focus = Arc::new (FakeFocus::default());
    let tap = FakeTap::default();
    let deps = SwitcherDeps {
        catalog : WindowCatalog::new (server, vec! ["Finder".into()]),
        bridge  : ActivationBridge::new (focus.clone()),
        input   : InputProcessor::new (Box::new (tap.clone())),
        gate,
    };
    let switcher = Switcher::new (settings, deps);
    let events = switcher.subscribe();
    Rig { switcher, events, tap, focus }
}

/// Mail and Safari windows, Safari in front, plus a Finder window that gets filtered
fn rig () -> Rig {
    let windows = vec! [
        raw (1, 30, "Finder", "Desktop"),
        raw (2, 10, "Mail",   "Drafts"),
        raw (3, 20, "Safari", "Docs"),
        raw (4, 10, "Mail",   "Inbox"),
    ];
    let r = rig_with (Ok(windows), SwitcherSettings::default(), Arc::new(NoCapabilities));
    r.focus.live.lock().unwrap().extend ([WindowId(2), WindowId(3), WindowId(4)]);
    r
}

fn wait_for (events: &Receiver<SwitcherEvent>, kind: SwitcherEventKind) -> SwitcherEvent {
    loop {
        let ev = events.recv_timeout (Duration::from_secs(5)) .expect ("timed out waiting for switcher event");
        if ev.kind == kind { return ev }
    }
}

/// Starts monitoring and opens the switcher, returning once the show refresh has landed
fn start_and_show (r: &Rig) -> SwitcherEvent {
    r.switcher.start_monitoring().unwrap();
    wait_for (&r.events, SwitcherEventKind::snapshot_replaced);
    assert_eq! (r.tap.key (Key::Tab, Modifiers::ALT), TapDecision::Consume);
    wait_for (&r.events, SwitcherEventKind::shown);
    wait_for (&r.events, SwitcherEventKind::snapshot_replaced)
}



#[test]
fn keyboard_cycle_and_confirm_activates_selected_window() {
    let r = rig();
    let ev = start_and_show (&r);
    assert! (ev.view.visible);
    assert_eq! (ev.view.windows.ids(), vec! [WindowId(3), WindowId(2), WindowId(4)]);
    assert_eq! (ev.view.selected_index, 0);
    assert_eq! (r.switcher.phase(), SwitcherPhase::Visible);

    assert_eq! (r.tap.key (Key::Right, Modifiers::ALT), TapDecision::Consume);
    assert_eq! (wait_for (&r.events, SwitcherEventKind::selection_changed).view.selected_index, 1);
    assert_eq! (r.tap.key (Key::Return, Modifiers::ALT), TapDecision::Consume);

    let hidden = wait_for (&r.events, SwitcherEventKind::hidden);
    assert! (!hidden.view.visible && hidden.view.is_empty);
    let view = r.switcher.view().unwrap();
    assert_eq! (*r.focus.raised.lock().unwrap(), vec! [WindowId(2)]);
    assert! (!view.visible);
}

#[test]
fn releasing_trigger_modifier_hides_without_switching() {
    let r = rig();
    start_and_show (&r);
    assert_eq! (r.tap.send (TapEvent::ModifiersChanged { mods: Modifiers::empty() }), TapDecision::Passthrough);
    wait_for (&r.events, SwitcherEventKind::hidden);
    assert! (r.switcher.view().is_some_and (|v| !v.visible));
    assert! (r.focus.raised.lock().unwrap().is_empty());
}

#[test]
fn keys_pass_through_while_hidden() {
    let r = rig();
    r.switcher.start_monitoring().unwrap();
    assert_eq! (r.tap.key (Key::Left,   Modifiers::empty()), TapDecision::Passthrough);
    assert_eq! (r.tap.key (Key::Escape, Modifiers::empty()), TapDecision::Passthrough);
    assert_eq! (r.tap.key (Key::Tab,    Modifiers::empty()), TapDecision::Passthrough);
    assert! (r.switcher.view().is_some_and (|v| !v.visible));
}

#[test]
fn programmatic_intents_match_keyboard_path() {
    let r = rig();
    start_and_show (&r);
    r.switcher.select_previous();
    assert_eq! (wait_for (&r.events, SwitcherEventKind::selection_changed).view.selected_index, 2);
    r.switcher.select_next();
    assert_eq! (wait_for (&r.events, SwitcherEventKind::selection_changed).view.selected_index, 0);
    r.switcher.cancel();
    wait_for (&r.events, SwitcherEventKind::hidden);

    r.switcher.show();
    wait_for (&r.events, SwitcherEventKind::snapshot_replaced);
    r.switcher.select_current();
    wait_for (&r.events, SwitcherEventKind::hidden);
    r.switcher.view();
    assert_eq! (*r.focus.raised.lock().unwrap(), vec! [WindowId(3)]);
}

#[test]
fn pointer_selection_confirms_and_ignores_out_of_range() {
    let r = rig();
    start_and_show (&r);
    r.switcher.select_index (7);
    assert! (r.switcher.view().is_some_and (|v| v.visible));
    r.switcher.select_index (2);
    wait_for (&r.events, SwitcherEventKind::hidden);
    r.switcher.view();
    assert_eq! (*r.focus.raised.lock().unwrap(), vec! [WindowId(4)]);
}

#[test]
fn vanished_window_just_hides() {
    let r = rig();
    start_and_show (&r);
    r.focus.live.lock().unwrap().clear();
    r.switcher.select_current();
    wait_for (&r.events, SwitcherEventKind::hidden);
    assert! (r.switcher.view().is_some_and (|v| !v.visible));
    assert! (r.focus.raised.lock().unwrap().is_empty());
    // and the switcher keeps working afterwards
    r.switcher.show();
    assert! (wait_for (&r.events, SwitcherEventKind::shown).view.visible);
}

#[test]
fn degraded_enumeration_shows_empty_switcher() {
    let r = rig_with (
        Err (CoreError::EnumerationDegraded { reason: "window server busy".into() }),
        SwitcherSettings::default(), Arc::new(NoCapabilities)
    );
    let ev = start_and_show (&r);
    assert! (ev.view.visible && ev.view.is_empty);
    r.switcher.select_next();
    r.switcher.select_current();
    let hidden = wait_for (&r.events, SwitcherEventKind::hidden);
    assert_eq! (hidden.view.selected_index, 0);
}

#[test]
fn permission_denied_leaves_core_inert_until_retried() {
    let r = rig();
    r.tap.deny.store (true, Ordering::SeqCst);
    assert_eq! (r.switcher.start_monitoring(), Err (CoreError::PermissionDenied));
    assert! (!r.switcher.is_monitoring());
    assert! (r.tap.handler.lock().unwrap().is_none());

    r.tap.deny.store (false, Ordering::SeqCst);
    assert_eq! (r.switcher.start_monitoring(), Ok(()));
    assert! (r.switcher.is_monitoring());
}

#[test]
fn toggle_and_drop_remove_the_tap() {
    let r = rig();
    assert_eq! (r.switcher.toggle_monitoring(), Ok(true));
    assert_eq! (r.switcher.toggle_monitoring(), Ok(false));
    assert_eq! (*r.tap.removes.lock().unwrap(), 1);
    r.switcher.start_monitoring().unwrap();
    let (tap, switcher) = (r.tap.clone(), r.switcher);
    drop (switcher);
    assert_eq! (*tap.removes.lock().unwrap(), 2);
}

#[test]
fn manual_refresh_replaces_snapshot_while_hidden() {
    let r = rig();
    r.switcher.refresh_windows();
    let ev = wait_for (&r.events, SwitcherEventKind::snapshot_replaced);
    assert! (!ev.view.visible);
    assert_eq! (ev.view.windows.len(), 3);
}

#[test]
fn custom_trigger_and_reverse_cycling_need_capabilities() {
    let settings = SwitcherSettings { trigger_modifier: TriggerModifier (Modifiers::COMMAND), ..SwitcherSettings::default() };

    let locked = rig_with (Ok(vec![]), settings.clone(), Arc::new(NoCapabilities));
    let b = locked.switcher.hotkey_binding();
    assert_eq! (b.hold_modifier, TriggerModifier::PLATFORM_DEFAULT);
    assert! (!b.reverse_with_shift);

    assert! (!locked.switcher.capabilities().can_use_window_history());

    let open = rig_with (Ok(vec! [raw (5, 1, "A", "a"), raw (6, 1, "B", "b")]), settings, Arc::new(AllOn));
    assert_eq! (open.switcher.hotkey_binding().hold_modifier, TriggerModifier (Modifiers::COMMAND));
    open.switcher.start_monitoring().unwrap();
    wait_for (&open.events, SwitcherEventKind::snapshot_replaced);
    assert_eq! (open.tap.key (Key::Tab, Modifiers::ALT), TapDecision::Passthrough);
    assert_eq! (open.tap.key (Key::Tab, Modifiers::COMMAND), TapDecision::Consume);
    wait_for (&open.events, SwitcherEventKind::shown);
    wait_for (&open.events, SwitcherEventKind::snapshot_replaced);
    assert_eq! (open.tap.key (Key::Tab, Modifiers::COMMAND | Modifiers::SHIFT), TapDecision::Consume);
    assert_eq! (wait_for (&open.events, SwitcherEventKind::selection_changed).view.selected_index, 1);
}
