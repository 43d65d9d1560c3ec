
use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

use crate::errors::CoreResult;



/// Window-server layer that normal application windows live on .. desktop, dock, menubar etc all sit elsewhere
pub const NORMAL_WINDOW_LAYER : i64 = 0;


# [ derive (Debug, Default, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize) ]
/// Numeric window id as assigned by the OS window server (CGWindowID on mac, HWND on windows)
pub struct WindowId (pub u64);

impl fmt::Display for WindowId {
    fn fmt (&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write! (f, "{}", self.0) }
}


# [ derive (Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize) ]
/// Opaque icon reference .. points at the owning app's bundle/exe, which the presentation layer resolves to pixels
pub struct IconHandle {
    pub source : PathBuf,
}


# [ derive (Debug, Clone, Eq, PartialEq, Serialize, Deserialize) ]
/// One window as reported by the OS, before any filtering
pub struct RawWindow {
    pub id       : WindowId,
    pub pid      : u32,
    pub app_name : String,
    pub title    : String,
    pub layer    : i64,
}


# [ derive (Debug, Clone, Serialize, Deserialize) ]
/// Immutable per-refresh record of an enumerable window. Identity is the window id alone.
pub struct WindowRecord {
    pub id                : WindowId,
    pub pid               : u32,
    pub app_name          : String,
    pub title             : String,
    pub icon              : Option<IconHandle>,
    pub is_foreground_app : bool,
}

impl PartialEq for WindowRecord {
    fn eq (&self, other: &Self) -> bool { self.id == other.id }
}
impl Eq for WindowRecord { }

impl Hash for WindowRecord {
    fn hash <H: Hasher> (&self, state: &mut H) { self.id.hash(state) }
}



# [ derive (Debug, Clone, Default) ]
/// Ranked, de-duplicated, immutable list of window records. Cloning shares the underlying list.
pub struct CatalogSnapshot ( Arc <Vec <WindowRecord>> );

impl Deref for CatalogSnapshot {
    type Target = [WindowRecord];
    fn deref (&self) -> &[WindowRecord] { self.0.as_slice() }
}

impl Serialize for CatalogSnapshot {
    fn serialize <S: serde::Serializer> (&self, s: S) -> Result<S::Ok, S::Error> { self.0.as_slice().serialize(s) }
}

impl CatalogSnapshot {

    /// Builds a snapshot from an already ranked list .. later duplicates of an id are dropped so ids stay unique
    pub fn from_ranked (records: Vec<WindowRecord>) -> CatalogSnapshot {
        let mut seen = HashSet::with_capacity (records.len());
        let deduped = records .into_iter() .filter (|r| seen.insert(r.id)) .collect::<Vec<_>>();
        CatalogSnapshot ( Arc::new (deduped) )
    }

    pub fn empty () -> CatalogSnapshot { CatalogSnapshot::default() }

    pub fn position_of (&self, id: WindowId) -> Option<usize> {
        self.iter() .position (|r| r.id == id)
    }

    pub fn ids (&self) -> Vec<WindowId> {
        self.iter() .map (|r| r.id) .collect()
    }
}




/// What the catalog needs from the OS window server
pub trait WindowServer : Send + Sync {

    /// On-screen windows in the server's enumeration order (front to back)
    fn list_on_screen_windows (&self) -> CoreResult <Vec<RawWindow>>;

    /// Pid of the app currently holding keyboard focus, if the OS will tell us
    fn foreground_app_pid (&self) -> Option<u32>;

    /// Best-effort icon lookup for an owning app
    fn app_icon (&self, pid: u32) -> Option<IconHandle>;
}




# [ derive (Debug) ]
pub struct _WindowCatalog {
    shell_apps : HashSet<String>,
}

# [ derive (Clone) ]
/// Enumerates, filters and ranks the current window set. Holds no window state between refreshes.
pub struct WindowCatalog {
    inner  : Arc <_WindowCatalog>,
    server : Arc <dyn WindowServer>,
}

impl Deref for WindowCatalog {
    type Target = _WindowCatalog;
    fn deref (&self) -> &_WindowCatalog { &self.inner }
}

impl WindowCatalog {

    pub fn new (server: Arc<dyn WindowServer>, shell_apps: Vec<String>) -> WindowCatalog {
        WindowCatalog {
            inner  : Arc::new ( _WindowCatalog { shell_apps: shell_apps.into_iter().collect() } ),
            server,
        }
    }

    /// Queries the window server for a fresh ranked snapshot. Never fails .. a broken query just yields an empty list.
    pub fn refresh (&self) -> CatalogSnapshot {
        let raw = match self.server.list_on_screen_windows() {
            Ok (raw) => raw,
            Err (e) => {
                // expected on transient window-server hiccups, the switcher will just show 'no windows'
                debug! ("{e} .. presenting empty snapshot");
                return CatalogSnapshot::empty()
            }
        };
        let n_raw = raw.len();
        let fgnd_pid = self.server.foreground_app_pid();
        if fgnd_pid.is_none() { debug! ("no foreground app reported, no window will be marked foreground") }

        let records = raw .into_iter()
            .filter (|w| self.passes_filters(w))
            .map (|w| WindowRecord {
                icon              : self.server.app_icon (w.pid),
                is_foreground_app : fgnd_pid == Some(w.pid),
                id                : w.id,
                pid               : w.pid,
                app_name          : w.app_name,
                title             : w.title,
            } )
            .collect::<Vec<_>>();

        let snapshot = CatalogSnapshot::from_ranked (rank_records (records));
        info! (raw = n_raw, kept = snapshot.len(), "catalog refreshed");
        snapshot
    }

    pub fn passes_filters (&self, w: &RawWindow) -> bool {
        if w.layer != NORMAL_WINDOW_LAYER { return false }
        if w.title.is_empty() { return false }
        if self.shell_apps.contains (&w.app_name) {
            trace! (id = %w.id, app = %w.app_name, "skipping shell-owned window");
            return false
        }
        true
    }
}



/// Stable ranking : foreground app first, then app name, then title .. all remaining ties keep enumeration order
pub fn rank_records (mut records: Vec<WindowRecord>) -> Vec<WindowRecord> {
    records .sort_by (|a, b| {
        b.is_foreground_app .cmp (&a.is_foreground_app)
            .then_with (|| a.app_name .cmp (&b.app_name))
            .then_with (|| a.title .cmp (&b.title))
    } );
    // ^^ slice::sort_by is stable, which is what gives us determinism for identical inputs
    records
}




#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::errors::CoreError;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    pub(crate) fn raw (id: u64, pid: u32, app: &str, title: &str) -> RawWindow {
        RawWindow { id: WindowId(id), pid, app_name: app.into(), title: title.into(), layer: NORMAL_WINDOW_LAYER }
    }

    pub(crate) struct FakeServer {
        pub windows : Mutex <CoreResult <Vec<RawWindow>>>,
        pub fgnd    : Option<u32>,
    }
    impl WindowServer for FakeServer {
        fn list_on_screen_windows (&self) -> CoreResult <Vec<RawWindow>> { self.windows.lock().unwrap().clone() }
        fn foreground_app_pid (&self) -> Option<u32> { self.fgnd }
        fn app_icon (&self, pid: u32) -> Option<IconHandle> {
            if pid == 0 { None } else { Some (IconHandle { source: PathBuf::from (format! ("/apps/{pid}")) }) }
        }
    }

    fn catalog (windows: Vec<RawWindow>, fgnd: Option<u32>) -> WindowCatalog {
        let server = FakeServer { windows: Mutex::new (Ok(windows)), fgnd };
        WindowCatalog::new (Arc::new(server), vec! ["Dock".into(), "Finder".into()])
    }

    fn titles (s: &CatalogSnapshot) -> Vec<(String, String)> {
        s.iter() .map (|r| (r.app_name.clone(), r.title.clone())) .collect()
    }

    #[test]
    fn foreground_first_then_app_then_title() {
        let cat = catalog ( vec! [
            raw (1, 10, "Finder", "Downloads"),
            raw (2, 20, "Mail",   "Sent"),
            raw (3, 30, "Safari", "Apple"),
            raw (4, 20, "Mail",   "Inbox"),
        ], Some(30) );
        let snap = cat.refresh();
        assert_eq! ( titles(&snap), vec! [
            ("Safari".to_string(), "Apple".to_string()),
            ("Mail".to_string(),   "Inbox".to_string()),
            ("Mail".to_string(),   "Sent".to_string()),
        ] );
        assert! (snap[0].is_foreground_app);
        assert! (!snap[1].is_foreground_app);
    }

    #[test]
    fn drops_non_normal_layers_and_untitled_windows() {
        let mut menubar = raw (1, 10, "SystemUIServer", "Clock");
        menubar.layer = 25;
        let cat = catalog ( vec! [ menubar, raw (2, 20, "Notes", ""), raw (3, 30, "Notes", "Groceries") ], None );
        assert_eq! (cat.refresh().ids(), vec! [WindowId(3)]);
    }

    #[test]
    fn ranking_is_deterministic_and_stable_on_full_ties() {
        let mk = |id, fg| WindowRecord {
            id: WindowId(id), pid: 1, app_name: "Term".into(), title: "zsh".into(), icon: None, is_foreground_app: fg
        };
        let input = vec! [ mk(9, false), mk(3, false), mk(7, true), mk(1, false) ];
        let a = rank_records (input.clone()) .iter() .map (|r| r.id) .collect::<Vec<_>>();
        let b = rank_records (input)         .iter() .map (|r| r.id) .collect::<Vec<_>>();
        assert_eq! (a, b);
        assert_eq! (a, vec! [WindowId(7), WindowId(9), WindowId(3), WindowId(1)]);
    }

    #[test]
    fn app_name_order_is_case_sensitive_ordinal() {
        let cat = catalog ( vec! [ raw (1, 1, "iTerm", "a"), raw (2, 2, "Zed", "b"), raw (3, 3, "Alacritty", "c") ], None );
        let apps = cat.refresh() .iter() .map (|r| r.app_name.clone()) .collect::<Vec<_>>();
        assert_eq! (apps, vec! ["Alacritty", "Zed", "iTerm"]);
    }

    #[test]
    fn enumeration_failure_degrades_to_empty_snapshot() {
        let server = FakeServer {
            windows : Mutex::new ( Err (CoreError::EnumerationDegraded { reason: "window list unavailable".into() }) ),
            fgnd    : Some(1),
        };
        let cat = WindowCatalog::new (Arc::new(server), vec![]);
        assert! (cat.refresh().is_empty());
    }

    #[test]
    fn duplicate_ids_keep_first_ranked_entry() {
        let cat = catalog ( vec! [ raw (5, 1, "B", "x"), raw (5, 1, "A", "y") ], None );
        let snap = cat.refresh();
        assert_eq! (snap.len(), 1);
        assert_eq! (snap[0].app_name, "A");
    }

    #[test]
    fn missing_icon_is_not_an_error() {
        let cat = catalog ( vec! [ raw (1, 0, "Kernel", "Console"), raw (2, 7, "Notes", "Todo") ], None );
        let snap = cat.refresh();
        assert_eq! (snap[0].icon, None);
        assert_eq! (snap[1].icon.as_ref().map(|i| i.source.clone()), Some (PathBuf::from("/apps/7")));
    }

    #[test]
    fn record_equality_is_by_id_only() {
        let a = WindowRecord { id: WindowId(1), pid: 1, app_name: "A".into(), title: "old".into(), icon: None, is_foreground_app: false };
        let b = WindowRecord { title: "new".into(), is_foreground_app: true, ..a.clone() };
        assert_eq! (a, b);
    }
}
