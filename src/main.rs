// Prevents additional console window on Windows in release, DO NOT REMOVE!!
#![cfg_attr (
    all ( not(debug_assertions), target_os = "windows" ),
    windows_subsystem = "windows"
)]

use std::sync::Arc;
use std::thread::{sleep, spawn};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use winhop::activation::ActivationBridge;
use winhop::catalog::WindowCatalog;
use winhop::config::Config;
use winhop::gate::{GatedCapabilities, NoCapabilities};
use winhop::input_proc::InputProcessor;
use winhop::{platform, CoreError, Switcher, SwitcherDeps};


fn main() {

    let conf = match Config::load() {
        Ok (conf) => conf,
        Err (e) => { eprintln! ("Winhop : {e}"); return }
    };

    // we want the non-blocking log-appender guard to be here in main, to ensure any pending logs get flushed upon crash etc
    let _guard = conf.setup_log_subscriber();

    info! ("Starting Winhop {} ...", Config::WINHOP_VERSION);

    let backends = match platform::native() {
        Ok (b) => b,
        Err (e) => { error! ("{e}"); eprintln! ("Winhop : {e}"); return }
    };

    let settings = conf.switcher_settings();
    let deps = SwitcherDeps {
        catalog : WindowCatalog::new (backends.server, settings.shell_apps.clone()),
        bridge  : ActivationBridge::new (backends.focus),
        input   : InputProcessor::new (backends.tap),
        gate    : Arc::new ( GatedCapabilities::new (Arc::new(NoCapabilities), conf.get_feature_gate_override()) ),
    };
    let switcher = Switcher::new (settings, deps);
    let events = switcher.subscribe();

    match switcher.start_monitoring() {
        Ok(()) => { }
        Err (CoreError::PermissionDenied) => {
            // report once, then keep polling quietly until the user grants it
            platform::check_input_permission (true);
            warn! ("input permission missing, waiting for it to be granted");
            eprintln! ("Winhop needs accessibility / input-monitoring permission to see the switch hotkey.");
            let sw = switcher.clone();
            spawn ( move || loop {
                sleep (Duration::from_secs(2));
                if platform::check_input_permission (false) && sw.start_monitoring().is_ok() {
                    info! ("input permission granted, monitoring started");
                    break
                }
            } );
        }
        Err (e) => { error! ("could not start monitoring : {e}"); return }
    }

    // pick up hand edits to the config file .. log level applies right away, the rest on the next start
    if let Some (conf_path) = conf.get_config_file() .map (|p| p.to_path_buf()) {
        let conf = conf.clone();
        spawn ( move || {
            let mtime = || std::fs::metadata (&conf_path) .and_then (|m| m.modified()) .ok();
            let mut last = mtime();
            loop {
                sleep (Duration::from_secs(3));
                let cur = mtime();
                if cur != last {
                    last = cur;
                    info! ("config file changed, reloading");
                    conf.reload();
                    conf.reload_log_level();
                }
            }
        } );
    }

    // line commands on stdin stand in for a tray menu (release builds on windows have no console, so this just ends)
    {
        let (sw, conf) = (switcher.clone(), conf.clone());
        spawn ( move || {
            for line in std::io::stdin().lines() {
                let Ok(line) = line else { break };
                match line.trim() {
                    "" => { }
                    "refresh" => sw.refresh_windows(),
                    "toggle"  => match sw.toggle_monitoring() {
                        Ok (on) => info! ("monitoring is now {}", if on {"on"} else {"off"}),
                        Err (e) => warn! ("could not toggle monitoring : {e}"),
                    },
                    "auto-hide" => {
                        let on = conf.deferred_update_conf__auto_hide_toggle();
                        info! ("auto-hide on release set to {on}, takes effect on next launch");
                    }
                    other => warn! ("unknown command {other:?} .. expected one of refresh, toggle, auto-hide"),
                }
            }
        } );
    }

    // no presentation layer of our own, the event stream just goes to the log
    for ev in events {
        info! (
            kind = ev.kind.str(), visible = ev.view.visible, windows = ev.view.windows.len(),
            selected = ev.view.selected_index, "switcher state changed"
        );
        debug! ("view payload : {}", serde_json::to_string (&ev.view) .unwrap_or_default());
    }
}
