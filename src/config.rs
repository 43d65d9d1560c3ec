#![ allow (non_snake_case, non_upper_case_globals) ]

use std::{fs, time};
use std::ops::{Deref, Not};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::SystemTime;

use once_cell::sync::Lazy;
use toml_edit::{DocumentMut, Item};

use tracing::{info, warn};
use tracing::metadata::LevelFilter;
use tracing_appender::non_blocking;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{Layer, Registry, reload};
use tracing_subscriber::fmt::time::LocalTime;
use tracing_subscriber::reload::Handle;
use tracing_subscriber::prelude::*;

use crate::errors::{CoreError, CoreResult};
use crate::gate::FeatureGateOverride;
use crate::input_proc::TriggerModifier;
use crate::switcher::SwitcherSettings;





# [ derive (Debug, Clone) ]
/// Debouncer for config write-backs : runs the most recently queued action once its deadline lapses
pub struct DeferredExecutor {
    deadline : Arc <Mutex <SystemTime>>,
}

/// Work queued on a DeferredExecutor
pub type Action = Arc < dyn Fn() + Send + Sync + 'static >;




# [ derive (Debug) ]
pub struct _Config {
    pub toml     : RwLock <Option <DocumentMut>>,
    pub default  : DocumentMut,
    pub loglevel : RwLock <Option <Handle <LevelFilter, Registry>>>,
    conf_file    : Option <PathBuf>,
    // flush guard for a subscriber set up after startup, main holds the one from startup
    late_guard   : Mutex <Option <WorkerGuard>>,
}


# [ derive (Debug, Clone) ]
pub struct Config ( Arc <_Config> );

impl Deref for Config {
    type Target = _Config;
    fn deref (&self) -> &_Config { &self.0 }
}





/// Directory holding the running binary
fn get_app_dir () -> Option<PathBuf> {
    std::env::current_exe().ok() .and_then (|p| p.parent() .map (|p| p.to_path_buf()))
}

/// True if we can open (or create) the file for writing
fn is_writeable (path: &Path) -> bool {
    fs::OpenOptions::new().write(true).create(true).truncate(false).open(path).is_ok()
    // ^^ leaves an empty file behind when it wasn't there yet
}

/// Picks the config file location : next to the exe if we can write there, else under the user's local data dir
fn find_config_file () -> Option<PathBuf> {
    let app_dir_loc = get_app_dir() .map (|p| p.join (Config::CONF_FILE_NAME));
    if app_dir_loc.as_ref() .is_some_and (|p| is_writeable(p)) {
        return app_dir_loc
    }
    let data_dir = dirs::data_local_dir() .map (|p| p.join ("Winhop"))?;
    if !data_dir.exists() {
        let _ = fs::create_dir_all (&data_dir);
    }
    let data_dir_loc = data_dir.join (Config::CONF_FILE_NAME);
    if is_writeable (&data_dir_loc) { Some (data_dir_loc) } else { None }
}

fn default_doc () -> CoreResult<DocumentMut> {
    DocumentMut::from_str (Config::DEFAULT_CONF)
        .map_err (|e| CoreError::Config { reason: format! ("embedded default config is broken : {e}") })
}




impl Config {

    pub const CONF_FILE_NAME : &'static str = "winhop.conf.toml";
    pub const WINHOP_VERSION : &'static str = env!("CARGO_PKG_VERSION");

    // defaults ship inside the binary
    const DEFAULT_CONF : &'static str = include_str!("../winhop.conf.toml");


    /// Loads the on-disk config, creating it from defaults if it's missing or unusable
    pub fn load () -> CoreResult<Config> {
        Config::load_at (find_config_file())
    }

    /// Same as `load`, but with the config file location picked by the caller
    pub fn load_at (conf_file: Option<PathBuf>) -> CoreResult<Config> {
        let conf = Config ( Arc::new ( _Config {
            toml       : RwLock::new (None),
            default    : default_doc()?,
            loglevel   : RwLock::new (None),
            conf_file,
            late_guard : Mutex::new (None),
        } ) );
        conf.reload();
        Ok (conf)
    }

    /// In-memory config from toml text. Nothing is ever written back to disk.
    pub fn from_toml_str (toml: &str) -> CoreResult<Config> {
        let doc = DocumentMut::from_str (toml) .map_err (|e| CoreError::Config { reason: e.to_string() })?;
        Ok ( Config ( Arc::new ( _Config {
            toml       : RwLock::new (Some (doc)),
            default    : default_doc()?,
            loglevel   : RwLock::new (None),
            conf_file  : None,
            late_guard : Mutex::new (None),
        } ) ) )
    }

    pub fn get_config_file (&self) -> Option<&Path> { self.conf_file.as_deref() }

    pub fn get_log_loc (&self) -> Option<PathBuf> {
        self.get_config_file() .and_then (|p| p.parent()) .map (|p| p.to_path_buf())
    }


    pub fn trigger_config_file_reset (&self) {
        self.toml.write() .unwrap_or_else (PoisonError::into_inner) .replace (self.default.clone());
        self.write_back_toml();
    }

    /// Re-reads the config file from disk
    pub fn reload (&self) {
        if let Some(conf_path) = self.get_config_file() {
            if let Ok(cfg_str) = fs::read_to_string(conf_path) {
                if !cfg_str.trim().is_empty() {
                    if let Ok(toml) = DocumentMut::from_str(&cfg_str) {
                        // usable file on disk
                        self.toml.write() .unwrap_or_else (PoisonError::into_inner) .replace(toml);
                        return
        }   }   }  }
        // nothing usable on disk .. fall back to the embedded default and persist it
        self.trigger_config_file_reset();
    }

    pub fn reload_log_level (&self) {
        // logging might have gone from disabled to enabled since startup
        if let Ok(guard) = self.setup_log_subscriber() {
            self.late_guard.lock() .unwrap_or_else (PoisonError::into_inner) .replace (guard);
        }
        let log_level = self.get_log_level();
        warn! ("Setting log-level to {:?}", log_level.into_level());
        if let Some(h) = self.loglevel.read() .unwrap_or_else (PoisonError::into_inner) .as_ref() {
            let _ = h.modify (|f| *f = log_level);
        }
    }

    pub fn setup_log_subscriber (&self) -> CoreResult <WorkerGuard> {
        let not_set_up = |reason: &str| CoreError::Config { reason: format! ("logging not set up : {reason}") };

        if self.check_flag__logging_enabled().not() {
            return Err (not_set_up ("disabled in config"))
        }
        if self.loglevel.read() .unwrap_or_else (PoisonError::into_inner) .is_some() {
            return Err (not_set_up ("already installed"))
        }
        let log_loc = self.get_log_loc() .ok_or_else (|| not_set_up ("no writeable log location"))?;

        let log_appender = RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix("winhop_log")
            .filename_suffix("log")
            .max_log_files(7)
            .build(log_loc)
            .map_err (|e| not_set_up (&e.to_string()))?;

        let (nb_log_appender, guard) = non_blocking (log_appender);

        let timer = LocalTime::new ( ::time::format_description::parse (
            "[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:3]"
        ) .map_err (|e| not_set_up (&e.to_string()))? );

        let (level_filter, filter_handle) = reload::Layer::new(self.get_log_level());

        let subscriber = tracing_subscriber::fmt::Layer::new()
            .with_writer(nb_log_appender)
            .with_timer(timer)
            .with_ansi(false)
            .with_filter(level_filter);

        tracing_subscriber::registry().with(subscriber) .try_init() .map_err (|e| not_set_up (&e.to_string()))?;

        *self.loglevel.write() .unwrap_or_else (PoisonError::into_inner) = Some(filter_handle);
        Ok (guard)
    }


    fn toml_string (&self) -> String {
        self.toml.read() .unwrap_or_else (PoisonError::into_inner) .as_ref() .map (|d| d.to_string()) .unwrap_or_default()
    }
    fn write_back_toml (&self) {
        if let Some(conf_path) = self.get_config_file() {
            let _ = fs::write (conf_path, self.toml_string());
        }
    }
    fn write_back_toml_if_changed (&self) {
        if let Some(conf_path) = self.get_config_file() {
            let toml_str = self.toml_string();
            let old_toml_str = fs::read_to_string (conf_path) .unwrap_or_default();
            if toml_str != old_toml_str {
                info! ("writing back updated config to {:?}", conf_path);
                let _ = fs::write (conf_path, toml_str);
            }
        }
    }
    pub fn deferred_write_back_toml (&self) {
        static dfr_ex: Lazy<DeferredExecutor> = Lazy::new (DeferredExecutor::default);
        let conf = self.clone();
        let action = Arc::new (move || conf.write_back_toml_if_changed());
        dfr_ex .setup_deferred_action (action, time::Duration::from_millis(300));
    }



    /// Looks up a key in the loaded toml, falling back to the embedded default
    fn lookup <T> (&self, key: &str, extract: impl Fn(&Item) -> Option<T>) -> Option<T> {
        let loaded = self.toml.read() .unwrap_or_else (PoisonError::into_inner) .as_ref()
            .and_then (|t| t.get(key)) .and_then (&extract);
        loaded .or_else (|| self.default.get(key) .and_then (&extract))
    }

    fn check_flag (&self, flag_name:&str) -> bool {
        self.lookup (flag_name, |v| v.as_bool()) .unwrap_or_default()
    }

    /// Sets a flag in memory and schedules a debounced write back to disk
    pub fn set_flag (&self, flag_name:&str, flag_val:bool) {
        if let Some(toml) = self.toml.write() .unwrap_or_else (PoisonError::into_inner) .as_mut() {
            toml [flag_name] = toml_edit::value (flag_val);
        }
        self.deferred_write_back_toml();
    }

    fn get_string (&self, key:&str) -> String {
        self.lookup (key, |v| v.as_str() .map (|s| s.to_string())) .unwrap_or_default()
    }

    fn get_string_array (&self, key:&str) -> Vec<String> {
        self.lookup (key, |v| v.as_array() .map (|a| a.iter() .filter_map (|v| v.as_str().map(|s| s.to_string())) .collect()))
            .unwrap_or_default()
    }



    // boolean flags
    pub fn check_flag__logging_enabled       (&self) -> bool { self.check_flag ( "logging_enabled"      ) }
    pub fn check_flag__auto_hide_on_release  (&self) -> bool { self.check_flag ( "auto_hide_on_release" ) }
    pub fn check_flag__refresh_on_retrigger  (&self) -> bool { self.check_flag ( "refresh_on_retrigger" ) }


    pub fn get_log_level (&self) -> LevelFilter {
        if !self.check_flag__logging_enabled() {
            return LevelFilter::OFF;
        }
        match self.get_string("logging_level").as_str() {
            "TRACE" => LevelFilter::TRACE,
            "DEBUG" => LevelFilter::DEBUG,
            "WARN"  => LevelFilter::WARN,
            "ERROR" => LevelFilter::ERROR,
            "OFF"   => LevelFilter::OFF,
            _       => LevelFilter::INFO,
        }
    }

    pub fn get_trigger_modifier (&self) -> TriggerModifier {
        let s = self.get_string ("trigger_modifier");
        s.parse() .unwrap_or_else (|e| {
            warn! ("{e} .. using platform default");
            TriggerModifier::PLATFORM_DEFAULT
        } )
    }

    pub fn get_shell_app_exclusions (&self) -> Vec<String> { self.get_string_array ("shell_app_exclusions") }

    pub fn get_feature_gate_override (&self) -> FeatureGateOverride {
        let s = self.get_string ("feature_gate_override");
        s.parse() .unwrap_or_else (|e| {
            warn! ("{e} .. ignoring");
            FeatureGateOverride::none
        } )
    }

    /// Everything the switcher core takes from config, resolved in one go
    pub fn switcher_settings (&self) -> SwitcherSettings {
        SwitcherSettings {
            shell_apps           : self.get_shell_app_exclusions(),
            trigger_modifier     : self.get_trigger_modifier(),
            auto_hide_on_release : self.check_flag__auto_hide_on_release(),
            refresh_on_retrigger : self.check_flag__refresh_on_retrigger(),
        }
    }


    pub fn deferred_update_conf__auto_hide_toggle (&self) -> bool {
        let new_state = self.check_flag__auto_hide_on_release().not();
        self.set_flag ("auto_hide_on_release", new_state);
        new_state
    }

}




impl Default for DeferredExecutor {
    fn default () -> Self { Self::new() }
}
impl DeferredExecutor {

    pub fn new () -> Self {
        Self { deadline: Arc::new (Mutex::new (SystemTime::UNIX_EPOCH)) }
    }
    fn deadline (&self) -> std::sync::MutexGuard<'_, SystemTime> {
        self.deadline.lock() .unwrap_or_else (PoisonError::into_inner)
    }
    pub fn reset (&self) -> Self {
        *self.deadline() = SystemTime::UNIX_EPOCH;
        self.clone()
    }
    pub fn set_deferral_dur (&self, dur:time::Duration) -> Self {
        if let Some(t) = SystemTime::now().checked_add(dur) {
            *self.deadline() = t
        }
        self.clone()
    }
    pub fn is_reset (&self) -> bool {
        *self.deadline() == SystemTime::UNIX_EPOCH
    }
    pub fn is_due (&self) -> bool {
        !self.is_reset() && *self.deadline() < SystemTime::now()
    }

    fn check_defered_action (&self, action:Action) {
        // a later caller pushing the deadline out owns the run, so only act when it's actually due
        if self.is_due() {
            let mut deadline = self.deadline();
            action();
            *deadline = SystemTime::UNIX_EPOCH;
        }
    }

    /// Queues `action` to run after `delay`. Queuing again before then pushes the deadline out, and only
    /// the last queued action runs. `reset` drops whatever is pending.
    pub fn setup_deferred_action (&self, action:Action, delay:time::Duration) {
        let dfr_ex = self.clone();
        dfr_ex.set_deferral_dur(delay);
        std::thread::spawn ( move || {
            // small margin so the deadline has definitely passed when we wake
            std::thread::sleep (delay + time::Duration::from_millis(5));
            dfr_ex.check_defered_action(action);
        } );
    }

}




#[cfg(test)]
mod tests {
    use super::*;
    use crate::input_proc::Modifiers;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn embedded_default_parses_and_drives_settings() {
        let conf = Config::from_toml_str ("") .unwrap();
        let s = conf.switcher_settings();
        assert_eq! (s.trigger_modifier, TriggerModifier::PLATFORM_DEFAULT);
        assert! (s.auto_hide_on_release && s.refresh_on_retrigger);
        assert! (s.shell_apps.contains (&"Dock".to_string()));
        assert_eq! (conf.get_feature_gate_override(), FeatureGateOverride::none);
        assert_eq! (conf.get_log_level(), LevelFilter::INFO);
    }

    #[test]
    fn file_values_override_defaults() {
        let conf = Config::from_toml_str (r#"
            trigger_modifier = "cmd"
            auto_hide_on_release = false
            shell_app_exclusions = ["Finder"]
            feature_gate_override = "force_enabled"
            logging_level = "TRACE"
        "#) .unwrap();
        let s = conf.switcher_settings();
        assert_eq! (s.trigger_modifier, TriggerModifier (Modifiers::COMMAND));
        assert! (!s.auto_hide_on_release);
        assert! (s.refresh_on_retrigger);
        assert_eq! (s.shell_apps, vec! ["Finder".to_string()]);
        assert_eq! (conf.get_feature_gate_override(), FeatureGateOverride::force_enabled);
        assert_eq! (conf.get_log_level(), LevelFilter::TRACE);
    }

    #[test]
    fn bad_values_fall_back_instead_of_failing() {
        let conf = Config::from_toml_str (r#"
            trigger_modifier = "hyper"
            feature_gate_override = 3
            logging_enabled = false
        "#) .unwrap();
        assert_eq! (conf.get_trigger_modifier(), TriggerModifier::PLATFORM_DEFAULT);
        assert_eq! (conf.get_feature_gate_override(), FeatureGateOverride::none);
        assert_eq! (conf.get_log_level(), LevelFilter::OFF);
        assert! (conf.setup_log_subscriber().is_err());
    }

    #[test]
    fn unparsable_text_is_a_config_error() {
        assert! (matches! (Config::from_toml_str ("trigger_modifier = "), Err (CoreError::Config {..})));
    }

    fn scratch_conf_path (tag: &str) -> PathBuf {
        let dir = std::env::temp_dir() .join (format! ("winhop-conf-{tag}-{}", std::process::id()));
        let _ = fs::remove_dir_all (&dir);
        fs::create_dir_all (&dir) .unwrap();
        dir.join (Config::CONF_FILE_NAME)
    }

    #[test]
    fn missing_file_is_recreated_from_default() {
        let path = scratch_conf_path ("reset");
        let conf = Config::load_at (Some (path.clone())) .unwrap();
        let written = fs::read_to_string (&path) .unwrap();
        assert! (written.contains ("logging_enabled = true") && written.contains ("shell_app_exclusions"));
        assert! (conf.check_flag__logging_enabled());
        assert_eq! (conf.get_log_loc(), path.parent() .map (|p| p.to_path_buf()));
        let _ = fs::remove_dir_all (path.parent().unwrap());
    }

    #[test]
    fn toggled_flag_is_written_back_after_debounce() {
        let path = scratch_conf_path ("toggle");
        let conf = Config::load_at (Some (path.clone())) .unwrap();
        assert_eq! (conf.deferred_update_conf__auto_hide_toggle(), false);
        assert! (!conf.check_flag__auto_hide_on_release());
        assert_eq! (conf.deferred_update_conf__auto_hide_toggle(), true);
        assert_eq! (conf.deferred_update_conf__auto_hide_toggle(), false);
        std::thread::sleep (time::Duration::from_millis(600));
        let on_disk = Config::load_at (Some (path.clone())) .unwrap();
        assert! (!on_disk.check_flag__auto_hide_on_release());
        assert! (fs::read_to_string (&path) .unwrap() .contains ("auto_hide_on_release = false"));
        let _ = fs::remove_dir_all (path.parent().unwrap());
    }

    #[test]
    fn logging_enabled_later_keeps_its_writer_alive() {
        let path = scratch_conf_path ("logging");
        fs::write (&path, "logging_enabled = false\n") .unwrap();
        let conf = Config::load_at (Some (path.clone())) .unwrap();
        assert! (conf.setup_log_subscriber().is_err());
        assert! (conf.late_guard.lock().unwrap().is_none());

        fs::write (&path, "logging_enabled = true\nlogging_level = \"DEBUG\"\n") .unwrap();
        conf.reload();
        conf.reload_log_level();
        assert! (conf.loglevel.read().unwrap().is_some());
        assert! (conf.late_guard.lock().unwrap().is_some());

        // a second reload only adjusts the level, the kept guard stays put
        conf.reload_log_level();
        assert! (conf.late_guard.lock().unwrap().is_some());
        drop (conf);
        let _ = fs::remove_dir_all (path.parent().unwrap());
    }

    #[test]
    fn deferred_executor_runs_only_the_last_action() {
        let dfr = DeferredExecutor::new();
        let hits = Arc::new (AtomicU32::new(0));
        for i in 1..=3 {
            let hits = hits.clone();
            dfr.setup_deferred_action (Arc::new (move || { hits.store (i, Ordering::SeqCst); }), time::Duration::from_millis(60));
            std::thread::sleep (time::Duration::from_millis(10));
        }
        std::thread::sleep (time::Duration::from_millis(200));
        assert_eq! (hits.load (Ordering::SeqCst), 3);
        assert! (dfr.is_reset());
    }
}
