//! Keyboard-driven window switcher core : window catalog, input interception, the switcher state
//! machine and window activation, with native backends for macOS and Windows.

pub mod errors;
pub mod catalog;
pub mod gate;
pub mod input_proc;
pub mod activation;
pub mod switcher;
pub mod config;
pub mod platform;

pub use errors::{ActivationError, CoreError, CoreResult};
pub use switcher::{Switcher, SwitcherDeps, SwitcherEvent, SwitcherEventKind, SwitcherSettings, SwitcherView};
