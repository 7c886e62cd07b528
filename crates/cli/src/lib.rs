pub mod args;
pub mod config;
pub mod host;
pub mod notify;
pub mod orchestrator;
pub mod preview;

pub use config::{load_config, resolve_targets, ConfigError, ConfigFile, Selection, Settings};
pub use notify::{Notifier, SendmailNotifier};
pub use orchestrator::{Orchestrator, RunOptions, RunReport, TargetError, TargetReport};
pub use preview::{duplicate_vm_names, preview};
