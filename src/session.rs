use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use crate::logging::Verbosity;

/// Device bootstate as observed by the host.
///
/// Modes are ordered: a session only ever moves forward along
/// `Unknown -> Normal/Recovery -> Restore`.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Mode {
    #[default]
    Unknown = 0,
    Normal = 1,
    Recovery = 2,
    Restore = 3,
}

impl From<u8> for Mode {
    fn from(b: u8) -> Self {
        match b {
            1 => Self::Normal,
            2 => Self::Recovery,
            3 => Self::Restore,
            _ => Self::Unknown,
        }
    }
}

impl From<Mode> for &'static str {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Unknown => "unknown",
            Mode::Normal => "normal",
            Mode::Recovery => "recovery",
            Mode::Restore => "restore",
        }
    }
}

impl From<&Mode> for &'static str {
    fn from(mode: &Mode) -> Self {
        (*mode).into()
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", <&'static str>::from(self))
    }
}

/// The two fields shared with the hotplug observer thread.
///
/// `mode` and `quit` are the only values touched from the observer
/// context; both are single-word atomics. Mode writes go through
/// [promote](Self::promote), which uses `fetch_max` so the session mode
/// can never move backward.
#[derive(Debug, Default)]
pub struct Shared {
    mode: AtomicU8,
    quit: AtomicBool,
}

impl Shared {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Get the current session mode.
    pub fn mode(&self) -> Mode {
        self.mode.load(Ordering::SeqCst).into()
    }

    /// Advance the session mode.
    ///
    /// A promotion below the current mode is a no-op. Returns the mode in
    /// effect after the call.
    pub fn promote(&self, mode: Mode) -> Mode {
        let prev = self.mode.fetch_max(mode as u8, Ordering::SeqCst);
        Mode::from(prev.max(mode as u8))
    }

    /// Get whether the quit latch is set.
    pub fn quit(&self) -> bool {
        self.quit.load(Ordering::SeqCst)
    }

    /// Latch quit. The latch is never cleared.
    pub fn latch_quit(&self) {
        self.quit.store(true, Ordering::SeqCst);
    }
}

/// Per-run session value owned by the orchestrator.
#[derive(Clone, Debug)]
pub struct Session {
    /// Fields visible to the hotplug observer
    pub shared: Arc<Shared>,
    /// Skip signature substitution (`-c`)
    pub custom: bool,
    /// Log verbosity; at [Verbosity::Debug] re-signed images are also
    /// written to the working directory
    pub verbosity: Verbosity,
    /// Restrict device discovery to this 40-hex identifier (`-u`)
    pub uuid: Option<String>,
}

impl Session {
    pub fn new(custom: bool, verbosity: Verbosity, uuid: Option<String>) -> Self {
        Self {
            shared: Shared::new(),
            custom,
            verbosity,
            uuid,
        }
    }

    /// Gets whether re-signed images should also be dumped to the CWD.
    pub fn dump_images(&self) -> bool {
        self.verbosity >= Verbosity::Debug
    }
}
