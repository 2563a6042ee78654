/// Log verbosity selected on the command line.
///
/// `-v` raises the level one step per occurrence, `-d` jumps straight to
/// [Verbosity::Debug].
#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    #[default]
    Normal = 0,
    Verbose,
    Debug,
}

impl From<u8> for Verbosity {
    fn from(count: u8) -> Self {
        match count {
            0 => Self::Normal,
            1 => Self::Verbose,
            _ => Self::Debug,
        }
    }
}

impl From<Verbosity> for log::LevelFilter {
    fn from(verbosity: Verbosity) -> Self {
        match verbosity {
            Verbosity::Normal => log::LevelFilter::Info,
            Verbosity::Verbose => log::LevelFilter::Debug,
            Verbosity::Debug => log::LevelFilter::Trace,
        }
    }
}

impl From<&Verbosity> for log::LevelFilter {
    fn from(verbosity: &Verbosity) -> Self {
        (*verbosity).into()
    }
}

/// Initialize the process-wide logger at the given verbosity.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init(verbosity: Verbosity) {
    let _ = env_logger::Builder::new()
        .filter_level(verbosity.into())
        .format_timestamp(None)
        .try_init();
}
