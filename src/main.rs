use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::error;

use ipswrestore::{
    logging::{self, Verbosity},
    pipeline,
    recovery::StdinCheckpoint,
    session::Session,
    tss::TssClient,
    usb::UsbBackend,
    Error,
};

#[derive(Debug, Parser)]
#[command(name = "ipswrestore", about = "Restore a device from an IPSW firmware bundle")]
struct Cli {
    /// Increase log verbosity (repeatable)
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    verbose: u8,

    /// Maximum log verbosity; also dumps re-signed images to the CWD
    #[arg(short = 'd')]
    debug: bool,

    /// Restore a pre-signed bundle without signature substitution
    #[arg(short = 'c')]
    custom: bool,

    /// Target the device with this 40-character identifier
    #[arg(short = 'u', value_name = "UUID")]
    uuid: Option<String>,

    /// Firmware bundle to restore
    #[arg(value_name = "FILE")]
    file: PathBuf,
}

fn run(cli: Cli) -> Result<(), Error> {
    let verbosity = if cli.debug {
        Verbosity::Debug
    } else {
        Verbosity::from(cli.verbose)
    };
    logging::init(verbosity);

    if let Some(uuid) = cli.uuid.as_deref() {
        if uuid.len() != 40 || !uuid.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::Usage(format!(
                "device identifier must be 40 hex characters, got {uuid:?}"
            )));
        }
    }

    let session = Session::new(cli.custom, verbosity, cli.uuid);
    let backend = UsbBackend::new(session.shared.clone());
    let authority = TssClient::new()?;
    let workdir = std::env::current_dir()?;

    pipeline::run(
        &cli.file,
        &workdir,
        &session,
        &backend,
        &authority,
        &mut StdinCheckpoint,
    )
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("ERROR: {err}");
            ExitCode::FAILURE
        }
    }
}
