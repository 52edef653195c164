use anyhow::Result;
use clap::Parser;
use log::LevelFilter;

pub(crate) mod bootstampctl;
pub(crate) mod bootstampd;

use bootstampctl::CtlCommand;
use bootstampd::DCommand;

/// Top-level multicall entrypoint, dispatching on our invoked name.
pub(crate) enum MultiCall {
    Daemon(DCommand),
    Ctl(CtlCommand),
}

impl MultiCall {
    pub(crate) fn from_args(args: Vec<String>) -> Self {
        let argv0 = args.first().map(|s| s.as_str()).unwrap_or_default();
        let name = std::path::Path::new(argv0)
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or_default();
        if name.contains("bootstampctl") {
            MultiCall::Ctl(CtlCommand::parse_from(args))
        } else {
            MultiCall::Daemon(DCommand::parse_from(args))
        }
    }

    pub(crate) fn loglevel(&self) -> LevelFilter {
        match self {
            MultiCall::Daemon(cmd) => cmd.loglevel(),
            MultiCall::Ctl(cmd) => cmd.loglevel(),
        }
    }

    pub(crate) fn run(self) -> Result<()> {
        match self {
            MultiCall::Daemon(cmd) => cmd.run(),
            MultiCall::Ctl(cmd) => cmd.run(),
        }
    }
}
