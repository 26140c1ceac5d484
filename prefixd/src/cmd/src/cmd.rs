use clap::{Parser, Subcommand, ValueEnum};

use prefixd_kubernetes::controller::{config::Config, error::Error, server};
use prefixd_trace::init::TraceConfig;

use crate::controller::ControllerCmd;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cmd {
    #[arg(
        short,
        long,
        global = true,
        required = false,
        default_value = "info",
        help = "Log level(trace, debug, info, warn, error)"
    )]
    pub level: String,

    #[arg(
        value_enum,
        short = 'd',
        long,
        global = true,
        required = false,
        default_value = "plain",
        help = "Log display format"
    )]
    pub format: Format,

    #[arg(short = 'o', long = "log-file", help = "Log output file path")]
    pub log_file: Option<String>,

    #[clap(subcommand)]
    pub sub: SubCmd,
}

#[derive(Debug, Clone, Parser, ValueEnum)]
pub enum Format {
    Plain,
    Json,
}

impl std::fmt::Display for Format {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Format::Plain => write!(f, "plain"),
            Format::Json => write!(f, "json"),
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
pub enum SubCmd {
    Controller(ControllerCmd),
    Version,
}

pub fn run() -> Result<(), Error> {
    let command = Cmd::parse();

    match command.sub {
        SubCmd::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        SubCmd::Controller(c) => {
            let trace_conf = TraceConfig {
                level: command.level,
                format: command.format.to_string(),
                file: command.log_file,
            };
            let mut config = match c.file.as_deref() {
                None => Config::default(),
                Some(file) => Config::load(file)?,
            };
            c.apply(&mut config);

            server::start(config, trace_conf)
        }
    }
}
