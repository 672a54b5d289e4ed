use clap::Parser;
use intensity_relay::{ConfigError, StreamError};

mod cli;
mod commands;
mod exit_codes;

use cli::Cli;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(log_level)
        .parse_default_env()
        .format_timestamp(None)
        .init();

    let result = match cli.command {
        cli::Command::Run(args) => commands::run::execute(args).await,
        cli::Command::Ports(args) => commands::ports::execute(args),
        cli::Command::ToneServer(args) => commands::tone_server::execute(args).await,
    };

    let exit_code = match result {
        Ok(()) => exit_codes::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            exit_code_for(&e)
        }
    };

    std::process::exit(exit_code);
}

fn exit_code_for(error: &anyhow::Error) -> i32 {
    if error.downcast_ref::<ConfigError>().is_some() {
        return exit_codes::INPUT_ERROR;
    }
    match error.downcast_ref::<StreamError>() {
        Some(StreamError::InvalidConfig(_)) => exit_codes::INPUT_ERROR,
        Some(StreamError::SourceUnavailable(_)) | Some(StreamError::SinkUnavailable(_)) => {
            exit_codes::SOURCE_UNAVAILABLE
        }
        _ => exit_codes::EXECUTION_ERROR,
    }
}
