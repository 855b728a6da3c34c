use clap::Parser;
use papertrader::cli::{run, Cli};

fn main() -> std::process::ExitCode {
    run(Cli::parse())
}
