use std::process::ExitCode;

use clap::Parser;

fn main() -> ExitCode {
    let cli = palimpsest_cli::Cli::parse();
    palimpsest_cli::init_logging(cli.verbose());
    match palimpsest_cli::run_cli(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let envelope = palimpsest_cli::error_envelope(&err);
            println!(
                "{}",
                serde_json::to_string_pretty(&envelope).unwrap_or_else(|_| envelope.to_string())
            );
            ExitCode::FAILURE
        }
    }
}
