//! stackctl - dependency-ordered infrastructure stacks

use std::process::ExitCode;

fn main() -> ExitCode {
    if let Err(e) = stackctl::cli::run() {
        eprintln!("Error: {:#}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
