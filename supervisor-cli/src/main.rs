use anyhow::Result;
use std::{env, process};
use supervisor_cli::runner;
use supervisor_core::UserError;
use tracing_subscriber::EnvFilter;

fn main() {
    // Log to stderr: stdout is reserved for the one-line readiness protocol
    // with whatever launched us.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let args: Vec<String> = env::args().collect();
    let exit_code = match run(args) {
        Ok(code) => code,
        Err(e) => {
            // Configuration mistakes get a bare message; faults get the
            // full error chain.
            if let Some(user_error) = e.downcast_ref::<UserError>() {
                eprintln!("supervise: {user_error}");
            } else {
                eprintln!("supervise: {e:#}");
            }
            1
        }
    };
    process::exit(exit_code);
}

fn run(args: Vec<String>) -> Result<i32> {
    runner::run_clap(args)
}
