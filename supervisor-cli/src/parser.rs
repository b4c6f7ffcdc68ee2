//! Command-line argument parser using `clap` derive macros.

use clap::Parser;
use std::path::PathBuf;
use supervisor_core::GrainOptions;

/// Runs a grain supervisor.
#[derive(Parser, Debug)]
#[command(
    name = "supervise",
    version,
    about,
    long_about = "Runs a sandbox supervisor for the grain <grain-id>, which is an instance \
                  of app <app-name>. Executes <command> inside the grain sandbox."
)]
pub struct Cli {
    /// Behavioral switches shared with the core library.
    #[command(flatten)]
    pub grain: GrainOptions,

    /// Set directory containing the app package.
    /// Defaults to '/var/sandstorm/apps/<app-name>'.
    #[arg(long, value_name = "PATH")]
    pub pkg: Option<PathBuf>,

    /// Set directory where the grain's mutable persistent data is stored.
    /// Defaults to '/var/sandstorm/grains/<grain-id>'.
    #[arg(long, value_name = "PATH")]
    pub var: Option<PathBuf>,

    /// Set the environment variable <NAME> to <VAL> inside the sandbox.
    /// Note that *no* environment variables are set by default.
    #[arg(short = 'e', long = "env", value_name = "NAME=VAL", action = clap::ArgAction::Append)]
    pub env: Vec<String>,

    /// Name of the app this grain instantiates.
    #[arg(value_name = "APP_NAME")]
    pub app_name: String,

    /// Id of the grain to run.
    #[arg(value_name = "GRAIN_ID")]
    pub grain_id: String,

    /// The command to run inside the sandbox.
    #[arg(
        required = true,
        trailing_var_arg = true,
        allow_hyphen_values = true,
        value_name = "COMMAND"
    )]
    pub command: Vec<String>,
}
