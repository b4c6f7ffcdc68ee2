//! Validates parsed command-line arguments and converts them into the
//! structured configuration the core library consumes.

use crate::parser::Cli;
use anyhow::{Context, Result};
use supervisor_core::{canonicalize_lenient, GrainConfig, UserError};

fn valid_name(name: &str) -> bool {
    !name.is_empty() && !name.contains('/')
}

/// Translates the parsed `Cli` arguments into a validated [`GrainConfig`].
pub fn adapt_and_validate(cli: Cli) -> Result<GrainConfig> {
    if !valid_name(&cli.app_name) {
        return Err(UserError::InvalidAppName.into());
    }
    if !valid_name(&cli.grain_id) {
        return Err(UserError::InvalidGrainId.into());
    }

    for var in &cli.env {
        if !var.contains('=') {
            return Err(UserError::InvalidEnvVar(var.clone()).into());
        }
    }

    if cli.grain.mount_proc {
        tracing::warn!("--proc is dangerous. Only use it when debugging code you trust.");
    }
    if cli.grain.dev_mode {
        tracing::warn!("--dev is dangerous. Only use it when debugging code you trust.");
    }

    // Resolve user-supplied paths even when the target does not exist yet;
    // a --new grain's var directory is created later in setup.
    let pkg_path = cli
        .pkg
        .map(|p| canonicalize_lenient(&p))
        .transpose()
        .context("failed to resolve --pkg path")?;
    let var_path = cli
        .var
        .map(|p| canonicalize_lenient(&p))
        .transpose()
        .context("failed to resolve --var path")?;

    Ok(GrainConfig {
        app_name: cli.app_name,
        grain_id: cli.grain_id,
        pkg_path,
        var_path,
        env: cli.env,
        command: cli.command,
        options: cli.grain,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn parse(args: &[&str]) -> Cli {
        Cli::parse_from(args)
    }

    #[test]
    fn accepts_a_minimal_invocation() {
        let cli = parse(&["supervise", "acme-app", "grain1", "/bin/true"]);
        let config = adapt_and_validate(cli).unwrap();
        assert_eq!(config.app_name, "acme-app");
        assert_eq!(config.grain_id, "grain1");
        assert_eq!(config.command, vec!["/bin/true"]);
        assert!(config.pkg_path.is_none());
        assert!(!config.options.is_new);
    }

    #[test]
    fn rejects_app_name_with_slash() {
        let cli = parse(&["supervise", "evil/app", "grain1", "/bin/true"]);
        let err = adapt_and_validate(cli).unwrap_err();
        assert_eq!(err.to_string(), "Invalid app name.");
    }

    #[test]
    fn rejects_grain_id_with_slash() {
        let cli = parse(&["supervise", "app", "../grain", "/bin/true"]);
        let err = adapt_and_validate(cli).unwrap_err();
        assert_eq!(err.to_string(), "Invalid grain id.");
    }

    #[test]
    fn rejects_env_without_equals() {
        let cli = parse(&["supervise", "-e", "BROKEN", "app", "grain1", "/bin/true"]);
        let err = adapt_and_validate(cli).unwrap_err();
        assert!(err.to_string().contains("BROKEN"));
    }

    #[test]
    fn collects_repeated_env_in_order() {
        let cli = parse(&[
            "supervise", "-e", "A=1", "--env", "B=2", "app", "grain1", "/bin/app",
        ]);
        let config = adapt_and_validate(cli).unwrap();
        assert_eq!(config.env, vec!["A=1", "B=2"]);
    }

    #[test]
    fn command_keeps_flag_like_arguments() {
        let cli = parse(&["supervise", "app", "grain1", "/bin/app", "--port", "80"]);
        let config = adapt_and_validate(cli).unwrap();
        assert_eq!(config.command, vec!["/bin/app", "--port", "80"]);
    }
}
