//! Utility functions for CLI commands.

use giztoy_gemini_live::Client;
use tracing::debug;

use crate::Cli;
use crate::config::{Config, Context};

/// Gets the global configuration.
pub fn get_config(cli: &Cli) -> anyhow::Result<Config> {
    Config::load(cli.config.as_deref())
}

/// Gets the context to use, if any is configured.
///
/// An explicit `-c` that names no context is an error.
pub fn get_context(cli: &Cli) -> anyhow::Result<Option<Context>> {
    let cfg = get_config(cli)?;
    match (cfg.resolve_context(cli.context.as_deref()), cli.context.as_deref()) {
        (Some(ctx), _) => Ok(Some(ctx.clone())),
        (None, Some(name)) => anyhow::bail!("context '{}' not found", name),
        (None, None) => Ok(None),
    }
}

/// Creates a client from a context, or from the environment when no
/// context is configured.
pub fn create_client(ctx: Option<&Context>) -> anyhow::Result<Client> {
    let Some(ctx) = ctx else {
        return Client::from_env().map_err(|e| {
            anyhow::anyhow!(
                "{}. Add a context with 'gemini-live config add-context' or set GEMINI_API_KEY",
                e
            )
        });
    };

    debug!(context = %ctx.name, "using context");
    let mut builder = Client::builder(&ctx.api_key);
    if !ctx.base_url.is_empty() {
        builder = builder.websocket_url(&ctx.base_url);
    }
    Ok(builder.build()?)
}

/// Prints verbose output if enabled.
pub fn print_verbose(cli: &Cli, msg: &str) {
    if cli.verbose {
        eprintln!("[verbose] {}", msg);
    }
}

/// Prints success message.
pub fn print_success(msg: &str) {
    eprintln!("\x1b[32m✓\x1b[0m {}", msg);
}

/// Prints warning message.
pub fn print_warning(msg: &str) {
    eprintln!("\x1b[33m⚠\x1b[0m {}", msg);
}
