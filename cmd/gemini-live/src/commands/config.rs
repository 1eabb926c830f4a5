//! Configuration management commands.

use clap::{Args, Subcommand};

use super::{get_config, print_success};
use crate::Cli;
use crate::config::{Context, mask_api_key};

/// Manage CLI configuration.
///
/// Contexts allow you to manage multiple API configurations,
/// similar to kubectl's context management.
///
/// Configuration is stored in ~/.giztoy/gemini-live/config.yaml
#[derive(Args)]
pub struct ConfigCommand {
    #[command(subcommand)]
    command: ConfigSubcommand,
}

#[derive(Subcommand)]
enum ConfigSubcommand {
    /// Add a new context
    #[command(name = "add-context")]
    AddContext {
        /// Context name
        name: String,
        /// API key (required)
        #[arg(long)]
        api_key: String,
        /// Websocket URL
        #[arg(long)]
        base_url: Option<String>,
        /// Default model
        #[arg(long)]
        model: Option<String>,
        /// Default voice
        #[arg(long)]
        voice: Option<String>,
    },
    /// Delete a context
    #[command(name = "delete-context")]
    DeleteContext {
        /// Context name
        name: String,
    },
    /// Set the current context
    #[command(name = "use-context")]
    UseContext {
        /// Context name
        name: String,
    },
    /// List all contexts
    #[command(name = "list-contexts", alias = "get-contexts")]
    ListContexts,
}

impl ConfigCommand {
    pub async fn run(&self, cli: &Cli) -> anyhow::Result<()> {
        let mut cfg = get_config(cli)?;

        match &self.command {
            ConfigSubcommand::AddContext {
                name,
                api_key,
                base_url,
                model,
                voice,
            } => {
                let ctx = Context {
                    api_key: api_key.clone(),
                    base_url: base_url.clone().unwrap_or_default(),
                    model: model.clone().unwrap_or_default(),
                    voice: voice.clone().unwrap_or_default(),
                    ..Default::default()
                };
                cfg.add_context(name, ctx)?;
                print_success(&format!("Context \"{}\" added successfully", name));
            }

            ConfigSubcommand::DeleteContext { name } => {
                cfg.delete_context(name)?;
                print_success(&format!("Context \"{}\" deleted", name));
            }

            ConfigSubcommand::UseContext { name } => {
                cfg.use_context(name)?;
                print_success(&format!("Switched to context \"{}\"", name));
            }

            ConfigSubcommand::ListContexts => {
                if cfg.contexts.is_empty() {
                    println!("No contexts configured");
                    return Ok(());
                }

                println!(
                    "{:<8} {:<20} {:<24} {:<30} {}",
                    "CURRENT", "NAME", "API_KEY", "MODEL", "BASE_URL"
                );
                for name in cfg.context_names() {
                    let Some(ctx) = cfg.contexts.get(name) else {
                        continue;
                    };
                    let current = if name == cfg.current_context { "*" } else { "" };
                    let model = if ctx.model.is_empty() {
                        "(default)"
                    } else {
                        &ctx.model
                    };
                    let base_url = if ctx.base_url.is_empty() {
                        "(default)"
                    } else {
                        &ctx.base_url
                    };
                    println!(
                        "{:<8} {:<20} {:<24} {:<30} {}",
                        current,
                        name,
                        mask_api_key(&ctx.api_key),
                        model,
                        base_url
                    );
                }
            }
        }
        Ok(())
    }
}
