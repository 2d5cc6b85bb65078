use clap::{Args, Subcommand};
use std::fs;
use std::io::Write;
use std::path::PathBuf;

use super::OutputFormat;
use crate::config::{Config, ConfigValue};

#[derive(Args)]
pub struct ConfigCommand {
    #[command(subcommand)]
    pub command: ConfigSubcommand,
}

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Show current configuration values
    Show {
        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Initialize configuration file
    Init,
}

const CONFIG_TEMPLATE: &str = r#"# smartmarks configuration

# Hosted project URL
# server_url: https://your-project.example.co

# Public API key of the project
# anon_key: ...

# Access token and id of the signed-in user
# access_token: ...
# user_id: ...

# Seconds before a request to the hosted service is abandoned
# request_timeout_secs: 10
"#;

impl ConfigCommand {
    pub fn run(
        &self,
        config: &Config,
        cli_config_path: Option<PathBuf>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        match &self.command {
            ConfigSubcommand::Show { format } => {
                let config = config.redacted();
                match format {
                    OutputFormat::Json => {
                        println!("{}", serde_json::to_string_pretty(&config)?);
                    }
                    OutputFormat::Text => {
                        println!("Configuration");
                        println!("=============\n");

                        if let Some(path) = &config.config_file {
                            println!("Config file: {}", path.display());
                        } else {
                            println!(
                                "Config file: {} (not found)",
                                cli_config_path
                                    .unwrap_or_else(Config::default_config_path)
                                    .display()
                            );
                        }
                        println!();

                        print_optional("server_url", &config.server_url);
                        print_optional("anon_key", &config.anon_key);
                        print_optional("access_token", &config.access_token);
                        print_optional("user_id", &config.user_id);

                        println!(
                            "request_timeout_secs: {}",
                            config.request_timeout_secs.value
                        );
                        println!("  source: {}", config.request_timeout_secs.source);
                    }
                }
                Ok(())
            }

            ConfigSubcommand::Init => {
                let config_path = cli_config_path.unwrap_or_else(Config::default_config_path);

                // Check if config already exists
                if config_path.exists() {
                    println!("Config file already exists: {}", config_path.display());
                    println!("Use 'marks config show' to view current configuration.");
                    return Ok(());
                }

                // Create parent directory
                if let Some(parent) = config_path.parent() {
                    fs::create_dir_all(parent)?;
                }

                let mut file = fs::File::create(&config_path)?;
                file.write_all(CONFIG_TEMPLATE.as_bytes())?;

                println!("Created config file: {}", config_path.display());
                println!("\nEdit this file to customize your settings.");
                Ok(())
            }
        }
    }
}

fn print_optional(name: &str, value: &ConfigValue<Option<String>>) {
    println!("{}: {}", name, value.value.as_deref().unwrap_or("(not set)"));
    println!("  source: {}", value.source);
    println!();
}
