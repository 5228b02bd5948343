//! Configuration view and validation commands: `tether config`.

use anyhow::Result;

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: &std::path::Path, command: Option<ConfigCommands>) -> Result<()> {
    use tether::config::{Config, TETHER_DIR, TetherToml};

    let tether_dir = project_dir.join(TETHER_DIR);
    let config_path = tether_dir.join("tether.toml");

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Tether Configuration");
            println!("====================");
            println!();

            let toml = if config_path.exists() {
                println!("Config file: {}", config_path.display());
                TetherToml::load(&config_path)?
            } else {
                println!("No tether.toml found at {}", config_path.display());
                println!("Using default configuration.");
                TetherToml::default()
            };
            println!();

            let provider = &toml.state_provider;
            println!("[state_provider]");
            println!("  type = \"{}\"", provider.provider_type);
            if provider.provider_type.is_remote() {
                println!("  api_key_env = \"{}\"", provider.api_key_var());
            }
            if let Some(repo) = &provider.repository {
                println!("  repository = \"{}\"", repo);
            }
            if let Some(team) = &provider.team_id {
                println!("  team_id = \"{}\"", team);
            }
            println!("  fallback_to_file = {}", provider.fallback_to_file);
            println!("  cache_ttl_seconds = {}", provider.cache_ttl_seconds);
            println!();

            println!("[session]");
            println!("  regression_testing = \"{:?}\"", toml.session.regression_testing);
            println!("  regression_command = \"{}\"", toml.session.regression_command);
            println!("  timeout_minutes = {}", toml.session.timeout_minutes);
            println!();

            println!("[agent]");
            println!("  command = \"{}\"", toml.agent.command);
            println!("  args = {:?}", toml.agent.args);
            println!();

            let execution = &toml.execution;
            println!("[execution]");
            println!("  mode = \"{}\"", execution.mode);
            println!("  turn_interval = {}", execution.checkpoints.turn_interval);
            println!(
                "  approval = {:?} after {} min, channels {:?}",
                execution.approval.default_action,
                execution.approval.timeout_minutes,
                execution.approval.channels
            );
            println!(
                "  limits = {} turns, {} files, {} lines, context {}%/{}%",
                execution.limits.max_turns_per_session,
                execution.limits.max_files_modified,
                execution.limits.max_lines_changed,
                execution.limits.context_warning_percent,
                execution.limits.context_critical_percent
            );
            println!();

            if project_dir.exists() {
                println!("Effective values (with env overrides):");
                let config = Config::load(project_dir, false)?;
                println!("  mode = \"{}\"", config.toml.execution.mode);
                println!("  state_provider.type = \"{}\"", config.toml.state_provider.provider_type);
                println!("  agent command = \"{}\"", config.toml.agent.effective_command());
                println!();
            }
            if !config_path.exists() {
                println!("Run 'tether config init' to create a tether.toml file.");
                println!();
            }
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            let toml = if config_path.exists() {
                TetherToml::load(&config_path)?
            } else {
                println!("No tether.toml found. Checking defaults.");
                TetherToml::default()
            };
            let warnings = toml.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("tether.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            if !tether_dir.exists() {
                std::fs::create_dir_all(&tether_dir)?;
            }

            TetherToml::default().save(&config_path)?;

            println!("Created tether.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [state_provider] type, repository / team_id, api_key_env");
            println!("  - [session] regression_testing, regression_command");
            println!("  - [execution] mode, checkpoints, approval, limits");
            println!();
        }
    }

    Ok(())
}
