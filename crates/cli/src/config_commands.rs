use {
    anyhow::{Context, Result},
    clap::Subcommand,
};

use potat_config::PotatConfig;

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Print the effective configuration as TOML.
    Show,
    /// Print the path of the config file in use.
    Path,
}

pub fn handle_config(action: ConfigAction, config: &PotatConfig) -> Result<()> {
    match action {
        ConfigAction::Show => {
            println!("{}", render(config)?);
            Ok(())
        },
        ConfigAction::Path => {
            println!("{}", potat_config::find_or_default_config_path().display());
            Ok(())
        },
    }
}

fn render(config: &PotatConfig) -> Result<String> {
    toml::to_string_pretty(config).context("failed to serialize config")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rendered_config_loads_back() {
        let mut config = PotatConfig::default();
        config.socket.port = 4100;
        config.rate_limit.limit = 7;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("potat.toml");
        std::fs::write(&path, render(&config).unwrap()).unwrap();

        assert_eq!(potat_config::load_config(&path).unwrap(), config);
    }
}
