use anyhow::{bail, Context as _, Result};

use crate::core::config::AppConfig;

pub fn init() -> Result<()> {
    let path = AppConfig::config_path();
    if path.exists() {
        eprintln!("Config file already exists at {}", path.display());
        eprintln!("Remove it first if you want to regenerate.");
        return Ok(());
    }

    let path = AppConfig::default()
        .save()
        .context("Failed to generate config")?;
    println!("Generated config at {}", path.display());
    Ok(())
}

pub fn check() -> Result<()> {
    let path = AppConfig::config_path();
    if !path.exists() {
        eprintln!("No config file found at {}", path.display());
        eprintln!("Run `qbar config init` to create one.");
        return Ok(());
    }

    let config = AppConfig::load().with_context(|| format!("Failed to load {}", path.display()))?;
    let issues = config.validate();
    if issues.is_empty() {
        println!("Config is valid: {}", path.display());
        return Ok(());
    }

    eprintln!("Config issues found in {}:", path.display());
    for issue in &issues {
        eprintln!("  - {}", issue);
    }
    bail!("{} config issue(s)", issues.len())
}
