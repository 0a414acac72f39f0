//! `distillery config` — Print the default configuration.

use distillery_config::AppConfig;

pub fn print_default() {
    println!("# Save as {}", AppConfig::config_dir().join("config.toml").display());
    print!("{}", AppConfig::default_toml());
}
