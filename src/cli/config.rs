//! CLI configuration module
//!
//! Turns command-line flags into a configuration layer and resolves the
//! client configuration.

use crate::cli::args::CliArgs;
use crate::config::{ClientConfig, ConfigOverrides};
use crate::error::Result;

/// Configuration layer holding the values given on the command line
pub fn overrides_from_args(args: &CliArgs) -> ConfigOverrides {
    ConfigOverrides {
        server_url: args.server_url.clone(),
        api_key: args.api_key.clone(),
        max_retry: args.max_retry,
        log_level: args.log_level().map(|level| level.to_string()),
        ..ConfigOverrides::default()
    }
}

/// Resolve the client configuration for a CLI run
pub fn load_config(args: &CliArgs) -> Result<ClientConfig> {
    let config = ClientConfig::load(args.conf.as_ref(), &overrides_from_args(args))?;
    config.validate()?;
    Ok(config)
}
