use ferrous_upstream_domain::{CliOverrides, Config};
use tracing::info;

pub fn load_config(
    config_path: Option<&str>,
    cli_overrides: CliOverrides,
) -> anyhow::Result<Config> {
    let config = Config::load(config_path, cli_overrides)?;
    config.validate()?;

    info!(
        config_file = config_path.unwrap_or("default"),
        upstream = %config.upstream.addr,
        protocol = %config.upstream.protocol,
        max_conns = config.upstream.max_conns,
        idle_timeout_ms = config.upstream.idle_timeout_ms,
        "Configuration loaded"
    );

    Ok(config)
}
