use std::path::Path;

use colored::Colorize;

use crate::cloud::mask_key;
use crate::config;
use crate::directory::JumpServerClient;
use crate::retry::RetryPolicy;

/// Validate the config and try one signed JumpServer request.
/// Returns 0 when both pass, 1 otherwise.
pub fn run(config_path: Option<&Path>) -> anyhow::Result<i32> {
    println!("{}", "jms-sync check".bold());

    let (path, cfg) = match config::load(config_path) {
        Ok(loaded) => loaded,
        Err(e) => {
            println!("  config:     {}", "not loaded".red());
            println!("  error:      {e}");
            return Ok(1);
        }
    };
    println!("  config:     {}", path.display());

    if let Err(e) = cfg.validate() {
        println!("  validation: {}", "failed".red());
        for line in e.to_string().lines().skip(1) {
            println!("             {}", line.trim());
        }
        return Ok(1);
    }
    println!("  validation: {}", "ok".green());

    for cloud in cfg.enabled_clouds() {
        println!(
            "  cloud:      {} {} ({} region(s), key {})",
            cloud.provider,
            cloud.name.bold(),
            cloud.regions.len(),
            mask_key(&cloud.access_key_id)
        );
    }
    if cfg.dingtalk_settings().is_some() {
        println!("  dingtalk:   {}", "enabled".green());
    }

    let settings = cfg.jumpserver_settings()?;
    let client = JumpServerClient::new(&settings, RetryPolicy::none())?;
    let runtime = tokio::runtime::Runtime::new()?;
    match runtime.block_on(client.check_connectivity()) {
        Ok(()) => {
            println!("  jumpserver: {} {}", "reachable".green(), settings.url);
            Ok(0)
        }
        Err(e) => {
            println!("  jumpserver: {} {}", "unreachable".red(), settings.url);
            println!("  error:      {e}");
            if e.is_auth() {
                println!("  hint:       check access_key_id, access_key_secret and org_id");
            }
            Ok(1)
        }
    }
}
