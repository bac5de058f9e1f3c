// Agent hub daemon entry point.
//
// Routes filesystem-mailbox messages between coding-agent sessions and
// keeps the backing hub server alive. Configuration comes from environment
// variables layered over ~/.config/agent-hub-daemon/config.json.

use anyhow::Result;

use agent_hub_daemon::config::HubConfig;
use agent_hub_daemon::daemon;
use agent_hub_daemon::error::HubError;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = HubConfig::from_env();
    match daemon::run(config).await {
        Ok(()) => Ok(()),
        Err(e @ (HubError::Precondition(_) | HubError::InvalidConfig(_))) => {
            log::error!("{e}");
            std::process::exit(1);
        }
        Err(e) => Err(e.into()),
    }
}
