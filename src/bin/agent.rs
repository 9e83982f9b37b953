use color_eyre::eyre::{eyre, Report};
use tracing_subscriber::EnvFilter;
use vigil_agent::Agent;

fn get_config_file_arg() -> Option<String> {
    let mut args = std::env::args().take(3).skip(1);
    let flag = args.next()?;
    if flag != "-c" {
        return None;
    }
    args.next()
}

fn main() -> Result<(), Report> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap();

    let cfg_file =
        get_config_file_arg().ok_or_else(|| eyre!("Usage: agent -c <config_file.toml>"))?;
    let cfg = vigil_agent::parse_config(cfg_file)?;
    rt.block_on(async move {
        let agent = Agent::start(cfg)?;
        tokio::signal::ctrl_c().await?;
        tracing::info!("shutting down");
        agent.shutdown();
        Ok::<_, Report>(())
    })?;
    Ok(())
}
