#[global_allocator]
#[cfg(not(feature = "system_allocator"))]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use flatwire::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load()?;
    simple_logger::init_with_level(config.log_level.as_level())?;

    let rpc = flatwire::server_main(config).await?;

    tokio::signal::ctrl_c().await?;
    rpc.shutdown();

    Ok(())
}
