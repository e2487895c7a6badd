use log::info;
use rpx::{server, threadpool, Config, ProxyContext, SchedulingMode};
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;

const CONF_PATH: &str = "config.yaml";

pub fn main() -> rpx::AsyncResult<()> {
    rpx::init_logging().expect("Can't enable logging");
    let config = if Path::new(CONF_PATH).exists() {
        Config::from_file(CONF_PATH).expect("Error reading config.yaml")
    } else {
        Config::default()
    };
    let ctx = Arc::new(ProxyContext::from_config(&config));
    match config.mode() {
        SchedulingMode::Reactor => {
            let mut runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(async move {
                // Bind a TCP listener
                let listener = TcpListener::bind(config.listen_on().as_str()).await?;
                info!("Listening on {}", config.listen_on());
                server::run(listener, ctx).await
            })
        }
        SchedulingMode::WorkerPool => {
            let listener = std::net::TcpListener::bind(config.listen_on())?;
            info!("Listening on {}", config.listen_on());
            threadpool::run(listener, ctx, config.num_threads())
        }
    }
}
