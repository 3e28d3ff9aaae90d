use agentdeck::config::Config;
use agentdeck::core::Broker;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::from_env();
    let addr = config.listen_addr;
    log::info!(
        "agentdeck starting: cli={}, max_sessions={}, marker_dir={}",
        config.cli,
        config.max_sessions,
        config.marker_dir.display()
    );

    let broker = Broker::new(config);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .unwrap_or_else(|e| panic!("cannot bind {addr}: {e}"));
    log::info!("listening on http://{addr} (terminal channel at /ws)");

    if let Err(e) = agentdeck::server::serve(broker, listener).await {
        log::error!("server error: {e}");
        std::process::exit(1);
    }
}
