use log::{error, info, warn};

use relay_chat::{server, Config, Relay};

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    let relay = Relay::new(config.relay.clone());
    let routes = server::routes(relay.clone(), config.static_dir.clone());

    let tls = config.tls.as_ref().and_then(|tls| match tls.validate() {
        Ok(()) => Some(tls),
        Err(e) => {
            warn!("{}, falling back to HTTP/WS", e);
            None
        }
    });

    match tls {
        Some(tls) => {
            // warp's TLS server has no try_bind and panics on a bind error.
            if let Err(e) = std::net::TcpListener::bind(config.bind_addr) {
                error!("Failed to bind to {}: {}", config.bind_addr, e);
                std::process::exit(1);
            }
            let (addr, serving) = warp::serve(routes)
                .tls()
                .cert_path(&tls.cert_path)
                .key_path(&tls.key_path)
                .bind_with_graceful_shutdown(config.bind_addr, shutdown_signal());
            info!("Relay listening on wss://{}/ws", addr);
            serving.await;
        }
        None => {
            match warp::serve(routes).try_bind_with_graceful_shutdown(config.bind_addr, shutdown_signal()) {
                Ok((addr, serving)) => {
                    info!("Relay listening on ws://{}/ws", addr);
                    serving.await;
                }
                Err(e) => {
                    error!("Failed to bind to {}: {}", config.bind_addr, e);
                    std::process::exit(1);
                }
            }
        }
    }

    relay.shutdown().await;
}
