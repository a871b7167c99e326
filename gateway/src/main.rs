// gateway/src/main.rs
use actix_web::{web, App, HttpServer};
use common::{setup_tracing, Config};
use gateway::apps::{self, GatewayState};
use std::io;

#[actix_web::main]
async fn main() -> io::Result<()> {
    // Load configuration
    let config = Config::from_env().map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
    setup_tracing(config.debug);

    let state = web::Data::new(GatewayState::from_config(&config));
    let sweeper = state.tokens.spawn_sweeper(config.token_sweep_interval());
    let plan = apps::route_plan(&config);

    tracing::info!("Starting gateway on {}", config.listen_addr);
    for route in &plan {
        tracing::info!("Route {} -> {:?}", route.path, route.handler);
    }

    let server = HttpServer::new(move || {
        let state = state.clone();
        let plan = plan.clone();
        App::new().configure(move |cfg| apps::configure(cfg, &plan, state))
    })
    .bind(&config.listen_addr)?
    .run();

    let result = match &config.redirect_addr {
        Some(addr) => {
            tracing::info!("Redirecting plain HTTP on {} to HTTPS", addr);
            let redirect = HttpServer::new(|| App::new().configure(apps::redirector))
                .bind(addr)?
                .run();
            tokio::try_join!(server, redirect).map(|_| ())
        }
        None => server.await,
    };

    sweeper.abort();
    tracing::info!("Gateway stopped");
    result
}
