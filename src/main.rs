mod config;
mod github;
mod hooks;
mod http;
mod lock_manager;
mod runner;

use std::sync::Arc;

use actix::SyncArbiter;
use actix_web::{middleware::Logger, web, App, HttpServer};
use color_eyre::eyre;

use crate::{
    lock_manager::LockManager,
    runner::{Restarter, Task},
};

#[actix_web::main]
async fn main() -> eyre::Result<()> {
    dotenv::dotenv().ok();
    color_eyre::install()?;
    tracing_log::LogTracer::init()?;
    tracing::subscriber::set_global_default(tracing_subscriber::fmt().finish())?;

    let config::Config {
        bind,
        watched_branch,
        targets,
        parallel_restarts,
        payload_limit,
    } = envy::prefixed("RESTART_HOOK_").from_env()?;

    tracing::info!(
        "Restarting {} target(s) on pushes to {}",
        targets.len(),
        watched_branch,
    );
    for target in &targets {
        tracing::info!("Target: {}", target);
    }

    let lock_manager = Arc::new(LockManager::new());
    let restarter = SyncArbiter::start(parallel_restarts.max(1) as usize, move || {
        Restarter::new(watched_branch.clone(), lock_manager.clone())
    });
    let restarter = web::Data::new(restarter.recipient::<Task>());
    let settings = web::Data::new(hooks::Settings { targets });

    HttpServer::new(move || {
        App::new()
            .app_data(settings.clone())
            .app_data(restarter.clone())
            .app_data(web::PayloadConfig::new(payload_limit))
            .wrap(Logger::default())
            .route("/{tail:.*}", web::to(hooks::push_hook))
    })
    .bind(&bind)?
    .run()
    .await
    .map_err(Into::into)
}
