use std::sync::Arc;

use actix::{prelude::SendError, Recipient};
use actix_web::{web, HttpRequest};

use crate::{
    config::RestartTarget,
    github::PushEvent,
    http::{Webhook, WebhookError},
    runner::Task,
};

#[derive(Debug, Clone)]
pub struct Settings {
    pub targets: Vec<RestartTarget>,
}

/// Queues a restart of every target and greets the caller.
///
/// The answer doesn't depend on the payload: failures are only logged.
pub async fn push_hook(
    req: HttpRequest,
    hook: Result<Webhook<PushEvent>, WebhookError>,
    settings: web::Data<Settings>,
    restarter: web::Data<Recipient<Task>>,
) -> String {
    let path = urlencoding::decode_binary(req.path().as_bytes());
    let greeting = format!(
        "Hello, {}!",
        String::from_utf8_lossy(path.get(1..).unwrap_or_default())
    );

    let event = match hook {
        Ok(Webhook(event)) => Arc::new(event),
        Err(WebhookError::Body(err)) => {
            tracing::error!("Failed reading webhook body: {}", err);
            return greeting;
        }
        Err(err) => {
            tracing::error!("Failed parsing push event: {}", err);
            return greeting;
        }
    };

    for target in &settings.targets {
        let task = Task {
            target: target.clone(),
            event: event.clone(),
        };
        match restarter.try_send(task) {
            Ok(()) => tracing::debug!("Queued restart of {}", target),
            Err(SendError::Full(_)) => {
                tracing::warn!("Restart queue is full, dropping restart of {}", target)
            }
            Err(SendError::Closed(_)) => {
                tracing::error!("Restart workers are gone, can't restart {}", target)
            }
        }
    }

    greeting
}
