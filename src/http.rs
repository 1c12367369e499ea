use actix_web::{
    dev::Payload, error::ResponseError, http::StatusCode, web::Bytes, FromRequest, HttpRequest,
};
use futures::future::{FutureExt, LocalBoxFuture};

/// JSON webhook payload. Take it as `Result<Webhook<T>, WebhookError>` to
/// handle failures in the handler instead of answering with an error status.
#[derive(Debug, Clone)]
pub struct Webhook<T>(pub T);

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("failed reading request data: {0}")]
    Body(actix_web::Error),
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<actix_web::Error> for WebhookError {
    fn from(err: actix_web::Error) -> Self {
        Self::Body(err)
    }
}

impl ResponseError for WebhookError {
    fn status_code(&self) -> StatusCode {
        match self {
            WebhookError::Body(err) => err.as_response_error().status_code(),
            WebhookError::Json(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl<T> FromRequest for Webhook<T>
where
    T: serde::de::DeserializeOwned,
{
    type Error = WebhookError;
    type Future = LocalBoxFuture<'static, Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, payload: &mut Payload) -> Self::Future {
        Bytes::from_request(req, payload)
            .map(|bytes| -> Result<Self, Self::Error> {
                let bytes = bytes?;
                Ok(Self(serde_json::from_slice(&bytes)?))
            })
            .boxed_local()
    }
}
