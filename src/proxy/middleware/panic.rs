use axum::{extract::Request, middleware::Next, response::Response};
use futures::FutureExt;

use crate::proxy::handlers::errors::{to_client_error, ErrorKind};

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// A handler panic must not tear down the connection task; it is logged with
/// context and the client gets a generic internal_error.
pub async fn catch_panic_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    match std::panic::AssertUnwindSafe(next.run(request))
        .catch_unwind()
        .await
    {
        Ok(response) => response,
        Err(payload) => {
            tracing::error!(
                "[Panic] Handler panicked on {} {}: {}",
                method,
                path,
                panic_message(payload)
            );
            to_client_error(ErrorKind::InternalError, "Internal server error")
        }
    }
}
