//! Request handlers.

pub mod auth;

use std::future::Future;

use bastion_core::auth::AuthError;

/// Run `fut` on its own task and wait for it. A client disconnect drops this
/// future but not the spawned task, so state changes finish either way.
pub(crate) async fn run_detached<T, F>(fut: F) -> Result<T, AuthError>
where
    F: Future<Output = Result<T, AuthError>> + Send + 'static,
    T: Send + 'static,
{
    tokio::spawn(fut)
        .await
        .map_err(|e| AuthError::Internal(format!("handler task failed: {e}")))?
}
