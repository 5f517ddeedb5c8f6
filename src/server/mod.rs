//! HTTP boundary: task submission, liveness, and the WebSocket relay that
//! forwards status events to observers.

pub mod relay;
pub mod submit;

use std::net::SocketAddr;

use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::Result;

pub use relay::relay_router;
pub use submit::{SubmitResponse, submission_router};

/// Bind `0.0.0.0:port` and serve `app` until `cancel` fires.
pub async fn serve(app: Router, port: u16, cancel: CancellationToken) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    serve_on(listener, app, cancel).await
}

/// Serve `app` on an already-bound listener until `cancel` fires.
pub async fn serve_on(listener: TcpListener, app: Router, cancel: CancellationToken) -> Result<()> {
    info!("listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;
    Ok(())
}
