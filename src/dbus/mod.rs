//! D-Bus control plane

use anyhow::{Context, Result};
use std::sync::Arc;
use zbus::Connection;

use crate::session::Session;

pub mod interface;

pub use interface::CompositorInterface;

/// Claim the service name and serve the compositor object.
///
/// The returned connection keeps serving until dropped.
pub async fn serve(session: Arc<Session>, system: bool) -> Result<Connection> {
    let builder = if system {
        zbus::connection::Builder::system()
    } else {
        zbus::connection::Builder::session()
    }
    .context("Failed to connect to D-Bus")?;

    let conn = builder
        .name(blight_proto::SERVICE)?
        .serve_at(blight_proto::OBJECT_PATH, CompositorInterface::new(session))?
        .build()
        .await
        .with_context(|| format!("Failed to claim {}", blight_proto::SERVICE))?;

    tracing::info!(
        "Serving {} on the {} bus",
        blight_proto::SERVICE,
        if system { "system" } else { "session" }
    );
    Ok(conn)
}
