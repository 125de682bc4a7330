//! TCP accept loops.

use crate::broker::Session;
use anyhow::{Context, Result};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

/// A plain-TCP MQTT listener. Each accepted connection is wrapped in a
/// [`Session`] and handed to the session handler in its own task.
pub struct Server {
    listener: TcpListener,
    idle_timeout: Duration,
}

impl Server {
    pub async fn bind(addr: &str, idle_timeout: Duration) -> Result<Self> {
        let addr = normalize_bind(addr);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("unable to bind {}", addr))?;
        Ok(Self {
            listener,
            idle_timeout,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the process ends. Accept errors are logged
    /// and the loop continues.
    pub async fn run<H, Fut>(self, handler: H)
    where
        H: Fn(Arc<Session>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if let Ok(addr) = self.listener.local_addr() {
            tracing::info!(%addr, "listening");
        }
        loop {
            match self.listener.accept().await {
                Ok((stream, _)) => {
                    let session = Arc::new(Session::new(stream, self.idle_timeout));
                    tokio::spawn(handler(session));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                }
            }
        }
    }
}

/// Accept `:1883`-style bind addresses by defaulting the host.
fn normalize_bind(addr: &str) -> String {
    if let Some(rest) = addr.strip_prefix(':') {
        format!("0.0.0.0:{rest}")
    } else {
        addr.to_string()
    }
}
