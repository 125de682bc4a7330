//! Telemetry handlers.
//!
//! Every handler is an in-process broker subscriber that reacts to device
//! lifecycle events and `pylon/…` telemetry, updates the formation store,
//! and emits derived state on `matriarch/…` topics.

pub mod device_info;
pub mod exception;
pub mod ota;
pub mod ping;
pub mod sentry;
pub mod stations;
pub mod up;

use crate::broker::Broker;
use crate::external::{AuditSink, CrashReporter};
use crate::handlers::stations::OuiDb;
use crate::store::FormationStore;
use std::sync::Arc;

/// Everything a handler might need at registration time.
pub struct HandlerContext {
    pub broker: Arc<Broker>,
    pub store: Arc<FormationStore>,
    pub audit: Arc<dyn AuditSink>,
    pub crash: Option<Arc<dyn CrashReporter>>,
    pub oui: Arc<OuiDb>,
}

/// Register every handler. Delivery within one publish follows registration
/// order, so `device_info` runs before handlers that read the stored OS
/// descriptor.
pub async fn register_all(ctx: &HandlerContext) {
    device_info::register(ctx).await;
    exception::register(ctx).await;
    ota::register(ctx).await;
    ping::register(ctx).await;
    up::register(ctx).await;
    sentry::register(ctx).await;
    stations::register(ctx).await;
}

/// Round half-up at the given decimal precision.
pub fn round(x: f64, precision: i32) -> f64 {
    let factor = 10f64.powi(precision);
    (x * factor + 0.5).floor() / factor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_half_up() {
        assert_eq!(round(0.333, 2), 0.33);
        assert_eq!(round(0.335, 2), 0.34);
        assert_eq!(round(1.5, 0), 2.0);
        assert_eq!(round(0.5, 0), 1.0);
        assert_eq!(round(17395.636, 0), 17396.0);
    }
}
