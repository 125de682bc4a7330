//! Runtime orchestration: wires the broker, the store, the external
//! clients, and the two listeners.

use crate::broker::Broker;
use crate::config::Config;
use crate::external::{
    AuditSink, Bugsnag, CrashReporter, DeviceMetadata, HttpAuditSink, Liberator, LogAuditSink,
};
use crate::gateway::DeviceGateway;
use crate::handlers::stations::OuiDb;
use crate::handlers::{self, HandlerContext};
use crate::net::Server;
use crate::store::FormationStore;
use anyhow::Result;
use std::sync::Arc;

pub struct Runtime {
    config: Config,
    broker: Arc<Broker>,
    store: Arc<FormationStore>,
}

impl Runtime {
    pub fn new(config: Config) -> Result<Self> {
        let broker = Arc::new(Broker::new(config.slash_prefix_topics));
        let store = Arc::new(FormationStore::new());
        Ok(Self {
            config,
            broker,
            store,
        })
    }

    pub async fn run(self) -> Result<()> {
        let metadata: Arc<dyn DeviceMetadata> = Arc::new(Liberator::new(
            self.config.liberator_base_url.clone(),
            self.config.liberator_jwt_token.clone(),
        ));

        let audit: Arc<dyn AuditSink> = match &self.config.audit_sink_url {
            Some(url) => Arc::new(HttpAuditSink::new(
                url.clone(),
                self.config.sentry_dynamodb_table.clone(),
            )),
            None => Arc::new(LogAuditSink),
        };

        let crash: Option<Arc<dyn CrashReporter>> = self
            .config
            .bugsnag_key
            .as_ref()
            .map(|key| {
                Arc::new(Bugsnag::new(key.clone(), self.config.environment.clone()))
                    as Arc<dyn CrashReporter>
            });

        let oui = Arc::new(OuiDb::load_or_empty(&self.config.oui_db_path));

        let ctx = HandlerContext {
            broker: self.broker.clone(),
            store: self.store.clone(),
            audit,
            crash,
            oui,
        };
        handlers::register_all(&ctx).await;

        let gateway = Arc::new(DeviceGateway::new(
            self.broker.clone(),
            self.store.clone(),
            metadata,
        ));

        let idle = self.config.idle_connection_timeout;
        let devices = Server::bind(&self.config.devices_bind, idle).await?;
        let control = Server::bind(&self.config.control_bind, idle).await?;

        tokio::spawn(devices.run(move |session| {
            let gateway = gateway.clone();
            async move { gateway.handle_connection(session).await }
        }));

        let broker = self.broker.clone();
        tokio::spawn(control.run(move |session| {
            let broker = broker.clone();
            async move { broker.handle_connection(session).await }
        }));

        tokio::signal::ctrl_c().await?;
        tracing::info!("shutting down");
        Ok(())
    }
}
