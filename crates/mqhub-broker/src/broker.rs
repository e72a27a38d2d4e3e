//! Broker composition root.
//!
//! Owns the state shared by every connection:
//! - SubscriptionDirectory: concurrent topic trie
//! - SessionRegistry: client id → session, bind-or-takeover
//! - RetainedStore: retained messages, optionally mirrored to storage
//! - PostOffice: subscribe/unsubscribe/publish over the above
//!
//! plus the authenticator and authorizer chosen from configuration.

use std::path::Path;
use std::sync::Arc;

use crate::auth::{authenticator_from_config, authorizer_from_config, Authenticator, Authorizer};
use crate::config::{AdmissionConfig, Config};
use crate::connection::{Connection, Transport};
use crate::error::Result;
use crate::gateway::Gateway;
use crate::persistence::{
    MemoryRetainedRepository, MemorySessionRepository, RetainedRepository, SessionRepository,
};
use crate::post_office::PostOffice;
use crate::retained::RetainedStore;
use crate::session::SessionRegistry;
use crate::subscription::SubscriptionDirectory;

pub struct Broker {
    config: Config,
    authenticator: Arc<dyn Authenticator>,
    authorizer: Arc<dyn Authorizer>,
    directory: Arc<SubscriptionDirectory>,
    retained: Arc<RetainedStore>,
    registry: Arc<SessionRegistry>,
    post_office: PostOffice,
}

impl Broker {
    /// Build a broker from configuration, with storage chosen by the
    /// `[persistence]` section.
    pub fn new(config: Config) -> Result<Self> {
        let (retained, sessions) = open_repositories(&config)?;
        let authenticator = authenticator_from_config(&config.auth);
        let authorizer = authorizer_from_config(&config.acl);
        Self::with_components(config, authenticator, authorizer, retained, sessions)
    }

    /// Load, validate and build from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = Config::load(path)?;
        config.validate()?;
        Self::new(config)
    }

    /// Build a broker around caller-supplied collaborators.
    pub fn with_components(
        config: Config,
        authenticator: Arc<dyn Authenticator>,
        authorizer: Arc<dyn Authorizer>,
        retained_repository: Arc<dyn RetainedRepository>,
        session_repository: Arc<dyn SessionRepository>,
    ) -> Result<Self> {
        let directory = Arc::new(SubscriptionDirectory::new());
        let retained = Arc::new(RetainedStore::with_repository(retained_repository)?);
        let registry = Arc::new(SessionRegistry::new(
            directory.clone(),
            session_repository,
            authorizer.clone(),
            config.admission.reauthorize_subscriptions_on_connect,
        ));
        let post_office = PostOffice::new(
            directory.clone(),
            retained.clone(),
            registry.clone(),
            authorizer.clone(),
            &config.mqtt,
            &config.session,
        );

        log::info!(
            "Broker ready (anonymous: {}, zero-byte ids: {}, max QoS: {})",
            config.admission.allow_anonymous,
            config.admission.allow_zero_byte_client_id,
            config.mqtt.max_qos
        );

        Ok(Self {
            config,
            authenticator,
            authorizer,
            directory,
            retained,
            registry,
            post_office,
        })
    }

    /// Register a new physical connection and return its actor.
    ///
    /// The caller feeds decoded packets to the actor through the receiver it
    /// passes to [`Gateway::run`] or [`Gateway::spawn`].
    pub fn accept(self: &Arc<Self>, transport: Arc<dyn Transport>) -> Gateway {
        let (connection, control) = Connection::new(transport);
        log::debug!("{}: accepted", connection.id());
        Gateway::new(self.clone(), connection, control)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn admission(&self) -> &AdmissionConfig {
        &self.config.admission
    }

    pub fn authenticator(&self) -> &dyn Authenticator {
        self.authenticator.as_ref()
    }

    pub fn authorizer(&self) -> &dyn Authorizer {
        self.authorizer.as_ref()
    }

    pub fn directory(&self) -> &SubscriptionDirectory {
        &self.directory
    }

    pub fn retained(&self) -> &RetainedStore {
        &self.retained
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn post_office(&self) -> &PostOffice {
        &self.post_office
    }
}

type Repositories = (Arc<dyn RetainedRepository>, Arc<dyn SessionRepository>);

#[cfg(feature = "persistence")]
fn open_repositories(config: &Config) -> Result<Repositories> {
    if config.persistence.enabled {
        let store = Arc::new(crate::persistence::FjallStore::open(&config.persistence.path)?);
        log::info!("Persistence enabled at {}", config.persistence.path.display());
        let retained: Arc<dyn RetainedRepository> = store.clone();
        let sessions: Arc<dyn SessionRepository> = store;
        return Ok((retained, sessions));
    }
    Ok(memory_repositories())
}

#[cfg(not(feature = "persistence"))]
fn open_repositories(config: &Config) -> Result<Repositories> {
    if config.persistence.enabled {
        log::warn!("Persistence requested but the `persistence` feature is off; using memory");
    }
    Ok(memory_repositories())
}

fn memory_repositories() -> Repositories {
    let retained: Arc<dyn RetainedRepository> = Arc::new(MemoryRetainedRepository::new());
    let sessions: Arc<dyn SessionRepository> = Arc::new(MemorySessionRepository::new());
    (retained, sessions)
}
