/// Explicit per-sign-in context handed to every component that needs the
/// current user, the timing config or the clock.
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::clock::{Clock, SystemClock};
use crate::config::{SyncConfig, UserIdentity};

#[derive(Clone)]
pub struct UserSession {
    identity: Arc<UserIdentity>,
    config: Arc<SyncConfig>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for UserSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserSession")
            .field("identity", &self.identity)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl UserSession {
    pub fn new(identity: UserIdentity, config: SyncConfig) -> Self {
        Self {
            identity: Arc::new(identity),
            config: Arc::new(config),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn identity(&self) -> &UserIdentity {
        &self.identity
    }

    pub fn user_id(&self) -> &str {
        &self.identity.id
    }

    pub fn email(&self) -> Option<&str> {
        self.identity.email.as_deref()
    }

    pub fn display_name(&self) -> &str {
        &self.identity.name
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}
