//! Key lifecycle manager
//!
//! Owns the only [`Session`] and with it the ephemeral secret. Tracks the
//! inactivity window while a session is armed but automation is not
//! running, and wipes on expiry.

use std::time::Duration;

use alloy_primitives::Address;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::chain::LocalSigner;
use crate::error::{Error, Result};
use crate::gate::SecretKey;

use super::Session;

pub struct KeyLifecycle {
    session: Option<Session>,
    idle_timeout: Duration,
    last_touch: Instant,
}

impl KeyLifecycle {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            session: None,
            idle_timeout,
            last_touch: Instant::now(),
        }
    }

    /// Derive the ephemeral signer and create the session
    ///
    /// Fails with `StateConflict` when a session already exists and with
    /// `KeyDerivation` when the secret is not a usable scalar.
    pub fn arm(
        &mut self,
        secret: &SecretKey,
        destination: Address,
        vault: Address,
        endpoint: &str,
    ) -> Result<&Session> {
        if self.session.is_some() {
            return Err(Error::StateConflict(
                "a session is already armed; switch wallet first".to_string(),
            ));
        }

        let signer = LocalSigner::from_secret(secret)?;
        if signer.address() == destination {
            return Err(Error::InvalidFormat(
                "destination must differ from the ephemeral address".to_string(),
            ));
        }

        let session = Session::new(signer, destination, vault, endpoint);
        info!(session = %session.id(), "Session armed");
        self.last_touch = Instant::now();
        Ok(self.session.insert(session))
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn session_mut(&mut self) -> Option<&mut Session> {
        self.session.as_mut()
    }

    pub fn is_armed(&self) -> bool {
        self.session.is_some()
    }

    /// Reset the inactivity window
    pub fn touch(&mut self) {
        self.last_touch = Instant::now();
    }

    /// When the inactivity window runs out, if it is being tracked
    pub fn idle_deadline(&self, running: bool) -> Option<Instant> {
        if running || self.session.is_none() {
            return None;
        }
        Some(self.last_touch + self.idle_timeout)
    }

    /// Wipe if idle for the full timeout while not running
    ///
    /// Returns whether a wipe happened.
    pub fn expire_if_idle(&mut self, running: bool) -> bool {
        match self.idle_deadline(running) {
            Some(deadline) if Instant::now() >= deadline => {
                info!("Session idle for {:?}, wiping secret", self.idle_timeout);
                self.wipe()
            }
            _ => false,
        }
    }

    /// Drop the session and its secret
    ///
    /// Returns whether there was anything to wipe. Safe to call repeatedly.
    pub fn wipe(&mut self) -> bool {
        match self.session.take() {
            Some(session) => {
                debug!(session = %session.id(), "Session wiped");
                true
            }
            None => false,
        }
    }
}

impl Drop for KeyLifecycle {
    fn drop(&mut self) {
        self.wipe();
    }
}
