//! Identity session: the signed-in user as last reported by the
//! authentication provider.
//!
//! There is exactly one writer, the [`IdentitySession`], owned by the
//! dispatcher that receives identity events. Everything that needs author
//! attribution holds a read-only [`Identity`].

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// A signed-in user.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Stable, provider-issued id.
    pub id: String,
    pub display_name: String,
    pub avatar_url: String,
}

/// A change pushed by the authentication provider.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IdentityEvent {
    /// Signed in as a user, or signed out (`None`).
    Changed(Option<User>),
    /// The signed-in user's profile changed.
    ProfileUpdated {
        display_name: String,
        avatar_url: String,
    },
}

/// Read-only view of the current identity.
#[derive(Clone, Debug, Default)]
pub struct Identity {
    current: Arc<RwLock<Option<User>>>,
}

impl Identity {
    /// The user as of now, or `None` when signed out.
    pub fn current(&self) -> Option<User> {
        self.current.read().clone()
    }

    pub fn is_signed_in(&self) -> bool {
        self.current.read().is_some()
    }
}

/// Single writer of the current identity.
#[derive(Debug, Default)]
pub struct IdentitySession {
    identity: Identity,
}

impl IdentitySession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand out a read-only accessor.
    pub fn reader(&self) -> Identity {
        self.identity.clone()
    }

    /// Apply one event from the authentication provider.
    pub fn apply(&mut self, event: IdentityEvent) {
        match event {
            IdentityEvent::Changed(user) => self.on_identity_changed(user),
            IdentityEvent::ProfileUpdated {
                display_name,
                avatar_url,
            } => {
                if !self.update_profile(&display_name, &avatar_url) {
                    warn!("Profile update arrived while signed out");
                }
            }
        }
    }

    /// Replace the current identity.
    pub fn on_identity_changed(&mut self, user: Option<User>) {
        let mut current = self.identity.current.write();
        match (&*current, &user) {
            (None, Some(u)) => info!("Signed in as {}", u.id),
            (Some(old), None) => info!("Signed out {}", old.id),
            (Some(old), Some(new)) if old.id != new.id => {
                info!("Identity switched from {} to {}", old.id, new.id)
            }
            _ => {}
        }
        *current = user;
    }

    /// Apply a profile change to the signed-in user; the id never changes.
    ///
    /// Returns false when nobody is signed in.
    pub fn update_profile(&mut self, display_name: &str, avatar_url: &str) -> bool {
        let mut current = self.identity.current.write();
        match current.as_mut() {
            Some(user) => {
                user.display_name = display_name.to_string();
                user.avatar_url = avatar_url.to_string();
                true
            }
            None => false,
        }
    }
}
