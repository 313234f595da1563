//! Authentication provider interface, an in-memory provider, and the
//! registration flow.
//!
//! The provider is the only source of identity. It reports every change to
//! its observers as an [`IdentityEvent`]; the client forwards those into
//! the event queue, where the identity session applies them.

use crate::error::{Result, SyncError};
use crate::identity::{IdentityEvent, User};
use crate::media::{MediaBlob, MediaPublisher};
use parking_lot::Mutex;
use rand::distr::Alphanumeric;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tracing::{info, warn};

/// Minimum accepted password length.
pub const MIN_PASSWORD_LEN: usize = 6;

/// Length of provider-issued user ids.
const USER_ID_LEN: usize = 28;

/// Observer of identity changes. Called with the provider's lock held, so
/// it must not call back into the provider.
pub type IdentityObserver = Box<dyn Fn(IdentityEvent) + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ObserverId(pub u64);

/// A credential issued by an external identity provider.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FederatedCredential {
    /// Provider name, e.g. `google.com`.
    pub provider: String,
    /// The provider's stable id for the account.
    pub subject: String,
    pub display_name: String,
    pub avatar_url: String,
}

/// The authentication provider, as seen by the sync core.
///
/// Every failure is reported as [`SyncError::Auth`] (or
/// [`SyncError::NotSignedIn`]) and is never retried.
pub trait AuthProvider: Send + Sync {
    fn sign_in_with_email(&self, email: &str, password: &str) -> Result<User>;

    /// Create an account and sign it in.
    fn create_user_with_email(&self, email: &str, password: &str) -> Result<User>;

    fn sign_in_federated(&self, credential: &FederatedCredential) -> Result<User>;

    fn send_password_reset(&self, email: &str) -> Result<()>;

    /// Update the signed-in user's profile.
    fn update_profile(&self, display_name: &str, avatar_url: &str) -> Result<User>;

    fn sign_out(&self) -> Result<()>;

    /// Register an observer. It immediately receives the current identity.
    fn observe(&self, observer: IdentityObserver) -> ObserverId;

    fn unobserve(&self, id: ObserverId);
}

struct Account {
    user_id: String,
    password_digest: String,
}

#[derive(Default)]
struct AuthState {
    users: HashMap<String, User>,
    /// Lowercased email -> account.
    accounts: HashMap<String, Account>,
    /// (provider, subject) -> user id.
    federated: HashMap<(String, String), String>,
    current: Option<String>,
    observers: HashMap<ObserverId, IdentityObserver>,
    next_observer: u64,
    reset_requests: Vec<String>,
}

impl AuthState {
    fn emit(&self, event: IdentityEvent) {
        for observer in self.observers.values() {
            observer(event.clone());
        }
    }

    fn sign_in(&mut self, user_id: &str) -> Result<User> {
        let user = self
            .users
            .get(user_id)
            .cloned()
            .ok_or_else(|| SyncError::Auth(format!("unknown user {}", user_id)))?;
        self.current = Some(user_id.to_string());
        self.emit(IdentityEvent::Changed(Some(user.clone())));
        info!("User {} signed in", user_id);
        Ok(user)
    }

    fn new_user_id(&self) -> String {
        loop {
            let id: String = rand::rng()
                .sample_iter(&Alphanumeric)
                .take(USER_ID_LEN)
                .map(char::from)
                .collect();
            if !self.users.contains_key(&id) {
                return id;
            }
        }
    }
}

fn normalize_email(email: &str) -> Result<String> {
    let email = email.trim().to_lowercase();
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Ok(email),
        _ => Err(SyncError::Auth(format!("invalid email address: {:?}", email))),
    }
}

fn password_digest(email: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(email.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

/// In-memory [`AuthProvider`] for tests and local runs.
#[derive(Default)]
pub struct LocalAuthProvider {
    state: Mutex<AuthState>,
}

impl LocalAuthProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emails that asked for a password reset, oldest first.
    pub fn reset_requests(&self) -> Vec<String> {
        self.state.lock().reset_requests.clone()
    }

    pub fn current_user(&self) -> Option<User> {
        let state = self.state.lock();
        state.current.as_ref().and_then(|id| state.users.get(id).cloned())
    }
}

impl AuthProvider for LocalAuthProvider {
    fn sign_in_with_email(&self, email: &str, password: &str) -> Result<User> {
        let email = normalize_email(email)?;
        let mut state = self.state.lock();
        let user_id = match state.accounts.get(&email) {
            Some(account) if account.password_digest == password_digest(&email, password) => {
                account.user_id.clone()
            }
            _ => {
                warn!("Rejected sign-in for {}", email);
                return Err(SyncError::Auth("wrong email or password".into()));
            }
        };
        state.sign_in(&user_id)
    }

    fn create_user_with_email(&self, email: &str, password: &str) -> Result<User> {
        let email = normalize_email(email)?;
        if password.chars().count() < MIN_PASSWORD_LEN {
            return Err(SyncError::Auth(format!(
                "password must be at least {} characters",
                MIN_PASSWORD_LEN
            )));
        }

        let mut state = self.state.lock();
        if state.accounts.contains_key(&email) {
            return Err(SyncError::Auth(format!("email already in use: {}", email)));
        }

        let user_id = state.new_user_id();
        state.users.insert(
            user_id.clone(),
            User {
                id: user_id.clone(),
                display_name: String::new(),
                avatar_url: String::new(),
            },
        );
        state.accounts.insert(
            email.clone(),
            Account {
                user_id: user_id.clone(),
                password_digest: password_digest(&email, password),
            },
        );
        info!("Created account {} for {}", user_id, email);
        state.sign_in(&user_id)
    }

    fn sign_in_federated(&self, credential: &FederatedCredential) -> Result<User> {
        if credential.provider.is_empty() || credential.subject.is_empty() {
            return Err(SyncError::Auth("incomplete federated credential".into()));
        }

        let mut state = self.state.lock();
        let key = (credential.provider.clone(), credential.subject.clone());
        let user_id = match state.federated.get(&key) {
            Some(id) => id.clone(),
            None => {
                let id = state.new_user_id();
                state.users.insert(
                    id.clone(),
                    User {
                        id: id.clone(),
                        display_name: credential.display_name.clone(),
                        avatar_url: credential.avatar_url.clone(),
                    },
                );
                state.federated.insert(key, id.clone());
                id
            }
        };
        state.sign_in(&user_id)
    }

    fn send_password_reset(&self, email: &str) -> Result<()> {
        let email = normalize_email(email)?;
        let mut state = self.state.lock();
        if !state.accounts.contains_key(&email) {
            return Err(SyncError::Auth(format!("no account for {}", email)));
        }
        state.reset_requests.push(email);
        Ok(())
    }

    fn update_profile(&self, display_name: &str, avatar_url: &str) -> Result<User> {
        let mut state = self.state.lock();
        let user_id = state.current.clone().ok_or(SyncError::NotSignedIn)?;
        let user = state
            .users
            .get_mut(&user_id)
            .ok_or_else(|| SyncError::Auth(format!("unknown user {}", user_id)))?;
        user.display_name = display_name.to_string();
        user.avatar_url = avatar_url.to_string();
        let user = user.clone();

        state.emit(IdentityEvent::ProfileUpdated {
            display_name: user.display_name.clone(),
            avatar_url: user.avatar_url.clone(),
        });
        Ok(user)
    }

    fn sign_out(&self) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(id) = state.current.take() {
            info!("User {} signed out", id);
            state.emit(IdentityEvent::Changed(None));
        }
        Ok(())
    }

    fn observe(&self, observer: IdentityObserver) -> ObserverId {
        let mut state = self.state.lock();
        let id = ObserverId(state.next_observer);
        state.next_observer += 1;

        let current = state.current.as_ref().and_then(|uid| state.users.get(uid).cloned());
        observer(IdentityEvent::Changed(current));
        state.observers.insert(id, observer);
        id
    }

    fn unobserve(&self, id: ObserverId) {
        self.state.lock().observers.remove(&id);
    }
}

/// Input of the sign-up flow.
#[derive(Clone, Debug)]
pub struct Registration {
    pub email: String,
    pub password: String,
    pub username: String,
    pub avatar: Option<MediaBlob>,
}

/// Create an account, publish its avatar, then set its profile.
///
/// An avatar upload failure is returned before the profile is touched; the
/// account itself stays created and signed in.
pub fn register(
    auth: &dyn AuthProvider,
    media: &MediaPublisher,
    avatar_folder: &str,
    registration: &Registration,
) -> Result<User> {
    auth.create_user_with_email(&registration.email, &registration.password)?;

    let avatar_url = match &registration.avatar {
        Some(blob) => media.publish(blob, avatar_folder)?,
        None => String::new(),
    };

    auth.update_profile(&registration.username, &avatar_url)
}
