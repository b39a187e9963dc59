use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::firestore::error::FirestoreResult;

/// Identity the local cache is partitioned by. `uid == None` is the
/// unauthenticated user.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct User {
    pub uid: Option<String>,
}

impl User {
    pub fn unauthenticated() -> Self {
        Self { uid: None }
    }

    pub fn authenticated(uid: impl Into<String>) -> Self {
        Self { uid: Some(uid.into()) }
    }

    pub fn is_authenticated(&self) -> bool {
        self.uid.is_some()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Token {
    pub value: String,
    pub user: User,
}

impl Token {
    pub fn new(value: impl Into<String>, user: User) -> Self {
        Self {
            value: value.into(),
            user,
        }
    }
}

pub type UserChangeListener = Arc<dyn Fn(User) + Send + Sync>;

/// Source of auth (or app check) tokens for stream opens.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait CredentialsProvider: Send + Sync + 'static {
    /// `Ok(None)` means no credentials are available and requests go out
    /// unauthenticated.
    async fn get_token(&self, force_refresh: bool) -> FirestoreResult<Option<Token>>;

    /// Marks the cached token as rejected so the next fetch refreshes it.
    fn invalidate_token(&self);

    /// Registers the callback invoked with the current user and on every user
    /// change.
    fn set_change_listener(&self, listener: UserChangeListener);
}

/// Provider for clients without authentication.
#[derive(Default)]
pub struct EmptyCredentialsProvider {
    listener: Mutex<Option<UserChangeListener>>,
}

impl EmptyCredentialsProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl CredentialsProvider for EmptyCredentialsProvider {
    async fn get_token(&self, _force_refresh: bool) -> FirestoreResult<Option<Token>> {
        Ok(None)
    }

    fn invalidate_token(&self) {}

    fn set_change_listener(&self, listener: UserChangeListener) {
        listener(User::unauthenticated());
        *self.listener.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(listener);
    }
}

/// Provider with a fixed token whose user can be switched, mainly for tests.
pub struct StaticCredentialsProvider {
    state: Mutex<StaticState>,
}

struct StaticState {
    token: Option<Token>,
    invalidations: usize,
    listener: Option<UserChangeListener>,
}

impl StaticCredentialsProvider {
    pub fn new(token: Option<Token>) -> Self {
        Self {
            state: Mutex::new(StaticState {
                token,
                invalidations: 0,
                listener: None,
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, StaticState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Replaces the token and notifies the change listener with its user.
    pub fn set_token(&self, token: Option<Token>) {
        let (listener, user) = {
            let mut state = self.state();
            let user = token.as_ref().map(|token| token.user.clone()).unwrap_or_default();
            state.token = token;
            (state.listener.clone(), user)
        };
        if let Some(listener) = listener {
            listener(user);
        }
    }

    pub fn invalidation_count(&self) -> usize {
        self.state().invalidations
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl CredentialsProvider for StaticCredentialsProvider {
    async fn get_token(&self, _force_refresh: bool) -> FirestoreResult<Option<Token>> {
        Ok(self.state().token.clone())
    }

    fn invalidate_token(&self) {
        self.state().invalidations += 1;
    }

    fn set_change_listener(&self, listener: UserChangeListener) {
        let user = {
            let mut state = self.state();
            state.listener = Some(Arc::clone(&listener));
            state.token.as_ref().map(|token| token.user.clone()).unwrap_or_default()
        };
        listener(user);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_provider_reports_unauthenticated_user() {
        let provider = EmptyCredentialsProvider::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        provider.set_change_listener(Arc::new(move |user| sink.lock().unwrap().push(user)));

        assert_eq!(provider.get_token(false).await.unwrap(), None);
        assert_eq!(*seen.lock().unwrap(), vec![User::unauthenticated()]);
    }

    #[tokio::test]
    async fn static_provider_notifies_user_switches() {
        let provider = StaticCredentialsProvider::new(Some(Token::new("t1", User::authenticated("a"))));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        provider.set_change_listener(Arc::new(move |user| sink.lock().unwrap().push(user)));

        provider.set_token(Some(Token::new("t2", User::authenticated("b"))));
        provider.invalidate_token();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![User::authenticated("a"), User::authenticated("b")]
        );
        assert_eq!(provider.get_token(true).await.unwrap().unwrap().value, "t2");
        assert_eq!(provider.invalidation_count(), 1);
    }
}
