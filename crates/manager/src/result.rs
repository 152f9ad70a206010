use arbiter_token::{release_and_cancel_tokens, release_tokens, SharedToken, TokenSet};
use std::fmt;

/// Outcome of an access request.
///
/// - granted: a token and no blockers
/// - denied (immediate mode): blockers and no token
/// - scheduled: a token whose tasks wait for the listed blockers
///
/// Blockers are the client-visible tokens, each listed once.
pub struct AccessResult<I> {
    token: Option<SharedToken<I>>,
    blocking: TokenSet<I>,
}

impl<I> AccessResult<I> {
    pub(crate) fn granted(token: SharedToken<I>) -> Self {
        Self {
            token: Some(token),
            blocking: TokenSet::new(),
        }
    }

    pub(crate) fn denied(blocking: TokenSet<I>) -> Self {
        Self {
            token: None,
            blocking,
        }
    }

    pub(crate) fn scheduled(token: SharedToken<I>, blocking: TokenSet<I>) -> Self {
        Self {
            token: Some(token),
            blocking,
        }
    }

    pub fn token(&self) -> Option<&SharedToken<I>> {
        self.token.as_ref()
    }

    pub fn into_token(self) -> Option<SharedToken<I>> {
        self.token
    }

    pub fn blocking_tokens(&self) -> &TokenSet<I> {
        &self.blocking
    }

    /// True when a token was returned and nothing blocks it.
    pub fn is_available(&self) -> bool {
        self.token.is_some() && self.blocking.is_empty()
    }

    /// Releases the returned token, if any.
    pub fn release(&self) {
        if let Some(token) = &self.token {
            token.release();
        }
    }

    pub fn release_and_cancel(&self) {
        if let Some(token) = &self.token {
            token.release_and_cancel();
        }
    }

    /// Forcibly releases every blocker. There is no ownership check: any
    /// caller may release any token.
    pub fn release_blocking_tokens(&self) {
        release_tokens(&self.blocking);
    }

    pub fn release_and_cancel_blocking_tokens(&self) {
        release_and_cancel_tokens(&self.blocking);
    }
}

impl<I: Clone> AccessResult<I> {
    pub fn blocking_ids(&self) -> Vec<I> {
        self.blocking.iter().map(|t| t.access_id().clone()).collect()
    }
}

impl<I: fmt::Debug> fmt::Debug for AccessResult<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessResult")
            .field("token", &self.token.as_ref().map(|t| t.access_id()))
            .field("blocking", &self.blocking)
            .finish()
    }
}
