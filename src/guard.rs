use tokio::sync::watch;

use crate::session::SessionState;
use crate::types::SessionRecord;

/// The two views of the dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    /// Unauthenticated entry view.
    Login,
    /// The protected task dashboard.
    Dashboard,
}

impl Route {
    #[must_use]
    pub fn path(self) -> &'static str {
        match self {
            Self::Login => "/login",
            Self::Dashboard => "/",
        }
    }

    #[must_use]
    pub fn is_protected(self) -> bool {
        matches!(self, Self::Dashboard)
    }
}

/// Outcome of a navigation check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Bootstrap is still running: show a waiting state, do not navigate.
    Pending,
    /// Render the requested view.
    Allow,
    /// Replace the current location with this route.
    Redirect(Route),
}

/// Gates navigation on the session controller's state.
///
/// ```rust,ignore
/// let mut guard = controller.guard();
/// loop {
///     match guard.decide(Route::Dashboard) {
///         Decision::Pending => render_spinner(),
///         Decision::Allow => render_dashboard(),
///         Decision::Redirect(route) => navigate_replace(route.path()),
///     }
///     if guard.changed().await.is_none() {
///         break;
///     }
/// }
/// ```
#[derive(Debug, Clone)]
pub struct RouteGuard {
    state: watch::Receiver<SessionState>,
}

impl RouteGuard {
    #[must_use]
    pub fn new(state: watch::Receiver<SessionState>) -> Self {
        Self { state }
    }

    /// Decide whether `route` may be shown in the current state.
    #[must_use]
    pub fn decide(&self, route: Route) -> Decision {
        match (&*self.state.borrow(), route) {
            (SessionState::Initializing, _) => Decision::Pending,
            (SessionState::Authenticated(_), Route::Dashboard)
            | (SessionState::Unauthenticated | SessionState::Failed, Route::Login) => {
                Decision::Allow
            }
            (SessionState::Authenticated(_), Route::Login) => Decision::Redirect(Route::Dashboard),
            (SessionState::Unauthenticated | SessionState::Failed, Route::Dashboard) => {
                Decision::Redirect(Route::Login)
            }
        }
    }

    /// The authenticated user, for rendering protected content.
    #[must_use]
    pub fn user(&self) -> Option<SessionRecord> {
        self.state.borrow().user().cloned()
    }

    /// Wait for the next state change. Returns `None` once the controller is gone.
    pub async fn changed(&mut self) -> Option<()> {
        self.state.changed().await.ok()
    }
}
