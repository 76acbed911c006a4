//! Audio route controller.
//!
//! Forces a speaker-style output route while a session plays and restores the
//! previous route afterwards. The route in effect before the first session is
//! captured once; later sessions that start before it is restored take over
//! ownership of that capture, so only the last session to engage restores it.
//! Every routing failure is logged and swallowed.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::core::session::SessionId;
use crate::errors::SpeechResult;

/// Physical output route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputRoute {
    Speaker,
    #[default]
    Earpiece,
    Headset,
    Bluetooth,
}

impl fmt::Display for OutputRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputRoute::Speaker => write!(f, "speaker"),
            OutputRoute::Earpiece => write!(f, "earpiece"),
            OutputRoute::Headset => write!(f, "headset"),
            OutputRoute::Bluetooth => write!(f, "bluetooth"),
        }
    }
}

/// Routing state as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RouteState {
    pub output: OutputRoute,
    /// Voice-call style processing mode
    pub communication_mode: bool,
}

impl RouteState {
    /// Route forced during playback.
    pub fn speaker() -> Self {
        Self {
            output: OutputRoute::Speaker,
            communication_mode: true,
        }
    }
}

/// Platform routing control.
pub trait AudioRouter: Send + Sync {
    fn current(&self) -> SpeechResult<RouteState>;
    fn apply(&self, state: RouteState) -> SpeechResult<()>;
}

/// Router for hosts without routing control. Records the requested state.
#[derive(Debug, Default)]
pub struct SystemRouter {
    state: Mutex<RouteState>,
}

impl SystemRouter {
    pub fn new(initial: RouteState) -> Self {
        Self {
            state: Mutex::new(initial),
        }
    }
}

impl AudioRouter for SystemRouter {
    fn current(&self) -> SpeechResult<RouteState> {
        Ok(*self.state.lock())
    }

    fn apply(&self, state: RouteState) -> SpeechResult<()> {
        *self.state.lock() = state;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct Capture {
    owner: SessionId,
    state: RouteState,
}

/// Best-effort route override scoped to sessions.
pub struct AudioRouteController {
    router: Arc<dyn AudioRouter>,
    captured: Mutex<Option<Capture>>,
}

impl AudioRouteController {
    pub fn new(router: Arc<dyn AudioRouter>) -> Self {
        Self {
            router,
            captured: Mutex::new(None),
        }
    }

    /// Capture the current route (first call wins) and force the speaker route.
    pub fn engage(&self, session: SessionId) {
        {
            let mut captured = self.captured.lock();
            match captured.as_mut() {
                Some(capture) => capture.owner = session,
                None => match self.router.current() {
                    Ok(state) => {
                        debug!(session, route = %state.output, "Captured audio route");
                        *captured = Some(Capture {
                            owner: session,
                            state,
                        });
                    }
                    Err(e) => warn!(session, "Failed to read audio route: {}", e),
                },
            }
        }

        if let Err(e) = self.router.apply(RouteState::speaker()) {
            warn!(session, "Failed to force speaker route: {}", e);
        }
    }

    /// Restore the captured route if `session` still owns it.
    pub fn release(&self, session: SessionId) {
        let restore = {
            let mut captured = self.captured.lock();
            if captured.map(|capture| capture.owner) == Some(session) {
                captured.take()
            } else {
                None
            }
        };

        match restore {
            Some(capture) => {
                if let Err(e) = self.router.apply(capture.state) {
                    warn!(session, "Failed to restore audio route: {}", e);
                } else {
                    debug!(session, route = %capture.state.output, "Restored audio route");
                }
            }
            None => debug!(session, "Route owned by another session, not restoring"),
        }
    }

    /// Whether a route is currently captured.
    pub fn is_engaged(&self) -> bool {
        self.captured.lock().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SpeechError;

    struct FlakyRouter;

    impl AudioRouter for FlakyRouter {
        fn current(&self) -> SpeechResult<RouteState> {
            Err(SpeechError::Route("unavailable".into()))
        }

        fn apply(&self, _state: RouteState) -> SpeechResult<()> {
            Err(SpeechError::Route("unavailable".into()))
        }
    }

    fn headset() -> RouteState {
        RouteState {
            output: OutputRoute::Headset,
            communication_mode: false,
        }
    }

    #[test]
    fn test_engage_and_restore() {
        let router = Arc::new(SystemRouter::new(headset()));
        let controller = AudioRouteController::new(router.clone());

        controller.engage(1);
        assert_eq!(router.current().unwrap(), RouteState::speaker());
        assert!(controller.is_engaged());

        controller.release(1);
        assert_eq!(router.current().unwrap(), headset());
        assert!(!controller.is_engaged());
    }

    #[test]
    fn test_first_capture_wins_and_superseded_release_is_ignored() {
        let router = Arc::new(SystemRouter::new(headset()));
        let controller = AudioRouteController::new(router.clone());

        controller.engage(1);
        controller.engage(2);

        // Session 1 was superseded; its cleanup must not undo session 2's route.
        controller.release(1);
        assert_eq!(router.current().unwrap(), RouteState::speaker());

        controller.release(2);
        assert_eq!(router.current().unwrap(), headset());
    }

    #[test]
    fn test_fresh_capture_after_restore() {
        let router = Arc::new(SystemRouter::new(headset()));
        let controller = AudioRouteController::new(router.clone());

        controller.engage(1);
        controller.release(1);

        let bluetooth = RouteState {
            output: OutputRoute::Bluetooth,
            communication_mode: false,
        };
        router.apply(bluetooth).unwrap();

        controller.engage(2);
        controller.release(2);
        assert_eq!(router.current().unwrap(), bluetooth);
    }

    #[test]
    fn test_router_failures_are_swallowed() {
        let controller = AudioRouteController::new(Arc::new(FlakyRouter));
        controller.engage(1);
        assert!(!controller.is_engaged());
        controller.release(1);
    }
}
