use serde::Serialize;

use super::event::{DispatchEvent, PayloadKind, UserCmd};
use crate::lifecycle::Originals;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Payload {
    Text(String),
    UserCmd(UserCmd),
}

impl Payload {
    pub fn kind(&self) -> PayloadKind {
        match self {
            Self::Text(_) => PayloadKind::Text,
            Self::UserCmd(_) => PayloadKind::UserCmd,
        }
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Payload::Text(value.to_string())
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Payload::Text(value)
    }
}

impl From<UserCmd> for Payload {
    fn from(value: UserCmd) -> Self {
        Payload::UserCmd(value)
    }
}

/// What the decision-maker wants done with an intercepted call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", content = "payload", rename_all = "snake_case")]
pub enum Decision {
    /// Run the original with its own arguments.
    #[default]
    Proceed,
    /// Run the original with this payload in place of its primary argument.
    Override(Payload),
    /// Do not run the original. For routines whose result the host reads,
    /// the payload is returned in its place.
    Suppress(Option<Payload>),
}

impl Decision {
    pub fn override_text(text: impl Into<String>) -> Self {
        Decision::Override(Payload::Text(text.into()))
    }

    pub fn suppress() -> Self {
        Decision::Suppress(None)
    }

    pub fn suppress_with(value: impl Into<Payload>) -> Self {
        Decision::Suppress(Some(value.into()))
    }
}

/// The scripting layer, seen from the dispatch bus.
///
/// Called synchronously on the host thread. Implementations may call back
/// into hooked host routines, which dispatches nested events, so all state
/// they keep must be reachable through `&self`.
pub trait DecisionMaker {
    fn decide(&self, event: &DispatchEvent) -> Decision;

    /// Startup finished; `originals` holds every captured original entry.
    fn ready(&self, _originals: &Originals) {}
}

/// Decision-maker that never interferes.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassThrough;

impl DecisionMaker for PassThrough {
    fn decide(&self, _event: &DispatchEvent) -> Decision {
        Decision::Proceed
    }
}

impl<F> DecisionMaker for F
where
    F: Fn(&DispatchEvent) -> Decision,
{
    fn decide(&self, event: &DispatchEvent) -> Decision {
        self(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::EventArgs;

    fn frame() -> DispatchEvent {
        DispatchEvent::new(EventArgs::Frame { time: 100 })
    }

    #[test]
    fn test_closures_decide() {
        let decider = |event: &DispatchEvent| match event.args {
            EventArgs::Frame { time } if time > 50 => Decision::suppress(),
            _ => Decision::Proceed,
        };
        assert_eq!(decider.decide(&frame()), Decision::Suppress(None));
    }

    #[test]
    fn test_boxed_trait_objects_decide_through_deref() {
        let boxed: Box<dyn DecisionMaker + Send + Sync> = Box::new(PassThrough);
        assert_eq!(boxed.decide(&frame()), Decision::Proceed);
        boxed.ready(&Originals::default());

        let closure: Box<dyn DecisionMaker> =
            Box::new(|_: &DispatchEvent| Decision::override_text("print hello"));
        assert_eq!(
            closure.decide(&frame()),
            Decision::Override(Payload::Text("print hello".to_string()))
        );
    }

    #[test]
    fn test_suppress_with_text() {
        assert_eq!(
            Decision::suppress_with("banned"),
            Decision::Suppress(Some(Payload::Text("banned".to_string())))
        );
    }
}
