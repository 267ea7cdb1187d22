//! Event dispatch bus.
//!
//! Every replacement routine hands its call to one [`Dispatcher`] method.
//! The method snapshots the arguments into a [`DispatchEvent`], asks the
//! [`DecisionMaker`] what to do and then runs, rewrites or skips the
//! original. Decisions an event kind does not accept are logged and treated
//! as pass-through.

mod decision;
mod event;
mod stats;

pub use decision::{Decision, DecisionMaker, PassThrough, Payload};
pub use event::{
    ConnState, DispatchEvent, EventArgs, EventKind, Phase, PayloadKind, Policy, UserCmd,
};
pub use stats::{DispatchStats, KindStats};

use std::ops::Range;

use tracing::{debug, warn};

use crate::lifecycle::Originals;

/// Rejection text used when a connection is suppressed without one.
pub const DEFAULT_CONNECT_REJECTION: &str = "You are not allowed to join this server.";

/// Configstring indices the host rewrites every frame.
pub fn default_configstring_passthrough() -> Vec<Range<i32>> {
    vec![16..17, 662..670]
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchSettings {
    /// Configstring indices that go straight to the original.
    pub configstring_passthrough: Vec<Range<i32>>,
    pub connect_rejection: String,
    /// Log every event and its decision at debug level.
    pub trace: bool,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            configstring_passthrough: default_configstring_passthrough(),
            connect_rejection: DEFAULT_CONNECT_REJECTION.to_string(),
            trace: false,
        }
    }
}

impl DispatchSettings {
    fn bypasses_configstring(&self, index: i32) -> bool {
        self.configstring_passthrough
            .iter()
            .any(|range| range.contains(&index))
    }
}

/// Recipient of a server command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandTarget {
    Broadcast,
    Client(i32),
    /// A client slot without an entity; never dispatched.
    Unbound,
}

/// Who set off a kamikaze and how.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KamikazeOwner {
    pub client_id: Option<i32>,
    /// Activated from the inventory rather than by a dead carrier's body.
    pub used_on_demand: bool,
}

pub struct Dispatcher<D> {
    decider: D,
    settings: DispatchSettings,
    stats: DispatchStats,
}

impl<D: DecisionMaker> Dispatcher<D> {
    pub fn new(decider: D) -> Self {
        Self::with_settings(decider, DispatchSettings::default())
    }

    pub fn with_settings(decider: D, settings: DispatchSettings) -> Self {
        Self {
            decider,
            settings,
            stats: DispatchStats::default(),
        }
    }

    pub fn decider(&self) -> &D {
        &self.decider
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }

    /// Hand the captured originals to the decision-maker.
    pub fn ready(&self, originals: &Originals) {
        self.decider.ready(originals);
    }

    /// Ask the decision-maker about one call and bring the answer in line
    /// with what the event kind accepts.
    pub fn dispatch(&self, args: EventArgs) -> Decision {
        let event = DispatchEvent::new(args);
        let kind = event.kind();
        self.stats.dispatched(kind);

        let decision = self.decider.decide(&event);
        if self.settings.trace {
            debug!("Dispatch {:?} -> {:?}", event.args, decision);
        }
        self.conform(kind, decision)
    }

    fn conform(&self, kind: EventKind, decision: Decision) -> Decision {
        let policy = kind.policy();
        match decision {
            Decision::Proceed => Decision::Proceed,
            Decision::Override(payload) => {
                if policy.override_with == Some(payload.kind()) {
                    self.stats.overridden(kind);
                    Decision::Override(payload)
                } else {
                    self.reject(kind, &format!("override with {} payload", payload.kind()))
                }
            }
            Decision::Suppress(value) => {
                if !policy.suppress {
                    return self.reject(kind, "suppression");
                }
                match value {
                    Some(payload) if policy.suppress_returns != Some(payload.kind()) => self
                        .reject(
                            kind,
                            &format!("suppression returning a {} payload", payload.kind()),
                        ),
                    value => {
                        self.stats.suppressed(kind);
                        Decision::Suppress(value)
                    }
                }
            }
        }
    }

    fn reject(&self, kind: EventKind, what: &str) -> Decision {
        warn!("{} does not accept {}; passing the call through", kind, what);
        self.stats.rejected(kind);
        Decision::Proceed
    }

    /// Shared flow of the events that accept a text override or suppression.
    fn text_call(&self, args: EventArgs, text: &str, original: impl FnOnce(&str)) {
        match self.dispatch(args) {
            Decision::Override(Payload::Text(replacement)) => original(&replacement),
            Decision::Suppress(_) => {}
            _ => original(text),
        }
    }

    /// `G_RunFrame`. Frames are never dropped.
    pub fn frame<R>(&self, time: i32, original: impl FnOnce() -> R) -> R {
        self.dispatch(EventArgs::Frame { time });
        original()
    }

    /// `SV_ExecuteClientCommand`. `client_id` is `None` when the host does not
    /// consider the client fit for commands (not OK or without an entity).
    pub fn client_command(
        &self,
        client_id: Option<i32>,
        command: &str,
        original: impl FnOnce(&str),
    ) {
        let Some(client_id) = client_id else {
            return original(command);
        };
        self.text_call(
            EventArgs::ClientCommand {
                client_id,
                command: command.to_string(),
            },
            command,
            original,
        );
    }

    /// `SV_SendServerCommand`, with the command already formatted.
    pub fn server_command(
        &self,
        target: CommandTarget,
        command: &str,
        original: impl FnOnce(&str),
    ) {
        let client_id = match target {
            CommandTarget::Broadcast => None,
            CommandTarget::Client(id) => Some(id),
            CommandTarget::Unbound => return original(command),
        };
        self.text_call(
            EventArgs::ServerCommand {
                client_id,
                command: command.to_string(),
            },
            command,
            original,
        );
    }

    /// `SV_ClientEnterWorld`. `state_before` is the connection state read
    /// before the original ran; `original` reports whether the client has an
    /// entity afterwards. Only a primed client entering the world for the
    /// first time counts as loaded.
    pub fn client_loaded(
        &self,
        client_id: i32,
        state_before: Option<ConnState>,
        original: impl FnOnce() -> bool,
    ) {
        let has_entity = original();
        if has_entity && state_before == Some(ConnState::Primed) {
            self.dispatch(EventArgs::ClientLoaded { client_id });
        }
    }

    /// `SV_ClientThink`. An override is written back into `cmd` before the
    /// original reads it.
    pub fn client_think(
        &self,
        client_id: i32,
        cmd: &mut UserCmd,
        original: impl FnOnce(&mut UserCmd),
    ) {
        let decision = self.dispatch(EventArgs::ClientThink {
            client_id,
            cmd: *cmd,
        });
        if let Decision::Override(Payload::UserCmd(replacement)) = decision {
            *cmd = replacement;
        }
        original(cmd);
    }

    /// `SV_SetConfigstring`. A null value is presented as `""`.
    pub fn set_configstring(
        &self,
        index: i32,
        value: Option<&str>,
        original: impl FnOnce(Option<&str>),
    ) {
        if self.settings.bypasses_configstring(index) {
            return original(value);
        }
        let value = value.unwrap_or_default();
        self.text_call(
            EventArgs::SetConfigstring {
                index,
                value: value.to_string(),
            },
            value,
            |text| original(Some(text)),
        );
    }

    /// `SV_DropClient`.
    pub fn client_disconnect<R>(
        &self,
        client_id: i32,
        reason: &str,
        original: impl FnOnce() -> R,
    ) -> R {
        self.dispatch(EventArgs::ClientDisconnect {
            client_id,
            reason: reason.to_string(),
        });
        original()
    }

    /// `Com_Printf`, with the message already formatted.
    pub fn console_print(&self, text: &str, original: impl FnOnce(&str)) {
        let decision = self.dispatch(EventArgs::ConsolePrint {
            text: text.to_string(),
        });
        if !matches!(decision, Decision::Suppress(_)) {
            original(text);
        }
    }

    /// `SV_SpawnServer`: a fresh map, announced once the server is up.
    pub fn spawn_server<R>(&self, original: impl FnOnce() -> R) -> R {
        let result = original();
        self.dispatch(EventArgs::NewGame { restart: false });
        result
    }

    /// `G_InitGame`. Only restarts are announced here; a fresh map is
    /// announced by [`Dispatcher::spawn_server`].
    pub fn init_game<R>(&self, restart: bool, original: impl FnOnce() -> R) -> R {
        let result = original();
        if restart {
            self.dispatch(EventArgs::NewGame { restart });
        }
        result
    }

    /// `ClientConnect`. The host reads the returned value as a rejection
    /// message, so a suppression returns `reject(text)` instead of running
    /// the original. Reconnects are not dispatched and bots are never
    /// rejected.
    pub fn client_connect<R>(
        &self,
        client_id: i32,
        first_time: bool,
        is_bot: bool,
        original: impl FnOnce() -> R,
        reject: impl FnOnce(&str) -> R,
    ) -> R {
        if !first_time {
            return original();
        }

        match self.dispatch(EventArgs::ClientConnect { client_id, is_bot }) {
            Decision::Suppress(_) if is_bot => {
                debug!("Ignoring rejection of bot in slot {}", client_id);
                original()
            }
            Decision::Suppress(Some(Payload::Text(text))) => reject(&text),
            Decision::Suppress(_) => reject(&self.settings.connect_rejection),
            _ => original(),
        }
    }

    /// `ClientSpawn`. Dispatched after the host spawned the player so the
    /// scripting layer's changes are not overwritten.
    pub fn client_spawn<R>(&self, client_id: i32, original: impl FnOnce() -> R) -> R {
        let result = original();
        self.dispatch(EventArgs::ClientSpawn { client_id });
        result
    }

    /// `G_StartKamikaze`.
    pub fn kamikaze<R>(&self, owner: KamikazeOwner, original: impl FnOnce() -> R) -> R {
        if owner.used_on_demand {
            if let Some(client_id) = owner.client_id {
                self.dispatch(EventArgs::KamikazeUse { client_id });
            }
        }

        let result = original();

        if let Some(client_id) = owner.client_id {
            self.dispatch(EventArgs::KamikazeExplode {
                client_id,
                used_on_demand: owner.used_on_demand,
            });
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::{Rc, Weak};

    use super::*;

    /// Answers from a script and remembers every event it saw.
    #[derive(Default)]
    struct Script {
        answers: RefCell<Vec<(EventKind, Decision)>>,
        seen: RefCell<Vec<EventArgs>>,
    }

    impl Script {
        fn answer(self, kind: EventKind, decision: Decision) -> Self {
            self.answers.borrow_mut().push((kind, decision));
            self
        }

        fn seen(&self) -> Vec<EventArgs> {
            self.seen.borrow().clone()
        }
    }

    impl DecisionMaker for Script {
        fn decide(&self, event: &DispatchEvent) -> Decision {
            self.seen.borrow_mut().push(event.args.clone());
            self.answers
                .borrow()
                .iter()
                .find(|(kind, _)| *kind == event.kind())
                .map(|(_, decision)| decision.clone())
                .unwrap_or_default()
        }
    }

    fn dispatcher(script: Script) -> Dispatcher<Script> {
        Dispatcher::new(script)
    }

    #[test]
    fn test_server_command_override_replaces_text() {
        let bus = dispatcher(Script::default().answer(
            EventKind::ServerCommand,
            Decision::override_text("print hello"),
        ));
        let mut sent = Vec::new();

        bus.server_command(CommandTarget::Client(3), "print bye", |s| {
            sent.push(s.to_string())
        });

        assert_eq!(sent, vec!["print hello"]);
        assert_eq!(
            bus.decider().seen(),
            vec![EventArgs::ServerCommand {
                client_id: Some(3),
                command: "print bye".to_string()
            }]
        );
        assert_eq!(bus.stats().get(EventKind::ServerCommand).overridden, 1);
    }

    #[test]
    fn test_broadcast_and_unbound_server_commands() {
        let bus = dispatcher(Script::default());
        let mut sent = 0;
        bus.server_command(CommandTarget::Broadcast, "cp hi", |_| sent += 1);
        bus.server_command(CommandTarget::Unbound, "cp hi", |_| sent += 1);

        assert_eq!(sent, 2);
        assert_eq!(
            bus.decider().seen(),
            vec![EventArgs::ServerCommand {
                client_id: None,
                command: "cp hi".to_string()
            }]
        );
    }

    #[test]
    fn test_suppressed_client_command_never_reaches_host() {
        let bus = dispatcher(Script::default().answer(EventKind::ClientCommand, Decision::suppress()));
        let mut executed = false;

        bus.client_command(Some(0), "callvote kick 1", |_| executed = true);

        assert!(!executed);
        assert_eq!(bus.stats().get(EventKind::ClientCommand).suppressed, 1);
    }

    #[test]
    fn test_client_command_without_entity_is_not_dispatched() {
        let bus = dispatcher(Script::default().answer(EventKind::ClientCommand, Decision::suppress()));
        let mut executed = None;

        bus.client_command(None, "say hi", |s| executed = Some(s.to_string()));

        assert_eq!(executed.as_deref(), Some("say hi"));
        assert!(bus.decider().seen().is_empty());
    }

    #[test]
    fn test_pass_through_fidelity() {
        let bus = Dispatcher::new(PassThrough);

        let mut seen = Vec::new();
        bus.client_command(Some(1), "team s", |s| seen.push(s.to_string()));
        bus.server_command(CommandTarget::Broadcast, "print x", |s| seen.push(s.to_string()));
        bus.console_print("hello\n", |s| seen.push(s.to_string()));
        bus.set_configstring(0, Some("cs"), |s| seen.push(s.unwrap_or("<null>").to_string()));
        assert_eq!(seen, vec!["team s", "print x", "hello\n", "cs"]);

        let mut cmd = UserCmd {
            buttons: 1,
            forward_move: 127,
            ..Default::default()
        };
        let before = cmd;
        bus.client_think(2, &mut cmd, |c| assert_eq!(*c, before));
        assert_eq!(cmd, before);

        assert_eq!(bus.frame(100, || 7), 7);
        assert_eq!(bus.client_disconnect(1, "quit", || "dropped"), "dropped");
        assert_eq!(bus.spawn_server(|| 1), 1);
        assert_eq!(bus.init_game(true, || 2), 2);
        assert_eq!(bus.client_spawn(4, || 3), 3);
        assert_eq!(
            bus.client_connect(5, true, false, || Option::<String>::None, |t| Some(t.to_string())),
            None
        );
        let owner = KamikazeOwner {
            client_id: Some(4),
            used_on_demand: true,
        };
        assert_eq!(bus.kamikaze(owner, || 9), 9);

        let mut entered = false;
        bus.client_loaded(6, Some(ConnState::Primed), || {
            entered = true;
            true
        });
        assert!(entered);
    }

    #[test]
    fn test_frame_suppression_is_rejected() {
        let bus = dispatcher(Script::default().answer(EventKind::Frame, Decision::suppress()));
        let mut frames = 0;

        bus.frame(50, || frames += 1);

        assert_eq!(frames, 1);
        let stats = bus.stats().get(EventKind::Frame);
        assert_eq!(stats.dispatched, 1);
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.suppressed, 0);
    }

    #[test]
    fn test_wrong_payload_shape_passes_through() {
        let bus = dispatcher(Script::default().answer(
            EventKind::ClientThink,
            Decision::override_text("not a usercmd"),
        ));
        let mut cmd = UserCmd::default();
        let mut called = false;

        bus.client_think(0, &mut cmd, |_| called = true);

        assert!(called);
        assert_eq!(cmd, UserCmd::default());
        assert_eq!(bus.stats().get(EventKind::ClientThink).rejected, 1);
    }

    #[test]
    fn test_client_think_override_is_written_back() {
        let replacement = UserCmd {
            buttons: 0,
            weapon: 5,
            ..Default::default()
        };
        let bus = dispatcher(
            Script::default().answer(EventKind::ClientThink, Decision::Override(replacement.into())),
        );
        let mut cmd = UserCmd {
            buttons: 1,
            ..Default::default()
        };
        let mut received = None;

        bus.client_think(0, &mut cmd, |c| received = Some(*c));

        assert_eq!(received, Some(replacement));
        assert_eq!(cmd, replacement);
    }

    #[test]
    fn test_console_print_rejects_override() {
        let bus = dispatcher(
            Script::default().answer(EventKind::ConsolePrint, Decision::override_text("other")),
        );
        let mut printed = None;
        bus.console_print("text\n", |s| printed = Some(s.to_string()));
        assert_eq!(printed.as_deref(), Some("text\n"));
    }

    #[test]
    fn test_configstring_bypass_and_null_value() {
        let bus = dispatcher(Script::default().answer(EventKind::SetConfigstring, Decision::suppress()));
        let mut written = Vec::new();

        bus.set_configstring(16, None, |v| written.push(v.map(str::to_string)));
        bus.set_configstring(665, Some("x"), |v| written.push(v.map(str::to_string)));
        bus.set_configstring(670, None, |v| written.push(v.map(str::to_string)));

        assert_eq!(written, vec![None, Some("x".to_string())]);
        assert_eq!(
            bus.decider().seen(),
            vec![EventArgs::SetConfigstring {
                index: 670,
                value: String::new()
            }]
        );
    }

    #[test]
    fn test_client_loaded_requires_primed_state_and_entity() {
        let bus = dispatcher(Script::default());

        bus.client_loaded(1, Some(ConnState::Primed), || true);
        bus.client_loaded(2, Some(ConnState::Active), || true);
        bus.client_loaded(3, Some(ConnState::Primed), || false);
        bus.client_loaded(4, None, || true);

        assert_eq!(
            bus.decider().seen(),
            vec![EventArgs::ClientLoaded { client_id: 1 }]
        );
    }

    #[test]
    fn test_client_connect_rejection() {
        let bus = dispatcher(Script::default().answer(
            EventKind::ClientConnect,
            Decision::suppress_with("banned"),
        ));
        let result = bus.client_connect(2, true, false, || None, |t| Some(t.to_string()));
        assert_eq!(result.as_deref(), Some("banned"));
    }

    #[test]
    fn test_client_connect_default_rejection_and_bots() {
        let settings = DispatchSettings {
            connect_rejection: "go away".to_string(),
            ..Default::default()
        };
        let bus = Dispatcher::with_settings(
            Script::default().answer(EventKind::ClientConnect, Decision::suppress()),
            settings,
        );

        let human = bus.client_connect(2, true, false, || None, |t| Some(t.to_string()));
        let bot = bus.client_connect(3, true, true, || None, |t| Some(t.to_string()));
        let reconnect = bus.client_connect(4, false, false, || None, |t| Some(t.to_string()));

        assert_eq!(human.as_deref(), Some("go away"));
        assert_eq!(bot, None);
        assert_eq!(reconnect, None);
        assert_eq!(bus.decider().seen().len(), 2);
    }

    #[test]
    fn test_new_game_announcements() {
        let bus = dispatcher(Script::default());
        bus.spawn_server(|| ());
        bus.init_game(false, || ());
        bus.init_game(true, || ());
        assert_eq!(
            bus.decider().seen(),
            vec![
                EventArgs::NewGame { restart: false },
                EventArgs::NewGame { restart: true }
            ]
        );
    }

    #[test]
    fn test_post_events_follow_the_original() {
        let order = RefCell::new(Vec::new());
        let bus = Dispatcher::new(|event: &DispatchEvent| {
            order.borrow_mut().push(event.kind().to_string());
            Decision::Proceed
        });

        bus.client_spawn(1, || order.borrow_mut().push("original".to_string()));
        bus.kamikaze(
            KamikazeOwner {
                client_id: Some(1),
                used_on_demand: true,
            },
            || order.borrow_mut().push("original".to_string()),
        );

        assert_eq!(
            *order.borrow(),
            vec![
                "original",
                "client_spawn",
                "kamikaze_use",
                "original",
                "kamikaze_explode"
            ]
        );
    }

    #[test]
    fn test_kamikaze_without_owner_is_silent() {
        let bus = dispatcher(Script::default());
        let body_blast = KamikazeOwner {
            client_id: Some(7),
            used_on_demand: false,
        };
        bus.kamikaze(body_blast, || ());
        bus.kamikaze(
            KamikazeOwner {
                client_id: None,
                used_on_demand: false,
            },
            || (),
        );
        assert_eq!(
            bus.decider().seen(),
            vec![EventArgs::KamikazeExplode {
                client_id: 7,
                used_on_demand: false
            }]
        );
    }

    #[test]
    fn test_reentrant_dispatch_from_decision() {
        struct Echo {
            bus: Weak<Dispatcher<Echo>>,
        }

        impl DecisionMaker for Echo {
            fn decide(&self, event: &DispatchEvent) -> Decision {
                if event.kind() == EventKind::ClientCommand {
                    if let Some(bus) = self.bus.upgrade() {
                        bus.server_command(CommandTarget::Broadcast, "print echo", |_| {});
                    }
                }
                Decision::Proceed
            }
        }

        let bus = Rc::new_cyclic(|weak| Dispatcher::new(Echo { bus: weak.clone() }));
        let mut executed = false;

        bus.client_command(Some(0), "say hi", |_| executed = true);

        assert!(executed);
        assert_eq!(bus.stats().get(EventKind::ServerCommand).dispatched, 1);
        assert_eq!(bus.stats().get(EventKind::ClientCommand).dispatched, 1);
    }
}
