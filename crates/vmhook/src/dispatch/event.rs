use serde::{Deserialize, Serialize};
use strum::{Display, EnumCount, EnumIter, FromRepr, IntoStaticStr};

use crate::routine::Routine;

/// Movement command a client sends every frame, as laid out by the host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[repr(C)]
pub struct UserCmd {
    pub server_time: i32,
    pub angles: [i32; 3],
    pub buttons: i32,
    pub weapon: u8,
    pub weapon_primary: u8,
    pub fov: u8,
    pub forward_move: i8,
    pub right_move: i8,
    pub up_move: i8,
}

/// Connection state of a client slot (`clientState_t`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, FromRepr, Display)]
#[repr(i32)]
pub enum ConnState {
    Free = 0,
    Zombie = 1,
    Connected = 2,
    Primed = 3,
    Active = 4,
}

/// Where an event sits relative to the original routine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[strum(serialize_all = "snake_case")]
pub enum Phase {
    /// Dispatched before the original runs; may veto or rewrite the call.
    Pre,
    /// Dispatched after the original ran; informational only.
    Post,
    /// Host state is captured before the original runs and the event is
    /// dispatched afterwards if that captured state calls for it.
    Around,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[strum(serialize_all = "snake_case")]
pub enum PayloadKind {
    Text,
    UserCmd,
}

/// Decisions an event kind accepts. Anything else is treated as pass-through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Policy {
    /// Payload shape an override must carry, if overriding is allowed.
    pub override_with: Option<PayloadKind>,
    pub suppress: bool,
    /// Shape of the substitute return value a suppression may carry.
    pub suppress_returns: Option<PayloadKind>,
}

impl Policy {
    const NOTIFY: Policy = Policy {
        override_with: None,
        suppress: false,
        suppress_returns: None,
    };

    const TEXT: Policy = Policy {
        override_with: Some(PayloadKind::Text),
        suppress: true,
        suppress_returns: None,
    };

    pub fn is_notification(&self) -> bool {
        self.override_with.is_none() && !self.suppress
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    EnumIter,
    EnumCount,
    IntoStaticStr,
    Display,
)]
#[strum(serialize_all = "snake_case")]
pub enum EventKind {
    Frame,
    ClientCommand,
    ServerCommand,
    ClientLoaded,
    ClientThink,
    SetConfigstring,
    ClientDisconnect,
    ConsolePrint,
    NewGame,
    ClientConnect,
    ClientSpawn,
    KamikazeUse,
    KamikazeExplode,
}

impl EventKind {
    pub fn phase(&self) -> Phase {
        match self {
            Self::ClientLoaded => Phase::Around,
            Self::NewGame | Self::ClientSpawn | Self::KamikazeExplode => Phase::Post,
            _ => Phase::Pre,
        }
    }

    pub fn policy(&self) -> Policy {
        match self {
            Self::ClientCommand | Self::ServerCommand | Self::SetConfigstring => Policy::TEXT,
            Self::ClientThink => Policy {
                override_with: Some(PayloadKind::UserCmd),
                suppress: false,
                suppress_returns: None,
            },
            Self::ConsolePrint => Policy {
                override_with: None,
                suppress: true,
                suppress_returns: None,
            },
            Self::ClientConnect => Policy {
                override_with: None,
                suppress: true,
                suppress_returns: Some(PayloadKind::Text),
            },
            Self::Frame
            | Self::ClientLoaded
            | Self::ClientDisconnect
            | Self::NewGame
            | Self::ClientSpawn
            | Self::KamikazeUse
            | Self::KamikazeExplode => Policy::NOTIFY,
        }
    }

    /// Host routines whose interception produces this event.
    pub fn routines(&self) -> &'static [Routine] {
        match self {
            Self::Frame => &[Routine::GRunFrame],
            Self::ClientCommand => &[Routine::SvExecuteClientCommand],
            Self::ServerCommand => &[Routine::SvSendServerCommand],
            Self::ClientLoaded => &[Routine::SvClientEnterWorld],
            Self::ClientThink => &[Routine::SvClientThink],
            Self::SetConfigstring => &[Routine::SvSetConfigstring],
            Self::ClientDisconnect => &[Routine::SvDropClient],
            Self::ConsolePrint => &[Routine::ComPrintf],
            Self::NewGame => &[Routine::SvSpawnServer, Routine::GInitGame],
            Self::ClientConnect => &[Routine::ClientConnect],
            Self::ClientSpawn => &[Routine::ClientSpawn],
            Self::KamikazeUse | Self::KamikazeExplode => &[Routine::GStartKamikaze],
        }
    }
}

/// Argument snapshot of one intercepted call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventArgs {
    Frame { time: i32 },
    ClientCommand { client_id: i32, command: String },
    /// `client_id` is `None` for broadcasts.
    ServerCommand { client_id: Option<i32>, command: String },
    ClientLoaded { client_id: i32 },
    ClientThink { client_id: i32, cmd: UserCmd },
    SetConfigstring { index: i32, value: String },
    ClientDisconnect { client_id: i32, reason: String },
    ConsolePrint { text: String },
    NewGame { restart: bool },
    ClientConnect { client_id: i32, is_bot: bool },
    ClientSpawn { client_id: i32 },
    KamikazeUse { client_id: i32 },
    KamikazeExplode { client_id: i32, used_on_demand: bool },
}

impl EventArgs {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Frame { .. } => EventKind::Frame,
            Self::ClientCommand { .. } => EventKind::ClientCommand,
            Self::ServerCommand { .. } => EventKind::ServerCommand,
            Self::ClientLoaded { .. } => EventKind::ClientLoaded,
            Self::ClientThink { .. } => EventKind::ClientThink,
            Self::SetConfigstring { .. } => EventKind::SetConfigstring,
            Self::ClientDisconnect { .. } => EventKind::ClientDisconnect,
            Self::ConsolePrint { .. } => EventKind::ConsolePrint,
            Self::NewGame { .. } => EventKind::NewGame,
            Self::ClientConnect { .. } => EventKind::ClientConnect,
            Self::ClientSpawn { .. } => EventKind::ClientSpawn,
            Self::KamikazeUse { .. } => EventKind::KamikazeUse,
            Self::KamikazeExplode { .. } => EventKind::KamikazeExplode,
        }
    }
}

/// One intercepted call as presented to the decision-maker. Lives only for
/// the duration of that call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchEvent {
    pub args: EventArgs,
}

impl DispatchEvent {
    pub fn new(args: EventArgs) -> Self {
        Self { args }
    }

    pub fn kind(&self) -> EventKind {
        self.args.kind()
    }

    pub fn phase(&self) -> Phase {
        self.kind().phase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_every_kind_maps_to_a_hooked_routine() {
        for kind in EventKind::iter() {
            assert!(!kind.routines().is_empty(), "{kind} has no routine");
        }
    }

    #[test]
    fn test_post_events_are_notifications() {
        for kind in EventKind::iter().filter(|k| k.phase() != Phase::Pre) {
            assert!(kind.policy().is_notification(), "{kind} can alter a finished call");
        }
    }

    #[test]
    fn test_frame_cannot_be_dropped() {
        assert!(EventKind::Frame.policy().is_notification());
        assert_eq!(EventKind::Frame.phase(), Phase::Pre);
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(EventKind::SetConfigstring.to_string(), "set_configstring");
        assert_eq!(Phase::Around.to_string(), "around");
    }

    #[test]
    fn test_conn_state_from_repr() {
        assert_eq!(ConnState::from_repr(3), Some(ConnState::Primed));
        assert_eq!(ConnState::from_repr(9), None);
    }

    #[test]
    fn test_args_serialize_with_event_tag() {
        let args = EventArgs::ServerCommand {
            client_id: None,
            command: "print hi".to_string(),
        };
        let json = serde_json::to_value(&args).unwrap();
        assert_eq!(json["event"], "server_command");
        assert!(json["client_id"].is_null());
    }
}
