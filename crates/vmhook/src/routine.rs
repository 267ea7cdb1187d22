//! Catalogue of host routines the engine knows how to intercept.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumCount, EnumIter, EnumString, IntoEnumIterator, IntoStaticStr};

/// When a routine becomes hookable and how its redirection is installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum RoutineGroup {
    /// Hooked by the preload entry point; delivers the notifications the
    /// lifecycle is driven by.
    Bootstrap,
    /// Lives in the host executable, code-patched once the module base is known.
    Static,
    /// Reached through a slot of the indirect call table.
    Table,
    /// Lives inside the target module, code-patched after the table.
    Module,
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
    Deserialize,
    EnumCount,
    EnumIter,
    EnumString,
    IntoStaticStr,
    Display,
)]
pub enum Routine {
    #[strum(serialize = "Cmd_AddCommand")]
    #[serde(rename = "Cmd_AddCommand")]
    CmdAddCommand,
    #[strum(serialize = "Sys_SetModuleOffset")]
    #[serde(rename = "Sys_SetModuleOffset")]
    SysSetModuleOffset,
    #[strum(serialize = "SV_ExecuteClientCommand")]
    #[serde(rename = "SV_ExecuteClientCommand")]
    SvExecuteClientCommand,
    #[strum(serialize = "SV_ClientEnterWorld")]
    #[serde(rename = "SV_ClientEnterWorld")]
    SvClientEnterWorld,
    #[strum(serialize = "SV_ClientThink")]
    #[serde(rename = "SV_ClientThink")]
    SvClientThink,
    #[strum(serialize = "SV_SendServerCommand")]
    #[serde(rename = "SV_SendServerCommand")]
    SvSendServerCommand,
    #[strum(serialize = "SV_SetConfigstring")]
    #[serde(rename = "SV_SetConfigstring")]
    SvSetConfigstring,
    #[strum(serialize = "SV_DropClient")]
    #[serde(rename = "SV_DropClient")]
    SvDropClient,
    #[strum(serialize = "Com_Printf")]
    #[serde(rename = "Com_Printf")]
    ComPrintf,
    #[strum(serialize = "SV_SpawnServer")]
    #[serde(rename = "SV_SpawnServer")]
    SvSpawnServer,
    #[strum(serialize = "G_InitGame")]
    #[serde(rename = "G_InitGame")]
    GInitGame,
    #[strum(serialize = "G_RunFrame")]
    #[serde(rename = "G_RunFrame")]
    GRunFrame,
    #[strum(serialize = "ClientUserinfoChanged")]
    #[serde(rename = "ClientUserinfoChanged")]
    ClientUserinfoChanged,
    #[strum(serialize = "ClientBegin")]
    #[serde(rename = "ClientBegin")]
    ClientBegin,
    #[strum(serialize = "ClientConnect")]
    #[serde(rename = "ClientConnect")]
    ClientConnect,
    #[strum(serialize = "G_StartKamikaze")]
    #[serde(rename = "G_StartKamikaze")]
    GStartKamikaze,
    #[strum(serialize = "ClientSpawn")]
    #[serde(rename = "ClientSpawn")]
    ClientSpawn,
}

impl Routine {
    pub fn group(&self) -> RoutineGroup {
        match self {
            Self::CmdAddCommand | Self::SysSetModuleOffset => RoutineGroup::Bootstrap,
            Self::SvExecuteClientCommand
            | Self::SvClientEnterWorld
            | Self::SvClientThink
            | Self::SvSendServerCommand
            | Self::SvSetConfigstring
            | Self::SvDropClient
            | Self::ComPrintf
            | Self::SvSpawnServer => RoutineGroup::Static,
            Self::GInitGame | Self::GRunFrame | Self::ClientUserinfoChanged | Self::ClientBegin => {
                RoutineGroup::Table
            }
            Self::ClientConnect | Self::GStartKamikaze | Self::ClientSpawn => RoutineGroup::Module,
        }
    }

    /// Symbol name as it appears in the host binary.
    pub fn symbol(&self) -> &'static str {
        self.into()
    }

    /// All routines belonging to `group`, in catalogue order.
    pub fn in_group(group: RoutineGroup) -> impl Iterator<Item = Routine> {
        Self::iter().filter(move |r| r.group() == group)
    }
}
