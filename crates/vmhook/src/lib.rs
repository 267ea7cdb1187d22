//! # vmhook
//!
//! In-process interception layer for a game server's native game module.
//!
//! This crate provides:
//! - Host layouts describing where each hooked routine lives
//! - Module base discovery and indirect call table resolution
//! - Inline detours with captured originals
//! - A staged lifecycle that installs hooks as the game module loads
//! - An event dispatcher that lets a decision-maker observe, rewrite or
//!   suppress each intercepted call
//!
//! ## Feature Flags
//!
//! - `preload`: Builds the Linux x86/x86-64 host glue. Loading the `cdylib`
//!   into the server process (for example with `LD_PRELOAD`) installs the
//!   bootstrap hooks from `.init_array`.

pub mod config;
pub mod dispatch;
pub mod error;
#[cfg(all(
    feature = "preload",
    target_os = "linux",
    any(target_arch = "x86", target_arch = "x86_64")
))]
pub mod host;
pub mod hook;
pub mod layout;
pub mod lifecycle;
pub mod memory;
pub mod module;
pub mod native;
pub mod routine;
pub mod table;

pub use config::{IndexSpec, VmhookConfig, VmhookConfigBuilder};
pub use dispatch::{
    CommandTarget, ConnState, Decision, DecisionMaker, DispatchEvent, DispatchSettings,
    DispatchStats, Dispatcher, EventArgs, EventKind, KamikazeOwner, KindStats, PassThrough,
    Payload, PayloadKind, Phase, Policy, UserCmd,
};
pub use error::{Error, HookError, LifecycleError, ResolutionError, Result};
pub use hook::{CodePatcher, HookEngine, HookRecord, HookStatus};
pub use layout::{
    HostAbi, HostLayout, RoutineTarget, SlotMode, TableLayout, TableSlot, load_layout,
    save_layout,
};
pub use lifecycle::{LifecycleState, LifecycleStep, Originals, Sequencer};
pub use memory::{LocalMemory, PTR_SIZE, ReadMemory, WriteMemory};
pub use module::{
    AddressResolver, BaseRelative, ModuleHandle, ModuleInfo, ModuleMap, NativeFormula,
    RipRelative, TableFormula,
};
pub use native::NativeView;
pub use routine::{Routine, RoutineGroup};
pub use table::{IndirectTableEntry, TablePatcher};

#[cfg(unix)]
pub use module::DlModuleMap;
#[cfg(all(unix, any(target_arch = "x86", target_arch = "x86_64")))]
pub use hook::DetourPatcher;
#[cfg(all(
    feature = "preload",
    target_os = "linux",
    any(target_arch = "x86", target_arch = "x86_64")
))]
pub use host::set_decision_maker;
