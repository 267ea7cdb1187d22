//! Startup sequencing.
//!
//! The host announces each loaded game module through a module-offset
//! notification. For the target module, [`Sequencer::handle_module_offset`]
//! walks the one-way state machine
//!
//! ```text
//! Unresolved -> ModuleBaseKnown -> StaticHooksInstalled -> TableResolved
//!            -> TableHooksInstalled -> Ready
//! ```
//!
//! forwarding to the host's own notification routine between the static
//! hooks and the table lookup, since the table is only populated once the
//! host has finished loading the module. Every error is fatal to the caller.

use std::collections::BTreeMap;

use serde::Serialize;
use strum::Display;
use tracing::{debug, error, info, warn};

use crate::error::{HookError, LifecycleError, ResolutionError};
use crate::hook::{CodePatcher, HookEngine};
use crate::layout::{HostLayout, RoutineTarget, SlotMode, find_pattern, parse_pattern};
use crate::memory::WriteMemory;
use crate::module::{AddressResolver, ModuleHandle, ModuleMap};
use crate::routine::{Routine, RoutineGroup};
use crate::table::TablePatcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Display)]
pub enum LifecycleState {
    Unresolved,
    ModuleBaseKnown,
    StaticHooksInstalled,
    TableResolved,
    TableHooksInstalled,
    Ready,
}

impl LifecycleState {
    fn next(self) -> Option<Self> {
        match self {
            Self::Unresolved => Some(Self::ModuleBaseKnown),
            Self::ModuleBaseKnown => Some(Self::StaticHooksInstalled),
            Self::StaticHooksInstalled => Some(Self::TableResolved),
            Self::TableResolved => Some(Self::TableHooksInstalled),
            Self::TableHooksInstalled => Some(Self::Ready),
            Self::Ready => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
pub enum LifecycleStep {
    #[strum(serialize = "bootstrap hook installation")]
    BootstrapHooks,
    #[strum(serialize = "module base discovery")]
    ModuleBase,
    #[strum(serialize = "static hook installation")]
    StaticHooks,
    #[strum(serialize = "table resolution")]
    TableResolution,
    #[strum(serialize = "table hook installation")]
    TableHooks,
    #[strum(serialize = "module hook installation")]
    ModuleHooks,
}

/// Entry points of the original routines, keyed by routine.
///
/// Code hooks contribute their trampolines, table slots the pointer they
/// held before the swap.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Originals(BTreeMap<Routine, usize>);

impl Originals {
    pub fn get(&self, routine: Routine) -> Option<usize> {
        self.0.get(&routine).copied()
    }

    pub fn contains(&self, routine: Routine) -> bool {
        self.0.contains_key(&routine)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Routine, usize)> + '_ {
        self.0.iter().map(|(r, a)| (*r, *a))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn insert(&mut self, routine: Routine, original: usize) {
        self.0.insert(routine, original);
    }
}

type ReadyListener = Box<dyn FnOnce(&Originals)>;

pub struct Sequencer<M, P, W> {
    layout: HostLayout,
    replacements: BTreeMap<Routine, usize>,
    resolver: AddressResolver<M>,
    hooks: HookEngine<P>,
    table: TablePatcher<W>,
    state: LifecycleState,
    module: Option<ModuleHandle>,
    anchor: Option<usize>,
    table_base: Option<usize>,
    originals: Originals,
    listeners: Vec<ReadyListener>,
}

impl<M, P, W> Sequencer<M, P, W>
where
    M: ModuleMap,
    P: CodePatcher,
    W: WriteMemory,
{
    /// `replacements` maps every routine that gets redirected to the address
    /// of its replacement. Capture-only table slots need no entry.
    pub fn new(
        layout: HostLayout,
        replacements: BTreeMap<Routine, usize>,
        modules: M,
        patcher: P,
        memory: W,
    ) -> Self {
        let resolver = AddressResolver::native(modules, layout.table.addend64, layout.table.addend32);
        Self {
            layout,
            replacements,
            resolver,
            hooks: HookEngine::new(patcher),
            table: TablePatcher::new(memory),
            state: LifecycleState::Unresolved,
            module: None,
            anchor: None,
            table_base: None,
            originals: Originals::default(),
            listeners: Vec::new(),
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn layout(&self) -> &HostLayout {
        &self.layout
    }

    pub fn module(&self) -> Option<&ModuleHandle> {
        self.module.as_ref()
    }

    pub fn table_base(&self) -> Option<usize> {
        self.table_base
    }

    pub fn originals(&self) -> &Originals {
        &self.originals
    }

    pub fn hooks(&self) -> &HookEngine<P> {
        &self.hooks
    }

    pub fn table(&self) -> &TablePatcher<W> {
        &self.table
    }

    /// Run `listener` once startup reaches `Ready`.
    pub fn on_ready(&mut self, listener: impl FnOnce(&Originals) + 'static) {
        self.listeners.push(Box::new(listener));
    }

    /// Whether a module-offset notification for `module_name` drives startup.
    /// The host announces modules by their bare name, compared exactly.
    pub fn is_target(&self, module_name: &str) -> bool {
        module_name == self.layout.target_module
    }

    /// Hook the routines that deliver the notifications startup is driven by.
    /// They live in the host executable and can be patched before any module
    /// is loaded.
    pub fn install_bootstrap(&mut self) -> Result<&Originals, LifecycleError> {
        if self.state != LifecycleState::Unresolved {
            return Err(LifecycleError::Transition {
                from: self.state,
                to: LifecycleState::Unresolved,
            });
        }
        let routines: Vec<_> = Routine::in_group(RoutineGroup::Bootstrap).collect();
        self.install_batch(LifecycleStep::BootstrapHooks, &routines)?;
        Ok(&self.originals)
    }

    /// Drive startup from one module-offset notification.
    ///
    /// `forward` runs the host's own notification routine and receives the
    /// originals captured so far, so the freshly installed static hooks can
    /// chain while the host loads the module. It is skipped only when an
    /// earlier step fails. Modules that are not the target and repeated
    /// notifications are forwarded and change nothing else.
    pub fn handle_module_offset(
        &mut self,
        module_name: &str,
        anchor: usize,
        forward: impl FnOnce(&Originals),
    ) -> Result<LifecycleState, LifecycleError> {
        if !self.is_target(module_name) {
            debug!("Ignoring module '{}' at {:#x}", module_name, anchor);
            forward(&self.originals);
            return Ok(self.state);
        }

        if self.state != LifecycleState::Unresolved {
            warn!(
                "Module '{}' announced again at {:#x} in state {}; ignoring",
                module_name, anchor, self.state
            );
            forward(&self.originals);
            return Ok(self.state);
        }

        let module = self
            .resolver
            .resolve_module_base(anchor)
            .map_err(|source| LifecycleError::ModuleBase {
                module: module_name.to_string(),
                source,
            })?;
        self.module = Some(module);
        self.anchor = Some(anchor);
        self.advance(LifecycleState::ModuleBaseKnown)?;

        let statics: Vec<_> = Routine::in_group(RoutineGroup::Static).collect();
        self.install_batch(LifecycleStep::StaticHooks, &statics)?;
        self.advance(LifecycleState::StaticHooksInstalled)?;

        forward(&self.originals);

        let table_base = self.resolve_table()?;
        self.table_base = Some(table_base);
        self.advance(LifecycleState::TableResolved)?;

        self.install_table_slots(table_base)?;
        let module_routines: Vec<_> = Routine::in_group(RoutineGroup::Module).collect();
        self.install_batch(LifecycleStep::ModuleHooks, &module_routines)?;
        self.advance(LifecycleState::TableHooksInstalled)?;

        self.advance(LifecycleState::Ready)?;
        for listener in self.listeners.drain(..) {
            listener(&self.originals);
        }
        Ok(self.state)
    }

    fn advance(&mut self, to: LifecycleState) -> Result<(), LifecycleError> {
        if self.state.next() != Some(to) {
            return Err(LifecycleError::Transition {
                from: self.state,
                to,
            });
        }
        info!("Lifecycle: {} -> {}", self.state, to);
        self.state = to;
        Ok(())
    }

    fn resolve_table(&self) -> Result<usize, LifecycleError> {
        let module = self
            .module
            .as_ref()
            .ok_or(LifecycleError::Transition {
                from: self.state,
                to: LifecycleState::TableResolved,
            })?;
        let known = match self.layout.table.known_routine {
            Some(routine) => self
                .locate(routine)
                .map_err(|source| LifecycleError::Locate {
                    step: LifecycleStep::TableResolution,
                    source,
                })?,
            None => self.anchor.unwrap_or_default(),
        };

        self.resolver
            .resolve_table(
                self.table.memory(),
                module,
                known,
                self.layout.table.displacement_offset,
            )
            .map_err(LifecycleError::Table)
    }

    /// Entry point of `routine` according to the layout.
    fn locate(&self, routine: Routine) -> Result<usize, ResolutionError> {
        let target = self
            .layout
            .target(routine)
            .ok_or(ResolutionError::MissingTarget { routine })?;
        let overflow = || ResolutionError::Overflow {
            field: self.module.as_ref().map(ModuleHandle::base).unwrap_or_default(),
        };

        match target {
            RoutineTarget::Absolute { address } => usize::try_from(*address).map_err(|_| overflow()),
            RoutineTarget::ModuleOffset { offset } => self
                .module
                .as_ref()
                .ok_or(ResolutionError::MissingTarget { routine })?
                .offset(*offset)
                .ok_or_else(overflow),
            RoutineTarget::AnchorOffset { offset } => {
                let anchor = self.anchor.ok_or(ResolutionError::MissingTarget { routine })?;
                usize::try_from(*offset)
                    .ok()
                    .and_then(|o| anchor.checked_add(o))
                    .ok_or_else(overflow)
            }
            RoutineTarget::Signature { pattern, scan_len } => self.scan(routine, pattern, *scan_len),
        }
    }

    fn scan(&self, routine: Routine, pattern: &str, scan_len: u64) -> Result<usize, ResolutionError> {
        let module = self
            .module
            .as_ref()
            .ok_or(ResolutionError::MissingTarget { routine })?;
        let not_found = || ResolutionError::SignatureNotFound { routine };

        let pattern = parse_pattern(pattern).map_err(|_| not_found())?;
        let len = usize::try_from(scan_len).map_err(|_| not_found())?;
        let image = self
            .table
            .memory()
            .read_bytes(module.base(), len)
            .map_err(|_| not_found())?;

        let offset = find_pattern(&image, &pattern).ok_or_else(not_found)?;
        debug!("Signature for {} matched at {}+{:#x}", routine, module.name(), offset);
        Ok(module.base() + offset)
    }

    /// Code-hook `routines`. Every failure is logged; any failure fails the
    /// batch.
    fn install_batch(&mut self, step: LifecycleStep, routines: &[Routine]) -> Result<(), LifecycleError> {
        let mut targets = Vec::with_capacity(routines.len());
        for &routine in routines {
            let target = self
                .locate(routine)
                .map_err(|source| LifecycleError::Locate { step, source })?;
            targets.push((routine, target));
        }

        let mut failures = Vec::new();
        for (routine, target) in targets {
            let result = match self.replacements.get(&routine) {
                Some(&replacement) => self.hooks.install(target, replacement),
                None => Err(HookError::invalid(target, "no replacement registered")),
            };
            match result {
                Ok(original) => {
                    debug!("{}: {:#x} hooked, original {:#x}", routine, target, original);
                    self.originals.insert(routine, original);
                }
                Err(e) => {
                    error!("Failed to hook {} at {:#x}: {}", routine, target, e);
                    failures.push((routine, e));
                }
            }
        }

        if failures.is_empty() {
            info!("{}: {} routine(s) hooked", step, routines.len());
            Ok(())
        } else {
            Err(LifecycleError::HookBatch { step, failures })
        }
    }

    fn install_table_slots(&mut self, table_base: usize) -> Result<(), LifecycleError> {
        let step = LifecycleStep::TableHooks;
        let slots: Vec<_> = self
            .layout
            .table
            .slots
            .iter()
            .map(|(routine, slot)| (*routine, *slot))
            .collect();

        let mut failures = Vec::new();
        for (routine, slot) in slots {
            let result = match slot.mode {
                SlotMode::Capture => self.table.capture_table_slot(table_base, slot.offset),
                SlotMode::Replace => match self.replacements.get(&routine) {
                    Some(&replacement) => {
                        self.table
                            .patch_table_slot(table_base, slot.offset, replacement)
                    }
                    None => Err(HookError::invalid(table_base, "no replacement registered")),
                },
            };
            match result {
                Ok(original) => {
                    self.originals.insert(routine, original);
                }
                Err(e) => {
                    error!("Failed to {:?} table slot {} (+{:#x}): {}", slot.mode, routine, slot.offset, e);
                    failures.push((routine, e));
                }
            }
        }

        if failures.is_empty() {
            info!("{}: {} slot(s) at {:#x}", step, self.layout.table.slots.len(), table_base);
            Ok(())
        } else {
            Err(LifecycleError::HookBatch { step, failures })
        }
    }
}
