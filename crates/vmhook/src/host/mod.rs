//! Glue for running inside the reference server process (`LD_PRELOAD`).
//!
//! Loading the library runs [`vmhook_init`] from `.init_array`: logging and
//! config are set up, the bootstrap routines are hooked and the
//! [`Sequencer`] waits for the game module notification. The replacement
//! routines in [`shims`] reach the dispatcher through the process-wide
//! [`Runtime`] cell.

mod shims;

use std::cell::RefCell;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use strum::EnumCount;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::VmhookConfig;
use crate::dispatch::{
    ConnState, Decision, DecisionMaker, DispatchEvent, Dispatcher, KamikazeOwner,
};
use crate::error::Error;
use crate::hook::DetourPatcher;
use crate::layout::HostAbi;
use crate::lifecycle::{Originals, Sequencer};
use crate::memory::LocalMemory;
use crate::module::DlModuleMap;
use crate::native::NativeView;
use crate::routine::Routine;

type HostSequencer = Sequencer<DlModuleMap, DetourPatcher, LocalMemory>;
type SharedDecisionMaker = Box<dyn DecisionMaker + Send + Sync>;

/// Original entry points, indexed by `Routine as usize`. Zero until captured.
static ORIGINALS: [AtomicUsize; Routine::COUNT] = [const { AtomicUsize::new(0) }; Routine::COUNT];
static MODULE_BASE: AtomicUsize = AtomicUsize::new(0);
/// Set by the first `Cmd_AddCommand`, once the host's command system is up.
static COMMON_READY: AtomicBool = AtomicBool::new(false);
static RUNTIME: OnceLock<Runtime> = OnceLock::new();
static DECISION_MAKER: OnceLock<SharedDecisionMaker> = OnceLock::new();

thread_local! {
    static SEQUENCER: RefCell<Option<HostSequencer>> = const { RefCell::new(None) };
}

#[cfg(not(test))]
#[used]
#[unsafe(link_section = ".init_array")]
static INIT: extern "C" fn() = vmhook_init;

/// Register the scripting layer. Only the first registration takes effect;
/// until then every event passes through.
pub fn set_decision_maker(decider: SharedDecisionMaker) -> bool {
    DECISION_MAKER.set(decider).is_ok()
}

/// Forwards to the registered decision-maker.
struct Registered;

impl DecisionMaker for Registered {
    fn decide(&self, event: &DispatchEvent) -> Decision {
        DECISION_MAKER
            .get()
            .map(|d| d.decide(event))
            .unwrap_or_default()
    }

    fn ready(&self, originals: &Originals) {
        match DECISION_MAKER.get() {
            Some(d) => d.ready(originals),
            None => info!("No decision-maker registered; events pass through"),
        }
    }
}

pub(crate) struct Runtime {
    dispatcher: Dispatcher<Registered>,
    abi: Option<HostAbi>,
    memory: LocalMemory,
}

impl Runtime {
    fn view(&self) -> Option<NativeView<'_, LocalMemory>> {
        let abi = self.abi.as_ref()?;
        Some(NativeView::new(&self.memory, abi, MODULE_BASE.load(Ordering::Acquire)))
    }

    fn client_id(&self, client: usize) -> Option<i32> {
        self.view()?
            .client_id(client)
            .inspect_err(|e| debug!("Unknown client {:#x}: {}", client, e))
            .ok()
    }

    fn client_state(&self, client: usize) -> Option<ConnState> {
        self.view()?.client_state(client).ok().flatten()
    }

    fn client_has_entity(&self, client: usize) -> bool {
        self.view()
            .and_then(|v| v.client_has_entity(client).ok())
            .unwrap_or(false)
    }

    fn entity_id(&self, entity: usize) -> Option<i32> {
        self.view()?
            .entity_id(entity)
            .inspect_err(|e| debug!("Unknown entity {:#x}: {}", entity, e))
            .ok()
    }

    fn kamikaze_owner(&self, entity: usize) -> KamikazeOwner {
        self.view()
            .and_then(|v| v.kamikaze_owner(entity).ok())
            .unwrap_or(KamikazeOwner {
                client_id: None,
                used_on_demand: false,
            })
    }
}

pub(crate) fn runtime() -> Option<&'static Runtime> {
    RUNTIME.get()
}

/// Stored original of `routine` as a typed function pointer.
///
/// # Safety
///
/// `F` must be the function pointer type matching the host routine.
pub(crate) unsafe fn original<F: Copy>(routine: Routine) -> Option<F> {
    debug_assert_eq!(std::mem::size_of::<F>(), std::mem::size_of::<usize>());
    let address = ORIGINALS[routine as usize].load(Ordering::Acquire);
    if address == 0 {
        error!("{} called before its original was captured", routine);
        return None;
    }
    // SAFETY: non-zero slots hold entry points captured for `routine`.
    Some(unsafe { std::mem::transmute_copy::<usize, F>(&address) })
}

fn publish(originals: &Originals) {
    for (routine, address) in originals.iter() {
        ORIGINALS[routine as usize].store(address, Ordering::Release);
    }
}

fn fatal(err: Error) -> ! {
    error!("vmhook startup failed: {}", err);
    std::process::exit(1);
}

fn init_logging(filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

extern "C" fn vmhook_init() {
    let config = VmhookConfig::load_default();
    let filter = config
        .as_ref()
        .map(|c| c.log_filter.clone())
        .unwrap_or_else(|_| crate::config::DEFAULT_LOG_FILTER.to_string());
    init_logging(&filter);

    if let Err(e) = config.and_then(|config| start(&config)) {
        fatal(e);
    }
}

fn start(config: &VmhookConfig) -> Result<(), Error> {
    info!("vmhook {} loading", env!("CARGO_PKG_VERSION"));
    let layout = config.host_layout()?;
    if layout.abi.is_none() {
        warn!("Layout has no abi section; client events cannot be identified and pass through");
    }

    let state = Runtime {
        dispatcher: Dispatcher::with_settings(Registered, config.dispatch_settings()),
        abi: layout.abi.clone(),
        memory: LocalMemory::new(),
    };
    if RUNTIME.set(state).is_err() {
        warn!("vmhook initialized twice; ignoring");
        return Ok(());
    }

    // SAFETY: every replacement in `shims::replacements` is declared with the
    // signature and calling convention of the routine it replaces, and the
    // host is still single threaded while the library initializes.
    let patcher = unsafe { DetourPatcher::new() };
    let mut sequencer = Sequencer::new(
        layout,
        shims::replacements(),
        DlModuleMap,
        patcher,
        LocalMemory::new(),
    );
    sequencer.on_ready(|originals| {
        publish(originals);
        if let Some(runtime) = runtime() {
            runtime.dispatcher.ready(originals);
        }
        info!("vmhook ready ({} originals captured)", originals.len());
    });

    let originals = sequencer.install_bootstrap()?;
    publish(originals);
    SEQUENCER.with(|cell| *cell.borrow_mut() = Some(sequencer));
    Ok(())
}

/// Module-offset notification, forwarded through the sequencer.
fn on_module_offset(module_name: &str, anchor: usize, forward: impl FnOnce()) {
    if !COMMON_READY.load(Ordering::Acquire) {
        debug!("Module '{}' announced before host init; forwarding", module_name);
        return forward();
    }

    let result = SEQUENCER.with(|cell| {
        let Ok(mut guard) = cell.try_borrow_mut() else {
            warn!("Nested module notification for '{}'; forwarding", module_name);
            forward();
            return Ok(());
        };
        let Some(sequencer) = guard.as_mut() else {
            warn!(
                "No sequencer on this thread; forwarding '{}' without startup",
                module_name
            );
            forward();
            return Ok(());
        };

        let result = sequencer.handle_module_offset(module_name, anchor, |originals| {
            publish(originals);
            forward();
        });
        if let Some(module) = sequencer.module() {
            MODULE_BASE.store(module.base(), Ordering::Release);
        }
        result.map(|_| ())
    });

    if let Err(e) = result {
        fatal(e.into());
    }
}

fn on_add_command() {
    if !COMMON_READY.swap(true, Ordering::AcqRel) {
        debug!("Host command system initialized");
    }
}
