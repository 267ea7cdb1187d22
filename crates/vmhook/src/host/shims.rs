//! `extern "C"` replacements for the hooked host routines.
//!
//! Each shim decodes its native arguments, hands the call to the dispatcher
//! and chains to the original through the pointer captured at install time.
//! Text the decision-maker leaves untouched is passed back as the host's own
//! pointer, so a pass-through call sees exactly the bytes it was given.
//!
//! The two variadic routines are declared with a fixed signature wide enough
//! to receive everything the caller may have passed: on x86-64 every integer
//! argument register, `xmm0`-`xmm7` and a fixed number of caller stack words;
//! on x86 only stack words. Forwarding those to `snprintf` in the same
//! positions rebuilds the caller's argument list.

use std::collections::BTreeMap;
use std::ffi::{CStr, CString, c_char, c_int, c_void};
use std::sync::Mutex;

use tracing::warn;

use super::{on_add_command, on_module_offset, original, runtime};
use crate::dispatch::{CommandTarget, UserCmd};
use crate::routine::Routine;

type AddCommandFn = unsafe extern "C" fn(*const c_char, *const c_void);
type SetModuleOffsetFn = unsafe extern "C" fn(*const c_char, *const c_void);
type ExecuteClientCommandFn = unsafe extern "C" fn(*mut c_void, *const c_char, c_int);
type ClientEnterWorldFn = unsafe extern "C" fn(*mut c_void, *mut UserCmd);
type ClientThinkFn = unsafe extern "C" fn(*mut c_void, *mut UserCmd);
type SendServerCommandFn = unsafe extern "C" fn(*mut c_void, *const c_char, ...);
type SetConfigstringFn = unsafe extern "C" fn(c_int, *const c_char);
type DropClientFn = unsafe extern "C" fn(*mut c_void, *const c_char);
type ComPrintfFn = unsafe extern "C" fn(*const c_char, ...);
type SpawnServerFn = unsafe extern "C" fn(*const c_char, c_int);
type InitGameFn = unsafe extern "C" fn(c_int, c_int, c_int);
type RunFrameFn = unsafe extern "C" fn(c_int);
type ClientConnectFn = unsafe extern "C" fn(c_int, c_int, c_int) -> *const c_char;
type EntityFn = unsafe extern "C" fn(*mut c_void);

/// Host buffer sizes (`MAX_MSGLEN` and the `Com_Printf` buffer).
const SERVER_COMMAND_LEN: usize = 16384;
const PRINT_LEN: usize = 4096;

/// Caller stack words received and forwarded by the variadic shims.
#[cfg(target_arch = "x86_64")]
const STACK_WORDS: usize = 8;
#[cfg(target_arch = "x86")]
const STACK_WORDS: usize = 16;

/// Float argument registers (`xmm0`-`xmm7`).
#[cfg(target_arch = "x86_64")]
const FLOAT_REGS: usize = 8;
#[cfg(target_arch = "x86")]
const FLOAT_REGS: usize = 0;

/// Integer registers left for variadic arguments after the fixed ones.
#[cfg(target_arch = "x86_64")]
const SEND_COMMAND_REGS: usize = 4;
#[cfg(target_arch = "x86_64")]
const PRINT_REGS: usize = 5;

/// Integer-class words forwarded to `snprintf`: registers, then stack.
#[cfg(target_arch = "x86_64")]
const INT_WORDS: usize = PRINT_REGS + STACK_WORDS;
#[cfg(target_arch = "x86")]
const INT_WORDS: usize = STACK_WORDS;

/// Format string used to hand preformatted text back to variadic routines.
const VERBATIM: &CStr = c"%s";

/// Last rejection message returned to the host by `ClientConnect`.
static REJECTION: Mutex<Option<CString>> = Mutex::new(None);

pub(super) fn replacements() -> BTreeMap<Routine, usize> {
    BTreeMap::from([
        (Routine::CmdAddCommand, cmd_add_command as *const () as usize),
        (Routine::SysSetModuleOffset, sys_set_module_offset as *const () as usize),
        (Routine::SvExecuteClientCommand, sv_execute_client_command as *const () as usize),
        (Routine::SvClientEnterWorld, sv_client_enter_world as *const () as usize),
        (Routine::SvClientThink, sv_client_think as *const () as usize),
        (Routine::SvSendServerCommand, sv_send_server_command as *const () as usize),
        (Routine::SvSetConfigstring, sv_set_configstring as *const () as usize),
        (Routine::SvDropClient, sv_drop_client as *const () as usize),
        (Routine::ComPrintf, com_printf as *const () as usize),
        (Routine::SvSpawnServer, sv_spawn_server as *const () as usize),
        (Routine::GInitGame, g_init_game as *const () as usize),
        (Routine::GRunFrame, g_run_frame as *const () as usize),
        (Routine::ClientConnect, client_connect as *const () as usize),
        (Routine::GStartKamikaze, g_start_kamikaze as *const () as usize),
        (Routine::ClientSpawn, client_spawn as *const () as usize),
    ])
}

/// Owned copy of a C string; null reads as empty.
///
/// # Safety
///
/// `ptr` is null or points to a NUL-terminated string.
unsafe fn text(ptr: *const c_char) -> String {
    if ptr.is_null() {
        return String::new();
    }
    unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
}

/// Call `call` with the host's own pointer when `chosen` is the untouched
/// `given` text, else with a fresh C copy of `chosen` cut at any NUL.
fn with_text(chosen: &str, given: &str, raw: *const c_char, call: impl FnOnce(*const c_char)) {
    if chosen.as_ptr() == given.as_ptr() && chosen.len() == given.len() {
        return call(raw);
    }
    let head = chosen.split('\0').next().unwrap_or_default();
    let owned = CString::new(head).unwrap_or_default();
    call(owned.as_ptr());
}

/// Arguments a format string consumes, by how they are passed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Conversions {
    /// `int`, `long`, pointers and `*` widths.
    ints: usize,
    /// `long long` and `intmax_t`; two words on x86.
    wide: usize,
    floats: usize,
    long_doubles: usize,
}

impl Conversions {
    fn scan(format: &[u8]) -> Self {
        let mut counts = Self::default();
        let mut i = 0;

        while i < format.len() {
            if format[i] != b'%' {
                i += 1;
                continue;
            }
            i += 1;
            if format.get(i) == Some(&b'%') {
                i += 1;
                continue;
            }

            while format.get(i).is_some_and(|c| b"-+ #0'".contains(c)) {
                i += 1;
            }
            i = counts.skip_field(format, i);
            if format.get(i) == Some(&b'.') {
                i = counts.skip_field(format, i + 1);
            }

            let mut longs = 0;
            let mut long_double = false;
            while let Some(&c) = format.get(i) {
                match c {
                    b'l' => longs += 1,
                    b'j' | b'q' => longs = 2,
                    b'L' => long_double = true,
                    b'h' | b'z' | b't' => {}
                    _ => break,
                }
                i += 1;
            }

            match format.get(i) {
                Some(b'f' | b'F' | b'e' | b'E' | b'g' | b'G' | b'a' | b'A') if long_double => {
                    counts.long_doubles += 1
                }
                Some(b'f' | b'F' | b'e' | b'E' | b'g' | b'G' | b'a' | b'A') => counts.floats += 1,
                Some(b'd' | b'i' | b'u' | b'o' | b'x' | b'X') if longs >= 2 => counts.wide += 1,
                Some(b'd' | b'i' | b'u' | b'o' | b'x' | b'X' | b'c' | b's' | b'p' | b'n') => {
                    counts.ints += 1
                }
                _ => {}
            }
            i += 1;
        }
        counts
    }

    /// Skip a width or precision; `*` takes an `int` argument.
    fn skip_field(&mut self, format: &[u8], mut i: usize) -> usize {
        if format.get(i) == Some(&b'*') {
            self.ints += 1;
            return i + 1;
        }
        while format.get(i).is_some_and(u8::is_ascii_digit) {
            i += 1;
        }
        i
    }
}

/// Variadic arguments of one intercepted call, as received by a shim.
struct VarArgs {
    ints: [usize; INT_WORDS],
    int_count: usize,
    floats: [f64; FLOAT_REGS],
}

impl VarArgs {
    /// `regs` are the integer registers left to the variadic part, in order.
    fn new(regs: &[usize], floats: [f64; FLOAT_REGS], stack: [usize; STACK_WORDS]) -> Self {
        let mut ints = [0; INT_WORDS];
        let (head, tail) = ints.split_at_mut(regs.len());
        head.copy_from_slice(regs);
        tail[..STACK_WORDS].copy_from_slice(&stack);
        Self {
            ints,
            int_count: regs.len() + STACK_WORDS,
            floats,
        }
    }

    /// Whether the received words cover every argument `needed` reads.
    fn carries(&self, needed: &Conversions) -> bool {
        if cfg!(target_arch = "x86_64") {
            needed.floats <= FLOAT_REGS
                && needed.long_doubles == 0
                && needed.ints + needed.wide <= self.int_count
        } else {
            needed.ints + 2 * (needed.floats + needed.wide) + 3 * needed.long_doubles
                <= self.int_count
        }
    }

    /// # Safety
    ///
    /// `fmt` is a valid format string whose arguments [`VarArgs::carries`].
    #[cfg(target_arch = "x86_64")]
    unsafe fn render(&self, fmt: *const c_char, buffer: &mut [u8]) -> c_int {
        let [w0, w1, w2, w3, w4, w5, w6, w7, w8, w9, w10, w11, w12] = self.ints;
        let [f0, f1, f2, f3, f4, f5, f6, f7] = self.floats;
        unsafe {
            libc::snprintf(
                buffer.as_mut_ptr().cast::<c_char>(),
                buffer.len(),
                fmt,
                w0, w1, w2, w3, w4, w5, w6, w7, w8, w9, w10, w11, w12,
                f0, f1, f2, f3, f4, f5, f6, f7,
            )
        }
    }

    /// # Safety
    ///
    /// `fmt` is a valid format string whose arguments [`VarArgs::carries`].
    #[cfg(target_arch = "x86")]
    unsafe fn render(&self, fmt: *const c_char, buffer: &mut [u8]) -> c_int {
        let [w0, w1, w2, w3, w4, w5, w6, w7, w8, w9, w10, w11, w12, w13, w14, w15] = self.ints;
        unsafe {
            libc::snprintf(
                buffer.as_mut_ptr().cast::<c_char>(),
                buffer.len(),
                fmt,
                w0, w1, w2, w3, w4, w5, w6, w7, w8, w9, w10, w11, w12, w13, w14, w15,
            )
        }
    }
}

/// C copy of `bytes` cut at the first NUL and to fit `capacity`.
fn c_text(bytes: &[u8], capacity: usize) -> CString {
    let bytes = &bytes[..bytes.len().min(capacity.saturating_sub(1))];
    let head = bytes.split(|&b| b == 0).next().unwrap_or_default();
    CString::new(head).unwrap_or_default()
}

/// Render a variadic host format string. A format that reads more
/// arguments than `args` carries is passed on unformatted.
///
/// # Safety
///
/// `fmt` is null or a valid format string, and `args` holds what the
/// host passed along with it.
unsafe fn format_variadic(fmt: *const c_char, args: &VarArgs, capacity: usize) -> CString {
    if fmt.is_null() {
        return CString::default();
    }
    let format = unsafe { CStr::from_ptr(fmt) };
    let needed = Conversions::scan(format.to_bytes());
    if !args.carries(&needed) {
        warn!(
            "Format {:?} reads {:?}, more than can be forwarded; passing it unformatted",
            format, needed
        );
        return c_text(format.to_bytes(), capacity);
    }

    let mut buffer = vec![0u8; capacity];
    let written = unsafe { args.render(fmt, &mut buffer) };
    let len = usize::try_from(written)
        .unwrap_or(0)
        .min(capacity.saturating_sub(1));
    c_text(&buffer[..len], capacity)
}

unsafe extern "C" fn cmd_add_command(name: *const c_char, function: *const c_void) {
    on_add_command();
    if let Some(original) = unsafe { original::<AddCommandFn>(Routine::CmdAddCommand) } {
        unsafe { original(name, function) }
    }
}

unsafe extern "C" fn sys_set_module_offset(name: *const c_char, anchor: *const c_void) {
    let module_name = unsafe { text(name) };
    on_module_offset(&module_name, anchor as usize, || {
        if let Some(original) = unsafe { original::<SetModuleOffsetFn>(Routine::SysSetModuleOffset) } {
            unsafe { original(name, anchor) }
        }
    });
}

unsafe extern "C" fn sv_execute_client_command(client: *mut c_void, command: *const c_char, client_ok: c_int) {
    let Some(original) = (unsafe { original::<ExecuteClientCommandFn>(Routine::SvExecuteClientCommand) }) else {
        return;
    };
    let Some(rt) = runtime() else {
        return unsafe { original(client, command, client_ok) };
    };

    let address = client as usize;
    let client_id = if client_ok != 0 && rt.client_has_entity(address) {
        rt.client_id(address)
    } else {
        None
    };
    let given = unsafe { text(command) };
    rt.dispatcher.client_command(client_id, &given, |chosen| {
        with_text(chosen, &given, command, |ptr| unsafe { original(client, ptr, client_ok) })
    });
}

unsafe extern "C" fn sv_client_enter_world(client: *mut c_void, cmd: *mut UserCmd) {
    let Some(original) = (unsafe { original::<ClientEnterWorldFn>(Routine::SvClientEnterWorld) }) else {
        return;
    };
    let address = client as usize;
    let Some((rt, client_id)) = runtime().and_then(|rt| Some((rt, rt.client_id(address)?))) else {
        return unsafe { original(client, cmd) };
    };

    let state_before = rt.client_state(address);
    rt.dispatcher.client_loaded(client_id, state_before, || {
        unsafe { original(client, cmd) };
        rt.client_has_entity(address)
    });
}

unsafe extern "C" fn sv_client_think(client: *mut c_void, cmd: *mut UserCmd) {
    let Some(original) = (unsafe { original::<ClientThinkFn>(Routine::SvClientThink) }) else {
        return;
    };
    let found = runtime().and_then(|rt| Some((rt, rt.client_id(client as usize)?)));
    let (Some((rt, client_id)), false) = (found, cmd.is_null()) else {
        return unsafe { original(client, cmd) };
    };

    // SAFETY: the host passes a valid, exclusively borrowed command.
    let cmd = unsafe { &mut *cmd };
    rt.dispatcher
        .client_think(client_id, cmd, |cmd| unsafe { original(client, cmd as *mut UserCmd) });
}

#[cfg(target_arch = "x86_64")]
#[allow(clippy::too_many_arguments)]
unsafe extern "C" fn sv_send_server_command(
    client: *mut c_void,
    fmt: *const c_char,
    g0: usize, g1: usize, g2: usize, g3: usize,
    f0: f64, f1: f64, f2: f64, f3: f64, f4: f64, f5: f64, f6: f64, f7: f64,
    s0: usize, s1: usize, s2: usize, s3: usize, s4: usize, s5: usize, s6: usize, s7: usize,
) {
    let regs: [usize; SEND_COMMAND_REGS] = [g0, g1, g2, g3];
    let args = VarArgs::new(&regs, [f0, f1, f2, f3, f4, f5, f6, f7], [s0, s1, s2, s3, s4, s5, s6, s7]);
    unsafe { send_server_command(client, fmt, &args) }
}

#[cfg(target_arch = "x86")]
#[allow(clippy::too_many_arguments)]
unsafe extern "C" fn sv_send_server_command(
    client: *mut c_void,
    fmt: *const c_char,
    s0: usize, s1: usize, s2: usize, s3: usize, s4: usize, s5: usize, s6: usize, s7: usize,
    s8: usize, s9: usize, s10: usize, s11: usize, s12: usize, s13: usize, s14: usize, s15: usize,
) {
    let stack = [s0, s1, s2, s3, s4, s5, s6, s7, s8, s9, s10, s11, s12, s13, s14, s15];
    let args = VarArgs::new(&[], [], stack);
    unsafe { send_server_command(client, fmt, &args) }
}

unsafe fn send_server_command(client: *mut c_void, fmt: *const c_char, args: &VarArgs) {
    let Some(original) = (unsafe { original::<SendServerCommandFn>(Routine::SvSendServerCommand) }) else {
        return;
    };
    let formatted = unsafe { format_variadic(fmt, args, SERVER_COMMAND_LEN) };
    let Some(rt) = runtime() else {
        return unsafe { original(client, VERBATIM.as_ptr(), formatted.as_ptr()) };
    };

    let address = client as usize;
    let target = if client.is_null() {
        CommandTarget::Broadcast
    } else if rt.client_has_entity(address) {
        rt.client_id(address)
            .map(CommandTarget::Client)
            .unwrap_or(CommandTarget::Unbound)
    } else {
        CommandTarget::Unbound
    };

    let given = formatted.to_string_lossy().into_owned();
    rt.dispatcher.server_command(target, &given, |chosen| {
        with_text(chosen, &given, formatted.as_ptr(), |ptr| unsafe {
            original(client, VERBATIM.as_ptr(), ptr)
        })
    });
}

unsafe extern "C" fn sv_set_configstring(index: c_int, value: *const c_char) {
    let Some(original) = (unsafe { original::<SetConfigstringFn>(Routine::SvSetConfigstring) }) else {
        return;
    };
    let Some(rt) = runtime() else {
        return unsafe { original(index, value) };
    };

    let given = (!value.is_null()).then(|| unsafe { text(value) });
    rt.dispatcher
        .set_configstring(index, given.as_deref(), |chosen| match (chosen, given.as_deref()) {
            (None, _) => unsafe { original(index, value) },
            (Some(chosen), Some(given)) => {
                with_text(chosen, given, value, |ptr| unsafe { original(index, ptr) })
            }
            (Some(""), None) => unsafe { original(index, value) },
            (Some(chosen), None) => with_text(chosen, "", value, |ptr| unsafe { original(index, ptr) }),
        });
}

unsafe extern "C" fn sv_drop_client(client: *mut c_void, reason: *const c_char) {
    let Some(original) = (unsafe { original::<DropClientFn>(Routine::SvDropClient) }) else {
        return;
    };
    let Some((rt, client_id)) = runtime().and_then(|rt| Some((rt, rt.client_id(client as usize)?))) else {
        return unsafe { original(client, reason) };
    };
    let reason_text = unsafe { text(reason) };
    rt.dispatcher
        .client_disconnect(client_id, &reason_text, || unsafe { original(client, reason) });
}

#[cfg(target_arch = "x86_64")]
#[allow(clippy::too_many_arguments)]
unsafe extern "C" fn com_printf(
    fmt: *const c_char,
    g0: usize, g1: usize, g2: usize, g3: usize, g4: usize,
    f0: f64, f1: f64, f2: f64, f3: f64, f4: f64, f5: f64, f6: f64, f7: f64,
    s0: usize, s1: usize, s2: usize, s3: usize, s4: usize, s5: usize, s6: usize, s7: usize,
) {
    let regs: [usize; PRINT_REGS] = [g0, g1, g2, g3, g4];
    let args = VarArgs::new(&regs, [f0, f1, f2, f3, f4, f5, f6, f7], [s0, s1, s2, s3, s4, s5, s6, s7]);
    unsafe { print(fmt, &args) }
}

#[cfg(target_arch = "x86")]
#[allow(clippy::too_many_arguments)]
unsafe extern "C" fn com_printf(
    fmt: *const c_char,
    s0: usize, s1: usize, s2: usize, s3: usize, s4: usize, s5: usize, s6: usize, s7: usize,
    s8: usize, s9: usize, s10: usize, s11: usize, s12: usize, s13: usize, s14: usize, s15: usize,
) {
    let stack = [s0, s1, s2, s3, s4, s5, s6, s7, s8, s9, s10, s11, s12, s13, s14, s15];
    let args = VarArgs::new(&[], [], stack);
    unsafe { print(fmt, &args) }
}

unsafe fn print(fmt: *const c_char, args: &VarArgs) {
    let Some(original) = (unsafe { original::<ComPrintfFn>(Routine::ComPrintf) }) else {
        return;
    };
    let formatted = unsafe { format_variadic(fmt, args, PRINT_LEN) };
    let Some(rt) = runtime() else {
        return unsafe { original(VERBATIM.as_ptr(), formatted.as_ptr()) };
    };

    let given = formatted.to_string_lossy().into_owned();
    rt.dispatcher.console_print(&given, |_| unsafe {
        original(VERBATIM.as_ptr(), formatted.as_ptr())
    });
}

unsafe extern "C" fn sv_spawn_server(server: *const c_char, kill_bots: c_int) {
    let Some(original) = (unsafe { original::<SpawnServerFn>(Routine::SvSpawnServer) }) else {
        return;
    };
    match runtime() {
        Some(rt) => rt
            .dispatcher
            .spawn_server(|| unsafe { original(server, kill_bots) }),
        None => unsafe { original(server, kill_bots) },
    }
}

unsafe extern "C" fn g_init_game(level_time: c_int, random_seed: c_int, restart: c_int) {
    let Some(original) = (unsafe { original::<InitGameFn>(Routine::GInitGame) }) else {
        return;
    };
    match runtime() {
        Some(rt) => rt.dispatcher.init_game(restart != 0, || unsafe {
            original(level_time, random_seed, restart)
        }),
        None => unsafe { original(level_time, random_seed, restart) },
    }
}

unsafe extern "C" fn g_run_frame(time: c_int) {
    let Some(original) = (unsafe { original::<RunFrameFn>(Routine::GRunFrame) }) else {
        return;
    };
    match runtime() {
        Some(rt) => rt.dispatcher.frame(time, || unsafe { original(time) }),
        None => unsafe { original(time) },
    }
}

unsafe extern "C" fn client_connect(client_num: c_int, first_time: c_int, is_bot: c_int) -> *const c_char {
    let Some(original) = (unsafe { original::<ClientConnectFn>(Routine::ClientConnect) }) else {
        return std::ptr::null();
    };
    let call = || unsafe { original(client_num, first_time, is_bot) };
    let Some(rt) = runtime() else {
        return call();
    };

    rt.dispatcher
        .client_connect(client_num, first_time != 0, is_bot != 0, call, |message| {
            let head = message.split('\0').next().unwrap_or_default();
            let owned = CString::new(head).unwrap_or_default();
            let mut slot = REJECTION.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            slot.insert(owned).as_ptr()
        })
}

unsafe extern "C" fn client_spawn(entity: *mut c_void) {
    let Some(original) = (unsafe { original::<EntityFn>(Routine::ClientSpawn) }) else {
        return;
    };
    let Some((rt, client_id)) = runtime().and_then(|rt| Some((rt, rt.entity_id(entity as usize)?))) else {
        return unsafe { original(entity) };
    };
    rt.dispatcher
        .client_spawn(client_id, || unsafe { original(entity) });
}

unsafe extern "C" fn g_start_kamikaze(entity: *mut c_void) {
    let Some(original) = (unsafe { original::<EntityFn>(Routine::GStartKamikaze) }) else {
        return;
    };
    match runtime() {
        Some(rt) => {
            let owner = rt.kamikaze_owner(entity as usize);
            rt.dispatcher.kamikaze(owner, || unsafe { original(entity) })
        }
        None => unsafe { original(entity) },
    }
}
