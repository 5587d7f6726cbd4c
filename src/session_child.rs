//! The privileged session helper
//!
//! The daemon re-execs its own binary with `--session-child <READFD>
//! <WRITEFD>` for every session. This process runs the PAM stack, relays
//! the PAM conversation over the inherited pipes, and on success becomes
//! the supervisor of the user's session: it drops to the target identity
//! in the required order, execs the session command in a grandchild, and
//! stays alive to do the privileged teardown (utmp, X authority removal,
//! pam_close_session) when the session exits.
//!
//! Ordering constraints that must not be reshuffled:
//!   initgroups        while still root, before any credential change
//!   pam_setcred       before pam_open_session
//!   pam_open_session  while still root (logind, ConsoleKit need it)
//!   X authority write with the user's effective identity only
//!   setsid → setgid → setuid → chdir(home) in the grandchild
//!   log file opened after the uid change, so symlinks in $HOME are
//!   resolved with the user's own privileges (matters on root-squash NFS)

use std::ffi::{CStr, CString};
use std::fs::File;
use std::os::fd::{FromRawFd, RawFd};
use std::path::Path;
use std::sync::atomic::{AtomicI32, Ordering};

use anyhow::{Context, Result};
use libc::{c_int, c_void};
use nix::sys::signal::{self, SigAction, SigHandler, SigSet, SaFlags, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{chdir, fork, initgroups, setegid, seteuid, setgid, setsid, setuid, ForkResult, Gid, Uid};

use crate::accounts::UserRecord;
use crate::error::{DmError, PamError};
use crate::ipc::{self, SessionLaunch, SessionSetup, CLASS_GREETER};
use crate::logfile;
use crate::pam::{
    self, style_needs_response, PamHandle, PamResponse, PAM_AUTH_ERR,
    PAM_BUF_ERR, PAM_CONV_ERR, PAM_DELETE_CRED, PAM_ESTABLISH_CRED, PAM_NEW_AUTHTOK_REQD,
    PAM_REINITIALIZE_CRED, PAM_RHOST, PAM_SUCCESS, PAM_TTY, PAM_USER_UNKNOWN, PAM_XDISPLAY,
};
use crate::registrar::Registrar;
use crate::secret;
use crate::utmp::{self, SessionStamp};
use crate::xauthority;

/// Pid of the exec'd session, for the SIGTERM forwarder. 0 = none yet.
static SESSION_PID: AtomicI32 = AtomicI32::new(0);

extern "C" fn forward_sigterm(_signum: c_int) {
    let pid = SESSION_PID.load(Ordering::Relaxed);
    if pid > 0 {
        unsafe {
            libc::kill(pid, libc::SIGTERM);
        }
    }
}

/// Conversation relay state; its address is libpam's appdata pointer and
/// must stay stable for the life of the PAM handle.
struct ConversationState {
    from_daemon: File,
    to_daemon: File,
    is_interactive: bool,
    /// Set once the authentication result has been reported. After that
    /// nobody is answering prompts any more.
    auth_complete: bool,
}

extern "C" fn conversation(
    num_msg: c_int,
    msg: *const *const pam::PamMessage,
    resp: *mut *mut PamResponse,
    appdata: *mut c_void,
) -> c_int {
    if num_msg <= 0 || msg.is_null() || resp.is_null() || appdata.is_null() {
        return PAM_CONV_ERR;
    }
    let state = unsafe { &mut *(appdata as *mut ConversationState) };
    let count = num_msg as usize;

    let mut prompts = Vec::with_capacity(count);
    let mut needs_response = false;
    for i in 0..count {
        let message = unsafe { &**msg.add(i) };
        let text = if message.msg.is_null() {
            String::new()
        } else {
            unsafe { CStr::from_ptr(message.msg) }
                .to_string_lossy()
                .into_owned()
        };
        if style_needs_response(message.msg_style) {
            needs_response = true;
        }
        prompts.push((message.msg_style, text));
    }

    let mut answers: Vec<Option<secret::SecureBuffer>> = if state.auth_complete {
        // After the result is reported nobody is answering; acknowledge
        // every message, prompt or not, so setcred/open_session modules
        // that still talk cannot wedge the launch.
        (0..count).map(|_| None).collect()
    } else if needs_response && !state.is_interactive {
        // Nobody can answer: a non-interactive transaction must not hang
        // on a prompt.
        return PAM_CONV_ERR;
    } else {
        if ipc::write_prompts(&mut state.to_daemon, &prompts).is_err() {
            return PAM_CONV_ERR;
        }
        match ipc::read_responses(&mut state.from_daemon, count) {
            Ok(answers) => answers,
            Err(_) => return PAM_CONV_ERR,
        }
    };

    // libpam frees the responses with free(3), so they must come from the
    // C allocator.
    let responses =
        unsafe { libc::calloc(count, std::mem::size_of::<PamResponse>()) } as *mut PamResponse;
    if responses.is_null() {
        return PAM_BUF_ERR;
    }
    for (i, answer) in answers.iter_mut().enumerate() {
        let slot = unsafe { &mut *responses.add(i) };
        slot.resp_retcode = 0;
        slot.resp = match answer.take() {
            // The locked buffer wipes itself when it drops after the strdup
            Some(buf) => CString::new(buf.as_bytes())
                .map(|c| unsafe { libc::strdup(c.as_ptr()) })
                .unwrap_or(std::ptr::null_mut()),
            None => std::ptr::null_mut(),
        };
    }
    unsafe {
        *resp = responses;
    }
    PAM_SUCCESS
}

/// Entry point for `duskdm --session-child <READFD> <WRITEFD>`.
pub fn run(read_fd: RawFd, write_fd: RawFd) -> i32 {
    // Passwords pass through this address space; keep it out of swap.
    secret::lock_process_memory();

    // Safety: the daemon passed us exclusive ownership of these fds.
    let from_daemon = unsafe { File::from_raw_fd(read_fd) };
    let to_daemon = unsafe { File::from_raw_fd(write_fd) };

    match run_inner(from_daemon, to_daemon) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("duskdm session helper: {e:#}");
            1
        }
    }
}

fn run_inner(from_daemon: File, to_daemon: File) -> Result<i32> {
    let mut from_daemon = from_daemon;
    let setup = SessionSetup::read(&mut from_daemon).context("reading session setup")?;

    let mut conv = Box::new(ConversationState {
        from_daemon,
        to_daemon,
        is_interactive: setup.is_interactive,
        auth_complete: false,
    });
    let appdata = &mut *conv as *mut ConversationState as *mut c_void;

    let mut pam = PamHandle::start(&setup.service, setup.username.as_deref(), conversation, appdata)
        .map_err(|code| DmError::Pam(PamError::new(code, "pam_start failed")))?;

    match (&setup.tty, &setup.xdisplay) {
        (Some(tty), _) => {
            pam.set_item_str(PAM_TTY, tty);
        }
        (None, Some(xdisplay)) => {
            pam.set_item_str(PAM_TTY, xdisplay);
        }
        (None, None) => {}
    }
    if let Some(host) = &setup.remote_host {
        pam.set_item_str(PAM_RHOST, host);
    }
    if let Some(xdisplay) = &setup.xdisplay {
        pam.set_item_str(PAM_XDISPLAY, xdisplay);
    }
    if let Some(record) = &setup.xauth {
        pam.set_xauth_data(&record.name, &record.data);
    }

    let mut result = PAM_SUCCESS;
    if setup.do_authenticate {
        result = pam.authenticate();
        if result == PAM_SUCCESS {
            result = pam.acct_mgmt();
            if result == PAM_NEW_AUTHTOK_REQD {
                result = pam.chauthtok();
            }
        }
    }

    // Modules may have mapped the login name; whatever PAM_USER now says
    // must resolve to a real local account.
    let mapped_name = pam.user();
    let user = match mapped_name.as_deref() {
        Some(username) => UserRecord::lookup(username)?,
        None => None,
    };
    if result == PAM_SUCCESS && user.is_none() {
        let err = PamError::user_unknown(mapped_name.as_deref().unwrap_or("?"));
        eprintln!("duskdm session helper: {err}");
        result = err.code;
    }

    if result == PAM_AUTH_ERR {
        utmp::record_failed_login(&SessionStamp {
            username: setup.username.clone().unwrap_or_default(),
            tty: setup.tty.clone(),
            xdisplay: setup.xdisplay.clone(),
            remote_host: setup.remote_host.clone(),
            pid: std::process::id() as i32,
        });
    }

    conv.auth_complete = true;
    ipc::write_auth_result(
        &mut conv.to_daemon,
        &ipc::AuthResult {
            username: mapped_name.clone(),
            complete: true,
            code: result,
            message: pam.strerror(result),
        },
    )
    .context("reporting result")?;

    if result != PAM_SUCCESS {
        return Ok(result);
    }
    let user = match user {
        Some(user) => user,
        None => return Ok(PAM_USER_UNKNOWN),
    };

    let launch = SessionLaunch::read(&mut conv.from_daemon).context("reading launch request")?;

    // No command: the daemon just wants the user's kerberos tickets etc.
    // refreshed.
    if launch.argv.is_empty() {
        pam.setcred(PAM_REINITIALIZE_CRED);
        return Ok(0);
    }

    // Supplementary groups while we are still root; they are inherited
    // across the coming fork.
    let c_username = CString::new(user.name.clone()).context("username contains NUL")?;
    initgroups(&c_username, user.gid).map_err(|e| DmError::privilege("initgroups", e.into()))?;

    let result = pam.setcred(PAM_ESTABLISH_CRED);
    if result != PAM_SUCCESS {
        eprintln!("duskdm session helper: pam_setcred: {}", pam.strerror(result));
        return Ok(result);
    }
    let result = pam.open_session();
    if result != PAM_SUCCESS {
        eprintln!("duskdm session helper: pam_open_session: {}", pam.strerror(result));
        pam.setcred(PAM_DELETE_CRED);
        return Ok(result);
    }

    let registrar = Registrar::probe().context("probing session registrar")?;
    if let Some(cookie) = registrar.session_cookie() {
        // Best effort; losing the daemon does not stop the session.
        let _ = ipc::write_registration(&mut conv.to_daemon, cookie);
    }

    pam.putenv(&format!("USER={}", user.name));
    pam.putenv(&format!("LOGNAME={}", user.name));
    pam.putenv(&format!("HOME={}", user.home.display()));
    pam.putenv(&format!("SHELL={}", user.shell.display()));
    if pam.getenv("PATH").is_none() {
        pam.putenv("PATH=/usr/local/bin:/usr/bin:/bin");
    }
    if let Some(cookie) = registrar.session_cookie() {
        pam.putenv(&format!("XDG_SESSION_COOKIE={cookie}"));
    }
    if let Some(path) = &launch.xauth_path {
        pam.putenv(&format!("XAUTHORITY={path}"));
    }
    for entry in &launch.env {
        pam.putenv(entry);
    }

    if let (Some(path), Some(record)) = (&launch.xauth_path, &setup.xauth) {
        if let Err(e) = with_user_identity(user.uid, user.gid, || {
            xauthority::update_file(Path::new(path), record)
        }) {
            eprintln!("duskdm session helper: writing X authority: {e:#}");
        }
    }

    let env = pam.environment();
    let argv: Vec<CString> = launch
        .argv
        .iter()
        .map(|arg| CString::new(arg.as_str()))
        .collect::<std::result::Result<_, _>>()
        .context("session argv contains NUL")?;

    match unsafe { fork() }.context("forking session")? {
        ForkResult::Child => {
            let err = exec_session(&user, &launch, &argv, &env);
            eprintln!("duskdm session helper: exec {}: {err}", launch.argv[0]);
            unsafe { libc::_exit(127) }
        }
        ForkResult::Parent { child } => {
            SESSION_PID.store(child.as_raw(), Ordering::SeqCst);
            let action = SigAction::new(
                SigHandler::Handler(forward_sigterm),
                SaFlags::SA_RESTART,
                SigSet::empty(),
            );
            unsafe {
                let _ = signal::sigaction(Signal::SIGTERM, &action);
            }

            let stamp = SessionStamp {
                username: user.name.clone(),
                tty: launch.tty.clone().or_else(|| setup.tty.clone()),
                xdisplay: setup.xdisplay.clone(),
                remote_host: setup.remote_host.clone(),
                pid: child.as_raw(),
            };
            let is_greeter = setup.class.as_deref() == Some(CLASS_GREETER);
            if !is_greeter {
                utmp::record_login(&stamp);
            }

            let status = loop {
                match waitpid(child, None) {
                    Ok(status) => break status,
                    Err(nix::errno::Errno::EINTR) => continue,
                    Err(e) => return Err(e).context("waiting for session"),
                }
            };

            if !is_greeter {
                utmp::record_logout(&stamp);
            }

            if let (Some(path), Some(record)) = (&launch.xauth_path, &setup.xauth) {
                let _ = with_user_identity(user.uid, user.gid, || {
                    xauthority::remove_from_file(Path::new(path), record)
                });
            }

            pam.close_session();
            pam.setcred(PAM_DELETE_CRED);

            Ok(session_exit_code(status))
        }
    }
}

/// Map the session's wait status onto our own exit code, shell style.
fn session_exit_code(status: WaitStatus) -> i32 {
    match status {
        WaitStatus::Exited(_, code) => code,
        WaitStatus::Signaled(_, sig, _) => 128 + sig as i32,
        _ => 1,
    }
}

/// Runs in the grandchild. Only returns on failure.
fn exec_session(
    user: &UserRecord,
    launch: &SessionLaunch,
    argv: &[CString],
    env: &[CString],
) -> std::io::Error {
    if setsid().is_err() {
        return std::io::Error::last_os_error();
    }
    // gid before uid, or the gid change is no longer permitted
    if setgid(user.gid).is_err() || setuid(user.uid).is_err() {
        return std::io::Error::last_os_error();
    }
    if chdir(&user.home).is_err() {
        let _ = chdir("/");
    }

    if let Some(log_path) = &launch.log_path {
        match logfile::open_session_log(Path::new(log_path), launch.log_backup) {
            Ok(log) => {
                let _ = logfile::redirect_stdio(&log);
            }
            Err(e) => eprintln!("duskdm session helper: session log: {e:#}"),
        }
    }

    let mut argv_ptrs: Vec<*const libc::c_char> = argv.iter().map(|a| a.as_ptr()).collect();
    argv_ptrs.push(std::ptr::null());
    let mut env_ptrs: Vec<*const libc::c_char> = env.iter().map(|e| e.as_ptr()).collect();
    env_ptrs.push(std::ptr::null());

    unsafe {
        libc::execve(argv_ptrs[0], argv_ptrs.as_ptr(), env_ptrs.as_ptr());
    }
    std::io::Error::last_os_error()
}

/// Run `f` with the user's effective identity, restoring root afterwards
/// whatever happens. Only the effective ids move, so restoration cannot
/// fail for lack of privilege.
fn with_user_identity<T>(uid: Uid, gid: Gid, f: impl FnOnce() -> Result<T>) -> Result<T> {
    setegid(gid).map_err(|e| DmError::privilege("setegid", e.into()))?;
    if let Err(e) = seteuid(uid) {
        let _ = setegid(Gid::from_raw(0));
        return Err(DmError::privilege("seteuid", e.into()).into());
    }
    let result = f();
    let _ = seteuid(Uid::from_raw(0));
    let _ = setegid(Gid::from_raw(0));
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pam::PAM_PROMPT_ECHO_OFF;
    use nix::unistd::Pid;
    use std::os::fd::IntoRawFd;

    fn completed_state() -> ConversationState {
        let (pipe_r, hold_w) = os_pipe::pipe().unwrap();
        let (hold_r, pipe_w) = os_pipe::pipe().unwrap();
        // The peer ends close; a read or write would error immediately,
        // which is exactly what must not happen after completion.
        drop(hold_w);
        drop(hold_r);
        ConversationState {
            from_daemon: unsafe { File::from_raw_fd(pipe_r.into_raw_fd()) },
            to_daemon: unsafe { File::from_raw_fd(pipe_w.into_raw_fd()) },
            is_interactive: false,
            auth_complete: true,
        }
    }

    #[test]
    fn test_prompt_after_result_auto_acknowledged() {
        let mut state = completed_state();
        let text = CString::new("Password: ").unwrap();
        let message = pam::PamMessage {
            msg_style: PAM_PROMPT_ECHO_OFF,
            msg: text.as_ptr(),
        };
        let messages = [&message as *const pam::PamMessage];
        let mut responses: *mut PamResponse = std::ptr::null_mut();

        let code = conversation(
            1,
            messages.as_ptr(),
            &mut responses,
            &mut state as *mut ConversationState as *mut c_void,
        );

        assert_eq!(code, PAM_SUCCESS);
        unsafe {
            assert!(!responses.is_null());
            assert!((*responses).resp.is_null(), "no answer text fabricated");
            libc::free(responses as *mut c_void);
        }
    }

    #[test]
    fn test_session_exit_code_mapping() {
        let pid = Pid::from_raw(1);
        assert_eq!(session_exit_code(WaitStatus::Exited(pid, 0)), 0);
        assert_eq!(session_exit_code(WaitStatus::Exited(pid, 3)), 3);
        assert_eq!(
            session_exit_code(WaitStatus::Signaled(pid, Signal::SIGTERM, false)),
            143
        );
    }
}
