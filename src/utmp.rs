//! utmp/wtmp/btmp session accounting
//!
//! Interactive sessions are stamped into the utmp database (and appended
//! to wtmp) as USER_PROCESS when they start and DEAD_PROCESS when they
//! end, so `who` and `last` see them. Failed authentications are appended
//! to btmp for `lastb`. Greeter sessions are never recorded; only real
//! user logins count.
//!
//! All writes are best effort: accounting must never stop a login.

use std::time::{SystemTime, UNIX_EPOCH};

const WTMP_PATH: &[u8] = b"/var/log/wtmp\0";
const BTMP_PATH: &[u8] = b"/var/log/btmp\0";

// glibc ships updwtmpx but the libc crate does not declare it.
extern "C" {
    fn updwtmpx(wtmpx_file: *const libc::c_char, ut: *const libc::utmpx);
}

/// Identity of one session for accounting purposes.
#[derive(Debug, Clone, Default)]
pub struct SessionStamp {
    pub username: String,
    /// Terminal device, with or without the /dev/ prefix.
    pub tty: Option<String>,
    pub xdisplay: Option<String>,
    pub remote_host: Option<String>,
    pub pid: i32,
}

fn copy_field(dst: &mut [libc::c_char], src: &str) {
    for (slot, byte) in dst.iter_mut().zip(src.as_bytes()) {
        *slot = *byte as libc::c_char;
    }
}

fn line_name(stamp: &SessionStamp) -> String {
    match &stamp.tty {
        Some(tty) => tty.strip_prefix("/dev/").unwrap_or(tty).to_string(),
        None => stamp.xdisplay.clone().unwrap_or_default(),
    }
}

fn fill(ut_type: libc::c_short, stamp: &SessionStamp) -> libc::utmpx {
    // Safety: utmpx is plain data, all-zeroes is its empty state.
    let mut ut: libc::utmpx = unsafe { std::mem::zeroed() };
    ut.ut_type = ut_type;
    ut.ut_pid = stamp.pid;

    let line = line_name(stamp);
    copy_field(&mut ut.ut_line, &line);
    // ut_id distinguishes lines sharing a prefix; the suffix is enough
    let id_start = line.len().saturating_sub(ut.ut_id.len());
    copy_field(&mut ut.ut_id, &line[id_start..]);
    copy_field(&mut ut.ut_user, &stamp.username);
    if let Some(host) = stamp.remote_host.as_deref().or(stamp.xdisplay.as_deref()) {
        copy_field(&mut ut.ut_host, host);
    }

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    ut.ut_tv.tv_sec = now as _;
    ut.ut_tv.tv_usec = 0;
    ut
}

fn write_utmp_wtmp(ut: &libc::utmpx) {
    // Safety: ut is fully initialized; the paths are NUL-terminated.
    unsafe {
        libc::setutxent();
        libc::pututxline(ut);
        libc::endutxent();
        updwtmpx(WTMP_PATH.as_ptr() as *const libc::c_char, ut);
    }
}

/// Record a session start.
pub fn record_login(stamp: &SessionStamp) {
    let ut = fill(libc::USER_PROCESS, stamp);
    write_utmp_wtmp(&ut);
}

/// Record a session end.
pub fn record_logout(stamp: &SessionStamp) {
    let ut = fill(libc::DEAD_PROCESS, stamp);
    write_utmp_wtmp(&ut);
}

/// Record a failed authentication in btmp.
pub fn record_failed_login(stamp: &SessionStamp) {
    let ut = fill(libc::USER_PROCESS, stamp);
    // Safety: as above; btmp takes the same record shape.
    unsafe {
        updwtmpx(BTMP_PATH.as_ptr() as *const libc::c_char, &ut);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field_str(field: &[libc::c_char]) -> String {
        field
            .iter()
            .take_while(|&&c| c != 0)
            .map(|&c| c as u8 as char)
            .collect()
    }

    fn stamp() -> SessionStamp {
        SessionStamp {
            username: "alice".to_string(),
            tty: Some("/dev/tty7".to_string()),
            xdisplay: Some(":0".to_string()),
            remote_host: None,
            pid: 1234,
        }
    }

    #[test]
    fn test_fill_strips_dev_prefix() {
        let ut = fill(libc::USER_PROCESS, &stamp());
        assert_eq!(field_str(&ut.ut_line), "tty7");
        assert_eq!(field_str(&ut.ut_user), "alice");
        assert_eq!(ut.ut_pid, 1234);
    }

    #[test]
    fn test_fill_uses_display_without_tty() {
        let mut s = stamp();
        s.tty = None;
        let ut = fill(libc::USER_PROCESS, &s);
        assert_eq!(field_str(&ut.ut_line), ":0");
        assert_eq!(field_str(&ut.ut_host), ":0");
    }

    #[test]
    fn test_fill_prefers_remote_host() {
        let mut s = stamp();
        s.remote_host = Some("client.example".to_string());
        let ut = fill(libc::USER_PROCESS, &s);
        assert_eq!(field_str(&ut.ut_host), "client.example");
    }

    #[test]
    fn test_failed_login_write_is_best_effort() {
        // Unprivileged the append silently fails; it must never panic.
        record_failed_login(&stamp());
    }

    #[test]
    fn test_long_username_truncates_without_panic() {
        let mut s = stamp();
        s.username = "u".repeat(200);
        let ut = fill(libc::USER_PROCESS, &s);
        assert_eq!(field_str(&ut.ut_user).len(), ut.ut_user.len());
    }
}
