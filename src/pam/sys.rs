//! Raw libpam bindings
//!
//! Only the subset of the PAM application API the session child uses.
//! Constants are the Linux-PAM values.

use libc::{c_char, c_int, c_uint, c_void};

#[repr(C)]
pub struct PamMessage {
    pub msg_style: c_int,
    pub msg: *const c_char,
}

#[repr(C)]
pub struct PamResponse {
    pub resp: *mut c_char,
    pub resp_retcode: c_int,
}

pub type ConvFn = extern "C" fn(
    num_msg: c_int,
    msg: *const *const PamMessage,
    resp: *mut *mut PamResponse,
    appdata_ptr: *mut c_void,
) -> c_int;

#[repr(C)]
pub struct PamConv {
    pub conv: ConvFn,
    pub appdata_ptr: *mut c_void,
}

/// PAM_XAUTHDATA item payload (Linux-PAM extension).
#[repr(C)]
pub struct PamXauthData {
    pub namelen: c_int,
    pub name: *mut c_char,
    pub datalen: c_int,
    pub data: *mut c_char,
}

// Result codes
pub const PAM_SUCCESS: c_int = 0;
pub const PAM_SYSTEM_ERR: c_int = 4;
pub const PAM_BUF_ERR: c_int = 5;
pub const PAM_PERM_DENIED: c_int = 6;
pub const PAM_AUTH_ERR: c_int = 7;
pub const PAM_USER_UNKNOWN: c_int = 10;
pub const PAM_MAXTRIES: c_int = 11;
pub const PAM_NEW_AUTHTOK_REQD: c_int = 12;
pub const PAM_ACCT_EXPIRED: c_int = 13;
pub const PAM_SESSION_ERR: c_int = 14;
pub const PAM_CONV_ERR: c_int = 19;
pub const PAM_ABORT: c_int = 26;

// Conversation message styles
pub const PAM_PROMPT_ECHO_OFF: c_int = 1;
pub const PAM_PROMPT_ECHO_ON: c_int = 2;
pub const PAM_ERROR_MSG: c_int = 3;
pub const PAM_TEXT_INFO: c_int = 4;

// Items
pub const PAM_USER: c_int = 2;
pub const PAM_TTY: c_int = 3;
pub const PAM_RHOST: c_int = 4;
pub const PAM_XDISPLAY: c_int = 11;
pub const PAM_XAUTHDATA: c_int = 12;

// pam_setcred flags
pub const PAM_ESTABLISH_CRED: c_uint = 0x0002;
pub const PAM_DELETE_CRED: c_uint = 0x0004;
pub const PAM_REINITIALIZE_CRED: c_uint = 0x0008;

#[link(name = "pam")]
extern "C" {
    pub fn pam_start(
        service_name: *const c_char,
        user: *const c_char,
        pam_conversation: *const PamConv,
        pamh: *mut *mut c_void,
    ) -> c_int;
    pub fn pam_end(pamh: *mut c_void, pam_status: c_int) -> c_int;
    pub fn pam_authenticate(pamh: *mut c_void, flags: c_int) -> c_int;
    pub fn pam_acct_mgmt(pamh: *mut c_void, flags: c_int) -> c_int;
    pub fn pam_chauthtok(pamh: *mut c_void, flags: c_int) -> c_int;
    pub fn pam_setcred(pamh: *mut c_void, flags: c_int) -> c_int;
    pub fn pam_open_session(pamh: *mut c_void, flags: c_int) -> c_int;
    pub fn pam_close_session(pamh: *mut c_void, flags: c_int) -> c_int;
    pub fn pam_get_item(pamh: *const c_void, item_type: c_int, item: *mut *const c_void) -> c_int;
    pub fn pam_set_item(pamh: *mut c_void, item_type: c_int, item: *const c_void) -> c_int;
    pub fn pam_putenv(pamh: *mut c_void, name_value: *const c_char) -> c_int;
    pub fn pam_getenv(pamh: *mut c_void, name: *const c_char) -> *const c_char;
    pub fn pam_getenvlist(pamh: *mut c_void) -> *mut *mut c_char;
    pub fn pam_strerror(pamh: *mut c_void, errnum: c_int) -> *const c_char;
}
