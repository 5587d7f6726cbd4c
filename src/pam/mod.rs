//! Thin safe wrapper over the PAM application API
//!
//! The session child owns exactly one `PamHandle` for its lifetime. The
//! conversation callback is installed at `pam_start` time with an opaque
//! appdata pointer; the pointer must stay valid for as long as the handle
//! lives, which the session child guarantees by boxing its conversation
//! state and dropping it after the handle.

pub mod sys;

use std::ffi::{CStr, CString};
use std::ptr;

use libc::{c_int, c_void};

pub use sys::{
    ConvFn, PamConv, PamMessage, PamResponse, PamXauthData, PAM_ABORT, PAM_ACCT_EXPIRED,
    PAM_AUTH_ERR, PAM_BUF_ERR, PAM_CONV_ERR, PAM_DELETE_CRED, PAM_ERROR_MSG, PAM_ESTABLISH_CRED,
    PAM_MAXTRIES, PAM_NEW_AUTHTOK_REQD, PAM_PERM_DENIED, PAM_PROMPT_ECHO_OFF, PAM_PROMPT_ECHO_ON,
    PAM_REINITIALIZE_CRED, PAM_RHOST, PAM_SESSION_ERR, PAM_SUCCESS, PAM_SYSTEM_ERR, PAM_TEXT_INFO,
    PAM_TTY, PAM_USER, PAM_USER_UNKNOWN, PAM_XAUTHDATA, PAM_XDISPLAY,
};

/// Symbolic name for a PAM result code, for logs and error text.
pub fn pam_result_name(code: i32) -> &'static str {
    match code {
        sys::PAM_SUCCESS => "PAM_SUCCESS",
        sys::PAM_SYSTEM_ERR => "PAM_SYSTEM_ERR",
        sys::PAM_BUF_ERR => "PAM_BUF_ERR",
        sys::PAM_PERM_DENIED => "PAM_PERM_DENIED",
        sys::PAM_AUTH_ERR => "PAM_AUTH_ERR",
        sys::PAM_USER_UNKNOWN => "PAM_USER_UNKNOWN",
        sys::PAM_MAXTRIES => "PAM_MAXTRIES",
        sys::PAM_NEW_AUTHTOK_REQD => "PAM_NEW_AUTHTOK_REQD",
        sys::PAM_ACCT_EXPIRED => "PAM_ACCT_EXPIRED",
        sys::PAM_SESSION_ERR => "PAM_SESSION_ERR",
        sys::PAM_CONV_ERR => "PAM_CONV_ERR",
        sys::PAM_ABORT => "PAM_ABORT",
        _ => "PAM_ERROR",
    }
}

/// Does this conversation message style require a response string?
pub fn style_needs_response(style: i32) -> bool {
    style == sys::PAM_PROMPT_ECHO_ON || style == sys::PAM_PROMPT_ECHO_OFF
}

/// An open PAM transaction.
///
/// The conversation struct is boxed so its address stays stable for the
/// lifetime of the handle; libpam keeps the pointer we pass to `pam_start`.
pub struct PamHandle {
    handle: *mut c_void,
    _conv: Box<PamConv>,
}

impl PamHandle {
    /// Start a PAM transaction for `service` with an optional initial user.
    ///
    /// `appdata` is handed to every conversation callback invocation; the
    /// caller keeps it alive and valid until the handle is dropped.
    pub fn start(
        service: &str,
        username: Option<&str>,
        conv: ConvFn,
        appdata: *mut c_void,
    ) -> Result<Self, i32> {
        let service = CString::new(service).map_err(|_| sys::PAM_SYSTEM_ERR)?;
        let username = match username {
            Some(u) => Some(CString::new(u).map_err(|_| sys::PAM_SYSTEM_ERR)?),
            None => None,
        };

        let conv = Box::new(PamConv {
            conv,
            appdata_ptr: appdata,
        });

        let mut handle: *mut c_void = ptr::null_mut();
        let result = unsafe {
            sys::pam_start(
                service.as_ptr(),
                username.as_ref().map_or(ptr::null(), |u| u.as_ptr()),
                &*conv,
                &mut handle,
            )
        };
        if result != sys::PAM_SUCCESS {
            return Err(result);
        }

        Ok(Self {
            handle,
            _conv: conv,
        })
    }

    pub fn authenticate(&mut self) -> i32 {
        unsafe { sys::pam_authenticate(self.handle, 0) }
    }

    pub fn acct_mgmt(&mut self) -> i32 {
        unsafe { sys::pam_acct_mgmt(self.handle, 0) }
    }

    pub fn chauthtok(&mut self) -> i32 {
        unsafe { sys::pam_chauthtok(self.handle, 0) }
    }

    pub fn setcred(&mut self, flags: u32) -> i32 {
        unsafe { sys::pam_setcred(self.handle, flags as c_int) }
    }

    pub fn open_session(&mut self) -> i32 {
        unsafe { sys::pam_open_session(self.handle, 0) }
    }

    pub fn close_session(&mut self) -> i32 {
        unsafe { sys::pam_close_session(self.handle, 0) }
    }

    /// Current PAM_USER. PAM modules may change the user mid-conversation,
    /// so callers must re-read this rather than cache the requested name.
    pub fn user(&self) -> Option<String> {
        let mut item: *const c_void = ptr::null();
        let result = unsafe { sys::pam_get_item(self.handle, sys::PAM_USER, &mut item) };
        if result != sys::PAM_SUCCESS || item.is_null() {
            return None;
        }
        let s = unsafe { CStr::from_ptr(item as *const libc::c_char) };
        Some(s.to_string_lossy().into_owned())
    }

    pub fn set_item_str(&mut self, item_type: i32, value: &str) -> i32 {
        let value = match CString::new(value) {
            Ok(v) => v,
            Err(_) => return sys::PAM_BUF_ERR,
        };
        unsafe { sys::pam_set_item(self.handle, item_type, value.as_ptr() as *const c_void) }
    }

    /// Install X authority credentials as the PAM_XAUTHDATA item so PAM
    /// modules can contact the display.
    pub fn set_xauth_data(&mut self, name: &str, data: &[u8]) -> i32 {
        let name = match CString::new(name) {
            Ok(n) => n,
            Err(_) => return sys::PAM_BUF_ERR,
        };
        let value = PamXauthData {
            namelen: name.as_bytes().len() as c_int,
            name: name.as_ptr() as *mut libc::c_char,
            datalen: data.len() as c_int,
            data: data.as_ptr() as *mut libc::c_char,
        };
        unsafe { sys::pam_set_item(self.handle, sys::PAM_XAUTHDATA, &value as *const _ as *const c_void) }
    }

    /// Add `NAME=value` to the environment PAM accumulates for the session.
    pub fn putenv(&mut self, name_value: &str) -> i32 {
        let pair = match CString::new(name_value) {
            Ok(p) => p,
            Err(_) => return sys::PAM_BUF_ERR,
        };
        unsafe { sys::pam_putenv(self.handle, pair.as_ptr()) }
    }

    pub fn getenv(&mut self, name: &str) -> Option<String> {
        let name = CString::new(name).ok()?;
        let value = unsafe { sys::pam_getenv(self.handle, name.as_ptr()) };
        if value.is_null() {
            return None;
        }
        Some(unsafe { CStr::from_ptr(value) }.to_string_lossy().into_owned())
    }

    /// The full PAM environment, as `NAME=value` CStrings ready for exec.
    pub fn environment(&mut self) -> Vec<CString> {
        let list = unsafe { sys::pam_getenvlist(self.handle) };
        if list.is_null() {
            return Vec::new();
        }
        let mut env = Vec::new();
        let mut entry = list;
        unsafe {
            while !(*entry).is_null() {
                env.push(CStr::from_ptr(*entry).to_owned());
                libc::free(*entry as *mut c_void);
                entry = entry.add(1);
            }
            libc::free(list as *mut c_void);
        }
        env
    }

    /// Human-readable string for a PAM result code.
    pub fn strerror(&self, code: i32) -> String {
        let s = unsafe { sys::pam_strerror(self.handle, code) };
        if s.is_null() {
            return pam_result_name(code).to_string();
        }
        unsafe { CStr::from_ptr(s) }.to_string_lossy().into_owned()
    }
}

impl Drop for PamHandle {
    fn drop(&mut self) {
        unsafe {
            sys::pam_end(self.handle, sys::PAM_SUCCESS);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_names() {
        assert_eq!(pam_result_name(PAM_SUCCESS), "PAM_SUCCESS");
        assert_eq!(pam_result_name(PAM_AUTH_ERR), "PAM_AUTH_ERR");
        assert_eq!(pam_result_name(PAM_USER_UNKNOWN), "PAM_USER_UNKNOWN");
        assert_eq!(pam_result_name(9999), "PAM_ERROR");
    }

    #[test]
    fn test_prompt_styles_need_responses() {
        assert!(style_needs_response(PAM_PROMPT_ECHO_ON));
        assert!(style_needs_response(PAM_PROMPT_ECHO_OFF));
        assert!(!style_needs_response(PAM_ERROR_MSG));
        assert!(!style_needs_response(PAM_TEXT_INFO));
    }
}
