use anyhow::{bail, Result};
use std::ffi::CStr;
use std::mem::MaybeUninit;

/// Login name of the invoking user, looking through `sudo`.
///
/// Used as the default enrollment name on the command line.
pub fn current_user_name() -> Result<String> {
    match std::env::var("SUDO_USER") {
        Ok(name) if !name.is_empty() => Ok(name),
        _ => login_name(unsafe { libc::geteuid() }),
    }
}

fn login_name(uid: libc::uid_t) -> Result<String> {
    let mut buf = vec![0 as libc::c_char; 1024];
    loop {
        let mut pwd = MaybeUninit::<libc::passwd>::uninit();
        let mut found: *mut libc::passwd = std::ptr::null_mut();
        let rc = unsafe {
            libc::getpwuid_r(uid, pwd.as_mut_ptr(), buf.as_mut_ptr(), buf.len(), &mut found)
        };
        if rc == libc::ERANGE && buf.len() < 1 << 16 {
            buf.resize(buf.len() * 2, 0);
            continue;
        }
        if rc != 0 || found.is_null() {
            bail!("no passwd entry for uid {uid}");
        }
        // `found` points into `pwd`, whose strings live in `buf`
        let name = unsafe { CStr::from_ptr((*found).pw_name) };
        return Ok(name.to_string_lossy().into_owned());
    }
}
