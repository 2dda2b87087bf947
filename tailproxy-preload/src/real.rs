use libc::{addrinfo, c_char, c_int, hostent, sockaddr, socklen_t};
use once_cell::sync::Lazy;
use std::ffi::CString;

pub type ConnectFn = unsafe extern "C" fn(c_int, *const sockaddr, socklen_t) -> c_int;
pub type BindFn = unsafe extern "C" fn(c_int, *const sockaddr, socklen_t) -> c_int;
pub type ListenFn = unsafe extern "C" fn(c_int, c_int) -> c_int;
pub type CloseFn = unsafe extern "C" fn(c_int) -> c_int;
pub type GetaddrinfoFn = unsafe extern "C" fn(
    *const c_char,
    *const c_char,
    *const addrinfo,
    *mut *mut addrinfo,
) -> c_int;
pub type GethostbynameFn = unsafe extern "C" fn(*const c_char) -> *mut hostent;

/// Looks the symbol up past this library, so the shims can delegate to the
/// definitions they shadow.
unsafe fn lookup<T>(name: &str) -> Option<T> {
    let name = CString::new(name).ok()?;
    let symbol = libc::dlsym(libc::RTLD_NEXT, name.as_ptr());
    if symbol.is_null() {
        None
    } else {
        Some(std::mem::transmute_copy(&symbol))
    }
}

pub static CONNECT: Lazy<Option<ConnectFn>> = Lazy::new(|| unsafe { lookup("connect") });
pub static BIND: Lazy<Option<BindFn>> = Lazy::new(|| unsafe { lookup("bind") });
pub static LISTEN: Lazy<Option<ListenFn>> = Lazy::new(|| unsafe { lookup("listen") });
pub static CLOSE: Lazy<Option<CloseFn>> = Lazy::new(|| unsafe { lookup("close") });
pub static GETADDRINFO: Lazy<Option<GetaddrinfoFn>> =
    Lazy::new(|| unsafe { lookup("getaddrinfo") });
pub static GETHOSTBYNAME: Lazy<Option<GethostbynameFn>> =
    Lazy::new(|| unsafe { lookup("gethostbyname") });

/// Forces every lookup, so shims invoked later never race symbol resolution.
pub fn resolve_all() {
    Lazy::force(&CONNECT);
    Lazy::force(&BIND);
    Lazy::force(&LISTEN);
    Lazy::force(&CLOSE);
    Lazy::force(&GETADDRINFO);
    Lazy::force(&GETHOSTBYNAME);
}

/// Closes an internal descriptor through the original close, bypassing the
/// shim and its FD-table bookkeeping.
pub fn close_quietly(fd: c_int) {
    if let Some(real_close) = *CLOSE {
        unsafe {
            real_close(fd);
        }
    }
}
