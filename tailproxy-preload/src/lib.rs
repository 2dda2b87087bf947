//! LD_PRELOAD interposer for tailproxy.
//!
//! Loaded into the child by the dynamic linker ahead of libc, it reroutes
//! outbound TCP connects through the supervisor's loopback SOCKS5 proxy,
//! pins inbound binds to loopback, and reports listener lifecycle over the
//! control socket. Everything here runs inside an arbitrary host process,
//! so the library resolves the primitives it shadows via `dlsym(RTLD_NEXT)`
//! and touches nothing heavier than libc.

mod config;
mod control;
mod fd_table;
mod real;
mod socks5;

use fd_table::Family;
use libc::{
    addrinfo, c_char, c_int, c_void, hostent, sockaddr, sockaddr_in, sockaddr_in6,
    sockaddr_storage, socklen_t, AF_INET, AF_INET6,
};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Once;

const PROXY_CONNECT_TIMEOUT_MS: c_int = 30_000;
const LOOPBACK_V6: [u8; 16] = [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1];

#[ctor::ctor]
fn tailproxy_ctor() {
    init();
}

// Idempotent, and re-entered from every shim: the host process may call a
// hooked primitive before the constructor has run.
fn init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        real::resolve_all();
        let cfg = config::get();
        if cfg.verbose {
            eprintln!(
                "[tailproxy] initialized: proxy={}:{}",
                cfg.proxy_host, cfg.proxy_port
            );
        }
    });
}

fn set_errno(err: c_int) {
    unsafe {
        *libc::__errno_location() = err;
    }
}

fn errno() -> c_int {
    unsafe { *libc::__errno_location() }
}

unsafe fn is_stream_socket(fd: c_int) -> bool {
    let mut socktype: c_int = 0;
    let mut len = std::mem::size_of::<c_int>() as socklen_t;
    let ret = libc::getsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_TYPE,
        &mut socktype as *mut c_int as *mut c_void,
        &mut len,
    );
    ret == 0 && socktype == libc::SOCK_STREAM
}

fn format_target(target: &socks5::Target) -> String {
    match target {
        socks5::Target::V4(octets, port) => format!("{}:{}", Ipv4Addr::from(*octets), port),
        socks5::Target::V6(octets, port) => format!("[{}]:{}", Ipv6Addr::from(*octets), port),
    }
}

#[no_mangle]
pub unsafe extern "C" fn connect(fd: c_int, addr: *const sockaddr, len: socklen_t) -> c_int {
    init();
    let Some(real_connect) = *real::CONNECT else {
        set_errno(libc::ENOSYS);
        return -1;
    };

    if !is_stream_socket(fd) {
        return real_connect(fd, addr, len);
    }
    let Some(target) = socks5::target_from_sockaddr(addr, len) else {
        // Unix sockets and anything else non-inet are never proxied.
        return real_connect(fd, addr, len);
    };
    if let socks5::Target::V4(octets, _) = target {
        // 127/8 stays local: local IPC keeps working and the proxy's own
        // connection cannot loop back through the shim.
        if octets[0] == 127 {
            return real_connect(fd, addr, len);
        }
    }

    let cfg = config::get();
    if cfg.verbose {
        eprintln!(
            "[tailproxy] intercepting connect to {}",
            format_target(&target)
        );
    }

    // The SOCKS5 handshake needs synchronous reads and writes; restore the
    // caller's non-blocking mode afterwards.
    let flags = libc::fcntl(fd, libc::F_GETFL, 0);
    let was_nonblocking = flags != -1 && (flags & libc::O_NONBLOCK) != 0;
    if was_nonblocking {
        libc::fcntl(fd, libc::F_SETFL, flags & !libc::O_NONBLOCK);
    }

    let result =
        proxy_connect(real_connect, fd, cfg).and_then(|()| socks5::handshake(fd, &target));

    if was_nonblocking {
        libc::fcntl(fd, libc::F_SETFL, flags);
    }

    match result {
        Ok(()) => 0,
        Err(err) => {
            if cfg.verbose {
                eprintln!(
                    "[tailproxy] proxied connect to {} failed: errno {}",
                    format_target(&target),
                    err
                );
            }
            set_errno(err);
            -1
        }
    }
}

unsafe fn proxy_connect(
    real_connect: real::ConnectFn,
    fd: c_int,
    cfg: &config::PreloadConfig,
) -> Result<(), c_int> {
    let proxy = sockaddr_in {
        sin_family: AF_INET as libc::sa_family_t,
        sin_port: cfg.proxy_port.to_be(),
        sin_addr: libc::in_addr {
            s_addr: u32::from_ne_bytes(cfg.proxy_host.octets()),
        },
        sin_zero: [0; 8],
    };
    let ret = real_connect(
        fd,
        &proxy as *const sockaddr_in as *const sockaddr,
        std::mem::size_of::<sockaddr_in>() as socklen_t,
    );
    if ret == 0 {
        return Ok(());
    }
    let err = errno();
    if err != libc::EINPROGRESS {
        return Err(err);
    }

    // EINPROGRESS despite blocking mode: wait for writability, then read
    // the accumulated socket error.
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLOUT,
        revents: 0,
    };
    if libc::poll(&mut pfd, 1, PROXY_CONNECT_TIMEOUT_MS) <= 0 {
        return Err(libc::ETIMEDOUT);
    }
    let mut sock_err: c_int = 0;
    let mut err_len = std::mem::size_of::<c_int>() as socklen_t;
    let ret = libc::getsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_ERROR,
        &mut sock_err as *mut c_int as *mut c_void,
        &mut err_len,
    );
    if ret != 0 {
        return Err(errno());
    }
    if sock_err != 0 {
        return Err(sock_err);
    }
    Ok(())
}

#[no_mangle]
pub unsafe extern "C" fn bind(fd: c_int, addr: *const sockaddr, len: socklen_t) -> c_int {
    init();
    let Some(real_bind) = *real::BIND else {
        set_errno(libc::ENOSYS);
        return -1;
    };
    if !config::get().export_listeners || addr.is_null() || !is_stream_socket(fd) {
        return real_bind(fd, addr, len);
    }

    match i32::from((*addr).sa_family) {
        AF_INET if len as usize >= std::mem::size_of::<sockaddr_in>() => {
            fd_table::record_tcp(fd, Family::V4);
            let mut rewritten = *(addr as *const sockaddr_in);
            if rewritten.sin_addr.s_addr.to_ne_bytes()[0] != 127 {
                // Wildcard and LAN binds land on loopback so the service is
                // only reachable through the overlay export.
                rewritten.sin_addr.s_addr = u32::from_ne_bytes(Ipv4Addr::LOCALHOST.octets());
            }
            real_bind(fd, &rewritten as *const sockaddr_in as *const sockaddr, len)
        }
        AF_INET6 if len as usize >= std::mem::size_of::<sockaddr_in6>() => {
            fd_table::record_tcp(fd, Family::V6);
            let mut rewritten = *(addr as *const sockaddr_in6);
            if rewritten.sin6_addr.s6_addr != LOOPBACK_V6 {
                rewritten.sin6_addr.s6_addr = LOOPBACK_V6;
            }
            real_bind(
                fd,
                &rewritten as *const sockaddr_in6 as *const sockaddr,
                len,
            )
        }
        _ => real_bind(fd, addr, len),
    }
}

#[no_mangle]
pub unsafe extern "C" fn listen(fd: c_int, backlog: c_int) -> c_int {
    init();
    let Some(real_listen) = *real::LISTEN else {
        set_errno(libc::ENOSYS);
        return -1;
    };
    let ret = real_listen(fd, backlog);
    if ret != 0 {
        return ret;
    }

    if config::get().export_listeners && fd_table::is_tracked_tcp(fd) {
        // getsockname is authoritative: a port-0 bind has its real port
        // assigned by the kernel only now.
        if let Some((family, port)) = bound_name(fd) {
            if port > 0 {
                fd_table::mark_listener(fd, port);
                control::notify_listen(family, port);
                if config::verbose() {
                    eprintln!("[tailproxy] exporting listener {} {}", family.token(), port);
                }
            }
        }
    }
    ret
}

unsafe fn bound_name(fd: c_int) -> Option<(Family, u16)> {
    let mut storage: sockaddr_storage = std::mem::zeroed();
    let mut len = std::mem::size_of::<sockaddr_storage>() as socklen_t;
    let ret = libc::getsockname(
        fd,
        &mut storage as *mut sockaddr_storage as *mut sockaddr,
        &mut len,
    );
    if ret != 0 {
        return None;
    }
    match i32::from(storage.ss_family) {
        AF_INET => {
            let addr_in = &storage as *const sockaddr_storage as *const sockaddr_in;
            Some((Family::V4, u16::from_be((*addr_in).sin_port)))
        }
        AF_INET6 => {
            let addr_in6 = &storage as *const sockaddr_storage as *const sockaddr_in6;
            Some((Family::V6, u16::from_be((*addr_in6).sin6_port)))
        }
        _ => None,
    }
}

#[no_mangle]
pub unsafe extern "C" fn close(fd: c_int) -> c_int {
    init();
    let Some(real_close) = *real::CLOSE else {
        set_errno(libc::ENOSYS);
        return -1;
    };
    if let Some(entry) = fd_table::take(fd) {
        if entry.is_listener && entry.port > 0 {
            if let Some(family) = entry.family {
                control::notify_close(family, entry.port);
            }
        }
    }
    real_close(fd)
}

// Name resolution stays client-side: the destination that reaches the
// SOCKS5 request is whatever address the application handed to connect.
#[no_mangle]
pub unsafe extern "C" fn getaddrinfo(
    node: *const c_char,
    service: *const c_char,
    hints: *const addrinfo,
    res: *mut *mut addrinfo,
) -> c_int {
    init();
    match *real::GETADDRINFO {
        Some(real_getaddrinfo) => real_getaddrinfo(node, service, hints, res),
        None => libc::EAI_SYSTEM,
    }
}

#[no_mangle]
pub unsafe extern "C" fn gethostbyname(name: *const c_char) -> *mut hostent {
    init();
    match *real::GETHOSTBYNAME {
        Some(real_gethostbyname) => real_gethostbyname(name),
        None => std::ptr::null_mut(),
    }
}
