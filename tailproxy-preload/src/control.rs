use crate::config;
use crate::fd_table::Family;
use crate::real;
use libc::{c_int, c_void, sa_family_t, sockaddr, sockaddr_un, socklen_t, AF_UNIX};
use std::ffi::CStr;
use std::sync::Mutex;

// The channel degrades, never blocks: a missing supervisor only costs the
// child its export notifications.
enum Channel {
    Unopened,
    Open(c_int),
    Broken,
}

static CHANNEL: Mutex<Channel> = Mutex::new(Channel::Unopened);

pub fn notify_listen(family: Family, port: u16) {
    send_line(&format!("LISTEN {} {}\n", family.token(), port));
}

pub fn notify_close(family: Family, port: u16) {
    send_line(&format!("CLOSE {} {}\n", family.token(), port));
}

fn send_line(line: &str) {
    let mut channel = CHANNEL.lock().unwrap_or_else(|err| err.into_inner());
    let fd = match *channel {
        Channel::Broken => return,
        Channel::Open(fd) => fd,
        Channel::Unopened => {
            let opened = config::get()
                .control_sock
                .as_deref()
                .and_then(open_channel_at);
            match opened {
                Some(fd) => {
                    *channel = Channel::Open(fd);
                    fd
                }
                None => {
                    if config::verbose() {
                        eprintln!("[tailproxy] control socket unavailable, exports disabled");
                    }
                    *channel = Channel::Broken;
                    return;
                }
            }
        }
    };

    let sent = unsafe {
        libc::send(
            fd,
            line.as_ptr() as *const c_void,
            line.len(),
            libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL,
        )
    };
    if sent < 0 {
        let err = unsafe { *libc::__errno_location() };
        if err == libc::EAGAIN || err == libc::EWOULDBLOCK {
            // Full buffer: the message is dropped, the channel stays usable.
            if config::verbose() {
                eprintln!("[tailproxy] control message dropped: {}", line.trim_end());
            }
        } else {
            real::close_quietly(fd);
            *channel = Channel::Broken;
        }
    }
}

pub(crate) fn open_channel_at(path: &CStr) -> Option<c_int> {
    let real_connect = (*real::CONNECT)?;
    let fd = unsafe { libc::socket(AF_UNIX, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return None;
    }

    let mut addr: sockaddr_un = unsafe { std::mem::zeroed() };
    addr.sun_family = AF_UNIX as sa_family_t;
    let bytes = path.to_bytes();
    if bytes.len() >= addr.sun_path.len() {
        real::close_quietly(fd);
        return None;
    }
    for (slot, byte) in addr.sun_path.iter_mut().zip(bytes) {
        *slot = *byte as libc::c_char;
    }

    let ret = unsafe {
        real_connect(
            fd,
            &addr as *const sockaddr_un as *const sockaddr,
            std::mem::size_of::<sockaddr_un>() as socklen_t,
        )
    };
    if ret != 0 {
        real::close_quietly(fd);
        return None;
    }
    Some(fd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;
    use std::io::Read;
    use std::os::unix::net::UnixListener;

    fn temp_socket_path(tag: &str) -> std::path::PathBuf {
        let nonce = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        std::env::temp_dir().join(format!("tailproxy-test-{}-{}.sock", tag, nonce))
    }

    #[test]
    fn open_channel_connects_and_delivers_a_line() {
        let path = temp_socket_path("deliver");
        let listener = UnixListener::bind(&path).expect("bind");
        let cstr = CString::new(path.to_str().expect("utf8 path")).expect("cstring");

        let fd = open_channel_at(&cstr).expect("open channel");
        let line = "LISTEN tcp4 8080\n";
        let sent = unsafe {
            libc::send(
                fd,
                line.as_ptr() as *const c_void,
                line.len(),
                libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL,
            )
        };
        assert_eq!(sent, line.len() as isize);

        let (mut conn, _) = listener.accept().expect("accept");
        let mut received = vec![0u8; line.len()];
        conn.read_exact(&mut received).expect("read");
        assert_eq!(received, line.as_bytes());

        real::close_quietly(fd);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn open_channel_fails_without_listener() {
        let path = temp_socket_path("absent");
        let cstr = CString::new(path.to_str().expect("utf8 path")).expect("cstring");
        assert!(open_channel_at(&cstr).is_none());
    }
}
