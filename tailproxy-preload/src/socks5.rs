use libc::{c_int, c_void, sockaddr, sockaddr_in, sockaddr_in6, AF_INET, AF_INET6};

pub const SOCKS5_VERSION: u8 = 0x05;
pub const METHOD_NO_AUTH: u8 = 0x00;
pub const CMD_CONNECT: u8 = 0x01;
pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;
pub const REPLY_SUCCEEDED: u8 = 0x00;

/// Destination the application handed to connect, as it crosses the wire.
/// Names never appear here: the caller has already resolved them.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Target {
    V4([u8; 4], u16),
    V6([u8; 16], u16),
}

/// # Safety
/// `addr` must point to a sockaddr of at least `len` bytes.
pub unsafe fn target_from_sockaddr(addr: *const sockaddr, len: libc::socklen_t) -> Option<Target> {
    if addr.is_null() {
        return None;
    }
    match i32::from((*addr).sa_family) {
        AF_INET if len as usize >= std::mem::size_of::<sockaddr_in>() => {
            let addr_in = addr as *const sockaddr_in;
            let octets = (*addr_in).sin_addr.s_addr.to_ne_bytes();
            Some(Target::V4(octets, u16::from_be((*addr_in).sin_port)))
        }
        AF_INET6 if len as usize >= std::mem::size_of::<sockaddr_in6>() => {
            let addr_in6 = addr as *const sockaddr_in6;
            Some(Target::V6(
                (*addr_in6).sin6_addr.s6_addr,
                u16::from_be((*addr_in6).sin6_port),
            ))
        }
        _ => None,
    }
}

pub fn encode_greeting() -> [u8; 3] {
    [SOCKS5_VERSION, 0x01, METHOD_NO_AUTH]
}

pub fn encode_connect_request(target: &Target) -> Vec<u8> {
    let mut request = vec![SOCKS5_VERSION, CMD_CONNECT, 0x00];
    match target {
        Target::V4(octets, port) => {
            request.push(ATYP_IPV4);
            request.extend_from_slice(octets);
            request.extend_from_slice(&port.to_be_bytes());
        }
        Target::V6(octets, port) => {
            request.push(ATYP_IPV6);
            request.extend_from_slice(octets);
            request.extend_from_slice(&port.to_be_bytes());
        }
    }
    request
}

/// Runs the client half of RFC 1928 on an already-connected, blocking
/// socket. Returns the errno value to surface on failure.
pub fn handshake(fd: c_int, target: &Target) -> Result<(), c_int> {
    send_all(fd, &encode_greeting())?;

    let mut method = [0u8; 2];
    recv_exact(fd, &mut method)?;
    if method[0] != SOCKS5_VERSION || method[1] != METHOD_NO_AUTH {
        return Err(libc::ECONNREFUSED);
    }

    send_all(fd, &encode_connect_request(target))?;

    let mut head = [0u8; 4];
    recv_exact(fd, &mut head)?;
    if head[0] != SOCKS5_VERSION {
        return Err(libc::ECONNREFUSED);
    }
    // Drain the BND fields so nothing of the reply leaks into the stream.
    let bound_len = match head[3] {
        ATYP_IPV4 => 4 + 2,
        ATYP_IPV6 => 16 + 2,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            recv_exact(fd, &mut len)?;
            usize::from(len[0]) + 2
        }
        _ => return Err(libc::ECONNREFUSED),
    };
    let mut bound = [0u8; 258];
    recv_exact(fd, &mut bound[..bound_len])?;

    if head[1] != REPLY_SUCCEEDED {
        return Err(libc::ECONNREFUSED);
    }
    Ok(())
}

fn send_all(fd: c_int, buf: &[u8]) -> Result<(), c_int> {
    let mut sent = 0;
    while sent < buf.len() {
        let n = unsafe {
            libc::send(
                fd,
                buf[sent..].as_ptr() as *const c_void,
                buf.len() - sent,
                libc::MSG_NOSIGNAL,
            )
        };
        if n < 0 {
            let err = errno();
            if err == libc::EINTR {
                continue;
            }
            return Err(err);
        }
        sent += n as usize;
    }
    Ok(())
}

fn recv_exact(fd: c_int, buf: &mut [u8]) -> Result<(), c_int> {
    let mut read = 0;
    while read < buf.len() {
        let n = unsafe {
            libc::recv(
                fd,
                buf[read..].as_mut_ptr() as *mut c_void,
                buf.len() - read,
                0,
            )
        };
        if n < 0 {
            let err = errno();
            if err == libc::EINTR {
                continue;
            }
            return Err(err);
        }
        if n == 0 {
            return Err(libc::ECONNRESET);
        }
        read += n as usize;
    }
    Ok(())
}

fn errno() -> c_int {
    unsafe { *libc::__errno_location() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::os::fd::AsRawFd;

    #[test]
    fn connect_request_for_ipv4_matches_wire_format() {
        let request = encode_connect_request(&Target::V4([203, 0, 113, 9], 80));
        assert_eq!(
            request,
            vec![0x05, 0x01, 0x00, 0x01, 203, 0, 113, 9, 0x00, 0x50]
        );
    }

    #[test]
    fn connect_request_for_ipv6_carries_sixteen_octets() {
        let mut octets = [0u8; 16];
        octets[15] = 1;
        let request = encode_connect_request(&Target::V6(octets, 443));
        assert_eq!(request.len(), 4 + 16 + 2);
        assert_eq!(request[3], ATYP_IPV6);
        assert_eq!(&request[20..], &[0x01, 0xbb]);
    }

    #[test]
    fn greeting_offers_only_no_auth() {
        assert_eq!(encode_greeting(), [0x05, 0x01, 0x00]);
    }

    #[test]
    fn handshake_succeeds_against_minimal_server() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let server = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().expect("accept");
            let mut greeting = [0u8; 3];
            conn.read_exact(&mut greeting).expect("greeting");
            assert_eq!(greeting, [0x05, 0x01, 0x00]);
            conn.write_all(&[0x05, 0x00]).expect("method");
            let mut request = [0u8; 10];
            conn.read_exact(&mut request).expect("request");
            assert_eq!(&request[..4], &[0x05, 0x01, 0x00, 0x01]);
            conn.write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .expect("reply");
        });

        let stream = TcpStream::connect(addr).expect("connect");
        let target = Target::V4([192, 0, 2, 10], 8080);
        handshake(stream.as_raw_fd(), &target).expect("handshake");
        server.join().expect("server");
    }

    #[test]
    fn handshake_fails_on_nonzero_reply() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let server = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().expect("accept");
            let mut greeting = [0u8; 3];
            conn.read_exact(&mut greeting).expect("greeting");
            conn.write_all(&[0x05, 0x00]).expect("method");
            let mut request = [0u8; 10];
            conn.read_exact(&mut request).expect("request");
            conn.write_all(&[0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .expect("reply");
        });

        let stream = TcpStream::connect(addr).expect("connect");
        let target = Target::V4([192, 0, 2, 10], 8080);
        let err = handshake(stream.as_raw_fd(), &target).unwrap_err();
        assert_eq!(err, libc::ECONNREFUSED);
        server.join().expect("server");
    }

    #[test]
    fn handshake_fails_on_wrong_version() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let server = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().expect("accept");
            let mut greeting = [0u8; 3];
            conn.read_exact(&mut greeting).expect("greeting");
            conn.write_all(&[0x04, 0x00]).expect("method");
        });

        let stream = TcpStream::connect(addr).expect("connect");
        let target = Target::V4([192, 0, 2, 10], 8080);
        let err = handshake(stream.as_raw_fd(), &target).unwrap_err();
        assert_eq!(err, libc::ECONNREFUSED);
        server.join().expect("server");
    }

    #[test]
    fn sockaddr_v4_roundtrip() {
        let addr_in = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: 8080u16.to_be(),
            sin_addr: libc::in_addr {
                s_addr: u32::from_ne_bytes([10, 0, 0, 7]),
            },
            sin_zero: [0; 8],
        };
        let target = unsafe {
            target_from_sockaddr(
                &addr_in as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        assert_eq!(target, Some(Target::V4([10, 0, 0, 7], 8080)));
    }
}
