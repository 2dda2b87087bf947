use std::sync::Mutex;

// Sized to the usual soft RLIMIT_NOFILE ceiling; descriptors past the end
// are simply not tracked and the shims proceed without export support.
const TABLE_SIZE: usize = 4096;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub fn token(self) -> &'static str {
        match self {
            Family::V4 => "tcp4",
            Family::V6 => "tcp6",
        }
    }
}

#[derive(Clone, Copy, Default)]
pub struct FdEntry {
    pub is_tcp: bool,
    pub is_listener: bool,
    pub family: Option<Family>,
    pub port: u16,
}

static TABLE: Mutex<[FdEntry; TABLE_SIZE]> = Mutex::new(
    [FdEntry {
        is_tcp: false,
        is_listener: false,
        family: None,
        port: 0,
    }; TABLE_SIZE],
);

fn with_entry<R>(fd: i32, apply: impl FnOnce(&mut FdEntry) -> R) -> Option<R> {
    if fd < 0 || fd as usize >= TABLE_SIZE {
        return None;
    }
    let mut table = TABLE.lock().unwrap_or_else(|err| err.into_inner());
    Some(apply(&mut table[fd as usize]))
}

pub fn record_tcp(fd: i32, family: Family) {
    with_entry(fd, |entry| {
        entry.is_tcp = true;
        entry.family = Some(family);
    });
}

pub fn mark_listener(fd: i32, port: u16) {
    with_entry(fd, |entry| {
        if entry.is_tcp && port > 0 {
            entry.is_listener = true;
            entry.port = port;
        }
    });
}

pub fn is_tracked_tcp(fd: i32) -> bool {
    with_entry(fd, |entry| entry.is_tcp).unwrap_or(false)
}

/// Clears the slot and returns what it held, for the close shim to report.
pub fn take(fd: i32) -> Option<FdEntry> {
    with_entry(fd, std::mem::take)
}
