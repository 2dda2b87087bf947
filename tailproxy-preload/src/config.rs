use once_cell::sync::Lazy;
use std::ffi::CString;
use std::net::Ipv4Addr;

pub const DEFAULT_PROXY_PORT: u16 = 1080;

pub struct PreloadConfig {
    pub proxy_host: Ipv4Addr,
    pub proxy_port: u16,
    pub verbose: bool,
    pub export_listeners: bool,
    pub control_sock: Option<CString>,
}

// Read once at library init; the child never reconfigures a running proxy.
static CONFIG: Lazy<PreloadConfig> = Lazy::new(PreloadConfig::from_env);

pub fn get() -> &'static PreloadConfig {
    &CONFIG
}

pub fn verbose() -> bool {
    CONFIG.verbose
}

impl PreloadConfig {
    fn from_env() -> Self {
        let proxy_host = std::env::var("TAILPROXY_HOST")
            .ok()
            .and_then(|host| host.parse().ok())
            .unwrap_or(Ipv4Addr::LOCALHOST);
        let proxy_port = std::env::var("TAILPROXY_PORT")
            .ok()
            .and_then(|port| port.parse().ok())
            .unwrap_or(DEFAULT_PROXY_PORT);
        let verbose = std::env::var_os("TAILPROXY_VERBOSE").is_some();
        let export_listeners = std::env::var_os("TAILPROXY_EXPORT_LISTENERS").is_some();
        let control_sock = std::env::var("TAILPROXY_CONTROL_SOCK")
            .ok()
            .and_then(|path| CString::new(path).ok());
        Self {
            proxy_host,
            proxy_port,
            verbose,
            export_listeners,
            control_sock,
        }
    }
}
