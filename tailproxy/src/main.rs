mod config;
mod control;
mod exporter;
mod keys;
mod mesh;
mod model;
mod netlink;
mod policy;
mod socks5;
mod state;
mod transport;
mod wg;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use config::{load_config, Config};
use exporter::ExporterManager;
use mesh::MeshNode;
use policy::PortPolicy;
use socks5::Socks5Server;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::process::Command as TokioCommand;
use tokio::sync::{oneshot, watch};
use transport::Transport;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);
const PRELOAD_LIBRARY: &str = "libtailproxy.so";

#[derive(Parser, Debug)]
#[command(
    name = "tailproxy",
    about = "Run a command with its TCP traffic routed through the overlay",
    after_help = "With no command, runs the SOCKS5 proxy until interrupted.\n\n\
        Examples:\n  \
        tailproxy -- curl https://ifconfig.me\n  \
        tailproxy --exit-node relay-a -- curl https://ifconfig.me\n  \
        tailproxy --export-listeners -- python -m http.server 8080"
)]
// Overridable options stay `Option` so an explicitly passed flag always
// wins over the config file, even when it repeats the built-in default.
struct Args {
    #[arg(long)]
    exit_node: Option<String>,
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, env = "TAILPROXY_CONTROL_URL")]
    control_url: Option<String>,
    #[arg(long)]
    hostname: Option<String>,
    #[arg(long)]
    authkey: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    verbose: bool,
    #[arg(long)]
    export_listeners: bool,
    #[arg(long)]
    export_allow_ports: Option<String>,
    #[arg(long)]
    export_deny_ports: Option<String>,
    #[arg(long)]
    export_max: Option<usize>,
    #[arg(long, value_enum, default_value = "kernel")]
    wg_backend: WgBackendArg,
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "COMMAND")]
    command: Vec<String>,
}

#[derive(clap::ValueEnum, Debug, Clone, Copy)]
enum WgBackendArg {
    Kernel,
    Boringtun,
}

impl From<WgBackendArg> for wg::Backend {
    fn from(value: WgBackendArg) -> Self {
        match value {
            WgBackendArg::Kernel => wg::Backend::Kernel,
            WgBackendArg::Boringtun => wg::Backend::Boringtun,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let cfg = resolve_config(&args)?;
    let policy = PortPolicy::from_specs(&cfg.export_allow_ports, &cfg.export_deny_ports)
        .context("invalid export port policy")?;

    // Fail before the overlay comes up if command mode cannot work.
    let preload_lib = if args.command.is_empty() {
        None
    } else {
        Some(find_preload_library()?)
    };

    let authkey = if cfg.authkey.is_empty() {
        None
    } else {
        Some(cfg.authkey.clone())
    };
    let mut mesh = MeshNode::new(
        &cfg.hostname,
        &cfg.control_url,
        authkey,
        args.wg_backend.into(),
        cfg.verbose,
    )?;
    mesh.up().await.context("overlay startup failed")?;
    if !cfg.exit_node.is_empty() {
        mesh.set_exit_relay(&cfg.exit_node).await?;
    }
    let mesh = Arc::new(mesh);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (ready_tx, ready_rx) = oneshot::channel();
    let socks = Socks5Server::new(
        Arc::clone(&mesh) as Arc<dyn Transport>,
        cfg.verbose,
    );
    let proxy_port = cfg.proxy_port;
    let proxy_verbose = cfg.verbose;
    let mut socks_task = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, proxy_port))
                .await
                .with_context(|| format!("failed to listen on 127.0.0.1:{}", proxy_port))?;
            if proxy_verbose {
                eprintln!("SOCKS5 proxy listening on 127.0.0.1:{}", proxy_port);
            }
            let _ = ready_tx.send(());
            socks.run(listener, shutdown_rx).await
        }
    });

    tokio::select! {
        ready = ready_rx => {
            if ready.is_err() {
                let err = match socks_task.await {
                    Ok(Err(err)) => err,
                    Ok(Ok(())) => anyhow!("proxy exited before becoming ready"),
                    Err(join_err) => anyhow!("proxy task failed: {}", join_err),
                };
                mesh.down().await;
                return Err(err.context("proxy failed to start"));
            }
        }
        // Keep polling the task so a pre-ready panic is not silently lost.
        joined = &mut socks_task => {
            let err = match joined {
                Ok(Err(err)) => err,
                Ok(Ok(())) => anyhow!("proxy exited before becoming ready"),
                Err(join_err) => anyhow!("proxy task failed: {}", join_err),
            };
            mesh.down().await;
            return Err(err.context("proxy failed to start"));
        }
    }

    let mut control_sock = None;
    let mut exporter_task = None;
    if cfg.export_listeners {
        let socket_path = state::state_dir(&cfg.hostname).join("control.sock");
        let listener = ExporterManager::bind_control_socket(&socket_path)?;
        if cfg.verbose {
            eprintln!("control socket listening on {}", socket_path.display());
        }
        let manager = ExporterManager::new(
            Arc::clone(&mesh) as Arc<dyn Transport>,
            policy,
            cfg.export_max,
            cfg.verbose,
        );
        exporter_task = Some(tokio::spawn(
            manager.run_control_socket(listener, shutdown_rx.clone()),
        ));
        control_sock = Some(socket_path);
    }

    let exit_code = match preload_lib {
        None => {
            eprintln!("SOCKS5 proxy running on 127.0.0.1:{}", cfg.proxy_port);
            if !cfg.exit_node.is_empty() {
                eprintln!("Using exit node: {}", cfg.exit_node);
            }
            eprintln!("Press Ctrl+C to stop");
            wait_for_shutdown_signal().await;
            0
        }
        Some(preload_lib) => {
            run_child(&args.command, &cfg, &preload_lib, control_sock.as_deref()).await?
        }
    };

    let _ = shutdown_tx.send(true);
    let drain = async {
        let _ = socks_task.await;
        if let Some(task) = exporter_task {
            let _ = task.await;
        }
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() && cfg.verbose {
        eprintln!("timeout waiting for proxy to stop");
    }
    mesh.down().await;

    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}

fn resolve_config(args: &Args) -> Result<Config> {
    let mut cfg = match args.config.as_ref() {
        Some(path) => load_config(path)?,
        None => Config::default(),
    };

    // Explicit flags win over file values.
    if let Some(exit_node) = &args.exit_node {
        cfg.exit_node = exit_node.clone();
    }
    if let Some(control_url) = &args.control_url {
        cfg.control_url = control_url.clone();
    }
    if let Some(hostname) = &args.hostname {
        cfg.hostname = hostname.clone();
    }
    if let Some(authkey) = &args.authkey {
        cfg.authkey = authkey.clone();
    }
    if let Some(port) = args.port {
        cfg.proxy_port = port;
    }
    if args.verbose {
        cfg.verbose = true;
    }
    if args.export_listeners {
        cfg.export_listeners = true;
    }
    if let Some(allow) = &args.export_allow_ports {
        cfg.export_allow_ports = allow.clone();
    }
    if let Some(deny) = &args.export_deny_ports {
        cfg.export_deny_ports = deny.clone();
    }
    if let Some(export_max) = args.export_max {
        cfg.export_max = export_max;
    }
    Ok(cfg)
}

// Supervisor and interposer artefact are co-located.
fn find_preload_library() -> Result<PathBuf> {
    let exe = std::env::current_exe().context("failed to locate executable")?;
    let dir = exe.parent().unwrap_or_else(|| Path::new("."));
    let lib = dir.join(PRELOAD_LIBRARY);
    if !lib.is_file() {
        return Err(anyhow!(
            "preload library not found: {}\nbuild tailproxy-preload and install {} next to the tailproxy binary",
            lib.display(),
            PRELOAD_LIBRARY
        ));
    }
    Ok(lib)
}

async fn run_child(
    command: &[String],
    cfg: &Config,
    preload_lib: &Path,
    control_sock: Option<&Path>,
) -> Result<i32> {
    let mut child_cmd = TokioCommand::new(&command[0]);
    child_cmd
        .args(&command[1..])
        .env("LD_PRELOAD", preload_lib)
        .env("TAILPROXY_HOST", Ipv4Addr::LOCALHOST.to_string())
        .env("TAILPROXY_PORT", cfg.proxy_port.to_string())
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());
    if cfg.verbose {
        child_cmd.env("TAILPROXY_VERBOSE", "1");
    }
    if cfg.export_listeners {
        child_cmd.env("TAILPROXY_EXPORT_LISTENERS", "1");
        if let Some(path) = control_sock {
            child_cmd.env("TAILPROXY_CONTROL_SOCK", path);
        }
    }

    if cfg.verbose {
        eprintln!("executing command: {:?}", command);
        eprintln!("LD_PRELOAD: {}", preload_lib.display());
    }

    let mut child = child_cmd
        .spawn()
        .with_context(|| format!("failed to start {}", command[0]))?;

    let status = tokio::select! {
        status = child.wait() => status.context("failed to wait for command")?,
        _ = wait_for_shutdown_signal() => {
            if cfg.verbose {
                eprintln!("shutdown signal received, stopping command");
            }
            let _ = child.start_kill();
            child.wait().await.context("failed to reap command")?
        }
    };
    Ok(status.code().unwrap_or(1))
}

async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        return;
    }
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DEFAULT_EXPORT_MAX, DEFAULT_HOSTNAME, DEFAULT_PROXY_PORT};

    fn args_with(overrides: impl FnOnce(&mut Args)) -> Args {
        let mut args = Args {
            exit_node: None,
            config: None,
            control_url: None,
            hostname: None,
            authkey: None,
            port: None,
            verbose: false,
            export_listeners: false,
            export_allow_ports: None,
            export_deny_ports: None,
            export_max: None,
            wg_backend: WgBackendArg::Kernel,
            command: Vec::new(),
        };
        overrides(&mut args);
        args
    }

    #[test]
    fn flags_override_config_file() -> Result<()> {
        let nonce = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)?
            .as_nanos();
        let path = std::env::temp_dir().join(format!("tailproxy-config-{}.json", nonce));
        std::fs::write(
            &path,
            r#"{"exit_node": "relay-file", "proxy_port": 1085, "export_max": 4}"#,
        )?;

        let args = args_with(|args| {
            args.config = Some(path.clone());
            args.exit_node = Some("relay-flag".to_string());
        });
        let cfg = resolve_config(&args)?;
        assert_eq!(cfg.exit_node, "relay-flag");
        assert_eq!(cfg.proxy_port, 1085);
        assert_eq!(cfg.export_max, 4);

        std::fs::remove_file(&path)?;
        Ok(())
    }

    #[test]
    fn explicit_default_values_still_override_the_file() -> Result<()> {
        let nonce = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)?
            .as_nanos();
        let path = std::env::temp_dir().join(format!("tailproxy-config-default-{}.json", nonce));
        std::fs::write(&path, r#"{"hostname": "worker", "proxy_port": 1085}"#)?;

        let args = args_with(|args| {
            args.config = Some(path.clone());
            args.hostname = Some(DEFAULT_HOSTNAME.to_string());
            args.port = Some(DEFAULT_PROXY_PORT);
        });
        let cfg = resolve_config(&args)?;
        assert_eq!(cfg.hostname, DEFAULT_HOSTNAME);
        assert_eq!(cfg.proxy_port, DEFAULT_PROXY_PORT);

        std::fs::remove_file(&path)?;
        Ok(())
    }

    #[test]
    fn defaults_apply_without_config_file() -> Result<()> {
        let cfg = resolve_config(&args_with(|_| {}))?;
        assert_eq!(cfg.hostname, DEFAULT_HOSTNAME);
        assert_eq!(cfg.proxy_port, DEFAULT_PROXY_PORT);
        assert_eq!(cfg.export_max, DEFAULT_EXPORT_MAX);
        assert!(!cfg.export_listeners);
        Ok(())
    }

    #[test]
    fn boolean_flags_enable_but_never_disable() -> Result<()> {
        let nonce = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)?
            .as_nanos();
        let path = std::env::temp_dir().join(format!("tailproxy-config-bool-{}.json", nonce));
        std::fs::write(&path, r#"{"verbose": true, "export_listeners": true}"#)?;

        let args = args_with(|args| {
            args.config = Some(path.clone());
        });
        let cfg = resolve_config(&args)?;
        assert!(cfg.verbose);
        assert!(cfg.export_listeners);

        std::fs::remove_file(&path)?;
        Ok(())
    }
}
