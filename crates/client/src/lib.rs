// Copyright 2025-2026 CEMAXECUTER LLC

//! Client side of the TCP SDR remoting protocol.
//!
//! [`enumerate`] resolves discovery arguments (with configuration-file
//! fallback) into connection descriptions; [`make`] turns one into a
//! [`RemoteDevice`] that implements the local device API by forwarding
//! every call to the server. Sample data flows over per-stream data
//! sockets, never over the RPC path.

mod remote;

pub use remote::RemoteDevice;

use std::io::Write;
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::Arc;

use ns_device::{DeviceError, DeviceResult, SdrDevice};
use ns_rpc::{ConnectionType, Kwargs, DEFAULT_PORT};

/// Discovery key for this driver.
pub const DRIVER_KEY: &str = "tcpremote";

/// Configuration file name searched when discovery arguments are missing.
pub const CONFIG_FILE_NAME: &str = "SoapyTCPRemote.conf";

/// Resolve discovery arguments into zero or one connection descriptions.
///
/// Mandatory: `tcpremote:address` (host[:port]) and `tcpremote:driver`
/// (the driver key the server loads). Optional: `tcpremote:args`
/// (/-separated key=value pairs passed to the remote driver). Missing
/// address or driver fall back to the configuration file.
pub fn enumerate(args: &Kwargs) -> Vec<Kwargs> {
    let config = load_config();

    let address = args
        .get("tcpremote:address")
        .map(str::to_string)
        .or_else(|| config.as_ref().and_then(|c| c.get("address").map(str::to_string)));
    let driver = args
        .get("tcpremote:driver")
        .map(str::to_string)
        .or_else(|| config.as_ref().and_then(|c| c.get("driver").map(str::to_string)));
    let remote_args = args
        .get("tcpremote:args")
        .map(str::to_string)
        .or_else(|| config.as_ref().and_then(|c| c.get("args").map(str::to_string)))
        .unwrap_or_default();

    let Some(address) = address else {
        log::error!("missing tcpremote:address");
        return Vec::new();
    };
    let Some(driver) = driver else {
        log::error!("missing tcpremote:driver");
        return Vec::new();
    };

    let (host, port) = split_host_port(&address);
    let mut info = Kwargs::new();
    info.set("device", &format!("TCP remote: {}", host));
    info.set("address", &host);
    info.set("port", &port.to_string());
    info.set("tcpremote:driver", &driver);
    info.set("tcpremote:args", &remote_args);
    vec![info]
}

/// Open a device from an [`enumerate`] result.
pub fn make(args: &Kwargs) -> DeviceResult<Arc<dyn SdrDevice>> {
    let address = args
        .get("address")
        .ok_or_else(|| DeviceError::Driver("missing address".to_string()))?;
    let port = args
        .get("port")
        .and_then(|p| p.parse().ok())
        .unwrap_or(DEFAULT_PORT);
    let driver = args
        .get("tcpremote:driver")
        .ok_or_else(|| DeviceError::Driver("missing tcpremote:driver".to_string()))?;
    let remote_args = args.get("tcpremote:args").unwrap_or("");
    let device = RemoteDevice::make(address, port, driver, remote_args)?;
    Ok(Arc::new(device))
}

/// Open a LOG connection. The server streams `level:message` lines for
/// every record at or above `min_level` (1=error .. 5=trace) until the
/// socket is closed.
pub fn connect_log(address: &str, port: u16, min_level: u8) -> std::io::Result<TcpStream> {
    let mut sock = TcpStream::connect((address, port))?;
    sock.write_all(ConnectionType::Log.type_line().as_bytes())?;
    sock.write_all(format!("{}\n", min_level).as_bytes())?;
    Ok(sock)
}

/// Split `host[:port]`, defaulting the port.
fn split_host_port(address: &str) -> (String, u16) {
    match address.rsplit_once(':') {
        Some((host, port)) => match port.parse() {
            Ok(port) => (host.to_string(), port),
            Err(_) => (address.to_string(), DEFAULT_PORT),
        },
        None => (address.to_string(), DEFAULT_PORT),
    }
}

/// Candidate configuration paths, most preferred first: each entry of
/// `$XDG_CONFIG_DIRS` (colon-split), then /etc/xdg, then ~/.config.
fn config_search_paths(xdg_config_dirs: Option<&str>, home: Option<&str>) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(dirs) = xdg_config_dirs {
        for dir in dirs.split(':').filter(|d| !d.is_empty()) {
            paths.push(PathBuf::from(dir).join(CONFIG_FILE_NAME));
        }
    }
    paths.push(PathBuf::from("/etc/xdg").join(CONFIG_FILE_NAME));
    if let Some(home) = home {
        paths.push(PathBuf::from(home).join(".config").join(CONFIG_FILE_NAME));
    }
    paths
}

/// Parse a configuration file: key=value per line, `#` starts a comment.
pub fn parse_config(text: &str) -> Kwargs {
    let mut config = Kwargs::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            let k = k.trim();
            if !k.is_empty() {
                config.set(k, v.trim());
            }
        }
    }
    config
}

fn load_config() -> Option<Kwargs> {
    let xdg = std::env::var("XDG_CONFIG_DIRS").ok();
    let home = std::env::var("HOME").ok();
    for path in config_search_paths(xdg.as_deref(), home.as_deref()) {
        if let Ok(text) = std::fs::read_to_string(&path) {
            log::debug!("using configuration from {}", path.display());
            return Some(parse_config(&text));
        }
    }
    None
}
