// Copyright 2025-2026 CEMAXECUTER LLC

//! Listener and readiness-driven main loop.
//!
//! One thread owns everything here: the listen socket, the registry, and
//! all RPC/LOG socket I/O. Readiness comes from poll(2) over the listen
//! fd plus every RPC and LOG fd; data connections are never polled, their
//! sockets belong to pump threads. The first two bytes of a fresh
//! connection select its type.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ns_rpc::{codec::read_line_unbuffered, ConnectionType, Direction, Kwargs, TcpCodec};

use crate::dispatch::{self, Control};
use crate::logging::RemoteLogger;
use crate::registry::{Connection, DataConn, LogConn, Registry, RpcConn};

#[derive(Debug)]
pub enum ServerError {
    /// The listen host/port did not resolve.
    Resolve(String),
    /// Binding the listen socket failed.
    Bind(std::io::Error),
    /// The readiness poll failed.
    Poll(std::io::Error),
    /// The registry and the poll set disagree; the process state is
    /// unreliable.
    Fatal(String),
}

impl ServerError {
    pub fn exit_code(&self) -> i32 {
        match self {
            ServerError::Resolve(_) => 1,
            ServerError::Bind(_) => 2,
            ServerError::Poll(_) => 3,
            ServerError::Fatal(_) => 4,
        }
    }
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::Resolve(what) => write!(f, "failed to resolve listen address: {}", what),
            ServerError::Bind(e) => write!(f, "failed to bind listen socket: {}", e),
            ServerError::Poll(e) => write!(f, "failed waiting for input: {}", e),
            ServerError::Fatal(what) => write!(f, "fatal RPC error: {}", what),
        }
    }
}

impl std::error::Error for ServerError {}

pub struct Server {
    listener: TcpListener,
    registry: Registry,
    logger: &'static RemoteLogger,
}

impl Server {
    pub fn bind(host: &str, port: u16, logger: &'static RemoteLogger) -> Result<Self, ServerError> {
        let addr = (host, port)
            .to_socket_addrs()
            .map_err(|e| ServerError::Resolve(format!("{}:{}: {}", host, port, e)))?
            .next()
            .ok_or_else(|| ServerError::Resolve(format!("{}:{}", host, port)))?;
        let listener = TcpListener::bind(addr).map_err(ServerError::Bind)?;
        Ok(Server {
            listener,
            registry: Registry::new(),
            logger,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Run until `running` goes false (poll is woken by the signal that
    /// clears it) or a fatal error.
    pub fn run(mut self, running: Arc<AtomicBool>) -> Result<(), ServerError> {
        let listen_fd = self.listener.as_raw_fd();
        while running.load(Ordering::SeqCst) {
            // data connections are deliberately absent: their sockets are
            // driven entirely by pump threads
            let rpc_fds = self.registry.rpc_fds();
            let log_fds = self.registry.log_fds();
            let mut fds: Vec<libc::pollfd> = Vec::with_capacity(1 + rpc_fds.len() + log_fds.len());
            fds.push(libc::pollfd {
                fd: listen_fd,
                events: libc::POLLIN,
                revents: 0,
            });
            for &fd in rpc_fds.iter().chain(log_fds.iter()) {
                fds.push(libc::pollfd {
                    fd,
                    events: libc::POLLIN,
                    revents: 0,
                });
            }

            let rv = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
            if rv < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue; // re-check the run flag
                }
                return Err(ServerError::Poll(err));
            }

            if fds[0].revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
                return Err(ServerError::Fatal("listen socket failed".to_string()));
            }
            if fds[0].revents & libc::POLLIN != 0 {
                self.accept_one();
            }

            for pfd in &fds[1..] {
                if pfd.revents == 0 {
                    continue;
                }
                if rpc_fds.contains(&pfd.fd) {
                    self.handle_rpc_ready(pfd.fd, pfd.revents);
                } else {
                    // logs are server-to-client only: readability or error
                    // means the client has closed or misbehaved
                    self.drop_log(pfd.fd);
                }
            }
        }
        Ok(())
    }

    fn accept_one(&mut self) {
        let (mut sock, addr) = match self.listener.accept() {
            Ok(pair) => pair,
            Err(e) => {
                log::error!("error accepting connection: {}", e);
                return;
            }
        };
        // the first two bytes type the connection: one ASCII digit + newline
        let mut ty = [0u8; 2];
        if let Err(e) = sock.read_exact(&mut ty) {
            log::error!("error reading connection type from {}: {}", addr, e);
            return;
        }
        match ConnectionType::from_byte(ty[0]) {
            Some(ConnectionType::RpcLoad) => self.create_rpc(sock),
            Some(ConnectionType::DataSend) => self.create_data(sock, Direction::Rx),
            Some(ConnectionType::DataRecv) => self.create_data(sock, Direction::Tx),
            Some(ConnectionType::Log) => self.create_log(sock),
            None => {
                log::error!("unknown connection type {:?} from {}", ty[0] as char, addr);
            }
        }
    }

    fn create_rpc(&mut self, sock: TcpStream) {
        let fd = sock.as_raw_fd();
        let mut codec = match TcpCodec::from_stream(sock) {
            Ok(c) => c,
            Err(e) => {
                log::error!("failed to set up RPC codec: {}", e);
                return;
            }
        };
        // driver name, then driver arguments as one /-separated line
        let driver = match codec.read_string() {
            Ok(d) if !d.is_empty() => d,
            _ => {
                log::error!("RPC connection {} sent no driver name", fd);
                return;
            }
        };
        let flat = codec.read_string().unwrap_or_default();
        let args = Kwargs::from_flat(&flat, '/');
        match ns_device::make_device(&driver, &args) {
            Ok(device) => {
                log::info!("rpc {}: loaded driver {} ({})", fd, driver, device.hardware_key());
                if codec.write_int(fd as i64).is_err() {
                    return;
                }
                self.registry.insert(
                    fd,
                    Connection::Rpc(RpcConn {
                        codec,
                        device,
                        data_ids: Vec::new(),
                    }),
                );
            }
            Err(e) => {
                log::error!("failed to create device {}: {}", driver, e);
                let _ = codec.write_int(-1);
            }
        }
    }

    fn create_data(&mut self, mut sock: TcpStream, direction: Direction) {
        let fd = sock.as_raw_fd();
        // the fd value is the dataId the client will quote in setupStream
        if let Err(e) = sock.write_all(format!("{}\n", fd).as_bytes()) {
            log::error!("failed to send data stream id: {}", e);
            return;
        }
        log::debug!("data stream {} connected ({:?})", fd, direction);
        self.registry
            .insert(fd, Connection::Data(DataConn::new(sock, direction)));
    }

    fn create_log(&mut self, mut sock: TcpStream) {
        let fd = sock.as_raw_fd();
        // one line declaring the minimum level, 1=error .. 5=trace
        let level = match read_line_unbuffered(&mut sock, 8)
            .ok()
            .and_then(|l| l.parse::<usize>().ok())
            .and_then(level_from_wire)
        {
            Some(level) => level,
            None => {
                log::error!("log connection {} sent an invalid level", fd);
                return;
            }
        };
        let sink = match sock.try_clone() {
            Ok(s) => s,
            Err(e) => {
                log::error!("failed to clone log socket: {}", e);
                return;
            }
        };
        self.logger.add_sink(fd, sink, level);
        log::debug!("log connection {} at {} or above", fd, level);
        self.registry
            .insert(fd, Connection::Log(LogConn { socket: sock, level }));
    }

    fn handle_rpc_ready(&mut self, fd: RawFd, revents: libc::c_short) {
        if revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
            log::error!("EOF or error on RPC socket {}", fd);
            self.drop_rpc(fd);
            return;
        }
        // take the connection out so handlers can reach other registry
        // entries; reinsert unless it was dropped
        let Some(Connection::Rpc(mut rpc)) = self.registry.remove(fd) else {
            return;
        };
        loop {
            match dispatch::dispatch_request(&mut rpc, &mut self.registry, fd) {
                Ok(Control::Keep) => {
                    // drain pipelined requests the poll cannot see
                    if rpc.codec.has_buffered() {
                        continue;
                    }
                    self.registry.insert(fd, Connection::Rpc(rpc));
                    return;
                }
                Ok(Control::Drop) => break,
                Err(e) => {
                    log::error!("rpc {}: {}", fd, e);
                    break;
                }
            }
        }
        // cascade: close owned data streams, then release the device
        for data_id in std::mem::take(&mut rpc.data_ids) {
            dispatch::close_data_stream(&mut self.registry, data_id);
        }
        log::info!("rpc {} dropped", fd);
        drop(rpc);
    }

    fn drop_rpc(&mut self, fd: RawFd) {
        let Some(Connection::Rpc(mut rpc)) = self.registry.remove(fd) else {
            return;
        };
        for data_id in std::mem::take(&mut rpc.data_ids) {
            dispatch::close_data_stream(&mut self.registry, data_id);
        }
        log::info!("rpc {} dropped", fd);
    }

    fn drop_log(&mut self, fd: RawFd) {
        self.logger.remove_sink(fd);
        self.registry.remove(fd);
        log::debug!("log connection {} closed", fd);
    }
}

fn level_from_wire(v: usize) -> Option<log::Level> {
    match v {
        1 => Some(log::Level::Error),
        2 => Some(log::Level::Warn),
        3 => Some(log::Level::Info),
        4 => Some(log::Level::Debug),
        5 => Some(log::Level::Trace),
        _ => None,
    }
}
