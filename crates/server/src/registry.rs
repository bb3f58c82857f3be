// Copyright 2025-2026 CEMAXECUTER LLC

//! Connection registry: one record per accepted socket, keyed by the raw
//! fd value, which doubles as the wire-visible connection identifier.
//!
//! The registry is owned exclusively by the server loop thread. That
//! ownership is the synchronisation: inserts, lookups and removals all
//! happen there. Pump threads receive `Arc` clones of exactly the state
//! they need at spawn time and never see the registry; a data connection
//! is removed only after its worker has been joined.

use std::collections::HashMap;
use std::net::TcpStream;
use std::os::unix::io::RawFd;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread::JoinHandle;

use ns_device::{SdrDevice, SdrStream};
use ns_rpc::{Direction, SampleFormat, TcpCodec};

/// RPC connection: the codec, the device it loaded, and the data
/// connections it has set up (closed in cascade when the RPC drops).
pub struct RpcConn {
    pub codec: TcpCodec,
    pub device: Arc<dyn SdrDevice>,
    pub data_ids: Vec<RawFd>,
}

/// Stream state filled in by a successful setupStream. Present exactly
/// between setupStream and closeStream.
pub struct StreamConfig {
    pub format: SampleFormat,
    pub channels: Vec<usize>,
    pub stream: Arc<dyn SdrStream>,
}

/// Data connection: a raw socket pumped by worker threads once activated.
pub struct DataConn {
    pub socket: TcpStream,
    pub direction: Direction,
    pub config: Option<StreamConfig>,
    /// Cooperative stop signal shared with the pumps. Set true before the
    /// worker spawns so the worker can never observe an uninitialised
    /// state.
    pub running: Arc<AtomicBool>,
    pub worker: Option<JoinHandle<()>>,
    /// The RPC connection that set this stream up.
    pub owner: Option<RawFd>,
}

impl DataConn {
    pub fn new(socket: TcpStream, direction: Direction) -> Self {
        DataConn {
            socket,
            direction,
            config: None,
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
            owner: None,
        }
    }
}

/// Log connection: records stream to the client; the write half lives in
/// the logger thread's sink table, this record only tracks liveness.
pub struct LogConn {
    pub socket: TcpStream,
    pub level: log::Level,
}

pub enum Connection {
    Rpc(RpcConn),
    Data(DataConn),
    Log(LogConn),
}

#[derive(Default)]
pub struct Registry {
    map: HashMap<RawFd, Connection>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    pub fn insert(&mut self, fd: RawFd, conn: Connection) {
        self.map.insert(fd, conn);
    }

    pub fn remove(&mut self, fd: RawFd) -> Option<Connection> {
        self.map.remove(&fd)
    }

    pub fn get(&self, fd: RawFd) -> Option<&Connection> {
        self.map.get(&fd)
    }

    pub fn get_mut(&mut self, fd: RawFd) -> Option<&mut Connection> {
        self.map.get_mut(&fd)
    }

    pub fn data_mut(&mut self, fd: RawFd) -> Option<&mut DataConn> {
        match self.map.get_mut(&fd) {
            Some(Connection::Data(d)) => Some(d),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// RPC connection fds, for the readiness poll.
    pub fn rpc_fds(&self) -> Vec<RawFd> {
        self.map
            .iter()
            .filter(|(_, c)| matches!(c, Connection::Rpc(_)))
            .map(|(&fd, _)| fd)
            .collect()
    }

    /// Log connection fds, for the readiness poll.
    pub fn log_fds(&self) -> Vec<RawFd> {
        self.map
            .iter()
            .filter(|(_, c)| matches!(c, Connection::Log(_)))
            .map(|(&fd, _)| fd)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ns_rpc::Kwargs;
    use std::net::{TcpListener, TcpStream};

    fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let a = TcpStream::connect(addr).unwrap();
        let (b, _) = listener.accept().unwrap();
        (a, b)
    }

    #[test]
    fn test_fd_classification() {
        use std::os::unix::io::AsRawFd;
        let mut reg = Registry::new();

        let (_keep1, data_sock) = socket_pair();
        let data_fd = data_sock.as_raw_fd();
        reg.insert(data_fd, Connection::Data(DataConn::new(data_sock, Direction::Rx)));

        let (_keep2, log_sock) = socket_pair();
        let log_fd = log_sock.as_raw_fd();
        reg.insert(
            log_fd,
            Connection::Log(LogConn {
                socket: log_sock,
                level: log::Level::Info,
            }),
        );

        let (_keep3, rpc_sock) = socket_pair();
        let rpc_fd = rpc_sock.as_raw_fd();
        let device = ns_device::make_device("dummy", &Kwargs::new()).unwrap();
        reg.insert(
            rpc_fd,
            Connection::Rpc(RpcConn {
                codec: TcpCodec::from_stream(rpc_sock).unwrap(),
                device,
                data_ids: Vec::new(),
            }),
        );

        assert_eq!(reg.rpc_fds(), vec![rpc_fd]);
        assert_eq!(reg.log_fds(), vec![log_fd]);
        assert!(reg.data_mut(data_fd).is_some());
        assert!(reg.data_mut(rpc_fd).is_none());

        assert!(reg.remove(data_fd).is_some());
        assert!(reg.get(data_fd).is_none());
    }
}
