// Copyright 2025-2026 CEMAXECUTER LLC

//! Per-stream worker threads.
//!
//! Each activated stream owns a data pump (device-facing) and a network
//! pump (socket-facing), joined by a `JitterPipe`. Receive direction:
//! device reads are interleaved across channels and written to the pipe
//! non-blocking, so a slow client costs dropped batches, never a stalled
//! device. Transmit direction mirrors it: the socket reader writes the
//! pipe blocking, so a slow device backs pressure up the TCP connection.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use ns_device::{SdrStream, StreamError};
use ns_rpc::{Direction, SampleFormat};

use crate::pipe::JitterPipe;

/// Device read/write timeout per iteration.
const READ_TIMEOUT_US: i64 = 1_000_000;

/// Network writes are batched to roughly the stdio block size.
const NET_BLOCK_SIZE: usize = 8192;

/// Pipe capacity in device read blocks; absorbs ~10 reads of TCP jitter.
const PIPE_DEPTH: usize = 10;

/// How long a pump may sit inside a socket call before rechecking the
/// stop flag.
const SOCKET_CHECK_INTERVAL: Duration = Duration::from_millis(500);

/// Data-loss warnings are throttled to one per this many dropped batches;
/// a saturated pipe drops on every read and would flood the log.
const DROP_LOG_INTERVAL: u64 = 100;

/// Everything a pump needs, captured at activation time. Workers never
/// touch the registry.
pub struct PumpContext {
    pub id: RawFd,
    pub socket: TcpStream,
    pub stream: Arc<dyn SdrStream>,
    pub running: Arc<AtomicBool>,
    pub direction: Direction,
    pub format: SampleFormat,
    pub num_channels: usize,
    /// Single channel in the device's native format with direct buffers
    /// available: skip the interleave copy entirely.
    pub use_direct: bool,
}

/// Interleave `nelems` frames from per-channel buffers into `out`.
pub fn interleave(chans: &[Vec<u8>], frame: usize, nelems: usize, out: &mut [u8]) {
    let nch = chans.len();
    for e in 0..nelems {
        for (c, chan) in chans.iter().enumerate() {
            let src = &chan[e * frame..(e + 1) * frame];
            let off = (e * nch + c) * frame;
            out[off..off + frame].copy_from_slice(src);
        }
    }
}

/// Split `nelems` interleaved elements from `src` back into per-channel
/// buffers. Exact inverse of [`interleave`].
pub fn deinterleave(src: &[u8], frame: usize, nelems: usize, chans: &mut [Vec<u8>]) {
    let nch = chans.len();
    for e in 0..nelems {
        for (c, chan) in chans.iter_mut().enumerate() {
            let off = (e * nch + c) * frame;
            chan[e * frame..(e + 1) * frame].copy_from_slice(&src[off..off + frame]);
        }
    }
}

/// Request SCHED_FIFO for the calling thread. Advisory: without the
/// privilege or the platform support the pump runs at normal priority,
/// which costs tolerance to scheduling jitter, not correctness.
pub fn set_realtime_priority() {
    #[cfg(target_os = "linux")]
    {
        let param = libc::sched_param { sched_priority: 10 };
        let rc = unsafe {
            libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param)
        };
        if rc != 0 {
            log::debug!("realtime scheduling unavailable (errno {}), running at normal priority", rc);
        }
    }
}

/// Data pump entry point, run on a dedicated thread per activated stream.
pub fn run_data_pump(ctx: PumpContext) {
    set_realtime_priority();
    match ctx.direction {
        Direction::Rx => run_rx(&ctx),
        Direction::Tx => run_tx(&ctx),
    }
    log::debug!("data stream {}: pump finished", ctx.id);
}

fn run_rx(ctx: &PumpContext) {
    if let Err(e) = ctx.stream.activate() {
        log::error!("data stream {}: failed to activate device stream: {}", ctx.id, e);
        return;
    }
    let frame = ctx.format.frame_size();
    let elem_size = frame * ctx.num_channels;
    let num_elems = ctx.stream.mtu().max(1);
    let read_size = num_elems * elem_size;
    let pipe = Arc::new(JitterPipe::new(read_size * PIPE_DEPTH));

    let net = {
        let pipe = Arc::clone(&pipe);
        let running = Arc::clone(&ctx.running);
        let id = ctx.id;
        match ctx.socket.try_clone() {
            Ok(socket) => thread::Builder::new()
                .name(format!("net-pump-{}", ctx.id))
                .spawn(move || run_rx_net(&pipe, socket, &running, elem_size, id))
                .ok(),
            Err(e) => {
                log::error!("data stream {}: failed to clone data socket: {}", ctx.id, e);
                None
            }
        }
    };
    if net.is_none() {
        let _ = ctx.stream.deactivate();
        return;
    }

    let mut chans: Vec<Vec<u8>> = vec![vec![0u8; num_elems * frame]; ctx.num_channels];
    let mut inter = vec![0u8; read_size];
    let mut dropped: u64 = 0;
    let mut drop_batches: u64 = 0;

    while ctx.running.load(Ordering::Acquire) {
        let result = if ctx.use_direct {
            let id = ctx.id;
            let pipe = &pipe;
            let dropped = &mut dropped;
            let drop_batches = &mut drop_batches;
            ctx.stream.read_direct(
                &mut |bytes| {
                    let items = bytes.len() / elem_size;
                    let wrote = pipe.write(bytes, elem_size, items, false);
                    if wrote < items {
                        *dropped += (items - wrote) as u64;
                        *drop_batches += 1;
                        if *drop_batches % DROP_LOG_INTERVAL == 1 {
                            log::warn!(
                                "data stream {}: {} elements dropped (network backlog)",
                                id,
                                dropped
                            );
                        }
                    }
                },
                READ_TIMEOUT_US,
            )
        } else {
            let result = {
                let mut refs: Vec<&mut [u8]> =
                    chans.iter_mut().map(|c| c.as_mut_slice()).collect();
                ctx.stream.read(&mut refs, num_elems, READ_TIMEOUT_US)
            };
            if let Ok(nread) = result {
                interleave(&chans, frame, nread, &mut inter);
                let wrote = pipe.write(&inter[..nread * elem_size], elem_size, nread, false);
                if wrote < nread {
                    dropped += (nread - wrote) as u64;
                    drop_batches += 1;
                    if drop_batches % DROP_LOG_INTERVAL == 1 {
                        log::warn!(
                            "data stream {}: {} elements dropped (network backlog)",
                            ctx.id,
                            dropped
                        );
                    }
                }
            }
            result
        };
        match result {
            Ok(_) => {}
            Err(StreamError::Overflow) | Err(StreamError::Timeout) => continue,
            Err(e) => {
                log::error!("data stream {}: device read failed: {}", ctx.id, e);
                break;
            }
        }
    }

    ctx.running.store(false, Ordering::Release);
    // a final dummy element wakes a network pump blocked on an empty pipe;
    // it checks the stop flag before forwarding anything
    let dummy = vec![0u8; elem_size];
    pipe.write(&dummy, elem_size, 1, false);
    pipe.close();
    if let Some(net) = net {
        let _ = net.join();
    }
    if let Err(e) = ctx.stream.deactivate() {
        log::warn!("data stream {}: deactivate failed: {}", ctx.id, e);
    }
}

fn run_rx_net(
    pipe: &JitterPipe,
    mut socket: TcpStream,
    running: &AtomicBool,
    elem_size: usize,
    id: RawFd,
) {
    if let Err(e) = socket.set_write_timeout(Some(SOCKET_CHECK_INTERVAL)) {
        log::debug!("data stream {}: set_write_timeout failed: {}", id, e);
    }
    let max_elems = (NET_BLOCK_SIZE / elem_size).max(1);
    let mut buf = vec![0u8; max_elems * elem_size];
    loop {
        let n = pipe.read(&mut buf, elem_size, max_elems, true);
        if !running.load(Ordering::Acquire) || n == 0 {
            break;
        }
        if !write_all_checked(&mut socket, &buf[..n * elem_size], running, id) {
            // the data pump sees the flag and winds the stream down;
            // the client observes EOF on its data socket
            running.store(false, Ordering::Release);
            break;
        }
    }
}

/// `write_all` that re-checks the stop flag on every timeout so a stalled
/// peer cannot pin the pump. Returns false on socket failure or stop.
fn write_all_checked(
    socket: &mut TcpStream,
    buf: &[u8],
    running: &AtomicBool,
    id: RawFd,
) -> bool {
    let mut off = 0;
    while off < buf.len() {
        if !running.load(Ordering::Acquire) {
            return false;
        }
        match socket.write(&buf[off..]) {
            Ok(0) => {
                log::error!("data stream {}: network write returned zero", id);
                return false;
            }
            Ok(n) => off += n,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut
                    || e.kind() == std::io::ErrorKind::Interrupted =>
            {
                continue;
            }
            Err(e) => {
                log::error!("data stream {}: network write failed: {}", id, e);
                return false;
            }
        }
    }
    true
}

fn run_tx(ctx: &PumpContext) {
    if let Err(e) = ctx.stream.activate() {
        log::error!("data stream {}: failed to activate device stream: {}", ctx.id, e);
        return;
    }
    let frame = ctx.format.frame_size();
    let elem_size = frame * ctx.num_channels;
    let num_elems = ctx.stream.mtu().max(1);
    let read_size = num_elems * elem_size;
    let pipe = Arc::new(JitterPipe::new(read_size * PIPE_DEPTH));

    let net = {
        let pipe = Arc::clone(&pipe);
        let running = Arc::clone(&ctx.running);
        let id = ctx.id;
        match ctx.socket.try_clone() {
            Ok(socket) => thread::Builder::new()
                .name(format!("net-pump-{}", ctx.id))
                .spawn(move || run_tx_net(&pipe, socket, &running, elem_size, id))
                .ok(),
            Err(e) => {
                log::error!("data stream {}: failed to clone data socket: {}", ctx.id, e);
                None
            }
        }
    };
    if net.is_none() {
        let _ = ctx.stream.deactivate();
        return;
    }

    let mut chans: Vec<Vec<u8>> = vec![vec![0u8; num_elems * frame]; ctx.num_channels];
    let mut inter = vec![0u8; read_size];

    while ctx.running.load(Ordering::Acquire) {
        let n = pipe.read(&mut inter, elem_size, num_elems, true);
        if n == 0 {
            // pipe closed by the network pump
            break;
        }
        deinterleave(&inter, frame, n, &mut chans);
        let mut written = 0;
        while written < n && ctx.running.load(Ordering::Acquire) {
            let refs: Vec<&[u8]> = chans
                .iter()
                .map(|c| &c[written * frame..n * frame])
                .collect();
            match ctx.stream.write(&refs, n - written, READ_TIMEOUT_US) {
                Ok(w) => written += w,
                Err(StreamError::Timeout) | Err(StreamError::Underflow) => continue,
                Err(e) => {
                    log::error!("data stream {}: device write failed: {}", ctx.id, e);
                    ctx.running.store(false, Ordering::Release);
                    break;
                }
            }
        }
    }

    ctx.running.store(false, Ordering::Release);
    pipe.close();
    if let Some(net) = net {
        let _ = net.join();
    }
    if let Err(e) = ctx.stream.deactivate() {
        log::warn!("data stream {}: deactivate failed: {}", ctx.id, e);
    }
}

fn run_tx_net(
    pipe: &JitterPipe,
    mut socket: TcpStream,
    running: &AtomicBool,
    elem_size: usize,
    id: RawFd,
) {
    if let Err(e) = socket.set_read_timeout(Some(SOCKET_CHECK_INTERVAL)) {
        log::debug!("data stream {}: set_read_timeout failed: {}", id, e);
    }
    let max_elems = (NET_BLOCK_SIZE / elem_size).max(1);
    // one extra element of room carries a torn trailing element between
    // socket reads
    let mut buf = vec![0u8; (max_elems + 1) * elem_size];
    let mut have = 0usize;
    'outer: loop {
        if !running.load(Ordering::Acquire) {
            break;
        }
        match socket.read(&mut buf[have..]) {
            Ok(0) => break, // client finished sending
            Ok(n) => {
                have += n;
                let items = have / elem_size;
                if items == 0 {
                    continue;
                }
                // blocking writes: a full pipe stops socket reads here and
                // TCP flow-controls the client until the device catches up
                let mut sent = 0;
                while sent < items {
                    let w = pipe.write(
                        &buf[sent * elem_size..items * elem_size],
                        elem_size,
                        items - sent,
                        true,
                    );
                    if w == 0 {
                        break 'outer; // pipe closed under us
                    }
                    sent += w;
                }
                let rem = have - items * elem_size;
                buf.copy_within(items * elem_size..have, 0);
                have = rem;
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut
                    || e.kind() == std::io::ErrorKind::Interrupted =>
            {
                continue;
            }
            Err(e) => {
                log::error!("data stream {}: network read failed: {}", id, e);
                break;
            }
        }
    }
    pipe.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use ns_device::dummy::DummyDevice;
    use ns_device::SdrDevice;
    use ns_rpc::Kwargs;
    use std::net::{TcpListener, TcpStream};
    use std::time::Instant;

    fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let a = TcpStream::connect(addr).unwrap();
        let (b, _) = listener.accept().unwrap();
        (a, b)
    }

    #[test]
    fn test_interleave_bijection() {
        let frame = 4;
        let nelems = 16;
        let chans: Vec<Vec<u8>> = (0..3)
            .map(|c| (0..nelems * frame).map(|i| (i as u8).wrapping_mul(c as u8 + 1)).collect())
            .collect();
        let mut wire = vec![0u8; nelems * frame * 3];
        interleave(&chans, frame, nelems, &mut wire);

        // first element carries one frame from each channel in order
        assert_eq!(&wire[0..4], &chans[0][0..4]);
        assert_eq!(&wire[4..8], &chans[1][0..4]);
        assert_eq!(&wire[8..12], &chans[2][0..4]);

        let mut back: Vec<Vec<u8>> = vec![vec![0u8; nelems * frame]; 3];
        deinterleave(&wire, frame, nelems, &mut back);
        assert_eq!(back, chans);
    }

    #[test]
    fn test_rx_pump_delivers_interleaved_script() {
        let nelems = 64usize;
        let frame = 4usize;
        let ch_a: Vec<u8> = (0..nelems * frame).map(|i| i as u8).collect();
        let ch_b: Vec<u8> = (0..nelems * frame).map(|i| (i as u8) ^ 0xFF).collect();
        let dev = DummyDevice::with_channel_samples(
            ns_rpc::SampleFormat::Cs16,
            vec![ch_a.clone(), ch_b.clone()],
        );
        let stream = dev
            .setup_stream(
                ns_rpc::Direction::Rx,
                ns_rpc::SampleFormat::Cs16,
                &[0, 1],
                &Kwargs::new(),
            )
            .unwrap();

        let (mut client, server_sock) = socket_pair();
        let running = Arc::new(AtomicBool::new(true));
        let ctx = PumpContext {
            id: 1,
            socket: server_sock,
            stream,
            running: Arc::clone(&running),
            direction: ns_rpc::Direction::Rx,
            format: ns_rpc::SampleFormat::Cs16,
            num_channels: 2,
            use_direct: false,
        };
        let pump = thread::spawn(move || run_data_pump(ctx));

        let mut wire = vec![0u8; nelems * frame * 2];
        client.read_exact(&mut wire).unwrap();

        let mut back: Vec<Vec<u8>> = vec![vec![0u8; nelems * frame]; 2];
        deinterleave(&wire, frame, nelems, &mut back);
        assert_eq!(back[0], ch_a);
        assert_eq!(back[1], ch_b);

        running.store(false, Ordering::Release);
        pump.join().unwrap();
    }

    #[test]
    fn test_rx_pump_direct_path_single_channel() {
        let nelems = 32usize;
        let frame = 4usize;
        let ch: Vec<u8> = (0..nelems * frame).map(|i| (i as u8).wrapping_mul(3)).collect();
        let dev =
            DummyDevice::with_channel_samples(ns_rpc::SampleFormat::Cs16, vec![ch.clone()]);
        let stream = dev
            .setup_stream(
                ns_rpc::Direction::Rx,
                ns_rpc::SampleFormat::Cs16,
                &[0],
                &Kwargs::new(),
            )
            .unwrap();
        assert!(stream.has_direct_buffers());

        let (mut client, server_sock) = socket_pair();
        let running = Arc::new(AtomicBool::new(true));
        let ctx = PumpContext {
            id: 2,
            socket: server_sock,
            stream,
            running: Arc::clone(&running),
            direction: ns_rpc::Direction::Rx,
            format: ns_rpc::SampleFormat::Cs16,
            num_channels: 1,
            use_direct: true,
        };
        let pump = thread::spawn(move || run_data_pump(ctx));

        let mut wire = vec![0u8; nelems * frame];
        client.read_exact(&mut wire).unwrap();
        assert_eq!(wire, ch);

        running.store(false, Ordering::Release);
        pump.join().unwrap();
    }

    #[test]
    fn test_tx_pump_feeds_device() {
        let dev = DummyDevice::from_args(&Kwargs::new());
        let stream = dev
            .setup_stream(
                ns_rpc::Direction::Tx,
                ns_rpc::SampleFormat::Cs8,
                &[0],
                &Kwargs::new(),
            )
            .unwrap();

        let (mut client, server_sock) = socket_pair();
        let running = Arc::new(AtomicBool::new(true));
        let ctx = PumpContext {
            id: 3,
            socket: server_sock,
            stream,
            running: Arc::clone(&running),
            direction: ns_rpc::Direction::Tx,
            format: ns_rpc::SampleFormat::Cs8,
            num_channels: 1,
            use_direct: false,
        };
        let pump = thread::spawn(move || run_data_pump(ctx));

        let payload: Vec<u8> = (0..128u8).collect(); // 64 CS8 elements
        client.write_all(&payload).unwrap();
        drop(client); // EOF lets the network pump finish cleanly

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let captured = dev.captured_tx();
            if captured[0] == payload {
                break;
            }
            assert!(Instant::now() < deadline, "device never saw the payload");
            thread::sleep(Duration::from_millis(10));
        }

        running.store(false, Ordering::Release);
        pump.join().unwrap();
    }

    #[test]
    fn test_stalled_client_does_not_stall_device_or_shutdown() {
        // unlimited generator, client never reads: the pipe fills, writes
        // drop, and deactivation still completes promptly
        let dev = DummyDevice::from_args(&Kwargs::new());
        let stream = dev
            .setup_stream(
                ns_rpc::Direction::Rx,
                ns_rpc::SampleFormat::Cs16,
                &[0, 1],
                &Kwargs::new(),
            )
            .unwrap();

        let (client, server_sock) = socket_pair();
        let running = Arc::new(AtomicBool::new(true));
        let ctx = PumpContext {
            id: 4,
            socket: server_sock,
            stream,
            running: Arc::clone(&running),
            direction: ns_rpc::Direction::Rx,
            format: ns_rpc::SampleFormat::Cs16,
            num_channels: 2,
            use_direct: false,
        };
        let pump = thread::spawn(move || run_data_pump(ctx));

        // let it churn against a full pipe for a while
        thread::sleep(Duration::from_millis(300));

        let start = Instant::now();
        running.store(false, Ordering::Release);
        pump.join().unwrap();
        assert!(
            start.elapsed() < Duration::from_secs(2),
            "deactivation took {:?}",
            start.elapsed()
        );
        drop(client);
    }
}
