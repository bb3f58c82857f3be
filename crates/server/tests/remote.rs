// Copyright 2025-2026 CEMAXECUTER LLC

//! End-to-end scenarios: a real listener on an ephemeral port, the dummy
//! backend behind it, and clients speaking the actual wire protocol
//! (sometimes through ns_client, sometimes raw bytes).

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use ns_client::RemoteDevice;
use ns_device::dummy::pattern_frame;
use ns_device::{SdrDevice, StreamError};
use ns_rpc::{Direction, Kwargs, SampleFormat};
use ns_server::server::Server;

fn start_server() -> SocketAddr {
    let logger = ns_server::logging::init();
    let server = Server::bind("127.0.0.1", 0, logger).expect("bind ephemeral port");
    let addr = server.local_addr().unwrap();
    let running = Arc::new(AtomicBool::new(true));
    thread::spawn(move || {
        let _ = server.run(running);
    });
    addr
}

fn read_reply_line(reader: &mut impl BufRead) -> String {
    let mut line = String::new();
    reader.read_line(&mut line).unwrap();
    line.trim_end_matches('\n').to_string()
}

/// S1: driver load over raw bytes, then a pass-through RPC.
#[test]
fn s1_driver_load_raw_wire() {
    let addr = start_server();
    let mut sock = TcpStream::connect(addr).unwrap();
    sock.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut reader = BufReader::new(sock.try_clone().unwrap());

    sock.write_all(b"0\ndummy\nk1=v1/k2=v2\n").unwrap();
    let id: i64 = read_reply_line(&mut reader).parse().unwrap();
    assert!(id > 0, "driver load must reply the connection id, got {}", id);

    // getHardwareKey: sentinel, tag, no args
    sock.write_all(b"#RPC\n4\n").unwrap();
    assert_eq!(read_reply_line(&mut reader), "dummy-key");

    // unknown tag: error sentinel reply, connection stays usable
    sock.write_all(b"#RPC\n999\n").unwrap();
    assert_eq!(read_reply_line(&mut reader), "-1000");
    sock.write_all(b"#RPC\n4\n").unwrap();
    assert_eq!(read_reply_line(&mut reader), "dummy-key");
}

/// An unknown typing digit closes the socket; the listener is unharmed.
#[test]
fn unknown_connection_type_is_closed() {
    let addr = start_server();
    let mut sock = TcpStream::connect(addr).unwrap();
    sock.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    sock.write_all(b"9\n").unwrap();
    let mut sink = [0u8; 8];
    assert_eq!(sock.read(&mut sink).unwrap(), 0, "socket should close");

    let mut again = TcpStream::connect(addr).unwrap();
    again.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut reader = BufReader::new(again.try_clone().unwrap());
    again.write_all(b"0\ndummy\n\n").unwrap();
    assert!(read_reply_line(&mut reader).parse::<i64>().unwrap() > 0);
}

/// S2: RX stream, CS16, one channel, MTU 1024: the first 1024 elements
/// arrive intact and decode to exactly what the device produced.
#[test]
fn s2_rx_stream_cs16_single_channel() {
    let addr = start_server();
    let dev = RemoteDevice::make(
        &addr.ip().to_string(),
        addr.port(),
        "dummy",
        "channels=2/mtu=1024",
    )
    .unwrap();
    assert_eq!(dev.hardware_key(), "dummy-key");

    let stream = dev
        .setup_stream(Direction::Rx, SampleFormat::Cs16, &[0], &Kwargs::new())
        .unwrap();
    assert_eq!(stream.mtu(), 1024);
    stream.activate().unwrap();

    let total = 1024usize;
    let mut buf = vec![0u8; total * 4];
    let mut got = 0usize;
    while got < total {
        let mut buffs = [&mut buf[got * 4..]];
        match stream.read(&mut buffs, total - got, 1_000_000) {
            Ok(n) => got += n,
            Err(StreamError::Timeout) => continue,
            Err(e) => panic!("read failed: {}", e),
        }
    }
    assert_eq!(got, total);
    for e in 0..total as u64 {
        assert_eq!(
            &buf[e as usize * 4..(e as usize + 1) * 4],
            pattern_frame(SampleFormat::Cs16, e, 0).as_slice(),
            "element {} corrupted",
            e
        );
    }

    stream.deactivate().unwrap();
    drop(stream); // closeStream RPC runs here
    assert_eq!(dev.hardware_key(), "dummy-key"); // connection still good
}

/// S3: two channels, CF32 wire format: the client's channel buffers must
/// reconstruct the device's per-channel data byte for byte.
#[test]
fn s3_two_channel_interleave_reconstruction() {
    let addr = start_server();
    let dev = RemoteDevice::make(
        &addr.ip().to_string(),
        addr.port(),
        "dummy",
        "channels=2/mtu=256/native=CF32",
    )
    .unwrap();

    let stream = dev
        .setup_stream(Direction::Rx, SampleFormat::Cf32, &[0, 1], &Kwargs::new())
        .unwrap();
    stream.activate().unwrap();

    let total = 64usize;
    let frame = 8usize;
    let mut ch0 = vec![0u8; total * frame];
    let mut ch1 = vec![0u8; total * frame];
    let mut got = 0usize;
    while got < total {
        let mut buffs = [&mut ch0[got * frame..], &mut ch1[got * frame..]];
        match stream.read(&mut buffs, total - got, 1_000_000) {
            Ok(n) => got += n,
            Err(StreamError::Timeout) => continue,
            Err(e) => panic!("read failed: {}", e),
        }
    }
    for e in 0..total as u64 {
        let off = e as usize * frame;
        assert_eq!(
            &ch0[off..off + frame],
            pattern_frame(SampleFormat::Cf32, e, 0).as_slice()
        );
        assert_eq!(
            &ch1[off..off + frame],
            pattern_frame(SampleFormat::Cf32, e, 1).as_slice()
        );
    }
}

/// Format negotiation: requesting CF32 from a CS16-native device ships
/// CS16 on the wire and converts on read.
#[test]
fn negotiated_cs16_wire_for_cf32_request() {
    let addr = start_server();
    let dev = RemoteDevice::make(
        &addr.ip().to_string(),
        addr.port(),
        "dummy",
        "channels=1/mtu=128",
    )
    .unwrap();
    let (native, full_scale) = dev.native_stream_format(Direction::Rx, 0);
    assert_eq!(native, SampleFormat::Cs16);
    assert_eq!(full_scale, 32767.0);

    let stream = dev
        .setup_stream(Direction::Rx, SampleFormat::Cf32, &[0], &Kwargs::new())
        .unwrap();
    stream.activate().unwrap();

    let total = 32usize;
    let mut buf = vec![0u8; total * 8];
    let mut got = 0usize;
    while got < total {
        let mut buffs = [&mut buf[got * 8..]];
        match stream.read(&mut buffs, total - got, 1_000_000) {
            Ok(n) => got += n,
            Err(StreamError::Timeout) => continue,
            Err(e) => panic!("read failed: {}", e),
        }
    }
    for e in 0..total as u64 {
        let wire = pattern_frame(SampleFormat::Cs16, e, 0);
        let i_wire = i16::from_le_bytes([wire[0], wire[1]]);
        let off = e as usize * 8;
        let i_got = f32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
        assert!((i_got - i_wire as f32 / 32767.0).abs() < 1e-6);
    }
}

/// S4: a client that never reads its data socket must not stall the
/// device, the RPC path, or deactivation.
#[test]
fn s4_backpressure_drops_instead_of_stalling() {
    let addr = start_server();
    let dev = RemoteDevice::make(
        &addr.ip().to_string(),
        addr.port(),
        "dummy",
        "channels=2/mtu=1024",
    )
    .unwrap();
    let stream = dev
        .setup_stream(Direction::Rx, SampleFormat::Cs16, &[0, 1], &Kwargs::new())
        .unwrap();
    stream.activate().unwrap();

    // churn against a full pipe and a full socket buffer
    thread::sleep(Duration::from_millis(400));

    // the RPC path is owned by a different thread and must stay live
    assert_eq!(dev.hardware_key(), "dummy-key");

    let start = Instant::now();
    stream.deactivate().unwrap();
    assert!(
        start.elapsed() < Duration::from_secs(3),
        "deactivation took {:?}",
        start.elapsed()
    );
}

/// S5: a request without the sentinel drops the RPC connection and its
/// data streams; the listener itself keeps accepting.
#[test]
fn s5_desync_drops_connection_cascade() {
    let addr = start_server();
    let mut rpc = TcpStream::connect(addr).unwrap();
    rpc.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut rpc_reader = BufReader::new(rpc.try_clone().unwrap());
    rpc.write_all(b"0\ndummy\n\n").unwrap();
    let _id: i64 = read_reply_line(&mut rpc_reader).parse().unwrap();

    // attach a data stream and set it up so the cascade has work to do
    let mut data = TcpStream::connect(addr).unwrap();
    data.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    data.write_all(b"1\n").unwrap();
    let mut data_reader = BufReader::new(data.try_clone().unwrap());
    let data_id: i64 = read_reply_line(&mut data_reader).parse().unwrap();

    rpc.write_all(format!("#RPC\n14\n{}\n1\nCS16\n0\n=\n", data_id).as_bytes())
        .unwrap();
    assert_eq!(
        read_reply_line(&mut rpc_reader).parse::<i64>().unwrap(),
        data_id
    );

    // now lose framing: a tag with no sentinel line
    rpc.write_all(b"4\n").unwrap();

    // the server drops us: EOF on the RPC socket...
    let mut rest = Vec::new();
    rpc_reader.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty(), "unexpected bytes after desync: {:?}", rest);
    // ...and the owned data socket closes with it
    let mut sink = [0u8; 16];
    assert_eq!(data.read(&mut sink).unwrap(), 0);

    // the listen socket is unaffected
    let mut again = TcpStream::connect(addr).unwrap();
    again.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut again_reader = BufReader::new(again.try_clone().unwrap());
    again.write_all(b"0\ndummy\n\n").unwrap();
    let id: i64 = read_reply_line(&mut again_reader).parse().unwrap();
    assert!(id > 0);
}

/// S6: enumeration falls back to the configuration file for the address.
#[test]
fn s6_configuration_fallback() {
    let dir = std::env::temp_dir().join(format!("netsdr-conf-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(
        dir.join(ns_client::CONFIG_FILE_NAME),
        "# test configuration\naddress=1.2.3.4:5555\n",
    )
    .unwrap();
    std::env::set_var("XDG_CONFIG_DIRS", &dir);

    let mut args = Kwargs::new();
    args.set("tcpremote:driver", "dummy");
    let results = ns_client::enumerate(&args);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].get("address"), Some("1.2.3.4"));
    assert_eq!(results[0].get("port"), Some("5555"));

    std::env::remove_var("XDG_CONFIG_DIRS");
    std::fs::remove_dir_all(&dir).ok();
}

/// LOG connections receive level:message lines at or above their level.
#[test]
fn log_connection_receives_records() {
    let addr = start_server();
    // minimum level 2 = warn
    let log_sock = ns_client::connect_log(&addr.ip().to_string(), addr.port(), 2).unwrap();
    log_sock
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    thread::sleep(Duration::from_millis(100));

    // provoke an error: a driver the server cannot load
    let mut rpc = TcpStream::connect(addr).unwrap();
    rpc.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut rpc_reader = BufReader::new(rpc.try_clone().unwrap());
    rpc.write_all(b"0\nno-such-driver\n\n").unwrap();
    assert_eq!(read_reply_line(&mut rpc_reader), "-1");

    let mut reader = BufReader::new(log_sock);
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        assert!(!line.is_empty(), "log stream closed before the record");
        let (level, message) = line.trim_end().split_once(':').unwrap();
        assert!(matches!(level, "error" | "warn"));
        if message.contains("no-such-driver") {
            break;
        }
    }
}

/// Pass-through accessors survive the round trip with double precision.
#[test]
fn accessor_pass_through_round_trip() {
    let addr = start_server();
    let dev =
        RemoteDevice::make(&addr.ip().to_string(), addr.port(), "dummy", "channels=2").unwrap();

    assert_eq!(dev.num_channels(Direction::Rx), 2);
    assert!(dev.full_duplex(Direction::Rx, 0));
    assert_eq!(dev.hardware_info().get("origin"), Some("dummy"));
    assert_eq!(
        dev.stream_formats(Direction::Rx, 0),
        ["CS8", "CS16", "CF32"]
    );
    assert_eq!(dev.list_antennas(Direction::Rx, 0), ["RX"]);
    assert_eq!(dev.list_gains(Direction::Rx, 0), ["PGA"]);

    dev.set_gain(Direction::Rx, 0, 37.25).unwrap();
    assert_eq!(dev.gain(Direction::Rx, 0), 37.25);

    dev.set_frequency(Direction::Rx, 0, 433_920_000.5, &Kwargs::new())
        .unwrap();
    assert_eq!(dev.frequency(Direction::Rx, 0), 433_920_000.5);

    dev.set_sample_rate(Direction::Rx, 0, 250_000.0).unwrap();
    assert_eq!(dev.sample_rate(Direction::Rx, 0), 250_000.0);

    let gain_range = dev.gain_range(Direction::Rx, 0);
    assert_eq!((gain_range.min, gain_range.max, gain_range.step), (0.0, 61.0, 1.0));

    let freq_ranges = dev.frequency_range(Direction::Rx, 0);
    assert_eq!(freq_ranges.len(), 1);
    assert_eq!(freq_ranges[0].min, 24e6);

    let rates = dev.list_sample_rates(Direction::Rx, 0);
    assert_eq!(rates.len(), 8); // 250k..2M in 250k steps

    dev.set_gain_mode(Direction::Rx, 0, true).unwrap();
    assert!(dev.gain_mode(Direction::Rx, 0));

    dev.set_antenna(Direction::Rx, 0, "RX").unwrap();
    assert_eq!(dev.antenna(Direction::Rx, 0), "RX");

    // skeletal args-info: a bare terminator the client consumes silently
    // (exercised through the raw wire to check the exact shape)
    let mut raw = TcpStream::connect(addr).unwrap();
    raw.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut raw_reader = BufReader::new(raw.try_clone().unwrap());
    raw.write_all(b"0\ndummy\n\n").unwrap();
    read_reply_line(&mut raw_reader);
    raw.write_all(b"#RPC\n13\n1\n0\n").unwrap();
    assert_eq!(read_reply_line(&mut raw_reader), "");
}

/// TX stream lifecycle over the full stack: setup, activate, write,
/// deactivate. (The server's dummy device swallows the samples; the
/// pump unit tests verify delivery.)
#[test]
fn tx_stream_lifecycle() {
    let addr = start_server();
    let dev =
        RemoteDevice::make(&addr.ip().to_string(), addr.port(), "dummy", "channels=1").unwrap();
    let stream = dev
        .setup_stream(Direction::Tx, SampleFormat::Cs8, &[0], &Kwargs::new())
        .unwrap();

    // writing before activation times out per the stream contract
    let frames = [0u8; 32];
    assert_eq!(
        stream.write(&[&frames[..]], 16, 100_000),
        Err(StreamError::Timeout)
    );

    stream.activate().unwrap();
    assert_eq!(stream.write(&[&frames[..]], 16, 100_000).unwrap(), 16);
    stream.deactivate().unwrap();
}
