// Copyright 2025-2026 CEMAXECUTER LLC

//! RPC request dispatch.
//!
//! Every request is a sentinel line, a tag integer, then tag-specific
//! arguments. Handlers read *all* arguments into locals before touching
//! the device: argument evaluation order is a protocol property, and a
//! device call between two reads would desynchronise the stream on error.
//! Every request produces at least one reply line so the client can
//! synchronise.

use std::os::unix::io::RawFd;
use std::sync::atomic::Ordering;
use std::thread;

use ns_device::DeviceResult;
use ns_rpc::{Direction, RpcError, RpcTag, SampleFormat, TcpCodec, UNKNOWN_TAG_ERROR};

use crate::pump::{run_data_pump, PumpContext};
use crate::registry::{Registry, RpcConn, StreamConfig};

/// What the server loop should do with the connection after a request.
#[derive(Debug, PartialEq, Eq)]
pub enum Control {
    Keep,
    Drop,
}

fn read_direction(codec: &mut TcpCodec) -> Result<Direction, RpcError> {
    let v = codec.read_int()?;
    Direction::from_wire(v).ok_or(RpcError::Parse {
        kind: "direction",
        text: v.to_string(),
    })
}

fn read_channel(codec: &mut TcpCodec) -> Result<usize, RpcError> {
    Ok(codec.read_int()?.max(0) as usize)
}

/// Acknowledge a setter: 0 on success, the device's error code otherwise.
fn ack(codec: &mut TcpCodec, result: DeviceResult<()>) -> Result<(), RpcError> {
    match result {
        Ok(()) => codec.write_int(0),
        Err(e) => {
            log::error!("device operation failed: {}", e);
            codec.write_int(e.code() as i64)
        }
    }
}

/// Handle one request on a ready RPC connection. `Err` means the codec
/// lost synchronisation or the socket died; the caller drops the
/// connection either way.
pub fn dispatch_request(
    rpc: &mut RpcConn,
    registry: &mut Registry,
    rpc_fd: RawFd,
) -> Result<Control, RpcError> {
    rpc.codec.expect_sentinel()?;
    let raw_tag = rpc.codec.read_int()?;
    if raw_tag < 0 {
        return Err(RpcError::Parse {
            kind: "request tag",
            text: raw_tag.to_string(),
        });
    }
    let Some(tag) = RpcTag::from_wire(raw_tag) else {
        log::error!("unknown RPC tag: {}", raw_tag);
        rpc.codec.write_int(UNKNOWN_TAG_ERROR)?;
        return Ok(Control::Keep);
    };
    log::trace!("rpc {}: tag {:?}", rpc_fd, tag);

    match tag {
        // identification
        RpcTag::GetHardwareKey => {
            let key = rpc.device.hardware_key();
            rpc.codec.write_string(&key)?;
        }
        RpcTag::GetHardwareInfo => {
            let info = rpc.device.hardware_info();
            rpc.codec.write_kwargs(&info)?;
        }

        // channels
        RpcTag::SetFrontendMapping => {
            let direction = read_direction(&mut rpc.codec)?;
            let mapping = rpc.codec.read_string()?;
            let result = rpc.device.set_frontend_mapping(direction, &mapping);
            ack(&mut rpc.codec, result)?;
        }
        RpcTag::GetFrontendMapping => {
            let direction = read_direction(&mut rpc.codec)?;
            let mapping = rpc.device.frontend_mapping(direction);
            rpc.codec.write_string(&mapping)?;
        }
        RpcTag::GetNumChannels => {
            let direction = read_direction(&mut rpc.codec)?;
            let n = rpc.device.num_channels(direction);
            rpc.codec.write_int(n as i64)?;
        }
        RpcTag::GetChannelInfo => {
            let direction = read_direction(&mut rpc.codec)?;
            let channel = read_channel(&mut rpc.codec)?;
            let info = rpc.device.channel_info(direction, channel);
            rpc.codec.write_kwargs(&info)?;
        }
        RpcTag::GetFullDuplex => {
            let direction = read_direction(&mut rpc.codec)?;
            let channel = read_channel(&mut rpc.codec)?;
            let duplex = rpc.device.full_duplex(direction, channel);
            rpc.codec.write_int(duplex as i64)?;
        }

        // stream metadata
        RpcTag::GetStreamFormats => {
            let direction = read_direction(&mut rpc.codec)?;
            let channel = read_channel(&mut rpc.codec)?;
            let formats = rpc.device.stream_formats(direction, channel);
            rpc.codec.write_str_vector(&formats)?;
        }
        RpcTag::GetNativeStreamFormat => {
            let direction = read_direction(&mut rpc.codec)?;
            let channel = read_channel(&mut rpc.codec)?;
            let (format, full_scale) = rpc.device.native_stream_format(direction, channel);
            rpc.codec.write_string(format.name())?;
            rpc.codec.write_double(full_scale)?;
        }
        RpcTag::GetStreamArgsInfo => {
            // skeletal: consume the arguments, reply only a terminator
            let _direction = read_direction(&mut rpc.codec)?;
            let _channel = read_channel(&mut rpc.codec)?;
            rpc.codec.write_string("")?;
        }

        // stream lifecycle
        RpcTag::SetupStream => handle_setup_stream(rpc, registry, rpc_fd)?,
        RpcTag::CloseStream => handle_close_stream(rpc, registry)?,
        RpcTag::GetStreamMtu => {
            let data_id = rpc.codec.read_int()? as RawFd;
            let mtu = registry
                .data_mut(data_id)
                .and_then(|d| d.config.as_ref().map(|c| c.stream.mtu()));
            match mtu {
                Some(mtu) => rpc.codec.write_int(mtu as i64)?,
                None => {
                    log::error!("getStreamMTU: no such data stream: {}", data_id);
                    rpc.codec.write_int(-1)?;
                }
            }
        }
        RpcTag::ActivateStream => handle_activate_stream(rpc, registry, rpc_fd)?,
        RpcTag::DeactivateStream => handle_deactivate_stream(rpc, registry)?,

        // antenna
        RpcTag::ListAntennas => {
            let direction = read_direction(&mut rpc.codec)?;
            let channel = read_channel(&mut rpc.codec)?;
            let antennas = rpc.device.list_antennas(direction, channel);
            rpc.codec.write_str_vector(&antennas)?;
        }
        RpcTag::SetAntenna => {
            let direction = read_direction(&mut rpc.codec)?;
            let channel = read_channel(&mut rpc.codec)?;
            let name = rpc.codec.read_string()?;
            let result = rpc.device.set_antenna(direction, channel, &name);
            ack(&mut rpc.codec, result)?;
        }
        RpcTag::GetAntenna => {
            let direction = read_direction(&mut rpc.codec)?;
            let channel = read_channel(&mut rpc.codec)?;
            let name = rpc.device.antenna(direction, channel);
            rpc.codec.write_string(&name)?;
        }

        // gain
        RpcTag::ListGains => {
            let direction = read_direction(&mut rpc.codec)?;
            let channel = read_channel(&mut rpc.codec)?;
            let gains = rpc.device.list_gains(direction, channel);
            rpc.codec.write_str_vector(&gains)?;
        }
        RpcTag::HasGainMode => {
            let direction = read_direction(&mut rpc.codec)?;
            let channel = read_channel(&mut rpc.codec)?;
            let has = rpc.device.has_gain_mode(direction, channel);
            rpc.codec.write_int(has as i64)?;
        }
        RpcTag::SetGainMode => {
            let direction = read_direction(&mut rpc.codec)?;
            let channel = read_channel(&mut rpc.codec)?;
            let automatic = rpc.codec.read_int()? > 0;
            let result = rpc.device.set_gain_mode(direction, channel, automatic);
            ack(&mut rpc.codec, result)?;
        }
        RpcTag::GetGainMode => {
            let direction = read_direction(&mut rpc.codec)?;
            let channel = read_channel(&mut rpc.codec)?;
            let automatic = rpc.device.gain_mode(direction, channel);
            rpc.codec.write_int(automatic as i64)?;
        }
        RpcTag::SetGain => {
            let direction = read_direction(&mut rpc.codec)?;
            let channel = read_channel(&mut rpc.codec)?;
            let value = rpc.codec.read_double()?;
            let result = rpc.device.set_gain(direction, channel, value);
            ack(&mut rpc.codec, result)?;
        }
        RpcTag::SetGainNamed => {
            let direction = read_direction(&mut rpc.codec)?;
            let channel = read_channel(&mut rpc.codec)?;
            let name = rpc.codec.read_string()?;
            let value = rpc.codec.read_double()?;
            let result = rpc.device.set_gain_named(direction, channel, &name, value);
            ack(&mut rpc.codec, result)?;
        }
        RpcTag::GetGain => {
            let direction = read_direction(&mut rpc.codec)?;
            let channel = read_channel(&mut rpc.codec)?;
            let value = rpc.device.gain(direction, channel);
            rpc.codec.write_double(value)?;
        }
        RpcTag::GetGainNamed => {
            let direction = read_direction(&mut rpc.codec)?;
            let channel = read_channel(&mut rpc.codec)?;
            let name = rpc.codec.read_string()?;
            let value = rpc.device.gain_named(direction, channel, &name);
            rpc.codec.write_double(value)?;
        }
        RpcTag::GetGainRange => {
            let direction = read_direction(&mut rpc.codec)?;
            let channel = read_channel(&mut rpc.codec)?;
            let range = rpc.device.gain_range(direction, channel);
            rpc.codec.write_double(range.min)?;
            rpc.codec.write_double(range.max)?;
            rpc.codec.write_double(range.step)?;
        }
        RpcTag::GetGainRangeNamed => {
            let direction = read_direction(&mut rpc.codec)?;
            let channel = read_channel(&mut rpc.codec)?;
            let name = rpc.codec.read_string()?;
            let range = rpc.device.gain_range_named(direction, channel, &name);
            rpc.codec.write_double(range.min)?;
            rpc.codec.write_double(range.max)?;
            rpc.codec.write_double(range.step)?;
        }

        // frequency
        RpcTag::SetFrequency => {
            let direction = read_direction(&mut rpc.codec)?;
            let channel = read_channel(&mut rpc.codec)?;
            let frequency = rpc.codec.read_double()?;
            let args = rpc.codec.read_kwargs()?;
            let result = rpc.device.set_frequency(direction, channel, frequency, &args);
            ack(&mut rpc.codec, result)?;
        }
        RpcTag::SetFrequencyNamed => {
            let direction = read_direction(&mut rpc.codec)?;
            let channel = read_channel(&mut rpc.codec)?;
            let name = rpc.codec.read_string()?;
            let frequency = rpc.codec.read_double()?;
            let args = rpc.codec.read_kwargs()?;
            let result = rpc
                .device
                .set_frequency_component(direction, channel, &name, frequency, &args);
            ack(&mut rpc.codec, result)?;
        }
        RpcTag::GetFrequency => {
            let direction = read_direction(&mut rpc.codec)?;
            let channel = read_channel(&mut rpc.codec)?;
            let frequency = rpc.device.frequency(direction, channel);
            rpc.codec.write_double(frequency)?;
        }
        RpcTag::GetFrequencyNamed => {
            let direction = read_direction(&mut rpc.codec)?;
            let channel = read_channel(&mut rpc.codec)?;
            let name = rpc.codec.read_string()?;
            let frequency = rpc.device.frequency_component(direction, channel, &name);
            rpc.codec.write_double(frequency)?;
        }
        RpcTag::ListFrequencies => {
            let direction = read_direction(&mut rpc.codec)?;
            let channel = read_channel(&mut rpc.codec)?;
            let names = rpc.device.list_frequencies(direction, channel);
            rpc.codec.write_str_vector(&names)?;
        }
        RpcTag::GetFrequencyRange => {
            let direction = read_direction(&mut rpc.codec)?;
            let channel = read_channel(&mut rpc.codec)?;
            let ranges = rpc.device.frequency_range(direction, channel);
            rpc.codec.write_range_list(&ranges)?;
        }
        RpcTag::GetFrequencyRangeNamed => {
            let direction = read_direction(&mut rpc.codec)?;
            let channel = read_channel(&mut rpc.codec)?;
            let name = rpc.codec.read_string()?;
            let ranges = rpc.device.frequency_range_component(direction, channel, &name);
            rpc.codec.write_range_list(&ranges)?;
        }
        RpcTag::GetFrequencyArgsInfo => {
            // skeletal, like GetStreamArgsInfo
            let _direction = read_direction(&mut rpc.codec)?;
            let _channel = read_channel(&mut rpc.codec)?;
            rpc.codec.write_string("")?;
        }

        // sample rate
        RpcTag::SetSampleRate => {
            let direction = read_direction(&mut rpc.codec)?;
            let channel = read_channel(&mut rpc.codec)?;
            let rate = rpc.codec.read_double()?;
            let result = rpc.device.set_sample_rate(direction, channel, rate);
            ack(&mut rpc.codec, result)?;
        }
        RpcTag::GetSampleRate => {
            let direction = read_direction(&mut rpc.codec)?;
            let channel = read_channel(&mut rpc.codec)?;
            let rate = rpc.device.sample_rate(direction, channel);
            rpc.codec.write_double(rate)?;
        }
        RpcTag::GetSampleRateRange => {
            let direction = read_direction(&mut rpc.codec)?;
            let channel = read_channel(&mut rpc.codec)?;
            let ranges = rpc.device.sample_rate_range(direction, channel);
            rpc.codec.write_range_list(&ranges)?;
        }

        RpcTag::DropRpc => {
            // ack first so the client can synchronise before it sees EOF
            rpc.codec.write_int(0)?;
            return Ok(Control::Drop);
        }
    }
    Ok(Control::Keep)
}

fn handle_setup_stream(
    rpc: &mut RpcConn,
    registry: &mut Registry,
    rpc_fd: RawFd,
) -> Result<(), RpcError> {
    let data_id = rpc.codec.read_int()? as RawFd;
    let direction = read_direction(&mut rpc.codec)?;
    let format_name = rpc.codec.read_string()?;
    let channel_list = rpc.codec.read_string()?;
    let args = rpc.codec.read_kwargs()?;

    if registry.data_mut(data_id).is_none() {
        log::error!("setupStream: no such data stream: {}", data_id);
        return rpc.codec.write_int(-1);
    }
    let Some(format) = SampleFormat::from_name(&format_name) else {
        log::error!("setupStream: unknown sample format: {}", format_name);
        return rpc.codec.write_int(-2);
    };
    // space-separated channel numbers; an empty list means channel 0
    let channels: Vec<usize> = channel_list
        .split_whitespace()
        .filter_map(|t| t.parse().ok())
        .collect();
    let channels = if channels.is_empty() { vec![0] } else { channels };

    match rpc.device.setup_stream(direction, format, &channels, &args) {
        Ok(stream) => {
            let data = registry.data_mut(data_id).expect("checked above");
            data.direction = direction;
            data.config = Some(StreamConfig {
                format,
                channels,
                stream,
            });
            data.owner = Some(rpc_fd);
            if !rpc.data_ids.contains(&data_id) {
                rpc.data_ids.push(data_id);
            }
            rpc.codec.write_int(data_id as i64)
        }
        Err(e) => {
            log::error!("setupStream: device setup failed: {}", e);
            rpc.codec.write_int(-3)
        }
    }
}

fn handle_activate_stream(
    rpc: &mut RpcConn,
    registry: &mut Registry,
    _rpc_fd: RawFd,
) -> Result<(), RpcError> {
    let data_id = rpc.codec.read_int()? as RawFd;

    let Some(data) = registry.data_mut(data_id) else {
        log::error!("activateStream: no such data stream: {}", data_id);
        return rpc.codec.write_int(-1);
    };
    let Some(config) = data.config.as_ref() else {
        log::error!("activateStream: stream {} not set up", data_id);
        return rpc.codec.write_int(-1);
    };
    if data.worker.is_some() {
        // already pumping
        return rpc.codec.write_int(0);
    }

    let socket = match data.socket.try_clone() {
        Ok(s) => s,
        Err(e) => {
            log::error!("activateStream: failed to clone data socket: {}", e);
            return rpc.codec.write_int(-2);
        }
    };
    let use_direct = config.channels.len() == 1
        && config.stream.has_direct_buffers()
        && rpc
            .device
            .native_stream_format(data.direction, config.channels[0])
            .0
            == config.format;
    let ctx = PumpContext {
        id: data_id,
        socket,
        stream: std::sync::Arc::clone(&config.stream),
        running: std::sync::Arc::clone(&data.running),
        direction: data.direction,
        format: config.format,
        num_channels: config.channels.len(),
        use_direct,
    };
    // the flag goes true before the worker exists so the worker can never
    // observe an unset state
    data.running.store(true, Ordering::Release);
    match thread::Builder::new()
        .name(format!("data-pump-{}", data_id))
        .spawn(move || run_data_pump(ctx))
    {
        Ok(handle) => {
            data.worker = Some(handle);
            rpc.codec.write_int(0)
        }
        Err(e) => {
            data.running.store(false, Ordering::Release);
            log::error!("activateStream: failed to spawn data pump: {}", e);
            rpc.codec.write_int(-2)
        }
    }
}

fn handle_deactivate_stream(rpc: &mut RpcConn, registry: &mut Registry) -> Result<(), RpcError> {
    let data_id = rpc.codec.read_int()? as RawFd;

    let Some(data) = registry.data_mut(data_id) else {
        log::error!("deactivateStream: no such data stream: {}", data_id);
        return rpc.codec.write_int(-1);
    };
    if let Some(worker) = data.worker.take() {
        data.running.store(false, Ordering::Release);
        if worker.join().is_err() {
            log::error!("deactivateStream: data pump for {} panicked", data_id);
            return rpc.codec.write_int(-2);
        }
    }
    rpc.codec.write_int(0)
}

fn handle_close_stream(rpc: &mut RpcConn, registry: &mut Registry) -> Result<(), RpcError> {
    let data_id = rpc.codec.read_int()? as RawFd;
    close_data_stream(registry, data_id);
    rpc.data_ids.retain(|&id| id != data_id);
    rpc.codec.write_int(0)
}

/// Deactivate (if needed) and remove a data connection. Dropping the
/// stream Arc releases the device stream; dropping the socket closes the
/// client's data connection.
pub fn close_data_stream(registry: &mut Registry, data_id: RawFd) {
    let Some(data) = registry.data_mut(data_id) else {
        log::error!("closeStream: no such data stream: {}", data_id);
        return;
    };
    if let Some(worker) = data.worker.take() {
        data.running.store(false, Ordering::Release);
        let _ = worker.join();
    }
    registry.remove(data_id);
    log::debug!("data stream {} closed", data_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Connection, DataConn};
    use ns_rpc::Kwargs;
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};

    fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let a = TcpStream::connect(addr).unwrap();
        let (b, _) = listener.accept().unwrap();
        (a, b)
    }

    fn rpc_fixture() -> (RpcConn, TcpCodec) {
        let (client, server) = socket_pair();
        let rpc = RpcConn {
            codec: TcpCodec::from_stream(server).unwrap(),
            device: ns_device::make_device("dummy", &Kwargs::new()).unwrap(),
            data_ids: Vec::new(),
        };
        (rpc, TcpCodec::from_stream(client).unwrap())
    }

    #[test]
    fn test_unknown_tag_keeps_connection() {
        let (mut rpc, mut client) = rpc_fixture();
        let mut registry = Registry::new();

        client.write_sentinel().unwrap();
        client.write_int(999).unwrap();
        let control = dispatch_request(&mut rpc, &mut registry, 1).unwrap();
        assert_eq!(control, Control::Keep);
        assert_eq!(client.read_int().unwrap(), UNKNOWN_TAG_ERROR);
    }

    #[test]
    fn test_missing_sentinel_is_desync() {
        let (mut rpc, mut client) = rpc_fixture();
        let mut registry = Registry::new();

        client.write_int(RpcTag::GetHardwareKey as i64).unwrap();
        let err = dispatch_request(&mut rpc, &mut registry, 1).unwrap_err();
        assert!(matches!(err, RpcError::Desync { .. }));
    }

    #[test]
    fn test_hardware_key_pass_through() {
        let (mut rpc, mut client) = rpc_fixture();
        let mut registry = Registry::new();

        client.write_sentinel().unwrap();
        client.write_int(RpcTag::GetHardwareKey as i64).unwrap();
        dispatch_request(&mut rpc, &mut registry, 1).unwrap();
        assert_eq!(client.read_string().unwrap(), "dummy-key");
    }

    #[test]
    fn test_setup_stream_validation_codes() {
        let (mut rpc, mut client) = rpc_fixture();
        let mut registry = Registry::new();

        // unknown data id
        client.write_sentinel().unwrap();
        client.write_int(RpcTag::SetupStream as i64).unwrap();
        client.write_int(99).unwrap();
        client.write_int(Direction::Rx.to_wire()).unwrap();
        client.write_string("CS16").unwrap();
        client.write_string("0").unwrap();
        client.write_kwargs(&Kwargs::new()).unwrap();
        dispatch_request(&mut rpc, &mut registry, 1).unwrap();
        assert_eq!(client.read_int().unwrap(), -1);

        // known data id, unknown format
        let (_hold, data_sock) = socket_pair();
        registry.insert(7, Connection::Data(DataConn::new(data_sock, Direction::Rx)));
        client.write_sentinel().unwrap();
        client.write_int(RpcTag::SetupStream as i64).unwrap();
        client.write_int(7).unwrap();
        client.write_int(Direction::Rx.to_wire()).unwrap();
        client.write_string("CU8").unwrap();
        client.write_string("0").unwrap();
        client.write_kwargs(&Kwargs::new()).unwrap();
        dispatch_request(&mut rpc, &mut registry, 1).unwrap();
        assert_eq!(client.read_int().unwrap(), -2);

        // valid setup replies with the data id and records the stream
        client.write_sentinel().unwrap();
        client.write_int(RpcTag::SetupStream as i64).unwrap();
        client.write_int(7).unwrap();
        client.write_int(Direction::Rx.to_wire()).unwrap();
        client.write_string("CS16").unwrap();
        client.write_string("0 1").unwrap();
        client.write_kwargs(&Kwargs::new()).unwrap();
        dispatch_request(&mut rpc, &mut registry, 1).unwrap();
        assert_eq!(client.read_int().unwrap(), 7);
        assert!(registry.data_mut(7).unwrap().config.is_some());
        assert_eq!(rpc.data_ids, vec![7]);
    }

    #[test]
    fn test_setter_acknowledges_zero() {
        let (mut rpc, mut client) = rpc_fixture();
        let mut registry = Registry::new();

        client.write_sentinel().unwrap();
        client.write_int(RpcTag::SetSampleRate as i64).unwrap();
        client.write_int(Direction::Rx.to_wire()).unwrap();
        client.write_int(0).unwrap();
        client.write_double(2_000_000.0).unwrap();
        dispatch_request(&mut rpc, &mut registry, 1).unwrap();
        assert_eq!(client.read_int().unwrap(), 0);

        // and the value stuck
        client.write_sentinel().unwrap();
        client.write_int(RpcTag::GetSampleRate as i64).unwrap();
        client.write_int(Direction::Rx.to_wire()).unwrap();
        client.write_int(0).unwrap();
        dispatch_request(&mut rpc, &mut registry, 1).unwrap();
        assert_eq!(client.read_double().unwrap(), 2_000_000.0);
    }

    #[test]
    fn test_drop_rpc_acks_then_drops() {
        let (mut rpc, mut client) = rpc_fixture();
        let mut registry = Registry::new();

        client.write_sentinel().unwrap();
        client.write_int(RpcTag::DropRpc as i64).unwrap();
        let control = dispatch_request(&mut rpc, &mut registry, 1).unwrap();
        assert_eq!(control, Control::Drop);
        assert_eq!(client.read_int().unwrap(), 0);
    }

    #[test]
    fn test_raw_byte_request_shape() {
        // the wire really is lines: sentinel, tag, args
        let (mut rpc, client) = rpc_fixture();
        let mut registry = Registry::new();

        let mut raw = client.peer_stream().try_clone().unwrap();
        raw.write_all(b"#RPC\n8\n1\n").unwrap(); // GetNumChannels, RX
        dispatch_request(&mut rpc, &mut registry, 1).unwrap();
        let mut client = client;
        assert_eq!(client.read_int().unwrap(), 2); // dummy default
    }
}
