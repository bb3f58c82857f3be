// Copyright 2025-2026 CEMAXECUTER LLC

//! The remote device driver: every device API call serialises through the
//! RPC codec; sample data moves on per-stream data sockets.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ns_device::{
    DeviceError, DeviceResult, SdrDevice, SdrStream, StreamError, ERR_CORRUPTION, ERR_STREAM,
};
use ns_rpc::{
    codec::read_line_unbuffered, ConnectionType, Direction, Kwargs, Range, RpcError, RpcTag,
    SampleFormat, TcpCodec,
};

pub struct RemoteDevice {
    rpc: Arc<Mutex<TcpCodec>>,
    address: String,
    port: u16,
    /// Server-side identifier of this RPC connection.
    connection_id: i64,
}

impl RemoteDevice {
    /// Connect, type the socket as RPC, and load the remote driver.
    pub fn make(address: &str, port: u16, driver: &str, args: &str) -> DeviceResult<Self> {
        let stream = TcpStream::connect((address, port)).map_err(|e| {
            DeviceError::Driver(format!("failed to connect to {}:{}: {}", address, port, e))
        })?;
        let mut codec = TcpCodec::from_stream(stream)
            .map_err(|e| DeviceError::Driver(format!("failed to set up codec: {}", e)))?;

        let mut load = || -> Result<i64, RpcError> {
            codec.write_int(ConnectionType::RpcLoad as i64)?;
            codec.write_string(driver)?;
            codec.write_string(args)?;
            codec.read_int()
        };
        let connection_id = load()
            .map_err(|e| DeviceError::Driver(format!("failed to load remote driver: {}", e)))?;
        if connection_id < 0 {
            return Err(DeviceError::Driver(format!(
                "remote driver {} failed to load ({})",
                driver, connection_id
            )));
        }
        log::debug!(
            "connected to {}:{} as rpc {} (driver {})",
            address,
            port,
            connection_id,
            driver
        );
        Ok(RemoteDevice {
            rpc: Arc::new(Mutex::new(codec)),
            address: address.to_string(),
            port,
            connection_id,
        })
    }

    pub fn connection_id(&self) -> i64 {
        self.connection_id
    }

    /// Run an RPC exchange; protocol errors come back as `DeviceError`.
    fn request<T>(
        &self,
        f: impl FnOnce(&mut TcpCodec) -> Result<T, RpcError>,
    ) -> DeviceResult<T> {
        let mut rpc = self.rpc.lock().unwrap();
        f(&mut rpc).map_err(|e| DeviceError::Driver(e.to_string()))
    }

    /// Run an RPC exchange for a plain-value accessor: protocol failures
    /// are logged and the default is returned, like a local driver that
    /// cannot answer.
    fn simple<T>(&self, f: impl FnOnce(&mut TcpCodec) -> Result<T, RpcError>, default: T) -> T {
        match self.request(f) {
            Ok(v) => v,
            Err(e) => {
                log::error!("rpc call failed: {}", e);
                default
            }
        }
    }

    /// Run an RPC exchange ending in an acknowledgement integer.
    fn checked(&self, f: impl FnOnce(&mut TcpCodec) -> Result<i64, RpcError>) -> DeviceResult<()> {
        let status = self.request(f)?;
        if status == 0 {
            Ok(())
        } else {
            Err(DeviceError::Code(status as i32))
        }
    }
}

impl Drop for RemoteDevice {
    fn drop(&mut self) {
        // a graceful goodbye lets the server tear down in its own time;
        // EOF would achieve the same, noisily
        let _ = self.request(|c| {
            c.write_sentinel()?;
            c.write_int(RpcTag::DropRpc as i64)?;
            c.read_int()
        });
    }
}

impl SdrDevice for RemoteDevice {
    fn driver_key(&self) -> String {
        crate::DRIVER_KEY.to_string()
    }

    fn hardware_key(&self) -> String {
        self.simple(
            |c| {
                c.write_sentinel()?;
                c.write_int(RpcTag::GetHardwareKey as i64)?;
                c.read_string()
            },
            String::new(),
        )
    }

    fn hardware_info(&self) -> Kwargs {
        self.simple(
            |c| {
                c.write_sentinel()?;
                c.write_int(RpcTag::GetHardwareInfo as i64)?;
                c.read_kwargs()
            },
            Kwargs::new(),
        )
    }

    fn set_frontend_mapping(&self, direction: Direction, mapping: &str) -> DeviceResult<()> {
        self.checked(|c| {
            c.write_sentinel()?;
            c.write_int(RpcTag::SetFrontendMapping as i64)?;
            c.write_int(direction.to_wire())?;
            c.write_string(mapping)?;
            c.read_int()
        })
    }

    fn frontend_mapping(&self, direction: Direction) -> String {
        self.simple(
            |c| {
                c.write_sentinel()?;
                c.write_int(RpcTag::GetFrontendMapping as i64)?;
                c.write_int(direction.to_wire())?;
                c.read_string()
            },
            String::new(),
        )
    }

    fn num_channels(&self, direction: Direction) -> usize {
        self.simple(
            |c| {
                c.write_sentinel()?;
                c.write_int(RpcTag::GetNumChannels as i64)?;
                c.write_int(direction.to_wire())?;
                c.read_int()
            },
            0,
        )
        .max(0) as usize
    }

    fn channel_info(&self, direction: Direction, channel: usize) -> Kwargs {
        self.simple(
            |c| {
                c.write_sentinel()?;
                c.write_int(RpcTag::GetChannelInfo as i64)?;
                c.write_int(direction.to_wire())?;
                c.write_int(channel as i64)?;
                c.read_kwargs()
            },
            Kwargs::new(),
        )
    }

    fn full_duplex(&self, direction: Direction, channel: usize) -> bool {
        self.simple(
            |c| {
                c.write_sentinel()?;
                c.write_int(RpcTag::GetFullDuplex as i64)?;
                c.write_int(direction.to_wire())?;
                c.write_int(channel as i64)?;
                c.read_int()
            },
            0,
        ) != 0
    }

    fn stream_formats(&self, direction: Direction, channel: usize) -> Vec<String> {
        self.simple(
            |c| {
                c.write_sentinel()?;
                c.write_int(RpcTag::GetStreamFormats as i64)?;
                c.write_int(direction.to_wire())?;
                c.write_int(channel as i64)?;
                c.read_str_vector()
            },
            Vec::new(),
        )
    }

    fn native_stream_format(&self, direction: Direction, channel: usize) -> (SampleFormat, f64) {
        let result = self.request(|c| {
            c.write_sentinel()?;
            c.write_int(RpcTag::GetNativeStreamFormat as i64)?;
            c.write_int(direction.to_wire())?;
            c.write_int(channel as i64)?;
            let name = c.read_string()?;
            let full_scale = c.read_double()?;
            Ok((name, full_scale))
        });
        match result {
            Ok((name, full_scale)) => match SampleFormat::from_name(&name) {
                Some(fmt) => (fmt, full_scale),
                None => {
                    log::warn!("remote native format {:?} unknown, assuming CS16", name);
                    (SampleFormat::Cs16, 32767.0)
                }
            },
            Err(e) => {
                log::error!("rpc call failed: {}", e);
                (SampleFormat::Cs16, 32767.0)
            }
        }
    }

    fn setup_stream(
        &self,
        direction: Direction,
        format: SampleFormat,
        channels: &[usize],
        args: &Kwargs,
    ) -> DeviceResult<Arc<dyn SdrStream>> {
        let channels = if channels.is_empty() { &[0][..] } else { channels };

        // negotiate the wire format: when the device's native frame is
        // smaller than the requested one, ship native and convert here
        let mut wire = format;
        if direction == Direction::Rx {
            let (native, _full_scale) = self.native_stream_format(direction, channels[0]);
            if native.frame_size() < format.frame_size() {
                log::debug!(
                    "negotiating wire format {} for requested {}",
                    native.name(),
                    format.name()
                );
                wire = native;
            }
        }

        // the data connection goes first so the server can correlate the
        // setup call with it by id
        let mut data = TcpStream::connect((self.address.as_str(), self.port)).map_err(|e| {
            DeviceError::Driver(format!("data stream failed to connect: {}", e))
        })?;
        let ty = match direction {
            Direction::Rx => ConnectionType::DataSend,
            Direction::Tx => ConnectionType::DataRecv,
        };
        data.write_all(ty.type_line().as_bytes())
            .map_err(|e| DeviceError::Driver(format!("failed to type data stream: {}", e)))?;
        let remote_id: i64 = read_line_unbuffered(&mut data, 16)
            .ok()
            .and_then(|l| l.parse().ok())
            .ok_or_else(|| DeviceError::Driver("failed to read data stream id".to_string()))?;

        let channel_list = channels
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(" ");
        let status = self.request(|c| {
            c.write_sentinel()?;
            c.write_int(RpcTag::SetupStream as i64)?;
            c.write_int(remote_id)?;
            c.write_int(direction.to_wire())?;
            c.write_string(wire.name())?;
            c.write_string(&channel_list)?;
            c.write_kwargs(args)?;
            c.read_int()
        })?;
        if status < 0 {
            return Err(DeviceError::Code(status as i32));
        }

        log::debug!(
            "stream {} set up ({:?}, wire {}, {} channels)",
            remote_id,
            direction,
            wire.name(),
            channels.len()
        );
        Ok(Arc::new(RemoteStream {
            rpc: Arc::clone(&self.rpc),
            data: Mutex::new(DataHalf {
                socket: data,
                buf: Vec::new(),
            }),
            remote_id,
            direction,
            requested: format,
            wire,
            num_channels: channels.len(),
            running: AtomicBool::new(false),
        }))
    }

    fn list_antennas(&self, direction: Direction, channel: usize) -> Vec<String> {
        self.simple(
            |c| {
                c.write_sentinel()?;
                c.write_int(RpcTag::ListAntennas as i64)?;
                c.write_int(direction.to_wire())?;
                c.write_int(channel as i64)?;
                c.read_str_vector()
            },
            Vec::new(),
        )
    }

    fn set_antenna(&self, direction: Direction, channel: usize, name: &str) -> DeviceResult<()> {
        self.checked(|c| {
            c.write_sentinel()?;
            c.write_int(RpcTag::SetAntenna as i64)?;
            c.write_int(direction.to_wire())?;
            c.write_int(channel as i64)?;
            c.write_string(name)?;
            c.read_int()
        })
    }

    fn antenna(&self, direction: Direction, channel: usize) -> String {
        self.simple(
            |c| {
                c.write_sentinel()?;
                c.write_int(RpcTag::GetAntenna as i64)?;
                c.write_int(direction.to_wire())?;
                c.write_int(channel as i64)?;
                c.read_string()
            },
            String::new(),
        )
    }

    fn list_gains(&self, direction: Direction, channel: usize) -> Vec<String> {
        self.simple(
            |c| {
                c.write_sentinel()?;
                c.write_int(RpcTag::ListGains as i64)?;
                c.write_int(direction.to_wire())?;
                c.write_int(channel as i64)?;
                c.read_str_vector()
            },
            Vec::new(),
        )
    }

    fn has_gain_mode(&self, direction: Direction, channel: usize) -> bool {
        self.simple(
            |c| {
                c.write_sentinel()?;
                c.write_int(RpcTag::HasGainMode as i64)?;
                c.write_int(direction.to_wire())?;
                c.write_int(channel as i64)?;
                c.read_int()
            },
            0,
        ) != 0
    }

    fn set_gain_mode(
        &self,
        direction: Direction,
        channel: usize,
        automatic: bool,
    ) -> DeviceResult<()> {
        self.checked(|c| {
            c.write_sentinel()?;
            c.write_int(RpcTag::SetGainMode as i64)?;
            c.write_int(direction.to_wire())?;
            c.write_int(channel as i64)?;
            c.write_int(automatic as i64)?;
            c.read_int()
        })
    }

    fn gain_mode(&self, direction: Direction, channel: usize) -> bool {
        self.simple(
            |c| {
                c.write_sentinel()?;
                c.write_int(RpcTag::GetGainMode as i64)?;
                c.write_int(direction.to_wire())?;
                c.write_int(channel as i64)?;
                c.read_int()
            },
            0,
        ) != 0
    }

    fn set_gain(&self, direction: Direction, channel: usize, value: f64) -> DeviceResult<()> {
        self.checked(|c| {
            c.write_sentinel()?;
            c.write_int(RpcTag::SetGain as i64)?;
            c.write_int(direction.to_wire())?;
            c.write_int(channel as i64)?;
            c.write_double(value)?;
            c.read_int()
        })
    }

    fn set_gain_named(
        &self,
        direction: Direction,
        channel: usize,
        name: &str,
        value: f64,
    ) -> DeviceResult<()> {
        self.checked(|c| {
            c.write_sentinel()?;
            c.write_int(RpcTag::SetGainNamed as i64)?;
            c.write_int(direction.to_wire())?;
            c.write_int(channel as i64)?;
            c.write_string(name)?;
            c.write_double(value)?;
            c.read_int()
        })
    }

    fn gain(&self, direction: Direction, channel: usize) -> f64 {
        self.simple(
            |c| {
                c.write_sentinel()?;
                c.write_int(RpcTag::GetGain as i64)?;
                c.write_int(direction.to_wire())?;
                c.write_int(channel as i64)?;
                c.read_double()
            },
            0.0,
        )
    }

    fn gain_named(&self, direction: Direction, channel: usize, name: &str) -> f64 {
        self.simple(
            |c| {
                c.write_sentinel()?;
                c.write_int(RpcTag::GetGainNamed as i64)?;
                c.write_int(direction.to_wire())?;
                c.write_int(channel as i64)?;
                c.write_string(name)?;
                c.read_double()
            },
            0.0,
        )
    }

    fn gain_range(&self, direction: Direction, channel: usize) -> Range {
        self.simple(
            |c| {
                c.write_sentinel()?;
                c.write_int(RpcTag::GetGainRange as i64)?;
                c.write_int(direction.to_wire())?;
                c.write_int(channel as i64)?;
                let min = c.read_double()?;
                let max = c.read_double()?;
                let step = c.read_double()?;
                Ok(Range::new(min, max, step))
            },
            Range::new(0.0, 0.0, 0.0),
        )
    }

    fn gain_range_named(&self, direction: Direction, channel: usize, name: &str) -> Range {
        self.simple(
            |c| {
                c.write_sentinel()?;
                c.write_int(RpcTag::GetGainRangeNamed as i64)?;
                c.write_int(direction.to_wire())?;
                c.write_int(channel as i64)?;
                c.write_string(name)?;
                let min = c.read_double()?;
                let max = c.read_double()?;
                let step = c.read_double()?;
                Ok(Range::new(min, max, step))
            },
            Range::new(0.0, 0.0, 0.0),
        )
    }

    fn set_frequency(
        &self,
        direction: Direction,
        channel: usize,
        frequency: f64,
        args: &Kwargs,
    ) -> DeviceResult<()> {
        self.checked(|c| {
            c.write_sentinel()?;
            c.write_int(RpcTag::SetFrequency as i64)?;
            c.write_int(direction.to_wire())?;
            c.write_int(channel as i64)?;
            c.write_double(frequency)?;
            c.write_kwargs(args)?;
            c.read_int()
        })
    }

    fn set_frequency_component(
        &self,
        direction: Direction,
        channel: usize,
        name: &str,
        frequency: f64,
        args: &Kwargs,
    ) -> DeviceResult<()> {
        self.checked(|c| {
            c.write_sentinel()?;
            c.write_int(RpcTag::SetFrequencyNamed as i64)?;
            c.write_int(direction.to_wire())?;
            c.write_int(channel as i64)?;
            c.write_string(name)?;
            c.write_double(frequency)?;
            c.write_kwargs(args)?;
            c.read_int()
        })
    }

    fn frequency(&self, direction: Direction, channel: usize) -> f64 {
        self.simple(
            |c| {
                c.write_sentinel()?;
                c.write_int(RpcTag::GetFrequency as i64)?;
                c.write_int(direction.to_wire())?;
                c.write_int(channel as i64)?;
                c.read_double()
            },
            0.0,
        )
    }

    fn frequency_component(&self, direction: Direction, channel: usize, name: &str) -> f64 {
        self.simple(
            |c| {
                c.write_sentinel()?;
                c.write_int(RpcTag::GetFrequencyNamed as i64)?;
                c.write_int(direction.to_wire())?;
                c.write_int(channel as i64)?;
                c.write_string(name)?;
                c.read_double()
            },
            0.0,
        )
    }

    fn list_frequencies(&self, direction: Direction, channel: usize) -> Vec<String> {
        self.simple(
            |c| {
                c.write_sentinel()?;
                c.write_int(RpcTag::ListFrequencies as i64)?;
                c.write_int(direction.to_wire())?;
                c.write_int(channel as i64)?;
                c.read_str_vector()
            },
            Vec::new(),
        )
    }

    fn frequency_range(&self, direction: Direction, channel: usize) -> Vec<Range> {
        self.simple(
            |c| {
                c.write_sentinel()?;
                c.write_int(RpcTag::GetFrequencyRange as i64)?;
                c.write_int(direction.to_wire())?;
                c.write_int(channel as i64)?;
                c.read_range_list()
            },
            Vec::new(),
        )
    }

    fn frequency_range_component(
        &self,
        direction: Direction,
        channel: usize,
        name: &str,
    ) -> Vec<Range> {
        self.simple(
            |c| {
                c.write_sentinel()?;
                c.write_int(RpcTag::GetFrequencyRangeNamed as i64)?;
                c.write_int(direction.to_wire())?;
                c.write_int(channel as i64)?;
                c.write_string(name)?;
                c.read_range_list()
            },
            Vec::new(),
        )
    }

    fn set_sample_rate(&self, direction: Direction, channel: usize, rate: f64) -> DeviceResult<()> {
        self.checked(|c| {
            c.write_sentinel()?;
            c.write_int(RpcTag::SetSampleRate as i64)?;
            c.write_int(direction.to_wire())?;
            c.write_int(channel as i64)?;
            c.write_double(rate)?;
            c.read_int()
        })
    }

    fn sample_rate(&self, direction: Direction, channel: usize) -> f64 {
        self.simple(
            |c| {
                c.write_sentinel()?;
                c.write_int(RpcTag::GetSampleRate as i64)?;
                c.write_int(direction.to_wire())?;
                c.write_int(channel as i64)?;
                c.read_double()
            },
            0.0,
        )
    }

    fn sample_rate_range(&self, direction: Direction, channel: usize) -> Vec<Range> {
        self.simple(
            |c| {
                c.write_sentinel()?;
                c.write_int(RpcTag::GetSampleRateRange as i64)?;
                c.write_int(direction.to_wire())?;
                c.write_int(channel as i64)?;
                c.read_range_list()
            },
            Vec::new(),
        )
    }
}

struct DataHalf {
    socket: TcpStream,
    /// Reusable wire buffer, grown on demand.
    buf: Vec<u8>,
}

pub struct RemoteStream {
    rpc: Arc<Mutex<TcpCodec>>,
    data: Mutex<DataHalf>,
    remote_id: i64,
    direction: Direction,
    /// Format the caller asked for.
    requested: SampleFormat,
    /// Format on the wire; differs from `requested` when negotiated down
    /// to the device's native format.
    wire: SampleFormat,
    num_channels: usize,
    running: AtomicBool,
}

impl RemoteStream {
    fn stream_rpc(&self, tag: RpcTag) -> Result<i64, RpcError> {
        let mut rpc = self.rpc.lock().unwrap();
        rpc.write_sentinel()?;
        rpc.write_int(tag as i64)?;
        rpc.write_int(self.remote_id)?;
        rpc.read_int()
    }
}

impl Drop for RemoteStream {
    fn drop(&mut self) {
        if self.running.load(Ordering::SeqCst) {
            let _ = self.stream_rpc(RpcTag::DeactivateStream);
        }
        let _ = self.stream_rpc(RpcTag::CloseStream);
    }
}

impl SdrStream for RemoteStream {
    fn mtu(&self) -> usize {
        match self.stream_rpc(RpcTag::GetStreamMtu) {
            Ok(mtu) if mtu > 0 => mtu as usize,
            Ok(_) => 0,
            Err(e) => {
                log::error!("getStreamMTU failed: {}", e);
                0
            }
        }
    }

    fn activate(&self) -> DeviceResult<()> {
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }
        let status = self
            .stream_rpc(RpcTag::ActivateStream)
            .map_err(|e| DeviceError::Driver(e.to_string()))?;
        if status != 0 {
            return Err(DeviceError::Code(status as i32));
        }
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn deactivate(&self) -> DeviceResult<()> {
        if !self.running.load(Ordering::SeqCst) {
            return Ok(());
        }
        let status = self
            .stream_rpc(RpcTag::DeactivateStream)
            .map_err(|e| DeviceError::Driver(e.to_string()))?;
        if status != 0 {
            return Err(DeviceError::Code(status as i32));
        }
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn read(
        &self,
        buffs: &mut [&mut [u8]],
        num_elems: usize,
        timeout_us: i64,
    ) -> Result<usize, StreamError> {
        if self.direction != Direction::Rx {
            return Err(StreamError::Code(ns_device::ERR_NOT_SUPPORTED));
        }
        if !self.running.load(Ordering::SeqCst) {
            return Err(StreamError::Timeout);
        }
        let wire_frame = self.wire.frame_size();
        let elem_size = wire_frame * self.num_channels;
        let want = num_elems * elem_size;

        let mut data = self.data.lock().unwrap();
        let _ = data
            .socket
            .set_read_timeout(Some(Duration::from_micros(timeout_us.max(1) as u64)));
        if data.buf.len() < want {
            data.buf.resize(want, 0);
        }
        let DataHalf { socket, buf } = &mut *data;

        // one maximal read; the element count falls out of the byte count
        let n = match socket.read(&mut buf[..want]) {
            Ok(0) => return Err(StreamError::Code(ERR_STREAM)),
            Ok(n) => n,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                return Err(StreamError::Timeout)
            }
            Err(e) => {
                log::error!("error reading data stream: {}", e);
                return Err(StreamError::Code(ERR_STREAM));
            }
        };
        // top up a torn trailing element so whole elements stay whole
        let mut total = n;
        let torn = n % elem_size;
        if torn != 0 {
            let need = elem_size - torn;
            if socket.read_exact(&mut buf[n..n + need]).is_err() {
                return Err(StreamError::Code(ERR_CORRUPTION));
            }
            total += need;
        }
        let elems = total / elem_size;

        let req_frame = self.requested.frame_size();
        for e in 0..elems {
            for (c, chan) in buffs.iter_mut().enumerate() {
                let src = &buf[(e * self.num_channels + c) * wire_frame..][..wire_frame];
                let dst = &mut chan[e * req_frame..(e + 1) * req_frame];
                convert_frame(self.wire, self.requested, src, dst);
            }
        }
        Ok(elems)
    }

    fn write(
        &self,
        buffs: &[&[u8]],
        num_elems: usize,
        _timeout_us: i64,
    ) -> Result<usize, StreamError> {
        if self.direction != Direction::Tx {
            return Err(StreamError::Code(ns_device::ERR_NOT_SUPPORTED));
        }
        if !self.running.load(Ordering::SeqCst) {
            return Err(StreamError::Timeout);
        }
        let frame = self.wire.frame_size();
        let elem_size = frame * self.num_channels;
        let total = num_elems * elem_size;

        let mut data = self.data.lock().unwrap();
        if data.buf.len() < total {
            data.buf.resize(total, 0);
        }
        let DataHalf { socket, buf } = &mut *data;
        for e in 0..num_elems {
            for (c, chan) in buffs.iter().enumerate() {
                let off = (e * self.num_channels + c) * frame;
                buf[off..off + frame].copy_from_slice(&chan[e * frame..(e + 1) * frame]);
            }
        }
        // TCP back pressure is the flow control
        if let Err(e) = socket.write_all(&buf[..total]) {
            log::error!("error writing data stream: {}", e);
            return Err(StreamError::Code(ERR_STREAM));
        }
        Ok(num_elems)
    }
}

/// Convert one wire frame into one requested-format frame. Identity when
/// the formats match; otherwise a widening conversion (the wire format is
/// never wider than the requested one).
fn convert_frame(wire: SampleFormat, requested: SampleFormat, src: &[u8], dst: &mut [u8]) {
    match (wire, requested) {
        (w, r) if w == r => dst.copy_from_slice(src),
        (SampleFormat::Cs16, SampleFormat::Cf32) => {
            for k in 0..2 {
                let s = i16::from_le_bytes([src[k * 2], src[k * 2 + 1]]);
                let f = s as f32 / i16::MAX as f32;
                dst[k * 4..(k + 1) * 4].copy_from_slice(&f.to_le_bytes());
            }
        }
        (SampleFormat::Cs8, SampleFormat::Cf32) => {
            for k in 0..2 {
                let s = src[k] as i8;
                let f = s as f32 / i8::MAX as f32;
                dst[k * 4..(k + 1) * 4].copy_from_slice(&f.to_le_bytes());
            }
        }
        (SampleFormat::Cs8, SampleFormat::Cs16) => {
            for k in 0..2 {
                let s = ((src[k] as i8) as i16) << 8;
                dst[k * 2..(k + 1) * 2].copy_from_slice(&s.to_le_bytes());
            }
        }
        (w, r) => {
            // narrowing never negotiated; zero-fill rather than invent data
            log::error!("no converter from {} to {}", w.name(), r.name());
            dst.fill(0);
        }
    }
}
