// Copyright 2025-2026 CEMAXECUTER LLC

//! Deterministic in-memory device for tests and bring-up.
//!
//! The generator produces a repeatable per-channel pattern so a consumer
//! anywhere downstream (pipe, socket, remote client) can recompute exactly
//! the bytes the device emitted. Streams can instead be scripted with
//! preset per-channel sample blocks for fixture-driven tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use ns_rpc::{Direction, Kwargs, Range, SampleFormat};

use crate::{DeviceError, DeviceResult, SdrDevice, SdrStream, StreamError, ERR_NOT_SUPPORTED};

const DEFAULT_CHANNELS: usize = 2;
const DEFAULT_MTU: usize = 1024;

/// The pattern frame for element `elem` on device channel `channel`:
/// I ramps with the element index, Q carries a channel-salted copy so no
/// two channels ever produce the same frame.
pub fn pattern_frame(format: SampleFormat, elem: u64, channel: usize) -> Vec<u8> {
    match format {
        SampleFormat::Cs8 => {
            let i = elem as i8;
            let q = (elem as i8).wrapping_add(((channel + 1) as i8).wrapping_mul(32));
            vec![i as u8, q as u8]
        }
        SampleFormat::Cs16 => {
            let i = elem as i16;
            let q = (elem as i16).wrapping_add(((channel + 1) as i16).wrapping_mul(4096));
            let mut out = Vec::with_capacity(4);
            out.extend_from_slice(&i.to_le_bytes());
            out.extend_from_slice(&q.to_le_bytes());
            out
        }
        SampleFormat::Cf32 => {
            let i = (elem % 4096) as f32 / 4096.0;
            let q = i + (channel + 1) as f32;
            let mut out = Vec::with_capacity(8);
            out.extend_from_slice(&i.to_le_bytes());
            out.extend_from_slice(&q.to_le_bytes());
            out
        }
    }
}

pub struct DummyDevice {
    num_channels: usize,
    mtu: usize,
    native: SampleFormat,
    sample_rate: Mutex<f64>,
    frequency: Mutex<f64>,
    gain: Mutex<f64>,
    gain_mode: Mutex<bool>,
    antenna: Mutex<String>,
    frontend: Mutex<String>,
    /// Preset per-channel frame bytes; generator mode when absent.
    script: Option<Arc<Vec<Vec<u8>>>>,
    /// Interleaved writes land here, per device channel.
    tx_capture: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl DummyDevice {
    pub fn from_args(args: &Kwargs) -> Self {
        let num_channels = args
            .get("channels")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_CHANNELS);
        let mtu = args
            .get("mtu")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_MTU);
        let mut dev = Self::build(num_channels, mtu, None);
        if let Some(native) = args.get("native").and_then(SampleFormat::from_name) {
            dev.native = native;
        }
        dev
    }

    /// A device whose streams replay exactly `samples[c]` on channel `c`
    /// (frame bytes in `format`), then time out.
    pub fn with_channel_samples(format: SampleFormat, samples: Vec<Vec<u8>>) -> Self {
        let channels = samples.len();
        let mut dev = Self::build(channels, DEFAULT_MTU, Some(Arc::new(samples)));
        dev.native = format;
        dev
    }

    fn build(num_channels: usize, mtu: usize, script: Option<Arc<Vec<Vec<u8>>>>) -> Self {
        DummyDevice {
            num_channels,
            mtu,
            native: SampleFormat::Cs16,
            sample_rate: Mutex::new(1_000_000.0),
            frequency: Mutex::new(100_000_000.0),
            gain: Mutex::new(0.0),
            gain_mode: Mutex::new(false),
            antenna: Mutex::new("RX".to_string()),
            frontend: Mutex::new(String::new()),
            script,
            tx_capture: Arc::new(Mutex::new(vec![Vec::new(); num_channels])),
        }
    }

    /// Per-channel bytes accepted by TX streams so far.
    pub fn captured_tx(&self) -> Vec<Vec<u8>> {
        self.tx_capture.lock().unwrap().clone()
    }
}

impl SdrDevice for DummyDevice {
    fn driver_key(&self) -> String {
        "dummy".to_string()
    }

    fn hardware_key(&self) -> String {
        "dummy-key".to_string()
    }

    fn hardware_info(&self) -> Kwargs {
        let mut info = Kwargs::new();
        info.set("origin", "dummy");
        info.set("channels", &self.num_channels.to_string());
        info
    }

    fn set_frontend_mapping(&self, _direction: Direction, mapping: &str) -> DeviceResult<()> {
        *self.frontend.lock().unwrap() = mapping.to_string();
        Ok(())
    }

    fn frontend_mapping(&self, _direction: Direction) -> String {
        self.frontend.lock().unwrap().clone()
    }

    fn num_channels(&self, _direction: Direction) -> usize {
        self.num_channels
    }

    fn channel_info(&self, _direction: Direction, channel: usize) -> Kwargs {
        let mut info = Kwargs::new();
        info.set("index", &channel.to_string());
        info
    }

    fn full_duplex(&self, _direction: Direction, _channel: usize) -> bool {
        true
    }

    fn stream_formats(&self, _direction: Direction, _channel: usize) -> Vec<String> {
        vec!["CS8".to_string(), "CS16".to_string(), "CF32".to_string()]
    }

    fn native_stream_format(&self, _direction: Direction, _channel: usize) -> (SampleFormat, f64) {
        let scale = match self.native {
            SampleFormat::Cs8 => 127.0,
            SampleFormat::Cs16 => 32767.0,
            SampleFormat::Cf32 => 1.0,
        };
        (self.native, scale)
    }

    fn setup_stream(
        &self,
        direction: Direction,
        format: SampleFormat,
        channels: &[usize],
        _args: &Kwargs,
    ) -> DeviceResult<Arc<dyn SdrStream>> {
        if channels.is_empty() {
            return Err(DeviceError::Driver("empty channel list".to_string()));
        }
        if let Some(&bad) = channels.iter().find(|&&c| c >= self.num_channels) {
            return Err(DeviceError::Driver(format!(
                "channel {} out of range ({} available)",
                bad, self.num_channels
            )));
        }
        Ok(Arc::new(DummyStream {
            direction,
            format,
            channels: channels.to_vec(),
            mtu: self.mtu,
            native: format == self.native,
            active: AtomicBool::new(false),
            counter: Mutex::new(0),
            script: self.script.clone(),
            script_pos: Mutex::new(0),
            tx_capture: Arc::clone(&self.tx_capture),
        }))
    }

    fn list_antennas(&self, direction: Direction, _channel: usize) -> Vec<String> {
        match direction {
            Direction::Rx => vec!["RX".to_string()],
            Direction::Tx => vec!["TX".to_string()],
        }
    }

    fn set_antenna(&self, _direction: Direction, _channel: usize, name: &str) -> DeviceResult<()> {
        *self.antenna.lock().unwrap() = name.to_string();
        Ok(())
    }

    fn antenna(&self, _direction: Direction, _channel: usize) -> String {
        self.antenna.lock().unwrap().clone()
    }

    fn list_gains(&self, _direction: Direction, _channel: usize) -> Vec<String> {
        vec!["PGA".to_string()]
    }

    fn has_gain_mode(&self, _direction: Direction, _channel: usize) -> bool {
        true
    }

    fn set_gain_mode(
        &self,
        _direction: Direction,
        _channel: usize,
        automatic: bool,
    ) -> DeviceResult<()> {
        *self.gain_mode.lock().unwrap() = automatic;
        Ok(())
    }

    fn gain_mode(&self, _direction: Direction, _channel: usize) -> bool {
        *self.gain_mode.lock().unwrap()
    }

    fn set_gain(&self, _direction: Direction, _channel: usize, value: f64) -> DeviceResult<()> {
        *self.gain.lock().unwrap() = value;
        Ok(())
    }

    fn set_gain_named(
        &self,
        direction: Direction,
        channel: usize,
        _name: &str,
        value: f64,
    ) -> DeviceResult<()> {
        self.set_gain(direction, channel, value)
    }

    fn gain(&self, _direction: Direction, _channel: usize) -> f64 {
        *self.gain.lock().unwrap()
    }

    fn gain_named(&self, direction: Direction, channel: usize, _name: &str) -> f64 {
        self.gain(direction, channel)
    }

    fn gain_range(&self, _direction: Direction, _channel: usize) -> Range {
        Range::new(0.0, 61.0, 1.0)
    }

    fn gain_range_named(&self, direction: Direction, channel: usize, _name: &str) -> Range {
        self.gain_range(direction, channel)
    }

    fn set_frequency(
        &self,
        _direction: Direction,
        _channel: usize,
        frequency: f64,
        _args: &Kwargs,
    ) -> DeviceResult<()> {
        *self.frequency.lock().unwrap() = frequency;
        Ok(())
    }

    fn set_frequency_component(
        &self,
        direction: Direction,
        channel: usize,
        _name: &str,
        frequency: f64,
        args: &Kwargs,
    ) -> DeviceResult<()> {
        self.set_frequency(direction, channel, frequency, args)
    }

    fn frequency(&self, _direction: Direction, _channel: usize) -> f64 {
        *self.frequency.lock().unwrap()
    }

    fn frequency_component(&self, direction: Direction, channel: usize, _name: &str) -> f64 {
        self.frequency(direction, channel)
    }

    fn list_frequencies(&self, _direction: Direction, _channel: usize) -> Vec<String> {
        vec!["RF".to_string()]
    }

    fn frequency_range(&self, _direction: Direction, _channel: usize) -> Vec<Range> {
        vec![Range::new(24e6, 1.8e9, 1.0)]
    }

    fn frequency_range_component(
        &self,
        direction: Direction,
        channel: usize,
        _name: &str,
    ) -> Vec<Range> {
        self.frequency_range(direction, channel)
    }

    fn set_sample_rate(
        &self,
        _direction: Direction,
        _channel: usize,
        rate: f64,
    ) -> DeviceResult<()> {
        *self.sample_rate.lock().unwrap() = rate;
        Ok(())
    }

    fn sample_rate(&self, _direction: Direction, _channel: usize) -> f64 {
        *self.sample_rate.lock().unwrap()
    }

    fn sample_rate_range(&self, _direction: Direction, _channel: usize) -> Vec<Range> {
        vec![Range::new(250_000.0, 2_000_000.0, 250_000.0)]
    }
}

struct DummyStream {
    direction: Direction,
    format: SampleFormat,
    /// Selected device channel numbers, in caller order.
    channels: Vec<usize>,
    mtu: usize,
    native: bool,
    active: AtomicBool,
    /// Elements generated so far (generator mode).
    counter: Mutex<u64>,
    script: Option<Arc<Vec<Vec<u8>>>>,
    /// Element offset into the script (script mode).
    script_pos: Mutex<usize>,
    tx_capture: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl DummyStream {
    fn script_remaining(&self, pos: usize) -> usize {
        let frame = self.format.frame_size();
        let script = self.script.as_ref().unwrap();
        let total = self
            .channels
            .iter()
            .map(|&c| script[c].len() / frame)
            .min()
            .unwrap_or(0);
        total.saturating_sub(pos)
    }
}

impl SdrStream for DummyStream {
    fn mtu(&self) -> usize {
        self.mtu
    }

    fn activate(&self) -> DeviceResult<()> {
        self.active.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn deactivate(&self) -> DeviceResult<()> {
        self.active.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn read(
        &self,
        buffs: &mut [&mut [u8]],
        num_elems: usize,
        _timeout_us: i64,
    ) -> Result<usize, StreamError> {
        if self.direction != Direction::Rx {
            return Err(StreamError::Code(ERR_NOT_SUPPORTED));
        }
        if !self.active.load(Ordering::SeqCst) {
            return Err(StreamError::Timeout);
        }
        let frame = self.format.frame_size();
        if let Some(script) = &self.script {
            let mut pos = self.script_pos.lock().unwrap();
            let n = num_elems.min(self.mtu).min(self.script_remaining(*pos));
            if n == 0 {
                return Err(StreamError::Timeout);
            }
            for (slot, &chan) in self.channels.iter().enumerate() {
                let src = &script[chan][*pos * frame..(*pos + n) * frame];
                buffs[slot][..n * frame].copy_from_slice(src);
            }
            *pos += n;
            Ok(n)
        } else {
            let mut counter = self.counter.lock().unwrap();
            let n = num_elems.min(self.mtu);
            for (slot, &chan) in self.channels.iter().enumerate() {
                for e in 0..n {
                    let f = pattern_frame(self.format, *counter + e as u64, chan);
                    buffs[slot][e * frame..(e + 1) * frame].copy_from_slice(&f);
                }
            }
            *counter += n as u64;
            Ok(n)
        }
    }

    fn write(
        &self,
        buffs: &[&[u8]],
        num_elems: usize,
        _timeout_us: i64,
    ) -> Result<usize, StreamError> {
        if self.direction != Direction::Tx {
            return Err(StreamError::Code(ERR_NOT_SUPPORTED));
        }
        if !self.active.load(Ordering::SeqCst) {
            return Err(StreamError::Timeout);
        }
        let frame = self.format.frame_size();
        let n = num_elems.min(self.mtu);
        let mut capture = self.tx_capture.lock().unwrap();
        for (slot, &chan) in self.channels.iter().enumerate() {
            capture[chan].extend_from_slice(&buffs[slot][..n * frame]);
        }
        Ok(n)
    }

    fn has_direct_buffers(&self) -> bool {
        self.channels.len() == 1 && self.native && self.direction == Direction::Rx
    }

    fn read_direct(
        &self,
        sink: &mut dyn FnMut(&[u8]),
        _timeout_us: i64,
    ) -> Result<usize, StreamError> {
        if !self.has_direct_buffers() {
            return Err(StreamError::Code(ERR_NOT_SUPPORTED));
        }
        if !self.active.load(Ordering::SeqCst) {
            return Err(StreamError::Timeout);
        }
        let frame = self.format.frame_size();
        let chan = self.channels[0];
        if let Some(script) = &self.script {
            let mut pos = self.script_pos.lock().unwrap();
            let n = self.mtu.min(self.script_remaining(*pos));
            if n == 0 {
                return Err(StreamError::Timeout);
            }
            sink(&script[chan][*pos * frame..(*pos + n) * frame]);
            *pos += n;
            Ok(n)
        } else {
            let mut counter = self.counter.lock().unwrap();
            let n = self.mtu;
            let mut staging = vec![0u8; n * frame];
            for e in 0..n {
                let f = pattern_frame(self.format, *counter + e as u64, chan);
                staging[e * frame..(e + 1) * frame].copy_from_slice(&f);
            }
            *counter += n as u64;
            sink(&staging);
            Ok(n)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_distinct_across_channels() {
        for fmt in [SampleFormat::Cs8, SampleFormat::Cs16, SampleFormat::Cf32] {
            let a = pattern_frame(fmt, 5, 0);
            let b = pattern_frame(fmt, 5, 1);
            assert_eq!(a.len(), fmt.frame_size());
            assert_ne!(a, b, "channels must not collide for {:?}", fmt);
        }
    }

    #[test]
    fn test_generator_read_matches_pattern() {
        let dev = DummyDevice::from_args(&Kwargs::new());
        let stream = dev
            .setup_stream(Direction::Rx, SampleFormat::Cs16, &[0, 1], &Kwargs::new())
            .unwrap();
        stream.activate().unwrap();

        let mut ch0 = vec![0u8; 16 * 4];
        let mut ch1 = vec![0u8; 16 * 4];
        {
            let mut buffs = [ch0.as_mut_slice(), ch1.as_mut_slice()];
            assert_eq!(stream.read(&mut buffs, 16, 100_000).unwrap(), 16);
        }
        for e in 0..16u64 {
            assert_eq!(
                &ch0[(e as usize) * 4..(e as usize + 1) * 4],
                pattern_frame(SampleFormat::Cs16, e, 0).as_slice()
            );
            assert_eq!(
                &ch1[(e as usize) * 4..(e as usize + 1) * 4],
                pattern_frame(SampleFormat::Cs16, e, 1).as_slice()
            );
        }

        // counter keeps running across reads
        let mut buffs = [ch0.as_mut_slice(), ch1.as_mut_slice()];
        stream.read(&mut buffs, 4, 100_000).unwrap();
        assert_eq!(&ch0[0..4], pattern_frame(SampleFormat::Cs16, 16, 0).as_slice());
    }

    #[test]
    fn test_scripted_read_then_timeout() {
        let frames: Vec<u8> = (0..8u8).flat_map(|v| [v, v]).collect(); // 8 CS8 frames
        let dev = DummyDevice::with_channel_samples(SampleFormat::Cs8, vec![frames.clone()]);
        let stream = dev
            .setup_stream(Direction::Rx, SampleFormat::Cs8, &[0], &Kwargs::new())
            .unwrap();
        stream.activate().unwrap();

        let mut buf = vec![0u8; 8 * 2];
        let mut buffs = [buf.as_mut_slice()];
        assert_eq!(stream.read(&mut buffs, 8, 100_000).unwrap(), 8);
        assert_eq!(buf, frames);
        let mut buffs = [buf.as_mut_slice()];
        assert_eq!(
            stream.read(&mut buffs, 8, 100_000),
            Err(StreamError::Timeout)
        );
    }

    #[test]
    fn test_inactive_stream_times_out() {
        let dev = DummyDevice::from_args(&Kwargs::new());
        let stream = dev
            .setup_stream(Direction::Rx, SampleFormat::Cs16, &[0], &Kwargs::new())
            .unwrap();
        let mut buf = vec![0u8; 4];
        let mut buffs = [buf.as_mut_slice()];
        assert_eq!(stream.read(&mut buffs, 1, 0), Err(StreamError::Timeout));
    }

    #[test]
    fn test_channel_out_of_range_rejected() {
        let dev = DummyDevice::from_args(&Kwargs::new());
        assert!(dev
            .setup_stream(Direction::Rx, SampleFormat::Cs16, &[7], &Kwargs::new())
            .is_err());
    }

    #[test]
    fn test_tx_capture() {
        let dev = DummyDevice::from_args(&Kwargs::new());
        let stream = dev
            .setup_stream(Direction::Tx, SampleFormat::Cs8, &[1], &Kwargs::new())
            .unwrap();
        stream.activate().unwrap();
        let data: Vec<u8> = (0..20).collect();
        assert_eq!(stream.write(&[&data], 10, 0).unwrap(), 10);
        let captured = dev.captured_tx();
        assert!(captured[0].is_empty());
        assert_eq!(captured[1], data);
    }

    #[test]
    fn test_direct_buffer_path() {
        let dev = DummyDevice::from_args(&Kwargs::new());
        let stream = dev
            .setup_stream(Direction::Rx, SampleFormat::Cs16, &[1], &Kwargs::new())
            .unwrap();
        assert!(stream.has_direct_buffers());
        stream.activate().unwrap();
        let mut seen = Vec::new();
        let n = stream
            .read_direct(&mut |bytes| seen.extend_from_slice(bytes), 100_000)
            .unwrap();
        assert_eq!(seen.len(), n * 4);
        assert_eq!(&seen[0..4], pattern_frame(SampleFormat::Cs16, 0, 1).as_slice());

        // two channels: generic path only
        let stream2 = dev
            .setup_stream(Direction::Rx, SampleFormat::Cs16, &[0, 1], &Kwargs::new())
            .unwrap();
        assert!(!stream2.has_direct_buffers());
    }
}
