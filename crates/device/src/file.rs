// Copyright 2025-2026 CEMAXECUTER LLC

//! IQ replay backend: serves a recording from disk as an RX-only device.
//!
//! Useful for exercising the network path without hardware, or for
//! re-serving a capture to remote consumers. The file is raw interleaved
//! I/Q in the configured format and loops at EOF.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use ns_rpc::{Direction, Kwargs, Range, SampleFormat};

use crate::{DeviceError, DeviceResult, SdrDevice, SdrStream, StreamError, ERR_NOT_SUPPORTED, ERR_STREAM};

const DEFAULT_MTU: usize = 65536;

pub struct FileDevice {
    path: PathBuf,
    format: SampleFormat,
    mtu: usize,
    sample_rate: Mutex<f64>,
    frequency: Mutex<f64>,
    gain: Mutex<f64>,
}

impl FileDevice {
    pub fn from_args(args: &Kwargs) -> DeviceResult<Self> {
        let path = args
            .get("path")
            .ok_or_else(|| DeviceError::Driver("file driver requires path=".to_string()))?;
        let format = match args.get("format") {
            None => SampleFormat::Cs16,
            Some(name) => SampleFormat::from_name(name)
                .ok_or_else(|| DeviceError::Driver(format!("unknown file format: {}", name)))?,
        };
        // fail now, not at first read
        File::open(path)
            .map_err(|e| DeviceError::Driver(format!("failed to open {}: {}", path, e)))?;
        let rate = args
            .get("rate")
            .and_then(|v| v.parse().ok())
            .unwrap_or(1_000_000.0);
        let mtu = args
            .get("mtu")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_MTU);
        Ok(FileDevice {
            path: PathBuf::from(path),
            format,
            mtu,
            sample_rate: Mutex::new(rate),
            frequency: Mutex::new(0.0),
            gain: Mutex::new(0.0),
        })
    }
}

impl SdrDevice for FileDevice {
    fn driver_key(&self) -> String {
        "file".to_string()
    }

    fn hardware_key(&self) -> String {
        format!("file:{}", self.path.display())
    }

    fn hardware_info(&self) -> Kwargs {
        let mut info = Kwargs::new();
        info.set("origin", "file");
        info.set("path", &self.path.to_string_lossy());
        info.set("format", self.format.name());
        info
    }

    fn set_frontend_mapping(&self, _direction: Direction, _mapping: &str) -> DeviceResult<()> {
        Ok(())
    }

    fn frontend_mapping(&self, _direction: Direction) -> String {
        String::new()
    }

    fn num_channels(&self, direction: Direction) -> usize {
        match direction {
            Direction::Rx => 1,
            Direction::Tx => 0,
        }
    }

    fn channel_info(&self, _direction: Direction, _channel: usize) -> Kwargs {
        Kwargs::new()
    }

    fn full_duplex(&self, _direction: Direction, _channel: usize) -> bool {
        false
    }

    fn stream_formats(&self, _direction: Direction, _channel: usize) -> Vec<String> {
        vec![self.format.name().to_string()]
    }

    fn native_stream_format(&self, _direction: Direction, _channel: usize) -> (SampleFormat, f64) {
        let scale = match self.format {
            SampleFormat::Cs8 => 127.0,
            SampleFormat::Cs16 => 32767.0,
            SampleFormat::Cf32 => 1.0,
        };
        (self.format, scale)
    }

    fn setup_stream(
        &self,
        direction: Direction,
        format: SampleFormat,
        channels: &[usize],
        _args: &Kwargs,
    ) -> DeviceResult<Arc<dyn SdrStream>> {
        if direction != Direction::Rx {
            return Err(DeviceError::Unsupported("file device is receive-only"));
        }
        if format != self.format {
            return Err(DeviceError::Driver(format!(
                "file is {}, requested {}",
                self.format.name(),
                format.name()
            )));
        }
        if channels != [0] {
            return Err(DeviceError::Driver("file device has one channel".to_string()));
        }
        let file = File::open(&self.path)
            .map_err(|e| DeviceError::Driver(format!("failed to open {}: {}", self.path.display(), e)))?;
        Ok(Arc::new(FileStream {
            format,
            mtu: self.mtu,
            active: AtomicBool::new(false),
            file: Mutex::new(file),
        }))
    }

    fn list_antennas(&self, _direction: Direction, _channel: usize) -> Vec<String> {
        Vec::new()
    }

    fn set_antenna(&self, _direction: Direction, _channel: usize, _name: &str) -> DeviceResult<()> {
        Err(DeviceError::Unsupported("file device has no antennas"))
    }

    fn antenna(&self, _direction: Direction, _channel: usize) -> String {
        String::new()
    }

    fn list_gains(&self, _direction: Direction, _channel: usize) -> Vec<String> {
        Vec::new()
    }

    fn has_gain_mode(&self, _direction: Direction, _channel: usize) -> bool {
        false
    }

    fn set_gain_mode(
        &self,
        _direction: Direction,
        _channel: usize,
        _automatic: bool,
    ) -> DeviceResult<()> {
        Ok(())
    }

    fn gain_mode(&self, _direction: Direction, _channel: usize) -> bool {
        false
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
        Range::new(0.0, 0.0, 0.0)
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
        vec![Range::new(0.0, 6e9, 1.0)]
    }

    fn frequency_range_component(
        &self,
        direction: Direction,
        channel: usize,
        _name: &str,
    ) -> Vec<Range> {
        self.frequency_range(direction, channel)
    }

    fn set_sample_rate(&self, _direction: Direction, _channel: usize, rate: f64) -> DeviceResult<()> {
        *self.sample_rate.lock().unwrap() = rate;
        Ok(())
    }

    fn sample_rate(&self, _direction: Direction, _channel: usize) -> f64 {
        *self.sample_rate.lock().unwrap()
    }

    fn sample_rate_range(&self, _direction: Direction, _channel: usize) -> Vec<Range> {
        let rate = *self.sample_rate.lock().unwrap();
        vec![Range::new(rate, rate, 1.0)]
    }
}

struct FileStream {
    format: SampleFormat,
    mtu: usize,
    active: AtomicBool,
    file: Mutex<File>,
}

impl SdrStream for FileStream {
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
        if !self.active.load(Ordering::SeqCst) {
            return Err(StreamError::Timeout);
        }
        let frame = self.format.frame_size();
        let want = num_elems.min(self.mtu) * frame;
        let mut file = self.file.lock().unwrap();
        let buf = &mut buffs[0][..want];
        let mut got = 0;
        while got < want {
            match file.read(&mut buf[got..]) {
                Ok(0) => {
                    // loop the recording
                    if file.seek(SeekFrom::Start(0)).is_err() {
                        return Err(StreamError::Code(ERR_STREAM));
                    }
                    if got == 0 {
                        continue;
                    }
                    break;
                }
                Ok(n) => got += n,
                Err(_) => return Err(StreamError::Code(ERR_STREAM)),
            }
        }
        Ok(got / frame)
    }

    fn write(
        &self,
        _buffs: &[&[u8]],
        _num_elems: usize,
        _timeout_us: i64,
    ) -> Result<usize, StreamError> {
        Err(StreamError::Code(ERR_NOT_SUPPORTED))
    }
}
