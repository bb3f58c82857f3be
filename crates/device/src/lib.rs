// Copyright 2025-2026 CEMAXECUTER LLC

//! SDR device abstraction.
//!
//! The server drives a device through these traits and never learns what
//! is behind them: a simulation, a file of recorded IQ, or real hardware
//! through the SoapySDR C API. The client driver implements the same
//! traits over the network, so an application cannot tell a remoted device
//! from a local one.

pub mod dummy;
pub mod file;

#[cfg(feature = "soapysdr")]
pub mod soapy;

use std::sync::Arc;

use thiserror::Error;

use ns_rpc::{Direction, Kwargs, Range, SampleFormat};

// Stream error codes, matching the SoapySDR convention so backend codes
// pass through unchanged.
pub const ERR_TIMEOUT: i32 = -1;
pub const ERR_STREAM: i32 = -2;
pub const ERR_CORRUPTION: i32 = -3;
pub const ERR_OVERFLOW: i32 = -4;
pub const ERR_NOT_SUPPORTED: i32 = -5;
pub const ERR_TIME: i32 = -6;
pub const ERR_UNDERFLOW: i32 = -7;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("unknown driver: {0}")]
    UnknownDriver(String),

    #[error("driver error: {0}")]
    Driver(String),

    #[error("operation not supported: {0}")]
    Unsupported(&'static str),

    #[error("device error code {0}")]
    Code(i32),
}

impl DeviceError {
    /// The negative integer reported on the wire for this failure.
    pub fn code(&self) -> i32 {
        match self {
            DeviceError::Code(c) => *c,
            DeviceError::Unsupported(_) => ERR_NOT_SUPPORTED,
            _ => ERR_STREAM,
        }
    }
}

pub type DeviceResult<T> = Result<T, DeviceError>;

/// Errors from the streaming hot path. `Timeout` and `Overflow` are
/// transient: pumps retry them rather than tearing the stream down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamError {
    Timeout,
    Overflow,
    Underflow,
    Code(i32),
}

impl StreamError {
    pub fn code(self) -> i32 {
        match self {
            StreamError::Timeout => ERR_TIMEOUT,
            StreamError::Overflow => ERR_OVERFLOW,
            StreamError::Underflow => ERR_UNDERFLOW,
            StreamError::Code(c) => c,
        }
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            ERR_TIMEOUT => StreamError::Timeout,
            ERR_OVERFLOW => StreamError::Overflow,
            ERR_UNDERFLOW => StreamError::Underflow,
            c => StreamError::Code(c),
        }
    }
}

impl std::fmt::Display for StreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamError::Timeout => write!(f, "timeout"),
            StreamError::Overflow => write!(f, "overflow"),
            StreamError::Underflow => write!(f, "underflow"),
            StreamError::Code(c) => write!(f, "stream error {}", c),
        }
    }
}

/// An open sample stream.
///
/// Methods take `&self`: the server calls parameter operations from its
/// main thread while a pump thread is inside `read`/`write`, and the
/// device APIs fronted here permit concurrent disjoint operations.
/// Dropping the last reference releases the underlying device stream.
pub trait SdrStream: Send + Sync {
    /// Maximum number of elements a single read/write is expected to
    /// transfer.
    fn mtu(&self) -> usize;

    fn activate(&self) -> DeviceResult<()>;

    fn deactivate(&self) -> DeviceResult<()>;

    /// Read up to `num_elems` elements into per-channel buffers. Each
    /// buffer must hold at least `num_elems * frame_size` bytes. Returns
    /// the number of elements read.
    fn read(
        &self,
        buffs: &mut [&mut [u8]],
        num_elems: usize,
        timeout_us: i64,
    ) -> Result<usize, StreamError>;

    /// Write up to `num_elems` elements from per-channel buffers. Returns
    /// the number of elements accepted.
    fn write(
        &self,
        buffs: &[&[u8]],
        num_elems: usize,
        timeout_us: i64,
    ) -> Result<usize, StreamError>;

    /// Whether the backend can lend its own buffers for reading, avoiding
    /// the interleave copy on single-channel native-format streams.
    fn has_direct_buffers(&self) -> bool {
        false
    }

    /// Lend the next device buffer of interleaved native-format bytes to
    /// `sink`. Returns the number of elements lent.
    fn read_direct(
        &self,
        _sink: &mut dyn FnMut(&[u8]),
        _timeout_us: i64,
    ) -> Result<usize, StreamError> {
        Err(StreamError::Code(ERR_NOT_SUPPORTED))
    }
}

/// An open SDR device.
///
/// Accessors that cannot reasonably fail return plain values; operations
/// that reach hardware return `DeviceResult`.
pub trait SdrDevice: Send + Sync {
    // identification
    fn driver_key(&self) -> String;
    fn hardware_key(&self) -> String;
    fn hardware_info(&self) -> Kwargs;

    // channels
    fn set_frontend_mapping(&self, direction: Direction, mapping: &str) -> DeviceResult<()>;
    fn frontend_mapping(&self, direction: Direction) -> String;
    fn num_channels(&self, direction: Direction) -> usize;
    fn channel_info(&self, direction: Direction, channel: usize) -> Kwargs;
    fn full_duplex(&self, direction: Direction, channel: usize) -> bool;

    // stream metadata
    fn stream_formats(&self, direction: Direction, channel: usize) -> Vec<String>;
    /// Native format plus the full-scale value of one component.
    fn native_stream_format(&self, direction: Direction, channel: usize) -> (SampleFormat, f64);

    // stream lifecycle
    fn setup_stream(
        &self,
        direction: Direction,
        format: SampleFormat,
        channels: &[usize],
        args: &Kwargs,
    ) -> DeviceResult<Arc<dyn SdrStream>>;

    // antenna
    fn list_antennas(&self, direction: Direction, channel: usize) -> Vec<String>;
    fn set_antenna(&self, direction: Direction, channel: usize, name: &str) -> DeviceResult<()>;
    fn antenna(&self, direction: Direction, channel: usize) -> String;

    // gain
    fn list_gains(&self, direction: Direction, channel: usize) -> Vec<String>;
    fn has_gain_mode(&self, direction: Direction, channel: usize) -> bool;
    fn set_gain_mode(&self, direction: Direction, channel: usize, automatic: bool)
        -> DeviceResult<()>;
    fn gain_mode(&self, direction: Direction, channel: usize) -> bool;
    fn set_gain(&self, direction: Direction, channel: usize, value: f64) -> DeviceResult<()>;
    fn set_gain_named(
        &self,
        direction: Direction,
        channel: usize,
        name: &str,
        value: f64,
    ) -> DeviceResult<()>;
    fn gain(&self, direction: Direction, channel: usize) -> f64;
    fn gain_named(&self, direction: Direction, channel: usize, name: &str) -> f64;
    fn gain_range(&self, direction: Direction, channel: usize) -> Range;
    fn gain_range_named(&self, direction: Direction, channel: usize, name: &str) -> Range;

    // frequency
    fn set_frequency(
        &self,
        direction: Direction,
        channel: usize,
        frequency: f64,
        args: &Kwargs,
    ) -> DeviceResult<()>;
    fn set_frequency_component(
        &self,
        direction: Direction,
        channel: usize,
        name: &str,
        frequency: f64,
        args: &Kwargs,
    ) -> DeviceResult<()>;
    fn frequency(&self, direction: Direction, channel: usize) -> f64;
    fn frequency_component(&self, direction: Direction, channel: usize, name: &str) -> f64;
    fn list_frequencies(&self, direction: Direction, channel: usize) -> Vec<String>;
    fn frequency_range(&self, direction: Direction, channel: usize) -> Vec<Range>;
    fn frequency_range_component(
        &self,
        direction: Direction,
        channel: usize,
        name: &str,
    ) -> Vec<Range>;

    // sample rate
    fn set_sample_rate(&self, direction: Direction, channel: usize, rate: f64) -> DeviceResult<()>;
    fn sample_rate(&self, direction: Direction, channel: usize) -> f64;
    fn sample_rate_range(&self, direction: Direction, channel: usize) -> Vec<Range>;

    /// Discrete sample rates, emulated by stepping the ranges.
    fn list_sample_rates(&self, direction: Direction, channel: usize) -> Vec<f64> {
        let mut rates = Vec::new();
        for r in self.sample_rate_range(direction, channel) {
            if r.step <= 0.0 {
                rates.push(r.min);
                if r.max > r.min {
                    rates.push(r.max);
                }
                continue;
            }
            let mut f = r.min;
            while f <= r.max {
                rates.push(f);
                f += r.step;
            }
        }
        rates
    }
}

/// Build a device from a driver key and its arguments.
pub fn make_device(driver: &str, args: &Kwargs) -> DeviceResult<Arc<dyn SdrDevice>> {
    match driver {
        "dummy" => Ok(Arc::new(dummy::DummyDevice::from_args(args))),
        "file" => Ok(Arc::new(file::FileDevice::from_args(args)?)),
        #[cfg(feature = "soapysdr")]
        "soapy" => Ok(Arc::new(soapy::SoapyDevice::make(args)?)),
        other => Err(DeviceError::UnknownDriver(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_error_codes() {
        assert_eq!(StreamError::Timeout.code(), ERR_TIMEOUT);
        assert_eq!(StreamError::Overflow.code(), ERR_OVERFLOW);
        assert_eq!(StreamError::from_code(ERR_OVERFLOW), StreamError::Overflow);
        assert_eq!(StreamError::from_code(-42), StreamError::Code(-42));
    }

    #[test]
    fn test_make_device_unknown_driver() {
        let err = make_device("no-such-driver", &Kwargs::new()).err().unwrap();
        assert!(matches!(err, DeviceError::UnknownDriver(_)));
    }

    #[test]
    fn test_make_device_dummy() {
        let dev = make_device("dummy", &Kwargs::new()).unwrap();
        assert_eq!(dev.hardware_key(), "dummy-key");
    }
}
