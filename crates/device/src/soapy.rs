// Copyright 2025-2026 CEMAXECUTER LLC

//! Hardware backend over the SoapySDR C API.
//!
//! This is the production device: whatever SoapySDR can open (RTL-SDR,
//! HackRF, USRP, ...) becomes remotable. Built only with the `soapysdr`
//! feature; `build.rs` links `libSoapySDR`.

use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_double, c_int, c_longlong, c_void};
use std::sync::Arc;

use ns_rpc::{Direction, Kwargs, Range, SampleFormat};

use crate::{DeviceError, DeviceResult, SdrDevice, SdrStream, StreamError};

type RawDevice = c_void;
type RawStream = c_void;

const SOAPY_SDR_TX: c_int = 0;
const SOAPY_SDR_RX: c_int = 1;

#[repr(C)]
struct SoapyKwargs {
    size: usize,
    keys: *mut *mut c_char,
    vals: *mut *mut c_char,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct SoapyRange {
    minimum: c_double,
    maximum: c_double,
    step: c_double,
}

extern "C" {
    fn SoapySDRDevice_make(args: *const SoapyKwargs) -> *mut RawDevice;
    fn SoapySDRDevice_unmake(device: *mut RawDevice) -> c_int;
    fn SoapySDRDevice_lastError() -> *const c_char;

    fn SoapySDRDevice_getDriverKey(dev: *const RawDevice) -> *mut c_char;
    fn SoapySDRDevice_getHardwareKey(dev: *const RawDevice) -> *mut c_char;
    fn SoapySDRDevice_getHardwareInfo(dev: *const RawDevice) -> SoapyKwargs;

    fn SoapySDRDevice_setFrontendMapping(
        dev: *mut RawDevice,
        direction: c_int,
        mapping: *const c_char,
    ) -> c_int;
    fn SoapySDRDevice_getFrontendMapping(dev: *const RawDevice, direction: c_int) -> *mut c_char;
    fn SoapySDRDevice_getNumChannels(dev: *const RawDevice, direction: c_int) -> usize;
    fn SoapySDRDevice_getChannelInfo(
        dev: *const RawDevice,
        direction: c_int,
        channel: usize,
    ) -> SoapyKwargs;
    fn SoapySDRDevice_getFullDuplex(
        dev: *const RawDevice,
        direction: c_int,
        channel: usize,
    ) -> bool;

    fn SoapySDRDevice_getStreamFormats(
        dev: *const RawDevice,
        direction: c_int,
        channel: usize,
        length: *mut usize,
    ) -> *mut *mut c_char;
    fn SoapySDRDevice_getNativeStreamFormat(
        dev: *const RawDevice,
        direction: c_int,
        channel: usize,
        full_scale: *mut c_double,
    ) -> *mut c_char;

    fn SoapySDRDevice_setupStream(
        dev: *mut RawDevice,
        direction: c_int,
        format: *const c_char,
        channels: *const usize,
        num_chans: usize,
        args: *const SoapyKwargs,
    ) -> *mut RawStream;
    fn SoapySDRDevice_closeStream(dev: *mut RawDevice, stream: *mut RawStream) -> c_int;
    fn SoapySDRDevice_getStreamMTU(dev: *const RawDevice, stream: *mut RawStream) -> usize;
    fn SoapySDRDevice_activateStream(
        dev: *mut RawDevice,
        stream: *mut RawStream,
        flags: c_int,
        time_ns: c_longlong,
        num_elems: usize,
    ) -> c_int;
    fn SoapySDRDevice_deactivateStream(
        dev: *mut RawDevice,
        stream: *mut RawStream,
        flags: c_int,
        time_ns: c_longlong,
    ) -> c_int;
    fn SoapySDRDevice_readStream(
        dev: *mut RawDevice,
        stream: *mut RawStream,
        buffs: *const *mut c_void,
        num_elems: usize,
        flags: *mut c_int,
        time_ns: *mut c_longlong,
        timeout_us: libc::c_long,
    ) -> c_int;
    fn SoapySDRDevice_writeStream(
        dev: *mut RawDevice,
        stream: *mut RawStream,
        buffs: *const *const c_void,
        num_elems: usize,
        flags: *mut c_int,
        time_ns: c_longlong,
        timeout_us: libc::c_long,
    ) -> c_int;

    fn SoapySDRDevice_listAntennas(
        dev: *const RawDevice,
        direction: c_int,
        channel: usize,
        length: *mut usize,
    ) -> *mut *mut c_char;
    fn SoapySDRDevice_setAntenna(
        dev: *mut RawDevice,
        direction: c_int,
        channel: usize,
        name: *const c_char,
    ) -> c_int;
    fn SoapySDRDevice_getAntenna(
        dev: *const RawDevice,
        direction: c_int,
        channel: usize,
    ) -> *mut c_char;

    fn SoapySDRDevice_listGains(
        dev: *const RawDevice,
        direction: c_int,
        channel: usize,
        length: *mut usize,
    ) -> *mut *mut c_char;
    fn SoapySDRDevice_hasGainMode(dev: *const RawDevice, direction: c_int, channel: usize)
        -> bool;
    fn SoapySDRDevice_setGainMode(
        dev: *mut RawDevice,
        direction: c_int,
        channel: usize,
        automatic: bool,
    ) -> c_int;
    fn SoapySDRDevice_getGainMode(dev: *const RawDevice, direction: c_int, channel: usize)
        -> bool;
    fn SoapySDRDevice_setGain(
        dev: *mut RawDevice,
        direction: c_int,
        channel: usize,
        value: c_double,
    ) -> c_int;
    fn SoapySDRDevice_setGainElement(
        dev: *mut RawDevice,
        direction: c_int,
        channel: usize,
        name: *const c_char,
        value: c_double,
    ) -> c_int;
    fn SoapySDRDevice_getGain(dev: *const RawDevice, direction: c_int, channel: usize)
        -> c_double;
    fn SoapySDRDevice_getGainElement(
        dev: *const RawDevice,
        direction: c_int,
        channel: usize,
        name: *const c_char,
    ) -> c_double;
    fn SoapySDRDevice_getGainRange(
        dev: *const RawDevice,
        direction: c_int,
        channel: usize,
    ) -> SoapyRange;
    fn SoapySDRDevice_getGainElementRange(
        dev: *const RawDevice,
        direction: c_int,
        channel: usize,
        name: *const c_char,
    ) -> SoapyRange;

    fn SoapySDRDevice_setFrequency(
        dev: *mut RawDevice,
        direction: c_int,
        channel: usize,
        frequency: c_double,
        args: *const SoapyKwargs,
    ) -> c_int;
    fn SoapySDRDevice_setFrequencyComponent(
        dev: *mut RawDevice,
        direction: c_int,
        channel: usize,
        name: *const c_char,
        frequency: c_double,
        args: *const SoapyKwargs,
    ) -> c_int;
    fn SoapySDRDevice_getFrequency(
        dev: *const RawDevice,
        direction: c_int,
        channel: usize,
    ) -> c_double;
    fn SoapySDRDevice_getFrequencyComponent(
        dev: *const RawDevice,
        direction: c_int,
        channel: usize,
        name: *const c_char,
    ) -> c_double;
    fn SoapySDRDevice_listFrequencies(
        dev: *const RawDevice,
        direction: c_int,
        channel: usize,
        length: *mut usize,
    ) -> *mut *mut c_char;
    fn SoapySDRDevice_getFrequencyRange(
        dev: *const RawDevice,
        direction: c_int,
        channel: usize,
        length: *mut usize,
    ) -> *mut SoapyRange;
    fn SoapySDRDevice_getFrequencyRangeComponent(
        dev: *const RawDevice,
        direction: c_int,
        channel: usize,
        name: *const c_char,
        length: *mut usize,
    ) -> *mut SoapyRange;

    fn SoapySDRDevice_setSampleRate(
        dev: *mut RawDevice,
        direction: c_int,
        channel: usize,
        rate: c_double,
    ) -> c_int;
    fn SoapySDRDevice_getSampleRate(
        dev: *const RawDevice,
        direction: c_int,
        channel: usize,
    ) -> c_double;
    fn SoapySDRDevice_getSampleRateRange(
        dev: *const RawDevice,
        direction: c_int,
        channel: usize,
        length: *mut usize,
    ) -> *mut SoapyRange;

    fn SoapySDRKwargs_clear(args: *mut SoapyKwargs);
    fn SoapySDRStrings_clear(strings: *mut *mut c_char, length: usize);
}

fn last_error() -> String {
    unsafe {
        let p = SoapySDRDevice_lastError();
        if p.is_null() {
            "unknown error".to_string()
        } else {
            CStr::from_ptr(p).to_string_lossy().to_string()
        }
    }
}

fn dir_flag(direction: Direction) -> c_int {
    match direction {
        Direction::Tx => SOAPY_SDR_TX,
        Direction::Rx => SOAPY_SDR_RX,
    }
}

/// Take ownership of a heap string returned by the C API.
fn take_string(p: *mut c_char) -> String {
    if p.is_null() {
        return String::new();
    }
    let s = unsafe { CStr::from_ptr(p).to_string_lossy().to_string() };
    unsafe { libc::free(p as *mut c_void) };
    s
}

/// Take ownership of a string list returned by the C API.
fn take_string_list(list: *mut *mut c_char, length: usize) -> Vec<String> {
    if list.is_null() {
        return Vec::new();
    }
    let mut out = Vec::with_capacity(length);
    for i in 0..length {
        let p = unsafe { *list.add(i) };
        if !p.is_null() {
            out.push(unsafe { CStr::from_ptr(p).to_string_lossy().to_string() });
        }
    }
    unsafe { SoapySDRStrings_clear(list, length) };
    out
}

/// Take ownership of a kwargs value returned by the C API.
fn take_kwargs(mut raw: SoapyKwargs) -> Kwargs {
    let mut out = Kwargs::new();
    for i in 0..raw.size {
        let key = unsafe { CStr::from_ptr(*raw.keys.add(i)).to_string_lossy().to_string() };
        let val = unsafe { CStr::from_ptr(*raw.vals.add(i)).to_string_lossy().to_string() };
        out.set(&key, &val);
    }
    unsafe { SoapySDRKwargs_clear(&mut raw) };
    out
}

/// Take ownership of a range list returned by the C API.
fn take_range_list(list: *mut SoapyRange, length: usize) -> Vec<Range> {
    if list.is_null() {
        return Vec::new();
    }
    let mut out = Vec::with_capacity(length);
    for i in 0..length {
        let r = unsafe { *list.add(i) };
        out.push(Range::new(r.minimum, r.maximum, r.step));
    }
    unsafe { libc::free(list as *mut c_void) };
    out
}

/// Kwargs marshalled for a call into the C API. The CStrings own the
/// storage; the pointer arrays and the raw struct borrow it.
struct CKwargs {
    _keys: Vec<CString>,
    _vals: Vec<CString>,
    key_ptrs: Vec<*mut c_char>,
    val_ptrs: Vec<*mut c_char>,
}

impl CKwargs {
    fn new(args: &Kwargs) -> Self {
        let keys: Vec<CString> = args
            .iter()
            .filter_map(|(k, _)| CString::new(k).ok())
            .collect();
        let vals: Vec<CString> = args
            .iter()
            .filter_map(|(_, v)| CString::new(v).ok())
            .collect();
        let key_ptrs = keys.iter().map(|s| s.as_ptr() as *mut c_char).collect();
        let val_ptrs = vals.iter().map(|s| s.as_ptr() as *mut c_char).collect();
        CKwargs {
            _keys: keys,
            _vals: vals,
            key_ptrs,
            val_ptrs,
        }
    }

    fn raw(&mut self) -> SoapyKwargs {
        SoapyKwargs {
            size: self.key_ptrs.len().min(self.val_ptrs.len()),
            keys: self.key_ptrs.as_mut_ptr(),
            vals: self.val_ptrs.as_mut_ptr(),
        }
    }
}

fn check(status: c_int, what: &'static str) -> DeviceResult<()> {
    if status == 0 {
        Ok(())
    } else {
        log::error!("{}: {} ({})", what, last_error(), status);
        Err(DeviceError::Code(status))
    }
}

pub struct SoapyDevice {
    dev: *mut RawDevice,
}

// The raw handle is only ever used through the C API, which permits
// concurrent disjoint operations on one device.
unsafe impl Send for SoapyDevice {}
unsafe impl Sync for SoapyDevice {}

impl SoapyDevice {
    pub fn make(args: &Kwargs) -> DeviceResult<Self> {
        let mut cargs = CKwargs::new(args);
        let raw = cargs.raw();
        let dev = unsafe { SoapySDRDevice_make(&raw) };
        if dev.is_null() {
            return Err(DeviceError::Driver(format!(
                "SoapySDR make failed: {}",
                last_error()
            )));
        }
        Ok(SoapyDevice { dev })
    }
}

impl Drop for SoapyDevice {
    fn drop(&mut self) {
        unsafe { SoapySDRDevice_unmake(self.dev) };
    }
}

impl SdrDevice for SoapyDevice {
    fn driver_key(&self) -> String {
        take_string(unsafe { SoapySDRDevice_getDriverKey(self.dev) })
    }

    fn hardware_key(&self) -> String {
        take_string(unsafe { SoapySDRDevice_getHardwareKey(self.dev) })
    }

    fn hardware_info(&self) -> Kwargs {
        take_kwargs(unsafe { SoapySDRDevice_getHardwareInfo(self.dev) })
    }

    fn set_frontend_mapping(&self, direction: Direction, mapping: &str) -> DeviceResult<()> {
        let mapping = CString::new(mapping)
            .map_err(|_| DeviceError::Driver("mapping contains NUL".to_string()))?;
        check(
            unsafe {
                SoapySDRDevice_setFrontendMapping(self.dev, dir_flag(direction), mapping.as_ptr())
            },
            "setFrontendMapping",
        )
    }

    fn frontend_mapping(&self, direction: Direction) -> String {
        take_string(unsafe { SoapySDRDevice_getFrontendMapping(self.dev, dir_flag(direction)) })
    }

    fn num_channels(&self, direction: Direction) -> usize {
        unsafe { SoapySDRDevice_getNumChannels(self.dev, dir_flag(direction)) }
    }

    fn channel_info(&self, direction: Direction, channel: usize) -> Kwargs {
        take_kwargs(unsafe { SoapySDRDevice_getChannelInfo(self.dev, dir_flag(direction), channel) })
    }

    fn full_duplex(&self, direction: Direction, channel: usize) -> bool {
        unsafe { SoapySDRDevice_getFullDuplex(self.dev, dir_flag(direction), channel) }
    }

    fn stream_formats(&self, direction: Direction, channel: usize) -> Vec<String> {
        let mut length = 0usize;
        let list = unsafe {
            SoapySDRDevice_getStreamFormats(self.dev, dir_flag(direction), channel, &mut length)
        };
        take_string_list(list, length)
    }

    fn native_stream_format(&self, direction: Direction, channel: usize) -> (SampleFormat, f64) {
        let mut full_scale = 0.0f64;
        let name = take_string(unsafe {
            SoapySDRDevice_getNativeStreamFormat(
                self.dev,
                dir_flag(direction),
                channel,
                &mut full_scale,
            )
        });
        match SampleFormat::from_name(&name) {
            Some(fmt) => (fmt, full_scale),
            None => {
                log::warn!(
                    "device native format {:?} is not transportable, using CS16",
                    name
                );
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
        let fmt = CString::new(format.name()).expect("format names are ASCII");
        let mut cargs = CKwargs::new(args);
        let raw_args = cargs.raw();
        let stream = unsafe {
            SoapySDRDevice_setupStream(
                self.dev,
                dir_flag(direction),
                fmt.as_ptr(),
                channels.as_ptr(),
                channels.len(),
                &raw_args,
            )
        };
        if stream.is_null() {
            return Err(DeviceError::Driver(format!(
                "SoapySDR setupStream failed: {}",
                last_error()
            )));
        }
        let mtu = unsafe { SoapySDRDevice_getStreamMTU(self.dev, stream) };
        let mtu = if mtu == 0 { 65536 } else { mtu };
        Ok(Arc::new(SoapyStream {
            dev: self.dev,
            stream,
            mtu,
            num_channels: channels.len(),
        }))
    }

    fn list_antennas(&self, direction: Direction, channel: usize) -> Vec<String> {
        let mut length = 0usize;
        let list = unsafe {
            SoapySDRDevice_listAntennas(self.dev, dir_flag(direction), channel, &mut length)
        };
        take_string_list(list, length)
    }

    fn set_antenna(&self, direction: Direction, channel: usize, name: &str) -> DeviceResult<()> {
        let name = CString::new(name)
            .map_err(|_| DeviceError::Driver("antenna name contains NUL".to_string()))?;
        check(
            unsafe {
                SoapySDRDevice_setAntenna(self.dev, dir_flag(direction), channel, name.as_ptr())
            },
            "setAntenna",
        )
    }

    fn antenna(&self, direction: Direction, channel: usize) -> String {
        take_string(unsafe { SoapySDRDevice_getAntenna(self.dev, dir_flag(direction), channel) })
    }

    fn list_gains(&self, direction: Direction, channel: usize) -> Vec<String> {
        let mut length = 0usize;
        let list =
            unsafe { SoapySDRDevice_listGains(self.dev, dir_flag(direction), channel, &mut length) };
        take_string_list(list, length)
    }

    fn has_gain_mode(&self, direction: Direction, channel: usize) -> bool {
        unsafe { SoapySDRDevice_hasGainMode(self.dev, dir_flag(direction), channel) }
    }

    fn set_gain_mode(
        &self,
        direction: Direction,
        channel: usize,
        automatic: bool,
    ) -> DeviceResult<()> {
        check(
            unsafe {
                SoapySDRDevice_setGainMode(self.dev, dir_flag(direction), channel, automatic)
            },
            "setGainMode",
        )
    }

    fn gain_mode(&self, direction: Direction, channel: usize) -> bool {
        unsafe { SoapySDRDevice_getGainMode(self.dev, dir_flag(direction), channel) }
    }

    fn set_gain(&self, direction: Direction, channel: usize, value: f64) -> DeviceResult<()> {
        check(
            unsafe { SoapySDRDevice_setGain(self.dev, dir_flag(direction), channel, value) },
            "setGain",
        )
    }

    fn set_gain_named(
        &self,
        direction: Direction,
        channel: usize,
        name: &str,
        value: f64,
    ) -> DeviceResult<()> {
        let name = CString::new(name)
            .map_err(|_| DeviceError::Driver("gain name contains NUL".to_string()))?;
        check(
            unsafe {
                SoapySDRDevice_setGainElement(
                    self.dev,
                    dir_flag(direction),
                    channel,
                    name.as_ptr(),
                    value,
                )
            },
            "setGainElement",
        )
    }

    fn gain(&self, direction: Direction, channel: usize) -> f64 {
        unsafe { SoapySDRDevice_getGain(self.dev, dir_flag(direction), channel) }
    }

    fn gain_named(&self, direction: Direction, channel: usize, name: &str) -> f64 {
        let Ok(name) = CString::new(name) else {
            return 0.0;
        };
        unsafe {
            SoapySDRDevice_getGainElement(self.dev, dir_flag(direction), channel, name.as_ptr())
        }
    }

    fn gain_range(&self, direction: Direction, channel: usize) -> Range {
        let r = unsafe { SoapySDRDevice_getGainRange(self.dev, dir_flag(direction), channel) };
        Range::new(r.minimum, r.maximum, r.step)
    }

    fn gain_range_named(&self, direction: Direction, channel: usize, name: &str) -> Range {
        let Ok(name) = CString::new(name) else {
            return Range::new(0.0, 0.0, 0.0);
        };
        let r = unsafe {
            SoapySDRDevice_getGainElementRange(self.dev, dir_flag(direction), channel, name.as_ptr())
        };
        Range::new(r.minimum, r.maximum, r.step)
    }

    fn set_frequency(
        &self,
        direction: Direction,
        channel: usize,
        frequency: f64,
        args: &Kwargs,
    ) -> DeviceResult<()> {
        let mut cargs = CKwargs::new(args);
        let raw = cargs.raw();
        check(
            unsafe {
                SoapySDRDevice_setFrequency(self.dev, dir_flag(direction), channel, frequency, &raw)
            },
            "setFrequency",
        )
    }

    fn set_frequency_component(
        &self,
        direction: Direction,
        channel: usize,
        name: &str,
        frequency: f64,
        args: &Kwargs,
    ) -> DeviceResult<()> {
        let name = CString::new(name)
            .map_err(|_| DeviceError::Driver("frequency name contains NUL".to_string()))?;
        let mut cargs = CKwargs::new(args);
        let raw = cargs.raw();
        check(
            unsafe {
                SoapySDRDevice_setFrequencyComponent(
                    self.dev,
                    dir_flag(direction),
                    channel,
                    name.as_ptr(),
                    frequency,
                    &raw,
                )
            },
            "setFrequencyComponent",
        )
    }

    fn frequency(&self, direction: Direction, channel: usize) -> f64 {
        unsafe { SoapySDRDevice_getFrequency(self.dev, dir_flag(direction), channel) }
    }

    fn frequency_component(&self, direction: Direction, channel: usize, name: &str) -> f64 {
        let Ok(name) = CString::new(name) else {
            return 0.0;
        };
        unsafe {
            SoapySDRDevice_getFrequencyComponent(
                self.dev,
                dir_flag(direction),
                channel,
                name.as_ptr(),
            )
        }
    }

    fn list_frequencies(&self, direction: Direction, channel: usize) -> Vec<String> {
        let mut length = 0usize;
        let list = unsafe {
            SoapySDRDevice_listFrequencies(self.dev, dir_flag(direction), channel, &mut length)
        };
        take_string_list(list, length)
    }

    fn frequency_range(&self, direction: Direction, channel: usize) -> Vec<Range> {
        let mut length = 0usize;
        let list = unsafe {
            SoapySDRDevice_getFrequencyRange(self.dev, dir_flag(direction), channel, &mut length)
        };
        take_range_list(list, length)
    }

    fn frequency_range_component(
        &self,
        direction: Direction,
        channel: usize,
        name: &str,
    ) -> Vec<Range> {
        let Ok(name) = CString::new(name) else {
            return Vec::new();
        };
        let mut length = 0usize;
        let list = unsafe {
            SoapySDRDevice_getFrequencyRangeComponent(
                self.dev,
                dir_flag(direction),
                channel,
                name.as_ptr(),
                &mut length,
            )
        };
        take_range_list(list, length)
    }

    fn set_sample_rate(&self, direction: Direction, channel: usize, rate: f64) -> DeviceResult<()> {
        check(
            unsafe { SoapySDRDevice_setSampleRate(self.dev, dir_flag(direction), channel, rate) },
            "setSampleRate",
        )
    }

    fn sample_rate(&self, direction: Direction, channel: usize) -> f64 {
        unsafe { SoapySDRDevice_getSampleRate(self.dev, dir_flag(direction), channel) }
    }

    fn sample_rate_range(&self, direction: Direction, channel: usize) -> Vec<Range> {
        let mut length = 0usize;
        let list = unsafe {
            SoapySDRDevice_getSampleRateRange(self.dev, dir_flag(direction), channel, &mut length)
        };
        take_range_list(list, length)
    }
}

struct SoapyStream {
    dev: *mut RawDevice,
    stream: *mut RawStream,
    mtu: usize,
    num_channels: usize,
}

unsafe impl Send for SoapyStream {}
unsafe impl Sync for SoapyStream {}

impl Drop for SoapyStream {
    fn drop(&mut self) {
        unsafe {
            SoapySDRDevice_deactivateStream(self.dev, self.stream, 0, 0);
            SoapySDRDevice_closeStream(self.dev, self.stream);
        }
    }
}

impl SdrStream for SoapyStream {
    fn mtu(&self) -> usize {
        self.mtu
    }

    fn activate(&self) -> DeviceResult<()> {
        check(
            unsafe { SoapySDRDevice_activateStream(self.dev, self.stream, 0, 0, 0) },
            "activateStream",
        )
    }

    fn deactivate(&self) -> DeviceResult<()> {
        check(
            unsafe { SoapySDRDevice_deactivateStream(self.dev, self.stream, 0, 0) },
            "deactivateStream",
        )
    }

    fn read(
        &self,
        buffs: &mut [&mut [u8]],
        num_elems: usize,
        timeout_us: i64,
    ) -> Result<usize, StreamError> {
        debug_assert_eq!(buffs.len(), self.num_channels);
        let mut ptrs: Vec<*mut c_void> =
            buffs.iter_mut().map(|b| b.as_mut_ptr() as *mut c_void).collect();
        let mut flags: c_int = 0;
        let mut time_ns: c_longlong = 0;
        let ret = unsafe {
            SoapySDRDevice_readStream(
                self.dev,
                self.stream,
                ptrs.as_mut_ptr(),
                num_elems,
                &mut flags,
                &mut time_ns,
                timeout_us as libc::c_long,
            )
        };
        if ret < 0 {
            Err(StreamError::from_code(ret))
        } else {
            Ok(ret as usize)
        }
    }

    fn write(
        &self,
        buffs: &[&[u8]],
        num_elems: usize,
        timeout_us: i64,
    ) -> Result<usize, StreamError> {
        debug_assert_eq!(buffs.len(), self.num_channels);
        let ptrs: Vec<*const c_void> =
            buffs.iter().map(|b| b.as_ptr() as *const c_void).collect();
        let mut flags: c_int = 0;
        let ret = unsafe {
            SoapySDRDevice_writeStream(
                self.dev,
                self.stream,
                ptrs.as_ptr(),
                num_elems,
                &mut flags,
                0,
                timeout_us as libc::c_long,
            )
        };
        if ret < 0 {
            Err(StreamError::from_code(ret))
        } else {
            Ok(ret as usize)
        }
    }
}
