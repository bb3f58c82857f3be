// Copyright 2025-2026 CEMAXECUTER LLC

//! Wire protocol for remoting an SDR device driver over TCP.
//!
//! The control path is text: newline-terminated records carrying integers,
//! doubles, strings, string vectors and key=value maps. Sample payloads run
//! on separate data sockets as opaque interleaved frames and never touch
//! this crate beyond the format catalogue.

pub mod codec;
pub mod format;

pub use codec::{Codec, Kwargs, Range, RpcError, TcpCodec};
pub use format::SampleFormat;

/// Default server port, 0x50AF.
pub const DEFAULT_PORT: u16 = 20655;

/// Reply sent for a request tag the server does not recognise.
/// The connection stays open; the client can resynchronise on this value.
pub const UNKNOWN_TAG_ERROR: i64 = -1000;

/// Fixed line preceding every RPC request. A request read that does not
/// start with this line means the peer has lost framing and the connection
/// is dropped.
pub const REQUEST_SENTINEL: &str = "#RPC";

/// First line on any freshly accepted socket: a single ASCII digit plus
/// newline selecting what the connection is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionType {
    /// RPC connection; the driver-load arguments follow immediately.
    RpcLoad = 0,
    /// Data connection carrying samples server-to-client (an RX stream).
    DataSend = 1,
    /// Data connection carrying samples client-to-server (a TX stream).
    DataRecv = 2,
    /// Log connection; the minimum level line follows immediately.
    Log = 3,
}

impl ConnectionType {
    /// Decode the typing byte (the ASCII digit itself).
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            b'0' => Some(ConnectionType::RpcLoad),
            b'1' => Some(ConnectionType::DataSend),
            b'2' => Some(ConnectionType::DataRecv),
            b'3' => Some(ConnectionType::Log),
            _ => None,
        }
    }

    pub fn type_line(self) -> &'static str {
        match self {
            ConnectionType::RpcLoad => "0\n",
            ConnectionType::DataSend => "1\n",
            ConnectionType::DataRecv => "2\n",
            ConnectionType::Log => "3\n",
        }
    }
}

/// Stream direction, numbered like the device API it fronts (TX=0, RX=1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Tx = 0,
    Rx = 1,
}

impl Direction {
    pub fn to_wire(self) -> i64 {
        self as i64
    }

    pub fn from_wire(v: i64) -> Option<Self> {
        match v {
            0 => Some(Direction::Tx),
            1 => Some(Direction::Rx),
            _ => None,
        }
    }
}

/// Request tags. Values continue the connection-typing space so no tag
/// collides with a typing digit on a confused peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum RpcTag {
    // identification
    GetHardwareKey = 4,
    GetHardwareInfo = 5,
    // channels
    SetFrontendMapping = 6,
    GetFrontendMapping = 7,
    GetNumChannels = 8,
    GetChannelInfo = 9,
    GetFullDuplex = 10,
    // stream metadata
    GetStreamFormats = 11,
    GetNativeStreamFormat = 12,
    GetStreamArgsInfo = 13,
    // stream lifecycle
    SetupStream = 14,
    CloseStream = 15,
    GetStreamMtu = 16,
    ActivateStream = 17,
    DeactivateStream = 18,
    // antenna
    ListAntennas = 19,
    SetAntenna = 20,
    GetAntenna = 21,
    // gain
    ListGains = 22,
    HasGainMode = 23,
    SetGainMode = 24,
    GetGainMode = 25,
    SetGain = 26,
    SetGainNamed = 27,
    GetGain = 28,
    GetGainNamed = 29,
    GetGainRange = 30,
    GetGainRangeNamed = 31,
    // frequency
    SetFrequency = 32,
    SetFrequencyNamed = 33,
    GetFrequency = 34,
    GetFrequencyNamed = 35,
    ListFrequencies = 36,
    GetFrequencyRange = 37,
    GetFrequencyRangeNamed = 38,
    GetFrequencyArgsInfo = 39,
    // sample rate
    SetSampleRate = 40,
    GetSampleRate = 41,
    GetSampleRateRange = 42,
    // connection lifecycle
    DropRpc = 43,
}

impl RpcTag {
    pub fn from_wire(v: i64) -> Option<Self> {
        use RpcTag::*;
        Some(match v {
            4 => GetHardwareKey,
            5 => GetHardwareInfo,
            6 => SetFrontendMapping,
            7 => GetFrontendMapping,
            8 => GetNumChannels,
            9 => GetChannelInfo,
            10 => GetFullDuplex,
            11 => GetStreamFormats,
            12 => GetNativeStreamFormat,
            13 => GetStreamArgsInfo,
            14 => SetupStream,
            15 => CloseStream,
            16 => GetStreamMtu,
            17 => ActivateStream,
            18 => DeactivateStream,
            19 => ListAntennas,
            20 => SetAntenna,
            21 => GetAntenna,
            22 => ListGains,
            23 => HasGainMode,
            24 => SetGainMode,
            25 => GetGainMode,
            26 => SetGain,
            27 => SetGainNamed,
            28 => GetGain,
            29 => GetGainNamed,
            30 => GetGainRange,
            31 => GetGainRangeNamed,
            32 => SetFrequency,
            33 => SetFrequencyNamed,
            34 => GetFrequency,
            35 => GetFrequencyNamed,
            36 => ListFrequencies,
            37 => GetFrequencyRange,
            38 => GetFrequencyRangeNamed,
            39 => GetFrequencyArgsInfo,
            40 => SetSampleRate,
            41 => GetSampleRate,
            42 => GetSampleRateRange,
            43 => DropRpc,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_type_round_trip() {
        for ty in [
            ConnectionType::RpcLoad,
            ConnectionType::DataSend,
            ConnectionType::DataRecv,
            ConnectionType::Log,
        ] {
            let line = ty.type_line();
            assert_eq!(line.len(), 2);
            assert_eq!(ConnectionType::from_byte(line.as_bytes()[0]), Some(ty));
        }
        assert_eq!(ConnectionType::from_byte(b'4'), None);
        assert_eq!(ConnectionType::from_byte(b'x'), None);
    }

    #[test]
    fn test_tag_round_trip() {
        for v in 4..=43i64 {
            let tag = RpcTag::from_wire(v).expect("tag value should decode");
            assert_eq!(tag as i64, v);
        }
        assert_eq!(RpcTag::from_wire(3), None);
        assert_eq!(RpcTag::from_wire(44), None);
        assert_eq!(RpcTag::from_wire(-1), None);
    }

    #[test]
    fn test_direction_wire_values() {
        assert_eq!(Direction::Tx.to_wire(), 0);
        assert_eq!(Direction::Rx.to_wire(), 1);
        assert_eq!(Direction::from_wire(1), Some(Direction::Rx));
        assert_eq!(Direction::from_wire(2), None);
    }
}
