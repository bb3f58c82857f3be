// Copyright 2025-2026 CEMAXECUTER LLC

//! Line-oriented record codec for the control path.
//!
//! Records are newline-terminated UTF-8 lines. There is no length prefix,
//! no escaping and no binary in the control path; the framing is cheap to
//! reimplement in any language and easy to watch on the wire. Every RPC
//! request is preceded by a fixed sentinel line so the server can detect a
//! peer that lost framing and drop it rather than misparse forever.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::TcpStream;

use thiserror::Error;

use crate::REQUEST_SENTINEL;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("unexpected end of stream")]
    UnexpectedEof,

    #[error("malformed {kind} record: {text:?}")]
    Parse { kind: &'static str, text: String },

    #[error("lost request synchronisation: got {got:?}")]
    Desync { got: String },
}

pub type Result<T> = std::result::Result<T, RpcError>;

/// Ordered key=value pairs. Order is preserved on encode and decode so
/// driver argument strings survive a round trip byte-for-byte.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Kwargs(Vec<(String, String)>);

impl Kwargs {
    pub fn new() -> Self {
        Kwargs(Vec::new())
    }

    /// Set a key, replacing an existing entry in place or appending.
    pub fn set(&mut self, key: &str, value: &str) {
        if let Some(pair) = self.0.iter_mut().find(|(k, _)| k == key) {
            pair.1 = value.to_string();
        } else {
            self.0.push((key.to_string(), value.to_string()));
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Parse a separator-delimited flat form, e.g. `k1=v1/k2=v2`.
    /// Pieces without `=` are skipped.
    pub fn from_flat(flat: &str, sep: char) -> Self {
        let mut args = Kwargs::new();
        for piece in flat.split(sep) {
            if let Some((k, v)) = piece.split_once('=') {
                if !k.is_empty() {
                    args.set(k, v);
                }
            }
        }
        args
    }

    /// Encode to the separator-delimited flat form.
    pub fn to_flat(&self, sep: char) -> String {
        let mut out = String::new();
        for (k, v) in self.iter() {
            if !out.is_empty() {
                out.push(sep);
            }
            out.push_str(k);
            out.push('=');
            out.push_str(v);
        }
        out
    }
}

impl FromIterator<(String, String)> for Kwargs {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        let mut args = Kwargs::new();
        for (k, v) in iter {
            args.set(&k, &v);
        }
        args
    }
}

/// A min/max/step triple of doubles. Range lists on the wire are triples
/// terminated by one whose step is negative.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Range {
    pub min: f64,
    pub max: f64,
    pub step: f64,
}

impl Range {
    pub fn new(min: f64, max: f64, step: f64) -> Self {
        Range { min, max, step }
    }
}

/// Record codec over a reliable byte stream.
///
/// Writes go straight to the writer so every record line is on the wire
/// when the call returns, matching the line-buffered discipline the
/// protocol expects. Reads are buffered.
pub struct Codec<R, W> {
    reader: R,
    writer: W,
}

/// Codec over a TCP connection: buffered reads on a cloned handle, direct
/// writes on the original.
pub type TcpCodec = Codec<BufReader<TcpStream>, TcpStream>;

impl TcpCodec {
    pub fn from_stream(stream: TcpStream) -> io::Result<Self> {
        let reader = BufReader::new(stream.try_clone()?);
        Ok(Codec {
            reader,
            writer: stream,
        })
    }

    /// True when complete or partial records are already sitting in the
    /// read buffer. A readiness poll on the socket cannot see these, so
    /// dispatch loops must drain them before sleeping again.
    pub fn has_buffered(&self) -> bool {
        !self.reader.buffer().is_empty()
    }

    pub fn peer_stream(&self) -> &TcpStream {
        &self.writer
    }
}

impl<R: BufRead, W: Write> Codec<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Codec { reader, writer }
    }

    // ---- writers ----

    pub fn write_int(&mut self, v: i64) -> Result<()> {
        self.writer.write_all(format!("{}\n", v).as_bytes())?;
        Ok(())
    }

    pub fn write_double(&mut self, v: f64) -> Result<()> {
        self.writer.write_all(format!("{}\n", v).as_bytes())?;
        Ok(())
    }

    /// `s` must not contain a newline; the line is the framing.
    pub fn write_string(&mut self, s: &str) -> Result<()> {
        debug_assert!(!s.contains('\n'), "record strings cannot contain newlines");
        self.writer.write_all(s.as_bytes())?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    pub fn write_kwargs(&mut self, args: &Kwargs) -> Result<()> {
        for (k, v) in args.iter() {
            self.write_string(&format!("{}={}", k, v))?;
        }
        // terminator: an empty key=value pair
        self.write_string("=")
    }

    pub fn write_str_vector(&mut self, items: &[String]) -> Result<()> {
        for item in items {
            self.write_string(item)?;
        }
        self.write_string("")
    }

    pub fn write_range_list(&mut self, ranges: &[Range]) -> Result<()> {
        for r in ranges {
            self.write_double(r.min)?;
            self.write_double(r.max)?;
            self.write_double(r.step)?;
        }
        // terminator triple: negative step
        self.write_double(0.0)?;
        self.write_double(0.0)?;
        self.write_double(-1.0)
    }

    pub fn write_sentinel(&mut self) -> Result<()> {
        self.write_string(REQUEST_SENTINEL)
    }

    // ---- readers ----

    /// Read one line, trimming the trailing newline. EOF yields the empty
    /// string; callers interpret that as a list terminator or connection
    /// loss depending on context.
    pub fn read_string(&mut self) -> Result<String> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line)?;
        if n == 0 {
            return Ok(String::new());
        }
        if line.ends_with('\n') {
            line.pop();
        }
        Ok(line)
    }

    pub fn read_int(&mut self) -> Result<i64> {
        let line = self.read_string()?;
        if line.is_empty() {
            return Err(RpcError::UnexpectedEof);
        }
        line.parse().map_err(|_| RpcError::Parse {
            kind: "integer",
            text: line,
        })
    }

    pub fn read_double(&mut self) -> Result<f64> {
        let line = self.read_string()?;
        if line.is_empty() {
            return Err(RpcError::UnexpectedEof);
        }
        line.parse().map_err(|_| RpcError::Parse {
            kind: "double",
            text: line,
        })
    }

    pub fn read_kwargs(&mut self) -> Result<Kwargs> {
        let mut args = Kwargs::new();
        loop {
            let line = self.read_string()?;
            // "=" or empty (EOF) terminates the map
            if line.is_empty() || line == "=" {
                return Ok(args);
            }
            match line.split_once('=') {
                Some((k, v)) if !k.is_empty() => args.set(k, v),
                _ => log::debug!("ignored invalid kwargs line: {:?}", line),
            }
        }
    }

    pub fn read_str_vector(&mut self) -> Result<Vec<String>> {
        let mut items = Vec::new();
        loop {
            let line = self.read_string()?;
            if line.is_empty() {
                return Ok(items);
            }
            items.push(line);
        }
    }

    pub fn read_range_list(&mut self) -> Result<Vec<Range>> {
        let mut ranges = Vec::new();
        loop {
            let min = self.read_double()?;
            let max = self.read_double()?;
            let step = self.read_double()?;
            if step < 0.0 {
                return Ok(ranges);
            }
            ranges.push(Range { min, max, step });
        }
    }

    /// Consume the request sentinel. Anything else means the peer lost
    /// framing; the caller must drop the connection.
    pub fn expect_sentinel(&mut self) -> Result<()> {
        let line = self.read_string()?;
        if line.is_empty() {
            return Err(RpcError::UnexpectedEof);
        }
        if line != REQUEST_SENTINEL {
            return Err(RpcError::Desync { got: line });
        }
        Ok(())
    }
}

/// Read one `\n`-terminated line from an unbuffered stream, byte by byte.
/// Used where only a single line may be consumed before the stream changes
/// hands (data-socket id exchange, log-level line).
pub fn read_line_unbuffered<S: Read>(stream: &mut S, max_len: usize) -> io::Result<String> {
    let mut out = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte)?;
        if n == 0 {
            break;
        }
        if byte[0] == b'\n' {
            break;
        }
        out.push(byte[0]);
        if out.len() >= max_len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "line too long",
            ));
        }
    }
    String::from_utf8(out).map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "non-UTF8 line"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn codec_over(buf: Vec<u8>) -> Codec<Cursor<Vec<u8>>, Vec<u8>> {
        Codec::new(Cursor::new(buf), Vec::new())
    }

    fn encode<F: FnOnce(&mut Codec<Cursor<Vec<u8>>, Vec<u8>>)>(f: F) -> Vec<u8> {
        let mut c = codec_over(Vec::new());
        f(&mut c);
        c.writer
    }

    #[test]
    fn test_int_round_trip() {
        for v in [0i64, 1, -1, 20655, i64::MAX, i64::MIN] {
            let bytes = encode(|c| c.write_int(v).unwrap());
            let mut c = codec_over(bytes);
            assert_eq!(c.read_int().unwrap(), v);
        }
    }

    #[test]
    fn test_double_round_trip() {
        for v in [0.0f64, -1.5, 2.4e9, 1e-12, 32767.0, f64::MAX] {
            let bytes = encode(|c| c.write_double(v).unwrap());
            let mut c = codec_over(bytes);
            assert_eq!(c.read_double().unwrap(), v);
        }
    }

    #[test]
    fn test_string_round_trip() {
        let bytes = encode(|c| c.write_string("hello world").unwrap());
        assert_eq!(bytes, b"hello world\n");
        let mut c = codec_over(bytes);
        assert_eq!(c.read_string().unwrap(), "hello world");
    }

    #[test]
    fn test_string_eof_is_empty() {
        let mut c = codec_over(Vec::new());
        assert_eq!(c.read_string().unwrap(), "");
    }

    #[test]
    fn test_kwargs_round_trip_preserves_order() {
        let mut args = Kwargs::new();
        args.set("zulu", "1");
        args.set("alpha", "2");
        args.set("mike", "three=four"); // values may contain '='
        let bytes = encode(|c| c.write_kwargs(&args).unwrap());
        let mut c = codec_over(bytes);
        let back = c.read_kwargs().unwrap();
        assert_eq!(back, args);
        let keys: Vec<&str> = back.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, ["zulu", "alpha", "mike"]);
    }

    #[test]
    fn test_kwargs_ignores_invalid_lines() {
        let mut c = codec_over(b"a=1\nnoequals\n=orphan\nb=2\n=\n".to_vec());
        let args = c.read_kwargs().unwrap();
        assert_eq!(args.len(), 2);
        assert_eq!(args.get("a"), Some("1"));
        assert_eq!(args.get("b"), Some("2"));
    }

    #[test]
    fn test_str_vector_round_trip() {
        let items = vec!["CS8".to_string(), "CS16".to_string(), "CF32".to_string()];
        let bytes = encode(|c| c.write_str_vector(&items).unwrap());
        let mut c = codec_over(bytes);
        assert_eq!(c.read_str_vector().unwrap(), items);
    }

    #[test]
    fn test_empty_str_vector() {
        let bytes = encode(|c| c.write_str_vector(&[]).unwrap());
        assert_eq!(bytes, b"\n");
        let mut c = codec_over(bytes);
        assert!(c.read_str_vector().unwrap().is_empty());
    }

    #[test]
    fn test_range_list_round_trip() {
        let ranges = vec![
            Range::new(24e6, 1.8e9, 1.0),
            Range::new(0.0, 61.0, 0.5),
        ];
        let bytes = encode(|c| c.write_range_list(&ranges).unwrap());
        let mut c = codec_over(bytes);
        assert_eq!(c.read_range_list().unwrap(), ranges);
    }

    #[test]
    fn test_sentinel_detects_desync() {
        let mut c = codec_over(b"#RPC\n4\n".to_vec());
        c.expect_sentinel().unwrap();
        assert_eq!(c.read_int().unwrap(), 4);

        let mut c = codec_over(b"4\n".to_vec());
        assert!(matches!(
            c.expect_sentinel(),
            Err(RpcError::Desync { .. })
        ));

        let mut c = codec_over(Vec::new());
        assert!(matches!(
            c.expect_sentinel(),
            Err(RpcError::UnexpectedEof)
        ));
    }

    #[test]
    fn test_int_parse_error() {
        let mut c = codec_over(b"not-a-number\n".to_vec());
        assert!(matches!(c.read_int(), Err(RpcError::Parse { .. })));
    }

    #[test]
    fn test_kwargs_flat_round_trip() {
        let args = Kwargs::from_flat("driver=rtlsdr/serial=0001", '/');
        assert_eq!(args.get("driver"), Some("rtlsdr"));
        assert_eq!(args.get("serial"), Some("0001"));
        assert_eq!(args.to_flat('/'), "driver=rtlsdr/serial=0001");
        assert!(Kwargs::from_flat("", '/').is_empty());
    }

    #[test]
    fn test_read_line_unbuffered() {
        let mut cur = Cursor::new(b"17\nrest".to_vec());
        assert_eq!(read_line_unbuffered(&mut cur, 16).unwrap(), "17");
        // only the first line was consumed
        let mut rest = Vec::new();
        cur.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, b"rest");
    }
}
