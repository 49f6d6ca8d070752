//! Wire dialect of the gateway: reply frames and multi-bulk request parsing.
//!
//! Requests arrive as framed arrays of length-prefixed byte buffers:
//!
//! ```text
//! *<N>\r\n
//! $<L1>\r\n<bytes1>\r\n
//! ...
//! $<LN>\r\n<bytesN>\r\n
//! ```
//!
//! Replies are simple strings (`+OK`), errors (`-ERR ...`), integers (`:1`),
//! bulk strings (`$3\r\nfoo\r\n`), null bulks (`$-1`) and arrays of bulks.

#![deny(missing_docs)]

use color_eyre::eyre::bail;
use color_eyre::Result;

use std::error::Error;
use std::fmt;
use std::io::{self, Read};

use aerospike::{Record, Value};
use log::warn;

/// Size of the per-connection read buffer. A request's framing must fit in
/// one read of this size; only argument payloads may spill over.
pub const READ_BUF_SIZE: usize = 1024;

/// Failure to decode a client request.
#[derive(Debug, Clone)]
pub struct ProtocolError(String);

impl ProtocolError {
    /// Create an error from a description of the malformed input.
    pub fn new<S: AsRef<str>>(s: S) -> Self {
        ProtocolError(s.as_ref().to_string())
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "protocol error: {}", self.0)?;
        Ok(())
    }
}

impl Error for ProtocolError {}

/// Destination for reply bytes.
///
/// Every codec write goes through a sink so that a transaction buffer can be
/// substituted for the socket without the command handlers knowing.
pub trait Sink {
    /// Write the whole buffer or fail.
    fn write(&mut self, buf: &[u8]) -> io::Result<()>;
}

/// Write `s` followed by CRLF.
pub fn write_line(w: &mut dyn Sink, s: &str) -> io::Result<()> {
    let mut out = Vec::with_capacity(s.len() + 2);
    out.extend_from_slice(s.as_bytes());
    out.extend_from_slice(b"\r\n");
    w.write(&out)
}

/// Write an error frame.
///
/// The frame is terminated by a single LF, not CRLF. Existing clients depend
/// on this byte-exactly.
pub fn write_err(w: &mut dyn Sink, s: &str) -> io::Result<()> {
    warn!("client error: {s}");
    let mut out = Vec::with_capacity(s.len() + 6);
    out.extend_from_slice(b"-ERR ");
    out.extend_from_slice(s.as_bytes());
    out.push(b'\n');
    w.write(&out)
}

/// Write a bulk string frame: `$<len>`, the payload, CRLF.
pub fn write_bulk(w: &mut dyn Sink, buf: &[u8]) -> io::Result<()> {
    write_line(w, &format!("${}", buf.len()))?;
    w.write(buf)?;
    w.write(b"\r\n")
}

/// Write an array header followed by each element through [`write_value`].
pub fn write_array(w: &mut dyn Sink, items: &[Value]) -> io::Result<()> {
    write_line(w, &format!("*{}", items.len()))?;
    for item in items {
        write_value(w, item)?;
    }
    Ok(())
}

/// Write a store value, dispatching on its runtime kind: integers become the
/// bulk string of their decimal rendering, strings and blobs are written
/// verbatim, anything else is the null bulk.
pub fn write_value(w: &mut dyn Sink, v: &Value) -> io::Result<()> {
    match v {
        Value::Int(n) => write_bulk(w, n.to_string().as_bytes()),
        Value::UInt(n) => write_bulk(w, n.to_string().as_bytes()),
        Value::String(s) => write_bulk(w, s.as_bytes()),
        Value::Blob(b) => write_bulk(w, b),
        _ => write_line(w, "$-1"),
    }
}

/// Common read reply: the named bin of `rec`, or the literal `nil_line` when
/// the record or the bin is absent.
pub fn write_bin(
    w: &mut dyn Sink,
    rec: Option<&Record>,
    bin_name: &str,
    nil_line: &str,
) -> io::Result<()> {
    match rec.and_then(|r| r.bins.get(bin_name)) {
        Some(v) => write_value(w, v),
        None => write_line(w, nil_line),
    }
}

/// Integer read reply: `:<n>` for the named bin, `:0` when the record or the
/// bin is absent or not an integer.
pub fn write_bin_int(w: &mut dyn Sink, rec: Option<&Record>, bin_name: &str) -> io::Result<()> {
    match rec.and_then(|r| r.bins.get(bin_name)) {
        Some(Value::Int(n)) => write_line(w, &format!(":{n}")),
        Some(Value::UInt(n)) => write_line(w, &format!(":{n}")),
        _ => write_line(w, ":0"),
    }
}

/// Find the next CRLF-terminated line in `buf` starting at `index`.
/// Returns the line (without the terminator) and the index just past it.
fn read_line(buf: &[u8], index: usize) -> Option<(&[u8], usize)> {
    for i in index..buf.len().saturating_sub(1) {
        if buf[i] == b'\r' && buf[i + 1] == b'\n' {
            return Some((&buf[index..i], i + 2));
        }
    }
    None
}

/// Parse the decimal payload of a prefixed line such as `*3` or `$12`.
fn prefixed_int(line: &[u8], prefix: u8) -> Option<i64> {
    if line.first() != Some(&prefix) {
        return None;
    }
    std::str::from_utf8(&line[1..]).ok()?.parse().ok()
}

/// Decode one multi-bulk request from the bytes of a single socket read.
///
/// `buf` is the filled portion of the read buffer. Argument payloads that
/// were only partially received are completed with further blocking reads
/// from `conn` (the slow path); the request's framing lines themselves must
/// be fully contained in `buf`.
///
/// Any deviation from the framing (missing prefix, bad length, short read)
/// is a parse failure; the caller replies with a protocol error and closes.
pub fn parse_multibulk<R: Read>(conn: &mut R, buf: &[u8]) -> Result<Vec<Vec<u8>>> {
    let (line, mut next) = match read_line(buf, 0) {
        Some(r) => r,
        None => bail!(ProtocolError::new("request missing header line")),
    };
    let count = match prefixed_int(line, b'*') {
        Some(n) if n >= 0 => n as usize,
        _ => bail!(ProtocolError::new("request is not a multi-bulk array")),
    };
    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        let (line, after) = match read_line(buf, next) {
            Some(r) => r,
            None => bail!(ProtocolError::new("truncated argument header")),
        };
        next = after;
        let len = match prefixed_int(line, b'$') {
            Some(n) if n >= 0 => n as usize,
            _ => bail!(ProtocolError::new("argument missing length prefix")),
        };
        if next + len > buf.len() {
            // Payload spans reads: copy what arrived, then block until the
            // rest (and the trailing CRLF) is in.
            let mut local = vec![0u8; len + 2];
            let have = buf.len() - next;
            local[..have].copy_from_slice(&buf[next..]);
            conn.read_exact(&mut local[have..])
                .map_err(|_| ProtocolError::new("short read inside argument payload"))?;
            local.truncate(len);
            args.push(local);
            next = buf.len();
        } else {
            args.push(buf[next..next + len].to_vec());
            next += len + 2;
        }
    }
    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Out(Vec<u8>);

    impl Sink for Out {
        fn write(&mut self, buf: &[u8]) -> io::Result<()> {
            self.0.extend_from_slice(buf);
            Ok(())
        }
    }

    fn capture(f: impl FnOnce(&mut dyn Sink) -> io::Result<()>) -> Vec<u8> {
        let mut out = Out(Vec::new());
        f(&mut out).expect("sink write");
        out.0
    }

    /// Reference encoder for the request framing the parser accepts.
    fn encode_request(args: &[&[u8]]) -> Vec<u8> {
        let mut out = format!("*{}\r\n", args.len()).into_bytes();
        for arg in args {
            out.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
            out.extend_from_slice(arg);
            out.extend_from_slice(b"\r\n");
        }
        out
    }

    #[test]
    fn test_error_frame_single_lf() {
        let out = capture(|w| write_err(w, "unable to parse"));
        assert_eq!(out, b"-ERR unable to parse\n");
    }

    #[test]
    fn test_simple_and_integer_lines() {
        assert_eq!(capture(|w| write_line(w, "+OK")), b"+OK\r\n");
        assert_eq!(capture(|w| write_line(w, ":42")), b":42\r\n");
    }

    #[test]
    fn test_bulk_frame() {
        assert_eq!(capture(|w| write_bulk(w, b"bar")), b"$3\r\nbar\r\n");
        assert_eq!(capture(|w| write_bulk(w, b"")), b"$0\r\n\r\n");
    }

    #[test]
    fn test_write_value_dispatch() {
        assert_eq!(
            capture(|w| write_value(w, &Value::Int(123))),
            b"$3\r\n123\r\n"
        );
        assert_eq!(
            capture(|w| write_value(w, &Value::Blob(b"xy".to_vec()))),
            b"$2\r\nxy\r\n"
        );
        assert_eq!(
            capture(|w| write_value(w, &Value::String("s".to_string()))),
            b"$1\r\ns\r\n"
        );
        assert_eq!(capture(|w| write_value(w, &Value::Nil)), b"$-1\r\n");
    }

    #[test]
    fn test_write_array() {
        let items = vec![Value::Blob(b"x".to_vec()), Value::Blob(b"y".to_vec())];
        assert_eq!(
            capture(|w| write_array(w, &items)),
            b"*2\r\n$1\r\nx\r\n$1\r\ny\r\n"
        );
    }

    #[test]
    fn test_write_bin_absent() {
        assert_eq!(capture(|w| write_bin(w, None, "r", "$-1")), b"$-1\r\n");
        assert_eq!(capture(|w| write_bin_int(w, None, "r_size")), b":0\r\n");
    }

    #[test]
    fn test_parse_fast_path() {
        let req = encode_request(&[b"SET", b"foo", b"bar"]);
        let args = parse_multibulk(&mut io::empty(), &req).expect("parse");
        assert_eq!(args, vec![b"SET".to_vec(), b"foo".to_vec(), b"bar".to_vec()]);
    }

    #[test]
    fn test_parse_roundtrip() {
        let cases: &[&[&[u8]]] = &[
            &[b"GET", b"k"],
            &[b"HMSET", b"h", b"f1", b"v1", b"f2", b"v2"],
            &[b"SET", b"k", b""],
        ];
        for args in cases {
            let encoded = encode_request(args);
            let parsed = parse_multibulk(&mut io::empty(), &encoded).expect("parse");
            let expect: Vec<Vec<u8>> = args.iter().map(|a| a.to_vec()).collect();
            assert_eq!(parsed, expect);
            // re-encoding what was accepted yields the accepted bytes
            let slices: Vec<&[u8]> = parsed.iter().map(|a| a.as_slice()).collect();
            assert_eq!(encode_request(&slices), encoded);
        }
    }

    #[test]
    fn test_parse_slow_path_payload_spans_reads() {
        let payload = vec![b'a'; 3000];
        let mut req = encode_request(&[b"SET", b"big", &payload]);
        // pretend only the first kilobyte arrived in the initial read
        let rest = req.split_off(READ_BUF_SIZE);
        let args = parse_multibulk(&mut rest.as_slice(), &req).expect("parse");
        assert_eq!(args[0], b"SET");
        assert_eq!(args[1], b"big");
        assert_eq!(args[2], payload);
    }

    #[test]
    fn test_parse_rejects_bad_header() {
        assert!(parse_multibulk(&mut io::empty(), b"PING\r\n").is_err());
        assert!(parse_multibulk(&mut io::empty(), b"*x\r\n").is_err());
        assert!(parse_multibulk(&mut io::empty(), b"*1\r\nfoo\r\n").is_err());
    }

    #[test]
    fn test_parse_rejects_truncated_payload() {
        // argument claims 10 bytes but the stream ends after 3
        let req = b"*1\r\n$10\r\nabc".to_vec();
        assert!(parse_multibulk(&mut io::empty(), &req).is_err());
    }

    #[test]
    fn test_parse_rejects_missing_count() {
        assert!(parse_multibulk(&mut io::empty(), b"").is_err());
        assert!(parse_multibulk(&mut io::empty(), b"*2\r\n$3\r\nGET\r\n").is_err());
    }
}
