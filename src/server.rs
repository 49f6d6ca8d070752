//! RESP gateway server: accept loop and the per-connection protocol state
//! machine, including the `MULTI`/`EXEC` reply buffering.
//!
//! Commands write replies through a sink and never learn whether they are
//! inside a transaction; the connection loop substitutes the buffered sink
//! while `MULTI` is active and replays the buffer on `EXEC`.

#![deny(missing_docs)]

use color_eyre::Result;
use log::{error, info, warn};

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;

use crate::commands::{command_table, Handler};
use crate::proto::{self, Sink, READ_BUF_SIZE};
use crate::store::Context;

/// Direct sink: writes straight to the client socket.
struct SocketSink<'a>(&'a TcpStream);

impl Sink for SocketSink<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        let mut stream = self.0;
        stream.write_all(buf)
    }
}

/// Buffered sink: collects reply fragments, in insertion order, for replay
/// on `EXEC`.
struct BufferSink<'a>(&'a mut Vec<Vec<u8>>);

impl Sink for BufferSink<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        self.0.push(buf.to_vec());
        Ok(())
    }
}

/// RESP frontend: listen address plus the store context and command table
/// shared read-only by every connection.
pub struct Server {
    ctx: Arc<Context>,
    handlers: Arc<HashMap<&'static str, Handler>>,
    listen: String,
}

impl Server {
    /// Create a server around a connected store context.
    pub fn new(ctx: Context, listen: String) -> Self {
        Server {
            ctx: Arc::new(ctx),
            handlers: Arc::new(command_table()),
            listen,
        }
    }

    /// Accept connections forever, one thread per client. Each connection
    /// cleans up after itself by closing its socket on any exit path.
    pub fn start(self) -> Result<()> {
        let listener = TcpListener::bind(&self.listen)?;
        info!("listening on {}", self.listen);
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    if let Err(err) = stream.set_nodelay(true) {
                        warn!("set_nodelay: {err}");
                    }
                    let ctx = Arc::clone(&self.ctx);
                    let handlers = Arc::clone(&self.handlers);
                    thread::spawn(move || handle_connection(stream, &ctx, &handlers));
                }
                Err(err) => error!("accept: {err}"),
            }
        }
        Ok(())
    }
}

/// Per-connection loop: read, parse, dispatch, reply.
///
/// Protocol failures, unknown commands, arity mismatches and handler errors
/// all send a best-effort error frame and terminate the connection; missing
/// records and other semantic empties are in-band replies and do not.
fn handle_connection(
    mut stream: TcpStream,
    ctx: &Context,
    handlers: &HashMap<&'static str, Handler>,
) {
    info!("client connected");
    let mut buf = [0u8; READ_BUF_SIZE];
    let mut multi_buffer: Vec<Vec<u8>> = Vec::new();
    let mut multi_counter = 0usize;
    let mut multi_mode = false;
    loop {
        let l = match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(l) => l,
            Err(err) => {
                warn!("read: {err}");
                break;
            }
        };
        if &buf[..l] == b"QUIT\r\n" {
            break;
        }
        let args = match proto::parse_multibulk(&mut stream, &buf[..l]) {
            Ok(args) if !args.is_empty() => args,
            _ => {
                let _ = proto::write_err(&mut SocketSink(&stream), "unable to parse");
                break;
            }
        };
        let cmd = String::from_utf8_lossy(&args[0]).into_owned();
        if cmd == "MULTI" {
            multi_counter = 0;
            multi_buffer.clear();
            if proto::write_line(&mut SocketSink(&stream), "+OK").is_err() {
                break;
            }
            multi_mode = true;
        } else if cmd == "EXEC" {
            if !multi_mode {
                let _ = proto::write_err(&mut SocketSink(&stream), "Not in multi");
                break;
            }
            multi_mode = false;
            if exec_replay(&mut SocketSink(&stream), multi_counter, &mut multi_buffer).is_err() {
                break;
            }
            multi_counter = 0;
        } else {
            let rest = &args[1..];
            let handler = match handlers.get(cmd.as_str()) {
                Some(h) => h,
                None => {
                    let _ = proto::write_err(
                        &mut SocketSink(&stream),
                        &format!("unknown command '{cmd}'"),
                    );
                    break;
                }
            };
            if handler.arity > rest.len() {
                let _ = proto::write_err(
                    &mut SocketSink(&stream),
                    &format!("wrong number of params for '{}': {}", cmd, rest.len()),
                );
                break;
            }
            let result = if multi_mode {
                (handler.func)(&mut BufferSink(&mut multi_buffer), ctx, rest)
            } else {
                (handler.func)(&mut SocketSink(&stream), ctx, rest)
            };
            if let Err(err) = result {
                let _ = proto::write_err(&mut SocketSink(&stream), &format!("Error '{err}'"));
                break;
            }
            if multi_mode {
                multi_counter += 1;
                if proto::write_line(&mut SocketSink(&stream), "+QUEUED").is_err() {
                    break;
                }
            }
        }
    }
    info!("client disconnected");
}

/// Commit a transaction on the direct sink: the `*<N>` header, then every
/// buffered fragment in insertion order.
fn exec_replay(direct: &mut dyn Sink, count: usize, fragments: &mut Vec<Vec<u8>>) -> io::Result<()> {
    if let Err(err) = proto::write_line(direct, &format!("*{count}")) {
        warn!("write: {err}");
        return Err(err);
    }
    for fragment in fragments.drain(..) {
        if let Err(err) = direct.write(&fragment) {
            warn!("write: {err}");
            return Err(err);
        }
    }
    Ok(())
}
