// Copyright 2025-2026 CEMAXECUTER LLC

//! Process log handler with fan-out to LOG connections.
//!
//! Records go to stderr through an inner env_logger and, additionally, to
//! every connected LOG client as `level:message` lines. Fan-out runs on
//! its own thread behind a bounded channel: emitting a record never
//! blocks, a full queue drops the record for the remote sinks only.

use std::net::TcpStream;
use std::os::unix::io::RawFd;
use std::sync::OnceLock;
use std::thread;

use crossbeam::channel::{bounded, Receiver, Sender};
use log::{Level, LevelFilter, Log, Metadata, Record};

/// Queue depth for the fan-out thread; sized for bursts, not sustained
/// trace floods.
const LOG_QUEUE_DEPTH: usize = 256;

enum LogMsg {
    Record(Level, String),
    AddSink {
        id: RawFd,
        stream: TcpStream,
        min: Level,
    },
    RemoveSink(RawFd),
}

pub struct RemoteLogger {
    inner: env_logger::Logger,
    tx: Sender<LogMsg>,
}

impl RemoteLogger {
    /// Register a LOG client. Records at `min` or above (by severity) are
    /// forwarded until the sink write fails or the client disconnects.
    pub fn add_sink(&self, id: RawFd, stream: TcpStream, min: Level) {
        let _ = self.tx.send(LogMsg::AddSink { id, stream, min });
    }

    pub fn remove_sink(&self, id: RawFd) {
        let _ = self.tx.send(LogMsg::RemoveSink(id));
    }
}

impl Log for RemoteLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        // remote sinks may want levels the stderr filter suppresses
        self.inner.enabled(metadata) || metadata.level() <= Level::Trace
    }

    fn log(&self, record: &Record) {
        if self.inner.matches(record) {
            self.inner.log(record);
        }
        // a full queue drops the record for remote sinks; emitters never block
        let _ = self
            .tx
            .try_send(LogMsg::Record(record.level(), record.args().to_string()));
    }

    fn flush(&self) {
        self.inner.flush();
    }
}

struct Sink {
    id: RawFd,
    stream: TcpStream,
    min: Level,
}

fn fanout_loop(rx: Receiver<LogMsg>) {
    use std::io::Write;
    let mut sinks: Vec<Sink> = Vec::new();
    for msg in rx.iter() {
        match msg {
            LogMsg::AddSink { id, stream, min } => sinks.push(Sink { id, stream, min }),
            LogMsg::RemoveSink(id) => sinks.retain(|s| s.id != id),
            LogMsg::Record(level, text) => {
                if sinks.is_empty() {
                    continue;
                }
                let line = format!("{}:{}\n", level_name(level), text);
                // drop sinks whose sockets have failed
                sinks.retain_mut(|s| {
                    if level <= s.min {
                        s.stream.write_all(line.as_bytes()).is_ok()
                    } else {
                        true
                    }
                });
            }
        }
    }
}

fn level_name(level: Level) -> &'static str {
    match level {
        Level::Error => "error",
        Level::Warn => "warn",
        Level::Info => "info",
        Level::Debug => "debug",
        Level::Trace => "trace",
    }
}

static LOGGER: OnceLock<&'static RemoteLogger> = OnceLock::new();

/// Install the process log handler. Safe to call more than once; later
/// calls return the handler installed first.
pub fn init() -> &'static RemoteLogger {
    *LOGGER.get_or_init(|| {
        let inner = env_logger::Builder::from_env(
            env_logger::Env::default().default_filter_or("info"),
        )
        .build();
        let (tx, rx) = bounded(LOG_QUEUE_DEPTH);
        thread::Builder::new()
            .name("log-fanout".to_string())
            .spawn(move || fanout_loop(rx))
            .expect("failed to spawn log fan-out thread");
        let logger: &'static RemoteLogger = Box::leak(Box::new(RemoteLogger { inner, tx }));
        // the inner filter still gates stderr; Trace here only opens the
        // gate for remote sinks
        if log::set_logger(logger).is_ok() {
            log::set_max_level(LevelFilter::Trace);
        }
        logger
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader};
    use std::net::TcpListener;
    use std::time::Duration;

    #[test]
    fn test_sink_receives_level_message_lines() {
        let logger = init();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server_side, _) = listener.accept().unwrap();

        logger.add_sink(1000, server_side, Level::Info);
        // give the fan-out thread a beat to register the sink
        thread::sleep(Duration::from_millis(50));

        log::warn!("pipe backlog on stream 5");
        log::trace!("sink-test trace record");
        log::error!("sink-test device read failed");

        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        // other tests may log concurrently; scan until our marker arrives
        let mut reader = BufReader::new(client);
        let mut seen = Vec::new();
        loop {
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            let done = line == "error:sink-test device read failed\n";
            seen.push(line);
            if done {
                break;
            }
        }
        assert!(seen.contains(&"warn:pipe backlog on stream 5\n".to_string()));
        assert!(!seen.iter().any(|l| l.contains("sink-test trace record")));

        logger.remove_sink(1000);
    }
}
