use std::{
    io::{ErrorKind, Read, Write},
    net::TcpStream,
    time::Instant,
};

use crate::{Clock, Link, LinkError};

/// Microseconds since the clock was made.
#[derive(Clone, Copy, Debug)]
pub struct StdClock {
    start: Instant,
}

impl StdClock {
    pub fn new() -> Self {
        StdClock {
            start: Instant::now(),
        }
    }
}

impl Default for StdClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for StdClock {
    fn now_us(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }
}

fn classify(e: std::io::Error) -> LinkError<std::io::Error> {
    match e.kind() {
        ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => {
            LinkError::Closed
        }
        _ => LinkError::Io(e),
    }
}

/// The stream must be in non-blocking mode.
impl Link for TcpStream {
    type Error = std::io::Error;

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, LinkError<std::io::Error>> {
        match Read::read(self, buf) {
            Ok(0) if !buf.is_empty() => Err(LinkError::Closed),
            Ok(n) => Ok(n),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => Ok(0),
            Err(e) => Err(classify(e)),
        }
    }

    fn write(&mut self, mut bytes: &[u8]) -> Result<(), LinkError<std::io::Error>> {
        while !bytes.is_empty() {
            match Write::write(self, bytes) {
                Ok(0) => return Err(LinkError::Closed),
                Ok(n) => bytes = &bytes[n..],
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                    std::thread::yield_now()
                }
                Err(e) => return Err(classify(e)),
            }
        }
        Ok(())
    }
}
