use std::{io::ErrorKind, time::Duration};

use log::{debug, warn};
use scara_protocol::code;
use tokio::{
    net::TcpStream,
    time::{sleep, timeout_at, Instant},
};

const FIRST_RETRY: Duration = Duration::from_millis(10);
const MAX_RETRY: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("couldn't connect to {addr} within {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },
    #[error("timed out after sending {sent} of {total} bytes")]
    SendTimeout { sent: usize, total: usize },
    #[error("failed after sending {sent} of {total} bytes")]
    SendFailed {
        sent: usize,
        total: usize,
        #[source]
        source: std::io::Error,
    },
    #[error("timed out waiting for data")]
    ReceiveTimeout,
    #[error("the connection was closed")]
    Closed,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// For failed sends, how many bytes made it out.
    pub fn bytes_sent(&self) -> Option<usize> {
        match self {
            TransportError::SendTimeout { sent, .. } | TransportError::SendFailed { sent, .. } => {
                Some(*sent)
            }
            _ => None,
        }
    }
}

/// A byte stream to the device.
///
/// Nothing here blocks for longer than the caller says it may.
pub struct Transport {
    stream: TcpStream,
    rx: Vec<u8>,
    closed: bool,
    last_tx: Instant,
}

impl Transport {
    /// Connects to `addr`, retrying with a growing delay for as long as the
    /// device refuses the connection and `timeout` hasn't passed.
    pub async fn connect(addr: &str, timeout: Duration) -> Result<Transport, TransportError> {
        let deadline = Instant::now() + timeout;
        let mut delay = FIRST_RETRY;
        loop {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    debug!("connected to {addr}");
                    return Ok(Transport::from_stream(stream));
                }
                Err(e) if e.kind() == ErrorKind::ConnectionRefused => {
                    if Instant::now() + delay > deadline {
                        return Err(TransportError::ConnectTimeout {
                            addr: addr.to_owned(),
                            timeout,
                        });
                    }
                    warn!("connection error: {e}, retrying in {delay:?}...");
                    sleep(delay).await;
                    delay = (delay * 2).min(MAX_RETRY);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub fn from_stream(stream: TcpStream) -> Transport {
        if let Err(e) = stream.set_nodelay(true) {
            warn!("couldn't disable Nagle's algorithm: {e}");
        }
        Transport {
            stream,
            rx: Vec::new(),
            closed: false,
            last_tx: Instant::now(),
        }
    }

    /// How long it has been since we last sent something.
    pub fn idle_for(&self) -> Duration {
        self.last_tx.elapsed()
    }

    /// Sends `bytes` one at a time, giving up if that takes longer than
    /// `timeout`. On failure, the error says how many bytes were sent.
    pub async fn send(&mut self, bytes: &[u8], timeout: Duration) -> Result<(), TransportError> {
        let deadline = Instant::now() + timeout;
        let total = bytes.len();
        for (sent, &b) in bytes.iter().enumerate() {
            if Instant::now() >= deadline {
                return Err(TransportError::SendTimeout { sent, total });
            }
            loop {
                match self.stream.try_write(&[b]) {
                    Ok(0) => {
                        return Err(TransportError::SendFailed {
                            sent,
                            total,
                            source: ErrorKind::WriteZero.into(),
                        })
                    }
                    Ok(_) => break,
                    Err(e) if e.kind() == ErrorKind::WouldBlock => {
                        match timeout_at(deadline, self.stream.writable()).await {
                            Err(_) => return Err(TransportError::SendTimeout { sent, total }),
                            Ok(Err(source)) => {
                                return Err(TransportError::SendFailed {
                                    sent,
                                    total,
                                    source,
                                })
                            }
                            Ok(Ok(())) => {}
                        }
                    }
                    Err(source) => {
                        return Err(TransportError::SendFailed {
                            sent,
                            total,
                            source,
                        })
                    }
                }
            }
        }
        self.last_tx = Instant::now();
        Ok(())
    }

    /// Sends a no-op if nothing has been sent for `interval`. Returns whether
    /// it sent one.
    pub async fn keep_alive_if_idle(
        &mut self,
        interval: Duration,
        timeout: Duration,
    ) -> Result<bool, TransportError> {
        if self.idle_for() < interval {
            return Ok(false);
        }
        self.send(&[code::NOOP], timeout).await?;
        Ok(true)
    }

    /// Moves whatever has arrived into the receive buffer, without waiting.
    /// Returns the number of new bytes.
    pub fn fill(&mut self) -> Result<usize, TransportError> {
        let mut buf = [0u8; 1024];
        let mut total = 0;
        while !self.closed {
            match self.stream.try_read(&mut buf) {
                Ok(0) => {
                    debug!("the device closed the connection");
                    self.closed = true;
                }
                Ok(n) => {
                    self.rx.extend_from_slice(&buf[..n]);
                    total += n;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }
        if total == 0 && self.closed && self.rx.is_empty() {
            return Err(TransportError::Closed);
        }
        Ok(total)
    }

    async fn fill_before(&mut self, deadline: Instant) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        match timeout_at(deadline, self.stream.readable()).await {
            Err(_) => Err(TransportError::ReceiveTimeout),
            Ok(r) => {
                r?;
                self.fill()?;
                Ok(())
            }
        }
    }

    /// Everything that has arrived so far.
    ///
    /// Once the device has closed the connection and everything it sent has
    /// been drained, this fails with [`TransportError::Closed`].
    pub fn drain_incoming(&mut self) -> Result<Vec<u8>, TransportError> {
        self.fill()?;
        Ok(std::mem::take(&mut self.rx))
    }

    /// Reads up to and including the next `marker` byte.
    pub async fn read_until(
        &mut self,
        marker: u8,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(pos) = self.rx.iter().position(|&b| b == marker) {
                return Ok(self.rx.drain(..=pos).collect());
            }
            self.fill_before(deadline).await?;
        }
    }

    /// Waits for `marker`, throwing away anything that comes before it.
    pub async fn wait_for(&mut self, marker: u8, timeout: Duration) -> Result<(), TransportError> {
        self.wait_for_any(&[marker], timeout).await.map(|_| ())
    }

    /// Waits for any of `markers`, throwing away anything that comes before
    /// it. Returns the marker that arrived.
    pub async fn wait_for_any(
        &mut self,
        markers: &[u8],
        timeout: Duration,
    ) -> Result<u8, TransportError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(pos) = self.rx.iter().position(|b| markers.contains(b)) {
                let marker = self.rx[pos];
                self.rx.drain(..=pos);
                return Ok(marker);
            }
            self.rx.clear();
            self.fill_before(deadline).await?;
        }
    }

    pub async fn close(mut self) -> Result<(), TransportError> {
        use tokio::io::AsyncWriteExt as _;

        self.stream.shutdown().await?;
        Ok(())
    }
}
