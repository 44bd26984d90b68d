// Client Module - Keeps a connection to the LED server and pumps encoded events into it
use anyhow::{Context, Result};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Notify};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::protocol::{self, Event};

const DIAL_TIMEOUT: Duration = Duration::from_secs(1);
const REDIAL_DELAY: Duration = Duration::from_secs(1);

/// Receives messages the server sends back
pub trait EventProcessor: Send + Sync {
    fn process(&self, event: Event);
}

/// Logs the server greeting and ignores everything else
pub struct LogProcessor;

impl EventProcessor for LogProcessor {
    fn process(&self, event: Event) {
        match event {
            Event::Connected(c) => info!(
                leds = c.leds,
                strip = %c.strip_type,
                gpio = c.gpio_pin,
                brightness = c.brightness,
                "Server strip"
            ),
            other => debug!("Ignoring {} from server", other.name()),
        }
    }
}

struct Link {
    epoch: u64,
    writer: FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct TransportClient {
    address: String,
    reload: watch::Receiver<Vec<u8>>,
    processor: Arc<dyn EventProcessor>,
    // Taken out for each send and put back after; never held across I/O
    link: Mutex<Option<Link>>,
    next_epoch: AtomicU64,
    // Epoch of the connection currently considered alive, 0 when offline
    live: AtomicU64,
    dropped: Notify,
    redial_delay: Duration,
}

impl TransportClient {
    pub fn new(address: String, reload: watch::Receiver<Vec<u8>>, processor: Arc<dyn EventProcessor>) -> Self {
        TransportClient {
            address,
            reload,
            processor,
            link: Mutex::new(None),
            next_epoch: AtomicU64::new(1),
            live: AtomicU64::new(0),
            dropped: Notify::new(),
            redial_delay: REDIAL_DELAY,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.live.load(Ordering::Acquire) != 0
    }

    /// Dial, send the current Reload, then make the connection available to `send`
    async fn connect(&self) -> Result<(u64, FramedRead<OwnedReadHalf, LengthDelimitedCodec>)> {
        let stream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&self.address))
            .await
            .with_context(|| format!("Timed out connecting to {}", self.address))?
            .with_context(|| format!("Failed to connect to {}", self.address))?;
        stream.set_nodelay(true)?;

        let (read_half, write_half) = stream.into_split();
        let mut writer = FramedWrite::new(write_half, protocol::codec());
        let reader = FramedRead::new(read_half, protocol::codec());

        let reload = self.reload.borrow().clone();
        writer.send(Bytes::from(reload)).await.context("Failed to send reload")?;

        let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
        *lock(&self.link) = Some(Link { epoch, writer });
        self.live.store(epoch, Ordering::Release);
        Ok((epoch, reader))
    }

    fn disconnect(&self, epoch: u64) {
        let _ = self.live.compare_exchange(epoch, 0, Ordering::AcqRel, Ordering::Acquire);
        let mut slot = lock(&self.link);
        if slot.as_ref().map(|l| l.epoch) == Some(epoch) {
            *slot = None;
        }
    }

    /// Read server messages until the connection drops
    async fn read_loop(
        &self,
        epoch: u64,
        mut reader: FramedRead<OwnedReadHalf, LengthDelimitedCodec>,
        cancel: &CancellationToken,
    ) {
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.dropped.notified() => {
                    if self.live.load(Ordering::Acquire) != epoch {
                        break;
                    }
                    continue;
                }
                frame = reader.next() => frame,
            };
            match frame {
                Some(Ok(bytes)) => match protocol::decode(&bytes) {
                    Ok(event) => self.processor.process(event),
                    Err(e) => warn!("Dropping server message: {}", e),
                },
                Some(Err(e)) => {
                    warn!("Connection read failed: {}", e);
                    break;
                }
                None => {
                    info!("Server closed the connection");
                    break;
                }
            }
        }
        self.disconnect(epoch);
    }

    /// Connection supervisor: dial, serve, redial after a fixed delay
    pub async fn run(&self, cancel: CancellationToken) {
        while !cancel.is_cancelled() {
            match self.connect().await {
                Ok((epoch, reader)) => {
                    info!("Connected to {}", self.address);
                    self.read_loop(epoch, reader, &cancel).await;
                }
                Err(e) => debug!("{:#}", e),
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.redial_delay) => {}
            }
        }
        let epoch = self.live.load(Ordering::Acquire);
        self.disconnect(epoch);
    }

    /// Write one encoded event. Dropped when there is no connection; false if not delivered.
    pub async fn send(&self, bytes: Vec<u8>) -> bool {
        let link = lock(&self.link).take();
        let Some(mut link) = link else {
            trace!("Not connected, dropping event");
            return false;
        };

        match link.writer.send(Bytes::from(bytes)).await {
            Ok(()) => {
                let mut slot = lock(&self.link);
                if slot.is_none() && self.live.load(Ordering::Acquire) == link.epoch {
                    *slot = Some(link);
                }
                true
            }
            Err(e) => {
                warn!("Connection write failed: {}", e);
                if self.live.compare_exchange(link.epoch, 0, Ordering::AcqRel, Ordering::Acquire).is_ok() {
                    self.dropped.notify_one();
                }
                false
            }
        }
    }

    /// Forward everything from `events` until it closes or `cancel` fires
    pub async fn pump(&self, mut events: mpsc::Receiver<Vec<u8>>, cancel: CancellationToken) {
        loop {
            let bytes = tokio::select! {
                _ = cancel.cancelled() => break,
                bytes = events.recv() => bytes,
            };
            match bytes {
                Some(bytes) => {
                    self.send(bytes).await;
                }
                None => break,
            }
        }
    }
}
