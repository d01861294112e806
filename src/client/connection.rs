// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use bytes::{Buf, BytesMut};
use tokio::{
    sync::Mutex,
    time::{MissedTickBehavior, interval},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{
    cfg::config::Config,
    client::common::best_effort_cleanup,
    driver::{Driver, RawTransport},
    error::{Error, Result},
    frame::{self, FrameType},
    noise,
    poller::Poller,
    utils,
};

/// State guarded by the read-buffer lock: decrypted application bytes, the
/// raw decrypt scratch, and the tail of a partially consumed data frame.
#[derive(Debug, Default)]
struct ReadState {
    buf: BytesMut,
    scratch: BytesMut,
    read_remain: usize,
}

/// Token-outbox cleanup, armed on the responder side only. Fires once,
/// after the first successful unseal proves the dialer can talk on the
/// data channel.
struct TokenCleanup {
    driver: Arc<dyn Driver>,
    done: AtomicBool,
}

/// The live endpoint of an encrypted byte stream.
///
/// Reads and writes are safe to call concurrently from independent tasks.
/// Bytes handed to a single `write` appear contiguously and in order at the
/// peer; interleaving between concurrent writers is unspecified.
pub struct Connection {
    transport: Box<dyn RawTransport>,
    noise: Mutex<noise::Session>,
    conn_id: String,
    is_initiator: bool,

    /// Largest application payload per data frame.
    mtu: usize,
    /// Largest plaintext handed to one seal, bounded by the raw unit size
    /// and the Noise message limit.
    max_chunk: usize,

    /// Frames pending encryption.
    wbuf: Mutex<BytesMut>,
    rd: Mutex<ReadState>,
    /// Serializes flush across writers, keep-alive, and close. Lock order
    /// is flush -> write-buffer, never the reverse.
    flush_gate: Mutex<()>,

    closed: AtomicBool,
    closed_read: AtomicBool,
    closed_write: AtomicBool,

    /// Epoch nanoseconds of the last successful raw write.
    last_active: AtomicU64,
    /// Epoch nanoseconds of the last parsed frame of any type.
    peer_last_seen: AtomicU64,

    /// Epoch-nanosecond deadlines; zero disables the side.
    read_deadline: AtomicU64,
    write_deadline: AtomicU64,

    poller: Mutex<Poller>,
    cancel: CancellationToken,
    ping_interval: Duration,
    token_cleanup: Option<TokenCleanup>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("conn_id", &self.conn_id)
            .field("initiator", &self.is_initiator)
            .field("mtu", &self.mtu)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Builds a connection over a completed Noise session and starts the
    /// keep-alive task. `token_cleanup` is set on the responder side so the
    /// token-outbox entry can be reclaimed early.
    pub(crate) fn new(
        conn_id: String,
        transport: Box<dyn RawTransport>,
        session: noise::Session,
        cfg: &Config,
        cancel: CancellationToken,
        token_cleanup: Option<Arc<dyn Driver>>,
    ) -> Result<Arc<Self>> {
        if !session.is_established() {
            return Err(Error::HandshakeIncomplete);
        }

        let max_chunk = transport
            .max_raw_size()
            .saturating_sub(noise::OVERHEAD)
            .min(noise::MAX_PLAINTEXT);
        let mtu = max_chunk.saturating_sub(frame::HEADER_LEN);
        if mtu == 0 {
            return Err(Error::InvalidConfig(format!(
                "raw unit size {} leaves no room for a frame",
                transport.max_raw_size()
            )));
        }

        let now = utils::now_nanos();
        let is_initiator = session.is_initiator();
        let conn = Arc::new(Self {
            transport,
            noise: Mutex::new(session),
            conn_id,
            is_initiator,
            mtu,
            max_chunk,
            wbuf: Mutex::new(BytesMut::new()),
            rd: Mutex::new(ReadState::default()),
            flush_gate: Mutex::new(()),
            closed: AtomicBool::new(false),
            closed_read: AtomicBool::new(false),
            closed_write: AtomicBool::new(false),
            last_active: AtomicU64::new(now),
            peer_last_seen: AtomicU64::new(now),
            read_deadline: AtomicU64::new(0),
            write_deadline: AtomicU64::new(0),
            poller: Mutex::new(Poller::new(cfg.fast_poll, cfg.data_poll)),
            cancel,
            ping_interval: cfg.ping_interval,
            token_cleanup: token_cleanup.map(|driver| TokenCleanup {
                driver,
                done: AtomicBool::new(false),
            }),
        });

        if conn.ping_interval > Duration::ZERO {
            conn.spawn_keepalive();
        }

        Ok(conn)
    }

    pub fn conn_id(&self) -> &str {
        &self.conn_id
    }

    pub fn is_initiator(&self) -> bool {
        self.is_initiator
    }

    /// Largest payload that fits one data frame in one raw unit.
    pub fn mtu(&self) -> usize {
        self.mtu
    }

    pub fn local_addr(&self) -> String {
        self.transport.local_addr()
    }

    pub fn remote_addr(&self) -> String {
        self.transport.remote_addr()
    }

    /// How long ago the peer was last heard from (any frame type).
    pub fn peer_idle(&self) -> Duration {
        let seen = self.peer_last_seen.load(Ordering::Acquire);
        Duration::from_nanos(utils::now_nanos().saturating_sub(seen))
    }

    pub(crate) fn is_defunct(&self) -> bool {
        self.closed.load(Ordering::Acquire) && self.closed_read.load(Ordering::Acquire)
    }

    // ─── deadlines ──────────────────────────────────────────────────────

    /// Applies to both directions; `None` disables.
    pub fn set_deadline(&self, deadline: Option<Instant>) {
        self.set_read_deadline(deadline);
        self.set_write_deadline(deadline);
    }

    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.read_deadline
            .store(deadline.map_or(0, utils::instant_nanos), Ordering::Release);
    }

    pub fn set_write_deadline(&self, deadline: Option<Instant>) {
        self.write_deadline
            .store(deadline.map_or(0, utils::instant_nanos), Ordering::Release);
    }

    fn check_deadline(cell: &AtomicU64) -> Result<()> {
        let d = cell.load(Ordering::Acquire);
        if d != 0 && utils::now_nanos() >= d {
            return Err(Error::DeadlineExceeded);
        }
        Ok(())
    }

    // ─── write path ─────────────────────────────────────────────────────

    /// Buffers `data` as mtu-bounded data frames and flushes. Returns once
    /// everything has been accepted by the raw transport.
    pub async fn write(&self, data: &[u8]) -> Result<usize> {
        if self.closed.load(Ordering::Acquire) || self.closed_write.load(Ordering::Acquire) {
            return Err(Error::ClosedPipe);
        }
        Self::check_deadline(&self.write_deadline)?;

        {
            let mut wb = self.wbuf.lock().await;
            for chunk in data.chunks(self.mtu) {
                frame::build(&mut wb, FrameType::Data, chunk);
            }
        }
        self.flush().await?;
        Ok(data.len())
    }

    /// Drains the write buffer into sealed raw units, rotating the
    /// outbound resource when the transport asks for it. Serialized across
    /// all callers; on error the remaining buffered bytes stay buffered.
    async fn flush(&self) -> Result<()> {
        let _serial = self.flush_gate.lock().await;

        loop {
            let chunk = {
                let mut wb = self.wbuf.lock().await;
                if wb.is_empty() {
                    return Ok(());
                }

                if let Some(rot) = self.transport.rotator()
                    && rot.should_rotate()
                {
                    drop(wb);
                    // Built on a private scratch so the main write buffer
                    // is untouched if the rotation write fails.
                    let mut plain = BytesMut::with_capacity(frame::HEADER_LEN);
                    frame::build(&mut plain, FrameType::Rotate, &[]);
                    let sealed = self.seal(&plain).await?;
                    self.transport.write_raw(&self.cancel, sealed).await?;
                    rot.rotate_tx(&self.cancel).await?;
                    debug!(conn_id = %self.conn_id, "rotated outbound resource");
                    continue;
                }

                let take = wb.len().min(self.max_chunk);
                wb.split_to(take)
            };

            let sealed = self.seal(&chunk).await?;
            self.transport.write_raw(&self.cancel, sealed).await?;
            self.last_active.store(utils::now_nanos(), Ordering::Release);
        }
    }

    async fn seal(&self, plain: &[u8]) -> Result<bytes::Bytes> {
        let mut out = BytesMut::with_capacity(plain.len() + noise::OVERHEAD);
        self.noise.lock().await.seal(&mut out, plain)?;
        Ok(out.freeze())
    }

    // ─── read path ──────────────────────────────────────────────────────

    /// Copies decrypted application bytes into `buf`. Returns `Ok(0)` at
    /// end of stream (peer FIN consumed).
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(Error::Closed);
            }
            if self.closed_read.load(Ordering::Acquire) {
                return Ok(0);
            }
            Self::check_deadline(&self.read_deadline)?;

            {
                let mut rd = self.rd.lock().await;

                if rd.read_remain > 0 {
                    let n = rd.read_remain.min(buf.len()).min(rd.buf.len());
                    buf[..n].copy_from_slice(&rd.buf[..n]);
                    rd.buf.advance(n);
                    rd.read_remain -= n;
                    return Ok(n);
                }

                while let Some((len, ty)) = frame::peek(&rd.buf) {
                    if rd.buf.len() < frame::HEADER_LEN + len {
                        break;
                    }
                    self.peer_last_seen
                        .store(utils::now_nanos(), Ordering::Release);

                    match FrameType::from_u8(ty) {
                        Some(FrameType::Data) if len > 0 => {
                            rd.buf.advance(frame::HEADER_LEN);
                            let n = len.min(buf.len());
                            buf[..n].copy_from_slice(&rd.buf[..n]);
                            rd.buf.advance(n);
                            rd.read_remain = len - n;
                            return Ok(n);
                        },
                        Some(FrameType::Data) => {
                            rd.buf.advance(frame::HEADER_LEN);
                        },
                        Some(FrameType::Ping) => {
                            rd.buf.advance(frame::HEADER_LEN + len);
                            trace!(conn_id = %self.conn_id, "keep-alive from peer");
                        },
                        Some(FrameType::Fin) => {
                            rd.buf.advance(frame::HEADER_LEN + len);
                            self.closed_read.store(true, Ordering::Release);
                            debug!(conn_id = %self.conn_id, "peer closed its write side");
                            return Ok(0);
                        },
                        Some(FrameType::Rotate) => {
                            rd.buf.advance(frame::HEADER_LEN + len);
                            if let Some(rot) = self.transport.rotator() {
                                rot.rotate_rx()?;
                                debug!(conn_id = %self.conn_id, "followed peer rotation");
                            }
                        },
                        None => {
                            rd.buf.advance(frame::HEADER_LEN + len);
                            debug!(conn_id = %self.conn_id, "skipping unknown frame type {ty:#04x}");
                        },
                    }
                }
            }

            // No complete frame buffered; fetch more raw bytes.
            let fetched = tokio::select! {
                _ = self.cancel.cancelled() => return Err(self.closed_error()),
                r = self.transport.read_raw(&self.cancel) => r,
            };

            match fetched {
                Err(Error::NoData) => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(self.closed_error()),
                        _ = async { self.poller.lock().await.sleep().await } => {},
                    }
                },
                Err(e) => return Err(e),
                Ok(bytes) => {
                    {
                        let mut rd = self.rd.lock().await;
                        rd.scratch.extend_from_slice(&bytes);
                        loop {
                            let unsealed = {
                                let mut ns = self.noise.lock().await;
                                ns.unseal(&rd.scratch)?
                            };
                            match unsealed {
                                None => break,
                                Some((plain, consumed)) => {
                                    rd.buf.extend_from_slice(&plain);
                                    rd.scratch.advance(consumed);
                                    self.maybe_delete_token();
                                },
                            }
                        }
                    }
                    self.poller.lock().await.reset();
                },
            }
        }
    }

    fn closed_error(&self) -> Error {
        if self.closed.load(Ordering::Acquire) {
            Error::Closed
        } else {
            Error::Cancelled
        }
    }

    /// Responder side only: once the dialer has proven it can talk on the
    /// data channel, the token-outbox entry is reclaimed.
    fn maybe_delete_token(&self) {
        let Some(tc) = &self.token_cleanup else {
            return;
        };
        if tc.done.swap(true, Ordering::AcqRel) {
            return;
        }
        let driver = Arc::clone(&tc.driver);
        let conn_id = self.conn_id.clone();
        tokio::spawn(async move {
            best_effort_cleanup("token reclaim", &conn_id, driver.delete_token(&conn_id)).await;
        });
    }

    // ─── keep-alive ─────────────────────────────────────────────────────

    fn spawn_keepalive(self: &Arc<Self>) {
        let conn = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = interval(conn.ping_interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = conn.cancel.cancelled() => break,
                    _ = tick.tick() => {},
                }
                if conn.closed.load(Ordering::Acquire)
                    || conn.closed_write.load(Ordering::Acquire)
                {
                    break;
                }

                let idle = utils::now_nanos()
                    .saturating_sub(conn.last_active.load(Ordering::Acquire));
                if Duration::from_nanos(idle) < conn.ping_interval {
                    continue;
                }

                {
                    let mut wb = conn.wbuf.lock().await;
                    frame::build(&mut wb, FrameType::Ping, &[]);
                }
                if let Err(e) = conn.flush().await {
                    debug!(conn_id = %conn.conn_id, "keep-alive flush failed: {e}");
                }
            }
        });
    }

    // ─── teardown ───────────────────────────────────────────────────────

    /// Half-closes the write side: buffers a FIN and flushes. Idempotent;
    /// the read side stays open until the peer's FIN is consumed.
    pub async fn close_write(&self) -> Result<()> {
        if self.closed_write.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        {
            let mut wb = self.wbuf.lock().await;
            frame::build(&mut wb, FrameType::Fin, &[]);
        }
        self.flush().await
    }

    /// Flushes what it can, sends FIN if one was never sent, closes the
    /// raw transport and cancels the connection scope. Idempotent; flush
    /// errors during teardown are tolerated.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        debug!(conn_id = %self.conn_id, "closing connection");

        if let Err(e) = self.flush().await {
            debug!(conn_id = %self.conn_id, "flush on close failed: {e}");
        }
        if !self.closed_write.swap(true, Ordering::AcqRel) {
            {
                let mut wb = self.wbuf.lock().await;
                frame::build(&mut wb, FrameType::Fin, &[]);
            }
            if let Err(e) = self.flush().await {
                debug!(conn_id = %self.conn_id, "final flush failed: {e}");
            }
        }
        if let Err(e) = self.transport.close().await {
            warn!(conn_id = %self.conn_id, "transport close failed: {e}");
        }
        self.cancel.cancel();

        {
            let mut wb = self.wbuf.lock().await;
            *wb = BytesMut::new();
        }
        {
            let mut rd = self.rd.lock().await;
            *rd = ReadState::default();
        }
        Ok(())
    }
}
