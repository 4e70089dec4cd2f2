use std::io;
use std::io::Write;
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::SyncSender;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::peer_message::Message;
use super::session_status::SessionStatus;

/// Store-to-session notifications about piece fate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PieceEvent {
    /// The piece verified and is on disk; sessions announce it with HAVE.
    Verified(u32),
    /// The piece failed verification and went back to the work queue.
    Rejected(u32),
}

/// The shared face of a live peer session.
///
/// The session's driver loop, its receiver thread, the choking loop and
/// the piece store all hold an `Arc` of this. Socket writes go through one
/// mutex so a PIECE reply and a REQUEST never interleave bytes on the
/// wire.
#[derive(Debug)]
pub struct SessionHandle {
    writer: Mutex<TcpStream>,
    status: Mutex<SessionStatus>,
    events: SyncSender<PieceEvent>,
    alive: AtomicBool,
    bytes_downloaded: AtomicU64,
    rate_snapshot: AtomicU64,
    last_message_at: Mutex<Instant>,
}

#[derive(Debug)]
pub enum SessionHandleError {
    PoisonedStatusLock,
    PoisonedWriterLock,
    PoisonedClockLock,
    WriteError(io::Error),
}

impl SessionHandle {
    pub fn new(writer: TcpStream, status: SessionStatus, events: SyncSender<PieceEvent>) -> Self {
        Self {
            writer: Mutex::new(writer),
            status: Mutex::new(status),
            events,
            alive: AtomicBool::new(true),
            bytes_downloaded: AtomicU64::new(0),
            rate_snapshot: AtomicU64::new(0),
            last_message_at: Mutex::new(Instant::now()),
        }
    }

    /// Writes one message to the socket under the per-session write lock.
    pub fn send_message(&self, message: &Message) -> Result<(), SessionHandleError> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| SessionHandleError::PoisonedWriterLock)?;
        writer
            .write_all(&message.to_bytes())
            .map_err(SessionHandleError::WriteError)
    }

    pub fn lock_status(&self) -> Result<MutexGuard<SessionStatus>, SessionHandleError> {
        self.status
            .lock()
            .map_err(|_| SessionHandleError::PoisonedStatusLock)
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    /// Marks the session dead and tears the socket down so both the
    /// receiver and the driver observe the death at their next suspension.
    pub fn shut_down(&self) {
        self.alive.store(false, Ordering::Relaxed);
        if let Ok(writer) = self.writer.lock() {
            let _ = writer.shutdown(Shutdown::Both);
        }
    }

    /// Hands a piece event to the session. Events are dropped rather than
    /// blocking the store; a lost event only costs one HAVE announcement,
    /// the requester re-checks piece state against the store anyway.
    pub fn notify(&self, event: PieceEvent) {
        let _ = self.events.try_send(event);
    }

    pub fn add_downloaded(&self, bytes: u64) {
        self.bytes_downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Bytes per second since the previous call, over a tick of
    /// `period_seconds`. Refreshing moves the snapshot forward, so every
    /// session must be polled on every tick to keep rates unbiased.
    pub fn take_download_rate(&self, period_seconds: f64) -> f64 {
        let current = self.bytes_downloaded.load(Ordering::Relaxed);
        let previous = self.rate_snapshot.swap(current, Ordering::Relaxed);
        (current.saturating_sub(previous)) as f64 / period_seconds
    }

    /// Resets the liveness clock; called for every message that arrives.
    pub fn touch(&self) -> Result<(), SessionHandleError> {
        let mut at = self
            .last_message_at
            .lock()
            .map_err(|_| SessionHandleError::PoisonedClockLock)?;
        *at = Instant::now();
        Ok(())
    }

    /// Time since the last message arrived on the wire.
    pub fn idle_time(&self) -> Result<Duration, SessionHandleError> {
        let at = self
            .last_message_at
            .lock()
            .map_err(|_| SessionHandleError::PoisonedClockLock)?;
        Ok(at.elapsed())
    }

    pub fn is_peer_interested(&self) -> Result<bool, SessionHandleError> {
        Ok(self.lock_status()?.peer_interested)
    }

    pub fn am_choking(&self) -> Result<bool, SessionHandleError> {
        Ok(self.lock_status()?.am_choking)
    }

    pub fn set_am_choking(&self, choking: bool) -> Result<(), SessionHandleError> {
        self.lock_status()?.am_choking = choking;
        Ok(())
    }
}
