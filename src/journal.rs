// ===============================
// src/journal.rs
// ===============================
//
// Append-only JSONL event log for crash recovery:
// - Satu baris per mutasi: {"ts": .., "type": .., "data": ..}
// - Flush setiap baris; log hanya untuk recovery, bukan jalur cepat runtime.
// - Otomatis membuat parent directory jika belum ada.
// - Jika tulis gagal, coba reopen file sekali; kalau tetap gagal, event dibuang
//   dan hanya dicatat di log (mutasi in-memory tetap jalan).
//
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::domain::{Event, EventKind};
use crate::metrics::{EVENTS, EVENT_LOG_ERRORS, REPLAY_SKIPPED};

fn open_writer(path: &Path) -> io::Result<BufWriter<File>> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(BufWriter::new(file))
}

/// Events read back from disk, in append order.
#[derive(Debug, Default)]
pub struct Replay {
    pub events: Vec<Event>,
    pub skipped: usize,
}

#[derive(Debug)]
pub struct EventLog {
    path: PathBuf,
    writer: Mutex<Option<BufWriter<File>>>,
}

impl EventLog {
    /// The file is opened lazily on first append.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), writer: Mutex::new(None) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Append one event. Failures are logged and swallowed.
    pub fn log<T: Serialize>(&self, kind: EventKind, data: &T) -> bool {
        let ev = match serde_json::to_value(data) {
            Ok(data) => Event { ts: Utc::now(), kind, data },
            Err(e) => {
                EVENT_LOG_ERRORS.inc();
                error!(?e, kind = kind.as_str(), "event log: serialize error, skip event");
                return false;
            }
        };
        let line = match serde_json::to_string(&ev) {
            Ok(s) => s,
            Err(e) => {
                EVENT_LOG_ERRORS.inc();
                error!(?e, kind = kind.as_str(), "event log: serialize error, skip event");
                return false;
            }
        };

        let mut guard = self.writer.lock();
        if let Err(e) = Self::write_line(&mut guard, &self.path, &line) {
            warn!(?e, path = %self.path.display(), "event log: write failed, attempting reopen");
            *guard = None;
            // coba lagi sekali setelah reopen
            if let Err(e2) = Self::write_line(&mut guard, &self.path, &line) {
                *guard = None;
                EVENT_LOG_ERRORS.inc();
                error!(?e2, kind = kind.as_str(), "event log: write failed again after reopen, drop event");
                return false;
            }
        }
        EVENTS.inc();
        true
    }

    fn write_line(slot: &mut Option<BufWriter<File>>, path: &Path, line: &str) -> io::Result<()> {
        if slot.is_none() {
            *slot = Some(open_writer(path)?);
        }
        let w = slot.as_mut().ok_or_else(|| io::Error::new(io::ErrorKind::Other, "writer unavailable"))?;
        w.write_all(line.as_bytes())?;
        w.write_all(b"\n")?;
        w.flush()
    }

    /// Read the log front-to-back. Malformed lines are skipped; a missing
    /// file is an empty log.
    pub fn replay(&self) -> Replay {
        let mut out = Replay::default();
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return out,
            Err(e) => {
                error!(?e, path = %self.path.display(), "event log: cannot open for replay");
                return out;
            }
        };

        for (n, line) in BufReader::new(file).lines().enumerate() {
            let line = match line {
                Ok(l) => l,
                Err(e) => {
                    out.skipped += 1;
                    REPLAY_SKIPPED.inc();
                    warn!(?e, line = n + 1, "event log: unreadable line skipped");
                    continue;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Event>(&line) {
                Ok(ev) => out.events.push(ev),
                Err(e) => {
                    out.skipped += 1;
                    REPLAY_SKIPPED.inc();
                    warn!(%e, line = n + 1, "event log: malformed line skipped");
                }
            }
        }
        info!(path = %self.path.display(), events = out.events.len(), skipped = out.skipped, "event log: read for replay");
        out
    }
}
