/*
 * This file is part of Hwprobe.
 *
 * Copyright (C) 2025 Hwprobe contributors
 *
 * Hwprobe is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Hwprobe is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Hwprobe. If not, see <https://www.gnu.org/licenses/>.
 */

//! Append-only JSON event journal.
//!
//! One line per event: `{"ts_ms": .., "event": .., "data": ..}`. Diagnostics go
//! through `tracing`; this journal records the few engine events a host may want
//! to audit later (discovery, calibration, control changes).

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use lazy_static::lazy_static;
use parking_lot::Mutex;
use serde_json::{json, Value};

lazy_static! {
    static ref LOG_FILE: Mutex<Option<File>> = Mutex::new(None);
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

pub fn init_event_log(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    *LOG_FILE.lock() = Some(file);
    Ok(())
}

pub fn close_event_log() {
    *LOG_FILE.lock() = None;
}

pub fn is_enabled() -> bool {
    LOG_FILE.lock().is_some()
}

/// Emit one journal line. No-op until [`init_event_log`] succeeded.
pub fn log_event(event: &str, data: Value) {
    let mut guard = LOG_FILE.lock();
    let Some(f) = guard.as_mut() else { return };
    let line = json!({
        "ts_ms": now_millis(),
        "event": event,
        "data": data,
    })
    .to_string();
    if let Err(e) = writeln!(f, "{}", line) {
        tracing::warn!("event journal write failed: {}", e);
    }
}
