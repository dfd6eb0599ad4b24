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

//! Actuator control state
//!
//! A `Control` records whether an actuator (fan, voltage rail) is left to its
//! default firmware behaviour or driven by a software value. It performs no I/O:
//! the backend that owns the hardware subscribes and pushes values itself.
//!
//! # Modes
//!
//! - `Undefined` - initial state, nobody has claimed the actuator yet
//! - `Default` - firmware/automatic control
//! - `Software` - the clamped software value applies

use std::sync::mpsc::{self, Receiver, Sender};

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::logger;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlMode {
    Undefined,
    Default,
    Software,
}

impl ControlMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlMode::Undefined => "undefined",
            ControlMode::Default => "default",
            ControlMode::Software => "software",
        }
    }
}

/// Notification delivered to subscribers of a [`Control`]
#[derive(Debug, Clone, PartialEq)]
pub enum ControlEvent {
    ModeChanged { identifier: String, mode: ControlMode },
    SoftwareValueChanged { identifier: String, value: f32 },
}

#[derive(Debug)]
pub struct Control {
    identifier: String,
    mode: ControlMode,
    software_value: f32,
    min_software_value: f32,
    max_software_value: f32,
    subscribers: Vec<Sender<ControlEvent>>,
}

impl Control {
    pub fn new(identifier: impl Into<String>, min_software_value: f32, max_software_value: f32) -> Self {
        let (min, max) = if min_software_value <= max_software_value {
            (min_software_value, max_software_value)
        } else {
            (max_software_value, min_software_value)
        };
        Self {
            identifier: identifier.into(),
            mode: ControlMode::Undefined,
            software_value: min.max(0.0).min(max),
            min_software_value: min,
            max_software_value: max,
            subscribers: Vec::new(),
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn mode(&self) -> ControlMode {
        self.mode
    }

    pub fn software_value(&self) -> f32 {
        self.software_value
    }

    pub fn min_software_value(&self) -> f32 {
        self.min_software_value
    }

    pub fn max_software_value(&self) -> f32 {
        self.max_software_value
    }

    /// Register a new listener. Dropped receivers are pruned on the next event.
    pub fn subscribe(&mut self) -> Receiver<ControlEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.push(tx);
        rx
    }

    pub fn set_default(&mut self) {
        self.set_mode(ControlMode::Default);
    }

    /// Switch to software mode with `value` clamped into the control's bounds.
    pub fn set_software(&mut self, value: f32) {
        if !value.is_finite() {
            warn!("Ignoring non-finite software value for {}", self.identifier);
            return;
        }
        self.set_mode(ControlMode::Software);
        let clamped = value.clamp(self.min_software_value, self.max_software_value);
        self.set_software_value(clamped);
    }

    fn set_mode(&mut self, mode: ControlMode) {
        if self.mode == mode {
            return;
        }
        debug!("{}: control mode {} -> {}", self.identifier, self.mode.as_str(), mode.as_str());
        self.mode = mode;
        logger::log_event(
            "control_mode",
            json!({ "control": self.identifier, "mode": mode.as_str() }),
        );
        self.notify(ControlEvent::ModeChanged {
            identifier: self.identifier.clone(),
            mode,
        });
    }

    fn set_software_value(&mut self, value: f32) {
        if self.software_value == value {
            return;
        }
        self.software_value = value;
        logger::log_event(
            "control_value",
            json!({ "control": self.identifier, "value": value }),
        );
        self.notify(ControlEvent::SoftwareValueChanged {
            identifier: self.identifier.clone(),
            value,
        });
    }

    fn notify(&mut self, event: ControlEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}
