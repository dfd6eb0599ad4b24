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

//! Discovery entry point and the polling sweep over all devices

use std::sync::Arc;

use serde_json::json;
use tracing::{info, warn};

use hp_error::Result;

use crate::access::{LinuxAccess, RegisterAccess};
use crate::config::{self, EngineConfig};
use crate::cpu::Cpu;
use crate::load::{ProcStat, ProcessorTimes};
use crate::logger;
use crate::topology::{discover_threads, group_by_processor};

/// Owns every discovered CPU and the privileged channel they share.
///
/// Dropping the collection closes the channel.
pub struct DeviceCollection {
    access: Arc<dyn RegisterAccess>,
    cpus: Vec<Cpu>,
    owns_event_log: bool,
    closed: bool,
}

impl DeviceCollection {
    /// Discover with the Linux backend, `/proc/stat` and the configuration
    /// found at [`config::config_path`].
    pub fn discover() -> Result<Self> {
        let config = config::load_or_default()?;
        Self::discover_with(Arc::new(LinuxAccess::new()), Arc::new(ProcStat::new()), config)
    }

    /// Discover with caller-supplied backends.
    ///
    /// Fails only if the configuration is invalid or the privileged channel
    /// cannot be opened. Unknown hardware gets the generic decoder.
    pub fn discover_with(
        access: Arc<dyn RegisterAccess>,
        times: Arc<dyn ProcessorTimes>,
        config: EngineConfig,
    ) -> Result<Self> {
        config::validate_config(&config)?;
        access.open()?;

        let mut owns_event_log = false;
        if let Some(path) = &config.event_log {
            match logger::init_event_log(path) {
                Ok(()) => owns_event_log = true,
                Err(e) => warn!("Event log {} unavailable: {}", path.display(), e),
            }
        }

        let threads = discover_threads(access.as_ref(), config.max_logical_processors);
        let cpus: Vec<Cpu> = group_by_processor(threads)
            .into_iter()
            .enumerate()
            .map(|(index, processor)| Cpu::new(index, processor, access.clone(), times.clone(), &config))
            .collect();

        info!("Discovered {} CPU(s)", cpus.len());
        logger::log_event(
            "discovery",
            json!({
                "cpus": cpus
                    .iter()
                    .map(|c| json!({
                        "identifier": c.identifier(),
                        "name": c.name(),
                        "cores": c.core_count(),
                        "threads": c.thread_count(),
                        "decoder": c.decoder_name(),
                        "tsc_mhz": c.tsc_frequency(),
                    }))
                    .collect::<Vec<_>>(),
            }),
        );

        Ok(Self {
            access,
            cpus,
            owns_event_log,
            closed: false,
        })
    }

    /// One sweep over every device
    pub fn update(&mut self) {
        if self.closed {
            return;
        }
        for cpu in &mut self.cpus {
            cpu.update();
        }
    }

    /// Release the privileged channel. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.access.close();
        info!("Device collection closed");
        if self.owns_event_log {
            logger::close_event_log();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn cpus(&self) -> &[Cpu] {
        &self.cpus
    }

    pub fn cpus_mut(&mut self) -> &mut [Cpu] {
        &mut self.cpus
    }
}

impl Drop for DeviceCollection {
    fn drop(&mut self) {
        self.close();
    }
}
