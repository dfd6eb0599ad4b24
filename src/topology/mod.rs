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

//! Processor topology discovery
//!
//! Logical processors are probed one by one, then grouped into a
//! processor → core → thread tree. Both levels are ordered by ascending id,
//! so the same identity set always produces the same tree.

mod identity;

pub use identity::{clean_brand_name, ThreadIdentity, Vendor};

use std::collections::BTreeMap;

use tracing::{debug, trace};

use crate::access::RegisterAccess;

#[derive(Debug, Clone, PartialEq)]
pub struct Core {
    id: u32,
    threads: Vec<ThreadIdentity>,
}

impl Core {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn threads(&self) -> &[ThreadIdentity] {
        &self.threads
    }

    /// First thread of the core, used for per-core register reads
    pub fn primary(&self) -> &ThreadIdentity {
        &self.threads[0]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Processor {
    id: u32,
    cores: Vec<Core>,
}

impl Processor {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn cores(&self) -> &[Core] {
        &self.cores
    }

    pub fn core_count(&self) -> usize {
        self.cores.len()
    }

    pub fn thread_count(&self) -> usize {
        self.cores.iter().map(|c| c.threads.len()).sum()
    }

    /// All threads, core by core
    pub fn threads(&self) -> impl Iterator<Item = &ThreadIdentity> + '_ {
        self.cores.iter().flat_map(|c| c.threads.iter())
    }

    /// First thread of the first core
    pub fn primary(&self) -> &ThreadIdentity {
        self.cores[0].primary()
    }
}

/// Probe logical processors `0..max` and keep those that answer.
pub fn discover_threads<A: RegisterAccess + ?Sized>(access: &A, max: u32) -> Vec<ThreadIdentity> {
    let mut threads = Vec::new();
    for index in 0..max.min(64) {
        match ThreadIdentity::probe(access, index) {
            Some(id) => {
                trace!(
                    index,
                    processor = id.processor_id(),
                    core = id.core_id(),
                    thread = id.thread_id(),
                    "Found logical processor"
                );
                threads.push(id);
            }
            None => trace!(index, "No logical processor"),
        }
    }
    debug!("Discovered {} logical processors", threads.len());
    threads
}

/// Group threads into processors and cores, ascending by id at both levels.
///
/// Threads keep their relative input order within a core.
pub fn group_by_processor(threads: Vec<ThreadIdentity>) -> Vec<Processor> {
    let mut processors: BTreeMap<u32, BTreeMap<u32, Vec<ThreadIdentity>>> = BTreeMap::new();
    for thread in threads {
        processors
            .entry(thread.processor_id())
            .or_default()
            .entry(thread.core_id())
            .or_default()
            .push(thread);
    }

    processors
        .into_iter()
        .map(|(id, cores)| Processor {
            id,
            cores: cores
                .into_iter()
                .map(|(id, threads)| Core { id, threads })
                .collect(),
        })
        .filter(|p| p.thread_count() > 0)
        .collect()
}
