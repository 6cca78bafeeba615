// Copyright (c) 2024-present, microforest-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::base::Base;
use std::{
    fs::OpenOptions,
    io::Write,
    path::PathBuf,
    time::Instant,
};

/// Platform memory/storage probe.
///
/// The platform abstraction is an external collaborator; the engine only
/// consumes these numbers for preflight checks and the memory log.
pub trait MemoryProbe {
    /// Free heap in bytes
    fn free_heap(&self) -> usize;

    /// Largest contiguous free block in bytes
    fn largest_block(&self) -> usize;

    /// Free storage in bytes
    fn free_disk(&self) -> u64;
}

/// Probe for unconstrained hosts: memory is always plentiful.
#[derive(Copy, Clone, Debug, Default)]
pub struct HostProbe;

impl MemoryProbe for HostProbe {
    fn free_heap(&self) -> usize {
        usize::MAX / 2
    }

    fn largest_block(&self) -> usize {
        usize::MAX / 2
    }

    fn free_disk(&self) -> u64 {
        u64::MAX / 2
    }
}

/// Structured event/memory logger.
///
/// Two append-only CSV files: a time log of anchored durations and a memory
/// log of heap/disk status with low-water marks.
#[derive(Debug)]
pub struct EventLogger {
    time_log_path: PathBuf,
    memory_log_path: PathBuf,
    start: Instant,
    anchors: Vec<Instant>,

    /// Lowest observed free heap
    pub lowest_ram: usize,

    /// Lowest observed free disk
    pub lowest_rom: u64,

    /// Free-heap fragmentation percentage at the last probe
    pub fragmentation: u8,
}

impl EventLogger {
    /// Initializes the logger, recreating the log files unless
    /// `keep_old_files` is set.
    pub fn new(base: &Base, keep_old_files: bool) -> crate::Result<Self> {
        let mut logger = Self {
            time_log_path: base.time_log_path(),
            memory_log_path: base.memory_log_path(),
            start: Instant::now(),
            anchors: Vec::new(),
            lowest_ram: usize::MAX,
            lowest_rom: u64::MAX,
            fragmentation: 0,
        };
        logger.drop_anchor();

        if !keep_old_files || !logger.time_log_path.exists() {
            std::fs::write(&logger.time_log_path, "event,time_s,duration,unit\n")?;
        }
        if !keep_old_files || !logger.memory_log_path.exists() {
            std::fs::write(
                &logger.memory_log_path,
                "time_s,free_heap,largest_block,free_disk\n",
            )?;
        }

        Ok(logger)
    }

    /// Records a timestamp anchor and returns its index.
    pub fn drop_anchor(&mut self) -> usize {
        self.anchors.push(Instant::now());
        self.anchors.len() - 1
    }

    #[must_use]
    pub fn current_anchor(&self) -> usize {
        self.anchors.len().saturating_sub(1)
    }

    fn append_time_row(&self, row: &str) {
        let result = OpenOptions::new()
            .append(true)
            .open(&self.time_log_path)
            .and_then(|mut f| writeln!(f, "{row}"));
        if let Err(e) = result {
            log::warn!("failed to append time log: {e}");
        }
    }

    /// Logs the elapsed time since startup under an event name.
    pub fn log_event(&self, event: &str) {
        let elapsed = self.start.elapsed().as_secs_f32();
        self.append_time_row(&format!("{event},{elapsed:.1},_,ms"));
    }

    /// Logs the duration from an anchor to now and drops a new anchor.
    pub fn log_duration(&mut self, event: &str, begin_anchor: usize) -> u128 {
        let end = self.drop_anchor();
        self.log_duration_between(event, begin_anchor, end)
    }

    /// Logs the duration between two anchors, in milliseconds.
    pub fn log_duration_between(&mut self, event: &str, begin: usize, end: usize) -> u128 {
        let (begin, end) = if end < begin { (end, begin) } else { (begin, end) };
        let (Some(begin_at), Some(end_at)) = (self.anchors.get(begin), self.anchors.get(end))
        else {
            return 0;
        };

        let duration = end_at.duration_since(*begin_at);
        let since_start = begin_at.duration_since(self.start).as_secs_f32();
        self.append_time_row(&format!(
            "{event},{since_start:.1},{:.2},ms",
            duration.as_secs_f64() * 1_000.0
        ));

        // Reuse the end anchor for chained measurements
        if let Some(slot) = self.anchors.get_mut(end) {
            *slot = Instant::now();
        }
        duration.as_millis()
    }

    /// Samples the probe into the memory log and updates low-water marks.
    pub fn log_memory(&mut self, event: &str, probe: &dyn MemoryProbe) {
        let free_heap = probe.free_heap();
        let largest_block = probe.largest_block();
        let free_disk = probe.free_disk();

        self.lowest_ram = self.lowest_ram.min(free_heap);
        self.lowest_rom = self.lowest_rom.min(free_disk);
        #[allow(clippy::cast_possible_truncation)]
        {
            self.fragmentation = if free_heap == 0 {
                100
            } else {
                (100 - largest_block * 100 / free_heap) as u8
            };
        }

        let elapsed = self.start.elapsed().as_secs_f32();
        let result = OpenOptions::new()
            .append(true)
            .open(&self.memory_log_path)
            .and_then(|mut f| {
                writeln!(f, "{elapsed:.2},{free_heap},{largest_block},{free_disk},{event}")
            });
        if let Err(e) = result {
            log::warn!("failed to append memory log: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn logger_writes_both_files() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let base = Base::new(dir.path(), "m")?;

        let mut logger = EventLogger::new(&base, false)?;

        let anchor = logger.drop_anchor();
        logger.log_event("startup");
        logger.log_duration("load", anchor);
        logger.log_memory("after load", &HostProbe);

        let time_log = std::fs::read_to_string(base.time_log_path())?;
        assert!(time_log.starts_with("event,"));
        assert!(time_log.contains("startup"));
        assert!(time_log.contains("load"));

        let memory_log = std::fs::read_to_string(base.memory_log_path())?;
        assert!(memory_log.contains("after load"));

        assert!(logger.lowest_ram < usize::MAX);

        Ok(())
    }

    #[test]
    fn logger_swapped_anchors_still_measure() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let base = Base::new(dir.path(), "m")?;

        let mut logger = EventLogger::new(&base, false)?;
        let a = logger.drop_anchor();
        let b = logger.drop_anchor();

        // Reversed order is tolerated
        let _ = logger.log_duration_between("swapped", b, a);

        Ok(())
    }

    #[test]
    fn logger_keep_old_appends() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let base = Base::new(dir.path(), "m")?;

        {
            let logger = EventLogger::new(&base, false)?;
            logger.log_event("first");
        }
        {
            let logger = EventLogger::new(&base, true)?;
            logger.log_event("second");
        }

        let time_log = std::fs::read_to_string(base.time_log_path())?;
        assert!(time_log.contains("first"));
        assert!(time_log.contains("second"));

        Ok(())
    }
}
