//! ==============================================================================
//! scheduler.rs - the acquisition loop
//! ==============================================================================
//!
//! purpose:
//!     decides every tick whether it is night, samples the photometer at
//!     night and idles by day, and moves readings into the store, the
//!     sinks and the report hook.
//!
//! state machine:
//!     NIGHT_ACTIVE  on entry close a night the day never closed, reset
//!                   the state and rotate files. then count the iteration,
//!                   sample, record, sleep max(1 s, delay - elapsed).
//!     DAY_IDLE      flush what the night left behind, run the end-of-night
//!                   report, announce the next sunset once, sleep.
//!
//! failure policy:
//!     - device errors are expected: log, reset the session, retry in 1 s.
//!     - store errors keep the buffer and are retried on the next flush.
//!     - too many failed cycles in a row escalate to the supervisor,
//!       which rebuilds the session from scratch. the escalation waits
//!       until the cache has reached the disk.
//!
//! ==============================================================================

use std::convert::Infallible;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::{debug, error, info, warn};

use crate::clock::{remaining_pause, Clock};
use crate::config::DaemonConfig;
use crate::ephemeris::Ephemeris;
use crate::error::DeviceError;
use crate::protocol::DeviceSession;
use crate::reading::{LocalTime, Reading};
use crate::report::{ReportContext, ReportHook};
use crate::sampler::Sampler;
use crate::sinks::ReadingSink;
use crate::store::{CacheStore, FileSet};
use crate::transport::Transport;

const MIN_PAUSE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerState {
    pub is_night: bool,
    pub iteration_count: u64,
    pub daytime_message_pending: bool,
}

impl Default for SchedulerState {
    fn default() -> Self {
        Self {
            is_night: false,
            iteration_count: 0,
            daytime_message_pending: true,
        }
    }
}

pub struct Scheduler<'a, T: Transport> {
    config: &'a DaemonConfig,
    session: DeviceSession<T>,
    sampler: Sampler,
    store: CacheStore,
    ephemeris: Box<dyn Ephemeris>,
    report: Box<dyn ReportHook>,
    sinks: Vec<Box<dyn ReadingSink>>,
    local_time: LocalTime,
    clock: Arc<dyn Clock>,
    state: SchedulerState,
    rotation_pending: bool,
    consecutive_failures: u32,
    reboot_attempted: bool,
}

impl<'a, T: Transport> Scheduler<'a, T> {
    pub fn new(
        config: &'a DaemonConfig,
        session: DeviceSession<T>,
        store: CacheStore,
        ephemeris: Box<dyn Ephemeris>,
        report: Box<dyn ReportHook>,
        local_time: LocalTime,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            session,
            sampler: Sampler::new(&config.sampling, local_time, clock.clone()),
            store,
            ephemeris,
            report,
            sinks: Vec::new(),
            local_time,
            clock,
            state: SchedulerState::default(),
            rotation_pending: false,
            consecutive_failures: 0,
            reboot_attempted: false,
        }
    }

    pub fn with_sink(mut self, sink: Box<dyn ReadingSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    #[cfg(test)]
    pub fn state(&self) -> &SchedulerState {
        &self.state
    }

    /// Tick forever. Only returns when a tick escalates.
    pub fn run(&mut self) -> Result<Infallible> {
        info!("[SCHEDULER] Acquisition loop started");
        loop {
            let pause = self.tick()?;
            self.clock.sleep(pause);
        }
    }

    /// One pass of the state machine. Returns how long to sleep.
    pub fn tick(&mut self) -> Result<Duration> {
        let night = self.ephemeris.is_night(self.clock.now());
        if night && !self.state.is_night {
            info!("[SCHEDULER] Night time, starting acquisition");
            if self.state.iteration_count > 0 {
                warn!("[SCHEDULER] Previous night was never closed, closing it now");
                self.close_night();
            }
            self.state = SchedulerState::default();
            self.rotation_pending = true;
        }
        self.state.is_night = night;

        if night {
            self.night_tick()
        } else {
            Ok(self.day_tick())
        }
    }

    fn night_tick(&mut self) -> Result<Duration> {
        self.state.iteration_count += 1;
        if self.rotation_pending {
            self.prepare_files();
        }

        let started = self.clock.now();
        match self.sampler.sample(&mut self.session) {
            Ok(reading) => {
                self.consecutive_failures = 0;
                self.record(&reading);
                self.periodic_report();
                let elapsed = self.clock.elapsed_since(started);
                Ok(remaining_pause(
                    self.config.sampling.delay_between_measures(),
                    elapsed,
                    MIN_PAUSE,
                ))
            }
            Err(e) => self.sampling_failed(e),
        }
    }

    fn prepare_files(&mut self) {
        let files = FileSet::for_night(self.config, self.local_time.to_local(self.clock.now()));
        match self.store.rotate(files) {
            Ok(()) => self.rotation_pending = false,
            Err(e) => error!("[STORE] Could not close the previous night, retrying: {}", e),
        }
    }

    fn record(&mut self, reading: &Reading) {
        let line = reading.to_line();
        debug!("[SCHEDULER] #{} {}", self.state.iteration_count, line.trim_end());

        for sink in self.sinks.iter_mut() {
            if let Err(e) = sink.record(reading) {
                warn!("[SINK] {} failed: {:#}", sink.name(), e);
            }
        }

        let shown = line.trim_end().to_string();
        match self.store.append(line) {
            Ok(true) if self.config.logging.show_readings => {
                info!("{}\t{}", self.state.iteration_count, shown);
            }
            Ok(_) => {}
            Err(e) => error!(
                "[STORE] Flush failed, keeping {} readings for the next try: {}",
                self.store.pending(),
                e
            ),
        }
    }

    fn periodic_report(&mut self) {
        let every = self.config.sampling.report_each;
        if every == 0 || self.state.iteration_count % every != 0 {
            return;
        }
        if let Some(files) = self.store.files() {
            let ctx = ReportContext {
                files,
                iteration: self.state.iteration_count,
            };
            if let Err(e) = self.report.periodic(&ctx) {
                warn!("[REPORT] Periodic report failed: {:#}", e);
            }
        }
    }

    fn sampling_failed(&mut self, err: DeviceError) -> Result<Duration> {
        self.consecutive_failures += 1;
        error!(
            "[SAMPLER] Reading failed ({} in a row): {}",
            self.consecutive_failures, err
        );

        let limit = self.config.sampling.max_consecutive_failures;
        if limit > 0 && self.consecutive_failures >= limit {
            // a restart starts from an empty cache, so only leave once it is on disk
            match self.store.flush() {
                Ok(_) => bail!(
                    "device failed {} cycles in a row, last error: {}",
                    self.consecutive_failures,
                    err
                ),
                Err(e) => error!(
                    "[STORE] Holding {} readings, not restarting until they are written: {}",
                    self.store.pending(),
                    e
                ),
            }
        }

        if self.config.recovery.reboot_on_connection_lost && !self.reboot_attempted {
            self.reboot_attempted = true;
            if let Err(e) = self.reboot_host() {
                error!("[RECOVERY] Reboot failed: {:#}", e);
            }
        }

        if let Err(e) = self.session.reset() {
            warn!("[DEVICE] Reset failed: {}", e);
        }
        Ok(MIN_PAUSE)
    }

    fn reboot_host(&self) -> Result<()> {
        let recovery = &self.config.recovery;
        warn!(
            "[RECOVERY] Connection lost, running `{}` in {}s",
            recovery.reboot_command, recovery.reboot_delay_seconds
        );
        self.clock.sleep(recovery.reboot_delay());

        let mut parts = recovery.reboot_command.split_whitespace();
        let program = parts.next().context("reboot command is empty")?;
        let status = Command::new(program)
            .args(parts)
            .status()
            .with_context(|| format!("failed to run {program}"))?;
        if !status.success() {
            bail!("`{}` exited with {}", recovery.reboot_command, status);
        }
        Ok(())
    }

    fn day_tick(&mut self) -> Duration {
        if self.state.iteration_count > 0 {
            self.close_night();
        }

        if self.state.daytime_message_pending {
            let now = self.clock.now();
            match self.ephemeris.next_sunset(now) {
                Some(sunset) => info!(
                    "[SCHEDULER] Daytime. Waiting until {} (UTC)",
                    sunset.format("%Y-%m-%d %H:%M:%S")
                ),
                None => info!("[SCHEDULER] Daytime. No sunset in the next two days"),
            }
            self.state.daytime_message_pending = false;
        }

        self.config.sampling.day_idle()
    }

    /// Flush the night's readings, report on them and reset the counter.
    /// Nothing is reset when the flush fails.
    fn close_night(&mut self) {
        match self.store.flush() {
            Ok(_) => {
                self.end_of_night_report();
                self.state.iteration_count = 0;
            }
            Err(e) => error!("[STORE] End of night flush failed, retrying: {}", e),
        }
    }

    fn end_of_night_report(&mut self) {
        if let Some(files) = self.store.files() {
            let ctx = ReportContext {
                files,
                iteration: self.state.iteration_count,
            };
            if let Err(e) = self.report.end_of_night(&ctx) {
                warn!("[REPORT] End of night report failed: {:#}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::fs;
    use std::path::Path;
    use std::rc::Rc;

    use chrono::{DateTime, Utc};
    use tempfile::TempDir;

    use super::*;
    use crate::clock::fake::FakeClock;
    use crate::config::TimeConfig;
    use crate::transport::mock::ScriptedTransport;

    /// Answers `is_night` from a script, repeating the last answer.
    struct ScriptedEphemeris {
        answers: RefCell<VecDeque<bool>>,
        last: RefCell<bool>,
    }

    impl ScriptedEphemeris {
        fn new(answers: &[bool]) -> Self {
            Self {
                answers: RefCell::new(answers.iter().copied().collect()),
                last: RefCell::new(false),
            }
        }
    }

    impl Ephemeris for ScriptedEphemeris {
        fn is_night(&self, _utc: DateTime<Utc>) -> bool {
            if let Some(answer) = self.answers.borrow_mut().pop_front() {
                *self.last.borrow_mut() = answer;
            }
            *self.last.borrow()
        }

        fn next_sunset(&self, utc: DateTime<Utc>) -> Option<DateTime<Utc>> {
            Some(utc + chrono::Duration::hours(8))
        }
    }

    #[derive(Clone, Default)]
    struct Calls(Rc<RefCell<Vec<&'static str>>>);

    impl Calls {
        fn count(&self, name: &str) -> usize {
            self.0.borrow().iter().filter(|c| **c == name).count()
        }
    }

    impl ReportHook for Calls {
        fn periodic(&mut self, _ctx: &ReportContext) -> Result<()> {
            self.0.borrow_mut().push("periodic");
            Ok(())
        }

        fn end_of_night(&mut self, _ctx: &ReportContext) -> Result<()> {
            self.0.borrow_mut().push("end_of_night");
            Ok(())
        }
    }

    struct FailingSink;

    impl ReadingSink for FailingSink {
        fn name(&self) -> &str {
            "failing"
        }

        fn record(&mut self, _reading: &Reading) -> Result<()> {
            bail!("database is down")
        }
    }

    fn test_config(dir: &Path) -> DaemonConfig {
        let mut config = DaemonConfig::default();
        config.site.name = "UCM".to_string();
        config.paths.monthly_data_directory = dir.join("monthly");
        config.paths.daily_data_directory = dir.join("daily");
        config.paths.current_data_directory = dir.join("current");
        config.paths.summary_data_directory = dir.to_path_buf();
        config.sampling.measures_to_average = 1;
        config.sampling.cache_measures = 10;
        config.sampling.report_each = 2;
        config.sampling.max_consecutive_failures = 3;
        config.device.read_tries = 2;
        config.create_directories().unwrap();
        config
    }

    fn scheduler<'a>(
        config: &'a DaemonConfig,
        transport: ScriptedTransport,
        nights: &[bool],
        calls: &Calls,
    ) -> (Scheduler<'a, ScriptedTransport>, Arc<FakeClock>) {
        let clock = Arc::new(FakeClock::new());
        let local_time = LocalTime::from_config(&TimeConfig::default()).unwrap();
        let session = DeviceSession::open(transport, &config.device, clock.clone()).unwrap();
        let store = CacheStore::new("# END OF HEADER\n".to_string(), config.sampling.cache_measures);
        let scheduler = Scheduler::new(
            config,
            session,
            store,
            Box::new(ScriptedEphemeris::new(nights)),
            Box::new(calls.clone()),
            local_time,
            clock.clone(),
        );
        (scheduler, clock)
    }

    fn data_lines(path: &Path) -> usize {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .filter(|l| !l.starts_with('#'))
            .count()
    }

    #[test]
    fn night_tick_keeps_the_cadence() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path());
        let calls = Calls::default();
        let (mut scheduler, _clock) = scheduler(&config, ScriptedTransport::healthy(), &[true], &calls);

        // one read settles for 1 s out of the 5 s delay
        assert_eq!(scheduler.tick().unwrap(), Duration::from_secs(4));
        assert!(scheduler.state().is_night);
        assert_eq!(scheduler.state().iteration_count, 1);
        assert_eq!(calls.count("periodic"), 0);

        scheduler.tick().unwrap();
        assert_eq!(calls.count("periodic"), 1);
    }

    #[test]
    fn dawn_flushes_and_resets_exactly_once() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path());
        let calls = Calls::default();
        let (mut scheduler, _clock) =
            scheduler(&config, ScriptedTransport::healthy(), &[true, true, false, false], &calls);

        scheduler.tick().unwrap();
        scheduler.tick().unwrap();
        assert_eq!(scheduler.store.pending(), 2);
        let files = scheduler.store.files().cloned().unwrap();
        assert!(!files.daily.exists());

        assert_eq!(scheduler.tick().unwrap(), config.sampling.day_idle());
        assert_eq!(scheduler.state().iteration_count, 0);
        assert!(!scheduler.state().daytime_message_pending);
        assert_eq!(scheduler.store.pending(), 0);
        assert_eq!(data_lines(&files.daily), 2);
        assert_eq!(data_lines(&files.current), 2);
        assert_eq!(calls.count("end_of_night"), 1);

        scheduler.tick().unwrap();
        assert_eq!(calls.count("end_of_night"), 1);
        assert_eq!(data_lines(&files.daily), 2);
    }

    #[test]
    fn starting_in_daylight_only_idles() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path());
        let calls = Calls::default();
        let (mut scheduler, _clock) = scheduler(&config, ScriptedTransport::healthy(), &[false], &calls);

        assert_eq!(scheduler.tick().unwrap(), Duration::from_secs(300));
        assert!(scheduler.store.files().is_none());
        assert_eq!(calls.count("end_of_night"), 0);
    }

    #[test]
    fn dead_device_resets_and_escalates() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path());
        let calls = Calls::default();
        let (mut scheduler, _clock) = scheduler(&config, ScriptedTransport::healthy(), &[true], &calls);
        scheduler.session.transport_mut().default_data = "garbage\r\n".to_string();

        assert_eq!(scheduler.tick().unwrap(), Duration::from_secs(1));
        assert_eq!(scheduler.tick().unwrap(), Duration::from_secs(1));
        // two failed tries per cycle plus one reset per cycle
        assert_eq!(scheduler.session.transport_mut().reconnects, 6);
        assert!(scheduler.tick().is_err());
    }

    #[test]
    fn recovery_clears_the_failure_streak() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path());
        let calls = Calls::default();
        let transport = ScriptedTransport::healthy();
        let (mut scheduler, _clock) = scheduler(&config, transport, &[true], &calls);

        scheduler.session.transport_mut().default_data = "garbage\r\n".to_string();
        scheduler.tick().unwrap();
        scheduler.tick().unwrap();
        scheduler.session.transport_mut().default_data =
            crate::transport::mock::DATA_REPLY.to_string();
        scheduler.tick().unwrap();

        scheduler.session.transport_mut().default_data = "garbage\r\n".to_string();
        scheduler.tick().unwrap();
        scheduler.tick().unwrap();
        assert_eq!(scheduler.store.pending(), 1);
    }

    #[test]
    fn sink_failure_does_not_lose_the_reading() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path());
        let calls = Calls::default();
        let (scheduler, _clock) = scheduler(&config, ScriptedTransport::healthy(), &[true], &calls);
        let mut scheduler = scheduler.with_sink(Box::new(FailingSink));

        scheduler.tick().unwrap();
        assert_eq!(scheduler.store.pending(), 1);
    }

    fn break_dir(path: &Path) {
        fs::remove_dir(path).unwrap();
        fs::write(path, "not a directory").unwrap();
    }

    fn heal_dir(path: &Path) {
        fs::remove_file(path).unwrap();
        fs::create_dir(path).unwrap();
    }

    #[test]
    fn unclosed_night_rotates_on_the_next_evening() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path());
        let calls = Calls::default();
        let (mut scheduler, clock) =
            scheduler(&config, ScriptedTransport::healthy(), &[true, false, true], &calls);
        let local_time = LocalTime::from_config(&TimeConfig::default()).unwrap();
        let daily_dir = dir.path().join("daily");

        scheduler.tick().unwrap();
        let first = scheduler.store.files().cloned().unwrap();

        // the dawn flush cannot reach the daily directory all day
        break_dir(&daily_dir);
        scheduler.tick().unwrap();
        assert_eq!(scheduler.state().iteration_count, 1);
        assert_eq!(calls.count("end_of_night"), 0);

        heal_dir(&daily_dir);
        clock.advance(Duration::from_secs(24 * 3600));
        scheduler.tick().unwrap();

        let expected = FileSet::for_night(&config, local_time.to_local(clock.now()));
        assert_ne!(expected, first);
        assert_eq!(scheduler.store.files(), Some(&expected));
        assert_eq!(scheduler.state().iteration_count, 1);
        assert_eq!(calls.count("end_of_night"), 1);
        assert_eq!(data_lines(&first.daily), 1);
        assert_eq!(data_lines(&first.monthly), 1);
        assert_eq!(scheduler.store.pending(), 1);
    }

    #[test]
    fn escalation_waits_until_the_cache_is_on_disk() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path());
        let calls = Calls::default();
        let (mut scheduler, _clock) = scheduler(&config, ScriptedTransport::healthy(), &[true], &calls);
        let daily_dir = dir.path().join("daily");

        scheduler.tick().unwrap();
        let files = scheduler.store.files().cloned().unwrap();

        break_dir(&daily_dir);
        scheduler.session.transport_mut().default_data = "garbage\r\n".to_string();
        // past the limit of 3, but the reading is not on disk yet
        for _ in 0..4 {
            assert_eq!(scheduler.tick().unwrap(), Duration::from_secs(1));
        }
        assert_eq!(scheduler.store.pending(), 1);

        heal_dir(&daily_dir);
        assert!(scheduler.tick().is_err());
        assert_eq!(scheduler.store.pending(), 0);
        assert_eq!(data_lines(&files.daily), 1);
    }
}
