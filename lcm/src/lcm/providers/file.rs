//! The log playback provider.
//!
//! Replays an event log through the subscription registry at a scaled
//! wall-clock rate. A dedicated timer thread sleeps out the gap between
//! consecutive events and pokes the notify pipe when the next one is due;
//! `speed <= 0` plays the log as fast as the application drains it.

use std::collections::HashMap;
use std::os::fd::{AsFd, OwnedFd, RawFd};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use nix::errno::Errno;
use nix::unistd;

use error::*;
use eventlog::{Event, EventLog, LogMode};
use lcm::registry::Registry;
use utils::{self, Pipe};

struct PlaybackState {
    log: EventLog,
    /// The next event to deliver. Always preloaded so end-of-log is known
    /// before the application blocks on it.
    event: Option<Event>,
    /// Wall-clock deadline for delivering `event`, in microseconds.
    /// Negative until the first `handle` call initializes the clock, which
    /// plays the first event with zero delay regardless of its timestamp.
    next_clock_time: i64,
}

/// The log playback provider.
pub struct FileProvider {
    registry: Arc<Registry>,
    state: Mutex<PlaybackState>,
    /// Playback rate. 1 is real time, 2 is double speed; zero and below
    /// mean "as fast as possible".
    speed: f64,
    notify_pipe: Pipe,
    /// Deadlines travel to the timer thread over this pipe; a negative
    /// deadline tells it to exit.
    timer_wr: OwnedFd,
    timer_thread: Option<thread::JoinHandle<()>>,
}

impl FileProvider {
    /// Opens the log file named by `target` and schedules its first event.
    pub fn new(
        registry: Arc<Registry>,
        target: &str,
        options: &HashMap<&str, &str>,
    ) -> Result<FileProvider, InitError> {
        if target.is_empty() {
            return Err(InitError::MissingTarget);
        }

        let mut speed = 1.0;
        for (key, value) in options {
            match *key {
                "speed" => match value.parse() {
                    Ok(parsed) => speed = parsed,
                    Err(_) => warn!("Ignoring invalid value for speed"),
                },
                _ => warn!("Ignoring unknown provider option \"{}\"", key),
            }
        }

        debug!(
            "Starting log playback provider (file = {}, speed = {})",
            target, speed
        );

        let mut log = EventLog::create(target, LogMode::Read)?;
        let event = match log.read_next_event()? {
            Some(event) => event,
            None => return Err(InitError::EmptyLog),
        };

        let notify_pipe = Pipe::new()?;
        let (timer_rd, timer_wr) = Pipe::new()?.split();
        let timer_notify = notify_pipe.clone_writer()?;

        debug!("Starting timer thread");
        let timer_thread = thread::Builder::new()
            .name("lcm-file-timer".into())
            .spawn(move || timer_thread(timer_rd, timer_notify))?;

        // The first event is due immediately.
        notify_pipe.poke()?;

        Ok(FileProvider {
            registry,
            state: Mutex::new(PlaybackState {
                log,
                event: Some(event),
                next_clock_time: -1,
            }),
            speed,
            notify_pipe,
            timer_wr,
            timer_thread: Some(timer_thread),
        })
    }

    /// This provider only replays traffic.
    pub fn publish(&self, _channel: &str, _data: &[u8]) -> Result<(), PublishError> {
        Err(PublishError::NotSupported)
    }

    /// Delivers the current event and schedules the next one.
    pub fn handle(&self) -> Result<(), HandleError> {
        {
            let state = self.state.lock().unwrap();
            if state.event.is_none() {
                return Err(HandleError::EndOfLog);
            }
        }

        self.notify_pipe.drain_one()?;

        let (event, recv_utime) = {
            let mut state = self.state.lock().unwrap();
            let now = utils::timestamp_now();
            // Initialize the wall clock if this is the first time through.
            if state.next_clock_time < 0 {
                state.next_clock_time = now;
            }
            let event = match state.event.take() {
                Some(event) => event,
                None => return Err(HandleError::EndOfLog),
            };
            (event, state.next_clock_time)
        };

        // The registry lock must not be held while callbacks run, and the
        // playback lock need not be.
        if self.registry.try_enqueue_message(&event.channel) {
            self.registry
                .dispatch(&event.channel, &event.data, recv_utime);
        }

        let mut state = self.state.lock().unwrap();
        let now = utils::timestamp_now();
        state.event = state.log.read_next_event()?;
        let next_timestamp = match state.event {
            Some(ref next) => next.timestamp,
            // End of file; the next handle call reports it.
            None => return Ok(()),
        };

        if self.speed > 0.0 {
            state.next_clock_time +=
                ((next_timestamp - event.timestamp) as f64 / self.speed) as i64;
        } else {
            state.next_clock_time = now;
        }

        if state.next_clock_time > now {
            let deadline = state.next_clock_time.to_ne_bytes();
            unistd::write(&self.timer_wr, &deadline).map_err(io_err)?;
        } else {
            self.notify_pipe.poke()?;
        }

        Ok(())
    }

    pub fn fileno(&self) -> Result<RawFd, HandleError> {
        Ok(self.notify_pipe.raw_read_fd())
    }
}

impl Drop for FileProvider {
    fn drop(&mut self) {
        debug!("Closing log playback provider");
        let abort = (-1i64).to_ne_bytes();
        if let Err(e) = unistd::write(&self.timer_wr, &abort) {
            warn!("Unable to stop the timer thread: {}", e);
        }
        if let Some(thread) = self.timer_thread.take() {
            if thread.join().is_err() {
                warn!("The timer thread panicked during shutdown.");
            }
        }
    }
}

fn io_err(errno: Errno) -> HandleError {
    HandleError::IoError(::std::io::Error::from(errno))
}

/// Sleeps out each deadline received on the timer pipe, then pokes the
/// notify pipe. A deadline arriving mid-sleep preempts the current one; a
/// negative deadline ends the thread.
fn timer_thread(timer_rd: OwnedFd, notify_wr: OwnedFd) {
    let mut bytes = [0u8; 8];
    loop {
        match unistd::read(&timer_rd, &mut bytes) {
            Ok(8) => {}
            Ok(_) => {
                warn!("Timer thread read a truncated deadline. Exiting.");
                return;
            }
            Err(Errno::EINTR) => continue,
            Err(e) => {
                warn!("Timer thread read failed: {}. Exiting.", e);
                return;
            }
        }

        let deadline = i64::from_ne_bytes(bytes);
        if deadline < 0 {
            return;
        }

        let now = utils::timestamp_now();
        if deadline > now {
            let sleep = Duration::from_micros((deadline - now) as u64);
            // Sleep until the next timed event, or until a new deadline
            // (or the abort) shows up on the pipe.
            match utils::wait_readable(timer_rd.as_fd(), Some(sleep)) {
                Ok(false) => utils::poke_fd(&notify_wr),
                Ok(true) => {}
                Err(e) => {
                    warn!("Timer thread poll failed: {}. Exiting.", e);
                    return;
                }
            }
        } else {
            utils::poke_fd(&notify_wr);
        }
    }
}
