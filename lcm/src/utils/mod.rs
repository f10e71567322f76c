//! Small helpers shared by the providers.

use std::convert::TryFrom;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::unistd;

/// The current wall-clock time in microseconds since the epoch.
pub fn timestamp_now() -> i64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0));
    now.as_secs() as i64 * 1_000_000 + i64::from(now.subsec_micros())
}

/// A self-pipe.
///
/// The providers use these as condition variables that can participate in
/// `poll`: the write end is poked to signal readiness and the read end is
/// handed to whoever needs to wait, including the application through
/// `Lcm::fileno`.
pub struct Pipe {
    rd: OwnedFd,
    wr: OwnedFd,
}
impl Pipe {
    /// Creates a pipe with both ends blocking.
    pub fn new() -> io::Result<Pipe> {
        let (rd, wr) = unistd::pipe().map_err(io::Error::from)?;
        Ok(Pipe { rd, wr })
    }

    /// Creates a pipe whose write end does not block.
    ///
    /// Used for notification pipes that are only ever poked with single
    /// bytes. A full pipe means the reader already has plenty of wakeups
    /// pending, so dropping the write is fine.
    pub fn notify() -> io::Result<Pipe> {
        let pipe = Pipe::new()?;
        fcntl(&pipe.wr, FcntlArg::F_SETFL(OFlag::O_NONBLOCK)).map_err(io::Error::from)?;
        Ok(pipe)
    }

    /// Writes a single byte to the pipe.
    pub fn poke(&self) -> io::Result<()> {
        match unistd::write(&self.wr, b"+") {
            Ok(_) => Ok(()),
            // A full notification pipe already guarantees a wakeup.
            Err(Errno::EAGAIN) => Ok(()),
            Err(e) => Err(io::Error::from(e)),
        }
    }

    /// Reads a single byte from the pipe, blocking until one is available.
    pub fn drain_one(&self) -> io::Result<()> {
        let mut byte = [0u8; 1];
        loop {
            match unistd::read(&self.rd, &mut byte) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "read 0 bytes from notify pipe",
                    ))
                }
                Ok(_) => return Ok(()),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from(e)),
            }
        }
    }

    /// The read end, for polling.
    pub fn read_fd(&self) -> BorrowedFd {
        self.rd.as_fd()
    }

    /// The raw read end, for handing to the application.
    pub fn raw_read_fd(&self) -> RawFd {
        self.rd.as_raw_fd()
    }

    /// A duplicate of the write end, for handing to a background thread.
    pub fn clone_writer(&self) -> io::Result<OwnedFd> {
        self.wr.try_clone()
    }

    /// Splits the pipe into its read and write ends.
    pub fn split(self) -> (OwnedFd, OwnedFd) {
        (self.rd, self.wr)
    }
}

/// Pokes a pipe through a bare write end.
pub fn poke_fd(wr: &OwnedFd) {
    if let Err(e) = unistd::write(wr, b"+") {
        if e != Errno::EAGAIN {
            warn!("write to notify pipe failed: {}", e);
        }
    }
}

/// Waits for a file descriptor to become readable.
///
/// Returns `false` if the timeout expired first. `None` waits forever.
pub fn wait_readable(fd: BorrowedFd, timeout: Option<Duration>) -> io::Result<bool> {
    let timeout = match timeout {
        None => PollTimeout::NONE,
        Some(d) => {
            let millis = d.as_millis().min(i32::max_value() as u128) as i32;
            PollTimeout::try_from(millis).unwrap_or(PollTimeout::MAX)
        }
    };

    loop {
        let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
        match poll(&mut fds, timeout) {
            Ok(0) => return Ok(false),
            Ok(_) => {
                return Ok(fds[0]
                    .revents()
                    .map(|r| r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP))
                    .unwrap_or(false))
            }
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(io::Error::from(e)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn poke_and_drain() {
        let pipe = Pipe::notify().unwrap();
        pipe.poke().unwrap();
        pipe.poke().unwrap();
        assert!(wait_readable(pipe.read_fd(), Some(Duration::from_millis(10))).unwrap());
        pipe.drain_one().unwrap();
        pipe.drain_one().unwrap();
        assert!(!wait_readable(pipe.read_fd(), Some(Duration::from_millis(10))).unwrap());
    }

    #[test]
    fn timestamps_are_microseconds() {
        let a = timestamp_now();
        let b = timestamp_now();
        assert!(b >= a);
        // Sometime after 2020 and before the heat death of the test suite.
        assert!(a > 1_577_836_800_000_000);
    }
}
