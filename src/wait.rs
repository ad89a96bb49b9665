use std::io;
use std::os::fd::BorrowedFd;
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

/// Readiness a blocked operation waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

impl Direction {
    fn flags(&self) -> PollFlags {
        match self {
            Direction::Read => PollFlags::POLLIN,
            Direction::Write => PollFlags::POLLOUT,
        }
    }
}

/// The wait for one blocked operation, bounded below by `floor`.
pub(crate) fn clamp(timeout: Duration, floor: Duration) -> Duration {
    timeout.max(floor)
}

/// Block until `fd` is ready in `direction` or `timeout` elapses.
///
/// Returns `Ok(false)` on timeout. An interrupted wait counts as a timeout.
/// Error and hang-up conditions count as ready, so that the next I/O call
/// reports them.
pub(crate) fn poll_one(
    fd: BorrowedFd<'_>,
    direction: Direction,
    timeout: Duration,
) -> io::Result<bool> {
    let mut fds = [PollFd::new(fd, direction.flags())];
    match poll(&mut fds, poll_timeout(timeout)) {
        Ok(0) => Ok(false),
        Ok(_) => Ok(fds[0].revents().map(|r| !r.is_empty()).unwrap_or(false)),
        Err(Errno::EINTR) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Block until any of `fds` is readable or `timeout` elapses.
///
/// Returns the indexes of the readable descriptors.
pub(crate) fn poll_readable(
    fds: &[BorrowedFd<'_>],
    timeout: Duration,
) -> io::Result<Vec<usize>> {
    if fds.is_empty() {
        std::thread::sleep(timeout);
        return Ok(Vec::new());
    }

    let mut pollfds: Vec<PollFd> = fds
        .iter()
        .map(|fd| PollFd::new(*fd, PollFlags::POLLIN))
        .collect();

    match poll(&mut pollfds, poll_timeout(timeout)) {
        Ok(0) => Ok(Vec::new()),
        Ok(_) => Ok(pollfds
            .iter()
            .enumerate()
            .filter(|(_, p)| p.revents().map(|r| !r.is_empty()).unwrap_or(false))
            .map(|(i, _)| i)
            .collect()),
        Err(Errno::EINTR) => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

fn poll_timeout(timeout: Duration) -> PollTimeout {
    PollTimeout::try_from(timeout).unwrap_or(PollTimeout::MAX)
}
