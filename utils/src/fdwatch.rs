// Helper class for watching file descriptors
//
// The event threads block in here, so every watch can carry a wake
// pipe that lets another thread interrupt the wait.
extern crate nix;

use nix::fcntl::OFlag;
use nix::sys::select::*;
use nix::sys::time::{TimeVal, TimeValLike};

use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsFd, BorrowedFd, RawFd};
use std::sync::Arc;

/// Interrupts a thread blocked in `FdWatch::wait_for_events`
///
/// Cheap to clone, every clone writes into the same pipe.
#[derive(Clone)]
pub struct Waker {
    wk_pipe: Arc<File>,
}

impl Waker {
    pub fn wake(&self) {
        // A full pipe means a wakeup is already pending
        let _ = (&*self.wk_pipe).write(&[1]);
    }
}

// A file descriptor watcher
pub struct FdWatch {
    // Fds to watch, owned by whoever registered them
    fdw_events: Vec<RawFd>,
    // Fds that were readable after the last wait
    fdw_ready: Vec<RawFd>,
    // read side of the wake pipe
    fdw_wake: Option<File>,
}

impl FdWatch {
    pub fn new() -> FdWatch {
        FdWatch {
            fdw_events: Vec::new(),
            fdw_ready: Vec::new(),
            fdw_wake: None,
        }
    }

    /// Watch `fd` for readability
    ///
    /// The caller keeps ownership and must keep the fd open for as
    /// long as it is registered here.
    pub fn add_fd(&mut self, fd: RawFd) {
        self.fdw_events.push(fd);
    }

    pub fn remove_fd(&mut self, fd: RawFd) {
        self.fdw_events.retain(|f| *f != fd);
    }

    /// Create the wake pipe for this watch and hand out its write end
    pub fn create_waker(&mut self) -> crate::Result<Waker> {
        let (read, write) = nix::unistd::pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK)?;
        self.fdw_wake = Some(File::from(read));

        Ok(Waker {
            wk_pipe: Arc::new(File::from(write)),
        })
    }

    /// Was `fd` readable when the last wait returned
    pub fn is_ready(&self, fd: RawFd) -> bool {
        self.fdw_ready.contains(&fd)
    }

    // Empty the wake pipe so the next wait blocks again
    fn drain_wake(&self) {
        if let Some(mut wake) = self.fdw_wake.as_ref() {
            let mut buf = [0; 64];
            loop {
                match wake.read(&mut buf) {
                    Ok(0) => break,
                    Ok(_) => continue,
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
            }
        }
    }

    // timeout in ms
    // returns true if one of the registered fds is ready to be read.
    // Being woken through the Waker returns false.
    pub fn wait_for_events(&mut self, timeout: Option<usize>) -> bool {
        self.fdw_ready.clear();

        let mut fdset = FdSet::new();
        for fd in self.fdw_events.iter() {
            // SAFETY: callers of add_fd keep the fd open while registered
            fdset.insert(unsafe { BorrowedFd::borrow_raw(*fd) });
        }
        if let Some(wake) = self.fdw_wake.as_ref() {
            fdset.insert(wake.as_fd());
        }

        let mut out = timeout.map(|ms| TimeVal::milliseconds(ms as i64));
        if select(None, Some(&mut fdset), None, None, out.as_mut()).is_err() {
            return false;
        }

        let woken = match self.fdw_wake.as_ref() {
            Some(wake) => fdset.contains(wake.as_fd()),
            None => false,
        };
        for fd in self.fdw_events.iter() {
            if fdset.contains(unsafe { BorrowedFd::borrow_raw(*fd) }) {
                self.fdw_ready.push(*fd);
            }
        }
        drop(fdset);

        if woken {
            self.drain_wake();
        }

        !self.fdw_ready.is_empty()
    }
}
