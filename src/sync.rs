// Release and retire fences
//
// Each display counts committed frames on a timeline. A fence is a
// point on that timeline, and it signals once the timeline reaches it.
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

struct TimelineState {
    /// The last timeline point that has been signaled
    ts_signaled: Mutex<u64>,
    ts_cond: Condvar,
}

/// A point on a display's sync timeline
///
/// Handed to the server with every committed frame. Once signaled the
/// buffers it guards may be reused.
#[derive(Clone)]
pub struct Fence {
    f_point: u64,
    f_timeline: Arc<TimelineState>,
}

impl Fence {
    pub fn point(&self) -> u64 {
        self.f_point
    }

    pub fn is_signaled(&self) -> bool {
        *self.f_timeline.ts_signaled.lock() >= self.f_point
    }

    /// Block until signaled. Returns false on timeout.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut signaled = self.f_timeline.ts_signaled.lock();
        while *signaled < self.f_point {
            if self
                .f_timeline
                .ts_cond
                .wait_for(&mut signaled, timeout)
                .timed_out()
            {
                return *signaled >= self.f_point;
            }
        }
        true
    }
}

impl fmt::Debug for Fence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fence")
            .field("point", &self.f_point)
            .field("signaled", &self.is_signaled())
            .finish()
    }
}

/// A monotonically increasing counter of committed frames
pub struct SyncTimeline {
    st_state: Arc<TimelineState>,
    /// The last point handed out
    st_next: u64,
}

impl SyncTimeline {
    pub fn new() -> Self {
        Self {
            st_state: Arc::new(TimelineState {
                ts_signaled: Mutex::new(0),
                ts_cond: Condvar::new(),
            }),
            st_next: 0,
        }
    }

    /// Create a fence for the next point on this timeline
    pub fn create_fence(&mut self) -> Fence {
        self.st_next += 1;
        Fence {
            f_point: self.st_next,
            f_timeline: self.st_state.clone(),
        }
    }

    /// The point of the most recently created fence
    pub fn current_point(&self) -> u64 {
        self.st_next
    }

    pub fn signaled_point(&self) -> u64 {
        *self.st_state.ts_signaled.lock()
    }

    /// Signal every fence up to and including `point`
    ///
    /// The timeline never moves backwards, older points are ignored.
    pub fn signal(&self, point: u64) {
        let mut signaled = self.st_state.ts_signaled.lock();
        if point <= *signaled {
            return;
        }
        *signaled = point.min(self.st_next);
        self.st_state.ts_cond.notify_all();
    }

    /// Signal everything handed out so far
    pub fn signal_all(&self) {
        self.signal(self.st_next);
    }
}
