// utils tests
//
use crate::fdwatch::FdWatch;
use crate::region::Rect;
use crate::timing::{get_monotonic_nanos, StopWatch};

use std::io::Write;
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::time::Duration;

#[test]
fn rect_edges() {
    let r = Rect::from_edges(10, 20, 110, 70);
    assert_eq!(r.r_pos, (10, 20));
    assert_eq!(r.r_size, (100, 50));
    assert_eq!(r.right(), 110);
    assert_eq!(r.bottom(), 70);
}

#[test]
fn rect_overlap() {
    let a = Rect::new(0, 0, 100, 100);
    let b = Rect::new(50, 50, 100, 100);
    let c = Rect::new(100, 0, 20, 20);

    assert!(a.overlaps(&b));
    assert!(b.overlaps(&a));
    // sharing an edge is not an overlap
    assert!(!a.overlaps(&c));
    assert!(b.overlaps(&c));
}

#[test]
fn fdwatch_reports_ready_fd() {
    let (mut tx, rx) = UnixStream::pair().unwrap();
    let mut watch = FdWatch::new();
    watch.add_fd(rx.as_raw_fd());

    assert!(!watch.wait_for_events(Some(10)));
    tx.write_all(b"hello").unwrap();
    assert!(watch.wait_for_events(Some(1000)));
    assert!(watch.is_ready(rx.as_raw_fd()));
}

#[test]
fn fdwatch_waker_interrupts_wait() {
    let (_tx, rx) = UnixStream::pair().unwrap();
    let mut watch = FdWatch::new();
    watch.add_fd(rx.as_raw_fd());
    let waker = watch.create_waker().unwrap();

    let handle = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(20));
        waker.wake();
    });

    // Blocks until the other thread wakes us, nothing was readable
    assert!(!watch.wait_for_events(None));
    assert!(!watch.is_ready(rx.as_raw_fd()));
    handle.join().unwrap();

    // the wake was drained, so this times out again
    assert!(!watch.wait_for_events(Some(10)));
}

#[test]
fn monotonic_clock_moves_forward() {
    let mut sw = StopWatch::new();
    sw.start();
    let a = get_monotonic_nanos();
    std::thread::sleep(Duration::from_millis(2));
    let b = get_monotonic_nanos();
    sw.end();

    assert!(b > a);
    assert!(sw.get_duration() >= Duration::from_millis(2));
}
