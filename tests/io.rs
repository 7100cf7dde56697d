use std::cell::RefCell;
use std::os::fd::AsRawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

use evio::{EventSet, Io, IoState, WriteBuffer, WriteStatus};

mod util;
use util::{drain_until, init_with_monitor, pipe, read_some, socketpair, write_all};

type Log = Rc<RefCell<Vec<(u8, WriteStatus)>>>;

fn logged_buffer(log: &Log, id: u8, len: usize) -> WriteBuffer {
    let log = Rc::clone(log);
    WriteBuffer::with_completion(vec![id; len], move |_buffer, status| {
        log.borrow_mut().push((id, status));
    })
}

#[test]
fn writes_complete_in_fifo_order() {
    let mut mon = init_with_monitor();
    let (rx, _rx_peer) = pipe();
    let (tx_peer, tx) = pipe();
    let tx_fd = tx.as_raw_fd();

    let io = Io::new(&mut mon, "fifo", rx, tx, false).unwrap();
    assert_eq!(io.write_state(), IoState::Stopped);
    io.set_write_timeout(Duration::from_millis(200));

    let log: Log = Rc::default();
    for id in 1..=3u8 {
        io.write_add(&mut mon, logged_buffer(&log, id, 16)).unwrap();
    }
    assert_eq!(io.write_state(), IoState::Started);
    assert_eq!(mon.active(tx_fd), Some(EventSet::OUT));

    let done = Rc::clone(&log);
    assert!(drain_until(&mut mon, Duration::from_secs(5), || {
        done.borrow().len() == 3
    }));
    assert_eq!(
        *log.borrow(),
        vec![
            (1, WriteStatus::Ok),
            (2, WriteStatus::Ok),
            (3, WriteStatus::Ok),
        ],
    );
    assert_eq!(io.write_state(), IoState::Stopped);
    assert_eq!(mon.active(tx_fd), Some(EventSet::EMPTY));

    // The payloads reached the descriptor back-to-back.
    let mut buf = [0u8; 64];
    assert_eq!(read_some(tx_peer.as_raw_fd(), &mut buf), 48);

    // Watchdog is disarmed: idling past the timeout completes nothing.
    std::thread::sleep(Duration::from_millis(300));
    mon.process_events().unwrap();
    assert_eq!(log.borrow().len(), 3);
    assert_eq!(io.write_state(), IoState::Stopped);
}

#[test]
fn stalled_write_times_out() {
    let mut mon = init_with_monitor();
    let (rx, _rx_peer) = pipe();
    let (tx_peer, tx) = pipe();

    // Shrink the pipe so a large buffer stalls after a partial write.
    assert!(unsafe { libc::fcntl(tx.as_raw_fd(), libc::F_SETPIPE_SZ, 4096) } > 0);

    let io = Io::new(&mut mon, "watchdog", rx, tx, false).unwrap();
    io.set_write_timeout(Duration::from_millis(100));

    let log: Log = Rc::default();
    io.write_add(&mut mon, logged_buffer(&log, 1, 65_536)).unwrap();

    // The peer never reads.
    let start = Instant::now();
    let done = Rc::clone(&log);
    assert!(drain_until(&mut mon, Duration::from_secs(5), || {
        !done.borrow().is_empty()
    }));
    assert!(start.elapsed() < Duration::from_secs(2));

    assert_eq!(*log.borrow(), vec![(1, WriteStatus::Timeout)]);
    assert_eq!(io.write_state(), IoState::Error);

    // The completion fired exactly once.
    std::thread::sleep(Duration::from_millis(150));
    mon.process_events().unwrap();
    assert_eq!(log.borrow().len(), 1);

    drop(tx_peer);
}

#[test]
fn abort_fans_out_in_order() {
    let mut mon = init_with_monitor();
    let (rx, _rx_peer) = pipe();
    let (_tx_peer, tx) = pipe();

    let io = Io::new(&mut mon, "abort", rx, tx, false).unwrap();

    let log: Log = Rc::default();
    for id in 1..=3u8 {
        io.write_add(&mut mon, logged_buffer(&log, id, 16)).unwrap();
    }

    // Abort before any readiness was drained: everything is still queued.
    io.write_abort(&mut mon).unwrap();
    assert_eq!(
        *log.borrow(),
        vec![
            (1, WriteStatus::Aborted),
            (2, WriteStatus::Aborted),
            (3, WriteStatus::Aborted),
        ],
    );
    assert_eq!(io.write_state(), IoState::Stopped);

    // No completion fires afterwards for those buffers.
    mon.process_events().unwrap();
    assert_eq!(log.borrow().len(), 3);
}

#[test]
fn write_error_drains_queue() {
    let mut mon = init_with_monitor();
    let (rx, _rx_peer) = pipe();
    let (tx_peer, tx) = pipe();
    let tx_fd = tx.as_raw_fd();

    let io = Io::new(&mut mon, "broken", rx, tx, false).unwrap();

    // Writing into a pipe whose read end is gone is a terminal error.
    drop(tx_peer);
    let log: Log = Rc::default();
    io.write_add(&mut mon, logged_buffer(&log, 1, 16)).unwrap();
    io.write_add(&mut mon, logged_buffer(&log, 2, 16)).unwrap();

    let done = Rc::clone(&log);
    assert!(drain_until(&mut mon, Duration::from_secs(5), || {
        done.borrow().len() == 2
    }));
    assert_eq!(
        *log.borrow(),
        vec![(1, WriteStatus::Error), (2, WriteStatus::Error)],
    );
    assert_eq!(io.write_state(), IoState::Error);
    // The error event removed the write source.
    assert_eq!(mon.active(tx_fd), None);
}

#[test]
fn empty_payload_rejected() {
    let mut mon = init_with_monitor();
    let (rx, _rx_peer) = pipe();
    let (_tx_peer, tx) = pipe();
    let io = Io::new(&mut mon, "invalid", rx, tx, false).unwrap();

    let log: Log = Rc::default();
    let err = io
        .write_add(&mut mon, logged_buffer(&log, 1, 0))
        .unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
    // Ownership of the payload still round-trips through the completion.
    assert_eq!(*log.borrow(), vec![(1, WriteStatus::Error)]);
    assert_eq!(io.write_state(), IoState::Stopped);
}

#[test]
fn read_parses_frames_across_events() {
    let mut mon = init_with_monitor();
    let (rx, rx_peer) = pipe();
    let (_tx_peer, tx) = pipe();
    let peer_fd = rx_peer.as_raw_fd();

    let io = Io::new(&mut mon, "framing", rx, tx, false).unwrap();
    assert_eq!(io.read_state(), IoState::Stopped);

    // Fixed 4-byte frames, parsed out of the ring by the callback.
    let frames: Rc<RefCell<Vec<Vec<u8>>>> = Rc::default();
    let sink = Rc::clone(&frames);
    io.read_start(
        move |rb, _newbytes| {
            let mut consumed = 0;
            while rb.len() >= 4 {
                let mut frame = Vec::with_capacity(4);
                while frame.len() < 4 {
                    let chunk = rb.read_slice();
                    let take = chunk.len().min(4 - frame.len());
                    frame.extend_from_slice(&chunk[..take]);
                    rb.consume(take);
                }
                sink.borrow_mut().push(frame);
                consumed += 4;
            }
            consumed
        },
        false,
    )
    .unwrap();
    assert_eq!(io.read_state(), IoState::Started);

    // Six bytes: one full frame plus a remainder held in the ring.
    write_all(peer_fd, b"ABCDEF");
    let got = Rc::clone(&frames);
    assert!(drain_until(&mut mon, Duration::from_secs(5), || {
        !got.borrow().is_empty()
    }));
    assert_eq!(*frames.borrow(), vec![b"ABCD".to_vec()]);

    // The remainder completes with the next event.
    write_all(peer_fd, b"GH");
    let got = Rc::clone(&frames);
    assert!(drain_until(&mut mon, Duration::from_secs(5), || {
        got.borrow().len() == 2
    }));
    assert_eq!(frames.borrow()[1], b"EFGH".to_vec());
}

#[test]
fn eof_stops_read_path() {
    let mut mon = init_with_monitor();
    let (rx, rx_peer) = pipe();
    let (_tx_peer, tx) = pipe();
    let rx_fd = rx.as_raw_fd();

    let io = Io::new(&mut mon, "eof", rx, tx, false).unwrap();
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&seen);
    io.read_start(
        move |rb, _newbytes| {
            let before = rb.len();
            rb.copy_into(&mut sink.borrow_mut());
            before
        },
        false,
    )
    .unwrap();

    write_all(rx_peer.as_raw_fd(), b"bye");
    let got = Rc::clone(&seen);
    assert!(drain_until(&mut mon, Duration::from_secs(5), || {
        got.borrow().len() == 3
    }));

    drop(rx_peer);
    assert!(drain_until(&mut mon, Duration::from_secs(5), || {
        io.read_state() == IoState::Stopped
    }));
    // The hangup also removed the read source.
    assert_eq!(mon.active(rx_fd), None);
}

#[test]
fn eof_ignored_keeps_read_path_started() {
    let mut mon = init_with_monitor();
    let (rx, rx_peer) = pipe();
    let (_tx_peer, tx) = pipe();
    let rx_fd = rx.as_raw_fd();

    let io = Io::new(&mut mon, "eof-ignored", rx, tx, true).unwrap();
    io.read_start(|rb, newbytes| {
        rb.consume(newbytes);
        newbytes
    }, false)
    .unwrap();

    drop(rx_peer);
    for _ in 0..10 {
        if mon.active(rx_fd).is_none() {
            break;
        }
        util::wait_readable(mon.as_raw_fd(), 200);
        mon.process_events().unwrap();
    }
    // The hangup removed the source, but the ignored end-of-file left the
    // read path running.
    assert_eq!(mon.active(rx_fd), None);
    assert_eq!(io.read_state(), IoState::Started);
}

#[test]
fn duplex_engine_over_socketpair() {
    let mut mon = init_with_monitor();
    let (local, peer) = socketpair();
    let peer_fd = peer.as_raw_fd();

    let io = Io::new_duplex(&mut mon, "duplex", local, false).unwrap();
    io.log_rx(true);
    io.log_tx(true);

    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&seen);
    io.read_start(
        move |rb, _newbytes| {
            let before = rb.len();
            rb.copy_into(&mut sink.borrow_mut());
            before
        },
        false,
    )
    .unwrap();

    let log: Log = Rc::default();
    io.write_add(&mut mon, logged_buffer(&log, 7, 4)).unwrap();

    write_all(peer_fd, b"hello");
    let got = Rc::clone(&seen);
    let sent = Rc::clone(&log);
    assert!(drain_until(&mut mon, Duration::from_secs(5), || {
        got.borrow().len() == 5 && !sent.borrow().is_empty()
    }));
    assert_eq!(*seen.borrow(), b"hello".to_vec());
    assert_eq!(*log.borrow(), vec![(7, WriteStatus::Ok)]);

    let mut buf = [0u8; 8];
    assert_eq!(read_some(peer_fd, &mut buf), 4);
    assert_eq!(&buf[..4], &[7u8; 4][..]);
}

#[test]
fn destroy_aborts_and_deregisters() {
    let mut mon = init_with_monitor();
    let (rx, _rx_peer) = pipe();
    let (_tx_peer, tx) = pipe();

    let io = Io::new(&mut mon, "teardown", rx, tx, false).unwrap();
    assert_eq!(mon.len(), 3); // rx + tx + watchdog

    let log: Log = Rc::default();
    io.write_add(&mut mon, logged_buffer(&log, 1, 16)).unwrap();
    io.destroy(&mut mon).unwrap();

    assert_eq!(*log.borrow(), vec![(1, WriteStatus::Aborted)]);
    assert!(mon.is_empty());

    // The engine is inert afterwards.
    let err = io
        .write_add(&mut mon, logged_buffer(&log, 2, 16))
        .unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EBADF));
    let err = io.read_start(|_rb, n| n, false).unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EBADF));
}

#[test]
fn read_start_requires_stopped() {
    let mut mon = init_with_monitor();
    let (rx, _rx_peer) = pipe();
    let (_tx_peer, tx) = pipe();
    let io = Io::new(&mut mon, "restart", rx, tx, false).unwrap();

    io.read_start(|_rb, n| n, false).unwrap();
    let err = io.read_start(|_rb, n| n, false).unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EBUSY));

    io.read_stop().unwrap();
    assert_eq!(io.read_state(), IoState::Stopped);
    io.read_start(|_rb, n| n, true).unwrap();
    assert_eq!(io.read_state(), IoState::Started);
}
