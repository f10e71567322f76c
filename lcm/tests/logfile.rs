//! Playback of an event log through the `file://` provider.

extern crate lcm;
extern crate tempdir;

use std::sync::{Arc, Mutex};

use lcm::error::HandleError;
use lcm::eventlog::{EventLog, LogMode};
use lcm::Lcm;
use tempdir::TempDir;

#[test]
fn plays_a_log_back_in_order() {
    let dir = TempDir::new("logfile").unwrap();
    let path = dir.path().join("playback.lcmlog");

    {
        let mut log = EventLog::create(&path, LogMode::Write).unwrap();
        for i in 0..5i64 {
            let channel = if i % 2 == 0 { "TICK_EVEN" } else { "TICK_ODD" };
            log.write_event(1000 * (i + 1), channel, &[i as u8]).unwrap();
        }
    }

    // speed=0 plays the log as fast as the application drains it.
    let url = format!("file://{}?speed=0", path.display());
    let lcm = Lcm::with_lcm_url(&url).unwrap();

    let received = Arc::new(Mutex::new(Vec::new()));
    {
        let received = received.clone();
        lcm.subscribe("TICK_.*", move |rbuf| {
            received
                .lock()
                .unwrap()
                .push((rbuf.channel.to_string(), rbuf.data.to_vec(), rbuf.recv_utime));
        })
        .unwrap();
    }

    for _ in 0..5 {
        lcm.handle().unwrap();
    }

    // The log is exhausted now.
    match lcm.handle() {
        Err(HandleError::EndOfLog) => {}
        other => panic!("expected end of log, got {:?}", other),
    }

    let received = received.lock().unwrap();
    assert_eq!(received.len(), 5);
    for (i, entry) in received.iter().enumerate() {
        let expected_channel = if i % 2 == 0 { "TICK_EVEN" } else { "TICK_ODD" };
        assert_eq!(entry.0, expected_channel);
        assert_eq!(entry.1, vec![i as u8]);
    }
    // Delivery times come from the playback clock and never run backward.
    for pair in received.windows(2) {
        assert!(pair[0].2 <= pair[1].2);
    }
}

#[test]
fn subscriptions_filter_playback() {
    let dir = TempDir::new("logfile").unwrap();
    let path = dir.path().join("filtered.lcmlog");

    {
        let mut log = EventLog::create(&path, LogMode::Write).unwrap();
        log.write_event(1000, "WANTED", b"yes").unwrap();
        log.write_event(2000, "IGNORED", b"no").unwrap();
        log.write_event(3000, "WANTED", b"also").unwrap();
    }

    let url = format!("file://{}?speed=0", path.display());
    let lcm = Lcm::with_lcm_url(&url).unwrap();

    let received = Arc::new(Mutex::new(Vec::new()));
    {
        let received = received.clone();
        lcm.subscribe("WANTED", move |rbuf| {
            received.lock().unwrap().push(rbuf.data.to_vec());
        })
        .unwrap();
    }

    // Every event consumes a handle call whether or not anyone wants it.
    for _ in 0..3 {
        lcm.handle().unwrap();
    }

    assert_eq!(*received.lock().unwrap(), vec![b"yes".to_vec(), b"also".to_vec()]);
}

#[test]
fn missing_or_empty_logs_fail_creation() {
    assert!(Lcm::with_lcm_url("file:///no/such/file.lcmlog").is_err());

    let dir = TempDir::new("logfile").unwrap();
    let path = dir.path().join("empty.lcmlog");
    EventLog::create(&path, LogMode::Write).unwrap();
    let url = format!("file://{}", path.display());
    assert!(Lcm::with_lcm_url(&url).is_err());
}
