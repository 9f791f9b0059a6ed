//! Behavioural properties of the mock bridge, exercised against `LinearMemory`.

use device_mock_bridge::error::{evp_status, senscord_status, sess_status};
use device_mock_bridge::evp::{reason, EvpApiCall};
use device_mock_bridge::{
    BridgeConfig, EvpMock, GuestAddr, GuestMemory, HostModule, LinearMemory, PollStatus,
    SenscordMock, WasmValue,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const HANDLE: u32 = 999;

fn evp() -> Arc<EvpMock> {
    Arc::new(EvpMock::new(BridgeConfig::new()).unwrap())
}

fn memory() -> LinearMemory {
    LinearMemory::new(256 * 1024)
}

/// A message callback that records the topic of every delivery
fn topic_recorder(mem: &mut LinearMemory) -> (device_mock_bridge::FunctionHandle, Arc<Mutex<Vec<String>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let cb = mem.register_function(move |mem, argv| {
        sink.lock().push(mem.read_c_string(GuestAddr(argv[0]))?);
        Ok(0)
    });
    (cb, seen)
}

#[test]
fn events_are_delivered_in_enqueue_order() {
    let evp = evp();
    let mut mem = memory();
    let (cb, seen) = topic_recorder(&mut mem);
    evp.set_message_callback(HANDLE, cb, 0);

    for topic in ["a", "b", "c", "d"] {
        evp.push_message(topic, vec![]);
    }
    for _ in 0..4 {
        assert_eq!(evp.poll(&mut mem, HANDLE, 0), PollStatus::Ok);
    }

    assert_eq!(*seen.lock(), vec!["a", "b", "c", "d"]);
    assert_eq!(evp.poll(&mut mem, HANDLE, 0), PollStatus::TimedOut);
}

#[test]
fn shutdown_is_observed_by_every_poller() {
    let evp = evp();
    let pollers: Vec<_> = (0..2)
        .map(|_| {
            let evp = evp.clone();
            thread::spawn(move || {
                let mut mem = memory();
                loop {
                    match evp.poll(&mut mem, HANDLE, 2_000) {
                        PollStatus::Ok => continue,
                        other => return other,
                    }
                }
            })
        })
        .collect();

    thread::sleep(Duration::from_millis(20));
    evp.request_shutdown();

    for poller in pollers {
        assert_eq!(poller.join().unwrap(), PollStatus::ShouldExit);
    }
    // still there for the next poll
    let mut mem = memory();
    assert_eq!(evp.poll(&mut mem, HANDLE, 0), PollStatus::ShouldExit);
    assert_eq!(evp.metrics().snapshot().shutdowns, 3);
}

#[test]
fn events_without_a_listener_are_dropped_quietly() {
    let evp = evp();
    let mut mem = memory();

    evp.push_message("early", b"x".to_vec());
    assert_eq!(evp.poll(&mut mem, HANDLE, 0), PollStatus::Ok);
    assert!(mem.invocations().is_empty());
    assert_eq!(evp.metrics().snapshot().no_listener, 1);

    let (cb, seen) = topic_recorder(&mut mem);
    evp.set_message_callback(HANDLE, cb, 0);
    evp.push_message("late", b"y".to_vec());
    assert_eq!(evp.poll(&mut mem, HANDLE, 0), PollStatus::Ok);
    assert_eq!(*seen.lock(), vec!["late"]);

    // no-listener drops are not failures and stay out of the call log
    assert!(!evp
        .api_calls()
        .iter()
        .any(|r| matches!(r.call, EvpApiCall::DispatchDropped { .. })));
}

#[test]
fn latest_registration_wins() {
    let evp = evp();
    let mut mem = memory();
    let first = mem.register_function(|_, _| Ok(1));
    let second = mem.register_function(|_, _| Ok(2));

    evp.send_state(HANDLE, "led", b"on", first, 10);
    evp.send_state(HANDLE, "led", b"off", second, 20);
    assert_eq!(evp.poll(&mut mem, HANDLE, 0), PollStatus::Ok);
    assert_eq!(evp.poll(&mut mem, HANDLE, 0), PollStatus::Ok);

    assert_eq!(mem.invocations(), vec![(second, vec![reason::SENT, 20])]);
}

#[test]
fn payload_is_marshalled_and_released_after_the_callback() {
    let evp = evp();
    let mut mem = memory();
    let captured = Arc::new(Mutex::new(None));
    let sink = captured.clone();
    let cb = mem.register_function(move |mem, argv| {
        let topic = GuestAddr(argv[0]);
        assert!(mem.is_live(topic));
        assert_eq!(argv[2], 3);
        *sink.lock() = Some((topic, mem.read(topic, 5)?));
        Ok(0)
    });
    evp.set_configuration_callback(HANDLE, cb, 42);

    evp.push_configuration("t", vec![1, 2, 3]);
    assert_eq!(evp.poll(&mut mem, HANDLE, 0), PollStatus::Ok);

    let (addr, bytes) = captured.lock().take().unwrap();
    assert_eq!(bytes, b"t\0\x01\x02\x03".to_vec());
    assert!(!mem.is_live(addr));
    assert_eq!(mem.free_count(addr), 1);
    assert_eq!(mem.live_allocations(), 0);
}

#[test]
fn zero_timeout_returns_immediately() {
    let evp = evp();
    let mut mem = memory();
    let start = Instant::now();
    assert_eq!(
        evp.process_event(&mut mem, HANDLE, 0),
        evp_status::TIMEDOUT
    );
    assert!(start.elapsed() < Duration::from_millis(50));
}

#[test]
fn allocation_failure_drops_one_event_and_keeps_going() {
    let evp = evp();
    let mut mem = memory();
    let (cb, seen) = topic_recorder(&mut mem);
    evp.set_configuration_callback(HANDLE, cb, 0);

    mem.fail_next_allocations(1);
    evp.push_configuration("lost", vec![0; 16]);
    evp.push_configuration("kept", vec![0; 16]);

    assert_eq!(evp.poll(&mut mem, HANDLE, 0), PollStatus::Ok);
    assert_eq!(evp.poll(&mut mem, HANDLE, 0), PollStatus::Ok);

    assert_eq!(*seen.lock(), vec!["kept"]);
    let snapshot = evp.metrics().snapshot();
    assert_eq!(snapshot.allocation_failed, 1);
    assert_eq!(snapshot.invoked, 1);
    assert!(evp
        .api_calls()
        .iter()
        .any(|r| matches!(&r.call, EvpApiCall::DispatchDropped { event, .. } if event == "ConfigurationPushed")));
    assert_eq!(mem.live_allocations(), 0);
}

#[test]
fn callbacks_may_reenter_the_mock() {
    let evp = evp();
    let mut mem = memory();

    let replacement = mem.register_function(|_, _| Ok(7));
    let reentrant = {
        let evp = evp.clone();
        mem.register_function(move |_, _| {
            // re-register and send from inside a callback
            evp.set_configuration_callback(HANDLE, replacement, 2);
            evp.push_configuration("second", vec![]);
            Ok(0)
        })
    };
    evp.set_configuration_callback(HANDLE, reentrant, 1);

    evp.push_configuration("first", vec![]);
    assert_eq!(evp.poll(&mut mem, HANDLE, 0), PollStatus::Ok);
    assert_eq!(evp.poll(&mut mem, HANDLE, 0), PollStatus::Ok);

    let calls: Vec<_> = mem.invocations().into_iter().map(|(cb, _)| cb).collect();
    assert_eq!(calls, vec![reentrant, replacement]);
}

#[test]
fn driver_thread_feeds_a_blocked_guest() {
    let evp = evp();
    let mut mem = memory();
    let (cb, seen) = topic_recorder(&mut mem);
    evp.set_message_callback(HANDLE, cb, 0);

    let guest = {
        let evp = evp.clone();
        thread::spawn(move || {
            let mut polls = 0;
            while evp.poll(&mut mem, HANDLE, 2_000) != PollStatus::ShouldExit {
                polls += 1;
            }
            polls
        })
    };

    for i in 0..5 {
        thread::sleep(Duration::from_millis(2));
        evp.push_message(format!("m{}", i), vec![i as u8]);
    }
    evp.request_shutdown();

    assert_eq!(guest.join().unwrap(), 5);
    assert_eq!(*seen.lock(), vec!["m0", "m1", "m2", "m3", "m4"]);
}

#[test]
fn driver_waits_for_a_guest_call_before_replying() {
    let evp = evp();
    let mut mem = memory();
    let (cb, seen) = topic_recorder(&mut mem);
    evp.set_message_callback(HANDLE, cb, 0);
    let start_seq = evp.api_call_count() as u64;

    let driver = {
        let evp = evp.clone();
        thread::spawn(move || {
            let record = evp.wait_api_call(start_seq, Duration::from_secs(5))?;
            match record.call {
                EvpApiCall::SendTelemetry { handle, .. } => {
                    evp.push_message("reply", vec![]);
                    Some(handle)
                }
                _ => None,
            }
        })
    };

    thread::sleep(Duration::from_millis(20));
    let ack = mem.register_function(|_, _| Ok(0));
    assert_eq!(evp.send_telemetry(HANDLE, vec![], ack, 0), evp_status::OK);

    assert_eq!(driver.join().unwrap(), Some(HANDLE));
    // the reply may trail the telemetry ack
    for _ in 0..2 {
        assert_eq!(evp.poll(&mut mem, HANDLE, 2_000), PollStatus::Ok);
    }
    assert_eq!(*seen.lock(), vec!["reply"]);
    // waiting never consumes the log
    assert!(evp.wait_api_call(start_seq, Duration::ZERO).is_some());
    assert!(evp.wait_api_call(1_000, Duration::from_millis(10)).is_none());
}

#[test]
fn sensor_wait_api_call_sees_send_data() {
    let sensor = Arc::new(SenscordMock::new(BridgeConfig::new()).unwrap());
    let watcher = {
        let sensor = sensor.clone();
        thread::spawn(move || sensor.wait_api_call(0, Duration::from_secs(5)).map(|r| r.seq))
    };

    thread::sleep(Duration::from_millis(20));
    let mut mem = memory();
    let data = mem.allocate(4);
    assert_eq!(
        sensor.sess_send_data(&mut mem, data, vec![0; 4], 1),
        sess_status::OK
    );
    assert_eq!(watcher.join().unwrap(), Some(0));
    assert_eq!(sensor.api_call_count(), 1);
}

#[test]
fn cancellation_interrupts_a_blocked_poll() {
    let evp = evp();
    let cancel = evp.cancel_handle();

    let guest = {
        let evp = evp.clone();
        thread::spawn(move || {
            let mut mem = memory();
            let start = Instant::now();
            let status = evp.poll(&mut mem, HANDLE, 30_000);
            (status, start.elapsed())
        })
    };

    thread::sleep(Duration::from_millis(20));
    cancel.cancel();
    let (status, waited) = guest.join().unwrap();
    assert_eq!(status, PollStatus::ShouldExit);
    assert!(waited < Duration::from_secs(5));

    cancel.reset();
    let mut mem = memory();
    assert_eq!(evp.poll(&mut mem, HANDLE, 0), PollStatus::TimedOut);
    assert_eq!(evp.metrics().snapshot().cancellations, 1);
}

#[test]
fn sensor_pipeline_through_symbols() {
    let sensor = SenscordMock::new(BridgeConfig::new().with_frame_size(2, 2)).unwrap();
    let mut mem = memory();

    let core_out = mem.allocate(8);
    let raw_out = mem.allocate(24);
    let result = sensor
        .call(&mut mem, "senscord_core_init", &[WasmValue::from(core_out.0)])
        .unwrap();
    assert_eq!(result, Some(WasmValue::I32(senscord_status::OK)));

    let result = sensor
        .call(
            &mut mem,
            "senscord_channel_get_raw_data",
            &[WasmValue::I64(1), WasmValue::from(raw_out.0)],
        )
        .unwrap();
    assert_eq!(result, Some(WasmValue::I32(senscord_status::OK)));
    assert_eq!(mem.live_allocations(), 3);

    let delivered = Arc::new(Mutex::new(Vec::new()));
    let sink = delivered.clone();
    let cb = mem.register_function(move |_, argv| {
        sink.lock().push(argv.to_vec());
        Ok(0)
    });
    sensor.sess_register_send_data_callback(cb, 77);

    let data = mem.allocate(4);
    mem.write(data, &[9, 9, 9, 9]).unwrap();
    let result = sensor
        .call(
            &mut mem,
            "SessSendData",
            &[WasmValue::from(data.0), WasmValue::I32(4), WasmValue::I64(5)],
        )
        .unwrap();
    assert_eq!(result, Some(WasmValue::I32(sess_status::OK)));
    assert_eq!(*delivered.lock(), vec![vec![data.0, 77, 0]]);

    sensor
        .call(
            &mut mem,
            "senscord_stream_release_frame",
            &[WasmValue::I64(1), WasmValue::I64(1)],
        )
        .unwrap();
    // core_out, raw_out and data remain
    assert_eq!(mem.live_allocations(), 3);
}
