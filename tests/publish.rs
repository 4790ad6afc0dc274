mod common;

use common::*;

use stima::config::CONFIG;
use stima::network::publish_topic;
use stima::scheduler::TaskId;
use stima::sensors::SensorKind;
use stima::settings::Configuration;
use stima::station::Fatal;
use stima::store::{CURSOR_RECORD_LEN, Cursor, CursorError};

fn at(day: stima::clock::Day, sensor: u8, record: u32) -> Cursor {
    Cursor {
        day,
        sensor,
        record,
    }
}

#[test]
fn resumes_mid_sensor_and_moves_on_to_the_next_sensor() {
    let mut dev = devices();
    seed_day(&mut dev.log_store, DAY, &[5, 2]);
    dev.cursor_store.set_raw(at(DAY, 0, 3).encode());

    let mut h = Harness::boot(dev);

    let dev = h.dev();
    assert_eq!(
        dev.pubsub.payloads(),
        vec![
            payload(DAY, 0, 3),
            payload(DAY, 0, 4),
            payload(DAY, 1, 0),
            payload(DAY, 1, 1),
        ]
    );
    assert_eq!(stored_cursor(&dev.cursor_store), Some(at(DAY, 1, 2)));

    let configuration = Configuration::default();
    let topic = publish_topic(
        &configuration.mqtt_root_topic,
        &configuration.module_name,
        "co2",
    );
    assert_eq!(dev.pubsub.published[0].0, topic.as_str());
}

#[test]
fn refused_publish_keeps_the_end_of_sensor_position() -> Result<(), Fatal> {
    let mut dev = devices();
    seed_day(&mut dev.log_store, DAY, &[5, 2]);
    dev.cursor_store.set_raw(at(DAY, 0, 3).encode());
    dev.pubsub.ack_budget = Some(2);

    let mut h = Harness::boot(dev);
    assert_eq!(
        h.dev().pubsub.payloads(),
        vec![payload(DAY, 0, 3), payload(DAY, 0, 4)]
    );
    assert_eq!(stored_cursor(&h.dev().cursor_store), Some(at(DAY, 0, 5)));
    assert_eq!(h.station.context().status.publish_failures, 1);

    h.dev().pubsub.ack_budget = None;
    h.trigger(TaskId::Publish)?;
    assert_eq!(
        h.dev().pubsub.payloads()[2..],
        [payload(DAY, 1, 0), payload(DAY, 1, 1)]
    );
    assert_eq!(stored_cursor(&h.dev().cursor_store), Some(at(DAY, 1, 2)));
    Ok(())
}

#[test]
fn broker_unreachable_leaves_cursor_untouched() -> Result<(), Fatal> {
    let mut dev = devices();
    seed_day(&mut dev.log_store, DAY, &[3]);
    dev.cursor_store.set_raw(at(DAY, 0, 1).encode());
    dev.pubsub.refuse_connect = true;

    let mut h = Harness::boot(dev);
    let dev = h.dev();
    assert_eq!(dev.pubsub.connects, u32::from(CONFIG.publish.connect_attempts));
    assert!(dev.pubsub.published.is_empty());
    assert_eq!(dev.cursor_store.writes(), 0);
    assert_eq!(stored_cursor(&dev.cursor_store), Some(at(DAY, 0, 1)));
    assert!(!dev.cursor_store.is_open());
    assert_eq!(dev.log_store.open_handles(), 0);

    dev.pubsub.refuse_connect = false;
    h.trigger(TaskId::Publish)?;
    assert_eq!(
        h.dev().pubsub.payloads(),
        vec![payload(DAY, 0, 1), payload(DAY, 0, 2)]
    );
    Ok(())
}

#[test]
fn session_drop_mid_walk_is_retried_without_duplicates() {
    let mut dev = devices();
    seed_day(&mut dev.log_store, DAY, &[4]);
    dev.pubsub.drop_after = Some(2);

    let mut h = Harness::boot(dev);
    let expected: Vec<_> = (0..4).map(|i| payload(DAY, 0, i)).collect();
    assert_eq!(h.dev().pubsub.payloads(), expected);
    assert_eq!(h.dev().pubsub.connects, 2);
    assert_eq!(stored_cursor(&h.dev().cursor_store), Some(at(DAY, 0, 4)));
    assert_eq!(h.station.context().status.publish_failures, 1);
}

#[test]
fn session_that_keeps_dropping_is_retried_once() {
    let mut dev = devices();
    seed_day(&mut dev.log_store, DAY, &[4]);
    dev.pubsub.flaky = true;

    let mut h = Harness::boot(dev);
    // One record per session: the first activation and its single retry.
    assert_eq!(
        h.dev().pubsub.payloads(),
        vec![payload(DAY, 0, 0), payload(DAY, 0, 1)]
    );
    assert_eq!(stored_cursor(&h.dev().cursor_store), Some(at(DAY, 0, 2)));
    assert_eq!(h.station.context().status.publish_failures, 2);
    assert!(!h.station.dispatcher().is_signaled(TaskId::Publish));
}

#[test]
fn open_day_only_drains_the_cursor_sensor() -> Result<(), Fatal> {
    let mut dev = devices();
    let epoch = DAY.start_epoch() + 3_600;
    dev.rtc.epoch = Some(epoch);
    dev.time_source.response = Some(epoch);
    seed_day(&mut dev.log_store, DAY, &[3, 2]);

    let mut h = Harness::boot(dev);
    assert_eq!(
        h.dev().pubsub.payloads(),
        vec![payload(DAY, 0, 0), payload(DAY, 0, 1), payload(DAY, 0, 2)]
    );
    assert_eq!(stored_cursor(&h.dev().cursor_store), Some(at(DAY, 0, 3)));

    // Lines of the cursor sensor written later the same day are picked up.
    append_record(&mut h.dev().log_store, DAY, &record(DAY, 0, 3));
    h.trigger(TaskId::Publish)?;
    assert_eq!(h.dev().pubsub.payloads()[3..], [payload(DAY, 0, 3)]);

    // Once the day is over the other sensors follow.
    h.interrupts.set_epoch(TODAY.start_epoch() + 60);
    h.trigger(TaskId::Publish)?;
    assert_eq!(
        h.dev().pubsub.payloads()[4..],
        [payload(DAY, 1, 0), payload(DAY, 1, 1)]
    );
    assert_eq!(stored_cursor(&h.dev().cursor_store), Some(at(DAY, 1, 2)));
    Ok(())
}

#[test]
fn walk_continues_into_later_days() {
    let mut dev = devices();
    let earlier = stima::clock::Day(DAY.0 - 1);
    seed_day(&mut dev.log_store, earlier, &[1, 1]);
    seed_day(&mut dev.log_store, DAY, &[2]);

    let mut h = Harness::boot(dev);
    assert_eq!(
        h.dev().pubsub.payloads(),
        vec![
            payload(earlier, 0, 0),
            payload(earlier, 1, 0),
            payload(DAY, 0, 0),
            payload(DAY, 0, 1),
        ]
    );
    assert_eq!(stored_cursor(&h.dev().cursor_store), Some(at(DAY, 0, 2)));
}

#[test]
fn failed_cursor_write_replays_the_record() -> Result<(), Fatal> {
    let mut dev = devices();
    seed_day(&mut dev.log_store, DAY, &[2]);
    dev.cursor_store.set_fail_writes(true);

    let mut h = Harness::boot(dev);
    assert_eq!(h.dev().pubsub.payloads(), vec![payload(DAY, 0, 0)]);
    assert_eq!(stored_cursor(&h.dev().cursor_store), None);

    h.dev().cursor_store.set_fail_writes(false);
    h.trigger(TaskId::Publish)?;
    assert_eq!(
        h.dev().pubsub.payloads(),
        vec![payload(DAY, 0, 0), payload(DAY, 0, 0), payload(DAY, 0, 1)]
    );
    assert_eq!(stored_cursor(&h.dev().cursor_store), Some(at(DAY, 0, 2)));
    Ok(())
}

#[test]
fn empty_store_still_connects_for_remote_requests() {
    let mut h = Harness::boot(devices());
    let dev = h.dev();
    assert_eq!(dev.pubsub.connects, 1);
    assert!(dev.pubsub.published.is_empty());
    assert!(!dev.pubsub.connected);
    assert_eq!(stored_cursor(&dev.cursor_store), None);
}

#[test]
fn corrupt_cursor_record_is_fatal() {
    let mut dev = devices();
    seed_day(&mut dev.log_store, DAY, &[1]);
    dev.cursor_store.set_raw([0xAA; CURSOR_RECORD_LEN]);

    let mut h = Harness::new(dev);
    assert_eq!(
        h.run_until_idle(),
        Err(Fatal::CorruptCursor(CursorError::BadMagic))
    );
    assert!(h.dev().pubsub.published.is_empty());
}

#[test]
fn cursor_record_with_bad_checksum_is_fatal() {
    let mut dev = devices();
    seed_day(&mut dev.log_store, DAY, &[1]);
    let mut raw = at(DAY, 0, 0).encode();
    raw[7] ^= 0x01;
    dev.cursor_store.set_raw(raw);

    let mut h = Harness::new(dev);
    assert_eq!(
        h.run_until_idle(),
        Err(Fatal::CorruptCursor(CursorError::BadCrc))
    );
}

#[test]
fn storage_error_suppresses_publishing() -> Result<(), Fatal> {
    let mut dev = devices();
    seed_day(&mut dev.log_store, DAY, &[2]);
    dev.log_store.set_available(false);

    let mut h = Harness::boot(dev);
    assert!(h.station.context().status.storage_error);
    assert!(h.dev().pubsub.published.is_empty());

    // Still set: the task does not even try.
    h.trigger(TaskId::Publish)?;
    assert_eq!(h.dev().pubsub.connects, 0);
    Ok(())
}

#[test]
fn sample_in_progress_at_midnight_keeps_its_day_open() -> Result<(), Fatal> {
    let mut configuration = Configuration::default();
    configuration
        .sensors
        .push(sensor_config(SensorKind::S8, 0x01, "co2_2"))
        .expect("room for sensor");
    let mut dev = devices_with(Some(configuration));
    let last_minute = TODAY.start_epoch() - 60;
    dev.rtc.epoch = Some(last_minute - 30);
    dev.time_source.response = Some(last_minute - 30);
    seed_day(&mut dev.log_store, DAY, &[1, 1, 1]);
    let mut h = Harness::boot(dev);

    // The 23:59 sample: the first sensor is read, the second is still busy.
    h.dev().sensors.get_mut(1).stuck = true;
    h.interrupts.set_epoch(last_minute);
    h.station.signal(TaskId::SensorsReading);
    for _ in 0..5 {
        h.step()?;
    }
    assert_eq!(h.station.context().sampling, Some(last_minute));

    // Midnight passes and the supervisor starts a publish walk.
    h.interrupts.set_epoch(TODAY.start_epoch() + 3);
    h.station.signal(TaskId::Supervisor);
    let mut steps = 0;
    while !h.station.dispatcher().is_signaled(TaskId::Publish) {
        h.step()?;
        steps += 1;
        assert!(steps < 20, "publish never started");
    }
    while h.station.dispatcher().is_signaled(TaskId::Publish) {
        h.step()?;
        steps += 1;
        assert!(steps < 200, "publish never ended");
    }
    assert!(h.station.dispatcher().is_signaled(TaskId::SensorsReading));
    assert_eq!(stored_cursor(&h.dev().cursor_store).map(|c| c.sensor), Some(0));

    // The cycle completes and the day is sealed for real.
    h.dev().sensors.get_mut(1).stuck = false;
    h.run_until_idle()?;
    assert_eq!(h.station.context().sampling, None);
    h.trigger(TaskId::Publish)?;

    let published = h.dev().pubsub.payloads();
    let records = day_records(&h.dev().log_store, DAY);
    assert_eq!(records.len(), 6);
    for record in &records {
        let payload = record.payload().expect("payload fits");
        let payload = String::from_utf8(payload.to_vec()).expect("utf-8 payload");
        assert!(
            published.contains(&payload),
            "sensor {} at {} never published",
            record.sensor,
            record.timestamp
        );
    }
    assert_eq!(stored_cursor(&h.dev().cursor_store), Some(at(DAY, 2, 2)));
    Ok(())
}

#[test]
fn retry_after_session_drop_gets_its_own_budget() -> Result<(), Fatal> {
    let mut dev = devices();
    seed_day(&mut dev.log_store, DAY, &[4]);
    dev.pubsub.drop_after = Some(2);

    let mut h = Harness::new(dev);
    let publish = TaskId::Publish.index();
    let mut first = None;
    for _ in 0..MAX_STEPS {
        h.step()?;
        if first.is_none() {
            first = h.station.context().active_since[publish];
        }
        if h.dev().pubsub.connects == 2 {
            break;
        }
    }
    let first = first.expect("publish ran");
    let retry = h.station.context().active_since[publish].expect("retry running");
    assert!(retry > first);
    Ok(())
}
