//! End-to-end tests of the subscription and dispatch core against a
//! synthetic tracefs tree and a recording monitor.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracesensor::config::Config;
use tracesensor::decode::Value;
use tracesensor::events::file::FileEventKind;
use tracesensor::events::network::NetworkEventKind;
use tracesensor::events::process::ProcessEventKind;
use tracesensor::events::syscall::SyscallEventKind;
use tracesensor::events::{kernel::KernelCallFilter, EventPayload, EventSelector};
use tracesensor::filter::Predicate;
use tracesensor::monitor::{EventMonitor, MonitorSample, SampleRecord};
use tracesensor::process::{TableContainerLookup, TableProcessCache};
use tracesensor::sensor::{event_id, Sensor, SubscriptionRequest};

const FORK_ID: u16 = 310;
const SWITCH_ID: u16 = 316;
const SYS_ENTER_ID: u16 = 20;
const CONNECT_ID: u16 = 520;
const OPEN_ID: u16 = 501;

/// Monitor that records every control call for later assertions.
#[derive(Default)]
struct RecordingMonitor {
    state: parking_lot::Mutex<MonitorState>,
}

#[derive(Default)]
struct MonitorState {
    registered: HashMap<u16, usize>,
    unregistered: HashMap<u16, usize>,
    enable_calls: HashMap<u16, usize>,
}

impl RecordingMonitor {
    fn register_count(&self, id: u16) -> usize {
        self.state.lock().registered.get(&id).copied().unwrap_or(0)
    }

    fn unregister_count(&self, id: u16) -> usize {
        self.state
            .lock()
            .unregistered
            .get(&id)
            .copied()
            .unwrap_or(0)
    }

    fn enabled(&self, id: u16) -> bool {
        let state = self.state.lock();
        state.registered.get(&id).copied().unwrap_or(0)
            > state.unregistered.get(&id).copied().unwrap_or(0)
    }
}

impl EventMonitor for RecordingMonitor {
    fn register_event(&self, event_id: u16) -> anyhow::Result<()> {
        *self.state.lock().registered.entry(event_id).or_default() += 1;
        Ok(())
    }

    fn unregister_event(&self, event_id: u16) {
        *self.state.lock().unregistered.entry(event_id).or_default() += 1;
    }

    fn enable(&self, event_id: u16) {
        *self.state.lock().enable_calls.entry(event_id).or_default() += 1;
    }

    fn disable(&self, _event_id: u16) {}

    fn enable_all(&self) {}
}

fn write_format(root: &Path, name: &str, id: u16, extra: &str) {
    let dir = root.join("events").join(name);
    std::fs::create_dir_all(&dir).unwrap();
    let mut f = std::fs::File::create(dir.join("format")).unwrap();
    write!(
        f,
        "name: {}\nID: {}\nformat:\n\
         \tfield:unsigned short common_type;\toffset:0;\tsize:2;\tsigned:0;\n\
         \tfield:unsigned char common_flags;\toffset:2;\tsize:1;\tsigned:0;\n\
         \tfield:unsigned char common_preempt_count;\toffset:3;\tsize:1;\tsigned:0;\n\
         \tfield:int common_pid;\toffset:4;\tsize:4;\tsigned:1;\n{}",
        name, id, extra
    )
    .unwrap();
}

/// Synthetic tracefs tree with the tracepoints these tests use.
fn write_tracefs(root: &Path) {
    write_format(
        root,
        "sched/sched_process_fork",
        FORK_ID,
        "\tfield:char parent_comm[16];\toffset:8;\tsize:16;\tsigned:1;\n\
         \tfield:pid_t parent_pid;\toffset:24;\tsize:4;\tsigned:1;\n\
         \tfield:char child_comm[16];\toffset:28;\tsize:16;\tsigned:1;\n\
         \tfield:pid_t child_pid;\toffset:44;\tsize:4;\tsigned:1;\n",
    );
    write_format(
        root,
        "sched/sched_switch",
        SWITCH_ID,
        "\tfield:char prev_comm[16];\toffset:8;\tsize:16;\tsigned:1;\n\
         \tfield:pid_t prev_pid;\toffset:24;\tsize:4;\tsigned:1;\n",
    );
    write_format(
        root,
        "raw_syscalls/sys_enter",
        SYS_ENTER_ID,
        "\tfield:long id;\toffset:8;\tsize:8;\tsigned:1;\n\
         \tfield:unsigned long args[6];\toffset:16;\tsize:48;\tsigned:0;\n",
    );
    write_format(
        root,
        "syscalls/sys_enter_connect",
        CONNECT_ID,
        "\tfield:int __syscall_nr;\toffset:8;\tsize:4;\tsigned:1;\n\
         \tfield:int fd;\toffset:16;\tsize:8;\tsigned:0;\n\
         \tfield:struct sockaddr * uservaddr;\toffset:24;\tsize:8;\tsigned:0;\n\
         \tfield:int addrlen;\toffset:32;\tsize:8;\tsigned:0;\n",
    );
    write_format(
        root,
        "fs/do_sys_open",
        OPEN_ID,
        "\tfield:__data_loc char[] filename;\toffset:8;\tsize:4;\tsigned:1;\n\
         \tfield:int flags;\toffset:12;\tsize:4;\tsigned:1;\n\
         \tfield:int mode;\toffset:16;\tsize:4;\tsigned:1;\n",
    );
}

struct Fixture {
    sensor: Arc<Sensor>,
    monitor: Arc<RecordingMonitor>,
    _tmp: tempfile::TempDir,
}

fn fixture_with(channel_buffer_length: usize) -> Fixture {
    let tmp = tempfile::tempdir().unwrap();
    write_tracefs(tmp.path());

    let monitor = Arc::new(RecordingMonitor::default());
    let cfg = Config {
        tracing_dir: Some(tmp.path().to_path_buf()),
        run_dir: tmp.path().join("run"),
        channel_buffer_length,
        ..Default::default()
    };
    let sensor = Sensor::start(
        cfg,
        Arc::clone(&monitor) as Arc<dyn EventMonitor>,
        Arc::new(TableProcessCache::new()),
        Arc::new(TableContainerLookup::new()),
    )
    .unwrap();

    Fixture {
        sensor,
        monitor,
        _tmp: tmp,
    }
}

fn fixture() -> Fixture {
    fixture_with(1024)
}

fn fork_request() -> SubscriptionRequest {
    SubscriptionRequest {
        events: EventSelector {
            process: vec![ProcessEventKind::Fork],
            ..Default::default()
        },
        filter: None,
    }
}

/// A sched_process_fork sample with the given pids and sample time.
fn fork_sample(time: u64, pid: i32, child_pid: i32) -> MonitorSample {
    let mut raw = vec![0u8; 48];
    raw[0..2].copy_from_slice(&FORK_ID.to_le_bytes());
    raw[4..8].copy_from_slice(&pid.to_le_bytes());
    raw[24..28].copy_from_slice(&pid.to_le_bytes());
    raw[44..48].copy_from_slice(&child_pid.to_le_bytes());

    MonitorSample::new(SampleRecord {
        time,
        cpu: 1,
        raw_data: raw,
        ..Default::default()
    })
}

fn switch_sample(time: u64, pid: i32) -> MonitorSample {
    let mut raw = vec![0u8; 28];
    raw[0..2].copy_from_slice(&SWITCH_ID.to_le_bytes());
    raw[4..8].copy_from_slice(&pid.to_le_bytes());
    raw[24..28].copy_from_slice(&pid.to_le_bytes());

    MonitorSample::new(SampleRecord {
        time,
        cpu: 0,
        raw_data: raw,
        ..Default::default()
    })
}

/// Poll until `predicate` holds, failing after a second. Teardown runs on a
/// spawned task, so assertions about it need a grace period.
async fn eventually(mut predicate: impl FnMut() -> bool) {
    for _ in 0..100 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 1s");
}

#[tokio::test]
async fn test_stamping_is_reproducible() {
    let fx = fixture();
    let sensor = &fx.sensor;

    let mut stream = sensor.subscribe(fork_request()).unwrap().unwrap();

    let sample_time = (sensor.boot_monotime() + 500) as u64;
    sensor.dispatch(fork_sample(sample_time, 40, 41));

    let event = stream.next().await.unwrap();
    assert_eq!(event.sequence, 1);
    assert_eq!(event.monotime_ns, 500);
    assert_eq!(event.sensor_id, sensor.id());
    assert_eq!(event.id, event_id(sensor.id(), 1, 500));
    assert_eq!(event.pid, 40);
    assert_eq!(event.cpu, 1);
    assert_eq!(
        event.payload,
        EventPayload::ProcessFork {
            parent_pid: 40,
            child_pid: 41,
        }
    );
}

#[tokio::test]
async fn test_delivery_order_and_sequence_contiguity() {
    let fx = fixture();
    let sensor = &fx.sensor;

    let mut stream = sensor.subscribe(fork_request()).unwrap().unwrap();

    let boot = sensor.boot_monotime();
    for i in 0..20i32 {
        sensor.dispatch(fork_sample((boot + 1000 + i as i64) as u64, i, i + 1));
    }

    let mut ids = std::collections::HashSet::new();
    for expected in 1..=20u64 {
        let event = stream.next().await.unwrap();
        assert_eq!(event.sequence, expected);
        assert_eq!(event.monotime_ns, 1000 + (expected as i64 - 1));
        assert!(ids.insert(event.id.clone()), "event ids must be unique");
    }
}

#[tokio::test]
async fn test_filter_selects_matching_events() {
    let fx = fixture();
    let sensor = &fx.sensor;

    let request = SubscriptionRequest {
        filter: Some(Predicate::Eq("child_pid".into(), Value::I32(7))),
        ..fork_request()
    };
    let mut stream = sensor.subscribe(request).unwrap().unwrap();

    let boot = sensor.boot_monotime() as u64;
    for child in [5, 7, 9, 7, 11] {
        sensor.dispatch(fork_sample(boot + 1, 1, child));
    }

    for _ in 0..2 {
        let event = stream.next().await.unwrap();
        assert!(matches!(
            event.payload,
            EventPayload::ProcessFork { child_pid: 7, .. }
        ));
    }
    assert!(stream.try_next().is_none());
}

#[tokio::test]
async fn test_filter_evaluation_error_skips_subscriber_only() {
    let fx = fixture();
    let sensor = &fx.sensor;

    let broken = SubscriptionRequest {
        filter: Some(Predicate::Eq("no_such_field".into(), Value::I32(1))),
        ..fork_request()
    };
    let mut broken_stream = sensor.subscribe(broken).unwrap().unwrap();
    let mut ok_stream = sensor.subscribe(fork_request()).unwrap().unwrap();

    sensor.dispatch(fork_sample(sensor.boot_monotime() as u64 + 1, 1, 2));

    assert!(ok_stream.next().await.is_some());
    assert!(broken_stream.try_next().is_none());
    assert_eq!(sensor.metrics().snapshot().filter_errors, 1);
}

#[tokio::test]
async fn test_backpressure_isolation() {
    // Subscriber channels hold 2 events.
    let fx = fixture_with(2);
    let sensor = &fx.sensor;

    let stuck_stream = sensor.subscribe(fork_request()).unwrap().unwrap();
    let mut live_stream = sensor.subscribe(fork_request()).unwrap().unwrap();

    let boot = sensor.boot_monotime() as u64;
    for i in 0..100i32 {
        sensor.dispatch(fork_sample(boot + 1, 1, i));
        // The live subscriber keeps draining; the stuck one never reads.
        let event = live_stream.next().await.unwrap();
        assert!(matches!(
            event.payload,
            EventPayload::ProcessFork { child_pid, .. } if child_pid == i
        ));
    }

    assert_eq!(sensor.dropped_events(stuck_stream.id()), Some(98));
    assert_eq!(sensor.metrics().snapshot().backpressure_drops, 98);
    drop(stuck_stream);
}

#[tokio::test]
async fn test_teardown_unregisters_last_user_exactly_once() {
    let fx = fixture();
    let sensor = &fx.sensor;
    let monitor = &fx.monitor;

    let switch_request = SubscriptionRequest {
        events: EventSelector {
            kernel: vec![KernelCallFilter {
                event: "sched/sched_switch".to_string(),
            }],
            ..Default::default()
        },
        filter: None,
    };

    let first = sensor.subscribe(switch_request.clone()).unwrap().unwrap();
    let mut second = sensor.subscribe(switch_request).unwrap().unwrap();
    assert!(monitor.enabled(SWITCH_ID));
    assert_eq!(sensor.metrics().snapshot().subscriptions, 2);

    first.close();
    eventually(|| sensor.metrics().snapshot().subscriptions == 1).await;

    // The other subscription still holds the event.
    assert!(monitor.enabled(SWITCH_ID));
    assert_eq!(monitor.unregister_count(SWITCH_ID), 0);
    assert!(sensor.decoders().get(SWITCH_ID).is_some());

    sensor.dispatch(switch_sample(sensor.boot_monotime() as u64 + 1, 3));
    assert!(second.next().await.is_some());

    second.close();
    eventually(|| monitor.unregister_count(SWITCH_ID) == 1).await;
    assert!(sensor.decoders().get(SWITCH_ID).is_none());

    // Samples for the now-unregistered id are silently dropped.
    sensor.dispatch(switch_sample(sensor.boot_monotime() as u64 + 2, 3));
    assert_eq!(sensor.metrics().snapshot().subscriptions, 0);
}

#[tokio::test]
async fn test_dropping_the_stream_tears_down() {
    let fx = fixture();
    let sensor = &fx.sensor;
    let monitor = &fx.monitor;

    let stream = sensor.subscribe(fork_request()).unwrap().unwrap();
    assert_eq!(monitor.register_count(FORK_ID), 1);

    drop(stream);
    eventually(|| monitor.unregister_count(FORK_ID) == 1).await;
    assert!(sensor.decoders().get(FORK_ID).is_none());
}

#[tokio::test]
async fn test_no_events_after_teardown() {
    let fx = fixture();
    let sensor = &fx.sensor;

    let mut stream = sensor.subscribe(fork_request()).unwrap().unwrap();
    sensor.dispatch(fork_sample(sensor.boot_monotime() as u64 + 1, 1, 2));
    assert!(stream.next().await.is_some());

    // Close only the control side; the data side stays open for draining.
    stream.cancel();
    eventually(|| sensor.metrics().snapshot().subscriptions == 0).await;

    sensor.dispatch(fork_sample(sensor.boot_monotime() as u64 + 2, 1, 3));
    // The channel closes without delivering anything further.
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn test_empty_selector_yields_no_stream() {
    let fx = fixture();
    let stream = fx.sensor.subscribe(SubscriptionRequest::default()).unwrap();
    assert!(stream.is_none());
    assert_eq!(fx.sensor.metrics().snapshot().subscriptions, 0);
}

#[tokio::test]
async fn test_failed_subscription_leaves_no_trace() {
    let fx = fixture();
    let sensor = &fx.sensor;
    let monitor = &fx.monitor;

    let request = SubscriptionRequest {
        events: EventSelector {
            // The first entry registers fine, the second has no schema; the
            // whole subscription must be rejected and rolled back.
            kernel: vec![
                KernelCallFilter {
                    event: "sched/sched_switch".to_string(),
                },
                KernelCallFilter {
                    event: "no/such_event".to_string(),
                },
            ],
            ..Default::default()
        },
        filter: None,
    };

    assert!(sensor.subscribe(request).is_err());
    assert!(sensor.decoders().get(SWITCH_ID).is_none());
    assert_eq!(monitor.register_count(SWITCH_ID), 0);
    assert_eq!(sensor.metrics().snapshot().subscriptions, 0);
}

#[tokio::test]
async fn test_unknown_samples_are_ignored() {
    let fx = fixture();
    let sensor = &fx.sensor;

    let mut stream = sensor.subscribe(fork_request()).unwrap().unwrap();

    // Event id 9999 has no decoder: not an error, just not for us.
    let mut raw = vec![0u8; 16];
    raw[0..2].copy_from_slice(&9999u16.to_le_bytes());
    sensor.dispatch(MonitorSample::new(SampleRecord {
        raw_data: raw,
        ..Default::default()
    }));

    assert!(stream.try_next().is_none());
    assert_eq!(sensor.metrics().snapshot().decode_errors, 0);
}

#[tokio::test]
async fn test_syscall_network_and_file_families() {
    let fx = fixture();
    let sensor = &fx.sensor;

    let request = SubscriptionRequest {
        events: EventSelector {
            syscall: vec![SyscallEventKind::Enter],
            network: vec![NetworkEventKind::Connect],
            file: vec![FileEventKind::Open],
            ..Default::default()
        },
        filter: None,
    };
    let mut stream = sensor.subscribe(request).unwrap().unwrap();
    let boot = sensor.boot_monotime() as u64;

    // raw_syscalls/sys_enter: id 2 (open), args 1..=6.
    let mut raw = vec![0u8; 64];
    raw[0..2].copy_from_slice(&SYS_ENTER_ID.to_le_bytes());
    raw[4..8].copy_from_slice(&55i32.to_le_bytes());
    raw[8..16].copy_from_slice(&2i64.to_le_bytes());
    for (i, arg) in (1..=6u64).enumerate() {
        raw[16 + i * 8..24 + i * 8].copy_from_slice(&arg.to_le_bytes());
    }
    sensor.dispatch(MonitorSample::new(SampleRecord {
        time: boot + 1,
        raw_data: raw,
        ..Default::default()
    }));

    let event = stream.next().await.unwrap();
    assert_eq!(
        event.payload,
        EventPayload::SyscallEnter {
            id: 2,
            args: vec![1, 2, 3, 4, 5, 6],
        }
    );
    assert_eq!(event.pid, 55);

    // syscalls/sys_enter_connect: fd 7, addrlen 16.
    let mut raw = vec![0u8; 40];
    raw[0..2].copy_from_slice(&CONNECT_ID.to_le_bytes());
    raw[4..8].copy_from_slice(&55i32.to_le_bytes());
    raw[8..12].copy_from_slice(&42i32.to_le_bytes());
    raw[16..24].copy_from_slice(&7u64.to_le_bytes());
    raw[32..40].copy_from_slice(&16u64.to_le_bytes());
    sensor.dispatch(MonitorSample::new(SampleRecord {
        time: boot + 2,
        raw_data: raw,
        ..Default::default()
    }));

    let event = stream.next().await.unwrap();
    assert_eq!(
        event.payload,
        EventPayload::NetworkConnect {
            fd: 7,
            address_length: 16,
        }
    );

    // fs/do_sys_open: filename via __data_loc, flags and mode inline.
    let name = b"/etc/hosts\0";
    let mut raw = vec![0u8; 20];
    raw[0..2].copy_from_slice(&OPEN_ID.to_le_bytes());
    raw[4..8].copy_from_slice(&55i32.to_le_bytes());
    raw[8..10].copy_from_slice(&20u16.to_le_bytes());
    raw[10..12].copy_from_slice(&(name.len() as u16).to_le_bytes());
    raw[12..16].copy_from_slice(&0i32.to_le_bytes());
    raw[16..20].copy_from_slice(&0o644i32.to_le_bytes());
    raw.extend_from_slice(name);
    sensor.dispatch(MonitorSample::new(SampleRecord {
        time: boot + 3,
        raw_data: raw,
        ..Default::default()
    }));

    let event = stream.next().await.unwrap();
    assert_eq!(
        event.payload,
        EventPayload::FileOpen {
            filename: "/etc/hosts".to_string(),
            flags: 0,
            mode: 0o644,
        }
    );
    assert_eq!(event.sequence, 3);
}

#[tokio::test]
async fn test_monitor_scope_paths_exist() {
    // Smoke check that run_dir is created with the sensor.
    let fx = fixture();
    let scope = fx.sensor.monitor_scope();
    assert_eq!(scope.pids, vec![-1]);

    let run_dir: &PathBuf = &fx._tmp.path().join("run");
    assert!(run_dir.is_dir());
}
