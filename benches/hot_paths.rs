use std::io::Write;
use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use tracesensor::decode::registry::DecoderRegistry;
use tracesensor::decode::{DecodeError, Decoder, FieldMap, PostDecoder};
use tracesensor::events::TelemetryEvent;
use tracesensor::monitor::SampleRecord;
use tracesensor::schema::parse_format;

struct NoopPost;

impl PostDecoder for NoopPost {
    fn post_decode(
        &self,
        _sample: &SampleRecord,
        _fields: &FieldMap,
    ) -> Result<Option<TelemetryEvent>, DecodeError> {
        Ok(None)
    }
}

const SCHED_SWITCH_FORMAT: &str = "\
ID: 316
format:
\tfield:unsigned short common_type;\toffset:0;\tsize:2;\tsigned:0;
\tfield:unsigned char common_flags;\toffset:2;\tsize:1;\tsigned:0;
\tfield:unsigned char common_preempt_count;\toffset:3;\tsize:1;\tsigned:0;
\tfield:int common_pid;\toffset:4;\tsize:4;\tsigned:1;
\tfield:char prev_comm[16];\toffset:8;\tsize:16;\tsigned:1;
\tfield:pid_t prev_pid;\toffset:24;\tsize:4;\tsigned:1;
\tfield:int prev_prio;\toffset:28;\tsize:4;\tsigned:1;
\tfield:long prev_state;\toffset:32;\tsize:8;\tsigned:1;
\tfield:char next_comm[16];\toffset:40;\tsize:16;\tsigned:1;
\tfield:pid_t next_pid;\toffset:56;\tsize:4;\tsigned:1;
\tfield:int next_prio;\toffset:60;\tsize:4;\tsigned:1;
";

const EXEC_FORMAT: &str = "\
ID: 311
format:
\tfield:unsigned short common_type;\toffset:0;\tsize:2;\tsigned:0;
\tfield:int common_pid;\toffset:4;\tsize:4;\tsigned:1;
\tfield:__data_loc char[] filename;\toffset:8;\tsize:4;\tsigned:1;
\tfield:pid_t pid;\toffset:12;\tsize:4;\tsigned:1;
\tfield:pid_t old_pid;\toffset:16;\tsize:4;\tsigned:1;
";

fn sched_switch_payload() -> Vec<u8> {
    let mut raw = vec![0u8; 64];
    raw[0..2].copy_from_slice(&316u16.to_le_bytes());
    raw[4..8].copy_from_slice(&1337i32.to_le_bytes());
    raw[8..12].copy_from_slice(b"geth");
    raw[24..28].copy_from_slice(&1337i32.to_le_bytes());
    raw[28..32].copy_from_slice(&120i32.to_le_bytes());
    raw[40..44].copy_from_slice(b"cat\0");
    raw[56..60].copy_from_slice(&1u32.to_le_bytes());
    raw
}

fn exec_payload() -> Vec<u8> {
    let mut raw = vec![0u8; 20];
    raw[0..2].copy_from_slice(&311u16.to_le_bytes());
    raw[4..8].copy_from_slice(&1337i32.to_le_bytes());
    raw[12..16].copy_from_slice(&1337i32.to_le_bytes());
    let path = b"/usr/bin/cat\0";
    raw[8..10].copy_from_slice(&20u16.to_le_bytes());
    raw[10..12].copy_from_slice(&(path.len() as u16).to_le_bytes());
    raw.extend_from_slice(path);
    raw
}

fn bench_decode_raw(c: &mut Criterion) {
    let switch = Decoder::new(
        Arc::new(parse_format("sched/sched_switch", SCHED_SWITCH_FORMAT).unwrap()),
        Arc::new(NoopPost),
    );
    let exec = Decoder::new(
        Arc::new(parse_format("sched/sched_process_exec", EXEC_FORMAT).unwrap()),
        Arc::new(NoopPost),
    );

    let switch_raw = sched_switch_payload();
    let exec_raw = exec_payload();

    c.bench_function("decode_raw/sched_switch", |b| {
        b.iter(|| switch.decode_raw(black_box(&switch_raw)).unwrap())
    });

    c.bench_function("decode_raw/exec_data_loc", |b| {
        b.iter(|| exec.decode_raw(black_box(&exec_raw)).unwrap())
    });
}

fn bench_decode_sample(c: &mut Criterion) {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("events/sched/sched_switch");
    std::fs::create_dir_all(&dir).unwrap();
    let mut f = std::fs::File::create(dir.join("format")).unwrap();
    f.write_all(SCHED_SWITCH_FORMAT.as_bytes()).unwrap();

    let registry = DecoderRegistry::new(tmp.path());
    registry
        .add("sched/sched_switch", Arc::new(NoopPost))
        .unwrap();

    let sample = SampleRecord {
        time: 123_456_789,
        raw_data: sched_switch_payload(),
        ..Default::default()
    };
    let miss = SampleRecord {
        time: 123_456_789,
        raw_data: {
            let mut raw = sched_switch_payload();
            raw[0..2].copy_from_slice(&999u16.to_le_bytes());
            raw
        },
        ..Default::default()
    };

    c.bench_function("decode_sample/hit", |b| {
        b.iter(|| registry.decode_sample(black_box(&sample)).unwrap())
    });

    c.bench_function("decode_sample/miss", |b| {
        b.iter(|| registry.decode_sample(black_box(&miss)).unwrap())
    });
}

criterion_group!(benches, bench_decode_raw, bench_decode_sample);
criterion_main!(benches);
