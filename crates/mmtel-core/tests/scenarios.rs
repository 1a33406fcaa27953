//! End-to-end producer/consumer scenarios over real transport files.

use std::os::unix::fs::FileExt;
use std::thread;

use mmtel_config::testing::TestEnvironment;
use mmtel_core::{
    DictionarySpec, LayoutDescriptor, Reader, RingSpec, SectionSpec, SlotBody, SpinYield,
    TransportError, Writer,
};

fn fixed_ring(num_slots: u64, slot_size: u64) -> LayoutDescriptor {
    LayoutDescriptor {
        sections: vec![SectionSpec::Ring(RingSpec {
            num_slots,
            slot_size,
            body: SlotBody::Fixed,
        })],
    }
}

fn prefixed_ring(num_slots: u64, slot_size: u64) -> LayoutDescriptor {
    LayoutDescriptor {
        sections: vec![SectionSpec::Ring(RingSpec {
            num_slots,
            slot_size,
            body: SlotBody::LengthPrefixed,
        })],
    }
}

#[test]
fn single_writer_single_reader_fifo() {
    let env = TestEnvironment::new().expect("env");
    let path = env.transport_path("fifo");
    let descriptor = fixed_ring(4, 8);

    let writer = Writer::create(&path, &descriptor).expect("create");
    let mut reader = Reader::attach(&path, &descriptor).expect("attach");

    let values: Vec<[u8; 8]> = (1..=5_u8).map(|v| [v; 8]).collect();
    for value in &values {
        writer.ring(0).expect("ring").try_write(value).expect("write");
        let body = reader
            .ring(0)
            .expect("ring")
            .try_read()
            .expect("read")
            .expect("published");
        assert_eq!(body, value);
    }
    assert_eq!(
        reader.ring(0).expect("ring").try_next_readable().expect("probe"),
        None
    );
}

#[test]
fn back_pressure_refuses_the_overflowing_claim() {
    let env = TestEnvironment::new().expect("env");
    let path = env.transport_path("backpressure");
    let descriptor = fixed_ring(4, 8);

    let writer = Writer::create(&path, &descriptor).expect("create");
    let mut reader = Reader::attach(&path, &descriptor).expect("attach");
    let ring = writer.ring(0).expect("ring");

    // Four slots fill; the fifth claim must refuse rather than overwrite.
    for v in 0..4_u8 {
        ring.try_write(&[v; 8]).expect("write");
    }
    assert!(matches!(
        ring.try_write(&[4; 8]),
        Err(TransportError::RingFull)
    ));

    // One consume frees exactly one slot.
    let first = reader
        .ring(0)
        .expect("ring")
        .try_read()
        .expect("read")
        .expect("published");
    assert_eq!(first, [0; 8]);
    ring.try_write(&[4; 8]).expect("retry after drain");

    let mut consumed = vec![first];
    while let Some(body) = reader.ring(0).expect("ring").try_read().expect("read") {
        consumed.push(body);
    }
    let expected: Vec<Vec<u8>> = (0..5_u8).map(|v| vec![v; 8]).collect();
    assert_eq!(consumed, expected);
}

#[test]
fn eight_producers_interleave_without_loss_or_reorder() {
    const PRODUCERS: u64 = 8;
    const PER_PRODUCER: u64 = 10_000;

    let env = TestEnvironment::new().expect("env");
    let path = env.transport_path("interleave");
    let descriptor = prefixed_ring(1024, 16);

    let writer = Writer::create(&path, &descriptor).expect("create");
    let mut reader = Reader::attach(&path, &descriptor).expect("attach");

    let collected = thread::scope(|scope| {
        for tid in 0..PRODUCERS {
            let writer = &writer;
            scope.spawn(move || {
                let ring = writer.ring(0).expect("ring");
                let mut strategy = SpinYield::default();
                for i in 0..PER_PRODUCER {
                    let value = (tid << 32) | i;
                    ring.write_blocking(&value.to_le_bytes(), &mut strategy)
                        .expect("write");
                }
            });
        }

        let ring = reader.ring(0).expect("ring");
        let mut strategy = SpinYield::default();
        let mut collected = Vec::with_capacity((PRODUCERS * PER_PRODUCER) as usize);
        while collected.len() < (PRODUCERS * PER_PRODUCER) as usize {
            let body = ring.read_blocking(&mut strategy).expect("read");
            collected.push(u64::from_le_bytes(body.try_into().expect("8 bytes")));
        }
        collected
    });

    // Each producer's values appear in its own order.
    for tid in 0..PRODUCERS {
        let projection: Vec<u64> = collected
            .iter()
            .copied()
            .filter(|v| v >> 32 == tid)
            .collect();
        let expected: Vec<u64> = (0..PER_PRODUCER).map(|i| (tid << 32) | i).collect();
        assert_eq!(projection, expected, "producer {tid} lost or reordered");
    }
}

#[test]
fn dictionary_offsets_are_stable_and_arithmetic() {
    let env = TestEnvironment::new().expect("env");
    let path = env.transport_path("dictionary");
    let descriptor = LayoutDescriptor {
        sections: vec![SectionSpec::Dictionary(DictionarySpec::default())],
    };

    let writer = Writer::create(&path, &descriptor).expect("create");
    let dict = writer.dictionary(0).expect("dict");

    let payloads: Vec<Vec<u8>> = [1_usize, 127, 128, 16_383, 16_384]
        .iter()
        .enumerate()
        .map(|(i, &len)| vec![i as u8 + 1; len])
        .collect();
    let offsets: Vec<u64> = payloads
        .iter()
        .map(|p| dict.append(p).expect("append"))
        .collect();

    // Strictly increasing, each exactly prefix + payload after the last.
    let prefix_sizes = [1_u64, 1, 2, 2, 3];
    for i in 0..offsets.len() - 1 {
        assert!(offsets[i] < offsets[i + 1]);
        assert_eq!(
            offsets[i + 1],
            offsets[i] + prefix_sizes[i] + payloads[i].len() as u64
        );
    }

    let reader = Reader::attach(&path, &descriptor).expect("attach");
    for (offset, payload) in offsets.iter().zip(&payloads) {
        assert_eq!(
            &reader.dictionary(0).expect("dict").read(*offset).expect("read"),
            payload
        );
    }
}

#[test]
fn epoch_change_invalidates_the_reader() {
    let env = TestEnvironment::new().expect("env");
    let path = env.transport_path("epoch");
    let descriptor = fixed_ring(4, 8);

    let writer = Writer::create(&path, &descriptor).expect("create");
    let first_epoch = writer.epoch();
    for v in 1..=3_u8 {
        writer.ring(0).expect("ring").try_write(&[v; 8]).expect("write");
    }

    let mut reader = Reader::attach(&path, &descriptor).expect("attach");
    for v in 1..=2_u8 {
        let body = reader
            .ring(0)
            .expect("ring")
            .try_read()
            .expect("read")
            .expect("published");
        assert_eq!(body, [v; 8]);
    }

    // The producer restarts under a fresh epoch.
    drop(writer);
    let writer = Writer::create(&path, &descriptor).expect("re-create");
    assert!(writer.epoch() > first_epoch);
    writer.ring(0).expect("ring").try_write(&[9; 8]).expect("write");

    assert!(reader.has_epoch_changed());
    assert!(matches!(
        reader.ring(0).expect("ring").try_read(),
        Err(TransportError::VersionMismatch { .. })
    ));

    // Re-attaching restores FIFO from the new epoch's start.
    let mut reader = Reader::attach(&path, &descriptor).expect("re-attach");
    assert_eq!(reader.epoch(), writer.epoch());
    assert_eq!(
        reader.ring(0).expect("ring").try_read().expect("read"),
        Some(vec![9; 8])
    );
    assert_eq!(reader.ring(0).expect("ring").try_read().expect("read"), None);
}

#[test]
fn published_records_survive_a_dead_writer() {
    let env = TestEnvironment::new().expect("env");
    let path = env.transport_path("postmortem");
    let descriptor = fixed_ring(64, 8);

    let expected_epoch;
    {
        let writer = Writer::create(&path, &descriptor).expect("create");
        expected_epoch = writer.epoch();
        for v in 0..40_u64 {
            writer
                .ring(0)
                .expect("ring")
                .try_write(&v.to_le_bytes())
                .expect("write");
        }
        // Writer dies here with no teardown protocol.
    }

    let mut reader = Reader::attach(&path, &descriptor).expect("attach post-mortem");
    assert_eq!(reader.epoch(), expected_epoch);
    let mut recovered = Vec::new();
    while let Some(body) = reader.ring(0).expect("ring").try_read().expect("read") {
        recovered.push(u64::from_le_bytes(body.try_into().expect("8 bytes")));
    }
    assert_eq!(recovered, (0..40_u64).collect::<Vec<_>>());
    assert_eq!(
        reader.ring(0).expect("ring").try_next_readable().expect("probe"),
        None
    );
}

#[test]
fn a_restarted_reader_resumes_at_the_persisted_cursor() {
    let env = TestEnvironment::new().expect("env");
    let path = env.transport_path("resume");
    let descriptor = fixed_ring(64, 8);

    let writer = Writer::create(&path, &descriptor).expect("create");
    for v in 0..10_u64 {
        writer
            .ring(0)
            .expect("ring")
            .try_write(&v.to_le_bytes())
            .expect("write");
    }

    {
        let mut reader = Reader::attach(&path, &descriptor).expect("attach");
        for v in 0..4_u64 {
            let body = reader.ring(0).expect("ring").try_read().expect("read");
            assert_eq!(body, Some(v.to_le_bytes().to_vec()));
        }
        // Reader crashes here; its cursor lives in the file.
    }

    let mut reader = Reader::attach(&path, &descriptor).expect("re-attach");
    let first = reader.ring(0).expect("ring").try_read().expect("read");
    assert_eq!(first, Some(4_u64.to_le_bytes().to_vec()));
}

#[test]
fn ring_bodies_carry_decodable_dictionary_offsets() {
    let env = TestEnvironment::new().expect("env");
    let path = env.transport_path("interned");
    let descriptor = LayoutDescriptor {
        sections: vec![
            SectionSpec::Ring(RingSpec {
                num_slots: 16,
                slot_size: 8,
                body: SlotBody::Fixed,
            }),
            SectionSpec::Dictionary(DictionarySpec::default()),
        ],
    };

    let writer = Writer::create(&path, &descriptor).expect("create");
    let mut reader = Reader::attach(&path, &descriptor).expect("attach");

    for name in ["service.name", "host.name", "telemetry.sdk"] {
        // Intern first, then publish the reference; the slot's availability
        // store is the fence that makes the entry readable.
        let offset = writer
            .dictionary(1)
            .expect("dict")
            .append(name.as_bytes())
            .expect("append");
        writer
            .ring(0)
            .expect("ring")
            .try_write(&offset.to_le_bytes())
            .expect("write");

        let body = reader
            .ring(0)
            .expect("ring")
            .try_read()
            .expect("read")
            .expect("published");
        let offset = u64::from_le_bytes(body.try_into().expect("8 bytes"));
        let interned = reader
            .dictionary(1)
            .expect("dict")
            .read(offset)
            .expect("resolve");
        assert_eq!(interned, name.as_bytes());
    }
}

#[test]
fn generations_stay_ordered_across_huge_indices() {
    let env = TestEnvironment::new().expect("env");
    let path = env.transport_path("hugeindex");
    let descriptor = fixed_ring(4, 8);

    // Initialize, then park both cursors just below 2^31 as if the ring had
    // already run for a very long time.
    drop(Writer::create(&path, &descriptor).expect("create"));
    let start: i64 = (1 << 31) - 2;
    {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .expect("open raw");
        // Ring section begins at 64; its reader/writer indices sit at +16/+24.
        file.write_all_at(&start.to_le_bytes(), 64 + 16).expect("poke reader");
        file.write_all_at(&start.to_le_bytes(), 64 + 24).expect("poke writer");
    }

    let writer = Writer::open(&path, &descriptor).expect("re-open in place");
    let mut reader = Reader::attach(&path, &descriptor).expect("attach");
    let ring = writer.ring(0).expect("ring");

    for step in 0..8_u64 {
        let index = ring.try_write(&step.to_le_bytes()).expect("write");
        assert_eq!(index, (start + 1) as u64 + step);
        let body = reader
            .ring(0)
            .expect("ring")
            .try_read()
            .expect("read")
            .expect("published");
        assert_eq!(body, step.to_le_bytes());
    }
}
