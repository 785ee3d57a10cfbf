use layerio::*;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

mod harness {
    pub mod faulty_raw;
    pub mod logging;
}
use harness::faulty_raw::{FaultMode, FaultyRaw};

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[test]
fn short_reads_are_stitched_together() {
    harness::logging::init();
    let data = payload(100);
    let raw = FaultyRaw::new(MemoryRaw::with_data(data.clone()), FaultMode::OneByteChunks);
    let config = BufferedConfig::new(BufferedMode::Reader).with_buffer_size(16);
    let stream = BufferedStream::with_config(raw, config).unwrap();

    assert_eq!(stream.read(Some(40)).unwrap(), &data[..40]);
    assert_eq!(stream.read(None).unwrap(), &data[40..]);
    assert!(stream.read(Some(1)).unwrap().is_empty());
}

#[test]
fn premature_eof_returns_short_read() {
    let data = payload(100);
    let raw = FaultyRaw::new(MemoryRaw::with_data(data.clone()), FaultMode::PrematureEofAt(2));
    let config = BufferedConfig::new(BufferedMode::Reader).with_buffer_size(8);
    let stream = BufferedStream::with_config(raw, config).unwrap();

    // Whole blocks come from the first raw read; the tail refill hits EOF.
    let first = stream.read(Some(100)).unwrap();
    assert_eq!(first, &data[..96]);
    assert!(stream.read(Some(8)).unwrap().is_empty());
}

#[test]
fn read_would_block_after_data_returns_partial() {
    let data = payload(40);
    let raw = FaultyRaw::new(MemoryRaw::with_data(data.clone()), FaultMode::ReadWouldBlockEvery(2));
    let config = BufferedConfig::new(BufferedMode::Reader).with_buffer_size(8);
    let stream = BufferedStream::with_config(raw, config).unwrap();

    // First raw read succeeds, the second would block: the data so far comes back.
    let got = stream.read(Some(36)).unwrap();
    assert_eq!(got, &data[..32]);
}

#[test]
fn read_would_block_without_data_is_an_error() {
    let raw = FaultyRaw::new(MemoryRaw::with_data(payload(8)), FaultMode::ReadWouldBlockEvery(1));
    let stream = BufferedStream::reader(raw).unwrap();

    assert!(matches!(stream.read(Some(4)), Err(Error::WouldBlock)));
    assert!(matches!(stream.read1(Some(4)), Err(Error::WouldBlock)));
    let mut dst = [0u8; 4];
    assert!(matches!(stream.readinto(&mut dst), Err(Error::WouldBlock)));
}

#[test]
fn blocking_write_reports_accepted_bytes() {
    harness::logging::init();
    let budget = Arc::new(AtomicUsize::new(3));
    let raw = FaultyRaw::new(MemoryRaw::new(), FaultMode::WriteBudget(budget.clone()));
    let config = BufferedConfig::new(BufferedMode::Writer).with_buffer_size(8);
    let stream = BufferedStream::with_config(raw, config).unwrap();
    let data = payload(20);

    // 3 bytes reach the raw stream, 8 more fill the buffer, then the raw stream blocks.
    match stream.write(&data) {
        Err(Error::BlockingIo { written }) => assert_eq!(written, 11),
        other => panic!("Expected BlockingIo, got: {:?}", other),
    }
    assert!(matches!(stream.flush(), Err(Error::BlockingIo { .. })));

    budget.store(usize::MAX / 2, std::sync::atomic::Ordering::SeqCst);
    stream.write(&data[11..]).unwrap();
    stream.flush().unwrap();
    let raw = stream.into_inner().unwrap().into_inner();
    assert_eq!(raw.get_ref(), &data[..]);
}

#[test]
fn blocked_write_in_random_mode_drops_read_ahead() {
    harness::logging::init();
    let budget = Arc::new(AtomicUsize::new(0));
    let raw = FaultyRaw::new(
        MemoryRaw::with_data(b"0123456789abcdef".to_vec()),
        FaultMode::WriteBudget(budget.clone()),
    );
    let config = BufferedConfig::new(BufferedMode::Random).with_buffer_size(8);
    let stream = BufferedStream::with_config(raw, config).unwrap();

    assert_eq!(stream.read(Some(2)).unwrap(), b"01");
    assert_eq!(stream.write(b"XY").unwrap(), 2);
    // The flush blocks, but the pending bytes still fit once shifted left.
    assert_eq!(stream.write(b"12345").unwrap(), 5);

    // Nothing left in the buffer is read-ahead: reading must flush first.
    assert!(matches!(stream.read(Some(1)), Err(Error::BlockingIo { .. })));

    budget.store(usize::MAX / 2, std::sync::atomic::Ordering::SeqCst);
    assert_eq!(stream.read(Some(1)).unwrap(), b"9");
    assert_eq!(stream.tell().unwrap(), 10);
    let raw = stream.into_inner().unwrap().into_inner();
    assert_eq!(raw.get_ref(), b"01XY123459abcdef");
}

#[test]
fn small_writes_stay_buffered_until_flush() {
    let raw = FaultyRaw::new(MemoryRaw::new(), FaultMode::Passthrough);
    let counts = raw.counts();
    let config = BufferedConfig::new(BufferedMode::Writer).with_buffer_size(16);
    let stream = BufferedStream::with_config(raw, config).unwrap();

    for chunk in [b"ab".as_slice(), b"cd", b"ef"] {
        assert_eq!(stream.write(chunk).unwrap(), 2);
    }
    assert_eq!(counts.writes(), 0);
    stream.flush().unwrap();
    assert_eq!(counts.writes(), 1);
    assert_eq!(stream.tell().unwrap(), 6);
}

#[test]
fn buffered_reads_issue_few_raw_calls() {
    let raw = FaultyRaw::new(MemoryRaw::with_data(payload(64)), FaultMode::Passthrough);
    let counts = raw.counts();
    let config = BufferedConfig::new(BufferedMode::Reader).with_buffer_size(32);
    let stream = BufferedStream::with_config(raw, config).unwrap();

    for _ in 0..8 {
        assert_eq!(stream.read(Some(4)).unwrap().len(), 4);
    }
    assert_eq!(counts.reads(), 1);
    assert_eq!(stream.peek().unwrap(), &payload(64)[32..]);
    assert_eq!(counts.reads(), 2);
}

#[test]
fn text_survives_one_byte_raw_reads() {
    let body = "añb€c😀d\nsecond line\r\nthird\r";
    let raw = FaultyRaw::new(MemoryRaw::with_data(body.as_bytes()), FaultMode::OneByteChunks);
    let buffered = BufferedStream::with_config(raw, BufferedConfig::default().with_buffer_size(4)).unwrap();
    let mut text = TextStream::with_config(buffered, TextConfig::default().with_chunk_size(3)).unwrap();

    let lines = text.readlines(None).unwrap();
    assert_eq!(lines, vec!["añb€c😀d\n", "second line\n", "third\n"]);
}
