use layerio::*;
use std::io::{self, BufRead, Read, Seek, SeekFrom, Write};
use test_harness::TestHarness;

#[test]
fn file_backed_layers_round_trip() {
    // Purpose: write text through all three layers into a real file, then
    // read it back through a fresh stack and through std::fs.
    let mut h = TestHarness::new();
    let lines: Vec<String> = (0..50).map(|i| format!("{i}: {}\n", h.gen_text(30).replace('\n', " "))).collect();
    {
        let buffered = h.create(BufferedConfig::new(BufferedMode::Writer).with_buffer_size(64));
        let mut text = TextStream::new(buffered).unwrap();
        for line in &lines {
            text.write(line).unwrap();
        }
        text.close().unwrap();
    }
    assert_eq!(h.contents(), lines.concat().into_bytes());

    let reader = BufferedStream::reader(FileRaw::open(h.path()).unwrap()).unwrap();
    let mut text = TextStream::new(reader).unwrap();
    assert_eq!(text.readlines(None).unwrap(), lines);
}

#[test]
fn buffered_stream_interoperates_with_std_io() {
    let h = TestHarness::new();
    let mut stream = h.create(BufferedConfig::default().with_buffer_size(16));

    let source = b"alpha\nbeta\ngamma\n".repeat(10);
    let copied = io::copy(&mut &source[..], &mut stream).unwrap();
    assert_eq!(copied, source.len() as u64);
    Write::flush(&mut stream).unwrap();

    assert_eq!(Seek::seek(&mut stream, SeekFrom::Start(6)).unwrap(), 6);
    let mut word = [0u8; 4];
    Read::read_exact(&mut stream, &mut word).unwrap();
    assert_eq!(&word, b"beta");

    Seek::seek(&mut stream, SeekFrom::Start(0)).unwrap();
    let reader = io::BufReader::new(&mut stream);
    let count = reader.lines().map(|l| l.unwrap()).filter(|l| l == "gamma").count();
    assert_eq!(count, 10);
}

#[test]
fn random_access_interleaves_reads_and_writes() {
    let h = TestHarness::new();
    h.write_contents(b"0123456789abcdef");
    let stream = h.open(BufferedConfig::new(BufferedMode::Random).with_buffer_size(4));

    assert_eq!(stream.read(Some(3)).unwrap(), b"012");
    stream.write(b"XY").unwrap();
    assert_eq!(stream.tell().unwrap(), 5);
    assert_eq!(stream.read(Some(3)).unwrap(), b"567");
    assert_eq!(stream.peek().unwrap().first(), Some(&b'8'));
    stream.seek(-2, Whence::End).unwrap();
    stream.write(b"EF!").unwrap();
    stream.seek(0, Whence::Set).unwrap();
    assert_eq!(stream.read(None).unwrap(), b"012XY56789abcdEF!");
    stream.close().unwrap();
    assert_eq!(h.contents(), b"012XY56789abcdEF!");
}

#[test]
fn truncate_keeps_position() {
    let h = TestHarness::new();
    h.write_contents(b"0123456789");
    let stream = h.open(BufferedConfig::default());
    stream.seek(8, Whence::Set).unwrap();
    assert_eq!(stream.truncate(Some(4)).unwrap(), 4);
    assert_eq!(stream.tell().unwrap(), 8);
    stream.seek(0, Whence::Set).unwrap();
    assert_eq!(stream.read(None).unwrap(), b"0123");
}

#[test]
fn readline_and_readlines_on_binary_streams() {
    let stream = BufferedStream::new(MemoryRaw::with_data(b"one\ntwo\nthree".to_vec())).unwrap();
    assert_eq!(stream.readline(Some(2)).unwrap(), b"on");
    assert_eq!(stream.readline(None).unwrap(), b"e\n");
    assert_eq!(
        stream.readlines(None).unwrap(),
        vec![b"two\n".to_vec(), b"three".to_vec()]
    );
}

#[test]
fn text_line_buffering_reaches_the_file() {
    let h = TestHarness::new();
    let mut text = h.text(TextConfig::default().with_line_buffering(true));
    text.write("no newline yet").unwrap();
    assert!(h.contents().is_empty());
    text.write("\n").unwrap();
    assert_eq!(h.contents(), b"no newline yet\n");

    text.reconfigure(Reconfigure {
        line_buffering: Some(false),
        write_through: Some(true),
        ..Reconfigure::default()
    })
    .unwrap();
    text.write("through").unwrap();
    // Write-through hands bytes to the buffered layer, which still holds them.
    assert_eq!(h.contents(), b"no newline yet\n");
    text.flush().unwrap();
    assert_eq!(h.contents(), b"no newline yet\nthrough");
}

#[test]
fn detach_chain_returns_each_layer() {
    let buffered = BufferedStream::new(MemoryRaw::new()).unwrap();
    let mut text = TextStream::with_config(buffered, TextConfig::new(Encoding::Latin1)).unwrap();
    text.write("naïve").unwrap();

    let buffered = text.detach().unwrap();
    assert!(matches!(text.write("x"), Err(Error::Detached)));
    assert_eq!(buffered.tell().unwrap(), 5);
    let raw = buffered.detach().unwrap();
    assert_eq!(raw.get_ref(), b"na\xefve");
}

#[test]
fn newline_kinds_are_reported() {
    let stream = BufferedStream::new(MemoryRaw::with_data(b"a\nb\r\nc".to_vec())).unwrap();
    let mut text = TextStream::new(stream).unwrap();
    assert_eq!(text.newlines(), Some(Newlines::empty()));
    text.readline(None).unwrap();
    assert!(text.newlines().unwrap().contains(Newlines::LF));
    text.read(None).unwrap();
    assert_eq!(text.newlines().unwrap().terminators(), vec!["\n", "\r\n"]);

    let stream = BufferedStream::new(MemoryRaw::new()).unwrap();
    let text = TextStream::with_config(stream, TextConfig::default().with_newline(Newline::Lf)).unwrap();
    assert_eq!(text.newlines(), None);
}

#[cfg(feature = "serde")]
#[test]
fn configs_deserialize_from_json() {
    let config: TextConfig = serde_json::from_str(
        r#"{"encoding": "utf-16-le", "newline": "crlf", "line_buffering": true}"#,
    )
    .unwrap();
    assert_eq!(config.encoding, Encoding::Utf16Le);
    assert_eq!(config.newline, Newline::CrLf);
    assert!(config.line_buffering);
    assert_eq!(config.chunk_size, DEFAULT_BUFFER_SIZE);

    let buffered: BufferedConfig = serde_json::from_str(r#"{"buffer_size": 512}"#).unwrap();
    assert_eq!(buffered.buffer_size, 512);

    let cookie = Cookie { chars_to_skip: 3, ..Cookie::at(10) };
    let json = serde_json::to_string(&cookie).unwrap();
    assert_eq!(serde_json::from_str::<Cookie>(&json).unwrap(), cookie);
}
