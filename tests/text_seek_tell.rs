use layerio::*;
use test_harness::TestHarness;

mod harness {
    pub mod logging;
}

/// Reads `doc` back in random steps, recording a cookie and the character
/// offset at each stop, then checks every cookie resumes at its offset.
fn check_random_positions(h: &mut TestHarness, doc: &str, config: TextConfig, stops: usize) {
    // Only the universal and \n modes read back exactly what was written.
    let read_back = match config.newline {
        Newline::Cr => doc.replace('\n', "\r"),
        Newline::CrLf => doc.replace('\n', "\r\n"),
        _ => doc.to_string(),
    };
    let chars: Vec<char> = read_back.chars().collect();
    h.write_contents(b"");
    {
        let mut text = h.text(config);
        text.write(doc).unwrap();
        text.flush().unwrap();
    }

    let mut text = h.text(config);
    let mut consumed = 0usize;
    let mut marks = vec![(text.tell().unwrap(), 0usize)];
    while marks.len() < stops && consumed < chars.len() {
        let got = if h.gen_index(3) == 0 {
            text.readline(None).unwrap()
        } else {
            let n = 1 + h.gen_index(40);
            text.read(Some(n)).unwrap()
        };
        consumed += got.chars().count();
        let expected: String = chars[consumed - got.chars().count()..consumed].iter().collect();
        assert_eq!(got, expected);
        marks.push((text.tell().unwrap(), consumed));
    }
    assert!(marks.len() >= stops.min(chars.len()));

    // Visit the marks out of order.
    for i in 0..marks.len() {
        let (cookie, offset) = marks[(i * 7) % marks.len()];
        text.seek(cookie, Whence::Set).unwrap();
        let window = 1 + h.gen_index(60);
        let got = text.read(Some(window)).unwrap();
        let end = (offset + window).min(chars.len());
        let expected: String = chars[offset..end].iter().collect();
        assert_eq!(got, expected, "cookie {cookie} at char {offset}");
    }

    // Cookies survive a trip through their byte form.
    let (cookie, offset) = marks[marks.len() / 2];
    let restored = Cookie::from_bytes(&cookie.to_bytes()).unwrap();
    text.seek(restored, Whence::Set).unwrap();
    let rest: String = chars[offset..].iter().collect();
    assert_eq!(text.read(None).unwrap(), rest);
}

#[test]
fn utf8_multibyte_positions_round_trip() {
    harness::logging::init();
    let mut h = TestHarness::new();
    let doc = h.gen_text(4000);
    for chunk_size in [5, 64, 8192] {
        let config = TextConfig::default().with_chunk_size(chunk_size);
        check_random_positions(&mut h, &doc, config, 30);
    }
}

#[test]
fn utf16_positions_round_trip() {
    let mut h = TestHarness::new();
    let doc = h.gen_text(3000);
    for encoding in [Encoding::Utf16, Encoding::Utf16Le, Encoding::Utf16Be] {
        let config = TextConfig::new(encoding).with_chunk_size(17);
        check_random_positions(&mut h, &doc, config, 25);
    }
}

#[test]
fn crlf_file_positions_round_trip() {
    let mut h = TestHarness::new();
    let doc = h.gen_text(2000);
    let config = TextConfig::default()
        .with_newline(Newline::CrLf)
        .with_chunk_size(11);
    check_random_positions(&mut h, &doc, config, 20);
    let raw = h.contents();
    assert!(!raw.windows(2).any(|w| w[1] == b'\n' && w[0] != b'\r'));
}

#[test]
fn chained_cookies_replay_after_seek() {
    harness::logging::init();
    let h = TestHarness::new();
    let doc = "ab\r\ncd\ref\ngh€😀\r\n\r\nij\r";
    let big_endian_with_bom = {
        let mut bytes = b"\xfe\xff".to_vec();
        bytes.extend(Encoding::Utf16Be.encode(doc, ErrorMode::Strict).unwrap());
        bytes
    };
    let files = [
        (Encoding::Utf16, big_endian_with_bom),
        (Encoding::Utf16, Encoding::Utf16.encode(doc, ErrorMode::Strict).unwrap()),
        (Encoding::Utf16Le, Encoding::Utf16Le.encode(doc, ErrorMode::Strict).unwrap()),
        (Encoding::Utf16Be, Encoding::Utf16Be.encode(doc, ErrorMode::Strict).unwrap()),
        (Encoding::Utf8, doc.as_bytes().to_vec()),
    ];

    for (encoding, bytes) in &files {
        h.write_contents(bytes);
        for newline in [Newline::Untranslated, Newline::Universal] {
            let expected: Vec<char> = match newline {
                Newline::Universal => doc.replace("\r\n", "\n").replace('\r', "\n"),
                _ => doc.to_string(),
            }
            .chars()
            .collect();

            for chunk_size in [2, 3, 4] {
                let config = TextConfig::new(*encoding)
                    .with_newline(newline)
                    .with_chunk_size(chunk_size);
                for stop in 0..=expected.len() {
                    let context = format!("{encoding} {newline:?} chunk {chunk_size} stop {stop}");
                    let mut text = h.text(config);
                    let head = text.read(Some(stop)).unwrap();
                    assert_eq!(head.chars().count(), stop, "{context}");

                    let first = text.tell().unwrap();
                    text.seek(first, Whence::Set).unwrap();
                    let second = text.tell().unwrap();
                    if first.chars_to_skip == 0 && first.bytes_to_feed == 0 && !first.need_eof {
                        assert_eq!(second, first, "{context}");
                    }
                    text.seek(second, Whence::Set).unwrap();

                    let rest: String = expected[stop..].iter().collect();
                    assert_eq!(text.read(None).unwrap(), rest, "{context}");
                }
            }
        }
    }
}

#[test]
fn universal_reader_positions_inside_crlf_pairs() {
    let h = TestHarness::new();
    h.write_contents(b"alpha\r\nbeta\rgamma\r\n\r\ndelta");
    let config = TextConfig::default().with_chunk_size(3);
    let mut text = h.text(config);

    let mut marks = Vec::new();
    loop {
        let cookie = text.tell().unwrap();
        let line = text.readline(None).unwrap();
        if line.is_empty() {
            break;
        }
        marks.push((cookie, line));
    }
    let lines: Vec<&str> = marks.iter().map(|(_, l)| l.as_str()).collect();
    assert_eq!(lines, vec!["alpha\n", "beta\n", "gamma\n", "\n", "delta"]);

    for (cookie, line) in marks.iter().rev() {
        text.seek(*cookie, Whence::Set).unwrap();
        assert_eq!(&text.readline(None).unwrap(), line);
    }
}

#[test]
fn seek_to_end_then_append() {
    let h = TestHarness::new();
    {
        let mut text = h.text(TextConfig::new(Encoding::Utf16));
        text.write("first\n").unwrap();
    }
    let mut text = h.text(TextConfig::new(Encoding::Utf16));
    let end = text.seek(Cookie::ZERO, Whence::End).unwrap();
    assert!(end.is_simple());
    text.write("second\n").unwrap();
    text.seek(Cookie::ZERO, Whence::Set).unwrap();
    assert_eq!(text.read(None).unwrap(), "first\nsecond\n");
    drop(text);

    // One byte-order mark, at the very start.
    let raw = h.contents();
    assert_eq!(&raw[..2], b"\xff\xfe");
    assert_eq!(Encoding::Utf16Le.decode(&raw[2..], ErrorMode::Strict).unwrap(), "first\nsecond\n");
}

#[test]
fn tell_after_write_is_byte_offset() {
    let h = TestHarness::new();
    let mut text = h.text(TextConfig::default());
    text.write("héllo").unwrap();
    assert_eq!(text.tell().unwrap(), Cookie::at(6));
    text.seek(Cookie::at(1), Whence::Set).unwrap();
    assert_eq!(text.read(Some(1)).unwrap(), "é");
}

#[test]
fn iteration_blocks_tell_until_exhausted() {
    let h = TestHarness::new();
    h.write_contents(b"1\n2\n3\n");
    let mut text = h.text(TextConfig::default());

    let mut seen = Vec::new();
    for line in text.lines() {
        seen.push(line.unwrap());
        if seen.len() == 2 {
            break;
        }
    }
    assert!(matches!(text.tell(), Err(Error::TellingDisabled)));
    text.flush().unwrap();
    text.seek(Cookie::ZERO, Whence::Set).unwrap();
    let all: Vec<String> = text.lines().map(|l| l.unwrap()).collect();
    assert_eq!(all, vec!["1\n", "2\n", "3\n"]);
    assert_eq!(text.tell().unwrap(), Cookie::at(6));
}
