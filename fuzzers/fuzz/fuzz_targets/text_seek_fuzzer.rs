#![no_main]
use layerio::{BufferedConfig, BufferedStream, Encoding, ErrorMode, MemoryRaw, TextConfig, TextStream, Whence};
use libfuzzer_sys::fuzz_target;

// First byte picks the codec and chunk size; the rest is stream content.
fuzz_target!(|data: &[u8]| {
    let Some((&control, body)) = data.split_first() else {
        return;
    };
    let encoding = match control % 4 {
        0 => Encoding::Utf8,
        1 => Encoding::Utf16,
        2 => Encoding::Utf16Be,
        _ => Encoding::Latin1,
    };
    let chunk_size = 1 + (control as usize >> 2);
    let config = TextConfig::new(encoding)
        .with_errors(ErrorMode::Replace)
        .with_chunk_size(chunk_size);
    let buffered = BufferedStream::with_config(
        MemoryRaw::with_data(body.to_vec()),
        BufferedConfig::default().with_buffer_size(chunk_size),
    )
    .unwrap();
    let mut text = TextStream::with_config(buffered, config).unwrap();

    // Every reachable position must replay to the same remainder.
    let mut marks = Vec::new();
    loop {
        let Ok(cookie) = text.tell() else { return };
        let Ok(chunk) = text.read(Some(3)) else { return };
        if chunk.is_empty() {
            break;
        }
        marks.push(cookie);
    }
    for cookie in marks {
        text.seek(cookie, Whence::Set).unwrap();
        let first = text.read(None).unwrap();
        text.seek(cookie, Whence::Set).unwrap();
        assert_eq!(text.read(None).unwrap(), first);
    }
});
