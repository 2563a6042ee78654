#![no_main]

use std::io::Cursor;

use libfuzzer_sys::fuzz_target;

use ipswrestore::restore::classify;

fuzz_target!(|data: &[u8]| {
    // classification must never panic, whatever plist the agent sends
    if let Ok(msg) = plist::Value::from_reader_xml(Cursor::new(data)) {
        let _ = classify(&msg);
    }
});
