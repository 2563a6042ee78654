#![no_main]

use libfuzzer_sys::fuzz_target;

use ipswrestore::img3::Img3;

fuzz_target!(|input: (&[u8], &[u8])| {
    let (data, blob) = input;

    let mut img = match Img3::parse(data) {
        Ok(img) => img,
        Err(_err) => return,
    };

    if img.replace_signature(blob).is_err() {
        return;
    }

    // the rewritten container must reparse with the new signature
    let reparsed = Img3::parse(&img.serialize()).expect("resigned container reparses");
    assert_eq!(reparsed.signature(), Some(blob));
});
