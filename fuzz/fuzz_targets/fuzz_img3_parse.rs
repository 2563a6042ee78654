#![no_main]

use libfuzzer_sys::fuzz_target;

use ipswrestore::img3::Img3;

fuzz_target!(|data: &[u8]| {
    let img = match Img3::parse(data) {
        Ok(img) => img,
        Err(_err) => return,
    };

    // a successful parse must serialize back to the exact input
    assert_eq!(img.serialize(), data);
});
