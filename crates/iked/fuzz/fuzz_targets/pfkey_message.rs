//! Fuzz target for PF_KEY message parsing.
//!
//! Feeds arbitrary bytes to the decoder and, for anything it accepts, checks
//! that every typed extension accessor copes and that re-encoding is stable.
//!
//! Run with:
//! ```bash
//! cd crates/iked
//! cargo +nightly fuzz run pfkey_message -- -max_total_time=300
//! ```

#![no_main]
use fynx_iked::pfkey::constants::ExtType;
use fynx_iked::pfkey::message::{EpropExt, IdentExt, SupportedExt};
use fynx_iked::pfkey::{classify_error, Message};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(msg) = Message::from_bytes(data) else {
        return;
    };

    let _ = msg.sa();
    let _ = msg.address(ExtType::AddressSrc);
    let _ = msg.address(ExtType::AddressDst);
    let _ = msg.lifetime(ExtType::LifetimeSoft);
    let _ = msg.km_cookie();
    let _ = msg.get::<EpropExt>(ExtType::XEprop);
    let _ = msg.get::<IdentExt>(ExtType::IdentitySrc);
    let _ = msg.get::<SupportedExt>(ExtType::SupportedEncrypt);
    if msg.errno != 0 {
        let _ = classify_error(&msg);
    }

    let wire = msg.to_bytes();
    let reparsed = Message::from_bytes(&wire).expect("re-encoded message must parse");
    assert_eq!(reparsed, msg);
});
