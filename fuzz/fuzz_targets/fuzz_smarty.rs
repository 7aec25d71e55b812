#![no_main]

use dsmr_rs::{P1TelegramParser, ParserOptions, SmartyDecrypter, SmartyKeys, TelegramDecoder};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let keys = match SmartyKeys::from_hex("000102030405060708090A0B0C0D0E0F", None) {
        Ok(keys) => keys,
        Err(_) => return,
    };
    let mut decrypter = SmartyDecrypter::new(keys, P1TelegramParser::new(ParserOptions::default()));
    // Framing errors must never panic, whatever length fields the input claims
    let _ = decrypter.feed(data);
});
