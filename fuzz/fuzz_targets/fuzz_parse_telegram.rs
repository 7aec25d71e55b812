#![no_main]

use dsmr_rs::{P1TelegramParser, ParserOptions, TelegramDecoder};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Whole input at once, strict and lenient
    let _ = dsmr_rs::parse_telegram(data, &ParserOptions::default());
    let _ = dsmr_rs::parse_telegram(data, &ParserOptions::lenient());

    // Same input in small chunks through the streaming parser
    let mut parser = P1TelegramParser::new(ParserOptions::default());
    for chunk in data.chunks(7) {
        let _ = parser.feed(chunk);
    }

    // A valid telegram after arbitrary garbage must still be decoded
    let mut parser = P1TelegramParser::new(ParserOptions::default());
    let _ = parser.feed(data);
    let _ = parser.feed(b"\r\n");
    let valid = dsmr_rs::telegram::crc::seal_telegram("/FUZ5\\fuzz\r\n\r\n1-3:0.2.8(50)\r\n");
    let events = parser.feed(valid.as_bytes());
    assert!(events
        .iter()
        .any(|event| matches!(event, dsmr_rs::DecodeEvent::Telegram(_))));
});
