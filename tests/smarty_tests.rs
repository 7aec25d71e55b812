//! Unit tests for Smarty frame decryption.

mod common;

use common::{smarty_telegram, SMARTY_KEY, SMARTY_SYSTEM_TITLE};
use dsmr_rs::constants::SMARTY_AUTH_FAILURES_BEFORE_FATAL;
use dsmr_rs::telegram::smarty::{encrypt_telegram, CryptoError};
use dsmr_rs::{
    decode_dump, CosemObjectType, DecodeEvent, DecoderOptions, ErrorStatus, P1TelegramParser,
    ParserOptions, SmartyDecrypter, SmartyKeys, TelegramDecoder, TelegramError,
};

fn keys() -> SmartyKeys {
    SmartyKeys::from_hex(SMARTY_KEY, None).unwrap()
}

fn decrypter() -> SmartyDecrypter {
    SmartyDecrypter::new(keys(), P1TelegramParser::new(ParserOptions::default()))
}

fn frame(counter: u32) -> Vec<u8> {
    encrypt_telegram(
        &keys(),
        &SMARTY_SYSTEM_TITLE,
        counter,
        smarty_telegram().as_bytes(),
    )
    .unwrap()
}

/// Tests that an encrypted frame decodes to the plaintext telegram.
#[test]
fn test_decrypt_telegram() {
    let events = decrypter().feed(&frame(1));
    let telegram = match events.as_slice() {
        [DecodeEvent::Telegram(telegram)] => telegram,
        other => panic!("unexpected events {other:?}"),
    };
    assert_eq!(telegram.header, "Lux5\\SMARTY1");
    assert_eq!(telegram.p1_version(), Some("42"));
    assert!(telegram
        .first_of_type(CosemObjectType::LogicalDeviceName)
        .is_some());
    assert!(telegram.crc_verified);
}

/// Tests that frames split at arbitrary positions are reassembled.
#[test]
fn test_frames_in_chunks() {
    let mut stream = frame(1);
    stream.extend(frame(2));
    stream.extend(frame(3));

    let mut decrypter = decrypter();
    let mut events = Vec::new();
    for chunk in stream.chunks(13) {
        events.extend(decrypter.feed(chunk));
    }
    assert_eq!(events.len(), 3);
    assert!(events
        .iter()
        .all(|event| matches!(event, DecodeEvent::Telegram(_))));
}

/// Tests that a wrong key is reported as fatal once repeated frames fail
/// before any frame decrypted.
#[test]
fn test_wrong_key_is_fatal() {
    let wrong = SmartyKeys::from_hex("FFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFF", None).unwrap();
    let mut decrypter =
        SmartyDecrypter::new(wrong, P1TelegramParser::new(ParserOptions::default()));
    for counter in 1..SMARTY_AUTH_FAILURES_BEFORE_FATAL {
        assert_eq!(
            decrypter.feed(&frame(counter)),
            vec![DecodeEvent::Rejected(TelegramError::AuthenticationFailed)]
        );
    }
    assert_eq!(
        decrypter.feed(&frame(SMARTY_AUTH_FAILURES_BEFORE_FATAL)),
        vec![DecodeEvent::Failed(ErrorStatus::InvalidDecryptionKey)]
    );
    assert!(ErrorStatus::InvalidDecryptionKey.is_fatal());
}

/// Tests that a wrong additional key fails authentication like a wrong key.
#[test]
fn test_wrong_additional_key() {
    let keys = SmartyKeys::from_hex(SMARTY_KEY, Some("FFEEDDCCBBAA99887766554433221100")).unwrap();
    let mut decrypter = SmartyDecrypter::new(keys, P1TelegramParser::new(ParserOptions::default()));
    let mut stream = Vec::new();
    for counter in 1..=SMARTY_AUTH_FAILURES_BEFORE_FATAL {
        stream.extend(frame(counter));
    }
    let events = decrypter.feed(&stream);
    assert_eq!(
        events.last(),
        Some(&DecodeEvent::Failed(ErrorStatus::InvalidDecryptionKey))
    );
    assert_eq!(events.len(), SMARTY_AUTH_FAILURES_BEFORE_FATAL as usize);
}

/// Tests that a corrupted first frame under the right key is a transient
/// rejection and the next frame decodes.
#[test]
fn test_corrupt_first_frame() {
    let mut decrypter = decrypter();
    let mut corrupt = frame(1);
    let middle = corrupt.len() / 2;
    corrupt[middle] ^= 0x01;
    assert_eq!(
        decrypter.feed(&corrupt),
        vec![DecodeEvent::Rejected(TelegramError::AuthenticationFailed)]
    );
    assert!(matches!(
        decrypter.feed(&frame(2)).as_slice(),
        [DecodeEvent::Telegram(_)]
    ));
}

/// Tests that a decoder rebuilt after a reconnect keeps the key confirmed,
/// so corrupt frames stay transient however many arrive.
#[test]
fn test_key_confirmation_survives_rebuild() {
    let options = DecoderOptions {
        smarty: Some(keys()),
        ..Default::default()
    };
    let mut first = options.build();
    assert!(matches!(
        first.feed(&frame(1)).as_slice(),
        [DecodeEvent::Telegram(_)]
    ));

    let mut rebuilt = options.clone().build();
    let mut corrupt = frame(2);
    let middle = corrupt.len() / 2;
    corrupt[middle] ^= 0xFF;
    for _ in 0..SMARTY_AUTH_FAILURES_BEFORE_FATAL + 2 {
        assert_eq!(
            rebuilt.feed(&corrupt),
            vec![DecodeEvent::Rejected(TelegramError::AuthenticationFailed)]
        );
    }
}

/// Tests that a corrupted frame after a good one is a transient rejection.
#[test]
fn test_corrupt_frame_after_success() {
    let mut decrypter = decrypter();
    assert!(matches!(
        decrypter.feed(&frame(1)).as_slice(),
        [DecodeEvent::Telegram(_)]
    ));

    let mut corrupt = frame(2);
    let middle = corrupt.len() / 2;
    corrupt[middle] ^= 0xFF;
    assert_eq!(
        decrypter.feed(&corrupt),
        vec![DecodeEvent::Rejected(TelegramError::AuthenticationFailed)]
    );
    assert!(matches!(
        decrypter.feed(&frame(3)).as_slice(),
        [DecodeEvent::Telegram(_)]
    ));
}

/// Tests that a broken frame header resynchronizes on the next frame.
#[test]
fn test_framing_error_resync() {
    let mut broken = frame(1);
    broken[10] = 0x00; // length separator
    let mut stream = vec![0x00, 0x13, 0x37];
    stream.extend(broken);
    stream.extend(frame(2));

    let events = decrypter().feed(&stream);
    let telegrams = events
        .iter()
        .filter(|event| matches!(event, DecodeEvent::Telegram(_)))
        .count();
    assert_eq!(telegrams, 1);
    assert!(events
        .iter()
        .any(|event| matches!(event, DecodeEvent::Rejected(TelegramError::InvalidFrame(_)))));
}

/// Tests that keys are validated when parsed.
#[test]
fn test_key_validation() {
    assert_eq!(
        SmartyKeys::from_hex("00112233", None).unwrap_err(),
        CryptoError::InvalidKeyLength {
            expected: 16,
            actual: 4
        }
    );
    assert!(SmartyKeys::from_hex(SMARTY_KEY, Some("not hex")).is_err());
}

/// Tests that a captured dump of encrypted frames decodes through the
/// configured decoder.
#[test]
fn test_decode_dump() {
    let mut dump = frame(7);
    dump.extend(frame(8));
    let options = DecoderOptions {
        smarty: Some(keys()),
        ..Default::default()
    };
    let results = decode_dump(&dump, &options);
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(Result::is_ok));
}
