//! Unit tests for the P1 device reader task.

mod common;

use common::{corrupt_crc, dsmr5_telegram, link, wait_until, ScriptedConnector};
use dsmr_rs::constants::{EVENT_QUEUE_CAPACITY, SMARTY_AUTH_FAILURES_BEFORE_FATAL};
use dsmr_rs::device::LinkEvent;
use dsmr_rs::telegram::smarty::encrypt_telegram;
use dsmr_rs::{DecoderOptions, DeviceEvent, DsmrDevice, ErrorStatus, SmartyKeys};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::time::timeout;

async fn next_event(events: &mut mpsc::Receiver<DeviceEvent>) -> DeviceEvent {
    timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("no event in time")
        .expect("event queue closed")
}

/// Tests that telegrams written to the link arrive as events.
#[tokio::test]
async fn test_reader_delivers_telegrams() {
    let (mut tx, rx) = link();
    let (connector, stats) = ScriptedConnector::new(vec![rx]);
    let (device, mut events) = DsmrDevice::new(Box::new(connector), DecoderOptions::default());
    assert_eq!(device.name(), "scripted");

    device.start().await.unwrap();
    let sealed = dsmr5_telegram();
    tx.write_all(sealed.as_bytes()).await.unwrap();
    tx.write_all(sealed.as_bytes()).await.unwrap();

    for _ in 0..2 {
        match next_event(&mut events).await {
            DeviceEvent::Telegram(telegram) => assert_eq!(telegram.header, "ISK5\\2M550T-1012"),
            other => panic!("unexpected event {other:?}"),
        }
    }
    assert!(device.is_running().await);
    assert_eq!(stats.opens(), 1);
    assert_eq!(stats.observed(LinkEvent::Telegram), 2);
}

/// Tests that close interrupts a reader blocked in read and returns the
/// connector.
#[tokio::test]
async fn test_close_interrupts_blocked_read() {
    let (_tx, rx) = link();
    let (connector, stats) = ScriptedConnector::new(vec![rx]);
    let (device, _events) = DsmrDevice::new(Box::new(connector), DecoderOptions::default());

    device.start().await.unwrap();
    wait_until(|| stats.opens() == 1).await;

    let connector = timeout(Duration::from_secs(1), device.close())
        .await
        .expect("close did not return");
    assert!(connector.is_some());
    assert!(!device.is_running().await);
    assert!(device.start().await.is_err());
}

/// Tests that restart opens a fresh connection and decodes from it.
#[tokio::test]
async fn test_restart_reopens() {
    let (_tx1, rx1) = link();
    let (mut tx2, rx2) = link();
    let (connector, stats) = ScriptedConnector::new(vec![rx1, rx2]);
    let (device, mut events) = DsmrDevice::new(Box::new(connector), DecoderOptions::default());

    device.start().await.unwrap();
    wait_until(|| stats.opens() == 1).await;
    device.restart().await.unwrap();
    wait_until(|| stats.opens() == 2).await;

    tx2.write_all(dsmr5_telegram().as_bytes()).await.unwrap();
    assert!(matches!(
        next_event(&mut events).await,
        DeviceEvent::Telegram(_)
    ));
    assert!(!device.is_restarting());
}

/// Tests that concurrent restarts result in a single reconnect.
#[tokio::test]
async fn test_restart_idempotent() {
    let links: Vec<_> = (0..3).map(|_| link()).collect();
    let (senders, receivers): (Vec<_>, Vec<_>) = links.into_iter().unzip();
    let (connector, stats) = ScriptedConnector::new(receivers);
    let (device, _events) = DsmrDevice::new(Box::new(connector), DecoderOptions::default());

    device.start().await.unwrap();
    wait_until(|| stats.opens() == 1).await;

    let (first, second) = tokio::join!(device.restart(), device.restart());
    assert!(first.is_ok() && second.is_ok());
    wait_until(|| stats.opens() == 2).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(stats.opens(), 2);
    drop(senders);
}

/// Tests that the end of the stream is reported and stops the reader.
#[tokio::test]
async fn test_end_of_stream() {
    let (tx, rx) = link();
    let (connector, _stats) = ScriptedConnector::new(vec![rx]);
    let (device, mut events) = DsmrDevice::new(Box::new(connector), DecoderOptions::default());

    device.start().await.unwrap();
    drop(tx);
    match next_event(&mut events).await {
        DeviceEvent::Error(ErrorStatus::SerialDataReadError(_)) => {}
        other => panic!("unexpected event {other:?}"),
    }
    timeout(Duration::from_secs(5), async {
        while device.is_running().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

/// Tests that a failing open is reported as a communication error.
#[tokio::test]
async fn test_open_failure() {
    let (connector, _stats) = ScriptedConnector::new(Vec::<tokio::io::DuplexStream>::new());
    let (device, mut events) = DsmrDevice::new(Box::new(connector), DecoderOptions::default());

    device.start().await.unwrap();
    match next_event(&mut events).await {
        DeviceEvent::Error(status) => {
            assert!(matches!(status, ErrorStatus::ConnectionFailed(_)));
            assert!(status.is_communication_error());
        }
        other => panic!("unexpected event {other:?}"),
    }
}

/// Tests that the connector can ask for a reconnect after decode errors.
#[tokio::test]
async fn test_reopen_requested_by_connector() {
    let (mut tx1, rx1) = link();
    let (mut tx2, rx2) = link();
    let (connector, stats) = ScriptedConnector::new(vec![rx1, rx2]);
    let connector =
        connector.reopen_after_errors(2, Some(ErrorStatus::PortSettingsDetectionFailed));
    let (device, mut events) = DsmrDevice::new(Box::new(connector), DecoderOptions::default());

    device.start().await.unwrap();
    let corrupt = corrupt_crc(&dsmr5_telegram());
    tx1.write_all(corrupt.as_bytes()).await.unwrap();
    tx1.write_all(corrupt.as_bytes()).await.unwrap();

    assert_eq!(
        next_event(&mut events).await,
        DeviceEvent::Error(ErrorStatus::TelegramCrcError)
    );
    assert_eq!(
        next_event(&mut events).await,
        DeviceEvent::Error(ErrorStatus::TelegramCrcError)
    );
    assert_eq!(
        next_event(&mut events).await,
        DeviceEvent::Error(ErrorStatus::PortSettingsDetectionFailed)
    );
    wait_until(|| stats.opens() == 2).await;

    tx2.write_all(dsmr5_telegram().as_bytes()).await.unwrap();
    assert!(matches!(
        next_event(&mut events).await,
        DeviceEvent::Telegram(_)
    ));
}

/// Tests that a wrong decryption key stops the reader after repeated
/// authentication failures.
#[tokio::test]
async fn test_fatal_error_stops_reader() {
    let (mut tx, rx) = link();
    let (connector, _stats) = ScriptedConnector::new(vec![rx]);
    let options = DecoderOptions {
        smarty: Some(SmartyKeys::from_hex("FFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFF", None).unwrap()),
        ..Default::default()
    };
    let (device, mut events) = DsmrDevice::new(Box::new(connector), options);

    let sender_keys = SmartyKeys::from_hex(common::SMARTY_KEY, None).unwrap();
    device.start().await.unwrap();
    for counter in 1..=SMARTY_AUTH_FAILURES_BEFORE_FATAL {
        let frame = encrypt_telegram(
            &sender_keys,
            &common::SMARTY_SYSTEM_TITLE,
            counter,
            common::smarty_telegram().as_bytes(),
        )
        .unwrap();
        tx.write_all(&frame).await.unwrap();
    }
    for _ in 1..SMARTY_AUTH_FAILURES_BEFORE_FATAL {
        assert!(matches!(
            next_event(&mut events).await,
            DeviceEvent::Error(ErrorStatus::TelegramDataCorruption(_))
        ));
    }
    assert_eq!(
        next_event(&mut events).await,
        DeviceEvent::Error(ErrorStatus::InvalidDecryptionKey)
    );
    timeout(Duration::from_secs(5), async {
        while device.is_running().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

/// Tests that a key confirmed before a restart keeps corrupt frames transient
/// on the new connection.
#[tokio::test]
async fn test_key_confirmation_survives_restart() {
    let (mut tx1, rx1) = link();
    let (mut tx2, rx2) = link();
    let (connector, stats) = ScriptedConnector::new(vec![rx1, rx2]);
    let keys = SmartyKeys::from_hex(common::SMARTY_KEY, None).unwrap();
    let options = DecoderOptions {
        smarty: Some(keys.clone()),
        ..Default::default()
    };
    let (device, mut events) = DsmrDevice::new(Box::new(connector), options);
    let frame = |counter| {
        encrypt_telegram(
            &keys,
            &common::SMARTY_SYSTEM_TITLE,
            counter,
            common::smarty_telegram().as_bytes(),
        )
        .unwrap()
    };

    device.start().await.unwrap();
    tx1.write_all(&frame(1)).await.unwrap();
    assert!(matches!(
        next_event(&mut events).await,
        DeviceEvent::Telegram(_)
    ));
    device.restart().await.unwrap();
    wait_until(|| stats.opens() == 2).await;

    let mut corrupt = frame(2);
    let middle = corrupt.len() / 2;
    corrupt[middle] ^= 0x01;
    for _ in 0..=SMARTY_AUTH_FAILURES_BEFORE_FATAL {
        tx2.write_all(&corrupt).await.unwrap();
    }
    tx2.write_all(&frame(3)).await.unwrap();
    for _ in 0..=SMARTY_AUTH_FAILURES_BEFORE_FATAL {
        assert!(matches!(
            next_event(&mut events).await,
            DeviceEvent::Error(ErrorStatus::TelegramDataCorruption(_))
        ));
    }
    assert!(matches!(
        next_event(&mut events).await,
        DeviceEvent::Telegram(_)
    ));
    assert!(device.is_running().await);
}

/// Tests that a full event queue drops events instead of blocking the reader.
#[tokio::test]
async fn test_full_queue_never_blocks() {
    let (mut tx, rx) = link();
    let (connector, stats) = ScriptedConnector::new(vec![rx]);
    let (device, mut events) = DsmrDevice::new(Box::new(connector), DecoderOptions::default());

    device.start().await.unwrap();
    let sealed = dsmr5_telegram();
    for _ in 0..EVENT_QUEUE_CAPACITY + 4 {
        tx.write_all(sealed.as_bytes()).await.unwrap();
    }
    wait_until(|| stats.observed(LinkEvent::Telegram) == EVENT_QUEUE_CAPACITY + 4).await;

    let mut queued = 0;
    while events.try_recv().is_ok() {
        queued += 1;
    }
    assert_eq!(queued, EVENT_QUEUE_CAPACITY);

    tx.write_all(sealed.as_bytes()).await.unwrap();
    assert!(matches!(
        next_event(&mut events).await,
        DeviceEvent::Telegram(_)
    ));
}

/// Tests that a read error after a telegram is reported and ends the reader.
#[tokio::test]
async fn test_read_error_after_telegram() {
    let sealed = dsmr5_telegram();
    let mock = tokio_test::io::Builder::new()
        .read(sealed.as_bytes())
        .read_error(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "cable unplugged",
        ))
        .build();
    let (connector, _stats) = ScriptedConnector::new(vec![mock]);
    let (device, mut events) = DsmrDevice::new(Box::new(connector), DecoderOptions::default());

    device.start().await.unwrap();
    assert!(matches!(
        next_event(&mut events).await,
        DeviceEvent::Telegram(_)
    ));
    assert_eq!(
        next_event(&mut events).await,
        DeviceEvent::Error(ErrorStatus::SerialDataReadError(
            "cable unplugged".to_string()
        ))
    );
}
