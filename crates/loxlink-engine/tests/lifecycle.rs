//! End-to-end lifecycle scenarios: cold offers, assignment, parking,
//! configuration and keep-alive behaviour, driven through a full
//! `Extension` against the mock adapter.

use std::sync::Arc;
use std::time::Duration;

use loxlink_core::command::{device_type, Command, ResetReason};
use loxlink_core::crc::stm32_crc32;
use loxlink_core::frame::Direction;
use loxlink_engine::devices::NullSink;
use loxlink_engine::test_utils::{
    fragment_request, reassemble_sent, server_frame, test_crypto, MockCanAdapter,
};
use loxlink_engine::{
    CanRxEvent, DeviceIdentity, EngineTuning, Extension, ExtensionHandle, LifecycleState,
};
use tokio::sync::mpsc;

const SERIAL: u32 = 0x1234_5678;
const FIRMWARE: u32 = 10_031_108;

fn extension() -> (
    Extension,
    ExtensionHandle,
    Arc<MockCanAdapter>,
    mpsc::Sender<CanRxEvent>,
) {
    let adapter = Arc::new(MockCanAdapter::new());
    let (event_tx, event_rx) = mpsc::channel(64);
    let identity = DeviceIdentity::new(SERIAL, device_type::TREE_BASE_EXTENSION, 2, FIRMWARE);
    let (extension, handle) = Extension::new(
        identity,
        test_crypto(),
        Box::new(NullSink),
        adapter.clone(),
        event_rx,
        EngineTuning::immediate(),
    );
    (extension, handle, adapter, event_tx)
}

fn confirm_frame(nat: u8, parked: bool, serial: u32) -> loxlink_core::frame::CanFrame {
    let serial = serial.to_le_bytes();
    server_frame(
        0x84,
        0,
        Command::NatOfferConfirm,
        [
            nat,
            u8::from(parked),
            0,
            serial[0],
            serial[1],
            serial[2],
            serial[3],
        ],
    )
}

#[tokio::test(start_paused = true)]
async fn cold_boot_emits_offers_until_confirmed() {
    let (mut extension, _handle, adapter, _events) = extension();

    // First offer is due immediately.
    extension.tick().await;
    let offers = adapter.sent_with_command(Command::NatOfferRequest);
    assert_eq!(offers.len(), 1);
    let offer = offers[0];
    assert_eq!(offer.nat_id, 0x84);
    assert_eq!(offer.device_id, 0);
    assert_eq!(offer.direction, Direction::DeviceToServer);
    assert_eq!(offer.b0(), 0x00);
    assert_eq!(offer.val16(), device_type::TREE_BASE_EXTENSION);
    assert_eq!(offer.val32(), SERIAL);

    // The second offer follows inside the fast band.
    for _ in 0..20 {
        tokio::time::advance(Duration::from_millis(10)).await;
        extension.tick().await;
    }
    let offers = adapter.sent_with_command(Command::NatOfferRequest);
    assert!(offers.len() >= 2, "expected a second offer within 200 ms");

    // Assignment stops the offers.
    extension.process_frame(confirm_frame(0x07, false, SERIAL)).await;
    assert_eq!(extension.core().lifecycle(), LifecycleState::Online);
    adapter.clear();
    for _ in 0..50 {
        tokio::time::advance(Duration::from_millis(100)).await;
        extension.tick().await;
    }
    assert!(adapter.sent_with_command(Command::NatOfferRequest).is_empty());
}

#[tokio::test(start_paused = true)]
async fn assignment_emits_start_info() {
    let (mut extension, _handle, adapter, _events) = extension();

    extension.process_frame(confirm_frame(0x07, false, SERIAL)).await;
    assert_eq!(extension.core().assignment(), Some(0x07));
    assert_eq!(extension.core().lifecycle(), LifecycleState::Online);

    let transfers = reassemble_sent(&adapter);
    assert_eq!(transfers.len(), 1);
    let start_info = &transfers[0];
    assert_eq!(start_info.command, Command::StartInfo);
    assert_eq!(start_info.nat_id, 0x07);
    assert_eq!(start_info.device_id, 0);

    let block = &start_info.data;
    assert_eq!(block.len(), 20);
    assert_eq!(&block[0..4], &FIRMWARE.to_le_bytes());
    assert_eq!(&block[4..8], &[0, 0, 0, 0]);
    // Default configuration CRC.
    assert_eq!(&block[8..12], &0xF7C0_95CCu32.to_le_bytes());
    assert_eq!(&block[12..16], &[0x78, 0x56, 0x34, 0x12]);
    assert_eq!(block[16], ResetReason::PowerOnReset as u8);
    assert_eq!(
        &block[17..19],
        &device_type::TREE_BASE_EXTENSION.to_le_bytes()
    );
    assert_eq!(block[19], 2);
}

#[tokio::test(start_paused = true)]
async fn foreign_serial_confirm_changes_nothing() {
    let (mut extension, _handle, adapter, _events) = extension();

    extension
        .process_frame(confirm_frame(0x07, false, 0xAAAA_BBBB))
        .await;
    assert_eq!(extension.core().assignment(), None);
    assert_eq!(extension.core().lifecycle(), LifecycleState::Offline);
    assert!(reassemble_sent(&adapter).is_empty());
}

#[tokio::test(start_paused = true)]
async fn parked_device_answers_lifecycle_but_not_version_requests() {
    let (mut extension, _handle, adapter, _events) = extension();

    extension.process_frame(confirm_frame(0x07, true, SERIAL)).await;
    assert_eq!(extension.core().lifecycle(), LifecycleState::Parked);
    // Parking does not announce.
    assert!(reassemble_sent(&adapter).is_empty());

    // Lifecycle commands still work while parked.
    adapter.clear();
    extension
        .process_frame(server_frame(0x07, 0, Command::Ping, [0; 7]))
        .await;
    let pongs = adapter.sent_with_command(Command::Pong);
    assert_eq!(pongs.len(), 1);
    assert_eq!(pongs[0].nat_id, 0x07);
}

#[tokio::test(start_paused = true)]
async fn config_round_trip_updates_the_advertised_crc() {
    let (mut extension, _handle, adapter, _events) = extension();
    extension.process_frame(confirm_frame(0x07, false, SERIAL)).await;
    adapter.clear();

    let record = [
        0x09, 0x00, 0x00, 0x00, 0x84, 0x03, 0x00, 0x00, 0xAA, 0xBB, 0xCC, 0xDD, 0x00, 0x00, 0x00,
        0x00,
    ];
    for can in fragment_request(0x07, 0, Command::SendConfig, &record) {
        extension.process_frame(can).await;
    }

    let acks = adapter.sent_with_command(Command::ConfigEqual);
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].data, [0; 7]);

    // The next alive reports the CRC over the first twelve record bytes.
    adapter.clear();
    extension
        .process_frame(server_frame(0x07, 0, Command::Alive, [0; 7]))
        .await;
    let alives = adapter.sent_with_command(Command::Alive);
    assert_eq!(alives.len(), 1);
    assert_eq!(alives[0].b0(), ResetReason::AlivePackage as u8);
    assert_eq!(alives[0].val32(), stm32_crc32(&record[..12]));
}

#[tokio::test(start_paused = true)]
async fn truncated_config_gets_no_ack() {
    let (mut extension, _handle, adapter, _events) = extension();
    extension.process_frame(confirm_frame(0x07, false, SERIAL)).await;
    adapter.clear();

    for can in fragment_request(0x07, 0, Command::SendConfig, &[0x09, 0x00, 0x00]) {
        extension.process_frame(can).await;
    }
    assert!(adapter.sent_with_command(Command::ConfigEqual).is_empty());
}

#[tokio::test(start_paused = true)]
async fn offline_timeout_returns_to_offering() {
    let (mut extension, _handle, adapter, _events) = extension();
    extension.process_frame(confirm_frame(0x07, false, SERIAL)).await;

    // Apply a short timeout so the countdown is quick.
    let mut record = vec![0x09, 0x00, 0x00, 0x00];
    record.extend_from_slice(&5u32.to_le_bytes());
    record.extend_from_slice(&[0; 4]);
    for can in fragment_request(0x07, 0, Command::SendConfig, &record) {
        extension.process_frame(can).await;
    }

    adapter.clear();
    for _ in 0..8 {
        tokio::time::advance(Duration::from_secs(1)).await;
        extension.tick().await;
    }
    assert_eq!(extension.core().lifecycle(), LifecycleState::Offline);
    assert!(!adapter.sent_with_command(Command::NatOfferRequest).is_empty());
}

#[tokio::test(start_paused = true)]
async fn extensions_offline_holds_offers_until_identify_unknown() {
    let (mut extension, _handle, adapter, _events) = extension();

    extension
        .process_frame(server_frame(0x84, 0, Command::ExtensionsOffline, [0; 7]))
        .await;
    adapter.clear();
    for _ in 0..10 {
        tokio::time::advance(Duration::from_secs(1)).await;
        extension.tick().await;
    }
    assert!(adapter.sent_with_command(Command::NatOfferRequest).is_empty());

    extension
        .process_frame(server_frame(0x84, 0, Command::IdentifyUnknown, [0; 7]))
        .await;
    extension.tick().await;
    assert_eq!(adapter.sent_with_command(Command::NatOfferRequest).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn run_loop_preserves_adapter_sequence_order() {
    let (extension, handle, adapter, events) = extension();
    let task = tokio::spawn(extension.run());

    // Assign first so pings are answered.
    events
        .send(CanRxEvent {
            frame: confirm_frame(0x07, false, SERIAL),
            sequence: 0,
        })
        .await
        .unwrap();

    // Deliver two diagnostics requests out of order; replies must come back
    // in sequence order, proven by the echoed branch byte.
    let second = server_frame(0x07, 0, Command::CanDiagnosticsRequest, [2, 0, 0, 0, 0, 0, 0]);
    let first = server_frame(0x07, 0, Command::CanDiagnosticsRequest, [1, 0, 0, 0, 0, 0, 0]);
    events.send(CanRxEvent { frame: second, sequence: 2 }).await.unwrap();
    events.send(CanRxEvent { frame: first, sequence: 1 }).await.unwrap();

    // Let the task drain.
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }

    let replies = adapter.sent_with_command(Command::CanDiagnosticsReply);
    assert_eq!(replies.len(), 2);
    assert_eq!(replies[0].b0(), 1);
    assert_eq!(replies[1].b0(), 2);

    handle.shutdown().await.unwrap();
    task.await.unwrap().unwrap();

    // Stop semantics: the Online extension said goodbye.
    assert_eq!(adapter.sent_with_command(Command::SetOffline).len(), 1);
    assert!(!adapter.is_receiving());
}
