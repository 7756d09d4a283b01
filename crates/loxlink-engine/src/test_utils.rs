//! Test fixtures: a mock CAN adapter and server-side frame builders
//!
//! The mock captures everything the engine transmits and lets a test play
//! the Miniserver's role. Server-side fragmented transfers are built with
//! the same chunking rules the emitter uses, so handler tests exercise the
//! real assembler path.

use std::sync::Arc;

use async_trait::async_trait;
use loxlink_core::command::Command;
use loxlink_core::config::CryptoConfig;
use loxlink_core::crc::buffer_crc32;
use loxlink_core::frame::{CanFrame, NatFrame};
use loxlink_core::Result;
use parking_lot::Mutex;

use loxlink_core::frame::FragmentedNatFrame;

use crate::adapter::CanAdapter;
use crate::fragment::{AssemblyOutcome, FragmentAssembler, CHUNK_LEN};

/// Captures transmitted frames instead of touching hardware
#[derive(Debug, Default)]
pub struct MockCanAdapter {
    sent: Mutex<Vec<CanFrame>>,
    receiving: Mutex<bool>,
}

impl MockCanAdapter {
    /// Fresh adapter with an empty capture log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything transmitted so far, oldest first.
    pub fn sent(&self) -> Vec<CanFrame> {
        self.sent.lock().clone()
    }

    /// Transmitted frames decoded as NAT frames.
    pub fn sent_nat(&self) -> Vec<NatFrame> {
        self.sent
            .lock()
            .iter()
            .filter_map(|can| NatFrame::decode(can).ok())
            .collect()
    }

    /// Transmitted NAT frames with the given command.
    pub fn sent_with_command(&self, command: Command) -> Vec<NatFrame> {
        self.sent_nat()
            .into_iter()
            .filter(|frame| frame.command == command)
            .collect()
    }

    /// Forget everything captured so far.
    pub fn clear(&self) {
        self.sent.lock().clear();
    }

    /// Whether `start_receive` is active.
    pub fn is_receiving(&self) -> bool {
        *self.receiving.lock()
    }
}

#[async_trait]
impl CanAdapter for MockCanAdapter {
    async fn send_frame(&self, id: u32, data: [u8; 8]) -> Result<()> {
        self.sent.lock().push(CanFrame::new(id, data));
        Ok(())
    }

    async fn start_receive(&self) -> Result<()> {
        *self.receiving.lock() = true;
        Ok(())
    }

    async fn stop_receive(&self) -> Result<()> {
        *self.receiving.lock() = false;
        Ok(())
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// A server→device frame with the given payload.
pub fn server_frame(nat_id: u8, device_id: u8, command: Command, data: [u8; 7]) -> CanFrame {
    NatFrame::server(nat_id, device_id, command)
        .with_data(data)
        .encode()
}

/// A server-side fragmented transfer: `FragmentStart` plus data chunks.
pub fn fragment_request(nat_id: u8, device_id: u8, command: Command, payload: &[u8]) -> Vec<CanFrame> {
    let mut start = NatFrame::server(nat_id, device_id, Command::FragmentStart).with_fragmented(true);
    start.set_b0(command.byte());
    start.set_val16(payload.len() as u16);
    start.set_val32(buffer_crc32(payload));

    let mut frames = vec![start.encode()];
    for chunk in payload.chunks(CHUNK_LEN) {
        let mut data = [0u8; CHUNK_LEN];
        data[..chunk.len()].copy_from_slice(chunk);
        frames.push(
            NatFrame::server(nat_id, device_id, Command::FragmentData)
                .with_fragmented(true)
                .with_data(data)
                .encode(),
        );
    }
    frames
}

/// Reassemble every fragmented transfer the engine transmitted.
pub fn reassemble_sent(adapter: &MockCanAdapter) -> Vec<FragmentedNatFrame> {
    let mut assembler = FragmentAssembler::new();
    let mut complete = Vec::new();
    for frame in adapter.sent_nat() {
        if !frame.command.is_fragment_transport() {
            continue;
        }
        if let AssemblyOutcome::Complete(done) = assembler.on_frame(&frame) {
            complete.push(done);
        }
    }
    complete
}

/// Crypto material every test shares.
pub fn test_crypto() -> Arc<CryptoConfig> {
    Arc::new(CryptoConfig {
        aes_key: "00112233445566778899aabbccddeeff".into(),
        aes_iv: "ffeeddccbbaa99887766554433221100".into(),
        legacy_key: [0x4D3A_2B1C, 0x0F1E_2D3C, 0x5A69_7887, 0x96A5_B4C3],
        legacy_iv: [0x1111_2222, 0x3333_4444, 0x5555_6666, 0x7777_8888],
        master_device_id: "aabbccddeeff001122334455".into(),
    })
}
