//! Fragmented-transfer assembler and emitter
//!
//! Payloads longer than the seven NAT data bytes travel as a
//! `FragmentStart` header (original command, total size, CRC32) followed by
//! `FragmentData` chunks of up to seven bytes. The last chunk is
//! zero-padded; padding never counts towards the announced size.
//!
//! At most one inbound session exists per device. A new `FragmentStart`
//! restarts it unconditionally, and a CRC mismatch discards the payload
//! without any reply - the Miniserver simply retries.

use std::time::Duration;

use bytes::BytesMut;
use loxlink_core::command::Command;
use loxlink_core::crc::buffer_crc32;
use loxlink_core::frame::{FragmentedNatFrame, NatFrame};
use loxlink_core::{LinkError, Result};
use tracing::{debug, error, trace};

use crate::adapter::LinkPort;

/// Payload bytes per `FragmentData` frame.
pub const CHUNK_LEN: usize = 7;

/// What the assembler made of one transport frame
#[derive(Debug, PartialEq, Eq)]
pub enum AssemblyOutcome {
    /// Transfer still in progress (or frame ignored)
    Pending,
    /// A payload completed and passed its CRC
    Complete(FragmentedNatFrame),
    /// A payload completed but failed its CRC and was discarded
    CrcMismatch,
}

#[derive(Debug)]
struct Session {
    command: Command,
    size: usize,
    expected_crc: u32,
    buffer: BytesMut,
}

/// Reassembles one fragmented payload at a time
#[derive(Debug, Default)]
pub struct FragmentAssembler {
    session: Option<Session>,
}

impl FragmentAssembler {
    /// Fresh assembler with no session.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a `FragmentStart`/`FragmentData` frame.
    pub fn on_frame(&mut self, frame: &NatFrame) -> AssemblyOutcome {
        match frame.command {
            Command::FragmentStart => self.on_start(frame),
            Command::FragmentData => self.on_data(frame),
            _ => AssemblyOutcome::Pending,
        }
    }

    fn on_start(&mut self, frame: &NatFrame) -> AssemblyOutcome {
        let command = Command::from(frame.b0());
        let size = usize::from(frame.val16());
        let expected_crc = frame.val32();

        trace!(%command, size, "fragment transfer started");
        self.session = Some(Session {
            command,
            size,
            expected_crc,
            buffer: BytesMut::with_capacity(size),
        });

        // A zero-size transfer has no data frames to wait for.
        if size == 0 {
            return self.try_complete(frame);
        }
        AssemblyOutcome::Pending
    }

    fn on_data(&mut self, frame: &NatFrame) -> AssemblyOutcome {
        let Some(session) = self.session.as_mut() else {
            debug!("fragment data without a session, ignored");
            return AssemblyOutcome::Pending;
        };

        let missing = session.size - session.buffer.len();
        let take = missing.min(CHUNK_LEN);
        session.buffer.extend_from_slice(&frame.data[..take]);

        if session.buffer.len() < session.size {
            return AssemblyOutcome::Pending;
        }
        self.try_complete(frame)
    }

    fn try_complete(&mut self, frame: &NatFrame) -> AssemblyOutcome {
        let session = self.session.take().expect("session present on completion");
        let actual_crc = buffer_crc32(&session.buffer);

        if actual_crc != session.expected_crc {
            error!(
                command = %session.command,
                expected = format_args!("{:#010x}", session.expected_crc),
                actual = format_args!("{:#010x}", actual_crc),
                "fragmented payload failed CRC, discarded"
            );
            return AssemblyOutcome::CrcMismatch;
        }

        AssemblyOutcome::Complete(FragmentedNatFrame {
            nat_id: frame.nat_id,
            device_id: frame.device_id,
            command: session.command,
            data: session.buffer.to_vec(),
        })
    }

    /// Discard any in-flight session.
    pub fn reset(&mut self) {
        self.session = None;
    }

    /// Whether a transfer is currently in progress.
    pub fn in_flight(&self) -> bool {
        self.session.is_some()
    }
}

/// Split a payload into `FragmentStart` + `FragmentData` frames and send
/// them device→server, pacing chunks by `gap`.
///
/// Returns the number of CAN frames transmitted.
pub async fn emit(
    port: &LinkPort,
    nat_id: u8,
    device_id: u8,
    command: Command,
    data: &[u8],
    gap: Duration,
) -> Result<usize> {
    if data.len() > usize::from(u16::MAX) {
        return Err(LinkError::InvalidLength {
            len: data.len(),
            context: "fragmented payload",
        });
    }

    let size = data.len() as u16;
    let crc = buffer_crc32(data);

    let mut start = NatFrame::device(nat_id, device_id, Command::FragmentStart).with_fragmented(true);
    start.set_b0(command.byte());
    start.set_val16(size);
    start.set_val32(crc);
    port.send(&start).await?;
    let mut sent = 1;

    for chunk in data.chunks(CHUNK_LEN) {
        if !gap.is_zero() {
            tokio::time::sleep(gap).await;
        }
        let mut payload = [0u8; CHUNK_LEN];
        payload[..chunk.len()].copy_from_slice(chunk);
        let frame =
            NatFrame::device(nat_id, device_id, Command::FragmentData).with_fragmented(true);
        port.send(&frame.with_data(payload)).await?;
        sent += 1;
    }

    Ok(sent)
}
