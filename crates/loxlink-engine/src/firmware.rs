//! Firmware-update session
//!
//! A stateful mini-protocol carried inside the fragmented `FirmwareUpdate`
//! command. The Miniserver streams image bytes page by page, follows up
//! with per-page CRCs, then asks for verification. The engine validates
//! everything and reports the result; it never flashes anything - applying
//! the new version is the concrete device's decision.
//!
//! Each payload starts with a fixed header:
//! `dataSize(u8) subCommand(u8) deviceType(u16) newVersion(u32)
//! pageNumber(u16) index(u16)` followed by `dataSize` bytes.

use std::collections::BTreeMap;

use loxlink_core::crc::buffer_crc32;
use tracing::{debug, info, warn};

/// Header bytes preceding the data of every sub-command payload.
const HEADER_LEN: usize = 12;

/// Stream image bytes.
const SUB_DATA: u8 = 0x01;
/// Deliver a page's expected CRC.
const SUB_CRC: u8 = 0x02;
/// Verify and report the outcome.
const SUB_VERIFY: u8 = 0x03;
/// Verify without reporting; the device restarts on success.
const SUB_VERIFY_AND_RESTART: u8 = 0x04;

/// Verify reply status for an intact image.
const STATUS_OK: u8 = 0x80;
/// Verify reply status for a corrupt page.
const STATUS_FAILED: u8 = 0x81;

/// Where a session currently stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// No update in progress
    Idle,
    /// Image bytes are arriving
    Receiving,
    /// Per-page CRCs are arriving
    ReceivingCrc,
    /// Verification passed; version handed to the device
    Completed,
    /// Verification failed; waiting for a retry
    Failed,
}

#[derive(Debug, Default)]
struct Page {
    start: usize,
    len: usize,
    expected_crc: Option<u32>,
}

/// What a handled sub-command asks the device to do
#[derive(Debug, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Payload was malformed or out of phase; nothing to do
    Ignored,
    /// Chunk accepted; a heartbeat is due
    Progress,
    /// Verification ran
    Verified {
        /// Reply payload to emit (absent for verify-and-restart)
        reply: Option<Vec<u8>>,
        /// New firmware version to adopt when the image checked out
        new_version: Option<u32>,
    },
}

/// One device's firmware-update session; at most one exists at a time
#[derive(Debug)]
pub struct UpdateSession {
    phase: SessionPhase,
    device_type: u16,
    new_version: u32,
    image: Vec<u8>,
    pages: BTreeMap<u16, Page>,
}

impl UpdateSession {
    /// An idle session.
    pub fn new() -> Self {
        Self {
            phase: SessionPhase::Idle,
            device_type: 0,
            new_version: 0,
            image: Vec::new(),
            pages: BTreeMap::new(),
        }
    }

    /// Current phase.
    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Drop any in-flight update.
    pub fn clear(&mut self) {
        self.phase = SessionPhase::Idle;
        self.new_version = 0;
        self.image.clear();
        self.pages.clear();
    }

    /// Device type the running session belongs to.
    pub fn device_type(&self) -> u16 {
        self.device_type
    }

    /// Handle one reassembled `FirmwareUpdate` payload.
    pub fn handle(&mut self, payload: &[u8], own_device_type: u16) -> UpdateOutcome {
        if payload.len() < HEADER_LEN {
            warn!(len = payload.len(), "firmware payload shorter than header");
            return UpdateOutcome::Ignored;
        }

        let data_size = usize::from(payload[0]);
        let sub_command = payload[1];
        let device_type = u16::from_le_bytes([payload[2], payload[3]]);
        let new_version = u32::from_le_bytes([payload[4], payload[5], payload[6], payload[7]]);
        let page_number = u16::from_le_bytes([payload[8], payload[9]]);
        let index = u16::from_le_bytes([payload[10], payload[11]]);
        let end = (HEADER_LEN + data_size).min(payload.len());
        let bytes = &payload[HEADER_LEN..end];

        if device_type != own_device_type {
            warn!(
                got = format_args!("{device_type:#06x}"),
                own = format_args!("{own_device_type:#06x}"),
                "firmware update for a different device type, ignored"
            );
            return UpdateOutcome::Ignored;
        }
        self.device_type = device_type;

        match sub_command {
            SUB_DATA => self.on_data(new_version, page_number, bytes),
            SUB_CRC => self.on_crc(page_number, bytes),
            SUB_VERIFY => self.on_verify(index, true),
            SUB_VERIFY_AND_RESTART => self.on_verify(index, false),
            other => {
                warn!(sub_command = other, "unknown firmware sub-command");
                UpdateOutcome::Ignored
            }
        }
    }

    fn on_data(&mut self, new_version: u32, page_number: u16, bytes: &[u8]) -> UpdateOutcome {
        if self.phase != SessionPhase::Receiving {
            // Any data chunk outside a receive phase begins a fresh session.
            self.clear();
            self.phase = SessionPhase::Receiving;
            self.new_version = new_version;
            info!(
                version = new_version,
                "firmware update session started"
            );
        }

        let offset = self.image.len();
        let page = self.pages.entry(page_number).or_insert_with(|| Page {
            start: offset,
            ..Page::default()
        });
        page.len += bytes.len();
        self.image.extend_from_slice(bytes);

        debug!(
            page = page_number,
            total = self.image.len(),
            "firmware data chunk"
        );
        UpdateOutcome::Progress
    }

    fn on_crc(&mut self, page_number: u16, bytes: &[u8]) -> UpdateOutcome {
        if !matches!(
            self.phase,
            SessionPhase::Receiving | SessionPhase::ReceivingCrc
        ) {
            warn!(phase = ?self.phase, "page CRC outside a receiving session");
            return UpdateOutcome::Ignored;
        }
        if bytes.len() < 4 {
            warn!(len = bytes.len(), "page CRC payload truncated");
            return UpdateOutcome::Ignored;
        }

        self.phase = SessionPhase::ReceivingCrc;
        let crc = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        self.pages.entry(page_number).or_default().expected_crc = Some(crc);
        debug!(page = page_number, crc = format_args!("{crc:#010x}"), "page CRC stored");
        UpdateOutcome::Progress
    }

    fn on_verify(&mut self, index: u16, with_reply: bool) -> UpdateOutcome {
        if self.phase != SessionPhase::ReceivingCrc {
            warn!(phase = ?self.phase, "verify outside a CRC session");
            return UpdateOutcome::Ignored;
        }

        let mut failed_page = None;
        for (&number, page) in &self.pages {
            let actual = buffer_crc32(&self.image[page.start..page.start + page.len]);
            if page.expected_crc != Some(actual) {
                failed_page = Some(number);
                break;
            }
        }
        let image_crc = buffer_crc32(&self.image);

        let new_version = if failed_page.is_none() {
            info!(
                version = self.new_version,
                bytes = self.image.len(),
                pages = self.pages.len(),
                "firmware image verified"
            );
            self.phase = SessionPhase::Completed;
            Some(self.new_version)
        } else {
            warn!(page = ?failed_page, "firmware page failed verification");
            self.phase = SessionPhase::Failed;
            None
        };

        let reply = with_reply.then(|| {
            let status = if failed_page.is_none() {
                STATUS_OK
            } else {
                STATUS_FAILED
            };
            // Echo header shape: length, status, our type, version, failed
            // page, index, whole-image CRC.
            let mut reply = Vec::with_capacity(16);
            reply.push(15);
            reply.push(status);
            reply.extend_from_slice(&self.device_type_echo());
            reply.extend_from_slice(&self.new_version.to_le_bytes());
            reply.extend_from_slice(&failed_page.unwrap_or(0).to_le_bytes());
            reply.extend_from_slice(&index.to_le_bytes());
            reply.extend_from_slice(&image_crc.to_le_bytes());
            reply
        });

        if new_version.is_some() {
            // Session consumed; the device adopts the version.
            let device_type = self.device_type;
            self.clear();
            self.device_type = device_type;
        }

        UpdateOutcome::Verified { reply, new_version }
    }

    fn device_type_echo(&self) -> [u8; 2] {
        self.device_type.to_le_bytes()
    }
}

impl Default for UpdateSession {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OWN_TYPE: u16 = 0x800C;
    const VERSION: u32 = 0x00AB_CDEF;

    fn payload(sub: u8, page: u16, index: u16, bytes: &[u8]) -> Vec<u8> {
        let mut payload = Vec::with_capacity(HEADER_LEN + bytes.len());
        payload.push(bytes.len() as u8);
        payload.push(sub);
        payload.extend_from_slice(&OWN_TYPE.to_le_bytes());
        payload.extend_from_slice(&VERSION.to_le_bytes());
        payload.extend_from_slice(&page.to_le_bytes());
        payload.extend_from_slice(&index.to_le_bytes());
        payload.extend_from_slice(bytes);
        payload
    }

    fn load_two_pages(session: &mut UpdateSession) -> (Vec<u8>, Vec<u8>) {
        let page0: Vec<u8> = (0u8..16).collect();
        let page1: Vec<u8> = (16u8..28).collect();
        for chunk in page0.chunks(8) {
            assert_eq!(
                session.handle(&payload(SUB_DATA, 0, 0, chunk), OWN_TYPE),
                UpdateOutcome::Progress
            );
        }
        assert_eq!(
            session.handle(&payload(SUB_DATA, 1, 0, &page1), OWN_TYPE),
            UpdateOutcome::Progress
        );
        (page0, page1)
    }

    #[test]
    fn full_update_verifies_and_reports_the_image_crc() {
        let mut session = UpdateSession::new();
        let (page0, page1) = load_two_pages(&mut session);

        let crc0 = buffer_crc32(&page0);
        let crc1 = buffer_crc32(&page1);
        session.handle(&payload(SUB_CRC, 0, 0, &crc0.to_le_bytes()), OWN_TYPE);
        session.handle(&payload(SUB_CRC, 1, 0, &crc1.to_le_bytes()), OWN_TYPE);
        assert_eq!(session.phase(), SessionPhase::ReceivingCrc);

        let outcome = session.handle(&payload(SUB_VERIFY, 0, 7, &[]), OWN_TYPE);
        let UpdateOutcome::Verified { reply, new_version } = outcome else {
            panic!("expected verification outcome");
        };
        assert_eq!(new_version, Some(VERSION));

        let reply = reply.expect("verify emits a reply");
        assert_eq!(reply.len(), 16);
        assert_eq!(reply[0], 15);
        assert_eq!(reply[1], STATUS_OK);
        assert_eq!(u16::from_le_bytes([reply[2], reply[3]]), OWN_TYPE);
        assert_eq!(
            u32::from_le_bytes([reply[4], reply[5], reply[6], reply[7]]),
            VERSION
        );
        // Failed page zero, index echoed.
        assert_eq!(u16::from_le_bytes([reply[8], reply[9]]), 0);
        assert_eq!(u16::from_le_bytes([reply[10], reply[11]]), 7);

        let mut image = page0.clone();
        image.extend_from_slice(&page1);
        assert_eq!(
            u32::from_le_bytes([reply[12], reply[13], reply[14], reply[15]]),
            buffer_crc32(&image)
        );
        assert_eq!(session.phase(), SessionPhase::Idle);
    }

    #[test]
    fn corrupt_page_fails_with_its_number() {
        let mut session = UpdateSession::new();
        let (page0, page1) = load_two_pages(&mut session);

        let crc0 = buffer_crc32(&page0);
        session.handle(&payload(SUB_CRC, 0, 0, &crc0.to_le_bytes()), OWN_TYPE);
        // Wrong CRC for page 1.
        let bad = buffer_crc32(&page1) ^ 1;
        session.handle(&payload(SUB_CRC, 1, 0, &bad.to_le_bytes()), OWN_TYPE);

        let outcome = session.handle(&payload(SUB_VERIFY, 0, 0, &[]), OWN_TYPE);
        let UpdateOutcome::Verified { reply, new_version } = outcome else {
            panic!("expected verification outcome");
        };
        assert_eq!(new_version, None);
        let reply = reply.unwrap();
        assert_eq!(reply[1], STATUS_FAILED);
        assert_eq!(u16::from_le_bytes([reply[8], reply[9]]), 1);
        assert_eq!(session.phase(), SessionPhase::Failed);
    }

    #[test]
    fn verify_and_restart_stays_silent() {
        let mut session = UpdateSession::new();
        let (page0, _) = load_two_pages(&mut session);
        let crc0 = buffer_crc32(&page0);
        session.handle(&payload(SUB_CRC, 0, 0, &crc0.to_le_bytes()), OWN_TYPE);
        session.handle(
            &payload(SUB_CRC, 1, 0, &buffer_crc32(&(16u8..28).collect::<Vec<_>>()).to_le_bytes()),
            OWN_TYPE,
        );

        let outcome = session.handle(&payload(SUB_VERIFY_AND_RESTART, 0, 0, &[]), OWN_TYPE);
        let UpdateOutcome::Verified { reply, new_version } = outcome else {
            panic!("expected verification outcome");
        };
        assert!(reply.is_none());
        assert_eq!(new_version, Some(VERSION));
    }

    #[test]
    fn foreign_device_type_is_ignored() {
        let mut session = UpdateSession::new();
        let mut data = payload(SUB_DATA, 0, 0, &[1, 2, 3]);
        data[2..4].copy_from_slice(&0x8016u16.to_le_bytes());
        assert_eq!(session.handle(&data, OWN_TYPE), UpdateOutcome::Ignored);
        assert_eq!(session.phase(), SessionPhase::Idle);
    }

    #[test]
    fn verify_without_crcs_is_ignored() {
        let mut session = UpdateSession::new();
        load_two_pages(&mut session);
        assert_eq!(
            session.handle(&payload(SUB_VERIFY, 0, 0, &[]), OWN_TYPE),
            UpdateOutcome::Ignored
        );
    }

    #[test]
    fn data_after_failure_starts_a_fresh_session() {
        let mut session = UpdateSession::new();
        let (page0, _) = load_two_pages(&mut session);
        session.handle(
            &payload(SUB_CRC, 0, 0, &(buffer_crc32(&page0) ^ 1).to_le_bytes()),
            OWN_TYPE,
        );
        session.handle(
            &payload(SUB_CRC, 1, 0, &0u32.to_le_bytes()),
            OWN_TYPE,
        );
        session.handle(&payload(SUB_VERIFY, 0, 0, &[]), OWN_TYPE);
        assert_eq!(session.phase(), SessionPhase::Failed);

        session.handle(&payload(SUB_DATA, 0, 0, &[1, 2, 3, 4]), OWN_TYPE);
        assert_eq!(session.phase(), SessionPhase::Receiving);
    }
}
