//! Command dispatch: one table for simple frames, one for reassembled
//! fragmented payloads
//!
//! Handlers are idempotent against retransmissions; the only stateful ones
//! are configuration, the challenge, NAT assignment and firmware updates.
//! Errors never escape dispatch - malformed peer data is logged and the
//! processing loop keeps going.

use loxlink_core::command::{Command, ResetReason};
use loxlink_core::config::ConfigRecord;
use loxlink_core::crypto::{
    cbc_decrypt, cbc_encrypt, legacy_schedule, modern_schedule, SessionKeys, CRYPT_MAGIC,
};
use loxlink_core::frame::{FragmentedNatFrame, NatFrame};
use loxlink_core::Result;
use tracing::{debug, info, warn};

use crate::device::{DeviceCore, SendCtx};
use crate::devices::DeviceSink;
use crate::firmware::UpdateOutcome;
use crate::state::LifecycleState;

impl DeviceCore {
    /// Dispatch a non-fragmented frame.
    ///
    /// An unassigned device answers nothing except assignment traffic; it
    /// stays silent on the bus until a `NatOfferConfirm` names it.
    pub(crate) async fn dispatch_simple(
        &mut self,
        frame: &NatFrame,
        sink: &mut dyn DeviceSink,
        ctx: &SendCtx<'_>,
    ) -> Result<()> {
        if self.assignment.is_none()
            && !matches!(
                frame.command,
                Command::NatOfferConfirm
                    | Command::IdentifyUnknown
                    | Command::ExtensionsOffline
                    | Command::Identify
                    | Command::TimeSync
            )
        {
            debug!(command = %frame.command, "ignored while unassigned");
            self.stats.dropped += 1;
            return Ok(());
        }

        match frame.command {
            Command::VersionRequest => {
                if frame.val32() == self.identity.serial {
                    let block = self.version_block(ResetReason::Pairing);
                    self.send_fragmented(ctx, Command::VersionInfo, &block).await?;
                }
            }
            Command::Ping => {
                self.send_simple(ctx, Command::Pong, [0; 7]).await?;
            }
            Command::Alive => {
                self.send_alive(ctx).await?;
            }
            Command::ExtensionsOffline => {
                self.state.on_extensions_offline();
            }
            Command::TimeSync => {}
            Command::Identify => {
                let serial = frame.val32();
                if serial == self.identity.serial {
                    self.identifying = true;
                    sink.on_identify(true);
                } else if serial == 0 {
                    self.identifying = false;
                    sink.on_identify(false);
                }
            }
            Command::IdentifyUnknown => {
                if self.state.on_identify_unknown() {
                    debug!("identify-unknown resumed offer emission");
                }
            }
            Command::SearchDevicesRequest => {
                let type_bytes = self.identity.device_type.to_le_bytes();
                let serial = self.identity.serial.to_le_bytes();
                let data = [
                    self.branch_tag,
                    type_bytes[0],
                    type_bytes[1],
                    serial[0],
                    serial[1],
                    serial[2],
                    serial[3],
                ];
                self.send_simple(ctx, Command::SearchDevicesResponse, data).await?;
            }
            Command::CanDiagnosticsRequest => {
                let mut data = [0u8; 7];
                data[0] = frame.b0();
                self.send_simple(ctx, Command::CanDiagnosticsReply, data).await?;
            }
            Command::CanErrorRequest => {
                let branch = frame.b0();
                let status: u16 = if branch != 0 { 0x8000 } else { 0 };
                let mut data = [0u8; 7];
                data[0] = branch;
                data[1..3].copy_from_slice(&status.to_le_bytes());
                data[3..7].copy_from_slice(&u32::from(branch).to_le_bytes());
                self.send_simple(ctx, Command::CanErrorReply, data).await?;
            }
            Command::NatOfferConfirm => {
                self.on_offer_confirm(frame, sink, ctx).await?;
            }
            Command::WebServiceRequest => {
                // Short requests share the fragmented payload shape.
                self.on_webservice(&frame.data, sink, ctx).await?;
            }
            other => {
                if self.state.state() == LifecycleState::Online && sink.on_control(frame) {
                    return Ok(());
                }
                warn!(command = %other, "unhandled command");
            }
        }

        Ok(())
    }

    /// Dispatch a reassembled fragmented payload.
    ///
    /// No fragmented command is assignment traffic, so an unassigned
    /// device drops them all and stays silent, same as the simple path.
    pub(crate) async fn dispatch_fragmented(
        &mut self,
        payload: &FragmentedNatFrame,
        sink: &mut dyn DeviceSink,
        ctx: &SendCtx<'_>,
    ) -> Result<()> {
        if self.assignment.is_none() {
            debug!(command = %payload.command, "fragmented payload ignored while unassigned");
            self.stats.dropped += 1;
            return Ok(());
        }

        match payload.command {
            Command::SendConfig => self.on_send_config(&payload.data, sink, ctx).await?,
            Command::CryptChallengeAuthRequest => {
                self.on_challenge(&payload.data, sink, ctx).await?
            }
            Command::CryptDeviceIdRequest => self.on_device_id_request(&payload.data, ctx).await?,
            Command::FirmwareUpdate => self.on_firmware(&payload.data, sink, ctx).await?,
            Command::WebServiceRequest => self.on_webservice(&payload.data, sink, ctx).await?,
            other => {
                if self.state.state() == LifecycleState::Online
                    && sink.on_fragmented_control(payload)
                {
                    return Ok(());
                }
                warn!(command = %other, "unhandled fragmented command");
            }
        }
        Ok(())
    }

    /// `NatOfferConfirm`: adopt the assignment when the serial is ours.
    async fn on_offer_confirm(
        &mut self,
        frame: &NatFrame,
        sink: &mut dyn DeviceSink,
        ctx: &SendCtx<'_>,
    ) -> Result<()> {
        if frame.val32() != self.identity.serial {
            return Ok(());
        }

        let assigned = frame.b0();
        let parked = frame.data[1] != 0;
        self.assignment = Some(assigned);
        info!(
            nat = format_args!("{assigned:#04x}"),
            parked, "NAT assignment confirmed"
        );

        let new_state = self.state.on_confirm(parked);
        sink.on_state(new_state);
        if new_state == LifecycleState::Online {
            self.send_start_info(ctx).await?;
        }
        Ok(())
    }

    /// Fragmented `SendConfig`: parse, adopt timeouts, acknowledge.
    async fn on_send_config(
        &mut self,
        data: &[u8],
        sink: &mut dyn DeviceSink,
        ctx: &SendCtx<'_>,
    ) -> Result<()> {
        let record = match ConfigRecord::parse(data) {
            Ok(record) => record,
            Err(error) => {
                // No ack; the Miniserver will retry.
                warn!(%error, "configuration rejected");
                return Ok(());
            }
        };

        info!(
            version = record.version,
            timeout_secs = record.offline_timeout_secs,
            crc = format_args!("{:#010x}", record.digest()),
            "configuration applied"
        );
        self.state
            .set_timeouts(record.offline_timeout(), record.keepalive_interval());
        sink.on_config(&record);
        self.config = record;
        self.send_simple(ctx, Command::ConfigEqual, [0; 7]).await
    }

    /// Fragmented `CryptChallengeAuthRequest`: decrypt, derive the session,
    /// answer encrypted with the session schedule.
    async fn on_challenge(
        &mut self,
        data: &[u8],
        sink: &mut dyn DeviceSink,
        ctx: &SendCtx<'_>,
    ) -> Result<()> {
        let schedule = modern_schedule(
            self.identity.serial,
            &self.crypto.challenge_key_words(),
            &self.crypto.challenge_iv_words(),
        );

        let plain = match cbc_decrypt(&schedule, data) {
            Ok(plain) => plain,
            Err(error) => {
                warn!(%error, "challenge decrypt failed");
                self.state.deauthorize();
                return Ok(());
            }
        };
        if plain.len() < 8 {
            warn!(len = plain.len(), "challenge payload too short");
            self.state.deauthorize();
            return Ok(());
        }

        let magic = u32::from_le_bytes([plain[0], plain[1], plain[2], plain[3]]);
        if magic != CRYPT_MAGIC {
            // Stay Parked until the Miniserver retries with a good packet.
            warn!(got = format_args!("{magic:#010x}"), "challenge magic mismatch");
            self.state.deauthorize();
            return Ok(());
        }
        let random = u32::from_le_bytes([plain[4], plain[5], plain[6], plain[7]]);

        let session = SessionKeys::derive(&self.identity.stm32_id, random, self.identity.serial);
        let session_schedule = session.schedule();

        let mut reply = [0xA5u8; 16];
        reply[0..4].copy_from_slice(&CRYPT_MAGIC.to_le_bytes());
        reply[4..8].copy_from_slice(&rand::random::<u32>().to_le_bytes());
        let cipher = cbc_encrypt(&session_schedule, &reply)?;
        self.send_fragmented(ctx, Command::CryptChallengeAuthReply, &cipher)
            .await?;

        info!("challenge solved, device authorized");
        if self.state.authorize() {
            sink.on_state(LifecycleState::Online);
            self.send_start_info(ctx).await?;
        }
        Ok(())
    }

    /// Fragmented `CryptDeviceIdRequest`: legacy-encrypted device-ID
    /// exchange. A bad packet still gets a reply - zero header with the
    /// random echoed - so the Miniserver can tell garbage from silence.
    async fn on_device_id_request(&mut self, data: &[u8], ctx: &SendCtx<'_>) -> Result<()> {
        let schedule = legacy_schedule(
            self.identity.serial,
            &self.crypto.legacy_key,
            &self.crypto.legacy_iv,
        );

        let mut random_echo = [0u8; 4];
        let valid = match cbc_decrypt(&schedule, data) {
            Ok(plain) if plain.len() >= 8 => {
                random_echo.copy_from_slice(&plain[4..8]);
                u32::from_le_bytes([plain[0], plain[1], plain[2], plain[3]]) == CRYPT_MAGIC
            }
            Ok(_) => false,
            Err(error) => {
                warn!(%error, "device-id decrypt failed");
                false
            }
        };

        let mut reply = [0u8; 32];
        reply[4..8].copy_from_slice(&random_echo);
        if valid {
            reply[0..4].copy_from_slice(&CRYPT_MAGIC.to_le_bytes());
            reply[8..20].copy_from_slice(&self.identity.stm32_id);
        } else {
            warn!("answering device-id request with the invalid marker");
        }

        let cipher = cbc_encrypt(&schedule, &reply)?;
        self.send_fragmented(ctx, Command::CryptDeviceIdRequest, &cipher)
            .await
    }

    /// Fragmented `FirmwareUpdate`: feed the session, heartbeat after each
    /// sub-command, apply a verified version.
    async fn on_firmware(
        &mut self,
        data: &[u8],
        sink: &mut dyn DeviceSink,
        ctx: &SendCtx<'_>,
    ) -> Result<()> {
        match self.firmware.handle(data, self.identity.device_type) {
            UpdateOutcome::Ignored => Ok(()),
            UpdateOutcome::Progress => self.send_alive(ctx).await,
            UpdateOutcome::Verified { reply, new_version } => {
                if let Some(reply) = reply {
                    self.send_fragmented(ctx, Command::FirmwareUpdate, &reply)
                        .await?;
                }
                self.send_alive(ctx).await?;

                if let Some(version) = new_version {
                    info!(version, "adopting verified firmware version");
                    self.identity.firmware_version = version;
                    sink.on_firmware_applied(version);
                    self.reset_reason = ResetReason::SoftwareReset;
                    self.state.reset("firmware update applied");
                    sink.on_state(LifecycleState::Offline);
                }
                Ok(())
            }
        }
    }

    /// ASCII web service: `[deviceId, len, text...]` in, `[0x00, len+1,
    /// text..., 0x00]` out, always fragmented.
    async fn on_webservice(
        &mut self,
        data: &[u8],
        sink: &mut dyn DeviceSink,
        ctx: &SendCtx<'_>,
    ) -> Result<()> {
        let request = parse_webservice_text(data);
        let verb = request
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();

        debug!(%verb, "web service request");
        let (reply, action) = match verb.as_str() {
            "version" => (
                format!("Version {}", self.identity.firmware_version),
                WebServiceAction::None,
            ),
            "statistics" => (
                format!(
                    "Sent:{};Rcv:{};Drop:{};CrcErr:{};",
                    self.stats.sent, self.stats.received, self.stats.dropped, self.stats.crc_failures
                ),
                WebServiceAction::None,
            ),
            "techreport" => (
                format!(
                    "Serial:{:08X};Type:{:04X};HwVer:{};FwVer:{};State:{};",
                    self.identity.serial,
                    self.identity.device_type,
                    self.identity.hardware_version,
                    self.identity.firmware_version,
                    self.state.state()
                ),
                WebServiceAction::None,
            ),
            "reboot" => ("Rebooting device".to_string(), WebServiceAction::Reboot),
            "forceupdate" => (
                "Forced update armed".to_string(),
                WebServiceAction::ClearFirmwareSession,
            ),
            _ => (format!("Unknown command: {request}"), WebServiceAction::None),
        };

        let mut payload = Vec::with_capacity(reply.len() + 3);
        payload.push(0x00);
        payload.push((reply.len() + 1) as u8);
        payload.extend_from_slice(reply.as_bytes());
        payload.push(0x00);
        self.send_fragmented(ctx, Command::WebServiceRequest, &payload)
            .await?;

        match action {
            WebServiceAction::None => {}
            WebServiceAction::Reboot => {
                self.reset_reason = ResetReason::SoftwareReset;
                self.state.reset("web service reboot");
                sink.on_state(LifecycleState::Offline);
            }
            WebServiceAction::ClearFirmwareSession => self.firmware.clear(),
        }
        Ok(())
    }
}

enum WebServiceAction {
    None,
    Reboot,
    ClearFirmwareSession,
}

/// Extract the ASCII text from a `[deviceId, len, bytes...]` payload.
fn parse_webservice_text(data: &[u8]) -> String {
    if data.len() < 2 {
        return String::new();
    }
    let len = usize::from(data[1]).min(data.len() - 2);
    let text: Vec<u8> = data[2..2 + len]
        .iter()
        .copied()
        .take_while(|&byte| byte != 0)
        .collect();
    String::from_utf8_lossy(&text).trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn webservice_text_parses_and_trims() {
        let mut data = vec![0x00, 7];
        data.extend_from_slice(b"version");
        assert_eq!(parse_webservice_text(&data), "version");
    }

    #[test]
    fn webservice_text_stops_at_nul() {
        let data = [0x00, 6, b'r', b'e', 0, 0, 0, 0];
        assert_eq!(parse_webservice_text(&data), "re");
    }

    #[test]
    fn webservice_text_clamps_an_oversized_length() {
        let data = [0x00, 200, b'o', b'k'];
        assert_eq!(parse_webservice_text(&data), "ok");
    }

    #[test]
    fn webservice_text_handles_short_payloads() {
        assert_eq!(parse_webservice_text(&[]), "");
        assert_eq!(parse_webservice_text(&[0x00]), "");
    }
}
