//! Session negotiation after transport connect
//!
//! Once the transport link is up, the manager drives a fixed handshake:
//!
//! 1. `WantIdentity` → identity (node number, protocol version, firmware)
//! 2. Firmware version check against [`MIN_FIRMWARE_VERSION`]
//! 3. `WantConfig` → configuration records ending in `ConfigComplete`
//! 4. `Subscribe` → `SubscribeAck`
//!
//! The negotiator is a synchronous state machine: the manager feeds it
//! decoded frames from the serialized event queue and performs whatever send
//! it asks for. Step timeouts are armed by the manager. Any failure aborts
//! the whole handshake; there is no partial resume.

use tracing::{debug, info, warn};

use meshlink_core::FirmwareVersion;

use crate::config::MIN_FIRMWARE_VERSION;
use crate::error::{Result, SessionError};
use crate::protocol::RadioFrame;

/// Handshake step currently awaiting a response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStep {
    /// Waiting for the identity response
    Identity,
    /// Waiting for configuration state
    Config,
    /// Waiting for the subscription ack
    Subscribe,
}

impl HandshakeStep {
    /// Step name used in error reporting
    pub fn as_str(&self) -> &'static str {
        match self {
            HandshakeStep::Identity => "identity",
            HandshakeStep::Config => "config",
            HandshakeStep::Subscribe => "subscribe",
        }
    }
}

/// Everything the handshake learned about the radio
#[derive(Debug, Clone, PartialEq)]
pub struct NegotiatedSession {
    /// Mesh node number of the connected radio
    pub node_num: u32,
    /// Protocol version the radio speaks
    pub protocol_version: u32,
    /// Parsed firmware version
    pub firmware: FirmwareVersion,
    /// LoRa region code (0 = unset)
    pub region: u16,
    /// Channel count reported by the radio
    pub max_channels: u8,
}

/// Outcome of feeding one frame to the negotiator
#[derive(Debug, Clone, PartialEq)]
pub enum Progress {
    /// Send this frame and keep waiting
    Send(RadioFrame),
    /// Handshake complete
    Complete(NegotiatedSession),
    /// Frame was not part of the handshake; keep waiting
    Ignored,
}

/// Fixed-sequence handshake state machine
#[derive(Debug)]
pub struct Negotiator {
    step: HandshakeStep,
    minimum: FirmwareVersion,
    node_num: Option<u32>,
    protocol_version: Option<u32>,
    firmware: Option<FirmwareVersion>,
    pending: Option<NegotiatedSession>,
}

impl Negotiator {
    /// Start a handshake. Returns the negotiator and the first frame to send.
    pub fn start() -> (Self, RadioFrame) {
        Self::with_minimum(MIN_FIRMWARE_VERSION)
    }

    /// Start with a specific firmware minimum (tests)
    pub fn with_minimum(minimum: FirmwareVersion) -> (Self, RadioFrame) {
        debug!("Starting session handshake");
        (
            Self {
                step: HandshakeStep::Identity,
                minimum,
                node_num: None,
                protocol_version: None,
                firmware: None,
                pending: None,
            },
            RadioFrame::WantIdentity,
        )
    }

    /// The step currently awaiting a response
    pub fn step(&self) -> HandshakeStep {
        self.step
    }

    /// Feed a decoded inbound frame to the handshake
    pub fn on_frame(&mut self, frame: &RadioFrame) -> Result<Progress> {
        match (self.step, frame) {
            (
                HandshakeStep::Identity,
                RadioFrame::Identity {
                    node_num,
                    protocol_version,
                    firmware,
                },
            ) => {
                let version: FirmwareVersion =
                    firmware
                        .parse()
                        .map_err(|_| SessionError::HandshakeFailure {
                            step: HandshakeStep::Identity.as_str(),
                            reason: format!("unparseable firmware version {firmware:?}"),
                        })?;

                if !version.meets_minimum(&self.minimum) {
                    warn!(%version, minimum = %self.minimum, "Firmware below supported minimum");
                    return Err(SessionError::IncompatibleFirmware {
                        version,
                        minimum: self.minimum,
                    });
                }

                debug!(node = node_num, %version, "Identity received, pulling configuration");
                self.node_num = Some(*node_num);
                self.protocol_version = Some(*protocol_version);
                self.firmware = Some(version);
                self.step = HandshakeStep::Config;
                Ok(Progress::Send(RadioFrame::WantConfig))
            }

            (
                HandshakeStep::Config,
                RadioFrame::ConfigComplete {
                    region,
                    max_channels,
                },
            ) => {
                debug!(region, max_channels, "Configuration received, subscribing");
                self.step = HandshakeStep::Subscribe;
                let session = NegotiatedSession {
                    node_num: self.node_num.unwrap_or(0),
                    protocol_version: self.protocol_version.unwrap_or(0),
                    firmware: self.firmware.unwrap_or(self.minimum),
                    region: *region,
                    max_channels: *max_channels,
                };
                // Stash the config on the way to the subscribe step.
                self.pending = Some(session);
                Ok(Progress::Send(RadioFrame::Subscribe))
            }

            (HandshakeStep::Subscribe, RadioFrame::SubscribeAck) => {
                let session = self.pending.take().ok_or(SessionError::HandshakeFailure {
                    step: HandshakeStep::Subscribe.as_str(),
                    reason: "subscribe ack without negotiated state".into(),
                })?;
                info!(
                    node = session.node_num,
                    firmware = %session.firmware,
                    "Handshake complete"
                );
                Ok(Progress::Complete(session))
            }

            // Radios may start streaming early; updates are not ours to
            // judge here and get replayed once subscribed.
            (_, RadioFrame::NodeUpdate(_)) => Ok(Progress::Ignored),

            (step, other) => Err(SessionError::HandshakeFailure {
                step: step.as_str(),
                reason: format!("unexpected frame {other:?}"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{NodeUpdate, NodeUpdateBody};

    fn identity(firmware: &str) -> RadioFrame {
        RadioFrame::Identity {
            node_num: 1234,
            protocol_version: 1,
            firmware: firmware.into(),
        }
    }

    #[test]
    fn test_happy_path() {
        let (mut neg, first) = Negotiator::start();
        assert_eq!(first, RadioFrame::WantIdentity);

        let progress = neg.on_frame(&identity("2.3.2")).unwrap();
        assert_eq!(progress, Progress::Send(RadioFrame::WantConfig));

        let progress = neg
            .on_frame(&RadioFrame::ConfigComplete {
                region: 3,
                max_channels: 8,
            })
            .unwrap();
        assert_eq!(progress, Progress::Send(RadioFrame::Subscribe));

        let progress = neg.on_frame(&RadioFrame::SubscribeAck).unwrap();
        match progress {
            Progress::Complete(session) => {
                assert_eq!(session.node_num, 1234);
                assert_eq!(session.firmware, "2.3.2".parse().unwrap());
                assert_eq!(session.region, 3);
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[test]
    fn test_old_firmware_fails_version_check() {
        let (mut neg, _) = Negotiator::start();
        let err = neg.on_frame(&identity("2.1.0")).unwrap_err();
        assert!(matches!(err, SessionError::IncompatibleFirmware { .. }));
        assert!(err.is_terminal());
    }

    #[test]
    fn test_minimum_is_inclusive() {
        let (mut neg, _) = Negotiator::start();
        assert!(neg.on_frame(&identity("2.3.0")).is_ok());
    }

    #[test]
    fn test_garbage_firmware_string() {
        let (mut neg, _) = Negotiator::start();
        let err = neg.on_frame(&identity("latest")).unwrap_err();
        assert!(matches!(err, SessionError::HandshakeFailure { .. }));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_unexpected_frame_aborts() {
        let (mut neg, _) = Negotiator::start();
        let err = neg.on_frame(&RadioFrame::SubscribeAck).unwrap_err();
        match err {
            SessionError::HandshakeFailure { step, .. } => assert_eq!(step, "identity"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_node_updates_ignored_mid_handshake() {
        let (mut neg, _) = Negotiator::start();
        let update = RadioFrame::NodeUpdate(NodeUpdate {
            num: 1,
            seq: 1,
            body: NodeUpdateBody::Config { region: 0 },
        });
        assert_eq!(neg.on_frame(&update).unwrap(), Progress::Ignored);
        assert_eq!(neg.step(), HandshakeStep::Identity);
    }
}
