//! Two-party pairing handshake
//!
//! The initiator shows a six-digit code and sends it in a `pairingRequest`;
//! the responder shows the same code and the user confirms with
//! `acceptPairing`, which answers `pairingAccepted`. Either side gives up after
//! the pairing timeout. Only one session exists at a time.

use std::fmt;

use rand_core::{OsRng, RngCore};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::error::{LinkError, LinkResult};
use crate::framing::{CommandFrame, IncomingCommand};
use crate::peer::PeerAddress;

pub const PAIRING_REQUEST: &str = "pairingRequest";
pub const PAIRING_ACCEPTED: &str = "pairingAccepted";
pub const PAIRING_TIMED_OUT: &str = "Pairing timed out";

const CODE_SPACE: u32 = 1_000_000;
/// Draws at or above this bound are rejected so every code is equally likely
const CODE_DRAW_LIMIT: u32 = u32::MAX - u32::MAX % CODE_SPACE;

// ----------------------------------------------------------------------------
// Pairing Code
// ----------------------------------------------------------------------------

/// Six ASCII digits, zero padded
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct PairingCode(String);

impl PairingCode {
    /// Random code from the OS generator
    pub fn generate() -> Self {
        Self::from_rng(&mut OsRng)
    }

    /// Uniform code in `000000..=999999`
    pub fn from_rng<R: RngCore>(rng: &mut R) -> Self {
        loop {
            let n = rng.next_u32();
            if n < CODE_DRAW_LIMIT {
                return Self::from_number(n);
            }
        }
    }

    pub fn from_number(n: u32) -> Self {
        Self(format!("{:06}", n % CODE_SPACE))
    }

    /// Validate a code received from a peer
    pub fn parse(s: &str) -> Option<Self> {
        if s.len() == 6 && s.bytes().all(|b| b.is_ascii_digit()) {
            Some(Self(s.to_string()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PairingCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ----------------------------------------------------------------------------
// Pairing State
// ----------------------------------------------------------------------------

/// Observable pairing state
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum PairingState {
    #[default]
    Idle,
    /// We sent the code and wait for the peer to confirm
    WaitingForConfirmation { code: PairingCode },
    /// The peer sent a code and the local user must confirm
    ConfirmationRequired { code: PairingCode },
    Success,
    Failed { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingRole {
    Initiator,
    Responder,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingSession {
    pub id: u64,
    pub role: PairingRole,
    pub peer: PeerAddress,
    pub peer_name: Option<String>,
    pub code: PairingCode,
}

// ----------------------------------------------------------------------------
// State Machine
// ----------------------------------------------------------------------------

/// Pairing state plus the single active session.
///
/// Transitions return the session they concluded so the caller can persist
/// the peer or tear down links; timers and I/O stay with the caller.
#[derive(Debug, Default)]
pub struct PairingMachine {
    state: PairingState,
    session: Option<PairingSession>,
    next_id: u64,
}

impl PairingMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &PairingState {
        &self.state
    }

    pub fn session(&self) -> Option<&PairingSession> {
        self.session.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    fn open(
        &mut self,
        role: PairingRole,
        peer: PeerAddress,
        peer_name: Option<String>,
        code: PairingCode,
    ) -> &PairingSession {
        self.next_id += 1;
        self.state = match role {
            PairingRole::Initiator => PairingState::WaitingForConfirmation { code: code.clone() },
            PairingRole::Responder => PairingState::ConfirmationRequired { code: code.clone() },
        };
        self.session.insert(PairingSession {
            id: self.next_id,
            role,
            peer,
            peer_name,
            code,
        })
    }

    /// Start pairing with `peer`; refused while another session is active
    pub fn initiate(
        &mut self,
        peer: PeerAddress,
        peer_name: Option<String>,
        code: PairingCode,
    ) -> LinkResult<&PairingSession> {
        if self.is_active() {
            return Err(LinkError::PairingInProgress);
        }
        info!("Pairing with {} using code {}", peer, code);
        Ok(self.open(PairingRole::Initiator, peer, peer_name, code))
    }

    /// A `pairingRequest` arrived from `from`; ignored while a session is active
    pub fn receive_request(
        &mut self,
        from: PeerAddress,
        peer_name: Option<String>,
        code: PairingCode,
    ) -> Option<&PairingSession> {
        if self.is_active() {
            warn!("Ignoring pairing request from {}, session already active", from);
            return None;
        }
        info!("Pairing requested by {} with code {}", from, code);
        Some(self.open(PairingRole::Responder, from, peer_name, code))
    }

    /// Local user confirmed the displayed code
    pub fn accept(&mut self) -> LinkResult<PairingSession> {
        if !matches!(self.state, PairingState::ConfirmationRequired { .. }) {
            return Err(LinkError::NoPendingPairing);
        }
        self.complete().ok_or(LinkError::NoPendingPairing)
    }

    /// A `pairingAccepted` arrived from `from`
    pub fn receive_accepted(&mut self, from: &PeerAddress) -> Option<PairingSession> {
        let expected = matches!(self.state, PairingState::WaitingForConfirmation { .. })
            && self.session.as_ref().is_some_and(|s| &s.peer == from);
        if !expected {
            debug!("Ignoring pairingAccepted from {}", from);
            return None;
        }
        self.complete()
    }

    fn complete(&mut self) -> Option<PairingSession> {
        let session = self.session.take()?;
        info!("Pairing with {} succeeded", session.peer);
        self.state = PairingState::Success;
        Some(session)
    }

    /// Reject or cancel; back to `Idle`
    pub fn cancel(&mut self) -> Option<PairingSession> {
        self.state = PairingState::Idle;
        self.session.take()
    }

    /// The timeout for session `id` elapsed
    pub fn timeout(&mut self, id: u64) -> Option<PairingSession> {
        match &self.session {
            Some(session) if session.id == id => {
                warn!("Pairing with {} timed out", session.peer);
                self.state = PairingState::Failed {
                    reason: PAIRING_TIMED_OUT.to_string(),
                };
                self.session.take()
            }
            _ => None,
        }
    }

    /// Leave `Success` after the display delay
    pub fn settle(&mut self) -> bool {
        if self.state == PairingState::Success {
            self.state = PairingState::Idle;
            true
        } else {
            false
        }
    }
}

// ----------------------------------------------------------------------------
// Pairing Commands
// ----------------------------------------------------------------------------

pub fn request_command(code: &PairingCode, name: &str) -> CommandFrame {
    CommandFrame::new(PAIRING_REQUEST, json!({ "code": code.as_str(), "name": name }))
}

pub fn accepted_command() -> CommandFrame {
    CommandFrame::new(PAIRING_ACCEPTED, json!({}))
}

/// Pairing messages recognized among incoming commands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingMessage {
    Request {
        code: PairingCode,
        name: Option<String>,
    },
    Accepted,
}

impl PairingMessage {
    /// `None` for commands that are not part of pairing or carry a bad code
    pub fn from_command(command: &IncomingCommand) -> Option<Self> {
        match command.command.as_str() {
            PAIRING_REQUEST => {
                let Some(code) = command.param_str("code").and_then(PairingCode::parse) else {
                    warn!("pairingRequest without a valid code");
                    return None;
                };
                Some(PairingMessage::Request {
                    code,
                    name: command.param_str("name").map(str::to_string),
                })
            }
            PAIRING_ACCEPTED => Some(PairingMessage::Accepted),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn peer(s: &str) -> PeerAddress {
        PeerAddress::new(s)
    }

    #[test]
    fn test_code_is_zero_padded() {
        assert_eq!(PairingCode::from_number(42).as_str(), "000042");
        assert_eq!(PairingCode::from_number(999_999).as_str(), "999999");
        assert_eq!(PairingCode::from_number(1_000_000).as_str(), "000000");
    }

    #[test]
    fn test_code_parse() {
        assert!(PairingCode::parse("012345").is_some());
        assert!(PairingCode::parse("12345").is_none());
        assert!(PairingCode::parse("12345a").is_none());
        assert!(PairingCode::parse("١٢٣٤٥٦").is_none());
    }

    proptest! {
        #[test]
        fn prop_codes_are_six_digits(n in any::<u32>()) {
            let code = PairingCode::from_number(n);
            prop_assert_eq!(code.as_str().len(), 6);
            prop_assert!(code.as_str().bytes().all(|b| b.is_ascii_digit()));
            prop_assert_eq!(code.as_str().parse::<u32>().unwrap(), n % 1_000_000);
        }
    }

    /// Replays fixed draws
    struct Draws(Vec<u32>);

    impl RngCore for Draws {
        fn next_u32(&mut self) -> u32 {
            self.0.remove(0)
        }

        fn next_u64(&mut self) -> u64 {
            u64::from(self.next_u32())
        }

        fn fill_bytes(&mut self, dest: &mut [u8]) {
            rand_core::impls::fill_bytes_via_next(self, dest)
        }

        fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
            self.fill_bytes(dest);
            Ok(())
        }
    }

    #[test]
    fn test_biased_draws_are_rejected() {
        let mut rng = Draws(vec![u32::MAX, CODE_DRAW_LIMIT, CODE_DRAW_LIMIT - 1]);
        let code = PairingCode::from_rng(&mut rng);
        assert_eq!(code, PairingCode::from_number(CODE_DRAW_LIMIT - 1));
        assert_eq!(code.as_str(), "999999");
        assert!(rng.0.is_empty());

        let mut rng = Draws(vec![42]);
        assert_eq!(PairingCode::from_rng(&mut rng).as_str(), "000042");
    }

    #[test]
    fn test_generated_code_parses() {
        let code = PairingCode::generate();
        assert_eq!(PairingCode::parse(code.as_str()), Some(code));
    }

    #[test]
    fn test_initiator_flow() {
        let mut machine = PairingMachine::new();
        let code = PairingCode::from_number(123_456);
        machine.initiate(peer("B"), Some("Phone".into()), code.clone()).unwrap();
        assert_eq!(
            machine.state(),
            &PairingState::WaitingForConfirmation { code: code.clone() }
        );

        // Only the session peer can complete it
        assert!(machine.receive_accepted(&peer("C")).is_none());
        let session = machine.receive_accepted(&peer("B")).unwrap();
        assert_eq!(session.role, PairingRole::Initiator);
        assert_eq!(machine.state(), &PairingState::Success);
        assert!(!machine.is_active());

        assert!(machine.settle());
        assert_eq!(machine.state(), &PairingState::Idle);
    }

    #[test]
    fn test_second_initiate_refused() {
        let mut machine = PairingMachine::new();
        machine
            .initiate(peer("B"), None, PairingCode::from_number(1))
            .unwrap();
        assert!(matches!(
            machine.initiate(peer("C"), None, PairingCode::from_number(2)),
            Err(LinkError::PairingInProgress)
        ));
        assert!(machine
            .receive_request(peer("C"), None, PairingCode::from_number(3))
            .is_none());
        assert_eq!(machine.session().unwrap().peer, peer("B"));
    }

    #[test]
    fn test_responder_flow() {
        let mut machine = PairingMachine::new();
        assert!(matches!(machine.accept(), Err(LinkError::NoPendingPairing)));

        let code = PairingCode::from_number(7);
        machine
            .receive_request(peer("A"), Some("Desk".into()), code.clone())
            .unwrap();
        assert_eq!(machine.state(), &PairingState::ConfirmationRequired { code });

        // A responder never completes on pairingAccepted
        assert!(machine.receive_accepted(&peer("A")).is_none());

        let session = machine.accept().unwrap();
        assert_eq!(session.peer_name.as_deref(), Some("Desk"));
        assert_eq!(machine.state(), &PairingState::Success);
    }

    #[test]
    fn test_timeout_only_for_current_session() {
        let mut machine = PairingMachine::new();
        let id = machine
            .initiate(peer("B"), None, PairingCode::from_number(1))
            .unwrap()
            .id;
        assert!(machine.timeout(id + 1).is_none());
        assert!(machine.timeout(id).is_some());
        assert_eq!(
            machine.state(),
            &PairingState::Failed {
                reason: PAIRING_TIMED_OUT.into()
            }
        );

        // A new session may start from Failed
        assert!(machine
            .initiate(peer("B"), None, PairingCode::from_number(2))
            .is_ok());
    }

    #[test]
    fn test_cancel_returns_to_idle() {
        let mut machine = PairingMachine::new();
        machine
            .receive_request(peer("A"), None, PairingCode::from_number(5))
            .unwrap();
        assert!(machine.cancel().is_some());
        assert_eq!(machine.state(), &PairingState::Idle);
        assert!(machine.cancel().is_none());
    }

    #[test]
    fn test_pairing_messages() {
        let request = request_command(&PairingCode::from_number(42), "Desk");
        let parsed = IncomingCommand::parse(&request.encode().unwrap()).unwrap();
        assert_eq!(
            PairingMessage::from_command(&parsed),
            Some(PairingMessage::Request {
                code: PairingCode::from_number(42),
                name: Some("Desk".into())
            })
        );

        let legacy = IncomingCommand::parse(br#"{"type":"pairingAccepted","data":{}}"#).unwrap();
        assert_eq!(PairingMessage::from_command(&legacy), Some(PairingMessage::Accepted));

        let bad = IncomingCommand::parse(br#"{"command":"pairingRequest","params":{"code":"12"}}"#)
            .unwrap();
        assert_eq!(PairingMessage::from_command(&bad), None);

        let other = IncomingCommand::parse(br#"{"command":"ping","params":{}}"#).unwrap();
        assert_eq!(PairingMessage::from_command(&other), None);
    }
}
