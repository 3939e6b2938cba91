use nostr_sdk::nips::nip04;
use nostr_sdk::{Event, Keys, Kind};
use tracing::debug;

use crate::constants::{KIND_APP_DATA, NIP04_IV_MARKER, RECIPIENT_TAG};
use crate::error::{GateError, NotAdmitted};
use crate::models::tag_utils::extract_tag_str;
use crate::models::Identity;

/// Admits control events addressed to this node and decrypts their content.
pub struct ControlGate {
    keys: Keys,
    identity: Identity,
    control_kind: Kind,
}

impl ControlGate {
    pub fn new(keys: Keys) -> Self {
        Self::with_control_kind(keys, KIND_APP_DATA)
    }

    pub fn with_control_kind(keys: Keys, control_kind: u16) -> Self {
        let identity = Identity::from(keys.public_key());
        Self {
            keys,
            identity,
            control_kind: Kind::from(control_kind),
        }
    }

    /// This node's own identity (the expected recipient)
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn is_control(&self, event: &Event) -> bool {
        event.kind == self.control_kind
    }

    /// Admission check without decrypting.
    ///
    /// Only the first `p` tag is consulted; a control event names exactly one recipient.
    pub fn check(&self, event: &Event) -> Result<(), NotAdmitted> {
        if !self.is_control(event) {
            return Err(NotAdmitted::NotControlKind(event.kind.as_u16()));
        }

        let recipient = extract_tag_str(event, RECIPIENT_TAG).ok_or(NotAdmitted::NoRecipient)?;
        if recipient != self.identity.as_str() {
            return Err(NotAdmitted::WrongRecipient(recipient.to_string()));
        }

        if !event.content.contains(NIP04_IV_MARKER) {
            return Err(NotAdmitted::NotEncrypted);
        }

        Ok(())
    }

    /// Admit `event` and return its decrypted content.
    pub fn admit(&self, event: &Event) -> Result<String, GateError> {
        self.check(event).map_err(GateError::NotAdmitted)?;

        let plaintext = nip04::decrypt(self.keys.secret_key(), &event.pubkey, &event.content)
            .map_err(|e| GateError::Decryption {
                event_id: event.id.to_hex(),
                author: Identity::from(event.pubkey),
                reason: e.to_string(),
            })?;

        debug!(author = %Identity::from(event.pubkey).short(), "decrypted control content");
        Ok(plaintext)
    }
}
