//! Presence-Records
//!
//! Ein Record pro Benutzer im Presence-Store. Der Coordinator interessiert
//! sich nur für das Incoming-Call Flag, die restlichen Felder braucht die
//! UI für die Peer-Auswahl.

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Zeichen für Freundes-PINs
const PIN_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Länge einer Freundes-PIN
pub const PIN_LENGTH: usize = 7;

/// Erzeugt eine zufällige PIN, mit der andere Benutzer einen als Freund hinzufügen
pub fn generate_pin() -> String {
    let mut rng = rand::thread_rng();
    (0..PIN_LENGTH)
        .map(|_| PIN_ALPHABET[rng.gen_range(0..PIN_ALPHABET.len())] as char)
        .collect()
}

// ============================================================================
// RECORD
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    /// Record-ID (= User-ID), nicht Teil des Dokuments
    #[serde(skip)]
    pub id: String,
    #[serde(default)]
    pub username: String,
    #[serde(rename = "deviceToken", default)]
    pub device_token: String,
    #[serde(rename = "profileImageUrl", default)]
    pub profile_image_url: String,
    #[serde(default)]
    pub pin: String,
    #[serde(default)]
    pub friends: Vec<String>,
    #[serde(rename = "hasIncomingCallRequest", default)]
    pub has_incoming_call_request: bool,
    #[serde(
        rename = "incomingCallRequester",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub incoming_call_requester: Option<String>,
}

impl PresenceRecord {
    /// Neuer Record mit frischer PIN
    pub fn new(id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            username: username.into(),
            device_token: String::new(),
            profile_image_url: String::new(),
            pin: generate_pin(),
            friends: Vec::new(),
            has_incoming_call_request: false,
            incoming_call_requester: None,
        }
    }

    /// Parst ein Dokument aus dem Store
    pub fn from_document(id: impl Into<String>, document: &[u8]) -> Result<Self, serde_json::Error> {
        let mut record: Self = serde_json::from_slice(document)?;
        record.id = id.into();
        Ok(record)
    }

    pub fn incoming_call_signal(&self) -> IncomingCallSignal {
        IncomingCallSignal {
            requester_id: self.incoming_call_requester.clone(),
            flag_value: self.has_incoming_call_request,
        }
    }

    /// Schreibt ein einzelnes Feld (last-write-wins)
    pub fn apply(&mut self, field: &RecordField) {
        match field {
            RecordField::IncomingCall {
                requester_id,
                value,
            } => {
                self.has_incoming_call_request = *value;
                self.incoming_call_requester = requester_id.clone();
            }
            RecordField::DeviceToken(token) => self.device_token = token.clone(),
            RecordField::ProfileImageUrl(url) => self.profile_image_url = url.clone(),
            RecordField::Friends(friends) => self.friends = friends.clone(),
            RecordField::AddFriend(friend_id) => {
                if !self.friends.contains(friend_id) {
                    self.friends.push(friend_id.clone());
                }
            }
        }
    }
}

/// Einzelnes schreibbares Feld eines Records
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordField {
    /// Flag und Anrufer werden zusammen geschrieben
    IncomingCall {
        requester_id: Option<String>,
        value: bool,
    },
    DeviceToken(String),
    ProfileImageUrl(String),
    Friends(Vec<String>),
    /// Fügt einen Freund hinzu, falls noch nicht vorhanden
    AddFriend(String),
}

// ============================================================================
// SIGNALS
// ============================================================================

/// Incoming-Call Flag wie es der Empfänger sieht
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingCallSignal {
    pub requester_id: Option<String>,
    pub flag_value: bool,
}

/// Anzeige-Daten eines Peers
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct PeerProfile {
    pub username: String,
    #[serde(rename = "profileImageUrl")]
    pub profile_image_url: String,
}

/// Aktuell ausgewählter Gesprächspartner
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerSelection {
    #[serde(rename = "peerId")]
    pub peer_id: String,
    #[serde(rename = "displayProfile")]
    pub display_profile: PeerProfile,
    /// Push-Adresse (Device Token)
    #[serde(rename = "deliveryAddress")]
    pub delivery_address: String,
}

impl PeerSelection {
    pub fn from_record(record: &PresenceRecord) -> Self {
        Self {
            peer_id: record.id.clone(),
            display_profile: PeerProfile {
                username: record.username.clone(),
                profile_image_url: record.profile_image_url.clone(),
            },
            delivery_address: record.device_token.clone(),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
