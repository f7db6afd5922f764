//! Media Module - Relay-Verbindung und Audio-Routing
//!
//! Dieses Modul verwaltet:
//! - Schnittstelle zum Media-Relay (Room connect/publish)
//! - Abruf der Room-Tokens
//! - Audio-Session Konfiguration bei Routenwechseln

mod relay;
mod route;
mod token;

pub use relay::{LocalAudioTrack, MediaRelay, PublicationHandle, RelayConnectionState, RelayError};
pub use route::{
    AudioCategory, AudioMode, AudioRouteController, AudioRouteSnapshot, AudioSession,
    AudioSessionConfig, AudioSessionError, CategoryOptions, RouteChangeReason,
    RouteControllerHandle,
};
pub use token::{parse_token_response, HttpTokenProvider, RoomCredential, TokenError, TokenProvider};
