//! Session state, role and fatal error types

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of an uplink session
///
/// ```text
/// Initial ─▶ ClientHandshakeReady ─▶ ServerHandshakeReady ─▶ Active
///                                                              │
///                                                              ▼
///                          GoodbyeHandshake ─▶ GoodbyeHandshakeComplete ─▶ CleanShutdown
///
/// (any non-terminal) ─▶ UncleanShutdownInitiated ─▶ UncleanShutdown
/// (any non-terminal) ─▶ SessionRefusedOrHandshakeError
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    /// Connection established, no handshake data exchanged yet
    Initial,
    /// The client's handshake data was sent (client side) or received (server side)
    ClientHandshakeReady,
    /// The server's handshake response was sent (server side) or received (client side)
    ServerHandshakeReady,
    /// Handshake complete; regular traffic flows
    Active,
    /// Exactly one side has sent its goodbye message
    GoodbyeHandshake,
    /// Both sides have sent their goodbye messages
    GoodbyeHandshakeComplete,
    /// Closed after a complete goodbye handshake (terminal)
    CleanShutdown,
    /// An abnormal close was requested and is in progress
    UncleanShutdownInitiated,
    /// Closed without a complete goodbye handshake (terminal)
    UncleanShutdown,
    /// The handshake failed or the connection was refused (terminal)
    SessionRefusedOrHandshakeError,
}

impl SessionState {
    /// Whether no further transitions are possible from this state
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::CleanShutdown
                | SessionState::UncleanShutdown
                | SessionState::SessionRefusedOrHandshakeError
        )
    }

    /// Whether `self -> next` is an edge of the lifecycle graph
    ///
    /// Redundant requests and re-entry are not edges; callers handle them
    /// separately.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        if self.is_terminal() || self == next {
            return false;
        }
        match next {
            Initial => false,
            ClientHandshakeReady => self == Initial,
            ServerHandshakeReady => self == ClientHandshakeReady,
            Active => matches!(self, Initial | ClientHandshakeReady | ServerHandshakeReady),
            GoodbyeHandshake => self == Active,
            GoodbyeHandshakeComplete => self == GoodbyeHandshake,
            CleanShutdown => self == GoodbyeHandshakeComplete,
            // every non-terminal state may be abandoned
            UncleanShutdownInitiated | UncleanShutdown | SessionRefusedOrHandshakeError => true,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Initial => "INITIAL",
            SessionState::ClientHandshakeReady => "CLIENT_HANDSHAKE_READY",
            SessionState::ServerHandshakeReady => "SERVER_HANDSHAKE_READY",
            SessionState::Active => "ACTIVE",
            SessionState::GoodbyeHandshake => "GOODBYE_HANDSHAKE",
            SessionState::GoodbyeHandshakeComplete => "GOODBYE_HANDSHAKE_COMPLETE",
            SessionState::CleanShutdown => "CLEAN_SHUTDOWN",
            SessionState::UncleanShutdownInitiated => "UNCLEAN_SHUTDOWN_INITIATED",
            SessionState::UncleanShutdown => "UNCLEAN_SHUTDOWN",
            SessionState::SessionRefusedOrHandshakeError => "SESSION_REFUSED_OR_HANDSHAKE_ERROR",
        };
        f.write_str(name)
    }
}

/// Which end of the connection this session represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionRole {
    /// The side that connected and sends the initial handshake
    Client,
    /// The relay side that accepts connections and assigns namespaces
    Server,
}

impl SessionRole {
    /// Prefix of local session ids created for this role
    pub fn id_prefix(self) -> char {
        match self {
            SessionRole::Client => 'c',
            SessionRole::Server => 's',
        }
    }
}

/// Category of a fatal session error, as transported in error goodbye messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FatalErrorKind {
    /// Incompatible protocol versions
    ProtocolVersionMismatch,
    /// The handshake data was malformed or incomplete
    InvalidHandshakeData,
    /// Another session already holds the requested namespace
    ClientNamespaceCollision,
    /// The relay failed internally
    InternalServerError,
    /// The client failed internally
    InternalClientError,
    /// The underlying connection broke down
    LowLevelConnectionError,
    /// Unrecognized or missing error code
    Unknown,
}

impl FatalErrorKind {
    /// Numeric code used in the `E<code>: <message>` wire form
    pub fn code(self) -> u8 {
        match self {
            FatalErrorKind::ProtocolVersionMismatch => 1,
            FatalErrorKind::InvalidHandshakeData => 2,
            FatalErrorKind::ClientNamespaceCollision => 3,
            FatalErrorKind::InternalServerError => 4,
            FatalErrorKind::InternalClientError => 5,
            FatalErrorKind::LowLevelConnectionError => 6,
            FatalErrorKind::Unknown => 99,
        }
    }

    /// Look up a kind by code; unknown codes map to [`FatalErrorKind::Unknown`]
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => FatalErrorKind::ProtocolVersionMismatch,
            2 => FatalErrorKind::InvalidHandshakeData,
            3 => FatalErrorKind::ClientNamespaceCollision,
            4 => FatalErrorKind::InternalServerError,
            5 => FatalErrorKind::InternalClientError,
            6 => FatalErrorKind::LowLevelConnectionError,
            _ => FatalErrorKind::Unknown,
        }
    }

    /// Prefix a message with this kind's code
    pub fn wrap_message(self, message: &str) -> String {
        format!("E{}: {}", self.code(), message)
    }

    /// Split a wrapped message into kind and text
    ///
    /// Messages without a valid `E<code>: ` prefix yield
    /// [`FatalErrorKind::Unknown`] and the unchanged text.
    pub fn parse_wrapped_message(wrapped: &str) -> (FatalErrorKind, String) {
        let parsed = wrapped
            .strip_prefix('E')
            .and_then(|rest| rest.split_once(": "))
            .and_then(|(code, text)| code.parse::<u8>().ok().map(|code| (code, text)));
        match parsed {
            Some((code, text)) => (FatalErrorKind::from_code(code), text.to_string()),
            None => (FatalErrorKind::Unknown, wrapped.to_string()),
        }
    }
}

impl fmt::Display for FatalErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} (E{})", self, self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(SessionState::CleanShutdown.is_terminal());
        assert!(SessionState::UncleanShutdown.is_terminal());
        assert!(SessionState::SessionRefusedOrHandshakeError.is_terminal());
        assert!(!SessionState::UncleanShutdownInitiated.is_terminal());
        assert!(!SessionState::GoodbyeHandshakeComplete.is_terminal());
    }

    #[test]
    fn test_graph_only_moves_forward() {
        use SessionState::*;
        assert!(Initial.can_transition_to(ClientHandshakeReady));
        assert!(!Initial.can_transition_to(ServerHandshakeReady));
        assert!(!Active.can_transition_to(ClientHandshakeReady));
        assert!(!GoodbyeHandshake.can_transition_to(Active));
        assert!(!Active.can_transition_to(CleanShutdown));
        assert!(!Active.can_transition_to(Active));
        assert!(GoodbyeHandshakeComplete.can_transition_to(CleanShutdown));
        assert!(UncleanShutdownInitiated.can_transition_to(UncleanShutdown));
        assert!(!UncleanShutdownInitiated.can_transition_to(Active));
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        use SessionState::*;
        let all = [
            Initial,
            ClientHandshakeReady,
            ServerHandshakeReady,
            Active,
            GoodbyeHandshake,
            GoodbyeHandshakeComplete,
            CleanShutdown,
            UncleanShutdownInitiated,
            UncleanShutdown,
            SessionRefusedOrHandshakeError,
        ];
        for from in all.iter().filter(|s| s.is_terminal()) {
            for to in all.iter() {
                assert!(!from.can_transition_to(*to), "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn test_error_message_wrapping() {
        let wrapped = FatalErrorKind::ClientNamespaceCollision.wrap_message("already logged in");
        assert_eq!(wrapped, "E3: already logged in");
        let (kind, text) = FatalErrorKind::parse_wrapped_message(&wrapped);
        assert_eq!(kind, FatalErrorKind::ClientNamespaceCollision);
        assert_eq!(text, "already logged in");
    }

    #[test]
    fn test_unwrapped_message_is_unknown() {
        let (kind, text) = FatalErrorKind::parse_wrapped_message("connection reset");
        assert_eq!(kind, FatalErrorKind::Unknown);
        assert_eq!(text, "connection reset");

        let (kind, _) = FatalErrorKind::parse_wrapped_message("E42: something");
        assert_eq!(kind, FatalErrorKind::Unknown);
    }
}
