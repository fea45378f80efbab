pub mod invite;

use serde::{Deserialize, Serialize};

pub use invite::{Invite, InviteError};

/// Maximum size of a single JSON-lines frame. Merged prompts and base64
/// output chunks both stay far below this.
pub const MAX_LINE_BYTES: usize = 256 * 1024;

/// Client-to-host messages sent as JSON-lines over the TCP stream.
///
/// The first message on a connection must be `Hello`; everything else is
/// rejected until the token has been checked.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Hello {
        user: String,
        token: String,
    },
    /// Discrete prompt submission, accepted only in batch mode.
    Prompt {
        text: String,
    },
    /// Raw terminal input, accepted only in interactive mode.
    InputBytes {
        #[serde(rename = "data_b64", with = "base64_bytes")]
        data: Vec<u8>,
    },
    Ping,
}

/// Host-to-client messages.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Shareable invite string, sent to each peer right after it joins.
    Invite {
        code: String,
    },
    System {
        message: String,
    },
    Error {
        message: String,
    },
    /// Roster snapshot, broadcast after every join and leave.
    Participants {
        main_user: String,
        users: Vec<String>,
    },
    /// One line of hosted-process output (batch mode).
    Output {
        text: String,
    },
    /// Raw terminal output chunk (interactive mode).
    OutputBytes {
        stream: String,
        #[serde(rename = "data_b64", with = "base64_bytes")]
        data: Vec<u8>,
    },
    /// Merged prompt produced by the debounce pipeline, shown to all
    /// peers before the hosted process runs it.
    DedupedPrompt {
        text: String,
    },
    Pong,
}

/// Base64 encoding for byte arrays in JSON.
mod base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}
