//! RCON wire codec shared by the proxy and its test client.
//!
//! The game server's remote console obfuscates traffic with a repeating XOR
//! key. The first chunk of a session carries the key itself; every later chunk
//! is `key`-XORed text of the form `COMMAND arguments...`. Nothing else about
//! the framing is assumed: no length prefixes, no checksums.

use log::trace;
use std::sync::OnceLock;

/// Byte that separates the command token from its arguments.
pub const COMMAND_SEPARATOR: u8 = b' ';

/// Result of decoding one received chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// The chunk was installed as the session key.
    KeyExchange,
    Command {
        name: String,
        arguments: String,
    },
}

impl Packet {
    pub fn is_command(&self) -> bool {
        matches!(self, Packet::Command { .. })
    }
}

/// Applies a repeating-XOR `key` to `data`.
///
/// The transform is its own inverse. An empty key leaves the data unchanged.
pub fn xor(data: &[u8], key: &[u8]) -> Vec<u8> {
    if key.is_empty() {
        return data.to_vec();
    }

    data.iter()
        .zip(key.iter().cycle())
        .map(|(byte, k)| byte ^ k)
        .collect()
}

/// Splits a plaintext message into an upper-cased command and its arguments.
///
/// The command is the token before the first space, trimmed. The arguments are
/// everything after that token, trimmed. A message that starts with a space
/// therefore has an empty command.
pub fn split_command(message: &[u8]) -> (String, String) {
    let token_len = message
        .iter()
        .position(|&b| b == COMMAND_SEPARATOR)
        .unwrap_or(message.len());

    let (token, rest) = message.split_at(token_len);
    let name = String::from_utf8_lossy(token).trim().to_uppercase();
    let arguments = String::from_utf8_lossy(rest).trim().to_string();

    (name, arguments)
}

/// Per-session decoder state.
///
/// The key slot is write-once: whichever chunk reaches [`SessionCodec::decode`]
/// first becomes the key, no matter which direction it came from. Both copy
/// loops of a session share one codec by reference.
#[derive(Debug, Default)]
pub struct SessionCodec {
    key: OnceLock<Vec<u8>>,
}

impl SessionCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Key installed by the first decoded chunk, if any.
    pub fn key(&self) -> Option<&[u8]> {
        self.key.get().map(Vec::as_slice)
    }

    /// Decodes one received chunk.
    ///
    /// The chunk itself is never modified; decoding only observes it. Empty
    /// chunks never install a key and decode to an empty command.
    pub fn decode(&self, raw: &[u8]) -> Packet {
        if raw.is_empty() {
            return Packet::Command {
                name: String::new(),
                arguments: String::new(),
            };
        }

        let mut installed = false;
        let key = self.key.get_or_init(|| {
            installed = true;
            raw.to_vec()
        });

        if installed {
            trace!("XOR key received: {:02x?}", key);
            return Packet::KeyExchange;
        }

        let (name, arguments) = split_command(&xor(raw, key));
        Packet::Command { name, arguments }
    }
}
