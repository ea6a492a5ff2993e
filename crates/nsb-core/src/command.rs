//! Exec payload decoding and the command allow-list
//!
//! An SSH `exec` request carries its command as an SSH string: a 4-byte
//! big-endian length followed by the command bytes. Only one command is
//! ever honoured, compared byte for byte.

use bytes::{BufMut, Bytes, BytesMut};

use crate::config::ALLOWED_COMMAND;
use crate::error::CommandError;

/// Size of the length prefix in front of the command text
const LENGTH_PREFIX_LEN: usize = 4;

/// Strip the length prefix from an exec payload and return the command bytes.
///
/// The declared length must match the number of bytes that follow it.
pub fn decode_exec_payload(payload: &[u8]) -> Result<&[u8], CommandError> {
    if payload.len() < LENGTH_PREFIX_LEN {
        return Err(CommandError::Truncated { len: payload.len() });
    }

    let (prefix, command) = payload.split_at(LENGTH_PREFIX_LEN);
    let declared = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
    if declared != command.len() {
        return Err(CommandError::LengthMismatch {
            declared,
            actual: command.len(),
        });
    }

    Ok(command)
}

/// Check that an exec payload asks for exactly the allowed daemon invocation
pub fn validate_exec_payload(payload: &[u8]) -> Result<(), CommandError> {
    let command = decode_exec_payload(payload)?;

    if command != ALLOWED_COMMAND.as_bytes() {
        return Err(CommandError::NotAllowed {
            command: String::from_utf8_lossy(command).into_owned(),
        });
    }

    Ok(())
}

/// Frame a command as an exec payload
pub fn encode_exec_payload(command: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_LEN + command.len());
    buf.put_u32(command.len() as u32);
    buf.put_slice(command);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allowed_command_accepted() {
        let payload = encode_exec_payload(b"nix-daemon --stdio");
        assert_eq!(&payload[..4], &[0, 0, 0, 18]);
        assert!(validate_exec_payload(&payload).is_ok());
    }

    #[test]
    fn test_other_commands_rejected() {
        let rejected: &[&[u8]] = &[
            b"",
            b"ls -la",
            b"nix-daemon",
            b"nix-daemon --stdio ",
            b"nix-daemon --stdio --verbose",
            b" nix-daemon --stdio",
            b"NIX-DAEMON --STDIO",
            b"Nix-daemon --stdio",
            b"nix-daemon  --stdio",
            b"nix-daemon --stdio\n",
        ];

        for command in rejected {
            let payload = encode_exec_payload(command);
            assert_eq!(
                validate_exec_payload(&payload),
                Err(CommandError::NotAllowed {
                    command: String::from_utf8_lossy(command).into_owned()
                }),
            );
        }
    }

    #[test]
    fn test_truncated_payload() {
        for payload in [&b""[..], &[0], &[0, 0, 0]] {
            assert_eq!(
                decode_exec_payload(payload),
                Err(CommandError::Truncated { len: payload.len() })
            );
        }
    }

    #[test]
    fn test_empty_command_decodes() {
        assert_eq!(decode_exec_payload(&[0, 0, 0, 0]), Ok(&b""[..]));
    }

    #[test]
    fn test_length_prefix_must_match() {
        let mut payload = vec![0, 0, 0, 99];
        payload.extend_from_slice(ALLOWED_COMMAND.as_bytes());

        assert_eq!(
            validate_exec_payload(&payload),
            Err(CommandError::LengthMismatch {
                declared: 99,
                actual: ALLOWED_COMMAND.len()
            })
        );
    }

    #[test]
    fn test_truncated_command_text() {
        // Prefix still claims the full command, text was cut short
        let mut payload = vec![0, 0, 0, 18];
        payload.extend_from_slice(b"nix-daemon --std");

        assert!(matches!(
            validate_exec_payload(&payload),
            Err(CommandError::LengthMismatch { declared: 18, actual: 16 })
        ));
    }
}
