// Permission is hereby granted, free of charge, to any person obtaining a
// copy of this software and associated documentation files (the "Software"),
// to deal in the Software without restriction, including without limitation
// the rights to use, copy, modify, merge, publish, distribute, sublicense,
// and/or sell copies of the Software, and to permit persons to whom the
// Software is furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS
// OR IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
// FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
// DEALINGS IN THE SOFTWARE.

//! I2P-alphabet Base64/Base32 codecs.
//!
//! The Base64 alphabet replaces `+/` with `-~`, the Base32 alphabet is the
//! RFC 4648 alphabet lowercased and unpadded.

use data_encoding::{Encoding, Specification};
use lazy_static::lazy_static;

use alloc::{string::String, vec::Vec};

lazy_static! {
    pub static ref I2P_BASE64: Encoding = {
        let mut spec = Specification::new();
        spec.symbols
            .push_str("ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-~");
        spec.padding = Some('=');
        spec.encoding().unwrap()
    };
    pub static ref I2P_BASE32: Encoding = {
        let mut spec = Specification::new();
        spec.symbols.push_str("abcdefghijklmnopqrstuvwxyz234567");
        spec.encoding().unwrap()
    };
}

/// Hex alphabet used by [`base16_encode()`].
const HEX_ALPHABET: &[u8; 16] = b"0123456789abcdef";

/// Base64 encode `data`.
pub fn base64_encode<T: AsRef<[u8]>>(data: T) -> String {
    I2P_BASE64.encode(data.as_ref())
}

/// Base64 decode `data`.
pub fn base64_decode<T: AsRef<[u8]>>(data: T) -> Option<Vec<u8>> {
    I2P_BASE64.decode(data.as_ref()).ok()
}

/// Base32 encode `data`.
pub fn base32_encode(data: impl AsRef<[u8]>) -> String {
    I2P_BASE32.encode(data.as_ref())
}

/// Base32 decode `data`.
pub fn base32_decode(data: impl AsRef<[u8]>) -> Option<Vec<u8>> {
    I2P_BASE32.decode(data.as_ref()).ok()
}

/// Hex-encode `data`, lowercase.
pub fn base16_encode(data: impl AsRef<[u8]>) -> String {
    data.as_ref()
        .iter()
        .flat_map(|byte| {
            [
                HEX_ALPHABET[(byte >> 4) as usize] as char,
                HEX_ALPHABET[(byte & 0x0f) as usize] as char,
            ]
        })
        .collect()
}

/// Returns `true` if `character` belongs to the I2P Base64 alphabet.
pub fn is_base64_char(character: char) -> bool {
    character.is_ascii_alphanumeric() || matches!(character, '-' | '~' | '=')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base64_round_trip() {
        let encoded = base64_encode(b"gangway");
        assert_eq!(base64_decode(&encoded).unwrap(), b"gangway");
    }

    #[test]
    fn base64_i2p_alphabet() {
        // 0xfb 0xff encodes to characters that standard base64 would
        // render as `+` and `/`
        let encoded = base64_encode([0xfbu8, 0xef, 0xff]);
        assert!(!encoded.contains('+'));
        assert!(!encoded.contains('/'));
        assert_eq!(base64_decode(&encoded).unwrap(), alloc::vec![0xfb, 0xef, 0xff]);
    }

    #[test]
    fn base32_lowercase_unpadded() {
        let encoded = base32_encode([0u8; 32]);
        assert_eq!(encoded.len(), 52);
        assert!(encoded.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn hex_encoding() {
        assert_eq!(base16_encode([0x00u8, 0xff, 0x1a]), "00ff1a");
    }
}
