// Copyright 2025 Dustin McAfee
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Classic VNC Authentication (security type 2, RFC 6143 section 7.2.2).
//!
//! Challenge-response over DES with the protocol's historical quirk: each
//! password byte has its bits reversed before entering the key schedule,
//! and only the first 8 bytes of the password count (shorter passwords are
//! NUL-padded). This scheme is legacy; it gates access, it does not
//! protect the wire.

use des::cipher::{BlockEncrypt, KeyInit};
use des::Des;
use rand::Rng;

/// Server-side state for one VNC authentication exchange.
pub struct VncAuthenticator {
    password: String,
}

impl VncAuthenticator {
    /// Creates an authenticator for the configured password. Only the
    /// first 8 bytes are effective.
    #[must_use]
    pub fn new(password: &str) -> Self {
        Self {
            password: password.to_string(),
        }
    }

    /// Produces the random 16-byte challenge sent to the client.
    #[must_use]
    #[allow(clippy::unused_self)] // method for symmetry with verify()
    pub fn challenge(&self) -> [u8; 16] {
        let mut rng = rand::rng();
        let mut challenge = [0u8; 16];
        rng.fill(&mut challenge);
        challenge
    }

    /// Checks the client's 16-byte response against the challenge.
    #[must_use]
    pub fn verify(&self, challenge: &[u8; 16], response: &[u8]) -> bool {
        response == self.encrypt(challenge).as_slice()
    }

    /// Encrypts the challenge as two DES-ECB blocks under the
    /// bit-reversed password key.
    fn encrypt(&self, challenge: &[u8; 16]) -> [u8; 16] {
        let mut key = [0u8; 8];
        for (slot, &byte) in key.iter_mut().zip(self.password.as_bytes().iter().take(8)) {
            *slot = byte.reverse_bits();
        }
        let cipher = Des::new_from_slice(&key).expect("8-byte DES key");

        let mut out = [0u8; 16];
        for (i, half) in challenge.chunks_exact(8).enumerate() {
            let mut block: [u8; 8] = half.try_into().expect("8-byte block");
            cipher.encrypt_block((&mut block).into());
            out[i * 8..i * 8 + 8].copy_from_slice(&block);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correct_response_verifies() {
        let auth = VncAuthenticator::new("secret");
        let challenge = auth.challenge();
        let response = auth.encrypt(&challenge);
        assert!(auth.verify(&challenge, &response));
    }

    #[test]
    fn wrong_response_fails() {
        let auth = VncAuthenticator::new("secret");
        let challenge = auth.challenge();
        assert!(!auth.verify(&challenge, &[0u8; 16]));
    }

    #[test]
    fn only_first_eight_password_bytes_count() {
        let challenge = [7u8; 16];
        let a = VncAuthenticator::new("longpassword");
        let b = VncAuthenticator::new("longpass");
        assert_eq!(a.encrypt(&challenge), b.encrypt(&challenge));
    }

    #[test]
    fn key_schedule_uses_bit_reversed_bytes() {
        // The bit reversal is what distinguishes VNC-DES from plain DES:
        // "pass" and its bit-reversed twin must agree.
        let challenge = [42u8; 16];
        let plain = VncAuthenticator::new("pass");
        // 'p' = 0x70 -> 0x0E, 'a' = 0x61 -> 0x86, 's' = 0x73 -> 0xCE
        let mut key = [0u8; 8];
        for (slot, byte) in key.iter_mut().zip(*b"pass") {
            *slot = byte.reverse_bits();
        }
        let cipher = Des::new_from_slice(&key).unwrap();
        let mut block: [u8; 8] = challenge[..8].try_into().unwrap();
        cipher.encrypt_block((&mut block).into());
        assert_eq!(plain.encrypt(&challenge)[..8], block);
    }
}
