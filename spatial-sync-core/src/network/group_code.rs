//! Group Code Generation and Parsing
//!
//! Human-friendly codes that name a group's gossipsub topic.

use std::fmt;

use rand::Rng;

/// Glyphs that read alike (0/O, 1/I/L, 5/S, 2/Z) are left out
const ALPHABET: &[u8] = b"346789ABCDEFGHJKMNPQRTUVWXY";

const CODE_LENGTH: usize = 8;

/// A code that can be shared to join a group
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupCode(String);

impl GroupCode {
    /// Generate a random code using the thread-local CSPRNG
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        let code = (0..CODE_LENGTH)
            .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
            .collect();
        GroupCode(code)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse a code typed or pasted by a user
    ///
    /// Case is ignored, as are dashes and whitespace.
    pub fn parse(input: &str) -> Option<Self> {
        let code: String = input
            .chars()
            .filter(|c| *c != '-' && !c.is_whitespace())
            .map(|c| c.to_ascii_uppercase())
            .collect();

        let valid = code.len() == CODE_LENGTH && code.bytes().all(|b| ALPHABET.contains(&b));
        valid.then_some(GroupCode(code))
    }
}

impl fmt::Display for GroupCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // XXXX-XXXX for readability
        write!(f, "{}-{}", &self.0[..4], &self.0[4..])
    }
}
