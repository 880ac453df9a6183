// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    fmt,
    time::{Instant, SystemTime, UNIX_EPOCH},
};

use md4::Md4;
use md5::Md5;
use pbkdf2::pbkdf2_hmac;
use ripemd::Ripemd160;
use sha1::Sha1;
use sha2::{Sha224, Sha256, Sha384, Sha512};
use tracing::debug;
use whirlpool::Whirlpool;

use crate::core::certificate::Certificate;

/// The amount of time, in seconds, that a key is allowed to live.
pub const KEY_TTL: u64 = 5;

/// Length of the derived keys and of the cipher permutation.
const KEY_LEN: usize = 256;

/// PBKDF2 rounds for the first key of a session.
const FRESH_ROUNDS: u32 = 10_000;
/// PBKDF2 rounds for every chained key after the first.
const DERIVED_ROUNDS: u32 = 100;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("no common algorithm found")]
    NoCommonAlgorithm,
    #[error("unknown hash algorithm `{0}`")]
    UnknownAlgorithm(String),
    #[error("decrypted payload is not valid utf-8")]
    Decrypt,
}

/// Hash algorithms this build can run PBKDF2 over, strongest first.
///
/// The ordering is what negotiation falls back to when the peer does not
/// share our preferred algorithm.
pub const ALGORITHMS: &[HashAlg] = &[
    HashAlg::Sha512,
    HashAlg::Sha384,
    HashAlg::Whirlpool,
    HashAlg::Sha256,
    HashAlg::Sha224,
    HashAlg::Ripemd160,
    HashAlg::Md5,
    HashAlg::Sha1,
    HashAlg::Md4,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlg {
    Sha512,
    Sha384,
    Whirlpool,
    Sha256,
    Sha224,
    Ripemd160,
    Md5,
    Sha1,
    Md4,
}

impl HashAlg {
    pub fn name(self) -> &'static str {
        match self {
            HashAlg::Sha512 => "sha512",
            HashAlg::Sha384 => "sha384",
            HashAlg::Whirlpool => "whirlpool",
            HashAlg::Sha256 => "sha256",
            HashAlg::Sha224 => "sha224",
            HashAlg::Ripemd160 => "ripemd160",
            HashAlg::Md5 => "md5",
            HashAlg::Sha1 => "sha1",
            HashAlg::Md4 => "md4",
        }
    }

    pub fn from_name(name: &str) -> Result<Self, SessionError> {
        ALGORITHMS
            .iter()
            .copied()
            .find(|alg| alg.name().eq_ignore_ascii_case(name))
            .ok_or_else(|| SessionError::UnknownAlgorithm(name.to_string()))
    }
}

impl fmt::Display for HashAlg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A step function where `clamp_to(n, clamp) = clamp * (n / clamp) + clamp`.
///
/// Two hosts that evaluate this within the same `clamp`-second slice of
/// time agree on the result, which is what makes the key schedule meet.
pub fn clamp_to(n: u64, clamp: u64) -> u64 {
    n - (n % clamp) + clamp
}

/// Get either this device's preferred algorithm, or the best one shared
/// between the device and the other host.
pub fn get_common_algorithm(
    external: &[String],
    preferred: Option<HashAlg>,
) -> Result<HashAlg, SessionError> {
    let shared =
        |alg: HashAlg| external.iter().any(|e| e.eq_ignore_ascii_case(alg.name()));
    if let Some(pref) = preferred {
        if shared(pref) {
            return Ok(pref);
        }
    }
    ALGORITHMS
        .iter()
        .copied()
        .find(|&alg| shared(alg))
        .ok_or(SessionError::NoCommonAlgorithm)
}

fn pbkdf2_key(alg: HashAlg, key: &[u8], salt: &[u8], rounds: u32) -> Box<[u8; KEY_LEN]> {
    let mut out = Box::new([0u8; KEY_LEN]);
    match alg {
        HashAlg::Sha512 => pbkdf2_hmac::<Sha512>(key, salt, rounds, &mut out[..]),
        HashAlg::Sha384 => pbkdf2_hmac::<Sha384>(key, salt, rounds, &mut out[..]),
        HashAlg::Whirlpool => pbkdf2_hmac::<Whirlpool>(key, salt, rounds, &mut out[..]),
        HashAlg::Sha256 => pbkdf2_hmac::<Sha256>(key, salt, rounds, &mut out[..]),
        HashAlg::Sha224 => pbkdf2_hmac::<Sha224>(key, salt, rounds, &mut out[..]),
        HashAlg::Ripemd160 => {
            pbkdf2_hmac::<Ripemd160>(key, salt, rounds, &mut out[..])
        },
        HashAlg::Md5 => pbkdf2_hmac::<Md5>(key, salt, rounds, &mut out[..]),
        HashAlg::Sha1 => pbkdf2_hmac::<Sha1>(key, salt, rounds, &mut out[..]),
        HashAlg::Md4 => pbkdf2_hmac::<Md4>(key, salt, rounds, &mut out[..]),
    }
    out
}

/// Derive the first key of a session from the certificate segment and
/// the wall clock, clamped to the key TTL so both hosts agree.
pub fn fresh_key(cert: &Certificate, alg: HashAlg, epoch_secs: u64) -> Box<[u8; 256]> {
    let salt = clamp_to(epoch_secs, KEY_TTL).to_string();
    pbkdf2_key(alg, cert.key_segment(), salt.as_bytes(), FRESH_ROUNDS)
}

/// A session between two hosts. The session uses a symmetrical key to
/// encrypt and decrypt data.
///
/// The key stream is chained: each new key is derived from the previous
/// one plus the session's age, and the 256-entry cipher permutation is
/// re-shuffled whenever the two-phase ratchet commits.
pub struct Session {
    cert: Certificate,
    hashtype: HashAlg,
    /// The current cipher permutation. Always a permutation of `0..=255`.
    pub cipher: [u8; 256],
    start: Instant,
    prev_key: Box<[u8; 256]>,
    new_key: Box<[u8; 256]>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("uuid", &self.cert.uuid())
            .field("hashtype", &self.hashtype)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(cert: Certificate, hashtype: HashAlg) -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64()
            .ceil() as u64;
        Self::from_epoch(cert, hashtype, now)
    }

    /// Build a session as of `epoch_secs` (whole unix seconds). Split out
    /// from [`Session::new`] so both ends of a test can share a clock.
    pub fn from_epoch(cert: Certificate, hashtype: HashAlg, epoch_secs: u64) -> Self {
        let prev_key = fresh_key(&cert, hashtype, epoch_secs);
        let mut session = Self {
            cert,
            hashtype,
            cipher: std::array::from_fn(|i| i as u8),
            start: Instant::now(),
            prev_key,
            new_key: Box::new([0u8; 256]),
        };
        session.new_key = session.derived_key();
        session
    }

    pub fn hashtype(&self) -> HashAlg {
        self.hashtype
    }

    fn next_segment_time(&self) -> u64 {
        let elapsed = self.start.elapsed().as_secs_f64().ceil() as u64;
        let clamped = clamp_to(elapsed, KEY_TTL);
        debug!("Elapsed: {clamped}");
        clamped
    }

    /// Generate a new key from the old one and how long the session has
    /// been alive.
    fn derived_key(&self) -> Box<[u8; 256]> {
        let salt = self.next_segment_time().to_string();
        pbkdf2_key(
            self.hashtype,
            &self.prev_key[..],
            salt.as_bytes(),
            DERIVED_ROUNDS,
        )
    }

    fn randomize(&mut self) {
        self.new_key = self.derived_key();
        for i in 0..256 {
            let j = self.new_key[i] as usize;
            self.cipher.swap(i, j);
        }
    }

    /// Encrypt a byte sequence using this session's key generator.
    ///
    /// Encryption is a direct translation through the session's cipher
    /// permutation, followed by a XOR between `input[n]` and `cipher[n]`.
    pub fn encrypt(&mut self, input: &[u8]) -> Vec<u8> {
        if self.prev_key == self.new_key {
            self.randomize();
        }
        input
            .iter()
            .enumerate()
            .map(|(i, &b)| self.cipher[b as usize] ^ self.cipher[i % 256])
            .collect()
    }

    /// Decrypt a byte sequence and decode it as UTF-8.
    ///
    /// The reverse of encryption: XOR `input[n]` and `cipher[n]`, then
    /// that byte's index in the cipher is the original byte.
    pub fn decrypt(&mut self, input: &[u8]) -> Result<String, SessionError> {
        if self.prev_key == self.new_key {
            self.randomize();
        }
        let mut inverse = [0u8; 256];
        for (i, &b) in self.cipher.iter().enumerate() {
            inverse[b as usize] = i as u8;
        }
        let plain: Vec<u8> = input
            .iter()
            .enumerate()
            .map(|(i, &b)| inverse[(b ^ self.cipher[i % 256]) as usize])
            .collect();
        String::from_utf8(plain).map_err(|_| SessionError::Decrypt)
    }

    /// Commit phase of the two-phase key ratchet.
    ///
    /// Called once after every successful round-trip; the next encrypt or
    /// decrypt then re-randomizes the cipher exactly once.
    pub fn update_key(&mut self) {
        self.prev_key = self.new_key.clone();
    }
}
