//! Challenge/response login verification.
//!
//! The command channel treats the exchange as opaque bytes: the server
//! hands out a random challenge, the client answers with a MAC over it
//! keyed by a per-user secret, and the verifier either names the
//! authenticated principal or fails. Keyed HMAC-SHA512-256 via libsodium.

use crate::encoding::base64;
use ctor::ctor;
use hashbrown::HashMap;
use libsodium_sys;

pub const CHALLENGE_SIZE: usize = 24;
pub const KEY_SIZE: usize = libsodium_sys::crypto_auth_KEYBYTES as usize;
pub const MAC_SIZE: usize = libsodium_sys::crypto_auth_BYTES as usize;

// libsodium must be initialised before the first call into it.
#[ctor]
fn init_sodium() {
    let rc = unsafe { libsodium_sys::sodium_init() };
    if rc < 0 {
        panic!("libsodium initialisation failed ({})", rc);
    }
}

/// Fills the supplied slice with cryptographically random bytes.
#[inline]
pub fn random_bytes(bytes: &mut [u8]) {
    unsafe {
        libsodium_sys::randombytes_buf(bytes.as_mut_ptr() as *mut _, bytes.len());
    }
}

/// Computes the MAC the client is expected to return for a challenge.
#[inline]
pub fn mac(challenge: &[u8], key: &[u8; KEY_SIZE]) -> [u8; MAC_SIZE] {
    let mut out = [0u8; MAC_SIZE];

    unsafe {
        libsodium_sys::crypto_auth(
            out.as_mut_ptr(),
            challenge.as_ptr(),
            challenge.len() as u64,
            key.as_ptr(),
        );
    }

    out
}

#[inline]
fn verify_mac(response: &[u8], challenge: &[u8], key: &[u8; KEY_SIZE]) -> bool {
    if response.len() != MAC_SIZE {
        return false;
    }

    unsafe {
        libsodium_sys::crypto_auth_verify(
            response.as_ptr(),
            challenge.as_ptr(),
            challenge.len() as u64,
            key.as_ptr(),
        ) == 0
    }
}

/// The identity established by a completed exchange.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Principal {
    pub name: String,
    pub admin: bool,
    pub write_access: bool,
}

/// One step of the exchange, as seen by the session driving it.
#[derive(Debug, Eq, PartialEq)]
pub enum Step {
    /// Send these bytes to the client and wait for its response.
    Challenge(Vec<u8>),
    /// Exchange complete, principal authenticated.
    Done(Principal),
    /// Exchange failed. The session reports the error and closes.
    Failed,
}

/// Credential verification contract. The session only ever sees opaque
/// bytes going out and coming back in.
pub trait Verifier {
    /// Starts an exchange for the named user.
    fn begin(&self, user: &str) -> Step;

    /// Verifies the response to a previously issued challenge.
    fn finish(&self, user: &str, challenge: &[u8], response: &[u8]) -> Step;
}

struct UserKey {
    key: [u8; KEY_SIZE],
    admin: bool,
    write_access: bool,
}

/// Default verifier: a static table of per-user keys loaded from
/// configuration.
pub struct KeyStore {
    users: HashMap<String, UserKey>,
}

pub enum KeyStoreError {
    BadKey(String),
}

impl KeyStore {
    pub fn new() -> KeyStore {
        KeyStore {
            users: HashMap::new(),
        }
    }

    /// Adds a user with a base64 encoded key. The decoded key must be
    /// exactly `KEY_SIZE` bytes.
    pub fn add_user(
        &mut self,
        name: &str,
        key_b64: &str,
        admin: bool,
        write_access: bool,
    ) -> Result<(), KeyStoreError> {
        let raw = base64::decode(key_b64).map_err(|_| KeyStoreError::BadKey(name.into()))?;

        if raw.len() != KEY_SIZE {
            return Err(KeyStoreError::BadKey(name.into()));
        }

        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&raw);

        self.users.insert(
            name.into(),
            UserKey {
                key,
                admin,
                write_access,
            },
        );

        Ok(())
    }
}

impl Verifier for KeyStore {
    fn begin(&self, user: &str) -> Step {
        // A challenge is issued even for unknown users so the exchange
        // does not leak which names exist.
        let _ = user;

        let mut challenge = vec![0u8; CHALLENGE_SIZE];
        random_bytes(&mut challenge);

        Step::Challenge(challenge)
    }

    fn finish(&self, user: &str, challenge: &[u8], response: &[u8]) -> Step {
        match self.users.get(user) {
            Some(entry) if verify_mac(response, challenge, &entry.key) => Step::Done(Principal {
                name: user.into(),
                admin: entry.admin,
                write_access: entry.write_access || entry.admin,
            }),
            _ => Step::Failed,
        }
    }
}
