//! Cryptographic suite backing the authenticated session layer (§3, §4.1,
//! §4.4). There is a single suite today (`SUITE_ID = 1`); `CryptoSuite` is
//! the explicit handle threaded through every function that needs it,
//! replacing the source's global allocator/suite handle (§9 design notes).

use std::fmt;

use byteorder::{BigEndian, WriteBytesExt};
use ctor::ctor;

/// Size, in bytes, of a shared-secret symmetric key.
pub const KEY_SIZE: usize = 32;
/// Size, in bytes, of a per-session key-nonce or challenge-nonce.
pub const NONCE_SIZE: usize = 32;
/// Size, in bytes, of an authed-frame MAC.
pub const MAC_SIZE: usize = 16;
/// Size, in bytes, of a long-term public/private key.
pub const PUBLIC_KEY_SIZE: usize = 32;
pub const PRIVATE_KEY_SIZE: usize = 32;

const CHACHA_NONCE_SIZE: usize = 12;
const CHACHA_BLOCK_SIZE: usize = 64;

/// The only crypto suite this codebase implements. An unknown `suite_id` on
/// the wire is rejected by the handshake before this type is ever touched.
pub const SUITE_ID: u16 = 1;

#[ctor]
fn init_sodium() {
    unsafe {
        if libsodium_sys::sodium_init() < 0 {
            panic!("cryptography initialization failed");
        }
    }
}

/// Threaded through every crypto operation. Holds no state today beyond the
/// suite identifier, but keeps call sites ready for a second suite without
/// reaching for a process-global.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct CryptoSuite {
    pub suite_id: u16,
}

impl CryptoSuite {
    pub fn current() -> CryptoSuite {
        CryptoSuite { suite_id: SUITE_ID }
    }

    pub fn matches(&self, suite_id: u16) -> bool {
        self.suite_id == suite_id
    }
}

#[derive(Copy, Clone)]
pub struct PublicKey(pub [u8; PUBLIC_KEY_SIZE]);

pub struct PrivateKey(pub [u8; PRIVATE_KEY_SIZE]);

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PrivateKey(..)")
    }
}

impl Drop for PrivateKey {
    fn drop(&mut self) {
        zero(&mut self.0);
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PublicKey({:?})", &self.0[..4])
    }
}

/// A long-term X25519 key pair, generated once per entity.
pub struct KeyPair {
    pub public: PublicKey,
    pub private: PrivateKey,
}

pub fn generate_keypair() -> KeyPair {
    let mut public = [0u8; PUBLIC_KEY_SIZE];
    let mut private = [0u8; PRIVATE_KEY_SIZE];
    unsafe {
        libsodium_sys::crypto_box_keypair(public.as_mut_ptr(), private.as_mut_ptr());
    }
    KeyPair {
        public: PublicKey(public),
        private: PrivateKey(private),
    }
}

/// Zeroes a byte buffer that carried secret material. Every packet decoded
/// from the wire must be released this way once consumed (§5 memory
/// ownership).
pub fn zero(buf: &mut [u8]) {
    unsafe {
        libsodium_sys::sodium_memzero(buf.as_mut_ptr() as *mut std::ffi::c_void, buf.len());
    }
}

/// Fills `out` with cryptographically secure random bytes. Backs the random
/// service's sole operation.
pub fn random_bytes(out: &mut [u8]) {
    unsafe {
        libsodium_sys::randombytes_buf(out.as_mut_ptr() as *mut std::ffi::c_void, out.len());
    }
}

/// Derives the session shared secret from a Diffie-Hellman exchange plus
/// both parties' key-nonces. Both the client and the server compute this
/// from the same raw scalar-multiplication result (DH is commutative) and
/// the same nonce ordering, so the derivation is independent of which side
/// calls it.
pub fn derive_shared_secret(
    our_private: &PrivateKey,
    their_public: &PublicKey,
    client_key_nonce: &[u8; NONCE_SIZE],
    server_key_nonce: &[u8; NONCE_SIZE],
) -> Option<[u8; KEY_SIZE]> {
    let mut dh = [0u8; 32];
    let rc = unsafe {
        libsodium_sys::crypto_scalarmult(
            dh.as_mut_ptr(),
            our_private.0.as_ptr(),
            their_public.0.as_ptr(),
        )
    };
    if rc != 0 {
        return None;
    }

    let mut state: libsodium_sys::crypto_generichash_state = unsafe { std::mem::zeroed() };
    let mut secret = [0u8; KEY_SIZE];
    unsafe {
        libsodium_sys::crypto_generichash_init(&mut state, std::ptr::null(), 0, KEY_SIZE);
        libsodium_sys::crypto_generichash_update(&mut state, dh.as_ptr(), dh.len() as u64);
        libsodium_sys::crypto_generichash_update(
            &mut state,
            client_key_nonce.as_ptr(),
            client_key_nonce.len() as u64,
        );
        libsodium_sys::crypto_generichash_update(
            &mut state,
            server_key_nonce.as_ptr(),
            server_key_nonce.len() as u64,
        );
        libsodium_sys::crypto_generichash_final(&mut state, secret.as_mut_ptr(), secret.len());
    }
    zero(&mut dh);
    Some(secret)
}

/// Keyed BLAKE2b MAC used for the unencrypted handshake-response record
/// (§4.4 message 2), not to be confused with the per-frame authed-packet MAC
/// below, which is a one-time Poly1305 tag.
pub fn short_mac(secret: &[u8; KEY_SIZE], data: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    unsafe {
        libsodium_sys::crypto_generichash(
            out.as_mut_ptr(),
            out.len(),
            data.as_ptr(),
            data.len() as u64,
            secret.as_ptr(),
            secret.len(),
        );
    }
    out
}

pub fn short_mac_verify(secret: &[u8; KEY_SIZE], data: &[u8], tag: &[u8]) -> bool {
    let expect = short_mac(secret, data);
    constant_time_eq(&expect, tag)
}

/// Unkeyed BLAKE2b-256 digest. Used by the canonization pipeline to derive a
/// block's `prev_block_hash` header field from the previous block's
/// certificate bytes.
pub fn hash_block(data: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    unsafe {
        libsodium_sys::crypto_generichash(
            out.as_mut_ptr(),
            out.len(),
            data.as_ptr(),
            data.len() as u64,
            std::ptr::null(),
            0,
        );
    }
    out
}

fn chacha_nonce(nonce: u64) -> [u8; CHACHA_NONCE_SIZE] {
    let mut buf = [0u8; CHACHA_NONCE_SIZE];
    (&mut buf[4..])
        .write_u64::<BigEndian>(nonce)
        .expect("nonce buffer is exactly 12 bytes");
    buf
}

/// Generates the first ChaCha20 keystream block for `(key, nonce)`; the
/// leading 32 bytes become the one-time Poly1305 key for the frame, per the
/// standard ChaCha20-Poly1305 construction. The message keystream itself
/// starts at block counter 1 so it never overlaps the Poly1305 subkey.
fn poly1305_subkey(key: &[u8; KEY_SIZE], nonce: &[u8; CHACHA_NONCE_SIZE]) -> [u8; 32] {
    let mut block = [0u8; CHACHA_BLOCK_SIZE];
    unsafe {
        libsodium_sys::crypto_stream_chacha20_ietf(
            block.as_mut_ptr(),
            block.len() as u64,
            nonce.as_ptr(),
            key.as_ptr(),
        );
    }
    let mut subkey = [0u8; 32];
    subkey.copy_from_slice(&block[..32]);
    subkey
}

/// Encrypts `plaintext` in place into a freshly allocated buffer of the same
/// length, continuing the keystream across the whole buffer in one call so
/// a header and payload encrypted together (as the authed-frame codec does)
/// share one continuous keystream (§4.1).
pub fn stream_encrypt(key: &[u8; KEY_SIZE], nonce: u64, plaintext: &[u8]) -> Vec<u8> {
    let nonce_bytes = chacha_nonce(nonce);
    let mut out = vec![0u8; plaintext.len()];
    unsafe {
        libsodium_sys::crypto_stream_chacha20_ietf_xor_ic(
            out.as_mut_ptr(),
            plaintext.as_ptr(),
            plaintext.len() as u64,
            nonce_bytes.as_ptr(),
            1,
            key.as_ptr(),
        );
    }
    out
}

/// Inverse of [`stream_encrypt`]; ChaCha20 is an involution so this is the
/// same operation under the hood, exposed separately for readability at
/// call sites.
pub fn stream_decrypt(key: &[u8; KEY_SIZE], nonce: u64, ciphertext: &[u8]) -> Vec<u8> {
    stream_encrypt(key, nonce, ciphertext)
}

/// Computes the one-time Poly1305 MAC over `data` (the encrypted header
/// concatenated with the encrypted payload, per §4.1).
pub fn authed_mac(key: &[u8; KEY_SIZE], nonce: u64, data: &[u8]) -> [u8; MAC_SIZE] {
    let nonce_bytes = chacha_nonce(nonce);
    let subkey = poly1305_subkey(key, &nonce_bytes);
    let mut mac = [0u8; MAC_SIZE];
    unsafe {
        libsodium_sys::crypto_onetimeauth_poly1305(
            mac.as_mut_ptr(),
            data.as_ptr(),
            data.len() as u64,
            subkey.as_ptr(),
        );
    }
    mac
}

/// Verifies an authed-frame MAC in constant time.
pub fn authed_mac_verify(key: &[u8; KEY_SIZE], nonce: u64, data: &[u8], mac: &[u8; MAC_SIZE]) -> bool {
    let nonce_bytes = chacha_nonce(nonce);
    let subkey = poly1305_subkey(key, &nonce_bytes);
    let rc = unsafe {
        libsodium_sys::crypto_onetimeauth_poly1305_verify(
            mac.as_ptr(),
            data.as_ptr(),
            data.len() as u64,
            subkey.as_ptr(),
        )
    };
    rc == 0
}

/// Constant-time byte comparison; callers must never short-circuit on a MAC
/// mismatch through ordinary slice equality (§4.1 decode_authed).
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    unsafe { libsodium_sys::sodium_memcmp(a.as_ptr() as *const _, b.as_ptr() as *const _, a.len()) == 0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dh_agreement_is_symmetric() {
        let client = generate_keypair();
        let server = generate_keypair();
        let client_nonce = [1u8; NONCE_SIZE];
        let server_nonce = [2u8; NONCE_SIZE];

        let from_client =
            derive_shared_secret(&client.private, &server.public, &client_nonce, &server_nonce).unwrap();
        let from_server =
            derive_shared_secret(&server.private, &client.public, &client_nonce, &server_nonce).unwrap();

        assert_eq!(from_client, from_server);
    }

    #[test]
    fn stream_roundtrip() {
        let key = [7u8; KEY_SIZE];
        let plaintext = b"type+size+payload concatenated";
        let cipher = stream_encrypt(&key, 1, plaintext);
        let back = stream_decrypt(&key, 1, &cipher);
        assert_eq!(back, plaintext);
    }

    #[test]
    fn mac_detects_tamper() {
        let key = [9u8; KEY_SIZE];
        let data = b"encrypted header || encrypted payload";
        let mac = authed_mac(&key, 3, data);
        assert!(authed_mac_verify(&key, 3, data, &mac));

        let mut tampered = *data;
        tampered[0] ^= 1;
        assert!(!authed_mac_verify(&key, 3, &tampered, &mac));
    }

    #[test]
    fn hash_block_is_deterministic_and_sensitive_to_input() {
        let a = hash_block(b"block cert bytes");
        let b = hash_block(b"block cert bytes");
        let c = hash_block(b"different cert bytes");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn short_mac_roundtrip() {
        let secret = [5u8; KEY_SIZE];
        let record = b"handshake response record";
        let tag = short_mac(&secret, record);
        assert!(short_mac_verify(&secret, record, &tag));
        assert!(!short_mac_verify(&secret, b"different record", &tag));
    }
}
