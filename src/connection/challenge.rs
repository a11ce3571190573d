//! Handshake challenge answer.

use blake2::{Blake2s256, Digest};

const CHALLENGE_LABEL: &[u8] = b"tether-net v1 challenge";

/// Answer to a handshake challenge.
///
/// Mixes the responder's salt, sent in the CHALLENGE payload, with the
/// initiator's salt, carried in every bundle header the initiator sends.
/// An off-path sender that never saw the challenge cannot produce it.
pub fn challenge_answer(responder_salt: u64, initiator_salt: u64) -> u64 {
    let mut hasher = Blake2s256::new();
    hasher.update(CHALLENGE_LABEL);
    hasher.update(responder_salt.to_le_bytes());
    hasher.update(initiator_salt.to_le_bytes());
    let digest = hasher.finalize();

    let mut answer = [0u8; 8];
    answer.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(answer)
}
