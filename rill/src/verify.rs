use sha1::{Digest, Sha1};
use crate::ID;

// SHA1 digest of a piece.
pub fn hash_piece(data: &[u8]) -> ID {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

pub fn verify_piece(data: &[u8], expected: &ID) -> bool {
    &hash_piece(data) == expected
}

// The info hash is the digest of the raw bencoded info dictionary, exactly
// as it was serialized.
pub fn hash_info(info_raw: &[u8]) -> ID {
    hash_piece(info_raw)
}
