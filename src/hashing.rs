//! Content hashing shared by the cache, checkpoints, and manifests.
//!
//! Every hash in the crate is blake3 rendered as lowercase hex, so identical
//! bytes hash identically across files, runs, and machines.

pub fn hash_bytes(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

pub fn hash_text(text: &str) -> String {
    hash_bytes(text.as_bytes())
}

/// Hash an ordered list of fields with a separator so that
/// `["ab", "c"]` and `["a", "bc"]` never collide.
pub fn hash_fields(fields: &[&str]) -> String {
    let mut hasher = blake3::Hasher::new();
    for (idx, field) in fields.iter().enumerate() {
        if idx > 0 {
            hasher.update(b"|");
        }
        hasher.update(&(field.len() as u64).to_le_bytes());
        hasher.update(field.as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

/// First `len` hex chars of a hash, for file names and run ids.
pub fn short_hash(hash: &str, len: usize) -> &str {
    let end = hash
        .char_indices()
        .nth(len)
        .map(|(i, _)| i)
        .unwrap_or(hash.len());
    &hash[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_fields_is_boundary_sensitive() {
        assert_ne!(hash_fields(&["ab", "c"]), hash_fields(&["a", "bc"]));
        assert_eq!(hash_fields(&["a", "b"]), hash_fields(&["a", "b"]));
    }

    #[test]
    fn identical_bytes_hash_identically() {
        assert_eq!(hash_bytes(b"fn main() {}"), hash_text("fn main() {}"));
        assert_eq!(short_hash(&hash_text("x"), 8).len(), 8);
        assert_eq!(short_hash("abc", 8), "abc");
    }
}
