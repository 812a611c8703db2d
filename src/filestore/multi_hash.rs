//! One-pass fan-out over the fixed digest set.

use std::collections::HashMap;

use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};

/// Digests every upload carries: md5, sha1, sha256, sha512.
pub struct MultiHash {
    md5: Md5,
    sha1: Sha1,
    sha256: Sha256,
    sha512: Sha512,
}

impl MultiHash {
    pub fn new() -> Self {
        Self {
            md5: Md5::new(),
            sha1: Sha1::new(),
            sha256: Sha256::new(),
            sha512: Sha512::new(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.md5.update(data);
        self.sha1.update(data);
        self.sha256.update(data);
        self.sha512.update(data);
    }

    pub fn finish(self) -> HashMap<String, String> {
        let mut hashes = HashMap::with_capacity(4);
        hashes.insert("md5".to_string(), hex::encode(self.md5.finalize()));
        hashes.insert("sha1".to_string(), hex::encode(self.sha1.finalize()));
        hashes.insert("sha256".to_string(), hex::encode(self.sha256.finalize()));
        hashes.insert("sha512".to_string(), hex::encode(self.sha512.finalize()));
        hashes
    }
}

impl Default for MultiHash {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_digests_of_hello() {
        let mut hashes = MultiHash::new();
        hashes.update(b"hello");
        let result = hashes.finish();

        assert_eq!(result["md5"], "5d41402abc4b2a76b9719d911017c592");
        assert_eq!(result["sha1"], "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d");
        assert_eq!(
            result["sha256"],
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(result["sha512"].len(), 128);
    }

    #[test]
    fn updates_accumulate() {
        let mut split = MultiHash::new();
        split.update(b"he");
        split.update(b"llo");

        let mut whole = MultiHash::new();
        whole.update(b"hello");

        assert_eq!(split.finish(), whole.finish());
    }
}
