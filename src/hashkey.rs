//! Key hashing: hash-tag extraction, slot selection, pool index mixing.

use crate::models::MAX_SLOT_NUM;
use crate::resp::RespFrame;
use crc::{Crc, CRC_32_ISO_HDLC};
use std::hash::Hasher;
use twox_hash::XxHash64;

static CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Ops whose first key sits at argument index 3 rather than 1.
const KEY_AT_THIRD: [&[u8]; 4] = [b"ZINTERSTORE", b"ZUNIONSTORE", b"EVAL", b"EVALSHA"];

/// Extract the hash tag: the bytes between the first `{` and the first
/// subsequent `}`, or the whole key when no such pair exists. Co-locating
/// keys that share a tag lets multi-key commands stay on one slot.
pub fn hash_tag(key: &[u8]) -> &[u8] {
    if let Some(beg) = key.iter().position(|&b| b == b'{') {
        if let Some(end) = key[beg + 1..].iter().position(|&b| b == b'}') {
            return &key[beg + 1..beg + 1 + end];
        }
    }
    key
}

/// The hash key of a parsed command: the hash tag of its first key
/// argument, or empty when the command has no key.
pub fn hash_key<'a>(multi: &'a [RespFrame], op: &[u8]) -> &'a [u8] {
    let index = if KEY_AT_THIRD.contains(&op) { 3 } else { 1 };
    match multi.get(index) {
        Some(RespFrame::Bulk(Some(key))) => hash_tag(key),
        _ => b"",
    }
}

/// Map a hash key onto the fixed slot space.
pub fn slot_of(hkey: &[u8]) -> usize {
    CRC32.checksum(hkey) as usize % MAX_SLOT_NUM
}

/// Pick a connection index for `(database, seed)`. Pins one client's
/// stream to one connection while fanning different clients out across
/// the pool.
pub(crate) fn pool_index(database: u32, seed: u64, parallel: usize) -> usize {
    if parallel <= 1 {
        return 0;
    }
    let mut hasher = XxHash64::with_seed(seed);
    hasher.write_u32(database);
    (hasher.finish() % parallel as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_between_braces() {
        assert_eq!(hash_tag(b"{user1000}.following"), b"user1000");
        assert_eq!(hash_tag(b"foo{bar}baz"), b"bar");
    }

    #[test]
    fn whole_key_without_braces() {
        assert_eq!(hash_tag(b"plain-key"), b"plain-key");
        assert_eq!(hash_tag(b"unclosed{brace"), b"unclosed{brace");
    }

    #[test]
    fn empty_tag_is_kept() {
        assert_eq!(hash_tag(b"{}key"), b"");
    }

    #[test]
    fn key_index_depends_on_op() {
        let multi = vec![
            RespFrame::bulk("EVAL"),
            RespFrame::bulk("return 1"),
            RespFrame::bulk("1"),
            RespFrame::bulk("thekey"),
        ];
        assert_eq!(hash_key(&multi, b"EVAL"), b"thekey");

        let multi = vec![RespFrame::bulk("GET"), RespFrame::bulk("foo")];
        assert_eq!(hash_key(&multi, b"GET"), b"foo");
    }

    #[test]
    fn missing_key_argument_hashes_empty() {
        let multi = vec![RespFrame::bulk("PING")];
        assert_eq!(hash_key(&multi, b"PING"), b"");
    }

    #[test]
    fn slot_is_stable_and_bounded() {
        let a = slot_of(b"foo");
        assert_eq!(a, slot_of(b"foo"));
        assert!(a < MAX_SLOT_NUM);
        // Keys sharing a tag land on the same slot.
        assert_eq!(slot_of(hash_tag(b"{tag}.a")), slot_of(hash_tag(b"{tag}.b")));
    }

    #[test]
    fn pool_index_pins_clients() {
        let i = pool_index(0, 42, 8);
        assert_eq!(i, pool_index(0, 42, 8));
        assert!(i < 8);
        assert_eq!(pool_index(3, 7, 1), 0);
    }
}
