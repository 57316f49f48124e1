//! Byte layouts used by the LMDB backend.
//!
//! Two formats live here: the tag-index key, which makes "every key stored
//! under tag T" a prefix scan, and the entry record, which keeps the expiry
//! and tag list next to the value so an overwrite can unhook the old tags.

/// Separator byte between the tag and the cache key in an index key.
/// Neither tag strings nor cache keys may contain it.
const SEPARATOR: u8 = 0x00;

/// Length of the fixed record header: expiry (8 bytes) + tag block length (4 bytes).
const HEADER_LEN: usize = 12;

/// Tag-index key: `[tag bytes][0x00][cache key bytes]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TagIndexKey {
    tag: String,
    key: String,
}

impl TagIndexKey {
    pub fn new(tag: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            key: key.into(),
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.tag.len() + 1 + self.key.len());
        bytes.extend_from_slice(self.tag.as_bytes());
        bytes.push(SEPARATOR);
        bytes.extend_from_slice(self.key.as_bytes());
        bytes
    }

    /// Decode an index key. Returns `None` when the separator is missing or
    /// either half is not UTF-8.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let split = bytes.iter().position(|b| *b == SEPARATOR)?;
        let tag = std::str::from_utf8(&bytes[..split]).ok()?;
        let key = std::str::from_utf8(&bytes[split + 1..]).ok()?;
        Some(Self::new(tag, key))
    }

    /// Prefix shared by every index key for `tag`.
    pub fn tag_prefix(tag: &str) -> Vec<u8> {
        let mut prefix = Vec::with_capacity(tag.len() + 1);
        prefix.extend_from_slice(tag.as_bytes());
        prefix.push(SEPARATOR);
        prefix
    }
}

/// True when `raw` can be used as a tag or cache key in the index.
pub fn is_indexable(raw: &str) -> bool {
    !raw.as_bytes().contains(&SEPARATOR)
}

/// A stored entry: `[expires_at millis: i64 LE][tag block len: u32 LE][tags, 0x00-separated][value]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryRecord {
    pub expires_at_millis: i64,
    pub tags: Vec<String>,
    pub value: Vec<u8>,
}

impl EntryRecord {
    pub fn encode(&self) -> Vec<u8> {
        let tag_block = self.tags.join("\0");
        let tag_len = u32::try_from(tag_block.len()).unwrap_or(u32::MAX);

        let mut bytes = Vec::with_capacity(HEADER_LEN + tag_block.len() + self.value.len());
        bytes.extend_from_slice(&self.expires_at_millis.to_le_bytes());
        bytes.extend_from_slice(&tag_len.to_le_bytes());
        bytes.extend_from_slice(tag_block.as_bytes());
        bytes.extend_from_slice(&self.value);
        bytes
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < HEADER_LEN {
            return None;
        }
        let expires_at_millis = i64::from_le_bytes(bytes[0..8].try_into().ok()?);
        let tag_len = u32::from_le_bytes(bytes[8..12].try_into().ok()?) as usize;
        let tag_end = HEADER_LEN.checked_add(tag_len)?;
        if bytes.len() < tag_end {
            return None;
        }

        let tag_block = std::str::from_utf8(&bytes[HEADER_LEN..tag_end]).ok()?;
        let tags = if tag_block.is_empty() {
            Vec::new()
        } else {
            tag_block.split('\0').map(str::to_string).collect()
        };

        Some(Self {
            expires_at_millis,
            tags,
            value: bytes[tag_end..].to_vec(),
        })
    }

    pub fn is_expired_at(&self, now_millis: i64) -> bool {
        now_millis >= self.expires_at_millis
    }
}
