//! Name hashing and table encryption used by the map container format.
//!
//! The container never stores file names, only three independent hashes of each
//! name (a home-slot hash and two verification hashes). Everything here works on a
//! resumable [`HashState`] so a caller can hash a prefix once and keep feeding
//! suffixes onto copies of the saved state.

const fn generate_crypt_table() -> [u32; 0x500] {
    let mut table = [0u32; 0x500];
    let mut seed: u32 = 0x0010_0001;

    let mut index_a = 0;
    while index_a < 256 {
        let mut index_b = index_a;
        let mut i = 0;
        while i < 5 {
            seed = (seed * 125 + 3) % 0x002A_AAAB;
            let high = (seed & 0xFFFF) << 16;
            seed = (seed * 125 + 3) % 0x002A_AAAB;
            let low = seed & 0xFFFF;

            table[index_b] = high | low;

            i += 1;
            index_b += 256;
        }

        index_a += 1;
    }

    table
}

pub(crate) const CRYPT_TABLE: [u32; 0x500] = generate_crypt_table();

/// Which slice of the crypt table a hash is computed against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Home slot of a name in the hash table.
    TableOffset,
    /// First verification hash stored in a hash table entry.
    NameA,
    /// Second verification hash stored in a hash table entry.
    NameB,
    /// Encryption key for tables and encrypted payloads.
    FileKey,
}

impl Channel {
    const fn table_offset(self) -> usize {
        match self {
            Channel::TableOffset => 0x000,
            Channel::NameA => 0x100,
            Channel::NameB => 0x200,
            Channel::FileKey => 0x300,
        }
    }
}

#[inline]
fn normalize_byte(byte: u8) -> u8 {
    match byte {
        b'/' => b'\\',
        _ => byte.to_ascii_uppercase(),
    }
}

/// The two accumulators of a single-channel hash, captured after some prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashState {
    channel: Channel,
    pub hash: u32,
    pub seed: u32,
}

impl HashState {
    pub const fn new(channel: Channel) -> Self {
        Self {
            channel,
            hash: 0x7FED_7FED,
            seed: 0xEEEE_EEEE,
        }
    }

    #[inline]
    pub fn feed_byte(&mut self, byte: u8) {
        let c = normalize_byte(byte) as u32;
        self.hash = CRYPT_TABLE[self.channel.table_offset() + c as usize]
            ^ self.hash.wrapping_add(self.seed);
        self.seed = c
            .wrapping_add(self.hash)
            .wrapping_add(self.seed)
            .wrapping_add(self.seed << 5)
            .wrapping_add(3);
    }

    pub fn feed(mut self, bytes: &[u8]) -> Self {
        for &byte in bytes {
            self.feed_byte(byte);
        }
        self
    }

    pub fn finish(self) -> u32 {
        self.hash
    }
}

pub fn hash(text: &str, channel: Channel) -> u32 {
    HashState::new(channel).feed(text.as_bytes()).finish()
}

/// Both verification hashes of a name packed as `name_a | name_b << 32`.
pub type Fingerprint = u64;

pub fn fingerprint_of(name_a: u32, name_b: u32) -> Fingerprint {
    (name_a as u64) | ((name_b as u64) << 32)
}

pub fn fingerprint(text: &str) -> Fingerprint {
    NamePair::new().feed(text.as_bytes()).fingerprint()
}

/// Channel A and channel B states advanced together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NamePair {
    a: HashState,
    b: HashState,
}

impl Default for NamePair {
    fn default() -> Self {
        Self::new()
    }
}

impl NamePair {
    pub const fn new() -> Self {
        Self {
            a: HashState::new(Channel::NameA),
            b: HashState::new(Channel::NameB),
        }
    }

    #[inline]
    pub fn feed_byte(&mut self, byte: u8) {
        self.a.feed_byte(byte);
        self.b.feed_byte(byte);
    }

    pub fn feed(mut self, bytes: &[u8]) -> Self {
        for &byte in bytes {
            self.feed_byte(byte);
        }
        self
    }

    pub fn fingerprint(&self) -> Fingerprint {
        fingerprint_of(self.a.hash, self.b.hash)
    }
}

fn next_key(key: u32) -> u32 {
    ((!key << 0x15).wrapping_add(0x1111_1111)) | (key >> 0x0B)
}

/// Decrypts `words` in place with the stream cipher keyed by `key`.
pub fn decrypt_u32s(words: &mut [u32], mut key: u32) {
    let mut seed: u32 = 0xEEEE_EEEE;
    for word in words.iter_mut() {
        seed = seed.wrapping_add(CRYPT_TABLE[0x400 + (key & 0xFF) as usize]);
        let plain = *word ^ key.wrapping_add(seed);
        key = next_key(key);
        seed = plain
            .wrapping_add(seed)
            .wrapping_add(seed << 5)
            .wrapping_add(3);
        *word = plain;
    }
}

pub fn encrypt_u32s(words: &mut [u32], mut key: u32) {
    let mut seed: u32 = 0xEEEE_EEEE;
    for word in words.iter_mut() {
        seed = seed.wrapping_add(CRYPT_TABLE[0x400 + (key & 0xFF) as usize]);
        let plain = *word;
        *word = plain ^ key.wrapping_add(seed);
        key = next_key(key);
        seed = plain
            .wrapping_add(seed)
            .wrapping_add(seed << 5)
            .wrapping_add(3);
    }
}

/// Byte-oriented wrapper over [`decrypt_u32s`]; trailing bytes that do not fill a
/// whole word are left untouched, matching the format.
pub fn decrypt_bytes(data: &mut [u8], key: u32) {
    let whole = data.len() / 4 * 4;
    let mut words: Vec<u32> = data[..whole]
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    decrypt_u32s(&mut words, key);
    for (chunk, word) in data[..whole].chunks_exact_mut(4).zip(words) {
        chunk.copy_from_slice(&word.to_le_bytes());
    }
}

/// Key for an encrypted payload. Only the final path component takes part.
pub fn file_key(name: &str, block_offset: u32, file_size: u32, adjusted: bool) -> u32 {
    let base = name.rsplit(['\\', '/']).next().unwrap_or(name);
    let key = hash(base, Channel::FileKey);
    if adjusted {
        key.wrapping_add(block_offset) ^ file_size
    } else {
        key
    }
}
