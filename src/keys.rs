//! Format-A (.ofp) key material: the candidate keyset table, the byte
//! primitives behind it, and the first-match resolver.
//!
//! # Identity rules
//! Every historical release of the vendor's packaging tool embedded a triple
//! of 16-byte constants: a masking key (`mc`), a "user key" and an "ivec".
//! The real AES key/IV are derived from those at runtime (see
//! [`KeySet::derive`]).  Nothing in the container says which tool produced
//! it, so the table below is tried **in declared order** and the first row
//! whose decryption of the manifest ciphertext contains `<?xml` wins.  The
//! order is load-bearing: there is no scoring, only first-match.

use thiserror::Error;

use crate::crypto::aes_cfb_decrypt;
use crate::LogFn;

#[derive(Error, Debug)]
pub enum KeyError {
    #[error("no candidate key decrypts the manifest to XML — unsupported packaging tool version")]
    NotFound,
}

// ── Byte primitives ──────────────────────────────────────────────────────────

/// Nibble swap.  An involution: `swap(swap(b)) == b`.
#[inline]
pub fn swap(b: u8) -> u8 {
    (b << 4) | (b >> 4)
}

/// XOR each byte against `mask`, then nibble-swap the result.
pub fn deobfuscate(data: &[u8; 16], mask: &[u8; 16]) -> [u8; 16] {
    let mut out = [0u8; 16];
    for (o, (d, m)) in out.iter_mut().zip(data.iter().zip(mask.iter())) {
        *o = swap(d ^ m);
    }
    out
}

/// Inverse of [`deobfuscate`]: nibble-swap first, then XOR.  Used by the
/// fixture builders in the test suite.
pub fn obfuscate(data: &[u8; 16], mask: &[u8; 16]) -> [u8; 16] {
    let mut out = [0u8; 16];
    for (o, (d, m)) in out.iter_mut().zip(data.iter().zip(mask.iter())) {
        *o = swap(*d) ^ m;
    }
    out
}

/// The `generatekey1` shuffle: XOR-then-swap in strides of four bytes.
/// Byte-for-byte this equals [`deobfuscate`]; it is kept as its own function
/// because the vendor tool carries both and they could diverge again.
fn key_shuffle(key: &[u8; 16], hkey: &[u8; 16]) -> [u8; 16] {
    let mut out = *key;
    for i in (0..16).step_by(4) {
        for j in i..i + 4 {
            out[j] = swap(hkey[j] ^ out[j]);
        }
    }
    out
}

/// MD5 the material, hex-encode the digest, keep the first 16 characters.
///
/// The resulting cipher key is the ASCII spelling of half the digest, not
/// the raw digest bytes.  This matches the vendor tool exactly.
fn md5_key(material: &[u8; 16]) -> [u8; 16] {
    let digest = md5::compute(material);
    let hex16 = hex::encode(&digest.0[..8]);
    let mut out = [0u8; 16];
    out.copy_from_slice(hex16.as_bytes());
    out
}

// ── Keyset table ─────────────────────────────────────────────────────────────

/// One row of the Format-A key-derivation table: the constants embedded in
/// one historical vendor-tool version.
#[derive(Debug, Clone, Copy)]
pub struct KeySet {
    /// Tool version label, reported on a successful match.
    pub version: &'static str,
    mc:      &'static str,
    userkey: &'static str,
    ivec:    &'static str,
}

/// AES key/IV pair derived from one [`KeySet`].  Deterministic — the same
/// row always derives the same pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DerivedKey {
    pub key: [u8; 16],
    pub iv:  [u8; 16],
}

/// Candidate rows in trial order.  Do NOT reorder: the first row producing
/// XML-looking plaintext is accepted, and several rows are close relatives.
pub const KEY_SETS: [KeySet; 14] = [
    KeySet { version: "V1.4.17/1.4.27",
             mc:      "27827963787265EF89D126B69A495A21",
             userkey: "82C50203285A2CE7D8C3E198383CE94C",
             ivec:    "422DD5399181E223813CD8ECDF2E4D72" },
    KeySet { version: "V1.6.17",
             mc:      "E11AA7BB558A436A8375FD15DDD4651F",
             userkey: "77DDF6A0696841F6B74782C097835169",
             ivec:    "A739742384A44E8BA45207AD5C3700EA" },
    KeySet { version: "V1.5.13",
             mc:      "67657963787565E837D226B69A495D21",
             userkey: "F6C50203515A2CE7D8C3E1F938B7E94C",
             ivec:    "42F2D5399137E2B2813CD8ECDF2F4D72" },
    KeySet { version: "V1.6.6/1.6.9/1.6.17/1.6.24/1.6.26/1.7.6",
             mc:      "3C2D518D9BF2E4279DC758CD535147C3",
             userkey: "87C74A29709AC1BF2382276C4E8DF232",
             ivec:    "598D92E967265E9BCABE2469FE4A915E" },
    KeySet { version: "V1.7.2",
             mc:      "8FB8FB261930260BE945B841AEFA9FD4",
             userkey: "E529E82B28F5A2F8831D860AE39E425D",
             ivec:    "8A09DA60ED36F125D64709973372C1CF" },
    KeySet { version: "V2.0.3",
             mc:      "E8AE288C0192C54BF10C5707E9C4705B",
             userkey: "D64FC385DCD52A3C9B5FBA8650F92EDA",
             ivec:    "79051FD8D8B6297E2E4559E997F63B7F" },
    KeySet { version: "MTK-1",
             mc:      "9E4F32639D21357D37D226B69A495D21",
             userkey: "A3D8D358E42F5A9E931DD3917D9A3218",
             ivec:    "386935399137416B67416BECF22F519A" },
    KeySet { version: "MTK-2",
             mc:      "892D57E92A4D8A975E3C216B7C9DE189",
             userkey: "D26DF2D9913785B145D18C7219B89F26",
             ivec:    "516989E4A1BFC78B365C6BC57D944391" },
    KeySet { version: "MTK-3",
             mc:      "3C4A618D9BF2E4279DC758CD535147C3",
             userkey: "87B13D29709AC1BF2382276C4E8DF232",
             ivec:    "59B7A8E967265E9BCABE2469FE4A915E" },
    KeySet { version: "MTK-4",
             mc:      "1C3288822BF824259DC852C1733127D3",
             userkey: "E7918D22799181CF2312176C9E2DF298",
             ivec:    "3247F889A7B6DECBCA3E28693E4AAAFE" },
    KeySet { version: "MTK-5",
             mc:      "1E4F32239D65A57D37D2266D9A775D43",
             userkey: "A332D3C3E42F5A3E931DD991729A321D",
             ivec:    "3F2A35399A373377674155ECF28FD19A" },
    KeySet { version: "MTK-6",
             mc:      "122D57E92A518AFF5E3C786B7C34E189",
             userkey: "DD6DF2D9543785674522717219989FB0",
             ivec:    "12698965A132C76136CC88C5DD94EE91" },
    KeySet { version: "V2.1.x",
             mc:      "D4D2CD61D4D2CD61D4D2CD61D4D2CD61",
             userkey: "D4D2CD61D4D2CD61D4D2CD61D4D2CD61",
             ivec:    "D4D2CD61D4D2CD61D4D2CD61D4D2CD61" },
    KeySet { version: "V3.0.x",
             mc:      "2442CE821A4F352D44D2CE8D1A4F352D",
             userkey: "2442CE821A4F352D44D2CE8D1A4F352D",
             ivec:    "2442CE821A4F352D44D2CE8D1A4F352D" },
];

impl KeySet {
    /// Derive the AES key/IV for this row.
    pub fn derive(&self) -> DerivedKey {
        let mc = unhex16(self.mc);
        DerivedKey {
            key: md5_key(&deobfuscate(&unhex16(self.userkey), &mc)),
            iv:  md5_key(&deobfuscate(&unhex16(self.ivec), &mc)),
        }
    }
}

/// Hard-coded fallback derivation tried after the whole table fails.
/// Shuffles two fixed constants against a third with [`key_shuffle`].
pub fn generate_key1() -> DerivedKey {
    let key1 = unhex16("42F2D5399137E2B2813CD8ECDF2F4D72");
    let key2 = unhex16("F6C50203515A2CE7D8C3E1F938B7E94C");
    let key3 = unhex16("67657963787565E837D226B69A495D21");
    DerivedKey {
        key: md5_key(&key_shuffle(&key2, &key3)),
        iv:  md5_key(&key_shuffle(&key1, &key3)),
    }
}

// Table constants are 32 hex characters by construction.
fn unhex16(s: &str) -> [u8; 16] {
    let mut out = [0u8; 16];
    if let Ok(bytes) = hex::decode(s) {
        out.copy_from_slice(&bytes);
    }
    out
}

// ── Resolver ─────────────────────────────────────────────────────────────────

/// A successful key trial: the decrypted manifest plus the key material
/// needed later for per-entry decryption.
#[derive(Debug, Clone)]
pub struct KeyMatch {
    /// Version label of the winning candidate (`"generatekey1"` for the
    /// fallback derivation).
    pub version: &'static str,
    pub key:     [u8; 16],
    pub iv:      [u8; 16],
    pub xml:     String,
}

/// Try every candidate against the manifest ciphertext; first match wins.
///
/// Acceptance is purely empirical: the plaintext must contain `<?xml`.  On a
/// match the text is truncated at its last `>` to drop whatever padding
/// trails the closing tag.
pub fn resolve(ciphertext: &[u8], log: &LogFn) -> Result<KeyMatch, KeyError> {
    let attempts = KEY_SETS
        .iter()
        .map(|ks| (ks.version, ks.derive()))
        .chain(std::iter::once(("generatekey1", generate_key1())));

    for (version, dk) in attempts {
        log(&format!(
            "Trying {version}: key={} iv={}",
            String::from_utf8_lossy(&dk.key),
            String::from_utf8_lossy(&dk.iv),
        ));
        let plain = aes_cfb_decrypt(ciphertext, &dk.key, &dk.iv);
        let text = String::from_utf8_lossy(&plain).into_owned();
        if !text.contains("<?xml") {
            continue;
        }
        log(&format!("Found key: {version}"));
        let xml = match text.rfind('>') {
            Some(i) if i > 0 => text[..=i].to_string(),
            _ => text,
        };
        return Ok(KeyMatch { version, key: dk.key, iv: dk.iv, xml });
    }

    log("No matching key found for this container");
    Err(KeyError::NotFound)
}

// ── Tests ────────────────────────────────────────────────────────────────────
