/// SHA-1 digest of a piece.
#[derive(Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Sha1(pub(crate) [u8; 20]);

impl Sha1 {
    pub fn hash(buf: &[u8]) -> Sha1 {
        use sha1::Digest;
        let mut hasher = sha1::Sha1::default();
        hasher.update(buf);
        Sha1(hasher.finalize().into())
    }

    pub fn from_bytes(bytes: [u8; 20]) -> Sha1 {
        Sha1(bytes)
    }

    /// Parse a 40 character hex digest.
    pub fn from_hex(hex: &str) -> Option<Sha1> {
        if hex.len() != 40 || !hex.is_ascii() {
            return None;
        }
        let mut out = [0u8; 20];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).ok()?;
        }
        Some(Sha1(out))
    }
}

impl From<[u8; 20]> for Sha1 {
    fn from(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }
}

impl std::fmt::Debug for Sha1 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Sha1({self})")
    }
}

impl std::fmt::Display for Sha1 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for v in self.0 {
            write!(f, "{:02x}", v)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn known_digest() {
        let hash = Sha1::hash(b"abc");
        insta::assert_snapshot!(hash.to_string(), @"a9993e364706816aba3e25717850c26c9cd0d89d");
    }

    #[test]
    fn hex_parsing() {
        let hash = Sha1::hash(b"bitswarm");
        assert_eq!(Sha1::from_hex(&hash.to_string()), Some(hash));
        assert_eq!(Sha1::from_hex("abc"), None);
        assert_eq!(Sha1::from_hex(&"zz".repeat(20)), None);
    }
}
