//! Versioned files: a name mapped to aliased block-tree roots
//!
//! Wire layout:
//!
//! ```text
//! name_len u16 | name | count u16 | (alias_len u8 | alias | id_len u8 | id)*
//! ```

use fidias_common::{Error, Id, Result};
use std::collections::BTreeMap;

/// Alias of the visible version
pub const ACTIVE: &str = "active";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VersionedFile {
    pub name: String,
    pub versions: BTreeMap<String, Id>,
}

impl VersionedFile {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            versions: BTreeMap::new(),
        }
    }

    /// Root of the visible version
    #[must_use]
    pub fn active(&self) -> Option<&Id> {
        self.versions.get(ACTIVE)
    }

    pub fn set_active(&mut self, root: Id) {
        self.versions.insert(ACTIVE.to_string(), root);
    }

    /// Point `alias` at the current active root
    pub fn pin(&mut self, alias: &str) -> Result<()> {
        if alias == ACTIVE {
            return Err(Error::invalid_argument("cannot pin the active alias"));
        }
        let root = self
            .active()
            .cloned()
            .ok_or_else(|| Error::KeyNotFound(format!("{}@{}", self.name, ACTIVE)))?;
        self.versions.insert(alias.to_string(), root);
        Ok(())
    }

    pub fn marshal(&self) -> Result<Vec<u8>> {
        let too_long =
            |what: &str| Error::invalid_argument(format!("versioned file {what} too long"));
        let name_len = u16::try_from(self.name.len()).map_err(|_| too_long("name"))?;
        let count = u16::try_from(self.versions.len()).map_err(|_| too_long("version map"))?;

        let mut buf = Vec::new();
        buf.extend_from_slice(&name_len.to_be_bytes());
        buf.extend_from_slice(self.name.as_bytes());
        buf.extend_from_slice(&count.to_be_bytes());
        for (alias, id) in &self.versions {
            buf.push(u8::try_from(alias.len()).map_err(|_| too_long("alias"))?);
            buf.extend_from_slice(alias.as_bytes());
            buf.push(u8::try_from(id.len()).map_err(|_| too_long("id"))?);
            buf.extend_from_slice(id.as_bytes());
        }
        Ok(buf)
    }

    /// Parse a marshaled file; a file without versions is rejected
    pub fn unmarshal(buf: &[u8]) -> Result<Self> {
        let mut r = Reader { buf, pos: 0 };
        let name_len = usize::from(u16::from_be_bytes([r.byte()?, r.byte()?]));
        let name = r.string(name_len)?;
        let count = u16::from_be_bytes([r.byte()?, r.byte()?]);
        if count == 0 {
            return Err(Error::invalid_argument("versioned file without versions"));
        }
        let mut versions = BTreeMap::new();
        for _ in 0..count {
            let alias_len = usize::from(r.byte()?);
            let alias = r.string(alias_len)?;
            let id_len = usize::from(r.byte()?);
            versions.insert(alias, Id::from_slice(r.take(id_len)?));
        }
        if r.pos != buf.len() {
            return Err(Error::invalid_argument("trailing bytes after versioned file"));
        }
        Ok(Self { name, versions })
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let out = self
            .buf
            .get(self.pos..self.pos + n)
            .ok_or_else(|| Error::invalid_argument("truncated versioned file"))?;
        self.pos += n;
        Ok(out)
    }

    fn byte(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn string(&mut self, n: usize) -> Result<String> {
        String::from_utf8(self.take(n)?.to_vec())
            .map_err(|_| Error::invalid_argument("versioned file text is not UTF-8"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> VersionedFile {
        let mut f = VersionedFile::new("docs/report.txt");
        f.set_active(Id::new(vec![1; 32]));
        f.pin("v1").unwrap();
        f.set_active(Id::new(vec![2; 32]));
        f
    }

    #[test]
    fn test_marshal_roundtrip() {
        let f = sample();
        assert_eq!(VersionedFile::unmarshal(&f.marshal().unwrap()).unwrap(), f);
        assert_eq!(f.versions["v1"], Id::new(vec![1; 32]));
        assert_eq!(f.active(), Some(&Id::new(vec![2; 32])));
    }

    #[test]
    fn test_rejects_empty_and_truncated() {
        let empty = VersionedFile::new("x");
        assert!(VersionedFile::unmarshal(&empty.marshal().unwrap()).is_err());
        let mut buf = sample().marshal().unwrap();
        buf.pop();
        assert!(VersionedFile::unmarshal(&buf).is_err());
        buf.extend_from_slice(&[0, 0]);
        assert!(VersionedFile::unmarshal(&buf).is_err());
    }

    #[test]
    fn test_pin_requires_active() {
        let mut f = VersionedFile::new("x");
        assert!(f.pin("old").unwrap_err().is_not_found());
        f.set_active(Id::new(vec![3; 4]));
        assert!(f.pin(ACTIVE).is_err());
    }
}
