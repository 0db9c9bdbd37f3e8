//! Alias records
//!
//! An alias is a directed canonicalisation equivalence between two
//! SSURTs. At query time a lookup on the alias is rewritten to the
//! target; at output time captures found under the target are
//! re-labelled with the originally requested URL. Resolution is a single
//! hop: aliases of aliases are not chased.

use serde::{Deserialize, Serialize};

use crate::error::{CdxError, CdxResult};

/// A directed `alias -> target` equivalence between two SSURTs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alias {
    pub alias: String,
    pub target: String,
}

impl Alias {
    /// Decode an alias from a key/value pair read back from the store.
    pub fn decode(key: &[u8], value: &[u8]) -> CdxResult<Alias> {
        let alias = std::str::from_utf8(key)
            .map_err(|_| CdxError::CorruptRecord("alias key is not utf-8".into()))?;
        let target = std::str::from_utf8(value)
            .map_err(|_| CdxError::CorruptRecord("alias target is not utf-8".into()))?;
        Ok(Alias {
            alias: alias.to_string(),
            target: target.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode() {
        let a = Alias::decode(
            b"com,example,www,:80:http:/".as_slice(),
            b"com,example,:80:http:/".as_slice(),
        )
        .unwrap();
        assert_eq!("com,example,www,:80:http:/", a.alias);
        assert_eq!("com,example,:80:http:/", a.target);
    }

    #[test]
    fn test_decode_rejects_non_utf8() {
        assert!(Alias::decode(&[0xff, 0xfe], b"x").is_err());
    }
}
