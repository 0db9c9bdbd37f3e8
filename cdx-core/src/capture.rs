//! Capture records and their binary codec
//!
//! A capture is one crawl observation of one URL, pointing into a WARC
//! file. Captures are keyed so that a raw byte comparison of two keys
//! orders them by `(urlkey ASC, timestamp ASC)`:
//!
//! ```text
//! key   = urlkey bytes | 0x00 | timestamp as big-endian u64
//! value = length-prefixed strings and fixed-width integers, stable order
//! ```
//!
//! The `0x00` separator stops a shorter urlkey from reading into a longer
//! one's timestamp bytes; big-endian integers give correct lexicographic
//! order. Decoders tolerate unknown trailing bytes so newer writers can
//! append fields.

use serde::{Deserialize, Serialize};

use crate::error::{CdxError, CdxResult};
use crate::ssurt;

/// Separator between the urlkey and timestamp portions of a capture key.
pub const KEY_SEPARATOR: u8 = 0x00;

/// One observation of one URL at one instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capture {
    /// SSURT of the captured URL
    pub urlkey: String,
    /// 14-digit UTC timestamp (yyyyMMddHHmmss) as an integer
    pub timestamp: u64,
    /// The URL as crawled
    pub original: String,
    pub mimetype: String,
    pub status: u16,
    pub digest: String,
    /// `-` when the capture is not a redirect
    pub redirecturl: String,
    /// `-` when no robots directives applied
    pub robotflags: String,
    /// Record length in bytes
    pub length: u64,
    /// Byte offset of the record within the WARC file
    pub offset: u64,
    /// WARC filename
    pub file: String,
}

impl Capture {
    /// Parse a legacy space-separated CDX line. The urlkey field is
    /// ignored and recomputed from the original URL. 11-field
    /// (`N b a m s k r M S V g`), 10-field (no robotflags) and 9-field
    /// (no robotflags or length) layouts are accepted.
    pub fn from_cdx_line(line: &str) -> CdxResult<Capture> {
        let fields: Vec<&str> = line.split(' ').filter(|f| !f.is_empty()).collect();
        if fields.len() < 9 || fields.len() > 11 {
            return Err(CdxError::BadCdxLine(format!(
                "expected 9-11 fields, got {}",
                fields.len()
            )));
        }

        let timestamp = parse_timestamp(fields[1])?;
        let original = fields[2].to_string();
        let urlkey = ssurt::ssurt(&original)?;
        let mimetype = fields[3].to_string();
        let status = parse_numeric_field(fields[4])? as u16;
        let digest = fields[5].to_string();
        let redirecturl = fields[6].to_string();

        let (robotflags, length, offset, file) = match fields.len() {
            11 => (
                fields[7].to_string(),
                parse_numeric_field(fields[8])?,
                parse_numeric_field(fields[9])?,
                fields[10].to_string(),
            ),
            10 => (
                "-".to_string(),
                parse_numeric_field(fields[7])?,
                parse_numeric_field(fields[8])?,
                fields[9].to_string(),
            ),
            _ => (
                "-".to_string(),
                0,
                parse_numeric_field(fields[7])?,
                fields[8].to_string(),
            ),
        };

        Ok(Capture {
            urlkey,
            timestamp,
            original,
            mimetype,
            status,
            digest,
            redirecturl,
            robotflags,
            length,
            offset,
            file,
        })
    }

    /// Encode the sort key for this capture.
    pub fn encode_key(&self) -> Vec<u8> {
        encode_key(&self.urlkey, self.timestamp)
    }

    /// Encode the value portion of this capture.
    pub fn encode_value(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            64 + self.original.len() + self.mimetype.len() + self.digest.len() + self.file.len(),
        );
        put_str(&mut out, &self.original);
        out.extend_from_slice(&self.status.to_be_bytes());
        put_str(&mut out, &self.mimetype);
        put_str(&mut out, &self.digest);
        put_str(&mut out, &self.redirecturl);
        put_str(&mut out, &self.robotflags);
        out.extend_from_slice(&self.length.to_be_bytes());
        out.extend_from_slice(&self.offset.to_be_bytes());
        put_str(&mut out, &self.file);
        out
    }

    /// Decode a capture from a key/value pair read back from the store.
    pub fn decode(key: &[u8], value: &[u8]) -> CdxResult<Capture> {
        let (urlkey, timestamp) = decode_key(key)?;
        let mut r = Reader::new(value);
        let original = r.take_str("original")?;
        let status = r.take_u16("status")?;
        let mimetype = r.take_str("mimetype")?;
        let digest = r.take_str("digest")?;
        let redirecturl = r.take_str("redirecturl")?;
        let robotflags = r.take_str("robotflags")?;
        let length = r.take_u64("length")?;
        let offset = r.take_u64("offset")?;
        let file = r.take_str("file")?;
        // anything after the file field belongs to a newer format version
        Ok(Capture {
            urlkey,
            timestamp,
            original,
            mimetype,
            status,
            digest,
            redirecturl,
            robotflags,
            length,
            offset,
            file,
        })
    }
}

/// Build a capture sort key from its parts.
pub fn encode_key(urlkey: &str, timestamp: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(urlkey.len() + 9);
    key.extend_from_slice(urlkey.as_bytes());
    key.push(KEY_SEPARATOR);
    key.extend_from_slice(&timestamp.to_be_bytes());
    key
}

/// Split a capture key back into `(urlkey, timestamp)`.
pub fn decode_key(key: &[u8]) -> CdxResult<(String, u64)> {
    if key.len() < 9 {
        return Err(CdxError::CorruptRecord(format!(
            "capture key too short: {} bytes",
            key.len()
        )));
    }
    let (urlkey_bytes, tail) = key.split_at(key.len() - 9);
    if tail[0] != KEY_SEPARATOR {
        return Err(CdxError::CorruptRecord("missing key separator".into()));
    }
    let urlkey = std::str::from_utf8(urlkey_bytes)
        .map_err(|_| CdxError::CorruptRecord("urlkey is not utf-8".into()))?
        .to_string();
    let timestamp = u64::from_be_bytes(tail[1..9].try_into().unwrap());
    Ok((urlkey, timestamp))
}

/// Parse a 14-digit yyyyMMddHHmmss timestamp. Shorter all-digit strings
/// are right-padded with zeros, as some legacy CDX producers truncate
/// trailing seconds.
pub fn parse_timestamp(s: &str) -> CdxResult<u64> {
    if s.is_empty() || s.len() > 14 || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(CdxError::BadTimestamp(s.to_string()));
    }
    let mut padded = s.to_string();
    while padded.len() < 14 {
        padded.push('0');
    }
    padded
        .parse::<u64>()
        .map_err(|_| CdxError::BadTimestamp(s.to_string()))
}

fn parse_numeric_field(s: &str) -> CdxResult<u64> {
    if s == "-" {
        return Ok(0);
    }
    s.parse::<u64>()
        .map_err(|_| CdxError::BadCdxLine(format!("expected number, got {:?}", s)))
}

fn put_str(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u32).to_be_bytes());
    out.extend_from_slice(s.as_bytes());
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn take(&mut self, n: usize, field: &str) -> CdxResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| CdxError::CorruptRecord(format!("truncated {} field", field)))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn take_u16(&mut self, field: &str) -> CdxResult<u16> {
        Ok(u16::from_be_bytes(self.take(2, field)?.try_into().unwrap()))
    }

    fn take_u64(&mut self, field: &str) -> CdxResult<u64> {
        Ok(u64::from_be_bytes(self.take(8, field)?.try_into().unwrap()))
    }

    fn take_str(&mut self, field: &str) -> CdxResult<String> {
        let len = u32::from_be_bytes(self.take(4, field)?.try_into().unwrap()) as usize;
        let bytes = self.take(len, field)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| CdxError::CorruptRecord(format!("{} field is not utf-8", field)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LINE11: &str = "- 20050614070159 http://www.example.com/ text/html 200 AAW6MV7D6UUEKBFYZ2QNTMWDGFCFNMDK - - 6107 441575 example.warc.gz";

    fn sample() -> Capture {
        Capture::from_cdx_line(LINE11).unwrap()
    }

    #[test]
    fn test_parse_cdx_line_11_fields() {
        let c = sample();
        assert_eq!("com,example,www,:80:http:/", c.urlkey);
        assert_eq!(20050614070159, c.timestamp);
        assert_eq!("http://www.example.com/", c.original);
        assert_eq!("text/html", c.mimetype);
        assert_eq!(200, c.status);
        assert_eq!("AAW6MV7D6UUEKBFYZ2QNTMWDGFCFNMDK", c.digest);
        assert_eq!("-", c.redirecturl);
        assert_eq!("-", c.robotflags);
        assert_eq!(6107, c.length);
        assert_eq!(441575, c.offset);
        assert_eq!("example.warc.gz", c.file);
    }

    #[test]
    fn test_parse_cdx_line_10_and_9_fields() {
        let c10 = Capture::from_cdx_line(
            "- 20050614070159 http://example.com/x text/html 200 DIGEST - 6107 441575 a.warc.gz",
        )
        .unwrap();
        assert_eq!("-", c10.robotflags);
        assert_eq!(6107, c10.length);
        assert_eq!(441575, c10.offset);

        let c9 = Capture::from_cdx_line(
            "- 20050614070159 http://example.com/x text/html 200 DIGEST - 441575 a.warc.gz",
        )
        .unwrap();
        assert_eq!(0, c9.length);
        assert_eq!(441575, c9.offset);
        assert_eq!("a.warc.gz", c9.file);
    }

    #[test]
    fn test_parse_cdx_line_rejects_garbage() {
        assert!(Capture::from_cdx_line("too few fields").is_err());
        assert!(Capture::from_cdx_line(
            "- notadate http://example.com/ text/html 200 D - - 1 2 f.warc.gz"
        )
        .is_err());
        assert!(Capture::from_cdx_line(
            "- 20050614070159 ://bad-url text/html 200 D - - 1 2 f.warc.gz"
        )
        .is_err());
    }

    #[test]
    fn test_dash_status_parses_as_zero() {
        let c = Capture::from_cdx_line(
            "- 20050614070159 http://example.com/ warc/revisit - DIGEST - - 540 10 a.warc.gz",
        )
        .unwrap();
        assert_eq!(0, c.status);
    }

    #[test]
    fn test_round_trip() {
        let c = sample();
        let decoded = Capture::decode(&c.encode_key(), &c.encode_value()).unwrap();
        assert_eq!(c, decoded);
    }

    #[test]
    fn test_decode_tolerates_trailing_bytes() {
        let c = sample();
        let mut value = c.encode_value();
        value.extend_from_slice(b"future fields");
        assert_eq!(c, Capture::decode(&c.encode_key(), &value).unwrap());
    }

    #[test]
    fn test_decode_truncated_is_corrupt() {
        let c = sample();
        let value = c.encode_value();
        let err = Capture::decode(&c.encode_key(), &value[..value.len() - 4]).unwrap_err();
        assert!(matches!(err, CdxError::CorruptRecord(_)));
    }

    #[test]
    fn test_key_orders_by_url_then_timestamp() {
        let t = 20200101000000;
        let a = encode_key("com,example,:80:http:/a", t);
        let b = encode_key("com,example,:80:http:/b", t);
        assert!(a < b);

        let early = encode_key("com,example,:80:http:/a", 20200101000000);
        let late = encode_key("com,example,:80:http:/a", 20210101000000);
        assert!(early < late);
    }

    #[test]
    fn test_key_separator_prevents_aliasing() {
        // a short urlkey with a large timestamp must not sort past a longer
        // urlkey that extends it
        let short = encode_key("com,example,:80:http:/a", u64::MAX);
        let long = encode_key("com,example,:80:http:/a/b", 0);
        assert!(short < long);
    }

    #[test]
    fn test_timestamp_padding() {
        assert_eq!(20050614000000, parse_timestamp("200506140000").unwrap());
        assert_eq!(20050614070159, parse_timestamp("20050614070159").unwrap());
        assert!(parse_timestamp("2005061407015900").is_err());
        assert!(parse_timestamp("20050614x70159").is_err());
    }
}
