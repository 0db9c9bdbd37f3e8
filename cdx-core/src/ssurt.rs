//! SSURT canonicalisation
//!
//! Transforms `scheme://userinfo@domain.tld:port/path?query#fragment` into
//! the sort-friendly form
//!
//! ```text
//! tld,domain,:port:scheme:userinfo/path?query
//! ```
//!
//! so that URLs from the same domain sort together, URLs on the same port
//! but different schemes sort together, and prefix scans work for domain,
//! host, port and userinfo wildcards alike. IPv4 hosts and bracketed IPv6
//! hosts are kept verbatim rather than reversed, which makes subnet
//! prefixes like `10.` work unchanged.
//!
//! Port, scheme and userinfo are mandatory in the canonical form, but
//! userinfo is allowed to be blank. There is no such thing as a relative
//! SSURT. Fragments are dropped.
//!
//! Canonicalisation rules, in order:
//! - host: collapse `..` to `.`, strip trailing `.`, IDN to ASCII,
//!   lowercase, canonical percent encoding
//! - port: scheme default when absent, leading zeros removed
//! - scheme: lowercase
//! - path: empty becomes `/`, canonical percent encoding
//! - query: canonical percent encoding
//!
//! IP addresses are not otherwise normalised (no IPv6 mapping, no `::`
//! expansion); see the pattern grammar tests for the exact contract.

use crate::error::{CdxError, CdxResult};

/// Sentinel appended to an exact-URL pattern so the resulting prefix cannot
/// match any longer URL. Sorts below every byte a canonical SSURT can
/// contain, because canonical percent encoding escapes 0x20 and below.
pub const EXACT_SENTINEL: char = ' ';

/// A URL split into the components SSURT cares about. Fragment is dropped
/// at parse time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitUrl {
    pub scheme: String,
    pub userinfo: String,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub query: Option<String>,
}

/// Canonicalise a URL to its SSURT form.
pub fn ssurt(url: &str) -> CdxResult<String> {
    let split = split_url(url)?;
    let mut out = sshost(&split.host)?;
    out.push(':');
    out.push_str(&split.port.to_string());
    out.push(':');
    out.push_str(&split.scheme);
    out.push(':');
    out.push_str(&split.userinfo);
    if split.path.is_empty() {
        out.push('/');
    } else {
        out.push_str(&canonical_percent_encode(&split.path));
    }
    if let Some(query) = &split.query {
        out.push('?');
        out.push_str(&canonical_percent_encode(query));
    }
    Ok(out)
}

/// Scan prefix matching every capture on the URL's host, regardless of
/// port, scheme and userinfo.
pub fn host_prefix(url: &str) -> CdxResult<String> {
    let split = split_url(url)?;
    let mut out = sshost(&split.host)?;
    out.push(':');
    Ok(out)
}

/// Scan prefix matching every capture on the URL's domain and all its
/// subdomains. For IP hosts this degrades to a host prefix.
pub fn domain_prefix(url: &str) -> CdxResult<String> {
    let split = split_url(url)?;
    let host = canonicalize_host(&split.host)?;
    if is_ip_host(&host) {
        Ok(format!("{}:", host))
    } else {
        Ok(reverse_domain(&host))
    }
}

/// Convert a URL pattern into an SSURT range-scan prefix.
///
/// | Pattern | Prefix |
/// |---|---|
/// | `*.gov.au` | `au,gov,` |
/// | `http://EXAMPLE.com/foo/*` | `com,example,:80:http:/foo/` |
/// | `http://example.com/foo/` | `com,example,:80:http:/foo/ ` |
/// | starts with `(`, `[` or a digit | passed through unchanged |
pub fn to_ssurt_prefix(pattern: &str) -> CdxResult<String> {
    let pattern = pattern.trim();
    if pattern.is_empty() {
        return Err(CdxError::BadPattern("blank pattern is nonsensical".into()));
    }
    if is_already_ssurt(pattern) {
        return Ok(pattern.to_string());
    }
    if let Some(domain) = pattern.strip_prefix("*.") {
        if pattern.contains('/') {
            return Err(CdxError::BadPattern(
                "can't use a domain wildcard with a path".into(),
            ));
        }
        let host = canonicalize_host(domain)?;
        return Ok(reverse_domain(&host));
    }
    if let Some(stem) = pattern.strip_suffix('*') {
        return ssurt(stem);
    }
    let mut exact = ssurt(pattern)?;
    exact.push(EXACT_SENTINEL);
    Ok(exact)
}

/// Rebuild a URL from its SSURT form. Inverse of [`ssurt`] up to
/// canonicalisation; default ports are omitted from the output.
pub fn ssurt_to_url(ssurt: &str) -> CdxResult<String> {
    let corrupt = || CdxError::BadUrl(format!("not a valid ssurt: {}", ssurt));

    let (host, rest) = if let Some(rest) = ssurt.strip_prefix('[') {
        // bracketed IPv6 literal, host runs to the closing bracket
        let close = rest.find(']').ok_or_else(corrupt)?;
        let after = rest[close + 1..].strip_prefix(':').ok_or_else(corrupt)?;
        (format!("[{}", &rest[..=close]), after)
    } else {
        let colon = ssurt.find(':').ok_or_else(corrupt)?;
        let field = &ssurt[..colon];
        let host = if field.ends_with(',') {
            field
                .split(',')
                .filter(|s| !s.is_empty())
                .rev()
                .collect::<Vec<_>>()
                .join(".")
        } else {
            field.to_string()
        };
        (host, &ssurt[colon + 1..])
    };

    let colon = rest.find(':').ok_or_else(corrupt)?;
    let port: u16 = rest[..colon].parse().map_err(|_| corrupt())?;
    let rest = &rest[colon + 1..];

    let colon = rest.find(':').ok_or_else(corrupt)?;
    let scheme = &rest[..colon];
    let rest = &rest[colon + 1..];

    let slash = rest.find('/').ok_or_else(corrupt)?;
    let userinfo = &rest[..slash];
    let path_and_query = &rest[slash..];

    let mut url = format!("{}://", scheme);
    if !userinfo.is_empty() {
        url.push_str(userinfo);
        url.push('@');
    }
    url.push_str(&host);
    if default_port(scheme) != Some(port) {
        url.push(':');
        url.push_str(&port.to_string());
    }
    url.push_str(path_and_query);
    Ok(url)
}

/// Split a URL without canonicalising it. Only absolute hierarchical URLs
/// are accepted; this is deliberately not a general-purpose URL parser.
pub fn split_url(url: &str) -> CdxResult<SplitUrl> {
    let bad = |msg: &str| CdxError::BadUrl(format!("{}: {}", msg, url));
    let url = url.trim();

    let trimmed = match url.find('#') {
        Some(i) => &url[..i],
        None => url,
    };

    let scheme_end = trimmed.find("://").ok_or_else(|| bad("missing scheme"))?;
    let scheme = &trimmed[..scheme_end];
    if scheme.is_empty()
        || !scheme.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
        || !scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
    {
        return Err(bad("invalid scheme"));
    }
    let scheme = scheme.to_ascii_lowercase();

    let rest = &trimmed[scheme_end + 3..];
    let authority_end = rest.find(['/', '?']).unwrap_or(rest.len());
    let authority = &rest[..authority_end];
    let rest = &rest[authority_end..];

    let (userinfo, hostport) = match authority.rfind('@') {
        Some(i) => (&authority[..i], &authority[i + 1..]),
        None => ("", authority),
    };

    let (host, port_str) = if hostport.starts_with('[') {
        let close = hostport.find(']').ok_or_else(|| bad("unterminated ipv6 host"))?;
        let after = &hostport[close + 1..];
        let port = match after.strip_prefix(':') {
            Some(p) => Some(p),
            None if after.is_empty() => None,
            None => return Err(bad("garbage after ipv6 host")),
        };
        (&hostport[..=close], port)
    } else {
        match hostport.rfind(':') {
            Some(i) => (&hostport[..i], Some(&hostport[i + 1..])),
            None => (hostport, None),
        }
    };
    if host.is_empty() {
        return Err(bad("empty host"));
    }

    let port = match port_str {
        Some(p) => p
            .parse::<u16>()
            .map_err(|_| bad("invalid port"))?,
        None => default_port(&scheme).ok_or_else(|| bad("no default port for scheme"))?,
    };

    let (path, query) = match rest.find('?') {
        Some(i) => (&rest[..i], Some(rest[i + 1..].to_string())),
        None => (rest, None),
    };

    Ok(SplitUrl {
        scheme,
        userinfo: userinfo.to_string(),
        host: host.to_string(),
        port,
        path: path.to_string(),
        query,
    })
}

fn default_port(scheme: &str) -> Option<u16> {
    match scheme {
        "http" | "ws" => Some(80),
        "https" | "wss" => Some(443),
        "ftp" => Some(21),
        _ => None,
    }
}

fn is_already_ssurt(pattern: &str) -> bool {
    matches!(pattern.chars().next(), Some('(' | '[' | '0'..='9'))
}

fn sshost(raw_host: &str) -> CdxResult<String> {
    let host = canonicalize_host(raw_host)?;
    if is_ip_host(&host) {
        Ok(host)
    } else {
        Ok(reverse_domain(&host))
    }
}

fn is_ip_host(host: &str) -> bool {
    if host.starts_with('[') {
        return true;
    }
    let mut parts = 0;
    for part in host.split('.') {
        if part.is_empty() || !part.chars().all(|c| c.is_ascii_digit()) {
            return false;
        }
        parts += 1;
    }
    parts == 4
}

/// `nla.gov.au` becomes `au,gov,nla,`.
fn reverse_domain(host: &str) -> String {
    let mut out = String::with_capacity(host.len() + 2);
    for label in host.rsplit('.') {
        out.push_str(label);
        out.push(',');
    }
    out
}

fn canonicalize_host(host: &str) -> CdxResult<String> {
    if host.starts_with('[') {
        return Ok(host.to_ascii_lowercase());
    }
    let mut host = host.replace("..", ".");
    while host.ends_with('.') {
        host.pop();
    }
    if host.is_empty() {
        return Err(CdxError::BadUrl("empty host".into()));
    }
    let host = idn_to_ascii(&host)?;
    Ok(canonical_percent_encode(&host))
}

/// IDN to ASCII: non-ASCII labels are lowercased and punycode encoded with
/// the `xn--` prefix, ASCII labels are lowercased in place.
fn idn_to_ascii(host: &str) -> CdxResult<String> {
    if host.is_ascii() {
        return Ok(host.to_ascii_lowercase());
    }
    let mut labels = Vec::new();
    for label in host.split('.') {
        if label.is_ascii() {
            labels.push(label.to_ascii_lowercase());
        } else {
            let lowered: String = label.chars().flat_map(char::to_lowercase).collect();
            let encoded = punycode_encode(&lowered)
                .ok_or_else(|| CdxError::BadUrl(format!("idn label overflow: {}", label)))?;
            labels.push(format!("xn--{}", encoded));
        }
    }
    Ok(labels.join("."))
}

/// Canonical percent encoding: fully decode any existing `%XX` sequences,
/// then re-encode the bytes that cannot appear literally in a canonical
/// SSURT (controls, space, DEL and above, `%`, `#`).
pub fn canonical_percent_encode(s: &str) -> String {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    let decoded = percent_decode(s);
    let mut out = String::with_capacity(decoded.len());
    for &b in &decoded {
        if b <= 0x20 || b >= 0x7f || b == b'%' || b == b'#' {
            out.push('%');
            out.push(HEX[(b >> 4) as usize] as char);
            out.push(HEX[(b & 0xf) as usize] as char);
        } else {
            out.push(b as char);
        }
    }
    out
}

/// Decode `%XX` sequences to raw bytes. Malformed sequences are kept
/// literally.
pub fn percent_decode(s: &str) -> Vec<u8> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if let (Some(hi), Some(lo)) = (
                bytes.get(i + 1).and_then(|b| (*b as char).to_digit(16)),
                bytes.get(i + 2).and_then(|b| (*b as char).to_digit(16)),
            ) {
                out.push(((hi << 4) | lo) as u8);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    out
}

/// RFC 3492 punycode encoding of a single label. Returns `None` on
/// arithmetic overflow, which cannot happen for hostname-sized input.
fn punycode_encode(input: &str) -> Option<String> {
    const BASE: u32 = 36;
    const TMIN: u32 = 1;
    const TMAX: u32 = 26;
    const SKEW: u32 = 38;
    const DAMP: u32 = 700;
    const INITIAL_BIAS: u32 = 72;
    const INITIAL_N: u32 = 128;

    fn adapt(mut delta: u32, num_points: u32, first_time: bool) -> u32 {
        delta /= if first_time { DAMP } else { 2 };
        delta += delta / num_points;
        let mut k = 0;
        while delta > ((BASE - TMIN) * TMAX) / 2 {
            delta /= BASE - TMIN;
            k += BASE;
        }
        k + (((BASE - TMIN + 1) * delta) / (delta + SKEW))
    }

    fn digit(d: u32) -> char {
        if d < 26 {
            (b'a' + d as u8) as char
        } else {
            (b'0' + (d - 26) as u8) as char
        }
    }

    let mut output: String = input.chars().filter(char::is_ascii).collect();
    let basic_len = output.chars().count() as u32;
    if basic_len > 0 {
        output.push('-');
    }

    let mut n = INITIAL_N;
    let mut delta: u32 = 0;
    let mut bias = INITIAL_BIAS;
    let mut handled = basic_len;
    let total = input.chars().count() as u32;

    while handled < total {
        let m = input
            .chars()
            .map(|c| c as u32)
            .filter(|&c| c >= n)
            .min()?;
        delta = delta.checked_add((m - n).checked_mul(handled + 1)?)?;
        n = m;
        for c in input.chars().map(|c| c as u32) {
            if c < n {
                delta = delta.checked_add(1)?;
            }
            if c == n {
                let mut q = delta;
                let mut k = BASE;
                loop {
                    let t = if k <= bias {
                        TMIN
                    } else if k >= bias + TMAX {
                        TMAX
                    } else {
                        k - bias
                    };
                    if q < t {
                        break;
                    }
                    output.push(digit(t + (q - t) % (BASE - t)));
                    q = (q - t) / (BASE - t);
                    k += BASE;
                }
                output.push(digit(q));
                bias = adapt(delta, handled + 1, handled == basic_len);
                delta = 0;
                handled += 1;
            }
        }
        delta = delta.checked_add(1)?;
        n = n.checked_add(1)?;
    }
    Some(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_vectors() {
        assert_eq!("au,gov,", to_ssurt_prefix("*.gov.au").unwrap());
        assert_eq!(
            "com,example,:80:http:/foo/",
            to_ssurt_prefix("http://EXAMPLE.com/foo/*").unwrap()
        );
        assert_eq!(
            "com,example,:80:http:/foo/ ",
            to_ssurt_prefix("http://example.com/foo/").unwrap()
        );
    }

    #[test]
    fn test_pattern_passthrough_and_errors() {
        assert_eq!("(au,gov,", to_ssurt_prefix("(au,gov,").unwrap());
        assert_eq!("10.", to_ssurt_prefix("10.").unwrap());
        assert_eq!("[2001:db8:", to_ssurt_prefix("[2001:db8:").unwrap());
        assert!(to_ssurt_prefix("").is_err());
        assert!(to_ssurt_prefix("*.gov.au/robots.txt").is_err());
    }

    #[test]
    fn test_ssurt_basic() {
        assert_eq!(
            "com,example,www,:80:http:/",
            ssurt("http://www.example.com/").unwrap()
        );
        assert_eq!(
            "com,example,:443:https:/index.html",
            ssurt("HTTPS://Example.COM/index.html").unwrap()
        );
        assert_eq!(
            "au,gov,nla,:8080:http:/search?q=trove",
            ssurt("http://nla.gov.au:8080/search?q=trove").unwrap()
        );
    }

    #[test]
    fn test_ssurt_userinfo_and_fragment() {
        assert_eq!(
            "com,example,:21:ftp:anonymous/pub",
            ssurt("ftp://anonymous@example.com/pub#readme").unwrap()
        );
        // fragment only, empty path
        assert_eq!(
            "com,example,:80:http:/",
            ssurt("http://example.com#top").unwrap()
        );
    }

    #[test]
    fn test_ssurt_host_cleanup() {
        assert_eq!(
            "au,gov,nla,:80:http:/",
            ssurt("http://NLA.gov.au./").unwrap()
        );
        assert_eq!(
            "au,gov,nla,:80:http:/",
            ssurt("http://nla..gov.au/").unwrap()
        );
    }

    #[test]
    fn test_ssurt_port_leading_zeros() {
        assert_eq!(
            "com,example,:80:http:/",
            ssurt("http://example.com:0080/").unwrap()
        );
    }

    #[test]
    fn test_ssurt_idn() {
        assert_eq!(
            "example,xn--bcher-kva,:80:http:/",
            ssurt("http://BÜCHER.example/").unwrap()
        );
    }

    #[test]
    fn test_ssurt_percent_encoding() {
        assert_eq!(
            "com,example,:80:http:/a%20b?x=%25y",
            ssurt("http://example.com/a b?x=%25y").unwrap()
        );
        // unreserved octets are fully decoded
        assert_eq!(
            "com,example,:80:http:/~user",
            ssurt("http://example.com/%7Euser").unwrap()
        );
    }

    #[test]
    fn test_ssurt_ip_hosts() {
        assert_eq!("10.0.0.1:80:http:/", ssurt("http://10.0.0.1/").unwrap());
        assert_eq!(
            "[2001:db8::1]:80:http:/",
            ssurt("http://[2001:db8::1]/").unwrap()
        );
        assert_eq!(
            "[2001:db8::1]:8443:https:/",
            ssurt("https://[2001:db8::1]:8443/").unwrap()
        );
    }

    #[test]
    fn test_ssurt_rejects_malformed() {
        assert!(ssurt("example.com/no-scheme").is_err());
        assert!(ssurt("http://").is_err());
        assert!(ssurt("http://example.com:notaport/").is_err());
        assert!(ssurt("gopher://example.com/").is_err());
    }

    #[test]
    fn test_ssurt_idempotent_through_inverse() {
        for url in [
            "http://www.example.com/",
            "https://example.com/a/b?q=1",
            "http://user@example.com:8080/x",
            "http://10.0.0.1/robots.txt",
        ] {
            let s = ssurt(url).unwrap();
            let rebuilt = ssurt_to_url(&s).unwrap();
            assert_eq!(s, ssurt(&rebuilt).unwrap(), "for {}", url);
        }
    }

    #[test]
    fn test_ssurt_to_url() {
        assert_eq!(
            "http://www.example.com/",
            ssurt_to_url("com,example,www,:80:http:/").unwrap()
        );
        assert_eq!(
            "http://example.com:8080/x?q=1",
            ssurt_to_url("com,example,:8080:http:/x?q=1").unwrap()
        );
        assert_eq!(
            "ftp://anonymous@example.com/pub",
            ssurt_to_url("com,example,:21:ftp:anonymous/pub").unwrap()
        );
    }

    #[test]
    fn test_host_and_domain_prefixes() {
        assert_eq!(
            "au,gov,nla,:",
            host_prefix("http://nla.gov.au/anything").unwrap()
        );
        assert_eq!(
            "au,gov,nla,",
            domain_prefix("http://nla.gov.au/anything").unwrap()
        );
        assert_eq!("10.0.0.1:", domain_prefix("http://10.0.0.1/").unwrap());
    }

    #[test]
    fn test_sentinel_sorts_below_ssurt_bytes() {
        let exact = to_ssurt_prefix("http://example.com/foo/").unwrap();
        let child = ssurt("http://example.com/foo/bar").unwrap();
        assert!(exact.as_bytes() < child.as_bytes());
        assert!(!child.starts_with(&exact));
    }
}
