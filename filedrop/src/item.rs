//! The metadata record describing one uploaded file.

use chrono::{DateTime, Utc};
use hyper::header::HeaderMap;
use once_cell::sync::Lazy;
use rand::{rngs::OsRng, RngCore};
use regex::Regex;
use serde_derive::{Deserialize, Serialize};
use std::{collections::HashMap, net::IpAddr, str::FromStr};

/// Length of the random deletion key in raw bytes.
const DELETION_KEY_LEN: usize = 24;

/// Source of an uploader's IP address.
///
/// This can be the socket peer as well as some header field set by a
/// fronting proxy.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Deserialize, Serialize)]
pub enum OwnerKind {
    RemotePeer,
    Forwarded,
    XForwardedFor,
}

impl OwnerKind {
    /// The owner kinds which are taken from header fields.
    pub const HEADERS: [OwnerKind; 2] = [OwnerKind::Forwarded, OwnerKind::XForwardedFor];

    pub fn header_name(&self) -> &'static str {
        match self {
            OwnerKind::RemotePeer => "RemoteAddr",
            OwnerKind::Forwarded => "Forwarded",
            OwnerKind::XForwardedFor => "X-Forwarded-For",
        }
    }
}

/// Metadata for one uploaded file.
///
/// The blob itself is stored separately, named by the item's id.  An `Item`
/// travels by value across the RPC boundary; the blob never does.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Item {
    /// Short opaque identifier, assigned by the store.
    pub id: String,

    /// High-entropy token required for the deletion URL.
    pub deletion_key: String,

    pub burn_after_reading: bool,

    pub filename: String,
    pub content_type: String,

    pub created: DateTime<Utc>,
    pub expires: DateTime<Utc>,

    pub owners: HashMap<OwnerKind, IpAddr>,
}

impl Item {
    /// Whether the item may no longer be served.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires < now
    }
}

static FILENAME_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^0-9A-Za-z\-_.]").expect("filename pattern"));

/// Reduce a client-supplied file name to a harmless basename.
///
/// Path components are stripped and every character outside `[0-9A-Za-z-_.]`
/// becomes an underscore, so the result can neither contain a path separator
/// nor escape the storage directory.
pub fn sanitize_filename(raw: &str) -> String {
    let base = raw
        .rsplit('/')
        .next()
        .filter(|base| !base.is_empty())
        .unwrap_or("_");

    FILENAME_PATTERN.replace_all(base, "_").into_owned()
}

/// Mint a fresh deletion key from the system's entropy source.
pub fn new_deletion_key() -> String {
    let mut buf = [0u8; DELETION_KEY_LEN];
    OsRng.fill_bytes(&mut buf);

    bs58::encode(buf).into_string()
}

/// Collect the owner addresses of an upload request.
///
/// The socket peer's address, when there is one, is always recorded.  The
/// `Forwarded` and `X-Forwarded-For` headers are optional, but when present
/// their value must parse as an IP address.
pub fn collect_owners(
    peer: Option<IpAddr>,
    headers: &HeaderMap,
) -> Result<HashMap<OwnerKind, IpAddr>, String> {
    let mut owners = HashMap::new();

    if let Some(peer) = peer {
        owners.insert(OwnerKind::RemotePeer, peer);
    }

    for kind in OwnerKind::HEADERS {
        let value = match headers.get(kind.header_name()) {
            Some(value) => value
                .to_str()
                .map_err(|_| format!("header {} is not valid text", kind.header_name()))?,
            None => continue,
        };

        let addr = IpAddr::from_str(value.trim()).map_err(|_| {
            format!(
                "cannot parse remote IP {:?} from header {}",
                value,
                kind.header_name()
            )
        })?;
        owners.insert(kind, addr);
    }

    Ok(owners)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_filenames() {
        let tests = [
            ("hi.txt", "hi.txt"),
            ("../evil name.html", "evil_name.html"),
            ("/etc/passwd", "passwd"),
            ("snowman \u{2603}.bin", "snowman__.bin"),
            ("", "_"),
            ("trailing/", "_"),
            ("under_score-dash.ok", "under_score-dash.ok"),
        ];

        for (input, expected) in tests {
            let sanitized = sanitize_filename(input);
            assert_eq!(sanitized, expected, "{:?}", input);
            assert!(!sanitized.contains('/'));
        }
    }

    #[test]
    fn deletion_keys_differ() {
        let a = new_deletion_key();
        let b = new_deletion_key();

        assert_ne!(a, b);
        assert!(a.len() > 24, "short key: {}", a);
    }

    #[test]
    fn owners_from_peer() {
        let owners = collect_owners(Some("127.0.0.1".parse().unwrap()), &HeaderMap::new()).unwrap();

        assert_eq!(owners.len(), 1);
        assert_eq!(
            owners[&OwnerKind::RemotePeer],
            "127.0.0.1".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn owners_from_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("Forwarded", "172.23.23.23".parse().unwrap());
        headers.insert("X-Forwarded-For", "fe80::23".parse().unwrap());

        let owners = collect_owners(Some("fe80::42".parse().unwrap()), &headers).unwrap();

        assert_eq!(owners.len(), 3);
        assert_eq!(
            owners[&OwnerKind::Forwarded],
            "172.23.23.23".parse::<IpAddr>().unwrap()
        );
        assert_eq!(
            owners[&OwnerKind::XForwardedFor],
            "fe80::23".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn owners_reject_garbage_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("Forwarded", "172.23.23.abc".parse().unwrap());

        assert!(collect_owners(Some("127.0.0.1".parse().unwrap()), &headers).is_err());
    }
}
