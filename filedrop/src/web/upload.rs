//! Turning a multipart POST into an [`Item`] plus its body bytes.

use crate::{
    human,
    item::{self, Item},
};
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use futures::Stream;
use hyper::header::HeaderMap;
use multer::{Constraints, Multipart, SizeLimit};
use std::{net::IpAddr, time::Duration};

const FIELD_FILE: &str = "file";
const FIELD_BURN: &str = "burn";
const FIELD_LIFETIME: &str = "time";

/// Slack on top of `max_size` for the multipart framing around the file.
const FORM_OVERHEAD: u64 = 1 << 20;

/// Why an upload was turned away.
#[derive(Debug)]
pub enum UploadError {
    /// The file exceeds `max_size`; HTTP 406.
    TooBig,
    /// The requested lifetime exceeds `max_lifetime`; HTTP 406.
    LifetimeTooLong,
    /// Anything malformed; HTTP 400.
    Bad(String),
}

impl From<multer::Error> for UploadError {
    fn from(err: multer::Error) -> Self {
        match err {
            multer::Error::StreamSizeExceeded { .. } | multer::Error::FieldSizeExceeded { .. } => {
                UploadError::TooBig
            }
            other => UploadError::Bad(other.to_string()),
        }
    }
}

/// A parsed and validated upload, still without an id.
#[derive(Debug)]
pub struct Upload {
    pub item: Item,
    pub body: Bytes,
}

/// Parse the multipart form and build the item.
///
/// The `file` field is required and capped at `max_size`; `burn` ("1") and
/// `time` (a duration string) are optional.  The whole form is read before
/// anything is stored, mirroring what a sandboxed process without scratch
/// space can do anyway.
pub async fn parse<S, E>(
    boundary: String,
    stream: S,
    peer: Option<IpAddr>,
    headers: &HeaderMap,
    max_size: u64,
    max_lifetime: Duration,
) -> Result<Upload, UploadError>
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Into<Box<dyn std::error::Error + Send + Sync>> + Send + 'static,
{
    let constraints = Constraints::new()
        .size_limit(SizeLimit::new().whole_stream(max_size.saturating_add(FORM_OVERHEAD)));
    let mut multipart = Multipart::with_constraints(stream, boundary, constraints);

    let mut file: Option<(String, String, Bytes)> = None;
    let mut burn = None;
    let mut lifetime = None;

    while let Some(mut field) = multipart.next_field().await? {
        let name = field.name().map(str::to_string);

        match name.as_deref() {
            Some(FIELD_FILE) => {
                let filename = field.file_name().unwrap_or_default().to_string();

                let content_type = match field.content_type() {
                    Some(mime) => mime.to_string(),
                    None => {
                        return Err(UploadError::Bad(
                            "missing Content-Type in file part".to_string(),
                        ))
                    }
                };

                let mut data = BytesMut::new();
                while let Some(chunk) = field.chunk().await? {
                    if (data.len() + chunk.len()) as u64 > max_size {
                        return Err(UploadError::TooBig);
                    }
                    data.extend_from_slice(&chunk);
                }

                file = Some((filename, content_type, data.freeze()));
            }
            Some(FIELD_BURN) => burn = Some(field.text().await?),
            Some(FIELD_LIFETIME) => lifetime = Some(field.text().await?),
            _ => {}
        }
    }

    let (filename, content_type, body) = match file {
        Some(file) => file,
        None => return Err(UploadError::Bad("missing file field".to_string())),
    };

    if body.is_empty() {
        return Err(UploadError::Bad("file size is zero".to_string()));
    }

    let created = Utc::now();

    let lifetime = match lifetime.as_deref() {
        None | Some("") => max_lifetime,
        Some(raw) => {
            let parsed = human::parse_duration(raw)
                .map_err(|_| UploadError::Bad(format!("bad lifetime {:?}", raw)))?;
            if parsed > max_lifetime {
                return Err(UploadError::LifetimeTooLong);
            }
            parsed
        }
    };

    let expires = created
        + chrono::Duration::from_std(lifetime)
            .map_err(|_| UploadError::Bad("lifetime out of range".to_string()))?;

    let owners = item::collect_owners(peer, headers).map_err(UploadError::Bad)?;

    Ok(Upload {
        item: Item {
            id: String::new(),
            deletion_key: item::new_deletion_key(),
            burn_after_reading: burn.as_deref() == Some("1"),
            filename: item::sanitize_filename(&filename),
            content_type,
            created,
            expires,
            owners,
        },
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use std::convert::Infallible;

    const BOUNDARY: &str = "xyzzy";

    fn form(fields: &[(&str, Option<(&str, &str)>, &str)]) -> Bytes {
        let mut body = String::new();

        for (name, file, value) in fields {
            body.push_str(&format!("--{}\r\n", BOUNDARY));
            match file {
                Some((filename, mime)) => {
                    body.push_str(&format!(
                        "Content-Disposition: form-data; name={:?}; filename={:?}\r\n",
                        name, filename
                    ));
                    body.push_str(&format!("Content-Type: {}\r\n\r\n", mime));
                }
                None => {
                    body.push_str(&format!(
                        "Content-Disposition: form-data; name={:?}\r\n\r\n",
                        name
                    ));
                }
            }
            body.push_str(value);
            body.push_str("\r\n");
        }
        body.push_str(&format!("--{}--\r\n", BOUNDARY));

        Bytes::from(body)
    }

    async fn parse_form(
        fields: &[(&str, Option<(&str, &str)>, &str)],
        max_size: u64,
        max_lifetime: Duration,
    ) -> Result<Upload, UploadError> {
        let body = form(fields);
        let stream = stream::once(async move { Ok::<_, Infallible>(body) });

        parse(
            BOUNDARY.to_string(),
            stream,
            Some("127.0.0.1".parse().unwrap()),
            &HeaderMap::new(),
            max_size,
            max_lifetime,
        )
        .await
    }

    #[tokio::test]
    async fn happy_upload() {
        let upload = parse_form(
            &[("file", Some(("hi.txt", "text/plain")), "hello")],
            1024,
            Duration::from_secs(3600),
        )
        .await
        .unwrap();

        assert_eq!(upload.body, Bytes::from_static(b"hello"));
        assert_eq!(upload.item.filename, "hi.txt");
        assert_eq!(upload.item.content_type, "text/plain");
        assert!(!upload.item.burn_after_reading);
        assert!(!upload.item.deletion_key.is_empty());
        assert_eq!(
            (upload.item.expires - upload.item.created).num_seconds(),
            3600
        );
    }

    #[tokio::test]
    async fn burn_and_lifetime_fields() {
        let upload = parse_form(
            &[
                ("file", Some(("x", "application/octet-stream")), "x"),
                ("burn", None, "1"),
                ("time", None, "30m"),
            ],
            1024,
            Duration::from_secs(3600),
        )
        .await
        .unwrap();

        assert!(upload.item.burn_after_reading);
        assert_eq!(
            (upload.item.expires - upload.item.created).num_seconds(),
            30 * 60
        );
    }

    #[tokio::test]
    async fn file_at_the_size_limit_passes() {
        let result = parse_form(
            &[("file", Some(("x", "text/plain")), "12345")],
            5,
            Duration::from_secs(60),
        )
        .await;

        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn file_over_the_size_limit_is_too_big() {
        let result = parse_form(
            &[("file", Some(("x", "text/plain")), "123456")],
            5,
            Duration::from_secs(60),
        )
        .await;

        assert!(matches!(result, Err(UploadError::TooBig)));
    }

    #[tokio::test]
    async fn missing_file_field() {
        let result = parse_form(&[("burn", None, "1")], 1024, Duration::from_secs(60)).await;

        assert!(matches!(result, Err(UploadError::Bad(_))));
    }

    #[tokio::test]
    async fn empty_file_is_rejected() {
        let result = parse_form(
            &[("file", Some(("x", "text/plain")), "")],
            1024,
            Duration::from_secs(60),
        )
        .await;

        assert!(matches!(result, Err(UploadError::Bad(_))));
    }

    #[tokio::test]
    async fn lifetime_over_the_cap() {
        let result = parse_form(
            &[
                ("file", Some(("x", "text/plain")), "x"),
                ("time", None, "2h"),
            ],
            1024,
            Duration::from_secs(3600),
        )
        .await;

        assert!(matches!(result, Err(UploadError::LifetimeTooLong)));
    }

    #[tokio::test]
    async fn lifetime_at_the_cap_passes() {
        let result = parse_form(
            &[
                ("file", Some(("x", "text/plain")), "x"),
                ("time", None, "1h"),
            ],
            1024,
            Duration::from_secs(3600),
        )
        .await;

        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn out_of_order_lifetime_is_rejected() {
        let result = parse_form(
            &[
                ("file", Some(("x", "text/plain")), "x"),
                ("time", None, "1m10h"),
            ],
            1024,
            Duration::from_secs(24 * 3600),
        )
        .await;

        assert!(matches!(result, Err(UploadError::Bad(_))));
    }

    #[tokio::test]
    async fn evil_filename_is_sanitized() {
        let upload = parse_form(
            &[("file", Some(("../evil name.html", "text/html")), "x")],
            1024,
            Duration::from_secs(60),
        )
        .await
        .unwrap();

        assert_eq!(upload.item.filename, "evil_name.html");
    }
}
