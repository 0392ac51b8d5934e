//! The webserver child: HTTP in front, store RPC behind.
//!
//! The process holds no filesystem access once sandboxed; everything it
//! serves either came over the RPC/descriptor channels or was preloaded at
//! startup.  The listening socket is created before the sandbox is applied,
//! the seccomp profile then takes `bind` and friends away.

mod listener;
mod upload;

use crate::{
    config::Config,
    error::Result,
    human,
    item::Item,
    process,
    rpc::{FdChannel, Handler, StoreClient},
    sandbox::{self, Jail, Role},
    web::upload::UploadError,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use filedrop_log::{debug, error, info, warn};
use futures::StreamExt;
use http_body_util::{combinators::BoxBody, BodyExt, BodyStream, Full, StreamBody};
use hyper::{
    body::{Frame, Incoming},
    header,
    server::conn::http1,
    service::service_fn,
    Method, Request, Response, StatusCode,
};
use hyper_util::rt::TokioIo;
use std::{
    collections::{HashMap, HashSet},
    convert::Infallible,
    fs, io,
    net::IpAddr,
    sync::Arc,
    time::Duration,
};
use subtle::ConstantTimeEq;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::io::ReaderStream;

const MSG_DELETION_KEY_WRONG: &str = "Error: Deletion key is incorrect.";
const MSG_DELETION_SUCCESS: &str = "OK: Item was deleted.";
const MSG_FILE_SIZE_EXCEEDS: &str = "Error: File size exceeds maximum.";
const MSG_GENERIC_ERROR: &str = "Error: Something went wrong.";
const MSG_ILLEGAL_MIME: &str = "Error: MIME type is blacklisted.";
const MSG_LIFETIME_EXCEEDS: &str = "Error: Lifetime exceeds maximum.";
const MSG_NOT_EXISTS: &str = "Error: Does not exist.";
const MSG_UNSUPPORTED_METHOD: &str = "Error: Method not supported.";

type BoxedBody = BoxBody<Bytes, io::Error>;

/// A preloaded static asset.
#[derive(Clone, Debug)]
struct StaticFile {
    mime: String,
    data: Bytes,
}

/// Everything a request handler needs, built once at startup.
#[derive(Debug)]
pub struct WebServer {
    store: Arc<StoreClient>,
    max_size: u64,
    max_lifetime: Duration,
    contact: String,
    url_prefix: String,
    mime_drop: HashSet<String>,
    mime_map: HashMap<String, String>,
    index: String,
    static_files: HashMap<String, StaticFile>,
}

/// Entry point of the webserver child process.
pub async fn run(config: &Config) -> Result<()> {
    debug!("Starting webserver child");

    let rpc = Handler::from_raw_fd(process::RPC_FD)?;
    let fds = FdChannel::from_raw_fd(process::FDPASS_FD)?;
    let store = Arc::new(StoreClient::new(rpc, fds, config.webserver.rpc_deadline()?));

    // Everything the handlers will ever read from disk is loaded now; the
    // chroot below leads into an empty directory.
    let index = match &config.webserver.custom_index {
        Some(path) => fs::read_to_string(path)?,
        None => include_str!("index.html").to_string(),
    };

    let mut static_files = HashMap::new();
    for (route, static_config) in &config.webserver.static_files {
        let data = Bytes::from(fs::read(&static_config.path)?);
        static_files.insert(
            route.clone(),
            StaticFile {
                mime: static_config.mime.clone(),
                data,
            },
        );
    }

    let bound = listener::create(&config.webserver, &config.user, &config.group)?;

    let jail_root = tempfile::Builder::new()
        .prefix("filedrop-webserver-")
        .tempdir()?
        .into_path();
    sandbox::apply(
        Role::Webserver,
        &Jail {
            root: &jail_root,
            user: &config.user,
            group: &config.group,
        },
    )?;

    let acceptor = bound.into_async()?;

    let server = Arc::new(WebServer {
        store,
        max_size: config.webserver.max_size()?,
        max_lifetime: config.webserver.max_lifetime()?,
        contact: config.webserver.contact.clone(),
        url_prefix: config.webserver.url_prefix.clone(),
        mime_drop: config.webserver.item.mime_drop.iter().cloned().collect(),
        mime_map: config.webserver.mime_map.clone(),
        index,
        static_files,
    });

    info!("Accepting requests"; "bound" => &config.webserver.listen.bound);

    let mut sigint = signal(SignalKind::interrupt())?;

    loop {
        tokio::select! {
            _ = sigint.recv() => {
                info!("Stopping webserver");
                break;
            }
            accepted = acceptor.accept() => {
                let (connection, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!("Accept failed"; "error" => err.to_string());
                        continue;
                    }
                };

                let server = server.clone();
                tokio::spawn(async move {
                    let service = service_fn(|request| {
                        let server = server.clone();
                        async move { Ok::<_, Infallible>(server.handle(peer, request).await) }
                    });

                    if let Err(err) = http1::Builder::new()
                        .serve_connection(TokioIo::new(connection), service)
                        .await
                    {
                        debug!("Connection closed with error"; "error" => err.to_string());
                    }
                });
            }
        }
    }

    Ok(())
}

impl WebServer {
    /// Route one request.
    async fn handle(&self, peer: Option<IpAddr>, request: Request<Incoming>) -> Response<BoxedBody> {
        let path = request.uri().path().to_string();
        let rest = match path.strip_prefix(&self.url_prefix) {
            Some(rest) => rest.to_string(),
            None => String::new(),
        };

        if rest.is_empty() {
            return redirect(&format!("{}/", self.url_prefix));
        }

        if rest == "/" {
            return if request.method() == Method::GET {
                self.serve_index(&request)
            } else if request.method() == Method::POST {
                self.handle_upload(peer, request).await
            } else {
                method_not_allowed(request.method())
            };
        }

        if rest.starts_with("/del/") {
            return self.handle_deletion(&request, &rest).await;
        }

        if let Some(static_file) = self.static_files.get(&rest) {
            return serve_static(&request, static_file);
        }

        self.handle_fetch(&request, &rest).await
    }

    /// `GET /`: the index page.
    fn serve_index(&self, request: &Request<Incoming>) -> Response<BoxedBody> {
        let page = self
            .index
            .replace("{{expires}}", &human::pretty_duration(self.max_lifetime))
            .replace("{{size}}", &human::pretty_bytesize(self.max_size))
            .replace("{{proto}}", &scheme(request))
            .replace("{{host}}", &host(request))
            .replace("{{prefix}}", &self.url_prefix)
            .replace("{{email}}", &self.contact)
            .replace("{{duration_pattern}}", &human::duration_input_pattern());

        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/html;charset=UTF-8")
            .body(full(page))
            .unwrap()
    }

    /// `POST /`: store a new item.
    async fn handle_upload(
        &self,
        peer: Option<IpAddr>,
        request: Request<Incoming>,
    ) -> Response<BoxedBody> {
        let only_url = has_query_flag(&request, "onlyURL");
        let base_url = format!("{}://{}{}", scheme(&request), host(&request), self.url_prefix);

        let boundary = request
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| multer::parse_boundary(value).ok());
        let boundary = match boundary {
            Some(boundary) => boundary,
            None => {
                debug!("Upload without a multipart boundary");
                return text(StatusCode::BAD_REQUEST, MSG_GENERIC_ERROR);
            }
        };

        let (parts, body) = request.into_parts();
        let stream = BodyStream::new(body)
            .map(|frame| frame.map(|frame| frame.into_data().unwrap_or_default()));

        let upload = match upload::parse(
            boundary,
            stream,
            peer,
            &parts.headers,
            self.max_size,
            self.max_lifetime,
        )
        .await
        {
            Ok(upload) => upload,
            Err(UploadError::TooBig) => {
                info!("Upload rejected, file too big");
                return text(StatusCode::NOT_ACCEPTABLE, MSG_FILE_SIZE_EXCEEDS);
            }
            Err(UploadError::LifetimeTooLong) => {
                info!("Upload rejected, lifetime too long");
                return text(StatusCode::NOT_ACCEPTABLE, MSG_LIFETIME_EXCEEDS);
            }
            Err(UploadError::Bad(reason)) => {
                error!("Upload failed"; "error" => reason);
                return text(StatusCode::BAD_REQUEST, MSG_GENERIC_ERROR);
            }
        };

        if self.mime_drop.contains(&upload.item.content_type) {
            info!("Upload rejected, blacklisted MIME"; "mime" => &upload.item.content_type);
            return text(StatusCode::BAD_REQUEST, MSG_ILLEGAL_MIME);
        }

        let item = upload.item;
        let id = match self.store.put(&item, upload.body).await {
            Ok(id) => id,
            Err(fault) => {
                error!("Failed to store item"; "error" => fault.to_string());
                return text(StatusCode::BAD_REQUEST, MSG_GENERIC_ERROR);
            }
        };

        info!(
            "Uploaded new item";
            "id" => &id,
            "expires" => item.expires.to_rfc3339()
        );

        let body = if only_url {
            format!("{}/{}\n", base_url, id)
        } else {
            format!(
                "Fetch:   {base}/{id}\nDelete:  {base}/del/{id}/{key}\n\nExpires: {expires}\nBurn:    {burn}\n",
                base = base_url,
                id = id,
                key = item.deletion_key,
                expires = item.expires.to_rfc3339(),
                burn = item.burn_after_reading,
            )
        };

        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(full(body))
            .unwrap()
    }

    /// `GET /<id>`: stream an item back.
    async fn handle_fetch(&self, request: &Request<Incoming>, rest: &str) -> Response<BoxedBody> {
        if request.method() != Method::GET {
            return method_not_allowed(request.method());
        }

        let id = rest.trim_start_matches('/');

        let item = match self.store.get(id).await {
            Ok(item) => item,
            Err(fault) if fault.is_not_found() => {
                debug!("Requested non-existing id"; "id" => id);
                return text(StatusCode::NOT_FOUND, MSG_NOT_EXISTS);
            }
            Err(fault) => {
                warn!("Fetch failed"; "id" => id, "error" => fault.to_string());
                return text(StatusCode::BAD_REQUEST, MSG_GENERIC_ERROR);
            }
        };

        let response = if client_has_cached(request, &item) {
            debug!("Conditional GET, not modified"; "id" => id);

            // A cache hit is a read too: it burns the item just the same.
            if item.burn_after_reading {
                drop(BurnOnClose {
                    id: item.id.clone(),
                    store: self.store.clone(),
                });
            }

            Response::builder()
                .status(StatusCode::NOT_MODIFIED)
                .body(empty())
                .unwrap()
        } else {
            match self.serve_item(&item).await {
                Ok(response) => response,
                Err(fault) => {
                    warn!("Failed to serve item"; "id" => id, "error" => fault.to_string());
                    return text(StatusCode::BAD_REQUEST, MSG_GENERIC_ERROR);
                }
            }
        };

        info!("Item was requested"; "id" => &item.id);

        response
    }

    /// Build the streaming response for one item.
    async fn serve_item(&self, item: &Item) -> std::result::Result<Response<BoxedBody>, crate::rpc::Fault> {
        let fd = self.store.get_file(&item.id).await?;
        let blob = tokio::fs::File::from_std(fd.into_file());

        let mime = self
            .mime_map
            .get(&item.content_type)
            .unwrap_or(&item.content_type)
            .clone();

        // The delete fires when the response body is dropped, whether the
        // client read everything or reset mid-stream.
        let burn = item.burn_after_reading.then(|| BurnOnClose {
            id: item.id.clone(),
            store: self.store.clone(),
        });

        let stream = ReaderStream::new(blob).map(move |chunk| {
            let _keep_alive = &burn;
            chunk.map(Frame::data)
        });

        Ok(Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, mime)
            .header(
                header::CONTENT_DISPOSITION,
                format!("inline; filename=\"{}\"", item.filename),
            )
            // The creation date is nobody's business.
            .header(header::LAST_MODIFIED, http_date(Utc::now()))
            .body(BodyExt::boxed(StreamBody::new(stream)))
            .unwrap())
    }

    /// `GET /del/<id>/<key>`: deletion by URL.
    async fn handle_deletion(&self, request: &Request<Incoming>, rest: &str) -> Response<BoxedBody> {
        if request.method() != Method::GET {
            return method_not_allowed(request.method());
        }

        let segments: Vec<&str> = rest.trim_start_matches('/').split('/').collect();
        let (id, key) = match segments.as_slice() {
            ["del", id, key] => (*id, *key),
            _ => {
                debug!("Malformed deletion URL"; "path" => rest);
                return text(StatusCode::BAD_REQUEST, MSG_GENERIC_ERROR);
            }
        };

        let item = match self.store.get(id).await {
            Ok(item) => item,
            Err(fault) if fault.is_not_found() => {
                debug!("Deletion of non-existing id"; "id" => id);
                return text(StatusCode::NOT_FOUND, MSG_NOT_EXISTS);
            }
            Err(fault) => {
                warn!("Deletion lookup failed"; "id" => id, "error" => fault.to_string());
                return text(StatusCode::BAD_REQUEST, MSG_GENERIC_ERROR);
            }
        };

        if !constant_time_eq(key.as_bytes(), item.deletion_key.as_bytes()) {
            warn!("Deletion with wrong key"; "id" => id);
            return text(StatusCode::FORBIDDEN, MSG_DELETION_KEY_WRONG);
        }

        if let Err(fault) = self.store.delete(&item.id).await {
            error!("Deletion failed"; "id" => id, "error" => fault.to_string());
            return text(StatusCode::BAD_REQUEST, MSG_GENERIC_ERROR);
        }

        info!("Item was deleted by request"; "id" => id);

        text(StatusCode::OK, MSG_DELETION_SUCCESS)
    }
}

/// Deletes the item once the guarded body stream is gone.
struct BurnOnClose {
    id: String,
    store: Arc<StoreClient>,
}

impl Drop for BurnOnClose {
    fn drop(&mut self) {
        let id = std::mem::take(&mut self.id);
        let store = self.store.clone();

        info!("Item will be burned"; "id" => &id);

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(fault) = store.delete(&id).await {
                    error!("Failed to burn item"; "id" => id, "error" => fault.to_string());
                }
            });
        }
    }
}

/// Key comparison that does not leak how many bytes matched.  Differing
/// lengths return right away; equal lengths compare every byte.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.ct_eq(b).unwrap_u8() == 1
}

/// `https` iff a fronting proxy says so.
fn scheme<B>(request: &Request<B>) -> String {
    match request
        .headers()
        .get("X-Forwarded-Proto")
        .and_then(|value| value.to_str().ok())
    {
        Some(proto) if !proto.is_empty() => proto.to_string(),
        _ => "http".to_string(),
    }
}

fn host<B>(request: &Request<B>) -> String {
    request
        .headers()
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or_else(|| request.uri().authority().map(|authority| authority.to_string()))
        .unwrap_or_else(|| "localhost".to_string())
}

fn has_query_flag<B>(request: &Request<B>, flag: &str) -> bool {
    request
        .uri()
        .query()
        .map(|query| {
            query
                .split('&')
                .any(|pair| pair == flag || pair.starts_with(&format!("{}=", flag)))
        })
        .unwrap_or(false)
}

/// A conditional GET is honored when the client's timestamp falls strictly
/// between creation and expiry.
fn client_has_cached<B>(request: &Request<B>, item: &Item) -> bool {
    let since = match request
        .headers()
        .get(header::IF_MODIFIED_SINCE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| DateTime::parse_from_rfc2822(value).ok())
    {
        Some(since) => since.with_timezone(&Utc),
        None => return false,
    };

    item.created < since && item.expires > since
}

fn http_date(when: DateTime<Utc>) -> String {
    when.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

fn serve_static<B>(request: &Request<B>, static_file: &StaticFile) -> Response<BoxedBody> {
    if request.method() != Method::GET {
        return method_not_allowed(request.method());
    }

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, &static_file.mime)
        .body(full(static_file.data.clone()))
        .unwrap()
}

fn full(data: impl Into<Bytes>) -> BoxedBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

fn empty() -> BoxedBody {
    full(Bytes::new())
}

fn text(status: StatusCode, message: &str) -> Response<BoxedBody> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(full(format!("{}\n", message)))
        .unwrap()
}

fn method_not_allowed(method: &Method) -> Response<BoxedBody> {
    debug!("Request with unsupported method"; "method" => method.as_str());

    text(StatusCode::METHOD_NOT_ALLOWED, MSG_UNSUPPORTED_METHOD)
}

fn redirect(location: &str) -> Response<BoxedBody> {
    Response::builder()
        .status(StatusCode::TEMPORARY_REDIRECT)
        .header(header::LOCATION, location)
        .body(empty())
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use std::collections::HashMap as StdHashMap;

    fn item_with_window(created_ago: i64, expires_in: i64) -> Item {
        let now = Utc::now();

        Item {
            id: "abc".to_string(),
            deletion_key: "key".to_string(),
            burn_after_reading: false,
            filename: "hi.txt".to_string(),
            content_type: "text/plain".to_string(),
            created: now - ChronoDuration::seconds(created_ago),
            expires: now + ChronoDuration::seconds(expires_in),
            owners: StdHashMap::new(),
        }
    }

    fn request(headers: &[(&str, &str)], uri: &str) -> Request<()> {
        let mut builder = Request::builder().method(Method::GET).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }

        builder.body(()).unwrap()
    }

    #[test]
    fn constant_time_key_check() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secreT"));
        assert!(!constant_time_eq(b"secret", b"secre"));
        assert!(!constant_time_eq(b"", b"x"));
    }

    #[test]
    fn scheme_detection() {
        assert_eq!(scheme(&request(&[], "/")), "http");
        assert_eq!(
            scheme(&request(&[("X-Forwarded-Proto", "https")], "/")),
            "https"
        );
    }

    #[test]
    fn only_url_query_flag() {
        assert!(has_query_flag(&request(&[], "/?onlyURL"), "onlyURL"));
        assert!(has_query_flag(&request(&[], "/?onlyURL=1"), "onlyURL"));
        assert!(!has_query_flag(&request(&[], "/?other"), "onlyURL"));
        assert!(!has_query_flag(&request(&[], "/"), "onlyURL"));
    }

    #[test]
    fn http_dates_look_like_http_dates() {
        let formatted = http_date(
            DateTime::parse_from_rfc3339("2015-02-18T23:16:09Z")
                .unwrap()
                .with_timezone(&Utc),
        );

        assert_eq!(formatted, "Wed, 18 Feb 2015 23:16:09 GMT");
        assert!(DateTime::parse_from_rfc2822(&formatted).is_ok());
    }

    #[test]
    fn cached_window_is_strict() {
        let item = item_with_window(60, 60);

        let inside = request(&[("If-Modified-Since", &http_date(Utc::now()))], "/abc");
        assert!(client_has_cached(&inside, &item));

        // exactly the creation time: serve, not 304
        let at_creation = request(
            &[("If-Modified-Since", &http_date(item.created))],
            "/abc",
        );
        assert!(!client_has_cached(&at_creation, &item));

        let long_ago = request(
            &[("If-Modified-Since", "Wed, 18 Feb 2015 23:16:09 GMT")],
            "/abc",
        );
        assert!(!client_has_cached(&long_ago, &item));

        let garbage = request(&[("If-Modified-Since", "yesterday-ish")], "/abc");
        assert!(!client_has_cached(&garbage, &item));
    }
}
