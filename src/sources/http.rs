//! Source for maps published as plain files over HTTP(S).
//!
//! Each map kind has its own URL serving the same POSIX text format the
//! `files` cache writes. Conditional fetches ride on `If-Modified-Since`; a
//! 304 turns into an empty map with no modify time, which the updater
//! treats as a successful no-op.

use std::io::Read;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::{IF_MODIFIED_SINCE, LAST_MODIFIED};

use crate::config::Options;
use crate::error::{Error, Result};
use crate::maps::{Map, MapEntry, MapKind};
use crate::sources::{Source, retry_delay, retry_max, timeout_secs, with_retries};
use crate::util::{file_formats, http_dates};

pub(crate) const USER_AGENT: &str = concat!("nsscache/", env!("CARGO_PKG_VERSION"));

pub struct HttpFilesSource {
    client: Client,
    options: Options,
    retry_max: u32,
    retry_delay: u64,
}

/// A fetched document, or `NotModified` for a 304.
pub(crate) enum Fetched {
    Document { body: Vec<u8>, last_modified: Option<i64> },
    NotModified,
}

impl HttpFilesSource {
    pub fn new(options: &Options) -> Result<Self> {
        let client = build_client(options)?;
        Ok(Self {
            client,
            retry_max: retry_max(options),
            retry_delay: retry_delay(options),
            options: options.clone(),
        })
    }

    fn url_for(&self, kind: MapKind) -> Result<String> {
        let key = match kind {
            MapKind::Passwd => "passwd_url",
            MapKind::Group => "group_url",
            MapKind::Shadow => "shadow_url",
            MapKind::Netgroup => "netgroup_url",
            MapKind::Sshkey => "sshkey_url",
            MapKind::Automount => {
                return Err(Error::UnsupportedMap(
                    "automount maps are fetched by location".to_string(),
                ));
            }
        };
        self.options.require_str(key)
    }

    fn fetch_map(&self, kind: MapKind, url: &str, since: Option<i64>) -> Result<Map> {
        let fetched = fetch_url(
            &self.client,
            url,
            since,
            self.retry_max,
            self.retry_delay,
        )?;
        match fetched {
            Fetched::NotModified => Ok(Map::new(kind)),
            Fetched::Document { body, last_modified } => {
                let body = decompress(body)?;
                let mut map = file_formats::parse_map(kind, body.as_slice())?;
                if let Some(ts) = last_modified {
                    tracing::debug!(ts, "setting map modify time from Last-Modified");
                    map.set_modify_time(Some(ts));
                }
                Ok(map)
            }
        }
    }
}

impl Source for HttpFilesSource {
    fn name(&self) -> &'static str {
        "http"
    }

    fn get_map(&mut self, kind: MapKind, since: Option<i64>) -> Result<Map> {
        let url = self.url_for(kind)?;
        self.fetch_map(kind, &url, since)
    }

    fn get_automount_map(&mut self, location: &str, since: Option<i64>) -> Result<Map> {
        let base = self.options.require_str("automount_base_url")?;
        let url = join_url(&base, location)?;
        let mut map = self.fetch_map(MapKind::Automount, &url, since)?;
        map.set_filesystem_location(Some(location.to_string()));
        Ok(map)
    }

    fn get_automount_master_map(&mut self) -> Result<Map> {
        let master = self.get_automount_map("auto.master", None)?;

        // Master entries name their submaps by URL; reduce each location to
        // its basename so the updater can re-join it against the base URL.
        let mut rewritten = Map::new(MapKind::Automount);
        rewritten.set_modify_time(master.modify_time());
        for entry in master.into_entries() {
            let MapEntry::Automount(mut e) = entry else {
                continue;
            };
            if let Some(slash) = e.location.rfind('/') {
                e.location = e.location[slash + 1..].to_string();
            }
            tracing::debug!(location = %e.location, "master map has");
            rewritten.add(MapEntry::Automount(e))?;
        }
        Ok(rewritten)
    }
}

pub(crate) fn build_client(options: &Options) -> Result<Client> {
    let mut builder = Client::builder()
        .user_agent(USER_AGENT)
        .timeout(Duration::from_secs(timeout_secs(options)));
    if let Some(proxy) = options.get_str("http_proxy").filter(|p| !p.is_empty()) {
        let proxy = reqwest::Proxy::all(&proxy)
            .map_err(|err| Error::Configuration(format!("bad http_proxy {proxy:?}: {err}")))?;
        builder = builder.proxy(proxy);
    }
    builder
        .build()
        .map_err(|err| Error::Configuration(format!("building http client: {err}")))
}

/// Fetch a URL with bounded retries, honoring `since` via
/// `If-Modified-Since`. Malformed URLs and unsupported schemes fail fast;
/// transport errors and 5xx responses are retried.
pub(crate) fn fetch_url(
    client: &Client,
    url: &str,
    since: Option<i64>,
    retry_max: u32,
    retry_delay: u64,
) -> Result<Fetched> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|err| Error::Configuration(format!("bad url {url:?}: {err}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(Error::Configuration(format!(
            "unsupported protocol {:?}",
            parsed.scheme()
        )));
    }

    with_retries(retry_max, retry_delay, || {
        tracing::debug!(url, "fetching");
        let mut request = client.get(parsed.clone());
        if let Some(since) = since {
            request = request.header(IF_MODIFIED_SINCE, http_dates::to_http_date(since));
        }
        let response = request
            .send()
            .map_err(|err| Error::SourceUnavailable(format!("{url}: {err}")))?;

        let status = response.status();
        tracing::debug!(code = status.as_u16(), "response code");
        if status == StatusCode::NOT_MODIFIED {
            return Ok(Fetched::NotModified);
        }
        if !status.is_success() {
            return Err(Error::SourceUnavailable(format!(
                "{url}: HTTP {}",
                status.as_u16()
            )));
        }

        let last_modified = response
            .headers()
            .get(LAST_MODIFIED)
            .and_then(|value| value.to_str().ok())
            .and_then(http_dates::from_http_date);
        let mut body = Vec::new();
        let mut response = response;
        response
            .read_to_end(&mut body)
            .map_err(|err| Error::SourceUnavailable(format!("{url}: {err}")))?;
        Ok(Fetched::Document { body, last_modified })
    })
}

/// Undo gzip or bzip2 compression by magic-byte sniffing; anything else is
/// passed through untouched.
pub(crate) fn decompress(body: Vec<u8>) -> Result<Vec<u8>> {
    if body.starts_with(&[0x1f, 0x8b]) {
        tracing::debug!("gzip encoding found");
        let mut out = Vec::new();
        flate2::read::GzDecoder::new(body.as_slice())
            .read_to_end(&mut out)
            .map_err(|err| Error::InvalidMap(format!("bad gzip payload: {err}")))?;
        return Ok(out);
    }
    if body.starts_with(b"BZh") {
        tracing::debug!("bzip2 encoding found");
        let mut out = Vec::new();
        bzip2::read::BzDecoder::new(body.as_slice())
            .read_to_end(&mut out)
            .map_err(|err| Error::InvalidMap(format!("bad bzip2 payload: {err}")))?;
        return Ok(out);
    }
    Ok(body)
}

pub(crate) fn join_url(base: &str, location: &str) -> Result<String> {
    let base = reqwest::Url::parse(base)
        .map_err(|err| Error::Configuration(format!("bad base url {base:?}: {err}")))?;
    base.join(location)
        .map(Into::into)
        .map_err(|err| Error::Configuration(format!("bad location {location:?}: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn rejects_unsupported_scheme() {
        let options = Options::new();
        let client = build_client(&options).unwrap();
        assert!(matches!(
            fetch_url(&client, "ftp://example.com/passwd", None, 1, 0),
            Err(Error::Configuration(_))
        ));
        assert!(matches!(
            fetch_url(&client, "not a url", None, 1, 0),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn missing_map_url_is_a_configuration_error() {
        let mut options = Options::new();
        options.set_str("name", "http");
        let mut source = HttpFilesSource::new(&options).unwrap();
        assert!(matches!(
            source.get_map(MapKind::Passwd, None),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn decompress_passes_plain_text_through() {
        let body = b"root:x:0:0::/root:/bin/bash\n".to_vec();
        assert_eq!(decompress(body.clone()).unwrap(), body);
    }

    #[test]
    fn decompress_unwraps_gzip() {
        let plain = b"root:x:0:0::/root:/bin/bash\n";
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(plain).unwrap();
        let compressed = encoder.finish().unwrap();
        assert_eq!(decompress(compressed).unwrap(), plain);
    }

    #[test]
    fn decompress_unwraps_bzip2() {
        let plain = b"admins (host1,alice,)\n";
        let mut encoder = bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::default());
        encoder.write_all(plain).unwrap();
        let compressed = encoder.finish().unwrap();
        assert_eq!(decompress(compressed).unwrap(), plain);
    }

    #[test]
    fn join_respects_trailing_slash() {
        assert_eq!(
            join_url("http://example.com/maps/", "auto.home").unwrap(),
            "http://example.com/maps/auto.home"
        );
    }
}
