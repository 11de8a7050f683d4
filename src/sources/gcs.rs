//! GCS source: the object-storage sibling of the S3 source, reached over
//! the storage XML surface so the conditional-read plumbing is plain HTTP.

use reqwest::blocking::Client;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};

use crate::config::Options;
use crate::error::{Error, Result};
use crate::maps::{Map, MapKind};
use crate::sources::http::{Fetched, USER_AGENT, fetch_url};
use crate::sources::{Source, retry_delay, retry_max, timeout_secs};
use crate::util::file_formats;

const STORAGE_ENDPOINT: &str = "https://storage.googleapis.com";

pub struct GcsSource {
    client: Client,
    bucket: String,
    options: Options,
    retry_max: u32,
    retry_delay: u64,
}

impl GcsSource {
    pub fn new(options: &Options) -> Result<Self> {
        let bucket = options.require_str("bucket")?;

        // Public buckets need no credentials; private ones take a bearer
        // token (typically minted from the instance's service account).
        let mut headers = HeaderMap::new();
        if let Some(token) = options.get_str("token").filter(|t| !t.is_empty()) {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|_| Error::Configuration("gcs token is not a valid header".to_string()))?;
            headers.insert(AUTHORIZATION, value);
        }
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(std::time::Duration::from_secs(timeout_secs(options)))
            .default_headers(headers)
            .build()
            .map_err(|err| Error::Configuration(format!("building gcs client: {err}")))?;

        Ok(Self {
            client,
            bucket,
            retry_max: retry_max(options),
            retry_delay: retry_delay(options),
            options: options.clone(),
        })
    }

    fn object_for(&self, kind: MapKind) -> Result<String> {
        let key = match kind {
            MapKind::Passwd => "passwd_object",
            MapKind::Group => "group_object",
            MapKind::Shadow => "shadow_object",
            other => {
                return Err(Error::UnsupportedMap(format!(
                    "gcs source does not serve {other} maps"
                )));
            }
        };
        self.options.require_str(key)
    }

    fn object_url(&self, object: &str) -> String {
        format!("{STORAGE_ENDPOINT}/{}/{object}", self.bucket)
    }
}

impl Source for GcsSource {
    fn name(&self) -> &'static str {
        "gcs"
    }

    fn get_map(&mut self, kind: MapKind, since: Option<i64>) -> Result<Map> {
        let object = self.object_for(kind)?;
        let url = self.object_url(&object);
        match fetch_url(&self.client, &url, since, self.retry_max, self.retry_delay)? {
            Fetched::NotModified => Ok(Map::new(kind)),
            Fetched::Document { body, last_modified } => {
                let mut map = file_formats::parse_map(kind, body.as_slice())?;
                map.set_modify_time(last_modified);
                Ok(map)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_bucket_is_a_configuration_error() {
        let mut options = Options::new();
        options.set_str("name", "gcs");
        assert!(matches!(
            GcsSource::new(&options),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn object_urls_point_at_the_bucket() {
        let mut options = Options::new();
        options.set_str("name", "gcs");
        options.set_str("bucket", "identity-exports");
        options.set_str("passwd_object", "exports/passwd");
        let source = GcsSource::new(&options).unwrap();
        assert_eq!(
            source.object_url(&source.object_for(MapKind::Passwd).unwrap()),
            "https://storage.googleapis.com/identity-exports/exports/passwd"
        );
    }

    #[test]
    fn unsupported_kinds_are_rejected() {
        let mut options = Options::new();
        options.set_str("name", "gcs");
        options.set_str("bucket", "identity-exports");
        let source = GcsSource::new(&options).unwrap();
        assert!(matches!(
            source.object_for(MapKind::Automount),
            Err(Error::UnsupportedMap(_))
        ));
    }
}
