//! S3 source: maps published as objects in a bucket, in the same POSIX
//! text format the HTTP source serves.
//!
//! The SDK is async; the source owns a small current-thread runtime and
//! blocks on each request, since the update engine is sequential anyway.

use aws_config::BehaviorVersion;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::DateTime;
use tokio::runtime::Runtime;

use crate::config::Options;
use crate::error::{Error, Result};
use crate::maps::{Map, MapKind};
use crate::util::file_formats;

pub struct S3Source {
    runtime: Runtime,
    client: Client,
    bucket: String,
    options: Options,
}

impl S3Source {
    pub fn new(options: &Options) -> Result<Self> {
        let bucket = options.require_str("bucket")?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|err| Error::Configuration(format!("starting s3 runtime: {err}")))?;
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = options.get_str("region").filter(|r| !r.is_empty()) {
            loader = loader.region(aws_config::Region::new(region));
        }
        let config = runtime.block_on(loader.load());
        Ok(Self {
            runtime,
            client: Client::new(&config),
            bucket,
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
                    "s3 source does not serve {other} maps"
                )));
            }
        };
        self.options.require_str(key)
    }

    /// Conditional object fetch; `Ok(None)` means not modified.
    fn fetch_object(
        &mut self,
        object: &str,
        since: Option<i64>,
    ) -> Result<Option<(Vec<u8>, Option<i64>)>> {
        tracing::debug!(bucket = %self.bucket, object, "fetching s3 object");
        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(object)
            .set_if_modified_since(since.map(DateTime::from_secs));

        let response = match self.runtime.block_on(request.send()) {
            Ok(response) => response,
            Err(SdkError::ServiceError(context))
                if context.raw().status().as_u16() == 304 =>
            {
                return Ok(None);
            }
            Err(err) => {
                tracing::debug!(%err, "error getting s3 object");
                return Err(Error::SourceUnavailable(format!(
                    "unable to download s3://{}/{object}: {err}",
                    self.bucket
                )));
            }
        };

        let last_modified = response.last_modified().map(DateTime::secs);
        let body = self
            .runtime
            .block_on(response.body.collect())
            .map_err(|err| {
                Error::SourceUnavailable(format!(
                    "reading s3://{}/{object}: {err}",
                    self.bucket
                ))
            })?
            .into_bytes()
            .to_vec();
        Ok(Some((body, last_modified)))
    }
}

impl super::Source for S3Source {
    fn name(&self) -> &'static str {
        "s3"
    }

    fn get_map(&mut self, kind: MapKind, since: Option<i64>) -> Result<Map> {
        let object = self.object_for(kind)?;
        match self.fetch_object(&object, since)? {
            None => Ok(Map::new(kind)),
            Some((body, last_modified)) => {
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
    use crate::sources::Source as _;

    #[test]
    fn missing_bucket_is_a_configuration_error() {
        let mut options = Options::new();
        options.set_str("name", "s3");
        assert!(matches!(
            S3Source::new(&options),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn unsupported_kinds_are_rejected_before_any_request() {
        let mut options = Options::new();
        options.set_str("name", "s3");
        options.set_str("bucket", "identity-exports");
        options.set_str("region", "us-east-1");
        let mut source = S3Source::new(&options).unwrap();
        assert!(matches!(
            source.get_map(MapKind::Netgroup, None),
            Err(Error::UnsupportedMap(_))
        ));
        // A supported kind with no object configured fails on configuration,
        // not on the network.
        assert!(matches!(
            source.get_map(MapKind::Passwd, None),
            Err(Error::Configuration(_))
        ));
    }
}
