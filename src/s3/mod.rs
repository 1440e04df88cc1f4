//! S3 client module
//!
//! The harness is synchronous, so [`BlockingS3Client`] owns a small tokio
//! runtime and blocks on each aws-sdk-s3 call. Everything the scenario
//! runner needs from the object store goes through the [`ObjectStore`]
//! trait, which keeps the runner testable without a gateway.
//!
//! # Tracing
//!
//! | Operation | Span Name |
//! |-----------|-----------|
//! | PutObject | `s3.put_object` |
//! | DeleteObject | `s3.delete_object` |
//! | HeadObject | `s3.observe` |
//! | ListObjectVersions | `s3.list_entries` |
//! | PutBucketLifecycleConfiguration | `s3.put_lifecycle` |

pub mod lifecycle;

use crate::config::{LifecycleRuleConf, S3Config, VersioningMode};
use crate::error::CollaboratorError;
use crate::lifecycle::TargetObject;
use crate::verify::{EntryKind, ListingEntry, Observation};
use aws_config::BehaviorVersion;
use aws_config::Region;
use aws_credential_types::Credentials;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::operation::head_object::HeadObjectError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{BucketVersioningStatus, Tag, Tagging, VersioningConfiguration};
use aws_sdk_s3::Client;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tokio::runtime::Runtime;
use tracing::{debug, info};

/// Object store operations used by a scenario
pub trait ObjectStore {
    fn create_bucket(&self, bucket: &str) -> Result<(), CollaboratorError>;

    fn set_versioning(&self, bucket: &str, mode: VersioningMode) -> Result<(), CollaboratorError>;

    /// Upload an object and return its version id, if the bucket assigned one
    fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        tags: &BTreeMap<String, String>,
    ) -> Result<Option<String>, CollaboratorError>;

    /// Plain DELETE; in a versioned bucket this adds a delete marker
    fn delete_object(&self, bucket: &str, key: &str) -> Result<(), CollaboratorError>;

    fn put_lifecycle(
        &self,
        bucket: &str,
        rules: &[LifecycleRuleConf],
    ) -> Result<(), CollaboratorError>;

    /// IDs of the rules the bucket currently has
    fn lifecycle_rule_ids(&self, bucket: &str) -> Result<Vec<String>, CollaboratorError>;

    /// Current state of the target as seen through the S3 API
    fn observe(
        &self,
        bucket: &str,
        target: &TargetObject,
        at: DateTime<Utc>,
    ) -> Result<Observation, CollaboratorError>;

    /// Every version and delete marker in the bucket
    fn list_entries(&self, bucket: &str) -> Result<Vec<ListingEntry>, CollaboratorError>;
}

impl<S: ObjectStore + ?Sized> ObjectStore for &S {
    fn create_bucket(&self, bucket: &str) -> Result<(), CollaboratorError> {
        (**self).create_bucket(bucket)
    }

    fn set_versioning(&self, bucket: &str, mode: VersioningMode) -> Result<(), CollaboratorError> {
        (**self).set_versioning(bucket, mode)
    }

    fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        tags: &BTreeMap<String, String>,
    ) -> Result<Option<String>, CollaboratorError> {
        (**self).put_object(bucket, key, body, tags)
    }

    fn delete_object(&self, bucket: &str, key: &str) -> Result<(), CollaboratorError> {
        (**self).delete_object(bucket, key)
    }

    fn put_lifecycle(
        &self,
        bucket: &str,
        rules: &[LifecycleRuleConf],
    ) -> Result<(), CollaboratorError> {
        (**self).put_lifecycle(bucket, rules)
    }

    fn lifecycle_rule_ids(&self, bucket: &str) -> Result<Vec<String>, CollaboratorError> {
        (**self).lifecycle_rule_ids(bucket)
    }

    fn observe(
        &self,
        bucket: &str,
        target: &TargetObject,
        at: DateTime<Utc>,
    ) -> Result<Observation, CollaboratorError> {
        (**self).observe(bucket, target, at)
    }

    fn list_entries(&self, bucket: &str) -> Result<Vec<ListingEntry>, CollaboratorError> {
        (**self).list_entries(bucket)
    }
}

/// aws-sdk-s3 client driven from synchronous code
pub struct BlockingS3Client {
    client: Client,
    runtime: Option<Arc<Runtime>>,
}

impl Drop for BlockingS3Client {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            let _ = std::thread::spawn(move || drop(runtime));
        }
    }
}

impl BlockingS3Client {
    /// Build a path-style client with static credentials
    pub fn new(config: &S3Config) -> Result<Self, CollaboratorError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| CollaboratorError::Runtime(e.to_string()))?;

        let credentials = Credentials::new(
            config.access_key.clone(),
            config.secret_key.clone(),
            None,
            None,
            "rgw-lc-harness",
        );
        let region = Region::new(config.region.clone());
        let endpoint = config.endpoint.clone();

        let shared_config = runtime.block_on(async {
            aws_config::defaults(BehaviorVersion::latest())
                .region(region)
                .endpoint_url(endpoint)
                .credentials_provider(credentials)
                .load()
                .await
        });
        let s3_config = aws_sdk_s3::config::Builder::from(&shared_config)
            .force_path_style(true)
            .build();

        info!(endpoint = %config.endpoint, region = %config.region, "S3 client ready");

        Ok(Self {
            client: Client::from_conf(s3_config),
            runtime: Some(Arc::new(runtime)),
        })
    }

    fn block_on<F, T>(&self, future: F) -> Result<T, CollaboratorError>
    where
        F: Future<Output = Result<T, CollaboratorError>>,
    {
        self.runtime
            .as_ref()
            .ok_or_else(|| CollaboratorError::Runtime("S3 runtime closed".into()))?
            .block_on(future)
    }

    /// Delete markers recorded for exactly `key`
    fn count_markers(&self, bucket: &str, key: &str) -> Result<usize, CollaboratorError> {
        let entries = self.list_versions(bucket, Some(key))?;
        Ok(entries
            .iter()
            .filter(|e| e.key == key && e.kind == EntryKind::DeleteMarker)
            .count())
    }

    fn list_versions(
        &self,
        bucket: &str,
        prefix: Option<&str>,
    ) -> Result<Vec<ListingEntry>, CollaboratorError> {
        let client = self.client.clone();
        let bucket = bucket.to_string();
        let prefix = prefix.map(str::to_string);

        self.block_on(async move {
            let mut entries = Vec::new();
            let mut key_marker: Option<String> = None;
            let mut version_marker: Option<String> = None;

            loop {
                let output = client
                    .list_object_versions()
                    .bucket(&bucket)
                    .set_prefix(prefix.clone())
                    .set_key_marker(key_marker.take())
                    .set_version_id_marker(version_marker.take())
                    .send()
                    .await
                    .map_err(|e| CollaboratorError::s3("ListObjectVersions", e))?;

                entries.extend(output.versions().iter().map(|v| {
                    ListingEntry::version(
                        v.key().unwrap_or_default(),
                        v.version_id().map(str::to_string),
                    )
                }));
                entries.extend(output.delete_markers().iter().map(|m| ListingEntry {
                    key: m.key().unwrap_or_default().to_string(),
                    version_id: m.version_id().map(str::to_string),
                    kind: EntryKind::DeleteMarker,
                }));

                if !output.is_truncated().unwrap_or(false) {
                    break;
                }
                key_marker = output.next_key_marker().map(str::to_string);
                version_marker = output.next_version_id_marker().map(str::to_string);
                if key_marker.is_none() && version_marker.is_none() {
                    break;
                }
            }

            Ok(entries)
        })
    }
}

fn is_not_found<R>(err: &SdkError<HeadObjectError, R>) -> bool
where
    R: std::fmt::Debug,
{
    err.as_service_error()
        .map(|e| e.is_not_found())
        .unwrap_or(false)
}

impl ObjectStore for BlockingS3Client {
    fn create_bucket(&self, bucket: &str) -> Result<(), CollaboratorError> {
        let client = self.client.clone();
        let bucket = bucket.to_string();
        self.block_on(async move {
            client
                .create_bucket()
                .bucket(&bucket)
                .send()
                .await
                .map_err(|e| CollaboratorError::s3("CreateBucket", e))?;
            info!(bucket = %bucket, "Bucket created");
            Ok(())
        })
    }

    fn set_versioning(&self, bucket: &str, mode: VersioningMode) -> Result<(), CollaboratorError> {
        let status = match mode {
            VersioningMode::Off => return Ok(()),
            VersioningMode::Enabled => BucketVersioningStatus::Enabled,
            VersioningMode::Suspended => BucketVersioningStatus::Suspended,
        };
        let client = self.client.clone();
        let bucket = bucket.to_string();
        self.block_on(async move {
            client
                .put_bucket_versioning()
                .bucket(&bucket)
                .versioning_configuration(VersioningConfiguration::builder().status(status).build())
                .send()
                .await
                .map_err(|e| CollaboratorError::s3("PutBucketVersioning", e))?;
            Ok(())
        })
    }

    #[tracing::instrument(
        name = "s3.put_object",
        skip(self, body, tags),
        fields(s3.bucket = %bucket, s3.key = %key, upload.bytes = body.len()),
        err
    )]
    fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        tags: &BTreeMap<String, String>,
    ) -> Result<Option<String>, CollaboratorError> {
        let tag_set = tags
            .iter()
            .map(|(k, v)| Tag::builder().key(k).value(v).build())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| CollaboratorError::s3("PutObjectTagging", e))?;
        let tagging = if tag_set.is_empty() {
            None
        } else {
            Some(
                Tagging::builder()
                    .set_tag_set(Some(tag_set))
                    .build()
                    .map_err(|e| CollaboratorError::s3("PutObjectTagging", e))?,
            )
        };

        let client = self.client.clone();
        let bucket = bucket.to_string();
        let key = key.to_string();
        self.block_on(async move {
            let output = client
                .put_object()
                .bucket(&bucket)
                .key(&key)
                .body(ByteStream::from(body))
                .send()
                .await
                .map_err(|e| CollaboratorError::s3("PutObject", e))?;
            let version_id = output.version_id().map(str::to_string);

            if let Some(tagging) = tagging {
                client
                    .put_object_tagging()
                    .bucket(&bucket)
                    .key(&key)
                    .set_version_id(version_id.clone())
                    .tagging(tagging)
                    .send()
                    .await
                    .map_err(|e| CollaboratorError::s3("PutObjectTagging", e))?;
            }

            debug!(version_id = ?version_id, "PutObject completed");
            Ok(version_id)
        })
    }

    #[tracing::instrument(name = "s3.delete_object", skip(self), err)]
    fn delete_object(&self, bucket: &str, key: &str) -> Result<(), CollaboratorError> {
        let client = self.client.clone();
        let bucket = bucket.to_string();
        let key = key.to_string();
        self.block_on(async move {
            client
                .delete_object()
                .bucket(bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| CollaboratorError::s3("DeleteObject", e))?;
            Ok(())
        })
    }

    #[tracing::instrument(name = "s3.put_lifecycle", skip(self, rules), fields(rules = rules.len()), err)]
    fn put_lifecycle(
        &self,
        bucket: &str,
        rules: &[LifecycleRuleConf],
    ) -> Result<(), CollaboratorError> {
        let configuration = lifecycle::to_bucket_configuration(rules)
            .map_err(|e| CollaboratorError::s3("PutBucketLifecycleConfiguration", e))?;
        let client = self.client.clone();
        let bucket = bucket.to_string();
        self.block_on(async move {
            client
                .put_bucket_lifecycle_configuration()
                .bucket(bucket)
                .lifecycle_configuration(configuration)
                .send()
                .await
                .map_err(|e| CollaboratorError::s3("PutBucketLifecycleConfiguration", e))?;
            Ok(())
        })
    }

    fn lifecycle_rule_ids(&self, bucket: &str) -> Result<Vec<String>, CollaboratorError> {
        let client = self.client.clone();
        let bucket = bucket.to_string();
        self.block_on(async move {
            let output = client
                .get_bucket_lifecycle_configuration()
                .bucket(bucket)
                .send()
                .await
                .map_err(|e| CollaboratorError::s3("GetBucketLifecycleConfiguration", e))?;
            Ok(output
                .rules()
                .iter()
                .filter_map(|rule| rule.id().map(str::to_string))
                .collect())
        })
    }

    #[tracing::instrument(
        name = "s3.observe",
        skip(self, target, at),
        fields(s3.bucket = %bucket, s3.key = %target.key),
        err
    )]
    fn observe(
        &self,
        bucket: &str,
        target: &TargetObject,
        at: DateTime<Utc>,
    ) -> Result<Observation, CollaboratorError> {
        // noncurrent versions are addressed directly; current objects by key
        let version_id = if target.is_noncurrent() {
            target.version_id.clone()
        } else {
            None
        };
        let client = self.client.clone();
        let bucket_name = bucket.to_string();
        let key = target.key.clone();

        let head = self.block_on(async move {
            match client
                .head_object()
                .bucket(bucket_name)
                .key(key)
                .set_version_id(version_id)
                .send()
                .await
            {
                Ok(output) => Ok(Some((
                    output.storage_class().map(|c| c.as_str().to_string()),
                    output.expiration().map(str::to_string),
                ))),
                Err(err) if is_not_found(&err) => Ok(None),
                Err(err) => Err(CollaboratorError::s3("HeadObject", err)),
            }
        })?;

        match head {
            Some((storage_class, expiration)) => {
                let mut observation = Observation::present(storage_class, at);
                observation.expiration = expiration;
                Ok(observation)
            }
            None if target.versioned && !target.is_noncurrent() => Ok(Observation::absent(
                self.count_markers(bucket, &target.key)?,
                at,
            )),
            None => Ok(Observation::absent(0, at)),
        }
    }

    #[tracing::instrument(name = "s3.list_entries", skip(self), err)]
    fn list_entries(&self, bucket: &str) -> Result<Vec<ListingEntry>, CollaboratorError> {
        self.list_versions(bucket, None)
    }
}
