use anyhow::Context;
use aws_sdk_s3::primitives::ByteStream;

/// The capability jobs get for staging inputs and products. The core
/// only needs listing and whole-object transfer; anything richer stays
/// behind the implementation.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Cheap reachability probe for the status surface.
    async fn healthy(&self) -> bool;
    async fn list_objects(&self, bucket: &str) -> anyhow::Result<Vec<String>>;
    async fn get_object(&self, bucket: &str, object: &str) -> anyhow::Result<Vec<u8>>;
    async fn put_object(&self, bucket: &str, object: &str, body: Vec<u8>) -> anyhow::Result<()>;
}

/// S3-compatible store pointed at a MinIO deployment: path-style
/// addressing, static credentials, plain HTTP inside the cluster.
pub struct MinioStore {
    client: aws_sdk_s3::Client,
}

impl MinioStore {
    /// `endpoint` is a full URL, e.g. `http://minio:9000`.
    pub async fn connect(endpoint: &str, access_key: &str, secret_key: &str) -> Self {
        let credentials =
            aws_credential_types::Credentials::new(access_key, secret_key, None, None, "Static");
        let base = aws_config::defaults(aws_config::BehaviorVersion::latest())
            // MinIO ignores the region but the SDK requires one.
            .region(aws_config::Region::new("us-east-1"))
            .credentials_provider(credentials)
            .endpoint_url(endpoint)
            .load()
            .await;
        let config = aws_sdk_s3::config::Builder::from(&base)
            .force_path_style(true)
            .build();
        Self {
            client: aws_sdk_s3::Client::from_conf(config),
        }
    }
}

#[async_trait::async_trait]
impl ObjectStore for MinioStore {
    async fn healthy(&self) -> bool {
        self.client.list_buckets().send().await.is_ok()
    }

    async fn list_objects(&self, bucket: &str) -> anyhow::Result<Vec<String>> {
        let mut objects = Vec::new();
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(bucket)
            .into_paginator()
            .send();
        while let Some(page) = pages.next().await {
            let page = page.with_context(|| format!("failed to list bucket {bucket}"))?;
            for object in page.contents() {
                if let Some(key) = object.key() {
                    objects.push(key.to_string());
                }
            }
        }
        Ok(objects)
    }

    async fn get_object(&self, bucket: &str, object: &str) -> anyhow::Result<Vec<u8>> {
        let response = self
            .client
            .get_object()
            .bucket(bucket)
            .key(object)
            .send()
            .await
            .with_context(|| format!("failed to fetch {bucket}/{object}"))?;
        let body = response
            .body
            .collect()
            .await
            .with_context(|| format!("failed to read body of {bucket}/{object}"))?;
        Ok(body.into_bytes().to_vec())
    }

    async fn put_object(&self, bucket: &str, object: &str, body: Vec<u8>) -> anyhow::Result<()> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(object)
            .body(ByteStream::from(body))
            .send()
            .await
            .with_context(|| format!("failed to store {bucket}/{object}"))?;
        Ok(())
    }
}
