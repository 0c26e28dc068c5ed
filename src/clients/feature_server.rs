//! HTTP client for a remote feature server.
//!
//! Frames travel as their columnar JSON form; every endpoint answers non-2xx
//! statuses with [`FeatureStoreError::Remote`].

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Certificate, Client, Response, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::feature_store::{
    FeatureRef, FeatureService, FeatureStore, FeatureStoreError, FeatureViewProjection, PushMode,
};
use crate::frame::Frame;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureServerConfig {
    pub base_url: String,
    pub connect_timeout: Duration,
    pub total_timeout: Duration,
    /// PEM bundle trusted in addition to the platform roots.
    pub ca_bundle: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct FeatureServerClient {
    client: Client,
    base_url: Url,
}

#[derive(Debug, Serialize)]
struct HistoricalFeaturesRequest<'a> {
    entity_df: &'a Frame,
    feature_service: &'a FeatureService,
}

#[derive(Debug, Serialize)]
struct PushRequest<'a> {
    push_source_name: &'a str,
    df: &'a Frame,
    to: PushMode,
    allow_registry_cache: bool,
}

#[derive(Debug, Serialize)]
struct MaterializeRequest<'a> {
    end_ts: DateTime<Utc>,
    feature_views: &'a [&'a str],
}

#[derive(Debug, Serialize)]
struct RetrieveRequest<'a> {
    query: &'a [f32],
    top_k: usize,
    features: &'a [FeatureRef],
}

#[derive(Debug, Deserialize)]
struct FrameResponse {
    frame: Frame,
}

impl FeatureServerClient {
    /// # Errors
    /// Fails when the base URL is invalid, the CA bundle is unreadable or the
    /// HTTP client cannot be built.
    pub fn new(config: &FeatureServerConfig) -> Result<Self, FeatureStoreError> {
        let mut builder = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.total_timeout);

        if let Some(bundle) = &config.ca_bundle {
            let pem = fs::read(bundle).map_err(|source| FeatureStoreError::Io {
                path: bundle.clone(),
                source,
            })?;
            for certificate in Certificate::from_pem_bundle(&pem)? {
                builder = builder.add_root_certificate(certificate);
            }
        }

        let client = builder.build()?;

        let mut raw = config.base_url.clone();
        if !raw.ends_with('/') {
            raw.push('/');
        }
        let base_url = Url::parse(&raw).map_err(|error| {
            FeatureStoreError::RemoteConfig(format!("invalid base URL `{}`: {error}", config.base_url))
        })?;

        Ok(Self { client, base_url })
    }

    fn endpoint(&self, path: &str) -> Result<Url, FeatureStoreError> {
        self.base_url
            .join(path)
            .map_err(|error| FeatureStoreError::RemoteConfig(format!("invalid path `{path}`: {error}")))
    }

    async fn check(response: Response) -> Result<Response, FeatureStoreError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(FeatureStoreError::Remote {
            status: status.as_u16(),
            body,
        })
    }

    async fn post_json<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<Response, FeatureStoreError> {
        let response = self.client.post(self.endpoint(path)?).json(body).send().await?;
        Self::check(response).await
    }

    async fn post_for<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, FeatureStoreError> {
        Ok(self.post_json(path, body).await?.json::<T>().await?)
    }
}

#[async_trait]
impl FeatureStore for FeatureServerClient {
    async fn refresh_registry(&self) -> Result<(), FeatureStoreError> {
        self.post_json("registry/refresh", &serde_json::json!({})).await?;
        debug!(base_url = %self.base_url, "remote registry refreshed");
        Ok(())
    }

    async fn resolve_service(&self, name: &str) -> Result<FeatureService, FeatureStoreError> {
        let url = self.endpoint(&format!("feature-services/{name}"))?;
        let response = self.client.get(url).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(FeatureStoreError::UnknownService(name.to_string()));
        }
        Ok(Self::check(response).await?.json::<FeatureService>().await?)
    }

    async fn resolve_push_source(
        &self,
        name: &str,
    ) -> Result<FeatureViewProjection, FeatureStoreError> {
        let url = self.endpoint(&format!("push-sources/{name}"))?;
        let response = self.client.get(url).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(FeatureStoreError::UnknownPushSource(name.to_string()));
        }
        Ok(Self::check(response).await?.json::<FeatureViewProjection>().await?)
    }

    async fn point_in_time_join(
        &self,
        entity_df: &Frame,
        service: &FeatureService,
    ) -> Result<Frame, FeatureStoreError> {
        let response: FrameResponse = self
            .post_for(
                "get-historical-features",
                &HistoricalFeaturesRequest {
                    entity_df,
                    feature_service: service,
                },
            )
            .await?;
        Ok(response.frame)
    }

    async fn push(
        &self,
        source: &str,
        frame: &Frame,
        mode: PushMode,
        allow_registry_cache: bool,
    ) -> Result<(), FeatureStoreError> {
        self.post_json(
            "push",
            &PushRequest {
                push_source_name: source,
                df: frame,
                to: mode,
                allow_registry_cache,
            },
        )
        .await?;
        Ok(())
    }

    async fn materialize_incremental(
        &self,
        end: DateTime<Utc>,
        views: &[&str],
    ) -> Result<(), FeatureStoreError> {
        self.post_json(
            "materialize-incremental",
            &MaterializeRequest {
                end_ts: end,
                feature_views: views,
            },
        )
        .await?;
        Ok(())
    }

    async fn nearest_neighbors(
        &self,
        query: &[f32],
        top_k: usize,
        features: &[FeatureRef],
    ) -> Result<Frame, FeatureStoreError> {
        let response: FrameResponse = self
            .post_for(
                "retrieve-online-documents",
                &RetrieveRequest {
                    query,
                    top_k,
                    features,
                },
            )
            .await?;
        Ok(response.frame)
    }
}
