use anyhow::{anyhow, Context};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use uuid::Uuid;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_MODEL: &str = "text-embedding-3-small";
pub const DEFAULT_COLLECTION: &str = "products";

#[derive(Debug, Clone)]
pub struct Document {
    pub id: Uuid,
    pub text: String,
}

/// Relevance search over an external vector index.
#[async_trait]
pub trait VectorSearch: Send + Sync {
    /// Ids ordered by relevance, best first.
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<Uuid>, anyhow::Error>;
    async fn upsert(&self, documents: Vec<Document>) -> Result<(), anyhow::Error>;
}

/// Used when no index is configured. Every call fails so callers take their
/// fallback path.
#[derive(Debug, Clone, Copy, Default)]
pub struct Disabled;

#[async_trait]
impl VectorSearch for Disabled {
    async fn search(&self, _query: &str, _limit: usize) -> Result<Vec<Uuid>, anyhow::Error> {
        Err(anyhow!("Semantic search is not configured"))
    }

    async fn upsert(&self, _documents: Vec<Document>) -> Result<(), anyhow::Error> {
        Err(anyhow!("Semantic search is not configured"))
    }
}

#[derive(Debug, Clone)]
pub struct QdrantOptions {
    pub embedding_url: String,
    pub embedding_api_key: Option<String>,
    pub embedding_model: String,
    pub qdrant_url: String,
    pub qdrant_api_key: Option<String>,
    pub collection: String,
    pub timeout: Duration,
}

/// Embeds text through an OpenAI-compatible `/v1/embeddings` endpoint and
/// queries a Qdrant collection over its REST API.
pub struct QdrantSearch {
    client: reqwest::Client,
    opts: QdrantOptions,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<Embedding>,
}

#[derive(Deserialize)]
struct Embedding {
    embedding: Vec<f32>,
    #[serde(default)]
    index: usize,
}

#[derive(Deserialize)]
struct SearchResponse {
    result: Vec<ScoredPoint>,
}

#[derive(Deserialize)]
struct ScoredPoint {
    id: serde_json::Value,
}

impl QdrantSearch {
    pub fn new(opts: QdrantOptions) -> Result<Self, anyhow::Error> {
        let client = reqwest::Client::builder()
            .timeout(opts.timeout)
            .build()
            .context("Unable to build semantic search client")?;
        Ok(Self { client, opts })
    }

    fn collection_url(&self) -> String {
        format!(
            "{}/collections/{}",
            self.opts.qdrant_url.trim_end_matches('/'),
            self.opts.collection
        )
    }

    fn qdrant(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.opts.qdrant_api_key {
            Some(key) => builder.header("api-key", key),
            None => builder,
        }
    }

    async fn embed(&self, input: &[String]) -> Result<Vec<Vec<f32>>, anyhow::Error> {
        let mut req = self.client.post(&self.opts.embedding_url).json(&EmbeddingRequest {
            model: &self.opts.embedding_model,
            input,
        });
        if let Some(key) = &self.opts.embedding_api_key {
            req = req.bearer_auth(key);
        }
        let resp: EmbeddingResponse = req
            .send()
            .await
            .context("Embedding request failed")?
            .error_for_status()
            .context("Embedding service returned an error")?
            .json()
            .await
            .context("Unable to decode embedding response")?;
        let vectors = order_embeddings(resp.data);
        if vectors.len() != input.len() {
            return Err(anyhow!(
                "Expected {} embeddings, got {}",
                input.len(),
                vectors.len()
            ));
        }
        Ok(vectors)
    }

    async fn ensure_collection(&self, dimension: usize) -> Result<(), anyhow::Error> {
        let url = self.collection_url();
        let resp = self.qdrant(self.client.get(&url)).send().await?;
        if resp.status().is_success() {
            return Ok(());
        }
        if resp.status() != reqwest::StatusCode::NOT_FOUND {
            return Err(anyhow!("Unable to inspect collection: {}", resp.status()));
        }
        log::info!("Creating vector collection {}", self.opts.collection);
        self.qdrant(self.client.put(&url))
            .json(&json!({"vectors": {"size": dimension, "distance": "Cosine"}}))
            .send()
            .await?
            .error_for_status()
            .context("Unable to create vector collection")?;
        Ok(())
    }
}

fn order_embeddings(mut data: Vec<Embedding>) -> Vec<Vec<f32>> {
    data.sort_by_key(|e| e.index);
    data.into_iter().map(|e| e.embedding).collect()
}

fn point_ids(resp: SearchResponse) -> Vec<Uuid> {
    resp.result
        .into_iter()
        .filter_map(|p| p.id.as_str().and_then(|id| Uuid::parse_str(id).ok()))
        .collect()
}

#[async_trait]
impl VectorSearch for QdrantSearch {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<Uuid>, anyhow::Error> {
        let vector = self
            .embed(&[query.to_string()])
            .await?
            .pop()
            .ok_or_else(|| anyhow!("Empty embedding response"))?;
        let resp: SearchResponse = self
            .qdrant(
                self.client
                    .post(format!("{}/points/search", self.collection_url())),
            )
            .json(&json!({"vector": vector, "limit": limit, "with_payload": false}))
            .send()
            .await
            .context("Vector search request failed")?
            .error_for_status()
            .context("Vector index returned an error")?
            .json()
            .await
            .context("Unable to decode vector search response")?;
        Ok(point_ids(resp))
    }

    async fn upsert(&self, documents: Vec<Document>) -> Result<(), anyhow::Error> {
        if documents.is_empty() {
            return Ok(());
        }
        let texts = documents.iter().map(|d| d.text.clone()).collect::<Vec<_>>();
        let vectors = self.embed(&texts).await?;
        if let Some(first) = vectors.first() {
            self.ensure_collection(first.len()).await?;
        }
        let points = documents
            .iter()
            .zip(vectors)
            .map(|(d, v)| json!({"id": d.id.to_string(), "vector": v}))
            .collect::<Vec<_>>();
        self.qdrant(
            self.client
                .put(format!("{}/points?wait=true", self.collection_url())),
        )
        .json(&json!({ "points": points }))
        .send()
        .await
        .context("Vector upsert request failed")?
        .error_for_status()
        .context("Vector index rejected upsert")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_always_fails() {
        assert!(Disabled.search("ssd", 10).await.is_err());
        assert!(Disabled.upsert(vec![]).await.is_err());
    }

    #[test]
    fn search_response_keeps_rank_and_skips_numeric_ids() {
        let resp: SearchResponse = serde_json::from_str(
            r#"{"result":[
                {"id":"6f1c6bde-4c55-4a4e-9a55-2d3c1a2b3c4d","score":0.91},
                {"id":42,"score":0.8},
                {"id":"0b7e7c1e-3a8a-4f33-bb0f-1a2b3c4d5e6f","score":0.7}
            ],"status":"ok","time":0.001}"#,
        )
        .unwrap();
        let ids = point_ids(resp);
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[0].to_string(), "6f1c6bde-4c55-4a4e-9a55-2d3c1a2b3c4d");
    }

    #[test]
    fn embeddings_are_ordered_by_index() {
        let resp: EmbeddingResponse = serde_json::from_str(
            r#"{"data":[{"embedding":[0.2],"index":1},{"embedding":[0.1],"index":0}]}"#,
        )
        .unwrap();
        assert_eq!(order_embeddings(resp.data), vec![vec![0.1], vec![0.2]]);
    }

    #[tokio::test]
    async fn unreachable_service_is_an_error() {
        let search = QdrantSearch::new(QdrantOptions {
            embedding_url: "http://127.0.0.1:9/v1/embeddings".to_string(),
            embedding_api_key: None,
            embedding_model: DEFAULT_MODEL.to_string(),
            qdrant_url: "http://127.0.0.1:9".to_string(),
            qdrant_api_key: None,
            collection: DEFAULT_COLLECTION.to_string(),
            timeout: Duration::from_millis(500),
        })
        .unwrap();
        assert!(search.search("raid controller", 5).await.is_err());
    }
}
