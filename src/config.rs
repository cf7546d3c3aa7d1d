use crate::storage::{self, StorageManager};
use homedir::my_home;
use serde::{Deserialize, Serialize};

/// Default embedding model (MiniLM keeps the index small and fast)
const DEFAULT_EMBEDDING_MODEL: &str = "all-MiniLM-L6-v2";
/// Default model download timeout in seconds
const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 300;

const PIPELINE_MAX_CONCURRENT: u16 = 2;
const PIPELINE_MAX_RETRIES: u8 = 3;

const FACES_AUTO_MATCH_THRESHOLD: f32 = 0.85;
const FACES_SUGGEST_THRESHOLD: f32 = 0.6;
const FACES_CLUSTER_THRESHOLD: f32 = 0.6;

const INDEX_SIZE_THRESHOLD: usize = 1000;
const INDEX_CLUSTERS: usize = 16;
const INDEX_NUM_PROBES: usize = 3;

const FUSION_MIN_SCORE: f32 = 0.1;
const FUSION_MAX_RESULTS: usize = 50;

const STRATEGY_TIMEOUT_SECS: u64 = 5;

const LLM_ENDPOINT: &str = "https://api.openai.com/v1/chat/completions";
const LLM_MODEL: &str = "gpt-4o-mini";
const LLM_API_KEY_ENV: &str = "PIX_LLM_KEY";
const LLM_TIMEOUT_MS: u64 = 1000;

/// Configuration for the embedding pipeline workers
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Number of photos embedded concurrently
    #[serde(default = "default_pipeline_max_concurrent")]
    pub max_concurrent: u16,

    /// Attempts per photo before the task is marked failed
    #[serde(default = "default_pipeline_max_retries")]
    pub max_retries: u8,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent: PIPELINE_MAX_CONCURRENT,
            max_retries: PIPELINE_MAX_RETRIES,
        }
    }
}

fn default_pipeline_max_concurrent() -> u16 {
    PIPELINE_MAX_CONCURRENT
}

fn default_pipeline_max_retries() -> u8 {
    PIPELINE_MAX_RETRIES
}

/// Configuration for face clustering and person matching
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FacesConfig {
    /// Similarity at or above which a face is auto-assigned to a person
    #[serde(default = "default_auto_match_threshold")]
    pub auto_match_threshold: f32,

    /// Similarity at or above which a face is suggested for review
    #[serde(default = "default_suggest_threshold")]
    pub suggest_threshold: f32,

    /// Similarity at or above which two faces join the same cluster
    #[serde(default = "default_cluster_threshold")]
    pub cluster_threshold: f32,
}

impl Default for FacesConfig {
    fn default() -> Self {
        Self {
            auto_match_threshold: FACES_AUTO_MATCH_THRESHOLD,
            suggest_threshold: FACES_SUGGEST_THRESHOLD,
            cluster_threshold: FACES_CLUSTER_THRESHOLD,
        }
    }
}

fn default_auto_match_threshold() -> f32 {
    FACES_AUTO_MATCH_THRESHOLD
}

fn default_suggest_threshold() -> f32 {
    FACES_SUGGEST_THRESHOLD
}

fn default_cluster_threshold() -> f32 {
    FACES_CLUSTER_THRESHOLD
}

/// Configuration for the vector index
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Below this many vectors searches stay exhaustive
    #[serde(default = "default_index_size_threshold")]
    pub size_threshold: usize,

    /// Number of k-means clusters for the partitioned index
    #[serde(default = "default_index_clusters")]
    pub clusters: usize,

    /// Clusters probed per search
    #[serde(default = "default_index_num_probes")]
    pub num_probes: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            size_threshold: INDEX_SIZE_THRESHOLD,
            clusters: INDEX_CLUSTERS,
            num_probes: INDEX_NUM_PROBES,
        }
    }
}

fn default_index_size_threshold() -> usize {
    INDEX_SIZE_THRESHOLD
}

fn default_index_clusters() -> usize {
    INDEX_CLUSTERS
}

fn default_index_num_probes() -> usize {
    INDEX_NUM_PROBES
}

/// Configuration for merging results across search strategies
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FusionConfig {
    /// Merge mode: "weighted" or "rrf"
    #[serde(default = "default_fusion_mode")]
    pub mode: String,

    /// Weight applied to person lookup results
    #[serde(default = "default_people_weight")]
    pub people_weight: f32,

    /// Weight applied to semantic results
    #[serde(default = "default_semantic_weight")]
    pub semantic_weight: f32,

    /// Weight applied to keyword results
    #[serde(default = "default_keyword_weight")]
    pub keyword_weight: f32,

    /// Duplicate handling: "highest-score", "first-wins" or "average"
    #[serde(default = "default_fusion_dedup")]
    pub dedup: String,

    /// Results scoring below this are dropped
    #[serde(default = "default_fusion_min_score")]
    pub min_score: f32,

    /// Cap on merged results returned
    #[serde(default = "default_fusion_max_results")]
    pub max_results: usize,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            mode: "weighted".to_string(),
            people_weight: 1.0,
            semantic_weight: 0.9,
            keyword_weight: 0.7,
            dedup: "highest-score".to_string(),
            min_score: FUSION_MIN_SCORE,
            max_results: FUSION_MAX_RESULTS,
        }
    }
}

fn default_fusion_mode() -> String {
    "weighted".to_string()
}

fn default_people_weight() -> f32 {
    1.0
}

fn default_semantic_weight() -> f32 {
    0.9
}

fn default_keyword_weight() -> f32 {
    0.7
}

fn default_fusion_dedup() -> String {
    "highest-score".to_string()
}

fn default_fusion_min_score() -> f32 {
    FUSION_MIN_SCORE
}

fn default_fusion_max_results() -> usize {
    FUSION_MAX_RESULTS
}

/// Configuration for search orchestration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Per-strategy deadline in seconds
    #[serde(default = "default_strategy_timeout_secs")]
    pub strategy_timeout_secs: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            strategy_timeout_secs: STRATEGY_TIMEOUT_SECS,
        }
    }
}

fn default_strategy_timeout_secs() -> u64 {
    STRATEGY_TIMEOUT_SECS
}

/// Configuration for LLM-backed query understanding
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Enable the LLM parser; rule-based parsing is used when disabled
    #[serde(default)]
    pub enabled: bool,

    /// OpenAI-compatible chat completions endpoint
    #[serde(default = "default_llm_endpoint")]
    pub endpoint: String,

    /// Model name sent with each request
    #[serde(default = "default_llm_model")]
    pub model: String,

    /// Environment variable holding the API key
    #[serde(default = "default_llm_api_key_env")]
    pub api_key_env: String,

    /// Deadline for a parse request in milliseconds
    #[serde(default = "default_llm_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: LLM_ENDPOINT.to_string(),
            model: LLM_MODEL.to_string(),
            api_key_env: LLM_API_KEY_ENV.to_string(),
            timeout_ms: LLM_TIMEOUT_MS,
        }
    }
}

fn default_llm_endpoint() -> String {
    LLM_ENDPOINT.to_string()
}

fn default_llm_model() -> String {
    LLM_MODEL.to_string()
}

fn default_llm_api_key_env() -> String {
    LLM_API_KEY_ENV.to_string()
}

fn default_llm_timeout_ms() -> u64 {
    LLM_TIMEOUT_MS
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct IntentConfig {
    #[serde(default)]
    pub llm: LlmConfig,
}

/// Configuration for embedding generation
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Model name for embeddings (e.g., "all-MiniLM-L6-v2")
    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Image encoder paired with `model`, e.g. "clip-vit-b-32". Both
    /// models must produce the same dimensions. Empty disables image
    /// embedding; captionless photos then fail in the pipeline.
    #[serde(default)]
    pub image_model: String,

    /// Timeout for model download in seconds
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_EMBEDDING_MODEL.to_string(),
            image_model: String::new(),
            download_timeout_secs: DEFAULT_DOWNLOAD_TIMEOUT_SECS,
        }
    }
}

fn default_embedding_model() -> String {
    DEFAULT_EMBEDDING_MODEL.to_string()
}

fn default_download_timeout_secs() -> u64 {
    DEFAULT_DOWNLOAD_TIMEOUT_SECS
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub faces: FacesConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub fusion: FusionConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub intent: IntentConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: String,
}

impl Config {
    fn validate(&mut self) {
        if self.pipeline.max_concurrent == 0 {
            self.pipeline.max_concurrent = 1
        }

        for (name, value) in [
            ("faces.auto_match_threshold", self.faces.auto_match_threshold),
            ("faces.suggest_threshold", self.faces.suggest_threshold),
            ("faces.cluster_threshold", self.faces.cluster_threshold),
            ("fusion.min_score", self.fusion.min_score),
        ] {
            if !(0.0..=1.0).contains(&value) {
                panic!("{name} must be between 0.0 and 1.0, got {value}");
            }
        }

        if self.faces.suggest_threshold > self.faces.auto_match_threshold {
            panic!(
                "faces.suggest_threshold ({}) must not exceed faces.auto_match_threshold ({})",
                self.faces.suggest_threshold, self.faces.auto_match_threshold
            );
        }

        if self.index.clusters == 0 {
            panic!("index.clusters must be greater than 0");
        }
        if self.index.num_probes == 0 {
            panic!("index.num_probes must be greater than 0");
        }

        match self.fusion.mode.as_str() {
            "weighted" | "rrf" => {}
            other => panic!("fusion.mode must be 'weighted' or 'rrf', got '{other}'"),
        }

        match self.fusion.dedup.as_str() {
            "highest-score" | "first-wins" | "average" => {}
            other => panic!(
                "fusion.dedup must be 'highest-score', 'first-wins' or 'average', got '{other}'"
            ),
        }

        for (name, value) in [
            ("fusion.people_weight", self.fusion.people_weight),
            ("fusion.semantic_weight", self.fusion.semantic_weight),
            ("fusion.keyword_weight", self.fusion.keyword_weight),
        ] {
            if !value.is_finite() || value < 0.0 {
                panic!("{name} must be a non-negative number, got {value}");
            }
        }

        if self.fusion.max_results == 0 {
            panic!("fusion.max_results must be greater than 0");
        }

        if self.search.strategy_timeout_secs == 0 {
            panic!("search.strategy_timeout_secs must be greater than 0");
        }

        if self.intent.llm.timeout_ms == 0 {
            panic!("intent.llm.timeout_ms must be greater than 0");
        }

        if self.embedding.download_timeout_secs == 0 {
            panic!("embedding.download_timeout_secs must be greater than 0");
        }
    }

    /// Load from `$PIX_BASE_PATH`, or `~/.local/share/pix` when unset.
    pub fn load() -> Self {
        let base_path = std::env::var("PIX_BASE_PATH").unwrap_or_else(|_| {
            let home = my_home()
                .expect("could not determine home directory")
                .expect("home directory path is empty");
            format!("{}/.local/share/pix", home.to_string_lossy())
        });
        Self::load_with(&base_path)
    }

    pub fn load_with(base_path: &str) -> Self {
        let store =
            storage::BackendLocal::new(base_path).expect("cannot create config directory");

        // create new if does not exist
        if !store.exists("config.yaml") {
            store
                .write(
                    "config.yaml",
                    serde_yml::to_string(&Self::default()).unwrap().as_bytes(),
                )
                .expect("cannot write default config");
        }

        let config_str = String::from_utf8(store.read("config.yaml").expect("cannot read config"))
            .expect("config file is not valid utf8");
        let mut config: Self = serde_yml::from_str(&config_str).expect("config is malformed");

        config.base_path = base_path.to_string();

        config.validate();

        // resave in case config version needs an upgrade
        if config_str != serde_yml::to_string(&config).unwrap() {
            config.save();
        }

        config
    }

    pub fn save(&self) {
        let store =
            storage::BackendLocal::new(&self.base_path).expect("cannot create config directory");

        let config_str = serde_yml::to_string(&self).unwrap();
        store
            .write("config.yaml", config_str.as_bytes())
            .expect("cannot write config");
    }

    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    #[cfg(test)]
    pub fn for_tests(base_path: &str) -> Self {
        let mut config = Self {
            base_path: base_path.to_string(),
            ..Self::default()
        };
        config.validate();
        config
    }
}
