use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Default embedding backend policy (fallback ladder)
const DEFAULT_BACKEND: &str = "auto";
/// Default remote embedding endpoint (OpenAI-compatible)
const DEFAULT_EMBED_ENDPOINT: &str = "https://api.openai.com/v1/embeddings";
const DEFAULT_EMBED_MODEL: &str = "text-embedding-3-small";
/// Default vision judge endpoint (OpenAI-compatible)
const DEFAULT_JUDGE_ENDPOINT: &str = "https://api.openai.com/v1/chat/completions";
const DEFAULT_JUDGE_MODEL: &str = "gpt-4o-mini";
const DEFAULT_API_KEY_ENV: &str = "OPENAI_API_KEY";

/// Default weight of verification confidence in the blended score
const DEFAULT_ALPHA: f32 = 0.7;

/// Embedding backend selection and remote-service settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EmbedderConfig {
    /// Backend policy: "auto", "remote", "offline", "phash" or "none"
    #[serde(default = "default_backend")]
    pub backend: String,

    #[serde(default)]
    pub remote: RemoteEmbedderConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RemoteEmbedderConfig {
    #[serde(default = "default_embed_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_embed_model")]
    pub model: String,

    /// Name of the env var holding the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_embed_timeout_secs")]
    pub timeout_secs: u64,
}

/// Candidate pre-selection for large collections
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SelectorConfig {
    /// "auto", "ann", "hashfilter" or "exact"
    #[serde(default = "default_selector_mode")]
    pub mode: String,

    /// Candidates kept by the hash pre-filter before exact scoring
    #[serde(default = "default_preselect")]
    pub preselect: usize,

    /// Collection size above which auto mode builds an ANN index
    #[serde(default = "default_ann_threshold")]
    pub ann_threshold: usize,

    #[serde(default = "default_hnsw_max_connections")]
    pub hnsw_max_connections: usize,

    #[serde(default = "default_hnsw_ef_construction")]
    pub hnsw_ef_construction: usize,

    #[serde(default = "default_hnsw_ef_search")]
    pub hnsw_ef_search: usize,
}

/// External vision judge settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JudgeConfig {
    #[serde(default = "default_judge_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_judge_model")]
    pub model: String,

    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_judge_timeout_secs")]
    pub timeout_secs: u64,
}

/// Verification behavior
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VerifierConfig {
    #[serde(default)]
    pub judge: JudgeConfig,

    /// Byte budget for the preprocessed image sent to the judge
    #[serde(default = "default_byte_budget")]
    pub byte_budget: usize,

    /// Max judge attempts per candidate (including the first)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base backoff delay in milliseconds
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Parallel verification worker count
    #[serde(default = "default_workers")]
    pub workers: usize,
}

/// Search pipeline knobs
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Candidates kept after embedding ranking
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Top candidates sent to the verifier (<= top_k)
    #[serde(default = "default_verify_top_n")]
    pub verify_top_n: usize,

    /// Candidates verified in "no-embedding" degraded mode
    #[serde(default = "default_verify_cap")]
    pub verify_cap: usize,

    /// Blend weight: alpha * confidence + (1 - alpha) * embedding score
    #[serde(default = "default_alpha")]
    pub alpha: f32,

    /// Append unverified tail candidates at their raw embedding score
    #[serde(default = "default_keep_unverified")]
    pub keep_unverified: bool,

    /// "loose", "normal" or "strict"
    #[serde(default = "default_strictness")]
    pub strictness: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub embedder: EmbedderConfig,
    #[serde(default)]
    pub selector: SelectorConfig,
    #[serde(default)]
    pub verifier: VerifierConfig,
    #[serde(default)]
    pub search: SearchConfig,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: PathBuf,
}

impl Default for EmbedderConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            remote: RemoteEmbedderConfig::default(),
        }
    }
}

impl Default for RemoteEmbedderConfig {
    fn default() -> Self {
        Self {
            endpoint: default_embed_endpoint(),
            model: default_embed_model(),
            api_key_env: default_api_key_env(),
            timeout_secs: default_embed_timeout_secs(),
        }
    }
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            mode: default_selector_mode(),
            preselect: default_preselect(),
            ann_threshold: default_ann_threshold(),
            hnsw_max_connections: default_hnsw_max_connections(),
            hnsw_ef_construction: default_hnsw_ef_construction(),
            hnsw_ef_search: default_hnsw_ef_search(),
        }
    }
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            endpoint: default_judge_endpoint(),
            model: default_judge_model(),
            api_key_env: default_api_key_env(),
            timeout_secs: default_judge_timeout_secs(),
        }
    }
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            judge: JudgeConfig::default(),
            byte_budget: default_byte_budget(),
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            workers: default_workers(),
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            verify_top_n: default_verify_top_n(),
            verify_cap: default_verify_cap(),
            alpha: default_alpha(),
            keep_unverified: default_keep_unverified(),
            strictness: default_strictness(),
        }
    }
}

fn default_backend() -> String {
    DEFAULT_BACKEND.to_string()
}
fn default_embed_endpoint() -> String {
    DEFAULT_EMBED_ENDPOINT.to_string()
}
fn default_embed_model() -> String {
    DEFAULT_EMBED_MODEL.to_string()
}
fn default_api_key_env() -> String {
    DEFAULT_API_KEY_ENV.to_string()
}
fn default_embed_timeout_secs() -> u64 {
    30
}
fn default_selector_mode() -> String {
    "auto".to_string()
}
fn default_preselect() -> usize {
    512
}
fn default_ann_threshold() -> usize {
    20_000
}
fn default_hnsw_max_connections() -> usize {
    16
}
fn default_hnsw_ef_construction() -> usize {
    200
}
fn default_hnsw_ef_search() -> usize {
    64
}
fn default_judge_endpoint() -> String {
    DEFAULT_JUDGE_ENDPOINT.to_string()
}
fn default_judge_model() -> String {
    DEFAULT_JUDGE_MODEL.to_string()
}
fn default_judge_timeout_secs() -> u64 {
    60
}
fn default_byte_budget() -> usize {
    crate::verify::preprocess::DEFAULT_BYTE_BUDGET
}
fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    500
}
fn default_workers() -> usize {
    4
}
fn default_top_k() -> usize {
    50
}
fn default_verify_top_n() -> usize {
    12
}
fn default_verify_cap() -> usize {
    12
}
fn default_alpha() -> f32 {
    DEFAULT_ALPHA
}
fn default_keep_unverified() -> bool {
    true
}
fn default_strictness() -> String {
    "normal".to_string()
}

impl Config {
    fn validate(&mut self) {
        if !(0.0..=1.0).contains(&self.search.alpha) {
            panic!(
                "search.alpha must be between 0.0 and 1.0, got {}",
                self.search.alpha
            );
        }

        if crate::verify::StrictMode::parse(&self.search.strictness).is_none() {
            panic!(
                "search.strictness must be loose, normal or strict, got '{}'",
                self.search.strictness
            );
        }

        if self.verifier.workers == 0 {
            self.verifier.workers = 1;
        }
        if self.verifier.max_attempts == 0 {
            self.verifier.max_attempts = 1;
        }

        if self.search.top_k == 0 {
            panic!("search.top_k must be greater than 0");
        }
        if self.search.verify_top_n > self.search.top_k {
            panic!(
                "search.verify_top_n ({}) must not exceed search.top_k ({})",
                self.search.verify_top_n, self.search.top_k
            );
        }

        if self.selector.preselect == 0 {
            panic!("selector.preselect must be greater than 0");
        }

        if self.embedder.remote.timeout_secs == 0 || self.verifier.judge.timeout_secs == 0 {
            panic!("service timeouts must be greater than 0");
        }
    }

    /// Base directory for config, caches and model downloads.
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn load() -> Self {
        let home = homedir::my_home()
            .ok()
            .flatten()
            .expect("cannot determine home directory");
        Self::load_with(&home.join(".fotoseek"))
    }

    pub fn load_with(base_path: &Path) -> Self {
        std::fs::create_dir_all(base_path).expect("cannot create data directory");
        let config_path = base_path.join("config.yaml");

        // create new if does not exist
        if !config_path.exists() {
            std::fs::write(
                &config_path,
                serde_yml::to_string(&Self::default()).unwrap().as_bytes(),
            )
            .expect("cannot write default config");
        }

        let config_str =
            std::fs::read_to_string(&config_path).expect("config file is not readable");
        let mut config: Self = serde_yml::from_str(&config_str).expect("config is malformed");

        config.base_path = base_path.to_path_buf();
        config.validate();

        // resave in case config version needs an upgrade
        if config_str != serde_yml::to_string(&config).unwrap() {
            config.save();
        }

        config
    }

    pub fn save(&self) {
        let config_str = serde_yml::to_string(&self).unwrap();
        std::fs::write(self.base_path.join("config.yaml"), config_str.as_bytes())
            .expect("cannot write config");
    }
}
