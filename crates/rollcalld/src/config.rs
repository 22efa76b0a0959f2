use std::path::PathBuf;

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// Socket address the HTTP server binds to (default: 0.0.0.0:5000).
    pub bind: String,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Directory where uploaded images are staged while they are analyzed.
    pub upload_dir: PathBuf,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Euclidean distance below which a probe matches a registered face.
    pub match_threshold: f32,
    /// Euclidean distance below which a new registration counts as a known face.
    pub duplicate_threshold: f32,
    /// Embedding length produced by the analyzer and accepted from storage.
    pub embedding_dim: usize,
    /// Request body limit for multipart uploads.
    pub max_upload_bytes: usize,
    /// Load models at startup instead of on the first request.
    pub preload_models: bool,
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        let match_threshold = env_f32(
            "ROLLCALL_MATCH_THRESHOLD",
            rollcall_core::DEFAULT_MATCH_THRESHOLD,
        );

        Self {
            bind: std::env::var("ROLLCALL_BIND").unwrap_or_else(|_| "0.0.0.0:5000".to_string()),
            db_path: std::env::var("ROLLCALL_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_dir.join("rollcall.db")),
            upload_dir: std::env::var("ROLLCALL_UPLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| std::env::temp_dir().join("rollcall-uploads")),
            model_dir: std::env::var("ROLLCALL_MODEL_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| rollcall_core::default_model_dir()),
            match_threshold,
            duplicate_threshold: env_f32("ROLLCALL_DUPLICATE_THRESHOLD", match_threshold),
            embedding_dim: env_usize("ROLLCALL_EMBEDDING_DIM", rollcall_core::DEFAULT_EMBEDDING_DIM),
            max_upload_bytes: env_usize("ROLLCALL_MAX_UPLOAD_BYTES", 10 * 1024 * 1024),
            preload_models: std::env::var("ROLLCALL_PRELOAD_MODELS")
                .map(|v| v != "0")
                .unwrap_or(false),
        }
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
